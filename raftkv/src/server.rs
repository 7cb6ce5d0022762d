use crate::kv_service::pb::kv_service_server::KvServiceServer;
use crate::kv_service::KvServiceSVC;
use crate::metrics;
use crate::raft_service::pb::raft_service_server::RaftServiceServer;
use crate::raft_service::RaftServiceSVC;
use crate::store::KvStore;
use crate::{config, raft};

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response};
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;

use crate::raft::request::RequestQueue;
use once_cell::sync::OnceCell;
use tokio::sync::Mutex;

static INSTANCE: OnceCell<Mutex<Server>> = OnceCell::new();
pub fn instance() -> &'static Mutex<Server> {
    INSTANCE.get_or_init(|| Mutex::new(Server::builder()))
}

pub struct Server {
    queue: Arc<RequestQueue>,
}

impl Server {
    fn builder() -> Self {
        let queue = Arc::new(RequestQueue::new());
        raft::node::start_raft(queue.clone(), KvStore::new());
        Server { queue }
    }

    pub async fn start(&mut self) {
        self.start_grpc_server().await;
        self.start_metrics_server().await;
    }

    pub fn stop(&mut self) {
        log::info!("server stop");
    }

    async fn start_grpc_server(&mut self) {
        let addr = config::instance()
            .lock()
            .unwrap()
            .addr
            .as_str()
            .parse()
            .unwrap();
        let mut server = tonic::transport::Server::builder();
        let raft_service = RaftServiceSVC::new(self.queue.clone());
        let kv_service = KvServiceSVC::new(self.queue.clone());
        let grpc_server = server
            .add_service(RaftServiceServer::new(raft_service))
            .add_service(KvServiceServer::new(kv_service))
            .serve(addr);
        tokio::spawn(async move {
            tokio::pin!(grpc_server);
            grpc_server.await.unwrap();
        });
        log::info!("grpc server started on {}", addr);
    }

    async fn start_metrics_server(&mut self) {
        let addr = config::instance()
            .lock()
            .unwrap()
            .metrics_addr
            .as_str()
            .parse()
            .unwrap();
        let make_svc = make_service_fn(move |_| {
            let registry = metrics::REGISTRY_INSTANCE.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |_: Request<Body>| {
                    let registry = registry.clone();
                    async move {
                        let encoder = TextEncoder::new();
                        let metric_families = registry.gather();
                        let mut buffer = Vec::new();
                        encoder.encode(&metric_families, &mut buffer).unwrap();
                        Ok::<_, hyper::Error>(Response::new(Body::from(buffer)))
                    }
                }))
            }
        });
        metrics::init_registry();
        let server = hyper::Server::bind(&addr).serve(make_svc);
        tokio::spawn(async move {
            tokio::pin!(server);
            server.await.unwrap()
        });
        log::info!("metrics server started on {}", addr);
    }
}
