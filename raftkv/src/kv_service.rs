//! Client-facing gRPC surface: store commands, cluster status and
//! membership administration. Every handler builds a request, enqueues it
//! for the loop thread and awaits the reply channel.

use std::sync::Arc;
use std::time::Duration;

use pb::kv_service_server::KvService;
use pb::{
    AddNodeRequest, CommandRequest, CommandResponse, InfoRequest, InfoResponse,
    MembershipResponse, PeerInfo, RemoveNodeRequest,
};
use tokio::sync::oneshot;

use crate::config;
use crate::metrics;
use crate::raft::request::{RaftReq, RaftResponse, RequestQueue};
use crate::store::CmdOutcome;

#[allow(clippy::module_inception)]
pub mod pb {
    tonic::include_proto!("kv");
}

pub struct KvServiceSVC {
    queue: Arc<RequestQueue>,
}

impl KvServiceSVC {
    pub fn new(queue: Arc<RequestQueue>) -> Self {
        KvServiceSVC { queue }
    }
}

/// Await a loop reply, bounded by the configured request timeout so a
/// request whose log index never commits does not hold the client forever.
async fn await_reply<T>(rx: oneshot::Receiver<T>) -> Result<T, tonic::Status> {
    let timeout = Duration::from_millis(config::instance().lock().unwrap().request_timeout);
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(reply)) => Ok(reply),
        Ok(Err(_)) => Err(tonic::Status::internal("reply channel closed")),
        Err(_) => Err(tonic::Status::deadline_exceeded("request timed out")),
    }
}

fn membership_response(response: RaftResponse) -> MembershipResponse {
    match response {
        RaftResponse::Ok(_) => MembershipResponse {
            ok: true,
            error: String::new(),
            leader_hint: 0,
        },
        RaftResponse::Error(error) => MembershipResponse {
            ok: false,
            error,
            leader_hint: 0,
        },
        RaftResponse::NotLeader { leader_hint } => MembershipResponse {
            ok: false,
            error: "not leader".to_string(),
            leader_hint,
        },
        RaftResponse::Loading => MembershipResponse {
            ok: false,
            error: "node is loading".to_string(),
            leader_hint: 0,
        },
    }
}

fn command_response(response: RaftResponse) -> CommandResponse {
    match response {
        RaftResponse::Ok(bytes) => match CmdOutcome::decode(&bytes) {
            Some(outcome) => CommandResponse {
                ok: outcome.ok,
                value: outcome.value,
                error: outcome.error,
                leader_hint: 0,
            },
            None => CommandResponse {
                ok: false,
                value: Vec::new(),
                error: "undecodable reply".to_string(),
                leader_hint: 0,
            },
        },
        RaftResponse::Error(error) => CommandResponse {
            ok: false,
            value: Vec::new(),
            error,
            leader_hint: 0,
        },
        RaftResponse::NotLeader { leader_hint } => CommandResponse {
            ok: false,
            value: Vec::new(),
            error: "not leader".to_string(),
            leader_hint,
        },
        RaftResponse::Loading => CommandResponse {
            ok: false,
            value: Vec::new(),
            error: "node is loading".to_string(),
            leader_hint: 0,
        },
    }
}

#[tonic::async_trait]
impl KvService for KvServiceSVC {
    async fn command(
        &self,
        request: tonic::Request<CommandRequest>,
    ) -> Result<tonic::Response<CommandResponse>, tonic::Status> {
        let queue = self.queue.clone();
        metrics::record_metrics("command", || async move {
            let (tx, rx) = oneshot::channel();
            queue.submit(RaftReq::StoreCommand {
                args: request.into_inner().args,
                reply: tx,
            });
            let response = await_reply(rx).await?;
            Ok(tonic::Response::new(command_response(response)))
        })
        .await
    }

    async fn info(
        &self,
        _request: tonic::Request<InfoRequest>,
    ) -> Result<tonic::Response<InfoResponse>, tonic::Status> {
        let queue = self.queue.clone();
        metrics::record_metrics("info", || async move {
            let (tx, rx) = oneshot::channel();
            queue.submit(RaftReq::Info { reply: tx });
            let info = await_reply(rx).await?;
            Ok(tonic::Response::new(InfoResponse {
                node_id: info.node_id,
                lifecycle: info.lifecycle,
                role: info.role,
                term: info.term,
                leader_id: info.leader_id,
                last_log_index: info.last_log_index,
                applied_index: info.applied_index,
                num_entries: info.num_entries,
                peers: info
                    .peers
                    .into_iter()
                    .map(|(id, addr, connection_state)| PeerInfo {
                        id,
                        addr,
                        connection_state,
                    })
                    .collect(),
            }))
        })
        .await
    }

    async fn add_node(
        &self,
        request: tonic::Request<AddNodeRequest>,
    ) -> Result<tonic::Response<MembershipResponse>, tonic::Status> {
        let queue = self.queue.clone();
        metrics::record_metrics("add_node", || async move {
            let request = request.into_inner();
            let addr = request
                .addr
                .parse()
                .map_err(|_| tonic::Status::invalid_argument("invalid node address"))?;
            let (tx, rx) = oneshot::channel();
            queue.submit(RaftReq::AddNode {
                id: request.id,
                addr,
                reply: Some(tx),
            });
            let response = await_reply(rx).await?;
            Ok(tonic::Response::new(membership_response(response)))
        })
        .await
    }

    async fn remove_node(
        &self,
        request: tonic::Request<RemoveNodeRequest>,
    ) -> Result<tonic::Response<MembershipResponse>, tonic::Status> {
        let queue = self.queue.clone();
        metrics::record_metrics("remove_node", || async move {
            let (tx, rx) = oneshot::channel();
            queue.submit(RaftReq::RemoveNode {
                id: request.into_inner().id,
                reply: Some(tx),
            });
            let response = await_reply(rx).await?;
            Ok(tonic::Response::new(membership_response(response)))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_leader_carries_hint() {
        let resp = command_response(RaftResponse::NotLeader { leader_hint: 3 });
        assert!(!resp.ok);
        assert_eq!(resp.leader_hint, 3);

        let resp = membership_response(RaftResponse::NotLeader { leader_hint: 3 });
        assert!(!resp.ok);
        assert_eq!(resp.leader_hint, 3);
    }

    #[test]
    fn test_applied_outcome_passes_through() {
        let outcome = CmdOutcome {
            ok: true,
            value: b"v".to_vec(),
            error: String::new(),
        };
        let bytes = bincode::serialize(&outcome).unwrap();
        let resp = command_response(RaftResponse::Ok(bytes));
        assert!(resp.ok);
        assert_eq!(resp.value, b"v");
    }

    #[test]
    fn test_loading_is_an_error_reply() {
        let resp = command_response(RaftResponse::Loading);
        assert!(!resp.ok);
        assert!(resp.error.contains("loading"));
    }

    #[tokio::test]
    async fn test_unserviced_command_times_out() {
        // Nothing drains the queue, so the reply channel never fires and
        // the request timeout bounds the wait.
        let svc = KvServiceSVC::new(Arc::new(RequestQueue::new()));
        let request = tonic::Request::new(CommandRequest {
            args: vec![b"get".to_vec(), b"k".to_vec()],
        });
        let err = svc.command(request).await.expect_err("must time out");
        assert_eq!(err.code(), tonic::Code::DeadlineExceeded);
    }
}
