//! Cross-thread request handoff.
//!
//! Client-facing tasks never touch consensus state directly; they build a
//! [`RaftReq`], push it onto the [`RequestQueue`] and wait on the reply
//! channel. The loop thread is the queue's only consumer and dispatches
//! requests strictly in submission order.

use std::collections::VecDeque;
use std::sync::Mutex;

use raft::eraftpb::Message;
use tokio::sync::oneshot;
use tokio::sync::Notify;

use crate::raft::peer::NodeAddr;

/// Reply to a membership or store-command request.
#[derive(Debug)]
pub enum RaftResponse {
    Ok(Vec<u8>),
    Error(String),
    NotLeader { leader_hint: u64 },
    Loading,
}

/// Cluster status returned by an `Info` request.
#[derive(Debug, Clone, Default)]
pub struct InfoResponse {
    pub node_id: u64,
    pub lifecycle: String,
    pub role: String,
    pub term: u64,
    pub leader_id: u64,
    pub last_log_index: u64,
    pub applied_index: u64,
    pub num_entries: u64,
    pub peers: Vec<(u64, String, String)>,
}

/// A unit of work handed from a client-facing thread to the loop thread.
///
/// Each variant carries only its own payload. Ownership transfers at the
/// enqueue boundary; after `submit` returns, only the loop thread may
/// touch the request.
pub enum RaftReq {
    AddNode {
        id: u64,
        addr: NodeAddr,
        reply: Option<oneshot::Sender<RaftResponse>>,
    },
    RemoveNode {
        id: u64,
        reply: Option<oneshot::Sender<RaftResponse>>,
    },
    /// An append-entries message (or its response) from a peer.
    AppendEntries { from: u64, msg: Message },
    /// A vote request (or its response) from a peer.
    RequestVote { from: u64, msg: Message },
    /// An opaque store command to replicate and apply.
    StoreCommand {
        args: Vec<Vec<u8>>,
        reply: oneshot::Sender<RaftResponse>,
    },
    Info {
        reply: oneshot::Sender<InfoResponse>,
    },
    /// A full snapshot image pushed by the leader.
    LoadSnapshot {
        term: u64,
        idx: u64,
        data: Vec<u8>,
        reply: Option<oneshot::Sender<RaftResponse>>,
    },
    /// Explicit compaction trigger.
    Compact {
        reply: Option<oneshot::Sender<RaftResponse>>,
    },
}

impl RaftReq {
    pub fn type_name(&self) -> &'static str {
        match self {
            RaftReq::AddNode { .. } => "add_node",
            RaftReq::RemoveNode { .. } => "remove_node",
            RaftReq::AppendEntries { .. } => "append_entries",
            RaftReq::RequestVote { .. } => "request_vote",
            RaftReq::StoreCommand { .. } => "store_command",
            RaftReq::Info { .. } => "info",
            RaftReq::LoadSnapshot { .. } => "load_snapshot",
            RaftReq::Compact { .. } => "compact",
        }
    }
}

/// FIFO handoff queue between client-facing threads and the loop thread.
///
/// `submit` is O(1) and never blocks on loop availability; the mutex is
/// held only for the push. The paired [`Notify`] wakes the loop without
/// requiring it to poll.
pub struct RequestQueue {
    queue: Mutex<VecDeque<RaftReq>>,
    notify: Notify,
}

impl RequestQueue {
    pub fn new() -> Self {
        RequestQueue {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Append a request and signal the loop. Callable from any thread.
    pub fn submit(&self, req: RaftReq) {
        self.queue.lock().unwrap().push_back(req);
        self.notify.notify_one();
    }

    /// Take everything currently queued, in submission order. Loop thread
    /// only.
    pub fn drain(&self) -> VecDeque<RaftReq> {
        let mut queue = self.queue.lock().unwrap();
        std::mem::take(&mut *queue)
    }

    /// Wait until at least one request may be pending.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        RequestQueue::new()
    }
}
