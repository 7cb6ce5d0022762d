//! Peer connection management.
//!
//! One [`Peer`] per cluster member, each owning a small connection state
//! machine:
//!
//! ```text
//! Disconnected ──> Resolving ──> Connecting ──> Connected
//!       ^              │              │             │
//!       │              v              v             v
//!       └───────── ConnectError <─────┴─────────────┘
//! ```
//!
//! `Disconnected` and `ConnectError` are idle: the reconnect timer picks
//! them up on its next scan. Resolution and connection run as spawned
//! tasks whose completions re-enter the loop as [`PeerEvent`]s, so every
//! state transition happens on the loop thread. A peer removed while an
//! attempt is in flight is only marked `unlinked`; it is physically
//! dropped when the completion event for that attempt is consumed, never
//! from inside the completion itself.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use protobuf::Message as PbMessage;
use raft::eraftpb::Message;
use tokio::sync::mpsc::{self, Receiver, Sender, UnboundedSender};

use crate::error::RaftKvError;

use pb::raft_service_client::RaftServiceClient;
use pb::PostMessageRequest;

#[allow(clippy::module_inception)]
pub mod pb {
    tonic::include_proto!("raft");
}

const SEND_CHANNEL_SIZE: usize = 1000;
const PENDING_BUFFER_SIZE: usize = 64;

/// How long a snapshot push may go without progress before we give up on
/// it and allow a fresh attempt.
pub const LOAD_SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(60);

/// Peer address, `host:port`, host either hostname or literal IP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAddr {
    pub host: String,
    pub port: u16,
}

impl FromStr for NodeAddr {
    type Err = RaftKvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| RaftKvError::InvalidAddress(s.to_string()))?;
        if host.is_empty() {
            return Err(RaftKvError::InvalidAddress(s.to_string()));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| RaftKvError::InvalidAddress(s.to_string()))?;
        Ok(NodeAddr {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    Resolving,
    Connecting,
    Connected,
    ConnectError,
}

impl PeerState {
    /// Idle states are eligible for a fresh connection attempt.
    pub fn is_idle(&self) -> bool {
        matches!(self, PeerState::Disconnected | PeerState::ConnectError)
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerState::Disconnected => "disconnected",
            PeerState::Resolving => "resolving",
            PeerState::Connecting => "connecting",
            PeerState::Connected => "connected",
            PeerState::ConnectError => "connect_error",
        };
        f.write_str(s)
    }
}

/// Completion of an asynchronous resolve/connect step, delivered back to
/// the loop thread. Every event carries the generation of the attempt
/// that produced it; events from a superseded attempt are discarded, so a
/// stream task dying after the peer already reconnected cannot knock the
/// replacement link down.
pub enum PeerEvent {
    Resolved {
        id: u64,
        generation: u64,
    },
    ResolveFailed {
        id: u64,
        generation: u64,
        error: String,
    },
    Connected {
        id: u64,
        generation: u64,
        sender: Sender<PostMessageRequest>,
        invalid: Arc<AtomicBool>,
    },
    ConnectFailed {
        id: u64,
        generation: u64,
        error: String,
    },
    LinkLost {
        id: u64,
        generation: u64,
    },
}

impl PeerEvent {
    fn source(&self) -> (u64, u64) {
        match self {
            PeerEvent::Resolved { id, generation, .. }
            | PeerEvent::ResolveFailed { id, generation, .. }
            | PeerEvent::Connected { id, generation, .. }
            | PeerEvent::ConnectFailed { id, generation, .. }
            | PeerEvent::LinkLost { id, generation, .. } => (*id, *generation),
        }
    }
}

/// Reported by [`PeerManager::handle_event`] whenever a peer completes a
/// transition into `Connected` or `ConnectError`, so the loop can resume
/// whatever protocol exchange was waiting on the link.
#[derive(Debug, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected(u64),
    Failed(u64),
}

pub struct Peer {
    pub id: u64,
    pub addr: NodeAddr,
    state: PeerState,
    terminating: bool,
    unlinked: bool,
    /// An asynchronous resolve/connect is outstanding; destruction must
    /// wait for its completion event.
    inflight: bool,
    /// Bumped for every connection attempt; stamps the events that attempt
    /// emits so stale ones can be told apart from the current link's.
    generation: u64,
    sender: Option<Sender<PostMessageRequest>>,
    invalid: Option<Arc<AtomicBool>>,
    pending: VecDeque<Message>,
    pub load_snapshot_in_progress: bool,
    pub load_snapshot_idx: u64,
    load_snapshot_last_time: Option<Instant>,
}

impl Peer {
    fn new(id: u64, addr: NodeAddr) -> Self {
        Peer {
            id,
            addr,
            state: PeerState::Disconnected,
            terminating: false,
            unlinked: false,
            inflight: false,
            generation: 0,
            sender: None,
            invalid: None,
            pending: VecDeque::new(),
            load_snapshot_in_progress: false,
            load_snapshot_idx: 0,
            load_snapshot_last_time: None,
        }
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    fn buffer(&mut self, msg: Message) {
        if self.pending.len() >= PENDING_BUFFER_SIZE {
            // Raft resends on its own schedule; dropping the oldest is
            // safe.
            self.pending.pop_front();
        }
        self.pending.push_back(msg);
    }
}

pub struct PeerManager {
    peers: HashMap<u64, Peer>,
    events: UnboundedSender<PeerEvent>,
}

impl PeerManager {
    pub fn new(events: UnboundedSender<PeerEvent>) -> Self {
        PeerManager {
            peers: HashMap::new(),
            events,
        }
    }

    pub fn add_peer(&mut self, id: u64, addr: NodeAddr) {
        if let Some(existing) = self.peers.get_mut(&id) {
            // Re-add after unlink loses the race with config application;
            // revive instead of duplicating.
            existing.terminating = false;
            existing.unlinked = false;
            existing.addr = addr;
            return;
        }
        log::info!("node:{}: added peer at {}", id, addr);
        self.peers.insert(id, Peer::new(id, addr));
    }

    /// Remove a peer from the cluster view. If an asynchronous attempt is
    /// outstanding the peer is only marked; the completion event performs
    /// the actual removal.
    pub fn remove_peer(&mut self, id: u64) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.terminating = true;
            if peer.inflight {
                peer.unlinked = true;
                log::debug!("node:{}: unlink deferred, attempt in flight", id);
            } else {
                self.peers.remove(&id);
                log::info!("node:{}: removed", id);
            }
        }
    }

    pub fn contains(&self, id: u64) -> bool {
        self.peers.contains_key(&id)
    }

    pub fn get(&self, id: u64) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Peer> {
        self.peers.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    /// Reconnect-timer duty: start a fresh attempt for every idle peer.
    pub fn reconnect_idle(&mut self) {
        let mut attempts = Vec::new();
        for peer in self.peers.values_mut() {
            if peer.terminating || !peer.state.is_idle() {
                continue;
            }
            peer.state = PeerState::Resolving;
            peer.inflight = true;
            peer.generation += 1;
            attempts.push((peer.id, peer.generation, peer.addr.clone()));
        }
        for (id, generation, addr) in attempts {
            log::debug!("node:{}: resolving {}", id, addr);
            spawn_connect(id, generation, addr, self.events.clone());
        }
    }

    /// Apply a completion event. All transitions happen here, on the loop
    /// thread. Events stamped with a generation other than the peer's
    /// current one come from a superseded attempt and are dropped.
    /// Returns the outcome when the peer finished a connection attempt
    /// (successfully or not).
    pub fn handle_event(&mut self, event: PeerEvent) -> Option<ConnectOutcome> {
        let (id, generation) = event.source();
        match self.peers.get(&id) {
            Some(peer) if peer.generation == generation => {}
            Some(_) => {
                log::debug!("node:{}: dropping event from superseded attempt", id);
                return None;
            }
            None => return None,
        }
        match event {
            PeerEvent::Resolved { .. } => {
                if let Some(peer) = self.peers.get_mut(&id) {
                    if !peer.unlinked && peer.state == PeerState::Resolving {
                        peer.state = PeerState::Connecting;
                    }
                }
                None
            }
            PeerEvent::ResolveFailed { error, .. } => {
                log::warn!("node:{}: resolve failed: {}", id, error);
                self.attempt_finished(id, None, None)
            }
            PeerEvent::Connected {
                sender, invalid, ..
            } => self.attempt_finished(id, Some(sender), Some(invalid)),
            PeerEvent::ConnectFailed { error, .. } => {
                log::warn!("node:{}: connect failed: {}", id, error);
                self.attempt_finished(id, None, None)
            }
            PeerEvent::LinkLost { .. } => {
                if let Some(peer) = self.peers.get_mut(&id) {
                    if peer.state == PeerState::Connected {
                        log::info!("node:{}: link lost", id);
                        peer.state = PeerState::ConnectError;
                        peer.sender = None;
                        peer.invalid = None;
                        return Some(ConnectOutcome::Failed(id));
                    }
                }
                None
            }
        }
    }

    fn attempt_finished(
        &mut self,
        id: u64,
        sender: Option<Sender<PostMessageRequest>>,
        invalid: Option<Arc<AtomicBool>>,
    ) -> Option<ConnectOutcome> {
        let unlinked = {
            let peer = self.peers.get_mut(&id)?;
            peer.inflight = false;
            peer.unlinked
        };

        if unlinked {
            // Logically gone; the attempt we were waiting on has now
            // completed, so physical cleanup is safe.
            self.peers.remove(&id);
            log::info!("node:{}: removed after deferred unlink", id);
            return None;
        }
        let peer = match self.peers.get_mut(&id) {
            Some(p) => p,
            None => return None,
        };

        match sender {
            Some(sender) => {
                peer.state = PeerState::Connected;
                peer.sender = Some(sender);
                peer.invalid = invalid;
                log::info!("node:{}: connected to {}", id, peer.addr);
                Some(ConnectOutcome::Connected(id))
            }
            None => {
                peer.state = PeerState::ConnectError;
                Some(ConnectOutcome::Failed(id))
            }
        }
    }

    /// Send a raft message to the peer it addresses. Not connected or
    /// link down: the message is buffered (bounded) and the link will be
    /// retried by the reconnect timer; raft's own timers handle resends.
    pub fn send(&mut self, msg: Message) {
        let id = msg.to;
        let peer = match self.peers.get_mut(&id) {
            Some(p) => p,
            None => {
                log::debug!("dropping message for unknown peer {}", id);
                return;
            }
        };

        if peer.state == PeerState::Connected {
            if let Some(invalid) = &peer.invalid {
                if invalid.load(Ordering::SeqCst) {
                    peer.state = PeerState::ConnectError;
                    peer.sender = None;
                    peer.invalid = None;
                    peer.buffer(msg);
                    return;
                }
            }
            if let Some(sender) = &peer.sender {
                let request = PostMessageRequest {
                    data: vec![msg.write_to_bytes().unwrap_or_default()],
                };
                if sender.try_send(request).is_err() {
                    log::warn!("node:{}: send queue full, message dropped", id);
                }
                return;
            }
        }
        peer.buffer(msg);
    }

    /// Flush messages buffered while the peer's link was down. Invoked on
    /// every transition into `Connected`.
    pub fn flush_pending(&mut self, id: u64) {
        let peer = match self.peers.get_mut(&id) {
            Some(p) => p,
            None => return,
        };
        let pending: Vec<Message> = peer.pending.drain(..).collect();
        for msg in pending {
            self.send(msg);
        }
    }

    /// Record that a snapshot push to this peer started.
    pub fn snapshot_push_started(&mut self, id: u64, idx: u64) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.load_snapshot_in_progress = true;
            peer.load_snapshot_idx = idx;
            peer.load_snapshot_last_time = Some(Instant::now());
        }
    }

    pub fn snapshot_push_finished(&mut self, id: u64) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.load_snapshot_in_progress = false;
            peer.load_snapshot_last_time = None;
        }
    }

    /// Timeout-based abort for stuck snapshot pushes; frees the peer for
    /// a fresh push attempt. Returns the ids whose pushes were aborted so
    /// the caller can report the failures to consensus.
    pub fn check_load_snapshot_progress(&mut self) -> Vec<u64> {
        let mut aborted = Vec::new();
        for peer in self.peers.values_mut() {
            if peer.load_snapshot_in_progress {
                if let Some(last) = peer.load_snapshot_last_time {
                    if last.elapsed() >= LOAD_SNAPSHOT_TIMEOUT {
                        log::warn!(
                            "node:{}: snapshot push at idx {} stuck, aborting",
                            peer.id,
                            peer.load_snapshot_idx
                        );
                        peer.load_snapshot_in_progress = false;
                        peer.load_snapshot_last_time = None;
                        aborted.push(peer.id);
                    }
                }
            }
        }
        aborted
    }
}

/// Resolve and connect asynchronously, reporting each step back into the
/// loop. The task never touches peer state itself.
fn spawn_connect(id: u64, generation: u64, addr: NodeAddr, events: UnboundedSender<PeerEvent>) {
    tokio::spawn(async move {
        let resolved = tokio::net::lookup_host((addr.host.as_str(), addr.port)).await;
        let sockaddr = match resolved {
            Ok(mut addrs) => match addrs.next() {
                Some(a) => a,
                None => {
                    let _ = events.send(PeerEvent::ResolveFailed {
                        id,
                        generation,
                        error: format!("no addresses for {}", addr),
                    });
                    return;
                }
            },
            Err(e) => {
                let _ = events.send(PeerEvent::ResolveFailed {
                    id,
                    generation,
                    error: e.to_string(),
                });
                return;
            }
        };
        let _ = events.send(PeerEvent::Resolved { id, generation });

        match connect_link(id, generation, sockaddr.to_string(), events.clone()).await {
            Ok((sender, invalid)) => {
                let _ = events.send(PeerEvent::Connected {
                    id,
                    generation,
                    sender,
                    invalid,
                });
            }
            Err(e) => {
                let _ = events.send(PeerEvent::ConnectFailed {
                    id,
                    generation,
                    error: e.to_string(),
                });
            }
        }
    });
}

/// Establish the gRPC channel and the client-streaming sender task. The
/// task owns the receiving half; when the stream errors out it flips the
/// `invalid` flag and reports the lost link.
async fn connect_link(
    id: u64,
    generation: u64,
    sockaddr: String,
    events: UnboundedSender<PeerEvent>,
) -> Result<(Sender<PostMessageRequest>, Arc<AtomicBool>), tonic::transport::Error> {
    let mut client = RaftServiceClient::connect(format!("http://{}", sockaddr)).await?;
    let (sender, receiver) = mpsc::channel(SEND_CHANNEL_SIZE);

    let invalid = Arc::new(AtomicBool::new(false));
    let invalid_clone = invalid.clone();
    tokio::spawn(async move {
        if let Err(e) = stream_messages(&mut client, receiver).await {
            log::error!("node:{}: streaming messages failed: {}", id, e);
            invalid_clone.store(true, Ordering::SeqCst);
            let _ = events.send(PeerEvent::LinkLost { id, generation });
        }
    });

    Ok((sender, invalid))
}

async fn stream_messages(
    client: &mut RaftServiceClient<tonic::transport::Channel>,
    receiver: Receiver<PostMessageRequest>,
) -> Result<(), tonic::Status> {
    let stream = tokio_stream::wrappers::ReceiverStream::new(receiver);
    let _ = client.post_message(stream).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    fn manager() -> (PeerManager, mpsc::UnboundedReceiver<PeerEvent>) {
        let (tx, rx) = unbounded_channel();
        (PeerManager::new(tx), rx)
    }

    fn addr(s: &str) -> NodeAddr {
        s.parse().unwrap()
    }

    fn fake_connected_event(id: u64, generation: u64) -> PeerEvent {
        let (sender, _receiver) = mpsc::channel(1);
        PeerEvent::Connected {
            id,
            generation,
            sender,
            invalid: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Mark an attempt as the reconnect scan would, without spawning I/O.
    /// Returns the attempt's generation.
    fn start_attempt(pm: &mut PeerManager, id: u64) -> u64 {
        let peer = pm.get_mut(id).unwrap();
        peer.state = PeerState::Resolving;
        peer.inflight = true;
        peer.generation += 1;
        peer.generation
    }

    #[test]
    fn test_addr_parse() {
        let a = addr("node1.example.com:4000");
        assert_eq!(a.host, "node1.example.com");
        assert_eq!(a.port, 4000);
        assert_eq!(a.to_string(), "node1.example.com:4000");

        assert!("no-port".parse::<NodeAddr>().is_err());
        assert!(":4000".parse::<NodeAddr>().is_err());
        assert!("host:notaport".parse::<NodeAddr>().is_err());
    }

    #[test]
    fn test_resolve_failure_lands_in_connect_error() {
        let (mut pm, _rx) = manager();
        pm.add_peer(2, addr("peer2:4000"));
        let generation = start_attempt(&mut pm, 2);

        let outcome = pm.handle_event(PeerEvent::ResolveFailed {
            id: 2,
            generation,
            error: "no such host".to_string(),
        });
        assert_eq!(outcome, Some(ConnectOutcome::Failed(2)));
        assert_eq!(pm.get(2).unwrap().state(), PeerState::ConnectError);
        assert!(pm.get(2).unwrap().state().is_idle());
    }

    #[test]
    fn test_full_connect_sequence_fires_callback_once() {
        let (mut pm, _rx) = manager();
        pm.add_peer(2, addr("peer2:4000"));

        // First attempt: resolve fails.
        let generation = start_attempt(&mut pm, 2);
        let mut outcomes = Vec::new();
        if let Some(o) = pm.handle_event(PeerEvent::ResolveFailed {
            id: 2,
            generation,
            error: "timeout".to_string(),
        }) {
            outcomes.push(o);
        }

        // Timer fires, second attempt succeeds.
        assert!(pm.get(2).unwrap().state().is_idle());
        let generation = start_attempt(&mut pm, 2);
        if let Some(o) = pm.handle_event(PeerEvent::Resolved { id: 2, generation }) {
            outcomes.push(o);
        }
        assert_eq!(pm.get(2).unwrap().state(), PeerState::Connecting);
        if let Some(o) = pm.handle_event(fake_connected_event(2, generation)) {
            outcomes.push(o);
        }

        assert_eq!(
            outcomes,
            vec![ConnectOutcome::Failed(2), ConnectOutcome::Connected(2)]
        );
        assert_eq!(pm.get(2).unwrap().state(), PeerState::Connected);
    }

    #[test]
    fn test_link_loss_transitions_to_connect_error() {
        let (mut pm, _rx) = manager();
        pm.add_peer(2, addr("peer2:4000"));
        let generation = start_attempt(&mut pm, 2);
        pm.handle_event(fake_connected_event(2, generation));

        let outcome = pm.handle_event(PeerEvent::LinkLost { id: 2, generation });
        assert_eq!(outcome, Some(ConnectOutcome::Failed(2)));
        assert_eq!(pm.get(2).unwrap().state(), PeerState::ConnectError);
    }

    #[test]
    fn test_stale_link_loss_ignored_after_reconnect() {
        let (mut pm, _rx) = manager();
        pm.add_peer(2, addr("peer2:4000"));

        // First link comes up, then dies.
        let first = start_attempt(&mut pm, 2);
        pm.handle_event(fake_connected_event(2, first));
        pm.handle_event(PeerEvent::LinkLost {
            id: 2,
            generation: first,
        });
        assert_eq!(pm.get(2).unwrap().state(), PeerState::ConnectError);

        // Replacement link comes up.
        let second = start_attempt(&mut pm, 2);
        pm.handle_event(fake_connected_event(2, second));
        assert_eq!(pm.get(2).unwrap().state(), PeerState::Connected);

        // The first link's stream task reports again; the replacement
        // link must stay up.
        let outcome = pm.handle_event(PeerEvent::LinkLost {
            id: 2,
            generation: first,
        });
        assert_eq!(outcome, None);
        assert_eq!(pm.get(2).unwrap().state(), PeerState::Connected);
    }

    #[test]
    fn test_unlink_deferred_until_attempt_completes() {
        let (mut pm, _rx) = manager();
        pm.add_peer(2, addr("peer2:4000"));
        let generation = start_attempt(&mut pm, 2);

        pm.remove_peer(2);
        // Still present: the in-flight attempt holds it alive.
        assert!(pm.contains(2));

        let outcome = pm.handle_event(fake_connected_event(2, generation));
        // No callback for an unlinked peer, and it is gone now.
        assert_eq!(outcome, None);
        assert!(!pm.contains(2));
    }

    #[test]
    fn test_unlink_without_inflight_removes_immediately() {
        let (mut pm, _rx) = manager();
        pm.add_peer(2, addr("peer2:4000"));
        pm.remove_peer(2);
        assert!(!pm.contains(2));
    }

    #[test]
    fn test_terminating_peer_skipped_by_reconnect_scan() {
        let (mut pm, _rx) = manager();
        pm.add_peer(2, addr("peer2:4000"));
        start_attempt(&mut pm, 2);
        pm.remove_peer(2);

        pm.reconnect_idle();
        // Unlinked peer must not be restarted.
        assert_eq!(pm.get(2).unwrap().state(), PeerState::Resolving);
    }

    #[test]
    fn test_messages_buffered_until_connected() {
        let (mut pm, _rx) = manager();
        pm.add_peer(2, addr("peer2:4000"));

        let mut msg = Message::default();
        msg.to = 2;
        pm.send(msg);
        assert_eq!(pm.get(2).unwrap().pending.len(), 1);

        let generation = start_attempt(&mut pm, 2);
        let (sender, mut receiver) = mpsc::channel(4);
        pm.handle_event(PeerEvent::Connected {
            id: 2,
            generation,
            sender,
            invalid: Arc::new(AtomicBool::new(false)),
        });
        pm.flush_pending(2);

        assert_eq!(pm.get(2).unwrap().pending.len(), 0);
        assert!(receiver.try_recv().is_ok());
    }

    #[test]
    fn test_snapshot_push_timeout() {
        let (mut pm, _rx) = manager();
        pm.add_peer(2, addr("peer2:4000"));
        pm.snapshot_push_started(2, 10);
        assert!(pm.get(2).unwrap().load_snapshot_in_progress);

        // Fresh push: not timed out yet.
        assert!(pm.check_load_snapshot_progress().is_empty());
        assert!(pm.get(2).unwrap().load_snapshot_in_progress);

        // Backdate the attempt past the timeout.
        pm.get_mut(2).unwrap().load_snapshot_last_time =
            Some(Instant::now() - LOAD_SNAPSHOT_TIMEOUT * 2);
        assert_eq!(pm.check_load_snapshot_progress(), vec![2]);
        assert!(!pm.get(2).unwrap().load_snapshot_in_progress);
    }
}
