//! The raft loop thread.
//!
//! Exactly one of these runs per process. It owns the consensus library
//! handle, the durable storage, all peer connection state and the
//! snapshot progress flags; client-facing threads reach it only through
//! the [`RequestQueue`]. Handlers run to completion without preemption,
//! so nothing here needs locking.

#![allow(clippy::field_reassign_with_default)]

use std::collections::VecDeque;
use std::sync::mpsc::Receiver as StdReceiver;
use std::sync::Arc;
use std::time::Duration;

use protobuf::Message as PbMessage;
use raft::{prelude::*, SnapshotStatus, StateRole};
use slog::{o, Drain};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::time::{self, Instant};

use crate::config::RuntimeConfig;
use crate::error::{RaftKvError, Result};
use crate::metrics;
use crate::raft::peer::{ConnectOutcome, NodeAddr, PeerEvent, PeerManager};
use crate::raft::request::{InfoResponse, RaftReq, RaftResponse, RequestQueue};
use crate::raft::snapshot::{self, SnapshotCfgEntry, SnapshotImage, SnapshotInfo, SnapshotResult};
use crate::raft::storage::LogStorage;
use crate::raft::StateMachine;

const LOGGER_CHANNEL_SIZE: usize = 4096;
const LOOP_IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Client for joining an existing cluster.
pub mod kvpb {
    tonic::include_proto!("kv");
}

/// Process-level replication lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeLifecycle {
    /// Recovering local state; requests are rejected.
    Loading,
    /// Asking an existing cluster to add us.
    Joining,
    /// Serving.
    Up,
}

impl NodeLifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeLifecycle::Loading => "loading",
            NodeLifecycle::Joining => "joining",
            NodeLifecycle::Up => "up",
        }
    }
}

/// A proposal waiting for its entry to be applied.
struct PendingProposal {
    index: u64,
    term: u64,
    reply: oneshot::Sender<RaftResponse>,
}

fn raft_config(cfg: &RuntimeConfig, applied: u64) -> Config {
    let election_tick = ((cfg.election_timeout / cfg.raft_interval).max(3)) as usize;
    Config {
        id: cfg.id,
        election_tick,
        heartbeat_tick: (election_tick / 3).max(1),
        applied,
        ..Default::default()
    }
}

fn new_raft_logger(id: u64) -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain)
        .chan_size(LOGGER_CHANNEL_SIZE)
        .overflow_strategy(slog_async::OverflowStrategy::Block)
        .build()
        .fuse();
    slog::Logger::root(drain, o!("tag" => format!("peer_{}", id)))
}

fn random_dbid() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..crate::raft::log::DBID_LEN)
        .map(|_| std::char::from_digit(rng.gen_range(0..16), 16).unwrap_or('0'))
        .collect()
}

pub struct RaftNode<S: StateMachine> {
    raw: RawNode<LogStorage>,
    lifecycle: NodeLifecycle,
    queue: Arc<RequestQueue>,
    peers: PeerManager,
    peer_events: UnboundedReceiver<PeerEvent>,
    sm: S,
    cfg: RuntimeConfig,
    pending: VecDeque<PendingProposal>,
    snapshot_info: SnapshotInfo,
    snapshot_in_progress: bool,
    loading_snapshot: bool,
    snapshot_rewrite_last_idx: u64,
    snapshot_rewrite_last_term: u64,
    snapshot_rx: Option<StdReceiver<SnapshotResult>>,
    compact_reply: Option<oneshot::Sender<RaftResponse>>,
    join_addrs: Vec<NodeAddr>,
    join_cursor: usize,
    join_inflight: bool,
    join_events: UnboundedReceiver<bool>,
    join_events_tx: UnboundedSender<bool>,
}

impl<S: StateMachine + Send + 'static> RaftNode<S> {
    /// Recover local state and build the consensus handle. The node stays
    /// in `Loading` until [`run`] finishes recovery bookkeeping.
    ///
    /// [`run`]: RaftNode::run
    pub fn new(cfg: RuntimeConfig, queue: Arc<RequestQueue>, mut sm: S) -> Result<Self> {
        let logger = new_raft_logger(cfg.id);
        let snapshot_path = cfg.snapshot_filename();

        // The snapshot artifact, when present, is the authority on
        // cluster identity and membership as of its boundary.
        let mut snapshot_info = SnapshotInfo::default();
        if snapshot::snapshot_exists(&snapshot_path) {
            let image = snapshot::load_image(&snapshot_path)?;
            sm.on_snapshot(image.last_applied_idx, image.last_applied_term, &image.data);
            snapshot_info = image.info();
            log::info!(
                "restored snapshot at term {} idx {}",
                snapshot_info.last_applied_term,
                snapshot_info.last_applied_idx
            );
        }

        let log_exists = std::path::Path::new(&cfg.raftlog).exists();
        let mut conf_state = ConfState::default();
        if snapshot_info.loaded {
            for entry in &snapshot_info.cfg {
                if entry.voting {
                    conf_state.voters.push(entry.id);
                } else {
                    conf_state.learners.push(entry.id);
                }
            }
        } else if !cfg.node_list.is_empty() {
            conf_state.voters = cfg.node_list.iter().map(|n| n.id).collect();
        } else {
            conf_state.voters = vec![cfg.id];
        }

        let mut storage = if cfg.persist && log_exists {
            let expected = if snapshot_info.loaded {
                Some(snapshot_info.dbid.as_str())
            } else {
                None
            };
            LogStorage::open(&cfg.raftlog, expected, conf_state)?
        } else {
            let dbid = if snapshot_info.loaded {
                snapshot_info.dbid.clone()
            } else {
                random_dbid()
            };
            LogStorage::create(&cfg.raftlog, &dbid, cfg.id, cfg.bootstrap, cfg.persist)?
        };

        if snapshot_info.dbid.is_empty() {
            snapshot_info.dbid = storage.dbid().to_string();
        }
        if snapshot::snapshot_exists(&snapshot_path) {
            storage.set_snapshot_path(snapshot_path);
        }
        // A crash between artifact install and log compaction can leave
        // the artifact ahead of the recovered commit index; never tell
        // consensus we applied past what it knows is committed.
        let commit = storage.hard_state().commit;
        storage.set_applied(snapshot_info.last_applied_idx.min(commit));
        let applied = storage.applied();

        let (events_tx, peer_events) = mpsc::unbounded_channel();
        let mut peers = PeerManager::new(events_tx);
        if snapshot_info.loaded {
            for entry in &snapshot_info.cfg {
                if entry.id != cfg.id {
                    if let Ok(addr) = entry.addr.parse() {
                        peers.add_peer(entry.id, addr);
                    }
                }
            }
        } else {
            for node in &cfg.node_list {
                if node.id != cfg.id {
                    peers.add_peer(node.id, node.addr.parse()?);
                }
            }
        }

        let raw = RawNode::new(&raft_config(&cfg, applied), storage, &logger)?;

        let join_addrs: Vec<NodeAddr> = cfg
            .join
            .iter()
            .map(|s| s.parse())
            .collect::<Result<Vec<_>>>()?;

        let (join_events_tx, join_events) = mpsc::unbounded_channel();
        Ok(RaftNode {
            raw,
            lifecycle: NodeLifecycle::Loading,
            queue,
            peers,
            peer_events,
            sm,
            cfg,
            pending: VecDeque::new(),
            snapshot_info,
            snapshot_in_progress: false,
            loading_snapshot: false,
            snapshot_rewrite_last_idx: 0,
            snapshot_rewrite_last_term: 0,
            snapshot_rx: None,
            compact_reply: None,
            join_addrs,
            join_cursor: 0,
            join_inflight: false,
            join_events,
            join_events_tx,
        })
    }

    /// Main event loop. Never returns.
    pub async fn run(&mut self) {
        self.lifecycle = if !self.join_addrs.is_empty() && !self.cfg.bootstrap {
            NodeLifecycle::Joining
        } else {
            NodeLifecycle::Up
        };
        log::info!(
            "raft loop up, node {} state {}",
            self.cfg.id,
            self.lifecycle.as_str()
        );

        let tick_interval = Duration::from_millis(self.cfg.raft_interval);
        let reconnect_interval = Duration::from_millis(self.cfg.reconnect_interval);
        let mut last_tick = Instant::now();
        let mut last_reconnect = Instant::now();

        loop {
            tokio::select! {
                _ = self.queue.wait() => {
                    self.dispatch_pending();
                }
                Some(event) = self.peer_events.recv() => {
                    self.handle_peer_event(event);
                    while let Ok(event) = self.peer_events.try_recv() {
                        self.handle_peer_event(event);
                    }
                }
                Some(joined) = self.join_events.recv() => {
                    self.handle_join_outcome(joined);
                }
                _ = time::sleep(LOOP_IDLE_SLEEP) => {}
            }

            if last_tick.elapsed() >= tick_interval {
                self.raw.tick();
                last_tick = Instant::now();
            }

            if last_reconnect.elapsed() >= reconnect_interval {
                self.peers.reconnect_idle();
                for id in self.peers.check_load_snapshot_progress() {
                    self.raw.report_snapshot(id, SnapshotStatus::Failure);
                }
                self.maybe_join();
                last_reconnect = Instant::now();
            }

            self.poll_snapshot_status();
            self.maybe_trigger_compaction();
            self.on_ready();
        }
    }

    /// Drain the queue and dispatch every request in submission order.
    pub fn dispatch_pending(&mut self) {
        let requests = self.queue.drain();
        for req in requests {
            metrics::REQ_COUNTER_VEC
                .with_label_values(&[req.type_name()])
                .inc();
            self.dispatch(req);
        }
    }

    fn dispatch(&mut self, req: RaftReq) {
        match req {
            RaftReq::AddNode { id, addr, reply } => {
                self.handle_cfg_change(ConfChangeType::AddNode, id, Some(addr), reply);
            }
            RaftReq::RemoveNode { id, reply } => {
                self.handle_cfg_change(ConfChangeType::RemoveNode, id, None, reply);
            }
            RaftReq::AppendEntries { from, msg } => {
                if self.lifecycle == NodeLifecycle::Loading {
                    log::debug!("dropping append-entries from {} while loading", from);
                    return;
                }
                if self.lifecycle == NodeLifecycle::Joining {
                    // The cluster knows us now.
                    log::info!("joined cluster (append-entries from {})", from);
                    self.lifecycle = NodeLifecycle::Up;
                }
                self.note_snapshot_push_progress(&msg);
                if let Err(e) = self.raw.step(msg) {
                    log::warn!("append-entries from {} rejected: {}", from, e);
                }
            }
            RaftReq::RequestVote { from, msg } => {
                if self.lifecycle == NodeLifecycle::Loading {
                    log::debug!("dropping vote message from {} while loading", from);
                    return;
                }
                if let Err(e) = self.raw.step(msg) {
                    log::warn!("vote message from {} rejected: {}", from, e);
                }
            }
            RaftReq::StoreCommand { args, reply } => {
                self.handle_store_command(args, reply);
            }
            RaftReq::Info { reply } => {
                let _ = reply.send(self.build_info());
            }
            RaftReq::LoadSnapshot {
                term,
                idx,
                data,
                reply,
            } => {
                let result = self.handle_load_snapshot(term, idx, data);
                if let Some(reply) = reply {
                    let _ = reply.send(match result {
                        Ok(()) => RaftResponse::Ok(Vec::new()),
                        Err(e) => RaftResponse::Error(e.to_string()),
                    });
                }
            }
            RaftReq::Compact { reply } => {
                self.handle_compact(reply);
            }
        }
    }

    fn handle_cfg_change(
        &mut self,
        kind: ConfChangeType,
        id: u64,
        addr: Option<NodeAddr>,
        reply: Option<oneshot::Sender<RaftResponse>>,
    ) {
        if self.lifecycle != NodeLifecycle::Up {
            if let Some(reply) = reply {
                let _ = reply.send(RaftResponse::Loading);
            }
            return;
        }
        if self.raw.raft.state != StateRole::Leader {
            if let Some(reply) = reply {
                let _ = reply.send(RaftResponse::NotLeader {
                    leader_hint: self.raw.raft.leader_id,
                });
            }
            return;
        }

        let mut cc = ConfChange::default();
        cc.node_id = id;
        cc.set_change_type(kind);
        if let Some(addr) = addr {
            cc.context = addr.to_string().into_bytes().into();
        }

        let last_index = self.raw.raft.raft_log.last_index();
        if let Err(e) = self.raw.propose_conf_change(vec![], cc) {
            if let Some(reply) = reply {
                let _ = reply.send(RaftResponse::Error(e.to_string()));
            }
            return;
        }
        if let Some(reply) = reply {
            self.pending.push_back(PendingProposal {
                index: last_index + 1,
                term: self.raw.raft.term,
                reply,
            });
        }
    }

    fn handle_store_command(&mut self, args: Vec<Vec<u8>>, reply: oneshot::Sender<RaftResponse>) {
        if self.lifecycle != NodeLifecycle::Up || self.loading_snapshot {
            let _ = reply.send(RaftResponse::Loading);
            return;
        }
        if self.raw.raft.state != StateRole::Leader {
            let _ = reply.send(RaftResponse::NotLeader {
                leader_hint: self.raw.raft.leader_id,
            });
            return;
        }

        let data = match bincode::serialize(&args) {
            Ok(data) => data,
            Err(e) => {
                let _ = reply.send(RaftResponse::Error(format!("encode: {}", e)));
                return;
            }
        };

        let last_index = self.raw.raft.raft_log.last_index();
        if let Err(e) = self.raw.propose(vec![], data) {
            let _ = reply.send(RaftResponse::Error(e.to_string()));
            return;
        }
        if self.raw.raft.raft_log.last_index() == last_index {
            let _ = reply.send(RaftResponse::Error("proposal dropped".to_string()));
            return;
        }
        self.pending.push_back(PendingProposal {
            index: last_index + 1,
            term: self.raw.raft.term,
            reply,
        });
    }

    fn handle_compact(&mut self, reply: Option<oneshot::Sender<RaftResponse>>) {
        match self.initiate_snapshot() {
            Ok(()) => {
                self.compact_reply = reply;
            }
            Err(e) => {
                if let Some(reply) = reply {
                    let _ = reply.send(RaftResponse::Error(e.to_string()));
                }
            }
        }
    }

    fn handle_peer_event(&mut self, event: PeerEvent) {
        match self.peers.handle_event(event) {
            Some(ConnectOutcome::Connected(id)) => {
                // Resume whatever exchange was waiting on this link.
                self.peers.flush_pending(id);
            }
            Some(ConnectOutcome::Failed(_)) | None => {}
        }
    }

    fn handle_join_outcome(&mut self, joined: bool) {
        self.join_inflight = false;
        if joined && self.lifecycle == NodeLifecycle::Joining {
            log::info!("join request accepted, waiting for cluster traffic");
            // Lifecycle flips to Up on the first append-entries.
        }
    }

    /// Try the next join address. Fixed-interval retry, driven by the
    /// reconnect timer.
    fn maybe_join(&mut self) {
        if self.lifecycle != NodeLifecycle::Joining || self.join_inflight {
            return;
        }
        if self.join_addrs.is_empty() {
            return;
        }
        let addr = self.join_addrs[self.join_cursor % self.join_addrs.len()].clone();
        self.join_cursor += 1;
        self.join_inflight = true;

        let id = self.cfg.id;
        let my_addr = self.cfg.addr.clone();
        let tx = self.join_events_tx.clone();
        tokio::spawn(async move {
            let joined = match kvpb::kv_service_client::KvServiceClient::connect(format!(
                "http://{}",
                addr
            ))
            .await
            {
                Ok(mut client) => client
                    .add_node(kvpb::AddNodeRequest { id, addr: my_addr })
                    .await
                    .map(|resp| resp.into_inner().ok)
                    .unwrap_or(false),
                Err(e) => {
                    log::warn!("join via {} failed: {}", addr, e);
                    false
                }
            };
            let _ = tx.send(joined);
        });
    }

    fn build_info(&mut self) -> InfoResponse {
        let store = &self.raw.raft.raft_log.store;
        InfoResponse {
            node_id: self.cfg.id,
            lifecycle: self.lifecycle.as_str().to_string(),
            role: format!("{:?}", self.raw.raft.state),
            term: self.raw.raft.term,
            leader_id: self.raw.raft.leader_id,
            last_log_index: self.raw.raft.raft_log.last_index(),
            applied_index: store.applied(),
            num_entries: store.num_entries(),
            peers: self
                .peers
                .iter()
                .map(|p| (p.id, p.addr.to_string(), p.state().to_string()))
                .collect(),
        }
    }

    /// Fork compaction off the critical path.
    fn initiate_snapshot(&mut self) -> Result<()> {
        if self.snapshot_in_progress {
            return Err(RaftKvError::SnapshotInProgress);
        }
        let store = &self.raw.raft.raft_log.store;
        let applied = store.applied();
        if applied <= self.snapshot_info.last_applied_idx {
            return Err(RaftKvError::Other(
                "nothing applied since last snapshot".to_string(),
            ));
        }
        let term = self
            .raw
            .raft
            .raft_log
            .term(applied)
            .unwrap_or(self.snapshot_info.last_applied_term);

        let image = SnapshotImage {
            dbid: self.snapshot_info.dbid.clone(),
            last_applied_term: term,
            last_applied_idx: applied,
            cfg: self.membership_entries(),
            data: self.sm.snapshot(),
        };

        let store = &self.raw.raft.raft_log.store;
        self.snapshot_rx = Some(snapshot::initiate_snapshot(
            image,
            self.cfg.snapshot_filename(),
            self.cfg.raftlog.clone(),
            store.num_entries(),
            Duration::from_millis(self.cfg.compact_delay),
        ));
        self.snapshot_in_progress = true;
        self.snapshot_rewrite_last_idx = applied;
        self.snapshot_rewrite_last_term = term;
        log::info!("snapshot initiated at term {} idx {}", term, applied);
        Ok(())
    }

    /// Once-per-iteration non-blocking completion check.
    fn poll_snapshot_status(&mut self) {
        if !self.snapshot_in_progress {
            return;
        }
        let result = match &self.snapshot_rx {
            Some(rx) => snapshot::poll_snapshot_status(rx),
            None => None,
        };
        let Some(result) = result else {
            return;
        };

        if !snapshot::validate_result(&result) {
            log::error!("snapshot result failed magic validation, discarding");
            self.cancel_snapshot(&result);
            return;
        }
        if !result.success {
            log::warn!("snapshot attempt failed: {}", result.err);
            self.cancel_snapshot(&result);
            return;
        }
        if let Err(e) = self.finalize_snapshot(&result) {
            log::error!("snapshot finalize failed: {}", e);
            self.cancel_snapshot(&result);
        }
    }

    /// Swap in the new artifact and trim the log prefix it replaces.
    fn finalize_snapshot(&mut self, result: &SnapshotResult) -> Result<()> {
        let final_path = self.cfg.snapshot_filename();
        snapshot::install_artifact(result, &final_path)?;

        let store = &mut self.raw.raft.raft_log.store;
        store.set_snapshot_path(final_path);
        store.compact(self.snapshot_rewrite_last_term, self.snapshot_rewrite_last_idx)?;

        self.snapshot_info.last_applied_term = self.snapshot_rewrite_last_term;
        self.snapshot_info.last_applied_idx = self.snapshot_rewrite_last_idx;
        self.snapshot_info.cfg = self.membership_entries();
        self.snapshot_info.loaded = true;
        self.clear_snapshot_progress();
        metrics::SNAPSHOT_COUNTER_VEC
            .with_label_values(&["finalize"])
            .inc();
        if let Some(reply) = self.compact_reply.take() {
            let _ = reply.send(RaftResponse::Ok(Vec::new()));
        }
        log::info!(
            "snapshot finalized at idx {}, {} entries remain",
            self.snapshot_rewrite_last_idx,
            self.raw.raft.raft_log.store.num_entries()
        );
        Ok(())
    }

    /// Failed attempt: discard partial output, keep the log untouched.
    fn cancel_snapshot(&mut self, result: &SnapshotResult) {
        snapshot::discard_artifacts(result);
        self.clear_snapshot_progress();
        metrics::SNAPSHOT_COUNTER_VEC
            .with_label_values(&["cancel"])
            .inc();
        if let Some(reply) = self.compact_reply.take() {
            let _ = reply.send(RaftResponse::Error("snapshot failed".to_string()));
        }
    }

    fn clear_snapshot_progress(&mut self) {
        self.snapshot_in_progress = false;
        self.snapshot_rx = None;
    }

    fn maybe_trigger_compaction(&mut self) {
        if self.snapshot_in_progress || self.lifecycle != NodeLifecycle::Up {
            return;
        }
        if self.raw.raft.raft_log.store.num_entries() > self.cfg.max_log_entries {
            if let Err(e) = self.initiate_snapshot() {
                log::debug!("auto compaction skipped: {}", e);
            }
        }
    }

    /// Apply a snapshot pushed by the leader. Routed through the
    /// consensus library as a snapshot message so its log-matching
    /// bookkeeping stays consistent; the install happens on the next
    /// `Ready`.
    fn handle_load_snapshot(&mut self, term: u64, idx: u64, data: Vec<u8>) -> Result<()> {
        if idx <= self.raw.raft.raft_log.store.applied() {
            return Err(RaftKvError::StaleSnapshot {
                offered: idx,
                local: self.raw.raft.raft_log.store.applied(),
            });
        }
        let image = snapshot::load_image_bytes(&data)?;
        if image.last_applied_idx != idx || image.last_applied_term != term {
            return Err(RaftKvError::Corrupt(
                "snapshot metadata does not match its image".to_string(),
            ));
        }

        let mut msg = Message::default();
        msg.set_msg_type(MessageType::MsgSnapshot);
        msg.to = self.cfg.id;
        msg.from = self.raw.raft.leader_id;
        msg.term = self.raw.raft.term.max(term);
        let snap = msg.mut_snapshot();
        snap.mut_metadata().index = idx;
        snap.mut_metadata().term = term;
        for entry in &image.cfg {
            if entry.voting {
                snap.mut_metadata().mut_conf_state().voters.push(entry.id);
            } else {
                snap.mut_metadata().mut_conf_state().learners.push(entry.id);
            }
        }
        snap.data = data.into();

        self.loading_snapshot = true;
        self.raw.step(msg)?;
        Ok(())
    }

    /// Current membership as it would be recorded in a snapshot.
    fn membership_entries(&self) -> Vec<SnapshotCfgEntry> {
        let conf_state = self.raw.raft.raft_log.store.conf_state();
        let mut entries = vec![SnapshotCfgEntry {
            id: self.cfg.id,
            active: true,
            voting: conf_state.voters.contains(&self.cfg.id),
            addr: self.cfg.addr.clone(),
        }];
        for peer in self.peers.iter() {
            entries.push(SnapshotCfgEntry {
                id: peer.id,
                active: peer.state() == crate::raft::peer::PeerState::Connected,
                voting: conf_state.voters.contains(&peer.id),
                addr: peer.addr.to_string(),
            });
        }
        entries
    }

    /// Mark snapshot-push progress from outbound messages and append
    /// responses.
    fn note_snapshot_push_progress(&mut self, msg: &Message) {
        if msg.get_msg_type() == MessageType::MsgAppendResponse {
            let id = msg.from;
            let caught_up = self
                .peers
                .get(id)
                .map(|p| p.load_snapshot_in_progress && msg.index >= p.load_snapshot_idx)
                .unwrap_or(false);
            if caught_up {
                self.peers.snapshot_push_finished(id);
                self.raw.report_snapshot(id, SnapshotStatus::Finish);
            }
        }
    }

    fn handle_out_messages(peers: &mut PeerManager, messages: Vec<Message>) {
        for msg in messages {
            if msg.get_msg_type() == MessageType::MsgSnapshot {
                peers.snapshot_push_started(msg.to, msg.get_snapshot().get_metadata().index);
            }
            peers.send(msg);
        }
    }

    /// Install a snapshot surfaced by a `Ready`. This is the apply side
    /// of both raft-native snapshot catch-up and an explicit
    /// `LoadSnapshot` request.
    fn handle_snapshot(&mut self, ready: &Ready) {
        let snapshot = ready.snapshot().clone();
        let meta = snapshot.get_metadata().clone();

        let image = match snapshot::load_image_bytes(snapshot.get_data()) {
            Ok(image) => Some(image),
            Err(e) => {
                // Metadata-only snapshot (fresh peer catching up with an
                // empty image) or garbage; only the former is expected.
                if !snapshot.get_data().is_empty() {
                    log::error!("pushed snapshot image unreadable: {}", e);
                    self.loading_snapshot = false;
                    return;
                }
                None
            }
        };

        {
            let store = &mut self.raw.raft.raft_log.store;
            if let Some(image) = &image {
                if store.dbid() != image.dbid {
                    log::info!("adopting cluster id {}", image.dbid);
                    store.adopt_dbid(&image.dbid);
                }
            }
            if let Err(e) = store.apply_snapshot(&snapshot) {
                log::error!("failed to apply snapshot: {:?}", e);
                self.loading_snapshot = false;
                return;
            }
        }

        if let Some(image) = image {
            self.sm.on_snapshot(meta.index, meta.term, &image.data);

            // The snapshot's membership list becomes the cluster view.
            let known: Vec<u64> = self.peers.iter().map(|p| p.id).collect();
            for id in known {
                if !image.cfg.iter().any(|c| c.id == id) {
                    self.peers.remove_peer(id);
                }
            }
            for entry in &image.cfg {
                if entry.id != self.cfg.id {
                    if let Ok(addr) = entry.addr.parse() {
                        self.peers.add_peer(entry.id, addr);
                    }
                }
            }

            self.snapshot_info = image.info();
            // Persist the artifact so a restart recovers from it.
            let final_path = self.cfg.snapshot_filename();
            if let Err(e) = snapshot::write_artifact(&image, &final_path) {
                log::warn!("could not persist pushed snapshot: {}", e);
            } else {
                self.raw.raft.raft_log.store.set_snapshot_path(final_path);
            }
        }

        self.loading_snapshot = false;
        log::info!("snapshot installed at term {} idx {}", meta.term, meta.index);
    }

    fn handle_committed_entries(&mut self, entries: Vec<Entry>) {
        for entry in entries {
            // An empty entry (a new leader's no-op) still consumes an index
            // a pending proposal may be waiting on, so every committed entry
            // goes through the reply path.
            let response = if entry.data.is_empty() {
                Vec::new()
            } else if entry.get_entry_type() == EntryType::EntryConfChange {
                self.apply_conf_change_entry(&entry);
                Vec::new()
            } else {
                self.sm.apply(entry.index, entry.data.as_ref())
            };
            self.reply_pending(entry.index, entry.term, response);
            self.raw.raft.raft_log.store.set_applied(entry.index);
        }
    }

    fn apply_conf_change_entry(&mut self, entry: &Entry) {
        let mut cc = ConfChange::default();
        if let Err(e) = cc.merge_from_bytes(&entry.data) {
            log::error!("undecodable conf change at idx {}: {}", entry.index, e);
            return;
        }
        let cs = match self.raw.apply_conf_change(&cc) {
            Ok(cs) => cs,
            Err(e) => {
                log::error!("conf change at idx {} rejected: {}", entry.index, e);
                return;
            }
        };
        self.raw.raft.raft_log.store.set_conf_state(cs);

        match cc.get_change_type() {
            ConfChangeType::AddNode | ConfChangeType::AddLearnerNode => {
                if cc.node_id != self.cfg.id {
                    match std::str::from_utf8(&cc.context)
                        .map_err(|e| RaftKvError::Decode(e.to_string()))
                        .and_then(|s| s.parse::<NodeAddr>())
                    {
                        Ok(addr) => self.peers.add_peer(cc.node_id, addr),
                        Err(e) => {
                            log::error!("conf change for {} has bad address: {}", cc.node_id, e)
                        }
                    }
                }
            }
            ConfChangeType::RemoveNode => {
                if cc.node_id == self.cfg.id {
                    log::warn!("removed from cluster configuration");
                } else {
                    self.peers.remove_peer(cc.node_id);
                }
            }
        }
    }

    /// Answer proposals whose entry just applied. An entry at a pending
    /// index but a different term means the proposal lost a leadership
    /// change; the client is told to retry.
    fn reply_pending(&mut self, index: u64, term: u64, response: Vec<u8>) {
        while let Some(front) = self.pending.front() {
            if front.index > index {
                break;
            }
            let pending = match self.pending.pop_front() {
                Some(p) => p,
                None => break,
            };
            if pending.index == index && pending.term == term {
                let _ = pending.reply.send(RaftResponse::Ok(response));
                break;
            }
            let _ = pending
                .reply
                .send(RaftResponse::Error("proposal superseded".to_string()));
        }
    }

    /// Process the consensus library's ready state: send messages,
    /// install snapshots, apply commits, persist, advance. Order follows
    /// the library's contract; the sync between persisting and sending
    /// persisted messages is the durability point for appends and votes.
    fn on_ready(&mut self) {
        if !self.raw.has_ready() {
            return;
        }

        let mut ready = self.raw.ready();

        if !ready.messages().is_empty() {
            Self::handle_out_messages(&mut self.peers, ready.take_messages());
        }

        if *ready.snapshot() != Snapshot::default() {
            self.handle_snapshot(&ready);
        }

        let committed = ready.take_committed_entries();
        self.handle_committed_entries(committed);

        {
            let store = &mut self.raw.raft.raft_log.store;
            if let Err(e) = store.append_entries(ready.entries()) {
                log::error!("failed to persist raft log: {:?}", e);
                return;
            }
            if let Some(hs) = ready.hs() {
                if let Err(e) = store.set_hardstate(hs.clone()) {
                    log::error!("failed to persist hard state: {:?}", e);
                    return;
                }
            }
            if let Err(e) = store.sync() {
                log::error!("failed to sync raft log: {:?}", e);
                return;
            }
        }

        if !ready.persisted_messages().is_empty() {
            Self::handle_out_messages(&mut self.peers, ready.take_persisted_messages());
        }

        let mut light_rd = self.raw.advance(ready);
        if let Some(commit) = light_rd.commit_index() {
            self.raw.raft.raft_log.store.set_commit(commit);
        }
        Self::handle_out_messages(&mut self.peers, light_rd.take_messages());
        let committed = light_rd.take_committed_entries();
        self.handle_committed_entries(committed);
        self.raw.advance_apply();
    }
}

/// Spawn the loop thread. Exactly one exists for the process lifetime;
/// it owns all consensus state, and `queue` is the only way in.
pub fn start_raft<S: StateMachine + Send + 'static>(
    queue: Arc<RequestQueue>,
    sm: S,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("raft-loop".to_string())
        .spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build raft loop runtime");
            rt.block_on(async move {
                let cfg = crate::config::instance().lock().unwrap().clone();
                let mut node = match RaftNode::new(cfg, queue, sm) {
                    Ok(node) => node,
                    Err(e) => {
                        log::error!("fatal: raft recovery failed: {}", e);
                        std::process::exit(1);
                    }
                };
                node.run().await;
            });
        })
        .expect("failed to spawn raft loop thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::KvStore;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir, bootstrap: bool) -> RuntimeConfig {
        let mut cfg = RuntimeConfig::new();
        cfg.id = 1;
        cfg.bootstrap = bootstrap;
        cfg.raftlog = dir
            .path()
            .join("raftkv.db")
            .to_string_lossy()
            .to_string();
        cfg
    }

    fn new_node(dir: &TempDir, bootstrap: bool) -> RaftNode<KvStore> {
        let cfg = test_config(dir, bootstrap);
        RaftNode::new(cfg, Arc::new(RequestQueue::new()), KvStore::new()).unwrap()
    }

    #[test]
    fn test_command_rejected_while_loading() {
        let dir = TempDir::new().unwrap();
        let mut node = new_node(&dir, true);
        assert_eq!(node.lifecycle, NodeLifecycle::Loading);

        let (tx, mut rx) = oneshot::channel();
        node.queue.submit(RaftReq::StoreCommand {
            args: vec![b"set".to_vec(), b"k".to_vec(), b"v".to_vec()],
            reply: tx,
        });
        node.dispatch_pending();

        match rx.try_recv() {
            Ok(RaftResponse::Loading) => {}
            other => panic!("expected Loading rejection, got {:?}", other),
        }
        // Nothing was proposed.
        assert_eq!(node.pending.len(), 0);
    }

    #[test]
    fn test_command_rejected_when_not_leader() {
        let dir = TempDir::new().unwrap();
        let mut node = new_node(&dir, true);
        node.lifecycle = NodeLifecycle::Up;
        // Fresh node has not campaigned; it is a follower.
        assert_ne!(node.raw.raft.state, StateRole::Leader);

        let (tx, mut rx) = oneshot::channel();
        node.queue.submit(RaftReq::StoreCommand {
            args: vec![b"get".to_vec(), b"k".to_vec()],
            reply: tx,
        });
        node.dispatch_pending();

        match rx.try_recv() {
            Ok(RaftResponse::NotLeader { .. }) => {}
            other => panic!("expected NotLeader, got {:?}", other),
        }
    }

    #[test]
    fn test_info_reflects_lifecycle_and_peers() {
        let dir = TempDir::new().unwrap();
        let mut node = new_node(&dir, true);
        node.peers.add_peer(2, "peer2:4000".parse().unwrap());

        let (tx, mut rx) = oneshot::channel();
        node.queue.submit(RaftReq::Info { reply: tx });
        node.dispatch_pending();

        let info = rx.try_recv().unwrap();
        assert_eq!(info.node_id, 1);
        assert_eq!(info.lifecycle, "loading");
        assert_eq!(info.peers.len(), 1);
        assert_eq!(info.peers[0].0, 2);
        assert_eq!(info.peers[0].2, "disconnected");
    }

    #[test]
    fn test_load_snapshot_rejects_stale_image() {
        let dir = TempDir::new().unwrap();
        let mut node = new_node(&dir, true);
        node.lifecycle = NodeLifecycle::Up;
        node.raw.raft.raft_log.store.set_applied(10);

        let image = SnapshotImage {
            dbid: node.snapshot_info.dbid.clone(),
            last_applied_term: 1,
            last_applied_idx: 5,
            cfg: Vec::new(),
            data: Vec::new(),
        };
        let bytes = bincode::serialize(&image).unwrap();
        match node.handle_load_snapshot(1, 5, bytes) {
            Err(RaftKvError::StaleSnapshot { offered, local }) => {
                assert_eq!(offered, 5);
                assert_eq!(local, 10);
            }
            other => panic!("expected StaleSnapshot, got {:?}", other.err()),
        }
        assert!(!node.loading_snapshot);
    }

    #[test]
    fn test_proposal_applied_and_replied() {
        let dir = TempDir::new().unwrap();
        let mut node = new_node(&dir, true);
        node.lifecycle = NodeLifecycle::Up;

        // Single-voter cluster: campaigning wins immediately.
        node.raw.campaign().unwrap();
        node.on_ready();
        assert_eq!(node.raw.raft.state, StateRole::Leader);

        let (tx, mut rx) = oneshot::channel();
        node.queue.submit(RaftReq::StoreCommand {
            args: vec![b"set".to_vec(), b"k".to_vec(), b"v".to_vec()],
            reply: tx,
        });
        node.dispatch_pending();
        assert_eq!(node.pending.len(), 1);

        // Drive ready processing until the entry applies.
        for _ in 0..10 {
            node.on_ready();
            if node.pending.is_empty() {
                break;
            }
        }
        match rx.try_recv() {
            Ok(RaftResponse::Ok(_)) => {}
            other => panic!("expected applied reply, got {:?}", other),
        }
    }

    #[test]
    fn test_leader_noop_answers_superseded_proposal() {
        let dir = TempDir::new().unwrap();
        let mut node = new_node(&dir, true);
        node.lifecycle = NodeLifecycle::Up;

        let (tx, mut rx) = oneshot::channel();
        node.pending.push_back(PendingProposal {
            index: 5,
            term: 1,
            reply: tx,
        });

        // A new leader's empty no-op lands on the index the proposal held.
        let mut entry = Entry::default();
        entry.index = 5;
        entry.term = 2;
        node.handle_committed_entries(vec![entry]);

        match rx.try_recv() {
            Ok(RaftResponse::Error(e)) => assert!(e.contains("superseded")),
            other => panic!("expected superseded reply, got {:?}", other),
        }
        assert!(node.pending.is_empty());
    }

    #[test]
    fn test_compact_after_writes_trims_log() {
        let dir = TempDir::new().unwrap();
        let mut node = new_node(&dir, true);
        node.lifecycle = NodeLifecycle::Up;
        node.raw.campaign().unwrap();
        node.on_ready();

        for i in 0..5u8 {
            let (tx, _rx) = oneshot::channel();
            node.queue.submit(RaftReq::StoreCommand {
                args: vec![b"set".to_vec(), vec![i], vec![i]],
                reply: tx,
            });
        }
        node.dispatch_pending();
        for _ in 0..10 {
            node.on_ready();
            if node.pending.is_empty() {
                break;
            }
        }
        let applied = node.raw.raft.raft_log.store.applied();
        assert!(applied > 1);

        let (tx, mut rx) = oneshot::channel();
        node.queue.submit(RaftReq::Compact { reply: Some(tx) });
        node.dispatch_pending();
        assert!(node.snapshot_in_progress);

        // Poll until the producer reports and finalize runs.
        for _ in 0..200 {
            node.poll_snapshot_status();
            if !node.snapshot_in_progress {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!node.snapshot_in_progress);
        match rx.try_recv() {
            Ok(RaftResponse::Ok(_)) => {}
            other => panic!("expected compaction ack, got {:?}", other),
        }
        assert_eq!(node.raw.raft.raft_log.store.num_entries(), 0);
        assert!(snapshot::snapshot_exists(node.cfg.snapshot_filename()));
    }

    #[test]
    fn test_second_compact_while_in_progress_fails() {
        let dir = TempDir::new().unwrap();
        let mut node = new_node(&dir, true);
        node.lifecycle = NodeLifecycle::Up;
        node.raw.campaign().unwrap();
        node.on_ready();
        let (tx, _rx) = oneshot::channel();
        node.queue.submit(RaftReq::StoreCommand {
            args: vec![b"set".to_vec(), b"k".to_vec(), b"v".to_vec()],
            reply: tx,
        });
        node.dispatch_pending();
        for _ in 0..10 {
            node.on_ready();
        }

        node.cfg.compact_delay = 5000;
        assert!(node.initiate_snapshot().is_ok());
        match node.initiate_snapshot() {
            Err(RaftKvError::SnapshotInProgress) => {}
            other => panic!("expected SnapshotInProgress, got {:?}", other.err()),
        }
    }
}
