//! Bridge between the durable log and the consensus library.
//!
//! Reads are served from a `MemStorage` mirror; every mutation is written
//! through to the [`RaftLog`] first, so a restart can rebuild the mirror
//! by replaying the file. The consensus library only ever sees the
//! `raft::Storage` trait surface.

use std::collections::VecDeque;
use std::path::Path;

use raft::eraftpb::{ConfState, Entry, HardState, Snapshot};
use raft::storage::MemStorage;
use raft::{GetEntriesContext, RaftState, Storage};

use crate::error::{RaftKvError, Result};
use crate::raft::log::{LogEntryAction, RaftLog, VOTE_NONE};

pub struct LogStorage {
    mem: MemStorage,
    log: Option<RaftLog>,
    dbid: String,
    applied: u64,
    /// Installed snapshot artifact, attached as payload when the
    /// consensus library asks for a snapshot to push to a lagging peer.
    snapshot_path: Option<String>,
}

fn vote_to_disk(vote: u64) -> i64 {
    if vote == 0 {
        VOTE_NONE
    } else {
        vote as i64
    }
}

fn vote_from_disk(vote: i64) -> u64 {
    if vote < 0 {
        0
    } else {
        vote as u64
    }
}

impl LogStorage {
    /// Initialize storage for a brand new node. When `bootstrap` is set
    /// the node starts as the sole voter of a fresh cluster; otherwise it
    /// starts empty and expects to be added to an existing cluster.
    pub fn create<P: AsRef<Path>>(
        path: P,
        dbid: &str,
        id: u64,
        bootstrap: bool,
        persist: bool,
    ) -> Result<Self> {
        let mem = MemStorage::new();
        if bootstrap {
            let mut snapshot = Snapshot::default();
            snapshot.mut_metadata().index = 1;
            snapshot.mut_metadata().term = 1;
            snapshot.mut_metadata().mut_conf_state().voters = vec![id];
            mem.wl().apply_snapshot(snapshot)?;
        }

        let log = if persist {
            let (term, index) = if bootstrap { (1, 1) } else { (0, 0) };
            Some(RaftLog::create(path, dbid, term, index)?)
        } else {
            None
        };

        Ok(LogStorage {
            mem,
            log,
            dbid: dbid.to_string(),
            applied: 0,
            snapshot_path: None,
        })
    }

    /// Reopen existing storage, validating the file's identity when the
    /// caller knows it, and replaying every recorded mutation into the
    /// memory mirror.
    pub fn open<P: AsRef<Path>>(
        path: P,
        expected_dbid: Option<&str>,
        conf_state: ConfState,
    ) -> Result<Self> {
        let mut log = RaftLog::open(path)?;
        if let Some(expected) = expected_dbid {
            if log.dbid() != expected {
                return Err(RaftKvError::DbidMismatch {
                    found: log.dbid(),
                    expected: expected.to_string(),
                });
            }
        }
        let dbid = log.dbid();

        let mut live: VecDeque<Entry> = VecDeque::new();
        log.load_entries(|action| {
            match action {
                LogEntryAction::Append(e) => live.push_back(e),
                LogEntryAction::RemoveHead => {
                    live.pop_front();
                }
                LogEntryAction::RemoveTail => {
                    live.pop_back();
                }
            }
            Ok(())
        })?;

        if live.len() as u64 != log.num_entries() {
            log::warn!(
                "log header claims {} entries but replay produced {}",
                log.num_entries(),
                live.len()
            );
        }

        let mem = MemStorage::new();
        if log.snapshot_last_idx() > 0 {
            let mut snapshot = Snapshot::default();
            snapshot.mut_metadata().index = log.snapshot_last_idx();
            snapshot.mut_metadata().term = log.snapshot_last_term();
            *snapshot.mut_metadata().mut_conf_state() = conf_state;
            mem.wl().apply_snapshot(snapshot)?;
        } else {
            mem.wl().set_conf_state(conf_state);
        }

        if !live.is_empty() {
            let entries: Vec<Entry> = live.into_iter().collect();
            mem.wl().append(&entries)?;
        }

        let mut hs = HardState::default();
        hs.term = log.term();
        hs.vote = vote_from_disk(log.vote());
        hs.commit = log.snapshot_last_idx();
        mem.wl().set_hardstate(hs);

        Ok(LogStorage {
            mem,
            log: Some(log),
            dbid,
            applied: 0,
            snapshot_path: None,
        })
    }

    /// Append entries from a `Ready`, removing any conflicting tail first.
    /// Does not sync; the caller syncs before the append is acknowledged.
    pub fn append_entries(&mut self, entries: &[Entry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        if let Some(log) = self.log.as_mut() {
            let first_new = entries[0].index;
            if first_new <= self.applied {
                // Consensus never rewrites applied entries; a divergence
                // reaching below the applied index means our log no longer
                // matches what the cluster committed.
                panic!(
                    "log divergence below applied index: new {} <= applied {}",
                    first_new, self.applied
                );
            }
            while log.index() >= first_new && log.num_entries() > 0 {
                log.remove_tail()?;
            }
            for entry in entries {
                log.append(entry)?;
            }
        }

        self.mem.wl().append(entries)?;
        Ok(())
    }

    /// Durability point. Called before an append is acknowledged or a
    /// vote is granted.
    pub fn sync(&mut self) -> Result<()> {
        if let Some(log) = self.log.as_mut() {
            log.sync()?;
        }
        Ok(())
    }

    pub fn set_hardstate(&mut self, hs: HardState) -> Result<()> {
        if let Some(log) = self.log.as_mut() {
            let vote = vote_to_disk(hs.vote);
            if log.term() != hs.term || log.vote() != vote {
                log.set_term(hs.term, vote)?;
            }
        }
        self.mem.wl().set_hardstate(hs);
        Ok(())
    }

    pub fn set_conf_state(&mut self, conf_state: ConfState) {
        self.mem.wl().set_conf_state(conf_state);
    }

    pub fn set_commit(&mut self, commit: u64) {
        self.mem.wl().mut_hard_state().set_commit(commit);
    }

    pub fn set_applied(&mut self, applied: u64) {
        if applied > self.applied {
            self.applied = applied;
        }
    }

    pub fn applied(&self) -> u64 {
        self.applied
    }

    /// Trim everything up to and including `index`, which the snapshot at
    /// (`term`, `index`) now covers.
    pub fn compact(&mut self, term: u64, index: u64) -> Result<()> {
        if let Some(log) = self.log.as_mut() {
            while log.num_entries() > 0 && log.first_index() <= index {
                log.remove_head()?;
            }
            log.set_snapshot(term, index)?;
        }
        if let Err(e) = self.mem.wl().compact(index) {
            // Already compacted past this point; nothing to trim.
            log::debug!("mem compact to {}: {:?}", index, e);
        }
        Ok(())
    }

    /// Install a snapshot received from the leader. The durable log is
    /// recreated empty past the snapshot boundary; everything it held is
    /// superseded.
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        let meta = snapshot.get_metadata();
        self.mem.wl().apply_snapshot(snapshot.clone())?;
        if let Some(log) = self.log.take() {
            let path = log.path().to_path_buf();
            drop(log);
            self.log = Some(RaftLog::create(&path, &self.dbid, meta.term, meta.index)?);
        }
        self.applied = meta.index;
        Ok(())
    }

    pub fn num_entries(&self) -> u64 {
        self.log.as_ref().map(|l| l.num_entries()).unwrap_or(0)
    }

    pub fn log_first_index(&self) -> u64 {
        self.log.as_ref().map(|l| l.first_index()).unwrap_or(0)
    }

    pub fn log_last_index(&self) -> u64 {
        self.log.as_ref().map(|l| l.index()).unwrap_or(0)
    }

    pub fn set_snapshot_path(&mut self, path: String) {
        self.snapshot_path = Some(path);
    }

    /// Adopt the cluster identity carried by a leader-pushed snapshot;
    /// the recreated log is bound to it.
    pub fn adopt_dbid(&mut self, dbid: &str) {
        self.dbid = dbid.to_string();
    }

    pub fn dbid(&self) -> &str {
        &self.dbid
    }

    pub fn hard_state(&self) -> HardState {
        self.mem.rl().hard_state().clone()
    }

    pub fn conf_state(&self) -> ConfState {
        self.mem
            .initial_state()
            .map(|state| state.conf_state)
            .unwrap_or_default()
    }
}

impl Storage for LogStorage {
    fn initial_state(&self) -> raft::Result<RaftState> {
        self.mem.initial_state()
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        self.mem.entries(low, high, max_size, context)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        self.mem.term(idx)
    }

    fn first_index(&self) -> raft::Result<u64> {
        self.mem.first_index()
    }

    fn last_index(&self) -> raft::Result<u64> {
        self.mem.last_index()
    }

    fn snapshot(&self, request_index: u64, to: u64) -> raft::Result<Snapshot> {
        let mut snapshot = self.mem.snapshot(request_index, to)?;
        // The mirror only tracks metadata; the payload pushed to a
        // lagging peer is the installed artifact.
        if snapshot.data.is_empty() {
            if let Some(path) = &self.snapshot_path {
                match std::fs::read(path) {
                    Ok(bytes) => snapshot.data = bytes.into(),
                    Err(e) => {
                        log::warn!("snapshot artifact {} unreadable: {}", path, e);
                        return Err(raft::Error::Store(
                            raft::StorageError::SnapshotTemporarilyUnavailable,
                        ));
                    }
                }
            }
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(index: u64, term: u64) -> Entry {
        let mut e = Entry::default();
        e.index = index;
        e.term = term;
        e.data = vec![index as u8].into();
        e
    }

    fn new_storage(dir: &TempDir) -> LogStorage {
        LogStorage::create(dir.path().join("raftkv.db"), "test-db", 1, true, true).unwrap()
    }

    #[test]
    fn test_bootstrap_state() {
        let dir = TempDir::new().unwrap();
        let storage = new_storage(&dir);
        let state = storage.initial_state().unwrap();
        assert_eq!(state.conf_state.voters, vec![1]);
        assert_eq!(storage.last_index().unwrap(), 1);
    }

    #[test]
    fn test_append_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("raftkv.db");
        {
            let mut storage = new_storage(&dir);
            storage
                .append_entries(&[entry(2, 1), entry(3, 1), entry(4, 1)])
                .unwrap();
            let mut hs = HardState::default();
            hs.term = 1;
            hs.vote = 1;
            storage.set_hardstate(hs).unwrap();
            storage.sync().unwrap();
        }
        let mut cs = ConfState::default();
        cs.voters = vec![1];
        let storage = LogStorage::open(&path, Some("test-db"), cs).unwrap();
        assert_eq!(storage.last_index().unwrap(), 4);
        assert_eq!(storage.hard_state().term, 1);
        assert_eq!(storage.hard_state().vote, 1);
        assert_eq!(storage.num_entries(), 3);
    }

    #[test]
    fn test_divergent_tail_rewritten() {
        let dir = TempDir::new().unwrap();
        let mut storage = new_storage(&dir);
        storage
            .append_entries(&[entry(2, 1), entry(3, 1), entry(4, 1)])
            .unwrap();
        // Leader rewrites 3..4 at a higher term.
        storage
            .append_entries(&[entry(3, 2), entry(4, 2)])
            .unwrap();
        assert_eq!(storage.log_last_index(), 4);
        assert_eq!(storage.num_entries(), 3);
        assert_eq!(storage.term(4).unwrap(), 2);
    }

    #[test]
    #[should_panic(expected = "below applied index")]
    fn test_tail_removal_below_applied_is_fatal() {
        let dir = TempDir::new().unwrap();
        let mut storage = new_storage(&dir);
        storage
            .append_entries(&[entry(2, 1), entry(3, 1)])
            .unwrap();
        storage.set_applied(3);
        storage.append_entries(&[entry(3, 2)]).unwrap();
    }

    #[test]
    fn test_compact_leaves_suffix() {
        let dir = TempDir::new().unwrap();
        let mut storage = new_storage(&dir);
        storage
            .append_entries(&[entry(2, 1), entry(3, 1), entry(4, 1), entry(5, 1)])
            .unwrap();
        storage.compact(1, 3).unwrap();
        assert_eq!(storage.num_entries(), 2);
        assert_eq!(storage.log_first_index(), 4);
        assert_eq!(storage.log_last_index(), 5);
    }

    #[test]
    fn test_conf_state_tracks_membership() {
        let dir = TempDir::new().unwrap();
        let mut storage = new_storage(&dir);
        assert_eq!(storage.conf_state().voters, vec![1]);

        let mut cs = ConfState::default();
        cs.voters = vec![1, 2, 3];
        storage.set_conf_state(cs);
        assert_eq!(storage.conf_state().voters, vec![1, 2, 3]);
    }

    #[test]
    fn test_open_rejects_foreign_dbid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("raftkv.db");
        {
            new_storage(&dir);
        }
        match LogStorage::open(&path, Some("other-db"), ConfState::default()) {
            Err(RaftKvError::DbidMismatch { found, expected }) => {
                assert_eq!(found, "test-db");
                assert_eq!(expected, "other-db");
            }
            _ => panic!("expected DbidMismatch"),
        }
    }
}
