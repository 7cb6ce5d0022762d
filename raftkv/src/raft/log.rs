//! Durable raft log.
//!
//! The log is a single append-only file: a fixed-size header that is
//! rewritten in place whenever log-level metadata changes, followed by an
//! ordered sequence of tagged records. A record is either an appended
//! entry or a head/tail removal marker, so replaying the file from the
//! beginning reconstructs the exact sequence of log mutations. This makes
//! the log its own write-ahead record of compaction events: no separate
//! manifest is needed to know which entries are still live.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use protobuf::Message as PbMessage;
use raft::eraftpb::Entry;
use serde_derive::{Deserialize, Serialize};

use crate::error::{RaftKvError, Result};

pub const RAFTLOG_VERSION: u32 = 1;
pub const DBID_LEN: usize = 32;

// 4 (version) + 32 (dbid) + 6 * 8.
const HEADER_SIZE: u64 = 84;
const RECORD_HEADER_SIZE: u64 = 8;

const TAG_APPEND: u8 = 1;
const TAG_REMOVE_HEAD: u8 = 2;
const TAG_REMOVE_TAIL: u8 = 3;

/// No vote cast in the current term.
pub const VOTE_NONE: i64 = -1;

/// One replayed log mutation, emitted in file order by [`RaftLog::load_entries`].
pub enum LogEntryAction {
    Append(Entry),
    RemoveHead,
    RemoveTail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LogHeader {
    version: u32,
    dbid: [u8; DBID_LEN],
    num_entries: u64,
    snapshot_last_term: u64,
    snapshot_last_idx: u64,
    vote: i64,
    term: u64,
    index: u64,
}

pub struct RaftLog {
    file: File,
    path: PathBuf,
    header: LogHeader,
}

fn dbid_bytes(dbid: &str) -> [u8; DBID_LEN] {
    let mut out = [0u8; DBID_LEN];
    let src = dbid.as_bytes();
    let n = src.len().min(DBID_LEN);
    out[..n].copy_from_slice(&src[..n]);
    out
}

impl RaftLog {
    /// Initialize a new log file with header metadata and zero entries.
    ///
    /// `term` and `index` become the snapshot boundary the log starts
    /// after; a fresh cluster passes zeroes.
    pub fn create<P: AsRef<Path>>(path: P, dbid: &str, term: u64, index: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let mut log = RaftLog {
            file,
            path: path.as_ref().to_path_buf(),
            header: LogHeader {
                version: RAFTLOG_VERSION,
                dbid: dbid_bytes(dbid),
                num_entries: 0,
                snapshot_last_term: term,
                snapshot_last_idx: index,
                vote: VOTE_NONE,
                term,
                index,
            },
        };
        log.write_header()?;
        log.sync()?;
        Ok(log)
    }

    /// Open an existing log, validate its header and position the cursor
    /// at the end for appends.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut buf = vec![0u8; HEADER_SIZE as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut buf)
            .map_err(|_| RaftKvError::Corrupt("log header truncated".to_string()))?;
        let header: LogHeader = bincode::deserialize(&buf)
            .map_err(|e| RaftKvError::Corrupt(format!("log header unreadable: {}", e)))?;

        if header.version != RAFTLOG_VERSION {
            return Err(RaftKvError::BadVersion {
                found: header.version,
                expected: RAFTLOG_VERSION,
            });
        }

        file.seek(SeekFrom::End(0))?;
        Ok(RaftLog {
            file,
            path: path.as_ref().to_path_buf(),
            header,
        })
    }

    fn write_header(&mut self) -> Result<()> {
        let bytes = bincode::serialize(&self.header)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        debug_assert_eq!(bytes.len() as u64, HEADER_SIZE);
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&bytes)?;
        Ok(())
    }

    /// Append an entry's serialized payload and advance the live index.
    /// Durability is the caller's responsibility; invoke [`sync`] at
    /// consensus-mandated commit points.
    ///
    /// [`sync`]: RaftLog::sync
    pub fn append(&mut self, entry: &Entry) -> Result<()> {
        if self.header.index != 0 && entry.index != self.header.index + 1 {
            return Err(RaftKvError::Corrupt(format!(
                "append of index {} would leave a gap after {}",
                entry.index, self.header.index
            )));
        }

        let payload = entry
            .write_to_bytes()
            .map_err(|e| RaftKvError::Decode(e.to_string()))?;

        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&[TAG_APPEND])?;
        self.file.write_all(&(payload.len() as u64).to_le_bytes())?;
        self.file.write_all(&payload)?;

        self.header.num_entries += 1;
        self.header.index = entry.index;
        self.write_header()?;
        Ok(())
    }

    /// Flush buffered records to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Persist term and vote together. A crash must never recover one
    /// without the other; both live in the single header write below.
    pub fn set_term(&mut self, term: u64, vote: i64) -> Result<()> {
        self.header.term = term;
        self.header.vote = vote;
        self.write_header()?;
        self.sync()
    }

    pub fn set_vote(&mut self, vote: i64) -> Result<()> {
        self.header.vote = vote;
        self.write_header()?;
        self.sync()
    }

    /// Record the snapshot boundary the head of the log now trails.
    pub fn set_snapshot(&mut self, term: u64, index: u64) -> Result<()> {
        self.header.snapshot_last_term = term;
        self.header.snapshot_last_idx = index;
        self.write_header()?;
        self.sync()
    }

    /// Drop the first live entry. Returns false (no-op) when the log is
    /// already empty.
    pub fn remove_head(&mut self) -> Result<bool> {
        if self.header.num_entries == 0 {
            return Ok(false);
        }
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&[TAG_REMOVE_HEAD])?;
        self.header.num_entries -= 1;
        self.write_header()?;
        Ok(true)
    }

    /// Drop the last live entry, stepping the live index back. Used when
    /// the leader's log diverges from ours and the overlap must be
    /// rewritten.
    pub fn remove_tail(&mut self) -> Result<bool> {
        if self.header.num_entries == 0 {
            return Ok(false);
        }
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&[TAG_REMOVE_TAIL])?;
        self.header.num_entries -= 1;
        self.header.index -= 1;
        self.write_header()?;
        Ok(true)
    }

    /// Replay the file from the beginning, invoking the callback once per
    /// recorded action in file order. A torn record at the tail (crash
    /// mid-append before the header rewrite landed) ends the replay and
    /// the file is truncated back to the last complete record.
    pub fn load_entries<F>(&mut self, mut callback: F) -> Result<usize>
    where
        F: FnMut(LogEntryAction) -> Result<()>,
    {
        let file_len = self.file.metadata()?.len();
        let mut pos = HEADER_SIZE;
        let mut actions = 0usize;

        self.file.seek(SeekFrom::Start(pos))?;
        while pos < file_len {
            let mut tag = [0u8; 1];
            if self.file.read_exact(&mut tag).is_err() {
                break;
            }
            match tag[0] {
                TAG_APPEND => {
                    if pos + 1 + RECORD_HEADER_SIZE > file_len {
                        log::warn!("torn append record at {}, truncating log tail", pos);
                        self.file.set_len(pos)?;
                        break;
                    }
                    let mut len_bytes = [0u8; 8];
                    self.file.read_exact(&mut len_bytes)?;
                    let len = u64::from_le_bytes(len_bytes);
                    if pos + 1 + RECORD_HEADER_SIZE + len > file_len {
                        log::warn!("torn append record at {}, truncating log tail", pos);
                        self.file.set_len(pos)?;
                        break;
                    }
                    let mut payload = vec![0u8; len as usize];
                    self.file.read_exact(&mut payload)?;
                    let mut entry = Entry::default();
                    entry
                        .merge_from_bytes(&payload)
                        .map_err(|e| RaftKvError::Corrupt(format!("bad entry record: {}", e)))?;
                    callback(LogEntryAction::Append(entry))?;
                    pos += 1 + RECORD_HEADER_SIZE + len;
                }
                TAG_REMOVE_HEAD => {
                    callback(LogEntryAction::RemoveHead)?;
                    pos += 1;
                }
                TAG_REMOVE_TAIL => {
                    callback(LogEntryAction::RemoveTail)?;
                    pos += 1;
                }
                other => {
                    return Err(RaftKvError::Corrupt(format!(
                        "unknown log record tag {} at offset {}",
                        other, pos
                    )));
                }
            }
            actions += 1;
        }

        self.file.seek(SeekFrom::End(0))?;
        Ok(actions)
    }

    pub fn num_entries(&self) -> u64 {
        self.header.num_entries
    }

    /// Index of the last live entry.
    pub fn index(&self) -> u64 {
        self.header.index
    }

    /// Index of the first live entry, or 0 when empty.
    pub fn first_index(&self) -> u64 {
        if self.header.num_entries == 0 {
            0
        } else {
            self.header.index - self.header.num_entries + 1
        }
    }

    pub fn term(&self) -> u64 {
        self.header.term
    }

    pub fn vote(&self) -> i64 {
        self.header.vote
    }

    pub fn snapshot_last_idx(&self) -> u64 {
        self.header.snapshot_last_idx
    }

    pub fn snapshot_last_term(&self) -> u64 {
        self.header.snapshot_last_term
    }

    pub fn dbid(&self) -> String {
        let end = self
            .header
            .dbid
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(DBID_LEN);
        String::from_utf8_lossy(&self.header.dbid[..end]).to_string()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tempfile::NamedTempFile;

    fn entry(index: u64, term: u64, data: &[u8]) -> Entry {
        let mut e = Entry::default();
        e.index = index;
        e.term = term;
        e.data = data.to_vec().into();
        e
    }

    fn replay(log: &mut RaftLog) -> VecDeque<Entry> {
        let mut live = VecDeque::new();
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
        })
        .unwrap();
        live
    }

    #[test]
    fn test_create_and_reopen() {
        let tmp = NamedTempFile::new().unwrap();
        {
            let log = RaftLog::create(tmp.path(), "abcd1234", 0, 0).unwrap();
            assert_eq!(log.num_entries(), 0);
            assert_eq!(log.index(), 0);
            assert_eq!(log.vote(), VOTE_NONE);
        }
        let log = RaftLog::open(tmp.path()).unwrap();
        assert_eq!(log.dbid(), "abcd1234");
        assert_eq!(log.num_entries(), 0);
    }

    #[test]
    fn test_replay_fidelity() {
        let tmp = NamedTempFile::new().unwrap();
        let mut log = RaftLog::create(tmp.path(), "db", 0, 0).unwrap();

        for i in 1..=5 {
            log.append(&entry(i, 1, format!("e{}", i).as_bytes()))
                .unwrap();
        }
        assert!(log.remove_head().unwrap());
        assert!(log.remove_tail().unwrap());
        log.append(&entry(5, 2, b"e5'")).unwrap();
        log.sync().unwrap();

        assert_eq!(log.num_entries(), 4);
        assert_eq!(log.index(), 5);
        assert_eq!(log.first_index(), 2);

        drop(log);
        let mut log = RaftLog::open(tmp.path()).unwrap();
        let live = replay(&mut log);
        assert_eq!(live.len() as u64, log.num_entries());
        assert_eq!(live.front().unwrap().index, 2);
        assert_eq!(live.back().unwrap().index, 5);
        assert_eq!(live.back().unwrap().term, 2);
        assert_eq!(live.back().unwrap().data.as_ref(), b"e5'");
    }

    #[test]
    fn test_term_and_vote_recovered_together() {
        let tmp = NamedTempFile::new().unwrap();
        {
            let mut log = RaftLog::create(tmp.path(), "db", 0, 0).unwrap();
            log.set_term(7, 3).unwrap();
            // No clean close; reopen simulates a crash right after the
            // header write was synced.
        }
        let log = RaftLog::open(tmp.path()).unwrap();
        assert_eq!(log.term(), 7);
        assert_eq!(log.vote(), 3);
    }

    #[test]
    fn test_set_vote_keeps_term() {
        let tmp = NamedTempFile::new().unwrap();
        let mut log = RaftLog::create(tmp.path(), "db", 0, 0).unwrap();
        log.set_term(3, VOTE_NONE).unwrap();
        log.set_vote(2).unwrap();
        drop(log);
        let log = RaftLog::open(tmp.path()).unwrap();
        assert_eq!(log.term(), 3);
        assert_eq!(log.vote(), 2);
    }

    #[test]
    fn test_compaction_leaves_suffix() {
        let tmp = NamedTempFile::new().unwrap();
        let mut log = RaftLog::create(tmp.path(), "db", 0, 0).unwrap();
        for i in 1..=5 {
            log.append(&entry(i, 1, b"x")).unwrap();
        }
        // Compaction up to snapshot_last_idx = 3.
        while log.first_index() <= 3 && log.num_entries() > 0 {
            log.remove_head().unwrap();
        }
        log.set_snapshot(1, 3).unwrap();

        assert_eq!(log.num_entries(), 2);
        assert_eq!(log.first_index(), 4);
        assert_eq!(log.index(), 5);
        assert_eq!(log.snapshot_last_idx(), 3);

        drop(log);
        let mut log = RaftLog::open(tmp.path()).unwrap();
        let live = replay(&mut log);
        let indexes: Vec<u64> = live.iter().map(|e| e.index).collect();
        assert_eq!(indexes, vec![4, 5]);
    }

    #[test]
    fn test_remove_head_on_empty_is_noop() {
        let tmp = NamedTempFile::new().unwrap();
        let mut log = RaftLog::create(tmp.path(), "db", 0, 0).unwrap();
        assert!(!log.remove_head().unwrap());
        assert!(!log.remove_tail().unwrap());
        assert_eq!(log.num_entries(), 0);
    }

    #[test]
    fn test_append_gap_rejected() {
        let tmp = NamedTempFile::new().unwrap();
        let mut log = RaftLog::create(tmp.path(), "db", 0, 0).unwrap();
        log.append(&entry(1, 1, b"a")).unwrap();
        assert!(log.append(&entry(3, 1, b"b")).is_err());
    }

    #[test]
    fn test_open_rejects_bad_version() {
        let tmp = NamedTempFile::new().unwrap();
        {
            let mut log = RaftLog::create(tmp.path(), "db", 0, 0).unwrap();
            log.append(&entry(1, 1, b"a")).unwrap();
        }
        // Corrupt the version field in place.
        {
            let mut file = OpenOptions::new().write(true).open(tmp.path()).unwrap();
            file.seek(SeekFrom::Start(0)).unwrap();
            file.write_all(&99u32.to_le_bytes()).unwrap();
        }
        match RaftLog::open(tmp.path()) {
            Err(RaftKvError::BadVersion { found, expected }) => {
                assert_eq!(found, 99);
                assert_eq!(expected, RAFTLOG_VERSION);
            }
            other => panic!("expected BadVersion, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_torn_tail_truncated() {
        let tmp = NamedTempFile::new().unwrap();
        let full_len;
        {
            let mut log = RaftLog::create(tmp.path(), "db", 0, 0).unwrap();
            log.append(&entry(1, 1, b"hello")).unwrap();
            full_len = log.file.metadata().unwrap().len();
            log.append(&entry(2, 1, b"world")).unwrap();
        }
        // Chop the second record in half.
        {
            let file = OpenOptions::new().write(true).open(tmp.path()).unwrap();
            file.set_len(full_len + 3).unwrap();
        }
        let mut log = RaftLog::open(tmp.path()).unwrap();
        let live = replay(&mut log);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].index, 1);
    }
}
