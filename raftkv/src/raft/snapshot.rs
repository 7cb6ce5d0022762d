//! Snapshot production and loading.
//!
//! Compaction runs off the critical path: the loop thread serializes the
//! applied state once, hands it to a detached producer, and keeps
//! serving. The producer writes a temporary artifact and reports back
//! through a bounded [`SnapshotResult`] record on a channel the loop
//! polls non-blocking once per iteration. Nothing the producer does can
//! corrupt loop state: its output is only trusted after the magic check,
//! and a producer that dies is just a failed attempt, retried on the next
//! compaction trigger.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::error::{RaftKvError, Result};

/// "snap"; guards against a producer that crashed mid-write leaving
/// garbage in the result channel or artifact.
pub const SNAPSHOT_RESULT_MAGIC: u32 = 0x7061_6e73;

const ERR_MAX_LEN: usize = 256;

/// Completion record sent by the snapshot producer. `magic` must be
/// validated before any other field is trusted.
#[derive(Debug, Clone)]
pub struct SnapshotResult {
    pub magic: u32,
    pub success: bool,
    pub num_entries: u64,
    pub snapshot_filename: String,
    pub log_filename: String,
    pub err: String,
}

impl SnapshotResult {
    fn failure(err: String) -> Self {
        let mut err = err;
        err.truncate(ERR_MAX_LEN);
        SnapshotResult {
            magic: SNAPSHOT_RESULT_MAGIC,
            success: false,
            num_entries: 0,
            snapshot_filename: String::new(),
            log_filename: String::new(),
            err,
        }
    }
}

/// One cluster member as recorded in a snapshot's membership list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotCfgEntry {
    pub id: u64,
    pub active: bool,
    pub voting: bool,
    /// `host:port`.
    pub addr: String,
}

/// Metadata recovered from, or about to be written into, a snapshot.
#[derive(Debug, Clone, Default)]
pub struct SnapshotInfo {
    pub loaded: bool,
    pub dbid: String,
    pub last_applied_term: u64,
    pub last_applied_idx: u64,
    pub cfg: Vec<SnapshotCfgEntry>,
}

/// On-disk snapshot artifact: metadata plus the opaque state machine
/// image.
#[derive(Serialize, Deserialize)]
pub struct SnapshotImage {
    pub dbid: String,
    pub last_applied_term: u64,
    pub last_applied_idx: u64,
    pub cfg: Vec<SnapshotCfgEntry>,
    pub data: Vec<u8>,
}

impl SnapshotImage {
    pub fn info(&self) -> SnapshotInfo {
        SnapshotInfo {
            loaded: true,
            dbid: self.dbid.clone(),
            last_applied_term: self.last_applied_term,
            last_applied_idx: self.last_applied_idx,
            cfg: self.cfg.clone(),
        }
    }
}

fn tmp_path(final_path: &str) -> String {
    format!("{}.tmp", final_path)
}

/// Fork the compaction off the critical path. The image is already a
/// point-in-time copy, so the producer shares nothing with the loop;
/// completion arrives on the returned channel.
pub fn initiate_snapshot(
    image: SnapshotImage,
    final_path: String,
    log_filename: String,
    num_entries: u64,
    compact_delay: Duration,
) -> Receiver<SnapshotResult> {
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || {
        if !compact_delay.is_zero() {
            thread::sleep(compact_delay);
        }
        let result = match write_image(&image, &tmp_path(&final_path)) {
            Ok(()) => SnapshotResult {
                magic: SNAPSHOT_RESULT_MAGIC,
                success: true,
                num_entries,
                snapshot_filename: tmp_path(&final_path),
                log_filename,
                err: String::new(),
            },
            Err(e) => SnapshotResult::failure(e.to_string()),
        };
        // Receiver gone means the loop already gave up on this attempt.
        let _ = tx.send(result);
    });

    rx
}

fn write_image(image: &SnapshotImage, path: &str) -> Result<()> {
    let bytes =
        bincode::serialize(image).map_err(|e| RaftKvError::Other(format!("encode: {}", e)))?;
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    Ok(())
}

/// Non-blocking completion check, called once per loop iteration while a
/// snapshot is in progress. A disconnected channel means the producer
/// died without reporting; that is a failed attempt, not a fatal error.
pub fn poll_snapshot_status(rx: &Receiver<SnapshotResult>) -> Option<SnapshotResult> {
    match rx.try_recv() {
        Ok(result) => Some(result),
        Err(TryRecvError::Empty) => None,
        Err(TryRecvError::Disconnected) => Some(SnapshotResult::failure(
            "snapshot producer exited without a result".to_string(),
        )),
    }
}

/// True when the result record can be trusted at all.
pub fn validate_result(result: &SnapshotResult) -> bool {
    result.magic == SNAPSHOT_RESULT_MAGIC
}

/// Atomically replace the previous snapshot artifact with the new one.
pub fn install_artifact(result: &SnapshotResult, final_path: &str) -> Result<()> {
    fs::rename(&result.snapshot_filename, final_path)?;
    Ok(())
}

/// Discard partial producer output. Never touches the log or the current
/// snapshot artifact.
pub fn discard_artifacts(result: &SnapshotResult) {
    if !result.snapshot_filename.is_empty() {
        if let Err(e) = fs::remove_file(&result.snapshot_filename) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!(
                    "failed to remove partial snapshot {}: {}",
                    result.snapshot_filename,
                    e
                );
            }
        }
    }
}

pub fn load_image<P: AsRef<Path>>(path: P) -> Result<SnapshotImage> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;
    load_image_bytes(&bytes)
}

pub fn load_image_bytes(bytes: &[u8]) -> Result<SnapshotImage> {
    bincode::deserialize(bytes)
        .map_err(|e| RaftKvError::Corrupt(format!("snapshot unreadable: {}", e)))
}

/// Write an image straight to its final location, via the temporary name
/// so a crash mid-write never clobbers an existing artifact.
pub fn write_artifact(image: &SnapshotImage, final_path: &str) -> Result<()> {
    let tmp = tmp_path(final_path);
    write_image(image, &tmp)?;
    fs::rename(&tmp, final_path)?;
    Ok(())
}

pub fn snapshot_exists<P: AsRef<Path>>(path: P) -> bool {
    path.as_ref().exists()
}
