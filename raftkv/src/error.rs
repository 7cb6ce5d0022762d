use thiserror::Error;

/// Crate-wide error taxonomy.
///
/// Transient network failures never surface through this type; the peer
/// connection state machine absorbs them and retries. Corruption variants
/// are unrecoverable and terminate the process at the call site that
/// detects them.
#[derive(Debug, Error)]
pub enum RaftKvError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("raft: {0}")]
    Raft(#[from] raft::Error),

    #[error("log corruption: {0}")]
    Corrupt(String),

    #[error("log version {found} not supported (expected {expected})")]
    BadVersion { found: u32, expected: u32 },

    #[error("log belongs to cluster {found}, this node is {expected}")]
    DbidMismatch { found: String, expected: String },

    #[error("not leader")]
    NotLeader { leader_hint: u64 },

    #[error("node is loading")]
    Loading,

    #[error("invalid node address: {0}")]
    InvalidAddress(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("snapshot already in progress")]
    SnapshotInProgress,

    #[error("stale snapshot: last applied index {offered} <= local {local}")]
    StaleSnapshot { offered: u64, local: u64 },

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, RaftKvError>;
