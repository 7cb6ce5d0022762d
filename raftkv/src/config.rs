use log::warn;
use once_cell::sync::OnceCell;
use serde_derive::Deserialize;
use std::sync::Mutex;

static INSTANCE: OnceCell<Mutex<RuntimeConfig>> = OnceCell::new();

pub fn instance() -> &'static Mutex<RuntimeConfig> {
    INSTANCE.get_or_init(|| Mutex::new(RuntimeConfig::new()))
}

// Timing defaults, all in milliseconds.
pub const DEFAULT_RAFT_INTERVAL: u64 = 100;
pub const DEFAULT_REQUEST_TIMEOUT: u64 = 250;
pub const DEFAULT_ELECTION_TIMEOUT: u64 = 500;
pub const DEFAULT_RECONNECT_INTERVAL: u64 = 100;
pub const DEFAULT_MAX_LOG_ENTRIES: u64 = 10000;

pub const DEFAULT_RAFTLOG: &str = "raftkv.db";

fn default_raft_interval() -> u64 {
    DEFAULT_RAFT_INTERVAL
}
fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT
}
fn default_election_timeout() -> u64 {
    DEFAULT_ELECTION_TIMEOUT
}
fn default_reconnect_interval() -> u64 {
    DEFAULT_RECONNECT_INTERVAL
}
fn default_max_log_entries() -> u64 {
    DEFAULT_MAX_LOG_ENTRIES
}
fn default_raftlog() -> String {
    DEFAULT_RAFTLOG.to_string()
}
fn default_persist() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct NodeConfig {
    pub id: u64,
    pub addr: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Local node id.
    pub id: u64,
    /// Whether this node bootstraps a fresh single-node cluster.
    pub bootstrap: bool,
    /// Bind address for the gRPC server, `host:port`.
    pub addr: String,
    pub metrics_addr: String,
    /// Known cluster members at startup.
    #[serde(default)]
    pub node_list: Vec<NodeConfig>,
    /// Addresses tried in order when joining an existing cluster.
    #[serde(default)]
    pub join: Vec<String>,
    /// Raft log file name. The snapshot file name is derived from it.
    #[serde(default = "default_raftlog")]
    pub raftlog: String,
    /// Whether the log is persisted at all. Disabling is only useful for
    /// throwaway test clusters.
    #[serde(default = "default_persist")]
    pub persist: bool,
    #[serde(default = "default_raft_interval")]
    pub raft_interval: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default = "default_election_timeout")]
    pub election_timeout: u64,
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval: u64,
    /// Log size that triggers automatic compaction.
    #[serde(default = "default_max_log_entries")]
    pub max_log_entries: u64,
    /// Debug: artificial delay (ms) in the snapshot producer.
    #[serde(default)]
    pub compact_delay: u64,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        RuntimeConfig {
            id: 1,
            bootstrap: false,
            addr: "0.0.0.0:4000".to_string(),
            metrics_addr: "0.0.0.0:4010".to_string(),
            node_list: Vec::new(),
            join: Vec::new(),
            raftlog: DEFAULT_RAFTLOG.to_string(),
            persist: true,
            raft_interval: DEFAULT_RAFT_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            election_timeout: DEFAULT_ELECTION_TIMEOUT,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            max_log_entries: DEFAULT_MAX_LOG_ENTRIES,
            compact_delay: 0,
        }
    }

    /// Snapshot file name derived from the log file name.
    pub fn snapshot_filename(&self) -> String {
        format!("{}.snapshot", self.raftlog)
    }

    pub fn from_toml(path: &str) -> Option<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "Something went wrong reading the runtime config file, {:?}",
                    e
                );
                return Some(RuntimeConfig::new());
            }
        };
        let config: RuntimeConfig = match toml::from_str(&contents) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "Something went wrong reading the runtime config file, {:?}",
                    e
                );
                return Some(RuntimeConfig::new());
            }
        };
        *instance().lock().unwrap() = config.clone();
        Some(config)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig::new()
    }
}
