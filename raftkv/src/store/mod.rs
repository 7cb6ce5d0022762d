//! The replicated key-value store.
//!
//! Commands arrive as opaque argument vectors (`args[0]` is the command
//! name) already agreed on by consensus; by the time [`KvStore::apply`]
//! runs, every node applies the same command at the same index. The store
//! itself is deliberately dumb: a map plus a handful of commands.

use std::collections::HashMap;

use serde_derive::{Deserialize, Serialize};

use crate::raft::StateMachine;

/// Outcome of one applied command, serialized into the reply channel.
#[derive(Debug, Serialize, Deserialize, Default)]
pub struct CmdOutcome {
    pub ok: bool,
    pub value: Vec<u8>,
    pub error: String,
}

impl CmdOutcome {
    fn ok(value: Vec<u8>) -> Self {
        CmdOutcome {
            ok: true,
            value,
            error: String::new(),
        }
    }

    fn err(error: impl Into<String>) -> Self {
        CmdOutcome {
            ok: false,
            value: Vec::new(),
            error: error.into(),
        }
    }

    fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        bincode::deserialize(bytes).ok()
    }
}

#[derive(Default)]
pub struct KvStore {
    data: HashMap<Vec<u8>, Vec<u8>>,
}

impl KvStore {
    pub fn new() -> Self {
        KvStore::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn execute(&mut self, args: &[Vec<u8>]) -> CmdOutcome {
        let Some(name) = args.first() else {
            return CmdOutcome::err("empty command");
        };

        if name.eq_ignore_ascii_case(b"set") {
            let [_, key, value] = args else {
                return CmdOutcome::err("set expects a key and a value");
            };
            self.data.insert(key.clone(), value.clone());
            CmdOutcome::ok(Vec::new())
        } else if name.eq_ignore_ascii_case(b"get") {
            let [_, key] = args else {
                return CmdOutcome::err("get expects a key");
            };
            match self.data.get(key) {
                Some(value) => CmdOutcome::ok(value.clone()),
                None => CmdOutcome::ok(Vec::new()),
            }
        } else if name.eq_ignore_ascii_case(b"del") {
            let [_, key] = args else {
                return CmdOutcome::err("del expects a key");
            };
            let removed = self.data.remove(key).is_some();
            CmdOutcome::ok(vec![removed as u8])
        } else if name.eq_ignore_ascii_case(b"exists") {
            let [_, key] = args else {
                return CmdOutcome::err("exists expects a key");
            };
            CmdOutcome::ok(vec![self.data.contains_key(key) as u8])
        } else if name.eq_ignore_ascii_case(b"dbsize") {
            CmdOutcome::ok((self.data.len() as u64).to_be_bytes().to_vec())
        } else {
            CmdOutcome::err(format!(
                "unknown command {}",
                String::from_utf8_lossy(name)
            ))
        }
    }
}

impl StateMachine for KvStore {
    fn apply(&mut self, index: u64, data: &[u8]) -> Vec<u8> {
        let args: Vec<Vec<u8>> = match bincode::deserialize(data) {
            Ok(args) => args,
            Err(e) => {
                // A bad entry was still committed; every node sees the
                // same bytes, so failing it uniformly keeps them aligned.
                log::warn!("undecodable command at idx {}: {}", index, e);
                return CmdOutcome::err("undecodable command").encode();
            }
        };
        self.execute(&args).encode()
    }

    fn snapshot(&self) -> Vec<u8> {
        bincode::serialize(&self.data).unwrap_or_default()
    }

    fn on_snapshot(&mut self, last_index: u64, last_term: u64, data: &[u8]) {
        match bincode::deserialize(data) {
            Ok(map) => {
                self.data = map;
                log::info!(
                    "store reset from snapshot at term {} idx {}, {} keys",
                    last_term,
                    last_index,
                    self.data.len()
                );
            }
            Err(e) => log::error!("snapshot image undecodable: {}", e),
        }
    }
}
