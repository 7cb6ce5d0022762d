pub mod log;
pub mod node;
pub mod peer;
pub mod request;
pub mod snapshot;
pub mod storage;

/// Applied-state side of replication. The host store implements this; the
/// loop thread drives it with committed entries and snapshot images.
pub trait StateMachine {
    /// Apply a committed entry, returning the reply for the client that
    /// proposed it (ignored on followers).
    fn apply(&mut self, index: u64, data: &[u8]) -> Vec<u8>;
    /// Serialize a point-in-time image of the applied state.
    fn snapshot(&self) -> Vec<u8>;
    /// Replace the applied state with a snapshot image.
    fn on_snapshot(&mut self, last_index: u64, last_term: u64, data: &[u8]);
}
