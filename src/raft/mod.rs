pub mod local;

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::watch;

use crate::error::Result;
use crate::fsm::Entry;

pub use local::LocalRaft;

/// Subdirectory of the data dir holding raft state.
pub const RAFT_STATE_DIR: &str = "raft";

/// Snapshots retained before the oldest is pruned.
pub const SNAPSHOTS_RETAINED: usize = 2;

/// Minimum number of recent log entries kept in memory across snapshot
/// compaction, to serve catch-up reads without hitting the store.
pub const RAFT_LOG_CACHE_SIZE: usize = 512;

/// The replicated log the scheduling core is built on.
///
/// The log layer owns election, replication and durability; the core
/// consumes it through this seam.
#[async_trait]
pub trait RaftHandle: Send + Sync {
    /// Append an entry, resolving with its log index once it has been
    /// committed and applied to the FSM.
    async fn apply(&self, entry: Entry) -> Result<u64>;

    /// Wait until the FSM has applied every entry committed before this
    /// call.
    async fn barrier(&self) -> Result<()>;

    fn applied_index(&self) -> u64;

    /// Leadership edges; `true` while this node holds leadership.
    fn leadership(&self) -> watch::Receiver<bool>;

    fn is_leader(&self) -> bool;

    /// Address of the current leader, when known and not us.
    fn leader_hint(&self) -> Option<String>;

    /// Add a voting peer. Returns `false` when the peer was already
    /// known; that is not an error.
    async fn add_peer(&self, addr: &str) -> Result<bool>;

    /// Remove a peer. Returns `false` when the peer was unknown; that is
    /// not an error.
    async fn remove_peer(&self, addr: &str) -> Result<bool>;

    /// Take a snapshot of the FSM, returning the index it covers.
    async fn snapshot(&self) -> Result<u64>;

    /// Replace the FSM from serialized snapshot bytes.
    async fn restore(&self, data: &[u8]) -> Result<()>;
}

/// Randomized election timeout, used for bootstrap self-election.
pub fn random_election_timeout(min_ms: u64, max_ms: u64) -> Duration {
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(min_ms..=max_ms))
}
