use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};

use crate::error::{DroverError, Result};
use crate::fsm::{Entry, Fsm};

use super::{
    random_election_timeout, RaftHandle, RAFT_LOG_CACHE_SIZE, RAFT_STATE_DIR, SNAPSHOTS_RETAINED,
};

/// Limit on waiting for the FSM to catch up during a barrier.
const BARRIER_WAIT_LIMIT: Duration = Duration::from_secs(10);

struct LogEntry {
    index: u64,
    term: u64,
    entry: Entry,
}

struct LogInner {
    entries: VecDeque<LogEntry>,
    last_index: u64,
    snapshot_index: u64,
}

enum SnapshotStore {
    /// Dev mode: recent snapshots held in memory.
    Inmem(Mutex<VecDeque<(u64, Vec<u8>)>>),
    /// Durable mode: JSON files under `<data_dir>/raft/`.
    Dir(PathBuf),
}

/// Single-voter in-process log used in dev mode and tests.
///
/// Appends commit immediately and are applied to the FSM inline under the
/// log mutex, so application order is exactly log order. Leadership is a
/// watch channel driven by [`LocalRaft::set_leader`]; bootstrap mode
/// self-elects after a randomized election timeout.
pub struct LocalRaft {
    fsm: Arc<Fsm>,
    inner: Mutex<LogInner>,
    term: AtomicU64,
    leader_tx: watch::Sender<bool>,
    leader_hint: std::sync::RwLock<Option<String>>,
    store: SnapshotStore,
}

impl LocalRaft {
    pub fn new_inmem(fsm: Arc<Fsm>) -> Arc<Self> {
        Arc::new(Self::with_store(fsm, SnapshotStore::Inmem(Mutex::new(VecDeque::new()))))
    }

    /// Durable variant: snapshots are written under `<data_dir>/raft/`.
    pub fn new_durable(fsm: Arc<Fsm>, data_dir: &Path) -> Result<Arc<Self>> {
        let path = data_dir.join(RAFT_STATE_DIR);
        std::fs::create_dir_all(&path).map_err(|e| {
            DroverError::Raft(format!("failed to create {}: {e}", path.display()))
        })?;
        Ok(Arc::new(Self::with_store(fsm, SnapshotStore::Dir(path))))
    }

    fn with_store(fsm: Arc<Fsm>, store: SnapshotStore) -> Self {
        let (leader_tx, _) = watch::channel(false);
        Self {
            fsm,
            inner: Mutex::new(LogInner {
                entries: VecDeque::new(),
                last_index: 0,
                snapshot_index: 0,
            }),
            term: AtomicU64::new(0),
            leader_tx,
            leader_hint: std::sync::RwLock::new(None),
            store,
        }
    }

    /// Drive the leadership stream. The term advances on every rising
    /// edge.
    pub fn set_leader(&self, is_leader: bool) {
        if is_leader && !*self.leader_tx.borrow() {
            self.term.fetch_add(1, Ordering::SeqCst);
        }
        self.leader_tx.send_replace(is_leader);
    }

    pub fn set_leader_hint(&self, hint: Option<String>) {
        *self.leader_hint.write().unwrap() = hint;
    }

    /// Self-elect after a randomized election timeout (bootstrap mode).
    pub fn bootstrap(self: &Arc<Self>) {
        let raft = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(random_election_timeout(150, 300)).await;
            tracing::info!("Bootstrap election timeout elapsed, assuming leadership");
            raft.set_leader(true);
        });
    }

    pub async fn last_index(&self) -> u64 {
        self.inner.lock().await.last_index
    }

    /// Index covered by the most recent snapshot.
    pub async fn snapshot_index(&self) -> u64 {
        self.inner.lock().await.snapshot_index
    }

    pub fn current_term(&self) -> u64 {
        self.term.load(Ordering::SeqCst)
    }

    /// Term of the most recent cached log entry.
    pub async fn last_log_term(&self) -> u64 {
        let inner = self.inner.lock().await;
        inner.entries.back().map(|e| e.term).unwrap_or(0)
    }

    /// Entries still cached in memory from `start_index` (inclusive).
    pub async fn cached_entries_from(&self, start_index: u64) -> Vec<Entry> {
        let inner = self.inner.lock().await;
        inner
            .entries
            .iter()
            .filter(|e| e.index >= start_index)
            .map(|e| e.entry.clone())
            .collect()
    }

    async fn persist_snapshot(&self, index: u64, data: Vec<u8>) -> Result<()> {
        match &self.store {
            SnapshotStore::Inmem(snaps) => {
                let mut snaps = snaps.lock().await;
                snaps.push_back((index, data));
                while snaps.len() > SNAPSHOTS_RETAINED {
                    snaps.pop_front();
                }
            }
            SnapshotStore::Dir(path) => {
                let file = path.join(format!("snapshot-{index:020}.json"));
                std::fs::write(&file, data).map_err(|e| {
                    DroverError::Raft(format!("failed to write {}: {e}", file.display()))
                })?;
                let mut old: Vec<PathBuf> = std::fs::read_dir(path)
                    .map_err(|e| DroverError::Raft(e.to_string()))?
                    .filter_map(|entry| entry.ok().map(|e| e.path()))
                    .filter(|p| {
                        p.file_name()
                            .and_then(|n| n.to_str())
                            .is_some_and(|n| n.starts_with("snapshot-"))
                    })
                    .collect();
                old.sort();
                while old.len() > SNAPSHOTS_RETAINED {
                    let stale = old.remove(0);
                    if let Err(e) = std::fs::remove_file(&stale) {
                        tracing::warn!(path = %stale.display(), error = %e, "Failed to prune snapshot");
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RaftHandle for LocalRaft {
    async fn apply(&self, entry: Entry) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        if !*self.leader_tx.borrow() {
            return Err(DroverError::NotLeader(self.leader_hint()));
        }
        inner.last_index += 1;
        let index = inner.last_index;
        let term = self.term.load(Ordering::SeqCst);
        inner.entries.push_back(LogEntry {
            index,
            term,
            entry: entry.clone(),
        });
        // Single voter: committed on append. Applying inline keeps the
        // applied index current by the time the call resolves.
        self.fsm.apply(index, &entry).await;
        Ok(index)
    }

    async fn barrier(&self) -> Result<()> {
        let last = self.inner.lock().await.last_index;
        if last == 0 {
            return Ok(());
        }
        self.fsm.wait_for_index(last, BARRIER_WAIT_LIMIT).await
    }

    fn applied_index(&self) -> u64 {
        self.fsm.applied_index()
    }

    fn leadership(&self) -> watch::Receiver<bool> {
        self.leader_tx.subscribe()
    }

    fn is_leader(&self) -> bool {
        *self.leader_tx.borrow()
    }

    fn leader_hint(&self) -> Option<String> {
        self.leader_hint.read().unwrap().clone()
    }

    async fn add_peer(&self, addr: &str) -> Result<bool> {
        if self.fsm.snapshot().await.peers().contains(addr) {
            return Ok(false);
        }
        self.apply(Entry::AddPeer {
            addr: addr.to_string(),
        })
        .await?;
        Ok(true)
    }

    async fn remove_peer(&self, addr: &str) -> Result<bool> {
        if !self.fsm.snapshot().await.peers().contains(addr) {
            return Ok(false);
        }
        self.apply(Entry::RemovePeer {
            addr: addr.to_string(),
        })
        .await?;
        Ok(true)
    }

    async fn snapshot(&self) -> Result<u64> {
        let data = self.fsm.snapshot_bytes().await?;
        let index = self.fsm.applied_index();
        self.persist_snapshot(index, data).await?;

        // Compact the log, keeping a cache of recent entries.
        let mut inner = self.inner.lock().await;
        inner.snapshot_index = index;
        while inner.entries.len() > RAFT_LOG_CACHE_SIZE
            && inner.entries.front().is_some_and(|e| e.index <= index)
        {
            inner.entries.pop_front();
        }
        Ok(index)
    }

    async fn restore(&self, data: &[u8]) -> Result<()> {
        self.fsm.restore_bytes(data).await?;
        let applied = self.fsm.applied_index();
        let mut inner = self.inner.lock().await;
        if applied > inner.last_index {
            inner.last_index = applied;
        }
        inner.snapshot_index = applied;
        inner.entries.retain(|e| e.index > applied);
        Ok(())
    }
}
