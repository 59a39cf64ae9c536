use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use uuid::Uuid;

use crate::error::{DroverError, Result};
use crate::eval::{EvalStatus, Evaluation};
use crate::plan::Allocation;

/// Commands replicated through the log. The FSM mutates only by applying
/// these, so every server that applies the same prefix holds the same
/// state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Entry {
    RegisterNode { name: String, addr: String },
    DeregisterNode { name: String },
    UpsertEvaluation { eval: Evaluation },
    UpdateEvaluation { eval_id: Uuid, status: EvalStatus },
    ApplyPlan { eval_id: Uuid, allocations: Vec<Allocation> },
    AddPeer { addr: String },
    RemovePeer { addr: String },
    Noop,
}

/// A schedulable node known to the state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub name: String,
    pub addr: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct FsmState {
    nodes: HashMap<String, NodeRecord>,
    allocations: HashMap<Uuid, Allocation>,
    evals: HashMap<Uuid, Evaluation>,
    peers: BTreeSet<String>,
}

/// Deterministic state derived from the log.
///
/// Single-writer: only the log applier calls [`Fsm::apply`]. Readers take
/// consistent snapshots; the applied index is published on a watch
/// channel so index waiters block instead of polling.
pub struct Fsm {
    state: RwLock<FsmState>,
    applied_tx: watch::Sender<u64>,
}

impl Fsm {
    pub fn new() -> Self {
        let (applied_tx, _) = watch::channel(0);
        Self {
            state: RwLock::new(FsmState::default()),
            applied_tx,
        }
    }

    pub fn applied_index(&self) -> u64 {
        *self.applied_tx.borrow()
    }

    /// Apply a committed entry at the given index. Must be called with
    /// strictly increasing indexes by a single applier.
    pub async fn apply(&self, index: u64, entry: &Entry) {
        let mut state = self.state.write().await;
        match entry {
            Entry::RegisterNode { name, addr } => {
                state.nodes.insert(
                    name.clone(),
                    NodeRecord {
                        name: name.clone(),
                        addr: addr.clone(),
                    },
                );
            }
            Entry::DeregisterNode { name } => {
                state.nodes.remove(name);
            }
            Entry::UpsertEvaluation { eval } => {
                let mut eval = eval.clone();
                eval.modify_index = index;
                state.evals.insert(eval.id, eval);
            }
            Entry::UpdateEvaluation { eval_id, status } => {
                if let Some(eval) = state.evals.get_mut(eval_id) {
                    eval.status = *status;
                    eval.modify_index = index;
                }
            }
            Entry::ApplyPlan { allocations, .. } => {
                for alloc in allocations {
                    state.allocations.insert(alloc.id, alloc.clone());
                }
            }
            Entry::AddPeer { addr } => {
                state.peers.insert(addr.clone());
            }
            Entry::RemovePeer { addr } => {
                state.peers.remove(addr);
            }
            Entry::Noop => {}
        }
        // Publish while still holding the write lock so a snapshot taken
        // at index N always contains the effects of entry N.
        self.applied_tx.send_replace(index);
    }

    /// Block until the applied index reaches `index` or the timeout
    /// elapses.
    pub async fn wait_for_index(&self, index: u64, timeout: Duration) -> Result<()> {
        let mut rx = self.applied_tx.subscribe();
        let result = match tokio::time::timeout(timeout, rx.wait_for(|applied| *applied >= index)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(DroverError::Shutdown),
            Err(_) => Err(DroverError::SyncTimeout),
        };
        result
    }

    /// Take a consistent read view of the state together with the index
    /// it reflects.
    pub async fn snapshot(&self) -> StateSnapshot {
        let state = self.state.read().await;
        StateSnapshot {
            applied_index: *self.applied_tx.borrow(),
            nodes: state.nodes.clone(),
            allocations: state.allocations.clone(),
            evals: state.evals.clone(),
            peers: state.peers.clone(),
        }
    }

    pub async fn snapshot_bytes(&self) -> Result<Vec<u8>> {
        let snap = self.snapshot().await;
        serde_json::to_vec(&snap).map_err(|e| DroverError::Internal(e.to_string()))
    }

    /// Replace the state wholesale from a serialized snapshot.
    pub async fn restore_bytes(&self, data: &[u8]) -> Result<()> {
        let snap: StateSnapshot =
            serde_json::from_slice(data).map_err(|e| DroverError::Internal(e.to_string()))?;
        let mut state = self.state.write().await;
        state.nodes = snap.nodes;
        state.allocations = snap.allocations;
        state.evals = snap.evals;
        state.peers = snap.peers;
        self.applied_tx.send_replace(snap.applied_index);
        Ok(())
    }
}

impl Default for Fsm {
    fn default() -> Self {
        Self::new()
    }
}

/// A consistent, immutable view of the FSM at a known applied index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub applied_index: u64,
    nodes: HashMap<String, NodeRecord>,
    allocations: HashMap<Uuid, Allocation>,
    evals: HashMap<Uuid, Evaluation>,
    peers: BTreeSet<String>,
}

impl StateSnapshot {
    pub fn node(&self, name: &str) -> Option<&NodeRecord> {
        self.nodes.get(name)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.values()
    }

    pub fn eval(&self, id: &Uuid) -> Option<&Evaluation> {
        self.evals.get(id)
    }

    pub fn allocation_count_for_node(&self, name: &str) -> usize {
        self.allocations.values().filter(|a| a.node == name).count()
    }

    pub fn allocation_for_job(&self, job_id: &Uuid) -> Option<&Allocation> {
        self.allocations.values().find(|a| a.job_id == *job_id)
    }

    pub fn peers(&self) -> &BTreeSet<String> {
        &self.peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register(name: &str) -> Entry {
        Entry::RegisterNode {
            name: name.to_string(),
            addr: "10.0.0.1:4647".to_string(),
        }
    }

    #[tokio::test]
    async fn test_apply_register_and_deregister_node() {
        let fsm = Fsm::new();
        fsm.apply(1, &register("n1")).await;
        assert_eq!(fsm.applied_index(), 1);

        let snap = fsm.snapshot().await;
        assert!(snap.node("n1").is_some());
        assert_eq!(snap.applied_index, 1);

        fsm.apply(
            2,
            &Entry::DeregisterNode {
                name: "n1".to_string(),
            },
        )
        .await;
        assert!(fsm.snapshot().await.node("n1").is_none());
    }

    #[tokio::test]
    async fn test_upsert_evaluation_stamps_modify_index() {
        let fsm = Fsm::new();
        let eval = Evaluation::new("service", Uuid::new_v4(), 50);
        let id = eval.id;
        fsm.apply(7, &Entry::UpsertEvaluation { eval }).await;

        let snap = fsm.snapshot().await;
        assert_eq!(snap.eval(&id).unwrap().modify_index, 7);
        assert_eq!(snap.eval(&id).unwrap().status, EvalStatus::Pending);
    }

    #[tokio::test]
    async fn test_apply_plan_inserts_allocations() {
        let fsm = Fsm::new();
        let eval_id = Uuid::new_v4();
        let job_id = Uuid::new_v4();
        let alloc = Allocation::new(eval_id, job_id, "n1");
        fsm.apply(
            1,
            &Entry::ApplyPlan {
                eval_id,
                allocations: vec![alloc],
            },
        )
        .await;

        let snap = fsm.snapshot().await;
        assert_eq!(snap.allocation_count_for_node("n1"), 1);
        assert_eq!(snap.allocation_for_job(&job_id).unwrap().node, "n1");
    }

    #[tokio::test]
    async fn test_peer_set_follows_log() {
        let fsm = Fsm::new();
        fsm.apply(
            1,
            &Entry::AddPeer {
                addr: "10.0.0.2:4647".to_string(),
            },
        )
        .await;
        assert!(fsm.snapshot().await.peers().contains("10.0.0.2:4647"));

        fsm.apply(
            2,
            &Entry::RemovePeer {
                addr: "10.0.0.2:4647".to_string(),
            },
        )
        .await;
        assert!(fsm.snapshot().await.peers().is_empty());
    }

    #[tokio::test]
    async fn test_wait_for_index_returns_once_applied() {
        let fsm = std::sync::Arc::new(Fsm::new());

        let waiter = fsm.clone();
        let handle = tokio::spawn(async move {
            waiter.wait_for_index(2, Duration::from_secs(5)).await
        });

        fsm.apply(1, &Entry::Noop).await;
        fsm.apply(2, &Entry::Noop).await;
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_index_times_out() {
        let fsm = Fsm::new();
        let err = fsm
            .wait_for_index(5, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, DroverError::SyncTimeout));
    }

    #[tokio::test]
    async fn test_snapshot_restore_roundtrip() {
        let fsm = Fsm::new();
        fsm.apply(1, &register("n1")).await;
        fsm.apply(
            2,
            &Entry::AddPeer {
                addr: "10.0.0.2:4647".to_string(),
            },
        )
        .await;
        let bytes = fsm.snapshot_bytes().await.unwrap();

        let restored = Fsm::new();
        restored.restore_bytes(&bytes).await.unwrap();
        assert_eq!(restored.applied_index(), 2);
        let snap = restored.snapshot().await;
        assert!(snap.node("n1").is_some());
        assert!(snap.peers().contains("10.0.0.2:4647"));
    }
}
