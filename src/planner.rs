use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::fsm::{Entry, StateSnapshot};
use crate::plan::{Allocation, Plan, PlanResult};
use crate::server::Server;

enum Verdict {
    Apply(Vec<Allocation>),
    Refresh,
}

/// Validate a plan against the current state. A plan is stale when a
/// target node is gone or its job already has a conflicting allocation,
/// e.g. from a concurrent plan that won the race through the log.
fn evaluate_plan(snap: &StateSnapshot, plan: &Plan) -> Verdict {
    for alloc in &plan.allocations {
        if snap.node(&alloc.node).is_none() {
            return Verdict::Refresh;
        }
        if snap.allocation_for_job(&alloc.job_id).is_some() {
            return Verdict::Refresh;
        }
    }
    Verdict::Apply(plan.allocations.clone())
}

/// Consume the plan queue for one leadership epoch.
///
/// One applier per epoch: validation and log application are serialized
/// here, so no two plans for the same resource are ever applied
/// concurrently. Exits when the queue is disabled or the epoch token is
/// cancelled.
pub(crate) async fn plan_apply_loop(srv: Arc<Server>, token: CancellationToken) {
    tracing::debug!("Plan applier started");
    while let Some(pending) = srv.plan_queue.dequeue(&token).await {
        let snap = srv.fsm.snapshot().await;
        let plan = &pending.plan;
        let result = match evaluate_plan(&snap, plan) {
            Verdict::Refresh => {
                tracing::debug!(
                    eval_id = %plan.eval_id,
                    refresh_index = snap.applied_index,
                    "Plan rejected against stale state"
                );
                Ok(PlanResult {
                    allocations_applied: 0,
                    refresh_index: snap.applied_index,
                    index: 0,
                })
            }
            Verdict::Apply(allocations) => {
                let count = allocations.len();
                srv.raft
                    .apply(Entry::ApplyPlan {
                        eval_id: plan.eval_id,
                        allocations,
                    })
                    .await
                    .map(|index| PlanResult {
                        allocations_applied: count,
                        refresh_index: 0,
                        index,
                    })
            }
        };
        pending.respond(result);
    }
    tracing::debug!("Plan applier stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::Fsm;
    use uuid::Uuid;

    async fn snapshot_with_node(name: &str) -> StateSnapshot {
        let fsm = Fsm::new();
        fsm.apply(
            1,
            &Entry::RegisterNode {
                name: name.to_string(),
                addr: "10.0.0.1:4647".to_string(),
            },
        )
        .await;
        fsm.snapshot().await
    }

    fn plan_for(node: &str) -> Plan {
        let eval_id = Uuid::new_v4();
        let job_id = Uuid::new_v4();
        Plan {
            eval_id,
            job_id,
            allocations: vec![Allocation::new(eval_id, job_id, node)],
        }
    }

    #[tokio::test]
    async fn test_plan_against_live_node_applies() {
        let snap = snapshot_with_node("n1").await;
        assert!(matches!(
            evaluate_plan(&snap, &plan_for("n1")),
            Verdict::Apply(_)
        ));
    }

    #[tokio::test]
    async fn test_plan_against_missing_node_is_stale() {
        let snap = snapshot_with_node("n1").await;
        assert!(matches!(
            evaluate_plan(&snap, &plan_for("n2")),
            Verdict::Refresh
        ));
    }

    #[tokio::test]
    async fn test_conflicting_allocation_is_stale() {
        let fsm = Fsm::new();
        fsm.apply(
            1,
            &Entry::RegisterNode {
                name: "n1".to_string(),
                addr: "10.0.0.1:4647".to_string(),
            },
        )
        .await;

        let plan = plan_for("n1");
        // The job already got placed by a competing plan.
        fsm.apply(
            2,
            &Entry::ApplyPlan {
                eval_id: Uuid::new_v4(),
                allocations: vec![Allocation::new(Uuid::new_v4(), plan.job_id, "n1")],
            },
        )
        .await;

        let snap = fsm.snapshot().await;
        assert!(matches!(evaluate_plan(&snap, &plan), Verdict::Refresh));
    }
}
