use async_trait::async_trait;

use crate::error::{DroverError, Result};
use crate::eval::Evaluation;
use crate::fsm::StateSnapshot;
use crate::plan::{Allocation, Plan, PlanResult};

/// Plan attempts per evaluation before the scheduler gives up.
const MAX_PLAN_ATTEMPTS: usize = 5;

/// The planning surface a worker exposes to schedulers.
#[async_trait]
pub trait Planner: Send + Sync {
    /// Submit a plan for consideration. When the result carries a
    /// non-zero `refresh_index`, the accompanying snapshot is fresh as of
    /// that index and the scheduler should replan against it in place.
    async fn submit_plan(&self, plan: Plan) -> Result<(PlanResult, Option<StateSnapshot>)>;
}

/// A pluggable scheduling strategy. One invocation per evaluation,
/// producing zero or one plan.
#[async_trait]
pub trait Scheduler: Send {
    async fn process(
        &mut self,
        eval: &Evaluation,
        snapshot: StateSnapshot,
        planner: &dyn Planner,
    ) -> Result<()>;
}

/// Instantiate the scheduler registered for an evaluation type.
pub fn new_scheduler(eval_type: &str) -> Result<Box<dyn Scheduler>> {
    match eval_type {
        "service" | "batch" => Ok(Box::<GenericScheduler>::default()),
        other => Err(DroverError::Scheduler(format!(
            "unknown scheduler type {other:?}"
        ))),
    }
}

/// Built-in placement strategy: put the evaluation's job on the least
/// loaded alive node.
#[derive(Debug, Default)]
pub struct GenericScheduler;

#[async_trait]
impl Scheduler for GenericScheduler {
    async fn process(
        &mut self,
        eval: &Evaluation,
        mut snapshot: StateSnapshot,
        planner: &dyn Planner,
    ) -> Result<()> {
        for attempt in 1..=MAX_PLAN_ATTEMPTS {
            if snapshot.allocation_for_job(&eval.job_id).is_some() {
                // Already placed, nothing to plan.
                return Ok(());
            }

            let node = snapshot
                .nodes()
                .min_by_key(|n| snapshot.allocation_count_for_node(&n.name))
                .ok_or_else(|| {
                    DroverError::Scheduler("no nodes available for placement".to_string())
                })?;
            let plan = Plan {
                eval_id: eval.id,
                job_id: eval.job_id,
                allocations: vec![Allocation::new(eval.id, eval.job_id, node.name.clone())],
            };

            let (result, refreshed) = planner.submit_plan(plan).await?;
            if result.refresh_index == 0 {
                tracing::debug!(eval_id = %eval.id, index = result.index, "Plan applied");
                return Ok(());
            }

            let Some(fresh) = refreshed else {
                return Err(DroverError::Scheduler(
                    "planner requested refresh without a snapshot".to_string(),
                ));
            };
            tracing::debug!(
                eval_id = %eval.id,
                attempt,
                refresh_index = result.refresh_index,
                "Plan rejected as stale, replanning"
            );
            snapshot = fresh;
        }
        Err(DroverError::Scheduler(
            "plan attempts exhausted".to_string(),
        ))
    }
}
