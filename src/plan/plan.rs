use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A placement of one job on one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    pub id: Uuid,
    pub eval_id: Uuid,
    pub job_id: Uuid,
    pub node: String,
}

impl Allocation {
    pub fn new(eval_id: Uuid, job_id: Uuid, node: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            eval_id,
            job_id,
            node: node.into(),
        }
    }
}

/// A scheduler's proposed allocations, pending application to the log.
#[derive(Debug, Clone)]
pub struct Plan {
    pub eval_id: Uuid,
    pub job_id: Uuid,
    pub allocations: Vec<Allocation>,
}

/// Outcome of submitting a plan.
///
/// A non-zero `refresh_index` means the plan was computed against stale
/// state; the submitter should wait for that index and replan.
#[derive(Debug, Clone, Default)]
pub struct PlanResult {
    pub allocations_applied: usize,
    pub refresh_index: u64,
    pub index: u64,
}
