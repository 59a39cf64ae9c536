use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvalStatus {
    Pending,
    Unacked,
    Complete,
    Failed,
}

impl std::fmt::Display for EvalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvalStatus::Pending => write!(f, "pending"),
            EvalStatus::Unacked => write!(f, "unacked"),
            EvalStatus::Complete => write!(f, "complete"),
            EvalStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A unit of scheduling work. One evaluation drives one scheduler
/// invocation, which produces zero or one plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub id: Uuid,
    /// Scheduler class that will process this evaluation.
    pub eval_type: String,
    /// Higher runs first within a class.
    pub priority: i32,
    /// The job this evaluation wants placed.
    pub job_id: Uuid,
    /// Log index at which this evaluation became visible. Workers wait
    /// for their local state to reach this index before scheduling.
    pub modify_index: u64,
    pub status: EvalStatus,
    /// Number of times this evaluation has been dequeued.
    pub delivery_count: u32,
    pub created_at: DateTime<Utc>,
}

impl Evaluation {
    pub fn new(eval_type: impl Into<String>, job_id: Uuid, priority: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            eval_type: eval_type.into(),
            priority,
            job_id,
            modify_index: 0,
            status: EvalStatus::Pending,
            delivery_count: 0,
            created_at: Utc::now(),
        }
    }
}
