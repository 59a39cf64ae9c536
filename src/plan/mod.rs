pub mod plan;
pub mod queue;

pub use plan::{Allocation, Plan, PlanResult};
pub use queue::{PendingPlan, PlanQueue};
