pub mod broker;
pub mod eval;

pub use broker::{BrokerStats, EvalBroker};
pub use eval::{EvalStatus, Evaluation};
