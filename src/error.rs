use thiserror::Error;

#[derive(Error, Debug)]
pub enum DroverError {
    #[error("Not the leader, current leader is {0:?}")]
    NotLeader(Option<String>),

    #[error("Enqueue is disabled, not the current leader")]
    EnqueueDisabled,

    #[error("State sync wait limit reached")]
    SyncTimeout,

    #[error("Shutdown in progress")]
    Shutdown,

    #[error("No path to region: {0}")]
    NoRegionPath(String),

    #[error("Raft error: {0}")]
    Raft(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, DroverError>;
