use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Unique name of this server within its region.
    pub node_name: String,
    /// Region this server participates in. Requests for other regions
    /// are rejected.
    pub region: String,
    /// Address advertised to peers, host:port format.
    pub advertise_addr: String,
    /// Bootstrap mode allows a single node to self-elect.
    pub bootstrap: bool,
    /// Dev mode keeps the log and snapshot store purely in-memory.
    pub dev_mode: bool,
    /// Base directory for durable raft state (ignored in dev mode).
    pub data_dir: PathBuf,
    /// Scheduler classes the local workers will dequeue for.
    pub enabled_schedulers: Vec<String>,
    /// Number of scheduling workers to run.
    pub num_workers: usize,
    /// Interval between full membership reconciliation passes.
    pub reconcile_interval: Duration,
    /// How long a dequeued evaluation may remain unacked before the
    /// broker nacks it on the worker's behalf.
    pub eval_visibility_timeout: Duration,
    /// Deliveries after which an evaluation is marked failed.
    pub eval_delivery_limit: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            node_name: "drover-1".to_string(),
            region: "global".to_string(),
            advertise_addr: "127.0.0.1:4647".to_string(),
            bootstrap: false,
            dev_mode: false,
            data_dir: PathBuf::from("/var/lib/drover"),
            enabled_schedulers: vec!["service".to_string(), "batch".to_string()],
            num_workers: 4,
            reconcile_interval: Duration::from_secs(60),
            eval_visibility_timeout: Duration::from_secs(60),
            eval_delivery_limit: 3,
        }
    }
}

impl ServerConfig {
    pub fn new(node_name: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            region: region.into(),
            ..Default::default()
        }
    }

    /// Configuration for a single in-memory bootstrap node.
    pub fn dev(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            bootstrap: true,
            dev_mode: true,
            ..Default::default()
        }
    }

    pub fn with_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.eval_visibility_timeout = timeout;
        self
    }
}
