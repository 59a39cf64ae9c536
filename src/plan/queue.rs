use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::error::{DroverError, Result};
use crate::plan::{Plan, PlanResult};

/// A queued plan together with the responder its submitter is blocked on.
pub struct PendingPlan {
    pub plan: Plan,
    tx: oneshot::Sender<Result<PlanResult>>,
}

impl PendingPlan {
    pub fn respond(self, result: Result<PlanResult>) {
        let _ = self.tx.send(result);
    }
}

/// Leader-only FIFO of plans awaiting application to the log.
#[derive(Clone)]
pub struct PlanQueue {
    shared: Arc<Shared>,
}

struct Shared {
    inner: Mutex<Inner>,
    wake: watch::Sender<u64>,
}

struct Inner {
    enabled: bool,
    pending: VecDeque<PendingPlan>,
}

impl PlanQueue {
    pub fn new() -> Self {
        let (wake, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    enabled: false,
                    pending: VecDeque::new(),
                }),
                wake,
            }),
        }
    }

    pub fn enabled(&self) -> bool {
        self.shared.inner.lock().unwrap().enabled
    }

    pub fn depth(&self) -> usize {
        self.shared.inner.lock().unwrap().pending.len()
    }

    /// Gate the queue on leadership. Disabling fails every pending plan
    /// with `NotLeader` and wakes the consumer.
    pub fn set_enabled(&self, enabled: bool) {
        let drained: Vec<PendingPlan> = {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.enabled == enabled {
                return;
            }
            inner.enabled = enabled;
            if enabled {
                Vec::new()
            } else {
                inner.pending.drain(..).collect()
            }
        };
        for pending in drained {
            pending.respond(Err(DroverError::NotLeader(None)));
        }
        self.shared.wake.send_modify(|v| *v += 1);
    }

    /// Queue a plan for application. The returned receiver resolves with
    /// the plan result once the applier has processed it.
    pub fn enqueue(&self, plan: Plan) -> Result<oneshot::Receiver<Result<PlanResult>>> {
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.shared.inner.lock().unwrap();
            if !inner.enabled {
                return Err(DroverError::EnqueueDisabled);
            }
            inner.pending.push_back(PendingPlan { plan, tx });
        }
        self.shared.wake.send_modify(|v| *v += 1);
        Ok(rx)
    }

    /// Block until a plan is available. Returns `None` once the queue is
    /// disabled or the token is cancelled.
    pub async fn dequeue(&self, shutdown: &CancellationToken) -> Option<PendingPlan> {
        let mut wake_rx = self.shared.wake.subscribe();
        loop {
            {
                let mut inner = self.shared.inner.lock().unwrap();
                if !inner.enabled {
                    return None;
                }
                if let Some(pending) = inner.pending.pop_front() {
                    return Some(pending);
                }
            }
            tokio::select! {
                _ = shutdown.cancelled() => return None,
                changed = wake_rx.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }
}

impl Default for PlanQueue {
    fn default() -> Self {
        Self::new()
    }
}
