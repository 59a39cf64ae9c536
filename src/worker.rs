use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{DroverError, Result};
use crate::eval::Evaluation;
use crate::fsm::StateSnapshot;
use crate::plan::{Plan, PlanResult};
use crate::scheduler::{new_scheduler, Planner};
use crate::server::Server;

/// Baseline time for exponential backoff.
pub const BACKOFF_BASELINE: Duration = Duration::from_millis(20);

/// Limit of the exponential backoff.
pub const BACKOFF_LIMIT: Duration = Duration::from_secs(5);

/// Timeout on an evaluation dequeue so we can check for a shutdown
/// event.
pub const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(500);

/// Limit of time we will wait for raft replication to catch up to the
/// evaluation. Used to fast-nack and let another worker pick it up.
pub const RAFT_SYNC_LIMIT: Duration = Duration::from_secs(5);

/// Backoff after `failures` consecutive errors:
/// `min(limit, 2^(2·failures) · baseline)`.
pub fn backoff_delay(failures: u32) -> Duration {
    let shift = (2 * failures).min(16);
    std::cmp::min(BACKOFF_BASELINE * (1u32 << shift), BACKOFF_LIMIT)
}

/// A single-threaded scheduling worker. Several run per server, leader
/// or follower alike; they dequeue pending evaluations, invoke
/// schedulers, submit plans, and drive the lifecycle around making
/// allocations. They bridge scheduler business logic to the plumbing
/// that makes it work.
pub struct Worker {
    srv: Arc<Server>,
    id: usize,
    failures: AtomicU32,
    shutdown: CancellationToken,
}

impl Worker {
    /// Start a worker associated with the given server.
    pub fn spawn(srv: Arc<Server>, id: usize) -> JoinHandle<()> {
        let worker = Worker {
            shutdown: srv.shutdown_token().child_token(),
            srv,
            id,
            failures: AtomicU32::new(0),
        };
        tokio::spawn(worker.run())
    }

    async fn run(self) {
        tracing::debug!(worker = self.id, "Worker started");
        loop {
            // Dequeue a pending evaluation.
            let Some((eval, receipt)) = self.dequeue_evaluation().await else {
                break;
            };

            if self.srv.is_shutdown() {
                self.send_ack(&eval, receipt, false).await;
                break;
            }

            // Wait for the log to catch up to the evaluation.
            if let Err(e) = self.wait_for_index(eval.modify_index, RAFT_SYNC_LIMIT).await {
                tracing::warn!(
                    worker = self.id,
                    eval_id = %eval.id,
                    error = %e,
                    "State sync failed, nacking evaluation"
                );
                self.send_ack(&eval, receipt, false).await;
                continue;
            }

            // Invoke the scheduler to determine placements.
            match self.invoke_scheduler(&eval).await {
                Ok(()) => self.send_ack(&eval, receipt, true).await,
                Err(e) => {
                    tracing::error!(
                        worker = self.id,
                        eval_id = %eval.id,
                        error = %e,
                        "Failed to process evaluation"
                    );
                    self.send_ack(&eval, receipt, false).await;
                }
            }
        }
        tracing::debug!(worker = self.id, "Worker stopped");
    }

    /// Fetch the next ready evaluation. Blocks with a short timeout so
    /// shutdown is observed promptly. Returns `None` on shutdown.
    async fn dequeue_evaluation(&self) -> Option<(Evaluation, Uuid)> {
        loop {
            if self.shutdown.is_cancelled() {
                return None;
            }
            let dequeue = self.srv.eval_dequeue(
                &self.srv.config.enabled_schedulers,
                DEQUEUE_TIMEOUT,
                &self.srv.config.region,
            );
            match dequeue.await {
                Ok(Some(delivery)) => {
                    self.backoff_reset();
                    return Some(delivery);
                }
                Ok(None) => {
                    self.backoff_reset();
                }
                Err(e) => {
                    tracing::error!(worker = self.id, error = %e, "Failed to dequeue evaluation");
                    if self.backoff_err().await {
                        return None;
                    }
                }
            }
        }
    }

    /// Ensure local state is at least as fresh as the given index.
    /// Needed before an evaluation starts, and again mid-stream when a
    /// plan failed against stale state.
    async fn wait_for_index(&self, index: u64, timeout: Duration) -> Result<()> {
        tokio::select! {
            res = self.srv.fsm.wait_for_index(index, timeout) => res,
            _ = self.shutdown.cancelled() => Err(DroverError::Shutdown),
        }
    }

    async fn invoke_scheduler(&self, eval: &Evaluation) -> Result<()> {
        let snapshot = self.srv.fsm.snapshot().await;
        let mut sched = new_scheduler(&eval.eval_type)?;
        sched.process(eval, snapshot, self).await
    }

    /// Best-effort ack or nack; errors are logged and swallowed.
    async fn send_ack(&self, eval: &Evaluation, receipt: Uuid, ack: bool) {
        let region = &self.srv.config.region;
        let (verb, result) = if ack {
            ("ack", self.srv.eval_ack(eval.id, receipt, region).await)
        } else {
            ("nack", self.srv.eval_nack(eval.id, receipt, region).await)
        };
        if let Err(e) = result {
            tracing::error!(
                worker = self.id,
                eval_id = %eval.id,
                action = verb,
                error = %e,
                "Failed to resolve evaluation"
            );
        }
    }

    /// Exponential backoff on error, maintained statefully per worker.
    /// Returns true when attempts should be abandoned due to shutdown.
    async fn backoff_err(&self) -> bool {
        let failures = self.failures.load(Ordering::Relaxed);
        let delay = backoff_delay(failures);
        if delay < BACKOFF_LIMIT {
            self.failures.store(failures + 1, Ordering::Relaxed);
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = self.shutdown.cancelled() => true,
        }
    }

    fn backoff_reset(&self) {
        self.failures.store(0, Ordering::Relaxed);
    }
}

#[async_trait]
impl Planner for Worker {
    /// Submit a plan for consideration, acting as the planner surface
    /// for the scheduler.
    async fn submit_plan(&self, plan: Plan) -> Result<(PlanResult, Option<StateSnapshot>)> {
        let eval_id = plan.eval_id;
        let result = match self.srv.plan_submit(plan, &self.srv.config.region).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(
                    worker = self.id,
                    eval_id = %eval_id,
                    error = %e,
                    "Failed to submit plan"
                );
                return Err(e);
            }
        };
        tracing::debug!(worker = self.id, eval_id = %eval_id, "Submitted plan");

        // A refresh index means we planned on stale data, e.g. a node
        // failed since planning started or allocations conflicted. Sync
        // to it and hand back a fresh snapshot for replanning.
        let mut refreshed = None;
        if result.refresh_index != 0 {
            self.wait_for_index(result.refresh_index, RAFT_SYNC_LIMIT)
                .await?;
            refreshed = Some(self.srv.fsm.snapshot().await);
        }
        Ok((result, refreshed))
    }
}
