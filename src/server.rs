use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::error::{DroverError, Result};
use crate::eval::{EvalBroker, EvalStatus, Evaluation};
use crate::fsm::{Entry, Fsm};
use crate::membership::{Member, MembershipSource, StaticMembership};
use crate::plan::{Plan, PlanQueue, PlanResult};
use crate::raft::{LocalRaft, RaftHandle};
use crate::worker::Worker;

/// The scheduling core of one server: the replicated log and FSM, the
/// leader-only evaluation broker and plan queue, the leader lifecycle,
/// and the worker pool.
pub struct Server {
    pub config: ServerConfig,
    pub(crate) raft: Arc<dyn RaftHandle>,
    pub(crate) fsm: Arc<Fsm>,
    pub(crate) eval_broker: EvalBroker,
    pub(crate) plan_queue: PlanQueue,
    pub(crate) membership: Arc<dyn MembershipSource>,
    pub(crate) reconcile_tx: mpsc::Sender<Member>,
    pub(crate) reconcile_rx: Mutex<mpsc::Receiver<Member>>,
    pub(crate) leader_epoch: AtomicU64,
    pub(crate) shutdown: CancellationToken,
    worker_handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    /// Construct and start a server around an existing log handle and
    /// membership source. Spawns the leadership monitor, the membership
    /// event pump and the worker pool.
    pub fn new(
        config: ServerConfig,
        fsm: Arc<Fsm>,
        raft: Arc<dyn RaftHandle>,
        membership: Arc<dyn MembershipSource>,
        membership_events: mpsc::Receiver<Member>,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>> {
        let (reconcile_tx, reconcile_rx) = mpsc::channel(64);
        let server = Arc::new(Self {
            eval_broker: EvalBroker::new(
                config.eval_visibility_timeout,
                config.eval_delivery_limit,
            ),
            plan_queue: PlanQueue::new(),
            config,
            raft,
            fsm,
            membership,
            reconcile_tx,
            reconcile_rx: Mutex::new(reconcile_rx),
            leader_epoch: AtomicU64::new(0),
            shutdown,
            worker_handles: std::sync::Mutex::new(Vec::new()),
        });

        let monitor = server.clone();
        tokio::spawn(async move {
            monitor.monitor_leadership().await;
        });

        let pump = server.clone();
        tokio::spawn(async move {
            pump.membership_event_pump(membership_events).await;
        });

        {
            let mut handles = server.worker_handles.lock().unwrap();
            for worker_id in 0..server.config.num_workers {
                handles.push(Worker::spawn(server.clone(), worker_id));
            }
        }

        Ok(server)
    }

    /// A standalone single-node server: local log (in-memory in dev
    /// mode, snapshots on disk otherwise) and static membership seeded
    /// with ourselves. Returns the concrete handles so callers can drive
    /// membership and, in tests, leadership.
    pub fn standalone(
        config: ServerConfig,
        shutdown: CancellationToken,
    ) -> Result<(Arc<Server>, Arc<LocalRaft>, Arc<StaticMembership>)> {
        let fsm = Arc::new(Fsm::new());
        let raft = if config.dev_mode {
            LocalRaft::new_inmem(fsm.clone())
        } else {
            LocalRaft::new_durable(fsm.clone(), &config.data_dir)?
        };

        let (membership, events) = StaticMembership::new();
        let mut member = Member::server(
            config.node_name.clone(),
            config.advertise_addr.clone(),
            config.region.clone(),
        );
        if config.bootstrap {
            member = member.with_bootstrap();
            raft.bootstrap();
        }
        membership.set_member(member);

        let server = Self::new(
            config,
            fsm,
            raft.clone(),
            membership.clone(),
            events,
            shutdown,
        )?;
        Ok((server, raft, membership))
    }

    /// Forward membership events to the reconcile channel while we hold
    /// leadership. A full reconcile pass picks up anything dropped here.
    async fn membership_event_pump(&self, mut events: mpsc::Receiver<Member>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => {
                    let Some(member) = event else { break };
                    if self.raft.is_leader() {
                        let _ = self.reconcile_tx.try_send(member);
                    }
                }
            }
        }
    }

    pub fn is_leader(&self) -> bool {
        self.raft.is_leader()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn eval_broker(&self) -> &EvalBroker {
        &self.eval_broker
    }

    pub fn fsm(&self) -> &Arc<Fsm> {
        &self.fsm
    }

    /// Cancel the shutdown token and wait for the worker pool to drain.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down server");
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.worker_handles.lock().unwrap();
            guard.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    fn check_region(&self, region: &str) -> Result<()> {
        if region != self.config.region {
            return Err(DroverError::NoRegionPath(region.to_string()));
        }
        Ok(())
    }

    fn check_leader(&self) -> Result<()> {
        if !self.raft.is_leader() {
            return Err(DroverError::NotLeader(self.raft.leader_hint()));
        }
        Ok(())
    }

    // RPC surface. The wire transport is out of scope; these methods
    // carry the exact leader-only semantics the endpoints expose.

    /// Eval.Enqueue: record the evaluation through the log, then make it
    /// available to workers. Returns the evaluation's modify index.
    pub async fn eval_enqueue(&self, mut eval: Evaluation, region: &str) -> Result<u64> {
        self.check_region(region)?;
        self.check_leader()?;
        let index = self
            .raft
            .apply(Entry::UpsertEvaluation { eval: eval.clone() })
            .await?;
        eval.modify_index = index;
        self.eval_broker.enqueue(eval)?;
        Ok(index)
    }

    /// Eval.Dequeue: block up to `timeout` for a pending evaluation in
    /// one of the given scheduler classes.
    pub async fn eval_dequeue(
        &self,
        schedulers: &[String],
        timeout: Duration,
        region: &str,
    ) -> Result<Option<(Evaluation, Uuid)>> {
        self.check_region(region)?;
        self.check_leader()?;
        self.eval_broker.dequeue(schedulers, timeout).await
    }

    /// Eval.Ack: complete the delivery, recording the terminal status
    /// through the log.
    pub async fn eval_ack(&self, eval_id: Uuid, receipt: Uuid, region: &str) -> Result<()> {
        self.check_region(region)?;
        self.check_leader()?;
        if self.eval_broker.ack(eval_id, receipt)? {
            self.raft
                .apply(Entry::UpdateEvaluation {
                    eval_id,
                    status: EvalStatus::Complete,
                })
                .await?;
        }
        Ok(())
    }

    /// Eval.Nack: return the delivery to the pending queue.
    pub async fn eval_nack(&self, eval_id: Uuid, receipt: Uuid, region: &str) -> Result<()> {
        self.check_region(region)?;
        self.check_leader()?;
        self.eval_broker.nack(eval_id, receipt)
    }

    /// Plan.Submit: queue the plan and wait for the applier's verdict.
    pub async fn plan_submit(&self, plan: Plan, region: &str) -> Result<PlanResult> {
        self.check_region(region)?;
        self.check_leader()?;
        let rx = self.plan_queue.enqueue(plan)?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(DroverError::Internal(
                "plan applier dropped the plan".to_string(),
            )),
        }
    }

    /// Node.Register: make a node eligible for placements.
    pub async fn node_register(&self, name: &str, addr: &str, region: &str) -> Result<u64> {
        self.check_region(region)?;
        self.check_leader()?;
        self.raft
            .apply(Entry::RegisterNode {
                name: name.to_string(),
                addr: addr.to_string(),
            })
            .await
    }

    /// Node.Deregister: withdraw a node from placement.
    pub async fn node_deregister(&self, name: &str, region: &str) -> Result<u64> {
        self.check_region(region)?;
        self.check_leader()?;
        self.raft
            .apply(Entry::DeregisterNode {
                name: name.to_string(),
            })
            .await
    }
}
