use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::membership::{Member, MemberStatus};
use crate::planner;
use crate::server::Server;

/// Delay before retrying a failed barrier or establishment while still
/// holding leadership.
const ESTABLISH_BACKOFF: Duration = Duration::from_secs(1);

impl Server {
    /// Monitor whether we acquire or lose our role as the leader in the
    /// cluster. There is work the leader is expected to do, so we must
    /// react to changes.
    pub(crate) async fn monitor_leadership(self: Arc<Self>) {
        let mut leader_rx = self.raft.leadership();
        let mut leader_task: Option<(CancellationToken, JoinHandle<()>)> = None;

        loop {
            // Reconcile the leader loop with the current edge. Checking
            // the value first also covers leadership gained before we
            // subscribed.
            let is_leader = *leader_rx.borrow_and_update();
            if is_leader && leader_task.is_none() {
                let token = self.shutdown.child_token();
                let srv = self.clone();
                let loop_token = token.clone();
                let handle = tokio::spawn(async move {
                    srv.leader_loop(loop_token).await;
                });
                leader_task = Some((token, handle));
                tracing::info!("Cluster leadership acquired");
            } else if !is_leader {
                if let Some((token, handle)) = leader_task.take() {
                    token.cancel();
                    let _ = handle.await;
                    tracing::info!("Cluster leadership lost");
                }
            }

            tokio::select! {
                changed = leader_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = self.shutdown.cancelled() => {
                    if let Some((token, handle)) = leader_task.take() {
                        token.cancel();
                        let _ = handle.await;
                    }
                    break;
                }
            }
        }
    }

    /// Runs as long as we are the leader. Two phases: a reconcile phase
    /// that catches the FSM up and converges membership, and a wait
    /// phase that sleeps until the interval timer, a member event, or
    /// loss of leadership.
    async fn leader_loop(self: Arc<Self>, stop: CancellationToken) {
        let mut established = false;
        // Held for the duration of leadership; there is only ever one
        // leader loop at a time.
        let mut reconcile_rx = self.reconcile_rx.lock().await;

        'reconcile: loop {
            // Apply a barrier so our FSM reflects everything committed
            // before our election.
            if let Err(e) = self.raft.barrier().await {
                tracing::error!(error = %e, "Failed to wait for barrier");
                tokio::select! {
                    _ = stop.cancelled() => break 'reconcile,
                    _ = self.shutdown.cancelled() => break 'reconcile,
                    _ = tokio::time::sleep(ESTABLISH_BACKOFF) => continue 'reconcile,
                }
            }

            if !established {
                if let Err(e) = self.establish_leadership(&stop) {
                    tracing::error!(error = %e, "Failed to establish leadership");
                    tokio::select! {
                        _ = stop.cancelled() => break 'reconcile,
                        _ = self.shutdown.cancelled() => break 'reconcile,
                        _ = tokio::time::sleep(ESTABLISH_BACKOFF) => continue 'reconcile,
                    }
                }
                established = true;
            }

            // Member events are only consumed here, after a full pass
            // has already run under this leadership.
            self.reconcile().await;

            let interval = tokio::time::sleep(self.config.reconcile_interval);
            tokio::pin!(interval);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break 'reconcile,
                    _ = self.shutdown.cancelled() => break 'reconcile,
                    _ = &mut interval => continue 'reconcile,
                    member = reconcile_rx.recv() => {
                        match member {
                            Some(member) => self.reconcile_member(&member).await,
                            None => break 'reconcile,
                        }
                    }
                }
            }
        }

        drop(reconcile_rx);
        self.revoke_leadership();
    }

    /// Invoked once we become leader and the initial barrier has been
    /// applied. Brings the leader-only subsystems online under a new
    /// epoch.
    fn establish_leadership(self: &Arc<Self>, stop: &CancellationToken) -> Result<()> {
        let epoch = self.leader_epoch.fetch_add(1, Ordering::SeqCst) + 1;

        self.plan_queue.set_enabled(true);
        // Plan application is serialized through a single applier per
        // epoch; its token dies with this leadership.
        let srv = self.clone();
        let token = stop.child_token();
        tokio::spawn(async move {
            planner::plan_apply_loop(srv, token).await;
        });

        self.eval_broker.set_enabled(true);
        tracing::info!(epoch, "Leadership established");
        Ok(())
    }

    /// Invoked once we step down. Disabling the broker releases held
    /// evaluations and unblocks waiters before this returns, so no
    /// worker is mid-delivery under the old epoch afterwards.
    fn revoke_leadership(&self) {
        self.plan_queue.set_enabled(false);
        self.eval_broker.set_enabled(false);
        tracing::info!("Leadership revoked");
    }

    /// Reconcile the differences between gossip membership and the
    /// strongly consistent peer set. Best effort: member-level failures
    /// are logged and do not abort the pass.
    async fn reconcile(&self) {
        for member in self.membership.members() {
            self.reconcile_member(&member).await;
        }
    }

    async fn reconcile_member(&self, member: &Member) {
        // Only servers of our own region participate in consensus.
        if !member.server || member.region != self.config.region {
            return;
        }
        if member.name == self.config.node_name {
            return;
        }
        let result = match member.status {
            MemberStatus::Alive => self.add_raft_peer(member).await,
            MemberStatus::Left | MemberStatus::Reaped => self.remove_raft_peer(member).await,
            MemberStatus::Failed => Ok(()),
        };
        if let Err(e) = result {
            tracing::error!(member = %member.name, error = %e, "Failed to reconcile member");
        }
    }

    async fn add_raft_peer(&self, member: &Member) -> Result<()> {
        // Refuse to wire together two clusters that were bootstrapped
        // independently.
        if member.bootstrap {
            for other in self.membership.members() {
                if other.server && other.name != member.name && other.bootstrap {
                    tracing::error!(
                        member = %member.name,
                        other = %other.name,
                        "Both members are in bootstrap mode, only one node should be; not adding raft peer"
                    );
                    return Ok(());
                }
            }
        }
        if self.raft.add_peer(&member.addr).await? {
            tracing::info!(member = %member.name, addr = %member.addr, "Added raft peer");
        }
        Ok(())
    }

    async fn remove_raft_peer(&self, member: &Member) -> Result<()> {
        if self.raft.remove_peer(&member.addr).await? {
            tracing::info!(member = %member.name, addr = %member.addr, "Removed raft peer");
        }
        Ok(())
    }
}
