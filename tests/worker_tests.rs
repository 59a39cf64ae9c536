mod support;

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use drover::error::Result;
use drover::eval::{EvalStatus, Evaluation};
use drover::fsm::{Entry, Fsm, StateSnapshot};
use drover::plan::{Plan, PlanResult};
use drover::scheduler::{new_scheduler, Planner};

use support::{dev_config, dev_server, wait_for_leadership, wait_until};

const REGION: &str = "global";

#[tokio::test]
async fn test_end_to_end_eval_processing() {
    // Enqueue an evaluation on a fresh bootstrap node; a
    // worker dequeues it, schedules a placement, and acks.
    let (server, _raft, _membership, _shutdown) = dev_server(dev_config("e2e").with_workers(2));
    wait_for_leadership(&server).await;
    server
        .node_register("n1", "10.0.0.5:4646", REGION)
        .await
        .unwrap();

    let job_id = Uuid::new_v4();
    let eval = Evaluation::new("service", job_id, 50);
    let eval_id = eval.id;
    let index = server.eval_enqueue(eval, REGION).await.unwrap();
    assert!(index >= 1);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let snap = server.fsm().snapshot().await;
        if snap.allocation_for_job(&job_id).is_some()
            && snap.eval(&eval_id).map(|e| e.status) == Some(EvalStatus::Complete)
        {
            assert_eq!(snap.allocation_for_job(&job_id).unwrap().node, "n1");
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "evaluation was not processed in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(
        wait_until(
            || {
                let stats = server.eval_broker().stats();
                stats.total_ready == 0 && stats.total_unacked == 0
            },
            Duration::from_secs(3),
        )
        .await,
        "broker did not drain"
    );
}

#[tokio::test]
async fn test_workers_spread_jobs_across_nodes() {
    // One worker serializes the evals so placement counts stay exact.
    let (server, _raft, _membership, _shutdown) = dev_server(dev_config("spread").with_workers(1));
    wait_for_leadership(&server).await;
    server
        .node_register("n1", "10.0.0.5:4646", REGION)
        .await
        .unwrap();
    server
        .node_register("n2", "10.0.0.6:4646", REGION)
        .await
        .unwrap();

    let jobs: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
    for job_id in &jobs {
        server
            .eval_enqueue(Evaluation::new("batch", *job_id, 50), REGION)
            .await
            .unwrap();
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let snap = server.fsm().snapshot().await;
        if jobs.iter().all(|j| snap.allocation_for_job(j).is_some()) {
            // Least-loaded placement splits the jobs over both nodes.
            assert_eq!(snap.allocation_count_for_node("n1"), 2);
            assert_eq!(snap.allocation_count_for_node("n2"), 2);
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "jobs were not all placed in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_shutdown_during_backoff() {
    // A worker on a follower keeps failing its dequeue and
    // sits in exponential backoff; shutdown must interrupt the sleep.
    let mut config = dev_config("backoff").with_workers(1);
    config.bootstrap = false;
    let (server, _raft, _membership, shutdown) = dev_server(config);

    // Let failures accumulate so the worker is inside a long backoff.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!server.is_leader());

    let start = tokio::time::Instant::now();
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), server.shutdown())
        .await
        .expect("worker did not exit within one backoff interval");
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_unresolvable_eval_is_failed_out_of_band() {
    // A scheduler type no factory knows: the worker nacks every
    // delivery until the broker fails the evaluation.
    let mut config = dev_config("mystery").with_workers(1);
    config.enabled_schedulers = vec!["mystery".to_string()];
    let (server, _raft, _membership, _shutdown) = dev_server(config);
    wait_for_leadership(&server).await;

    let eval = Evaluation::new("mystery", Uuid::new_v4(), 50);
    let eval_id = eval.id;
    server.eval_enqueue(eval, REGION).await.unwrap();

    assert!(
        wait_until(
            || server.eval_broker().failed_evals().len() == 1,
            Duration::from_secs(5),
        )
        .await,
        "evaluation was never failed"
    );
    let failed = server.eval_broker().failed_evals();
    assert_eq!(failed[0].id, eval_id);
    assert_eq!(failed[0].status, EvalStatus::Failed);
}

/// Planner double that rejects the first submission as stale, handing
/// back a refreshed snapshot, and accepts the second.
struct RefreshOnce {
    refresh_snapshot: StateSnapshot,
    submissions: Mutex<Vec<Plan>>,
}

#[async_trait]
impl Planner for RefreshOnce {
    async fn submit_plan(&self, plan: Plan) -> Result<(PlanResult, Option<StateSnapshot>)> {
        let mut subs = self.submissions.lock().unwrap();
        subs.push(plan);
        if subs.len() == 1 {
            Ok((
                PlanResult {
                    allocations_applied: 0,
                    refresh_index: self.refresh_snapshot.applied_index,
                    index: 0,
                },
                Some(self.refresh_snapshot.clone()),
            ))
        } else {
            Ok((
                PlanResult {
                    allocations_applied: 1,
                    refresh_index: 0,
                    index: self.refresh_snapshot.applied_index + 1,
                },
                None,
            ))
        }
    }
}

#[tokio::test]
async fn test_scheduler_replans_in_place_on_refresh() {
    // A refresh index makes the scheduler
    // replan from the fresh snapshot instead of requeueing the eval.
    let fsm = Fsm::new();
    fsm.apply(
        1,
        &Entry::RegisterNode {
            name: "n1".to_string(),
            addr: "10.0.0.5:4646".to_string(),
        },
    )
    .await;
    let snapshot = fsm.snapshot().await;

    let planner = RefreshOnce {
        refresh_snapshot: snapshot.clone(),
        submissions: Mutex::new(Vec::new()),
    };
    let eval = Evaluation::new("service", Uuid::new_v4(), 50);
    let mut sched = new_scheduler("service").unwrap();
    sched.process(&eval, snapshot, &planner).await.unwrap();

    let submissions = planner.submissions.lock().unwrap();
    assert_eq!(submissions.len(), 2);
    assert!(submissions.iter().all(|p| p.eval_id == eval.id));
    assert_eq!(submissions[1].allocations.len(), 1);
    assert_eq!(submissions[1].allocations[0].node, "n1");
}

#[tokio::test]
async fn test_unknown_scheduler_type_is_an_error() {
    assert!(new_scheduler("mystery").is_err());
    assert!(new_scheduler("service").is_ok());
    assert!(new_scheduler("batch").is_ok());
}
