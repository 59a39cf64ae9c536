mod support;

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use drover::error::DroverError;
use drover::plan::{Allocation, Plan, PlanQueue};

use support::{dev_config, dev_server, wait_for_leadership};

const REGION: &str = "global";

fn plan_for(node: &str) -> Plan {
    let eval_id = Uuid::new_v4();
    let job_id = Uuid::new_v4();
    Plan {
        eval_id,
        job_id,
        allocations: vec![Allocation::new(eval_id, job_id, node)],
    }
}

#[tokio::test]
async fn test_plan_queue_rejects_enqueue_when_disabled() {
    let queue = PlanQueue::new();
    assert!(matches!(
        queue.enqueue(plan_for("n1")).unwrap_err(),
        DroverError::EnqueueDisabled
    ));
}

#[tokio::test]
async fn test_disabling_queue_fails_pending_plans() {
    let queue = PlanQueue::new();
    queue.set_enabled(true);
    let rx = queue.enqueue(plan_for("n1")).unwrap();
    assert_eq!(queue.depth(), 1);

    queue.set_enabled(false);
    let result = rx.await.expect("responder dropped");
    assert!(matches!(result.unwrap_err(), DroverError::NotLeader(_)));
    assert_eq!(queue.depth(), 0);
}

#[tokio::test]
async fn test_queue_dequeues_in_fifo_order() {
    let queue = PlanQueue::new();
    queue.set_enabled(true);
    let first = plan_for("n1");
    let second = plan_for("n2");
    let first_id = first.eval_id;
    let second_id = second.eval_id;
    let _rx1 = queue.enqueue(first).unwrap();
    let _rx2 = queue.enqueue(second).unwrap();

    let token = CancellationToken::new();
    let a = queue.dequeue(&token).await.unwrap();
    let b = queue.dequeue(&token).await.unwrap();
    assert_eq!(a.plan.eval_id, first_id);
    assert_eq!(b.plan.eval_id, second_id);
}

#[tokio::test]
async fn test_dequeue_unblocks_on_cancellation() {
    let queue = PlanQueue::new();
    queue.set_enabled(true);
    let token = CancellationToken::new();

    let consumer = queue.clone();
    let consumer_token = token.clone();
    let handle = tokio::spawn(async move { consumer.dequeue(&consumer_token).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();
    assert!(handle.await.unwrap().is_none());
}

#[tokio::test]
async fn test_planner_returns_refresh_index_for_stale_plan() {
    // A plan against a node the state does
    // not know is stale; once the node registers, the same shape of
    // plan applies.
    let (server, _raft, _membership, _shutdown) = dev_server(dev_config("planner").with_workers(0));
    wait_for_leadership(&server).await;
    server
        .node_register("n0", "10.0.0.4:4646", REGION)
        .await
        .unwrap();

    let stale = plan_for("n1");
    let result = server.plan_submit(stale, REGION).await.unwrap();
    assert_eq!(result.index, 0);
    assert_eq!(result.allocations_applied, 0);
    assert!(result.refresh_index > 0);
    assert_eq!(result.refresh_index, server.fsm().applied_index());

    server
        .node_register("n1", "10.0.0.5:4646", REGION)
        .await
        .unwrap();

    let fresh = plan_for("n1");
    let job_id = fresh.job_id;
    let result = server.plan_submit(fresh, REGION).await.unwrap();
    assert_eq!(result.refresh_index, 0);
    assert_eq!(result.allocations_applied, 1);
    assert!(result.index > 0);

    let snap = server.fsm().snapshot().await;
    assert_eq!(snap.allocation_for_job(&job_id).unwrap().node, "n1");
}

#[tokio::test]
async fn test_planner_rejects_conflicting_allocation() {
    let (server, _raft, _membership, _shutdown) =
        dev_server(dev_config("conflict").with_workers(0));
    wait_for_leadership(&server).await;
    server
        .node_register("n1", "10.0.0.5:4646", REGION)
        .await
        .unwrap();

    let winner = plan_for("n1");
    let job_id = winner.job_id;
    server.plan_submit(winner, REGION).await.unwrap();

    // A second plan for the same job lost the race through the log.
    let eval_id = Uuid::new_v4();
    let loser = Plan {
        eval_id,
        job_id,
        allocations: vec![Allocation::new(eval_id, job_id, "n1")],
    };
    let result = server.plan_submit(loser, REGION).await.unwrap();
    assert_eq!(result.allocations_applied, 0);
    assert!(result.refresh_index > 0);

    // Exactly one allocation for the job survives.
    let snap = server.fsm().snapshot().await;
    assert_eq!(snap.allocation_count_for_node("n1"), 1);
}
