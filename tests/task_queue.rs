//! Task Queue Integration Tests
//!
//! Lease exclusion under concurrent claims and at-least-once redelivery
//! once a lease expires.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ledgerflow::core::{QueueError, TaskQueue};
use ledgerflow::domain::{ActivityTask, RunKey};
use serde_json::json;
use uuid::Uuid;

fn task(run: &RunKey, call_site: u32) -> ActivityTask {
    ActivityTask {
        task_id: Uuid::new_v4(),
        run: run.clone(),
        call_site,
        attempt: 1,
        activity_id: format!("task_{:02}", call_site),
        activity_type: "fibo".to_string(),
        input: json!(call_site),
        task_queue: "bench-q".to_string(),
        start_to_close_timeout: Duration::from_secs(30),
        scheduled_at: Utc::now(),
        backoff: Duration::ZERO,
    }
}

#[tokio::test]
async fn test_concurrent_claims_are_exclusive() {
    let queue = Arc::new(TaskQueue::new("bench-q"));
    let run = RunKey::new("wf", Uuid::new_v4());
    for site in 0..20 {
        assert!(queue.enqueue(task(&run, site)).await);
    }

    let mut handles = Vec::new();
    for w in 0..8 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(c) = queue.claim(&format!("w{}", w), Duration::from_secs(30)).await {
                claimed.push(c.task.call_site);
                tokio::task::yield_now().await;
            }
            claimed
        }));
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    for handle in handles {
        for site in handle.await.unwrap() {
            total += 1;
            assert!(seen.insert(site), "call-site {} claimed twice", site);
        }
    }
    assert_eq!(total, 20);

    let stats = queue.stats().await;
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.claimed, 20);
}

#[tokio::test]
async fn test_expired_lease_redelivers_task() {
    let queue = TaskQueue::new("bench-q");
    let run = RunKey::new("wf", Uuid::new_v4());
    let mut short = task(&run, 0);
    short.start_to_close_timeout = Duration::from_millis(50);
    queue.enqueue(short).await;

    let first = queue.claim("crashed", Duration::from_millis(50)).await.unwrap();
    assert!(queue.claim("other", Duration::from_secs(30)).await.is_none());

    tokio::time::sleep(Duration::from_millis(80)).await;

    let second = queue.claim("other", Duration::from_secs(30)).await.unwrap();
    assert_eq!(second.task.task_id, first.task.task_id);
    assert_eq!(second.lease.worker_id, "other");

    // The crashed worker's late acknowledgement is refused
    assert_eq!(
        queue.complete(first.task.task_id, first.lease.token).await,
        Err(QueueError::LeaseMismatch(first.task.task_id))
    );

    queue
        .complete(second.task.task_id, second.lease.token)
        .await
        .unwrap();
    assert!(queue.is_empty().await);
    assert_eq!(queue.stats().await.redeliveries, 1);
}

#[tokio::test]
async fn test_acknowledged_attempt_can_be_enqueued_again() {
    let queue = TaskQueue::new("bench-q");
    let run = RunKey::new("wf", Uuid::new_v4());

    assert!(queue.enqueue(task(&run, 0)).await);
    assert!(!queue.enqueue(task(&run, 0)).await);

    let claimed = queue.claim("w", Duration::from_secs(30)).await.unwrap();
    queue
        .complete(claimed.task.task_id, claimed.lease.token)
        .await
        .unwrap();

    // Recovery may republish an attempt whose task was already acknowledged
    assert!(queue.enqueue(task(&run, 0)).await);
}
