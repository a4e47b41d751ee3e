//! Integration tests for the scheduling layer.
//!
//! These tests verify:
//! - Pop order: priority first, FIFO within a priority
//! - Lazy deletion: removed and superseded entries never pop
//! - Per-environment token caps, including RAII release
//! - Retry backoff schedule

use std::time::Duration;
use tokio_deploy_orchestrator::scheduling::{
    DeploymentQueue, Priority, ResourceManager, RetryPolicy,
};
use tokio_deploy_orchestrator::{ArtifactType, DeploymentPlan, TestArtifact};

// ── Helper functions ──────────────────────────────────────────────

fn make_plan(id: &str) -> DeploymentPlan {
    let artifact = TestArtifact::new(
        format!("{id}-script"),
        "run.sh",
        ArtifactType::Script,
        b"echo ok".to_vec(),
        "/opt/tests/run.sh",
    );
    DeploymentPlan::new(id, "env-1", vec![artifact])
}

fn drain(queue: &DeploymentQueue) -> Vec<(Priority, String)> {
    std::iter::from_fn(|| queue.pop())
        .map(|(priority, plan)| (priority, plan.plan_id))
        .collect()
}

// ── Queue ─────────────────────────────────────────────────────────

#[test]
fn test_mixed_priorities_pop_in_order_with_fifo_ties() {
    let queue = DeploymentQueue::new();
    let submitted = [
        ("p0", Priority::Low),
        ("p1", Priority::Critical),
        ("p2", Priority::Normal),
        ("p3", Priority::High),
        ("p4", Priority::Normal),
    ];
    for (id, priority) in submitted {
        queue.add(make_plan(id).with_priority(priority), None);
    }

    assert_eq!(
        drain(&queue),
        vec![
            (Priority::Critical, "p1".to_string()),
            (Priority::High, "p3".to_string()),
            (Priority::Normal, "p2".to_string()),
            (Priority::Normal, "p4".to_string()),
            (Priority::Low, "p0".to_string()),
        ]
    );
    assert!(queue.is_empty());
}

#[test]
fn test_pop_order_is_non_decreasing_for_many_plans() {
    let queue = DeploymentQueue::new();
    let priorities = [Priority::Low, Priority::High, Priority::Critical, Priority::Normal];
    for i in 0..200 {
        queue.add(make_plan(&format!("p{i}")), Some(priorities[(i * 7) % 4]));
    }

    let popped = drain(&queue);
    assert_eq!(popped.len(), 200);
    for pair in popped.windows(2) {
        assert!(pair[0].0 <= pair[1].0, "{:?} popped before {:?}", pair[0], pair[1]);
    }
}

#[test]
fn test_removed_and_superseded_entries_never_pop() {
    let queue = DeploymentQueue::new();
    queue.add(make_plan("a"), Some(Priority::Normal));
    queue.add(make_plan("b"), Some(Priority::Normal));
    queue.add(make_plan("c"), Some(Priority::Normal));

    assert!(queue.remove("b"));
    assert!(!queue.remove("b"));
    // Re-adding replaces the live entry rather than duplicating it.
    queue.add(make_plan("a"), Some(Priority::Low));
    assert_eq!(queue.size(), 2);

    assert_eq!(
        drain(&queue),
        vec![
            (Priority::Normal, "c".to_string()),
            (Priority::Low, "a".to_string()),
        ]
    );
}

#[test]
fn test_pop_on_empty_queue_returns_none() {
    let queue = DeploymentQueue::new();
    assert!(queue.pop().is_none());
    queue.add(make_plan("a"), None);
    queue.clear();
    assert!(queue.pop().is_none());
}

#[test]
fn test_demotion_saturates_at_low() {
    assert_eq!(Priority::Critical.demoted(), Priority::High);
    assert_eq!(Priority::Normal.demoted(), Priority::Low);
    assert_eq!(Priority::Low.demoted(), Priority::Low);
}

// ── Resources ─────────────────────────────────────────────────────

#[test]
fn test_cap_of_two_grants_two_then_denies() {
    let resources = ResourceManager::new(2);
    assert!(resources.acquire("e1"));
    assert!(resources.acquire("e1"));
    assert!(!resources.acquire("e1"));
    assert_eq!(resources.usage("e1"), 2);

    // Other environments are independent.
    assert!(resources.acquire("e2"));

    resources.release("e1");
    assert!(resources.acquire("e1"));
}

#[test]
fn test_release_is_floored_at_zero() {
    let resources = ResourceManager::new(2);
    resources.release("e1");
    assert_eq!(resources.usage("e1"), 0);
    assert!(resources.acquire("e1"));
    assert!(resources.acquire("e1"));
}

#[test]
fn test_tokens_release_on_drop() {
    let resources = ResourceManager::new(1);
    {
        let token = resources.try_token("e1").unwrap();
        assert_eq!(token.environment_id(), "e1");
        assert!(resources.try_token("e1").is_none());
    }
    assert_eq!(resources.usage("e1"), 0);
    assert!(resources.try_token("e1").is_some());
}

#[tokio::test]
async fn test_concurrent_acquire_never_exceeds_cap() {
    let resources = ResourceManager::new(3);
    let mut handles = Vec::new();
    for _ in 0..32 {
        let resources = resources.clone();
        handles.push(tokio::spawn(async move {
            let mut granted = 0;
            for _ in 0..50 {
                if let Some(_token) = resources.try_token("e1") {
                    assert!(resources.usage("e1") <= 3);
                    granted += 1;
                    tokio::task::yield_now().await;
                }
            }
            granted
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(resources.usage("e1"), 0);
}

// ── Retry ─────────────────────────────────────────────────────────

#[test]
fn test_default_backoff_schedule() {
    let policy = RetryPolicy::default();
    let delays: Vec<Duration> = (0..3).map(|n| policy.delay_for(n)).collect();
    assert_eq!(
        delays,
        vec![
            Duration::from_secs(5),
            Duration::from_secs(10),
            Duration::from_secs(20),
        ]
    );
    assert!(policy.allows(2));
    assert!(!policy.allows(3));
}
