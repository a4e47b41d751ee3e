//! Scheduling benchmarks: hot paths of the dispatch loop.
//!
//! - Queue push+pop, single plan
//! - Queue drain with tombstones mixed in
//! - Environment token acquire+release

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tokio_deploy_orchestrator::scheduling::{DeploymentQueue, Priority, ResourceManager};
use tokio_deploy_orchestrator::{ArtifactType, DeploymentPlan, TestArtifact};

fn make_plan(id: usize) -> DeploymentPlan {
    let artifact = TestArtifact::new(
        "bench",
        "bench.sh",
        ArtifactType::Script,
        b"echo bench".to_vec(),
        "/opt/tests/bench.sh",
    );
    DeploymentPlan::new(format!("plan-{id}"), "env-1", vec![artifact])
}

// ═══════════════════════════════════════════════════════════════════════════
// DeploymentQueue
// ═══════════════════════════════════════════════════════════════════════════

fn bench_queue_push_pop(c: &mut Criterion) {
    let queue = DeploymentQueue::new();
    let plan = make_plan(0);

    c.bench_function("queue_push_pop", |b| {
        b.iter(|| {
            queue.add(plan.clone(), Some(Priority::Normal));
            black_box(queue.pop());
        })
    });
}

fn bench_queue_drain_with_tombstones(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_drain_with_tombstones");
    let priorities = [Priority::Low, Priority::High, Priority::Critical, Priority::Normal];

    for size in [100usize, 1_000] {
        let plans: Vec<DeploymentPlan> = (0..size).map(make_plan).collect();
        group.bench_with_input(BenchmarkId::from_parameter(size), &plans, |b, plans| {
            b.iter(|| {
                let queue = DeploymentQueue::new();
                for (i, plan) in plans.iter().enumerate() {
                    queue.add(plan.clone(), Some(priorities[i % 4]));
                }
                // Every third plan is removed before dispatch.
                for plan in plans.iter().step_by(3) {
                    queue.remove(&plan.plan_id);
                }
                while let Some(entry) = queue.pop() {
                    black_box(entry);
                }
            })
        });
    }
    group.finish();
}

// ═══════════════════════════════════════════════════════════════════════════
// ResourceManager
// ═══════════════════════════════════════════════════════════════════════════

fn bench_acquire_release(c: &mut Criterion) {
    let resources = ResourceManager::new(3);

    c.bench_function("resource_acquire_release", |b| {
        b.iter(|| {
            if resources.acquire(black_box("env-1")) {
                resources.release("env-1");
            }
        })
    });
}

fn bench_token_guard(c: &mut Criterion) {
    let resources = ResourceManager::new(3);

    c.bench_function("resource_token_guard", |b| {
        b.iter(|| {
            let token = resources.try_token(black_box("env-1"));
            black_box(&token);
        })
    });
}

criterion_group!(
    benches,
    bench_queue_push_pop,
    bench_queue_drain_with_tombstones,
    bench_acquire_release,
    bench_token_guard
);
criterion_main!(benches);
