//! Replay throughput benchmark
//!
//! Measures the hot path of every resume: rebuilding an instance from its
//! history. Also covers resume-queue claiming under contention.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;

use waypoint_durable::{
    InMemoryHistoryStore, InMemoryResumeQueue, Resume, ResumeQueue, Step, Workflow,
    WorkflowEngine, WorkflowError,
};
use uuid::Uuid;

/// Runs `steps` side effects in sequence, then waits for a signal
struct Counter {
    steps: u64,
    done: u64,
}

impl Workflow for Counter {
    const TYPE: &'static str = "counter";
    type Input = u64;
    type Output = u64;

    fn new(steps: u64) -> Self {
        Self { steps, done: 0 }
    }

    fn on_start(&mut self) -> Step<u64> {
        self.next()
    }

    fn on_resume(&mut self, resume: Resume) -> Step<u64> {
        match resume {
            Resume::SideEffect(_) => {
                self.done += 1;
                self.next()
            }
            _ => Step::Complete(self.done),
        }
    }
}

impl Counter {
    fn next(&self) -> Step<u64> {
        if self.done < self.steps {
            let n = self.done;
            Step::side_effect("step", move || async move { Ok::<_, WorkflowError>(n) })
        } else {
            Step::await_signal()
        }
    }
}

fn engine() -> WorkflowEngine<InMemoryHistoryStore, InMemoryResumeQueue> {
    let mut engine = WorkflowEngine::new(
        Arc::new(InMemoryHistoryStore::new()),
        Arc::new(InMemoryResumeQueue::new()),
    );
    engine.register::<Counter>();
    engine
}

/// Benchmark replay cost by history length
fn bench_replay(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("replay/history_length");

    for steps in [10u64, 100, 1000] {
        group.throughput(Throughput::Elements(steps + 1));
        group.bench_with_input(BenchmarkId::new("events", steps), &steps, |b, &steps| {
            let engine = engine();
            let id = rt
                .block_on(engine.run_workflow::<Counter>(steps, None))
                .unwrap();

            b.to_async(&rt).iter(|| async {
                let outcome = engine.execute(id).await.unwrap();
                assert_eq!(outcome.events_written, 0);
            });
        });
    }

    group.finish();
}

/// Benchmark starting instances to their first suspension
fn bench_start(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("replay/start");
    group.throughput(Throughput::Elements(1));

    group.bench_function("ten_side_effects", |b| {
        b.to_async(&rt).iter_custom(|iters| async move {
            let engine = engine();

            let start = Instant::now();
            for _ in 0..iters {
                engine.run_workflow::<Counter>(10, None).await.unwrap();
            }
            start.elapsed()
        });
    });

    group.finish();
}

/// Benchmark concurrent resume-queue claiming (contention)
fn bench_claim_concurrent(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("replay/queue_claim");
    group.sample_size(20);

    for workers in [2, 4, 8] {
        let task_count = 5000u64;
        group.throughput(Throughput::Elements(task_count));
        group.bench_with_input(
            BenchmarkId::new("workers", workers),
            &workers,
            |b, &workers| {
                b.to_async(&rt).iter(|| async {
                    let queue = Arc::new(InMemoryResumeQueue::new());
                    for _ in 0..task_count {
                        queue.enqueue_resume(Uuid::now_v7()).await.unwrap();
                    }

                    let acked = Arc::new(AtomicU64::new(0));
                    let mut handles = Vec::new();
                    for worker in 0..workers {
                        let queue = queue.clone();
                        let acked = acked.clone();

                        handles.push(tokio::spawn(async move {
                            let worker_id = format!("worker-{}", worker);
                            while acked.load(Ordering::Relaxed) < task_count {
                                let claimed = queue.claim(&worker_id, 10).await.unwrap();
                                if claimed.is_empty() {
                                    tokio::task::yield_now().await;
                                    continue;
                                }
                                for task in claimed {
                                    queue.ack(task.id).await.unwrap();
                                    acked.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                        }));
                    }

                    for handle in handles {
                        handle.await.unwrap();
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_replay, bench_start, bench_claim_concurrent);
criterion_main!(benches);
