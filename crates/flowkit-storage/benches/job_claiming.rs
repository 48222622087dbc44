//! Enqueue/claim throughput under contention: the core scheduling path the
//! runner's poll loop drives.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use flowkit_storage::{EnqueueRequest, InMemoryQueue, Queue};
use tokio::runtime::Runtime;

fn bench_enqueue(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("job_claiming/enqueue");
    group.throughput(Throughput::Elements(1));

    group.bench_function("single", |b| {
        b.to_async(&rt).iter_custom(|iters| async move {
            let queue = InMemoryQueue::new();
            queue.start_processing("bench:step").await.unwrap();

            let start = std::time::Instant::now();
            for i in 0..iters {
                queue.enqueue("bench:step", EnqueueRequest::new("step", serde_json::json!({"i": i}))).await.unwrap();
            }
            start.elapsed()
        });
    });

    group.finish();
}

fn bench_claim_concurrent(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("job_claiming/concurrent");
    group.sample_size(20);

    for workers in [2, 4, 8] {
        let job_count = 2000u64;
        group.throughput(Throughput::Elements(job_count));
        group.bench_with_input(BenchmarkId::new("workers", workers), &workers, |b, &workers| {
            b.to_async(&rt).iter(|| async move {
                let queue = Arc::new(InMemoryQueue::new());
                queue.start_processing("bench:step").await.unwrap();

                for i in 0..job_count {
                    queue.enqueue("bench:step", EnqueueRequest::new("step", serde_json::json!({"i": i}))).await.unwrap();
                }

                let claimed_total = Arc::new(AtomicU64::new(0));
                let mut handles = Vec::new();
                for _ in 0..workers {
                    let queue = queue.clone();
                    let claimed_total = claimed_total.clone();
                    handles.push(tokio::spawn(async move {
                        loop {
                            if claimed_total.load(Ordering::Relaxed) >= job_count {
                                break;
                            }
                            let claimed = queue.claim_jobs("bench:step", &[], 1).await.unwrap();
                            if claimed.is_empty() {
                                tokio::task::yield_now().await;
                                continue;
                            }
                            for job in claimed {
                                queue.complete_job("bench:step", &job.id).await.unwrap();
                                claimed_total.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }));
                }
                for handle in handles {
                    handle.await.unwrap();
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_enqueue, bench_claim_concurrent);
criterion_main!(benches);
