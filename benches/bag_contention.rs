use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use crossbeam_queue::SegQueue;
use std::hint::black_box;
use std::sync::{Arc, Mutex};
use std::thread;

use lockless_reclaim::PartitionedBag;

const OPS_PER_THREAD: usize = 1_000;

// Benchmark 1: Single-threaded add + remove_one
fn bench_single_thread(c: &mut Criterion) {
    let mut group = c.benchmark_group("bag_single_thread");

    group.bench_function("partitioned_bag", |b| {
        let bag = PartitionedBag::with_partitions(8).unwrap();
        let value = Arc::new(0u64);
        b.iter(|| {
            bag.add(value.clone());
            black_box(bag.remove_one());
        });
    });

    group.bench_function("seg_queue", |b| {
        let queue = SegQueue::new();
        let value = Arc::new(0u64);
        b.iter(|| {
            queue.push(value.clone());
            black_box(queue.pop());
        });
    });

    group.bench_function("mutex_vec", |b| {
        let vec = Mutex::new(Vec::new());
        let value = Arc::new(0u64);
        b.iter(|| {
            vec.lock().unwrap().push(value.clone());
            black_box(vec.lock().unwrap().pop());
        });
    });

    group.finish();
}

// Benchmark 2: Concurrent add + remove_one under contention
fn bench_contention(c: &mut Criterion) {
    let mut group = c.benchmark_group("bag_contention");
    group.sample_size(10);

    for num_threads in [2, 4, 8].iter() {
        group.bench_with_input(
            BenchmarkId::new("partitioned_bag", num_threads),
            num_threads,
            |b, &num_threads| {
                b.iter(|| {
                    let bag = Arc::new(PartitionedBag::with_partitions(16).unwrap());
                    let handles: Vec<_> = (0..num_threads)
                        .map(|_| {
                            let bag = bag.clone();
                            thread::spawn(move || {
                                let value = Arc::new(0u64);
                                for _ in 0..OPS_PER_THREAD {
                                    bag.add(value.clone());
                                    black_box(bag.remove_one());
                                }
                            })
                        })
                        .collect();
                    for handle in handles {
                        let _ = handle.join();
                    }
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("seg_queue", num_threads),
            num_threads,
            |b, &num_threads| {
                b.iter(|| {
                    let queue = Arc::new(SegQueue::new());
                    let handles: Vec<_> = (0..num_threads)
                        .map(|_| {
                            let queue = queue.clone();
                            thread::spawn(move || {
                                let value = Arc::new(0u64);
                                for _ in 0..OPS_PER_THREAD {
                                    queue.push(value.clone());
                                    black_box(queue.pop());
                                }
                            })
                        })
                        .collect();
                    for handle in handles {
                        let _ = handle.join();
                    }
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("mutex_vec", num_threads),
            num_threads,
            |b, &num_threads| {
                b.iter(|| {
                    let vec = Arc::new(Mutex::new(Vec::new()));
                    let handles: Vec<_> = (0..num_threads)
                        .map(|_| {
                            let vec = vec.clone();
                            thread::spawn(move || {
                                let value = Arc::new(0u64);
                                for _ in 0..OPS_PER_THREAD {
                                    vec.lock().unwrap().push(value.clone());
                                    black_box(vec.lock().unwrap().pop());
                                }
                            })
                        })
                        .collect();
                    for handle in handles {
                        let _ = handle.join();
                    }
                });
            },
        );
    }

    group.finish();
}

// Benchmark 3: Identity removal of a value deep in a partition
fn bench_remove_by_identity(c: &mut Criterion) {
    let mut group = c.benchmark_group("bag_remove_by_identity");

    for size in [16usize, 256, 4096].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let bag = PartitionedBag::with_partitions(4).unwrap();
            let values: Vec<Arc<usize>> = (0..size).map(Arc::new).collect();
            bag.add_all(values.iter().cloned());
            let target = values[0].clone();
            b.iter(|| {
                black_box(bag.remove(&target));
                bag.add(target.clone());
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_single_thread,
    bench_contention,
    bench_remove_by_identity
);
criterion_main!(benches);
