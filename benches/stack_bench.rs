// Lock-free stack benchmarks: single-threaded push/pop cost and
// throughput under multi-threaded contention.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rustydb_storage::concurrent::LockFreeStack;
use std::sync::Arc;
use std::thread;

fn bench_single_thread_push_pop(c: &mut Criterion) {
    let stack: LockFreeStack<u64> = LockFreeStack::with_capacity(4096);
    c.bench_function("push_pop_single_thread", |b| {
        b.iter(|| {
            stack.push(black_box(42)).unwrap();
            black_box(stack.pop());
        });
    });
}

fn bench_contended_push_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("push_pop_contended");
    for num_threads in [2usize, 4, 8] {
        group.bench_with_input(
            BenchmarkId::new("threads", num_threads),
            &num_threads,
            |b, &num_threads| {
                b.iter(|| {
                    let stack = Arc::new(LockFreeStack::<u64>::with_capacity(4096));
                    let handles: Vec<_> = (0..num_threads)
                        .map(|_| {
                            let stack = Arc::clone(&stack);
                            thread::spawn(move || {
                                for i in 0..256u64 {
                                    stack.push(i).unwrap();
                                    black_box(stack.pop());
                                }
                            })
                        })
                        .collect();
                    for h in handles {
                        h.join().unwrap();
                    }
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_single_thread_push_pop, bench_contended_push_pop);
criterion_main!(benches);
