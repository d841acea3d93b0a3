//! Epoch-based reclamation benchmark: pin/retire throughput, single- and
//! multi-threaded, and the cost of forcing a reclaim pass.

use criterion::{criterion_group, criterion_main, Criterion};
use libttak::ebr::EbrDomain;
use std::hint::black_box;
use std::sync::Barrier;
use std::thread;

fn benchmark_pin_unpin(c: &mut Criterion) {
    let domain = EbrDomain::new();
    let handle = domain.register_thread();
    c.bench_function("pin_unpin", |b| {
        b.iter(|| {
            let guard = handle.enter();
            black_box(&guard);
        });
    });
}

fn benchmark_retire_reclaim(c: &mut Criterion) {
    let domain = EbrDomain::new();
    let handle = domain.register_thread();
    c.bench_function("retire_then_reclaim", |b| {
        b.iter(|| {
            let boxed = Box::into_raw(Box::new(0u64));
            handle.retire(boxed);
            black_box(domain.reclaim());
        });
    });
}

fn benchmark_contended_pin(c: &mut Criterion) {
    c.bench_function("contended_pin_4_threads", |b| {
        b.iter(|| {
            let domain = EbrDomain::new();
            let barrier = std::sync::Arc::new(Barrier::new(4));
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let domain = domain.clone();
                    let barrier = barrier.clone();
                    thread::spawn(move || {
                        let handle = domain.register_thread();
                        barrier.wait();
                        for _ in 0..100 {
                            let guard = handle.enter();
                            black_box(&guard);
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
        });
    });
}

criterion_group!(
    benches,
    benchmark_pin_unpin,
    benchmark_retire_reclaim,
    benchmark_contended_pin
);
criterion_main!(benches);
