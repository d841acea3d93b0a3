//! Allocator throughput benchmark: the tiered allocator vs. the system
//! allocator across the small-pool / bump-arena / general boundaries.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use libttak::alloc::{AllocFlags, Allocator, AllocatorConfig};
use libttak::registry::PointerRegistry;
use libttak::tree::{TrackingTree, TreeConfig};
use std::hint::black_box;
use std::sync::Arc;

fn make_allocator() -> Allocator {
    let registry = Arc::new(PointerRegistry::new());
    let tree = TrackingTree::new(TreeConfig::default());
    Allocator::new(AllocatorConfig::default(), registry, tree)
}

fn benchmark_alloc_free(c: &mut Criterion) {
    let sizes = [16usize, 64, 512, 4096, 32 * 1024];

    let mut group = c.benchmark_group("alloc_free");
    for size in sizes {
        group.bench_with_input(BenchmarkId::new("libttak", size), &size, |b, &size| {
            let alloc = make_allocator();
            b.iter(|| {
                let ptr = alloc
                    .alloc(size, None, 0, AllocFlags::default())
                    .expect("alloc failed");
                black_box(ptr);
                unsafe { alloc.free(ptr) };
            });
        });

        group.bench_with_input(BenchmarkId::new("system", size), &size, |b, &size| {
            b.iter(|| {
                let layout = std::alloc::Layout::from_size_align(size, 8).unwrap();
                unsafe {
                    let ptr = std::alloc::alloc(layout);
                    black_box(ptr);
                    std::alloc::dealloc(ptr, layout);
                }
            });
        });
    }
    group.finish();
}

fn benchmark_root_alloc_access(c: &mut Criterion) {
    let alloc = make_allocator();
    c.bench_function("root_alloc_then_access", |b| {
        b.iter(|| {
            let flags = AllocFlags {
                is_root: true,
                ..Default::default()
            };
            let ptr = alloc.alloc(64, None, 0, flags).expect("alloc failed");
            unsafe {
                black_box(alloc.access(ptr, 1));
                alloc.free(ptr);
            }
        });
    });
}

criterion_group!(benches, benchmark_alloc_free, benchmark_root_alloc_access);
criterion_main!(benches);
