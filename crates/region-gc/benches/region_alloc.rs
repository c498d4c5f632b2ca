//! Benchmark: allocation fast and slow paths.
//!
//! Measures bump allocation in a thread-local region, region turnover when
//! regions fill up, and raw region take/reclaim on the manager.

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use region_gc::region::{RegionManager, RegionType};
use region_gc::testing::{RootSet, SimpleObjectModel};
use region_gc::{Heap, HeapConfig};
use std::hint::black_box;
use std::sync::Arc;

const UNIT: usize = 64 * 1024;

fn heap(units: usize) -> (Heap, Arc<SimpleObjectModel>) {
    let model = Arc::new(SimpleObjectModel::new());
    let config = HeapConfig::default()
        .with_unit_size(UNIT)
        .with_heap_size(units * UNIT)
        .with_collector_thread(false)
        .with_verify(false);
    let heap = Heap::new(config, model.clone(), Arc::new(RootSet::new())).unwrap();
    (heap, model)
}

fn bench_bump_allocation(c: &mut Criterion) {
    c.bench_function("bump_allocate_1000_small", |b| {
        b.iter_batched(
            || heap(64),
            |(heap, model)| {
                let mutator = heap.attach();
                let header = model.header(1, 16);
                let size = model.size_of(header);
                for _ in 0..1000 {
                    black_box(mutator.allocate(header, size).unwrap());
                }
            },
            BatchSize::SmallInput,
        );
    });
}

fn bench_region_turnover(c: &mut Criterion) {
    c.bench_function("allocate_across_64_regions", |b| {
        b.iter_batched(
            || heap(128),
            |(heap, model)| {
                let mutator = heap.attach();
                let header = model.header(0, 4088);
                let size = model.size_of(header);
                for _ in 0..(64 * UNIT / size) {
                    black_box(mutator.allocate(header, size).unwrap());
                }
            },
            BatchSize::SmallInput,
        );
    });
}

fn bench_take_reclaim(c: &mut Criterion) {
    let config = HeapConfig::default()
        .with_unit_size(UNIT)
        .with_heap_size(1024 * UNIT)
        .with_garbage_cache_units(0);
    let manager = RegionManager::new(&config).unwrap();
    c.bench_function("take_reclaim_region", |b| {
        b.iter(|| {
            let id = manager.take_region(black_box(4), RegionType::Old, false, false).unwrap();
            manager.reclaim_region(id);
        });
    });
}

criterion_group!(benches, bench_bump_allocation, bench_region_turnover, bench_take_reclaim);
criterion_main!(benches);
