//! Object pool benchmarks using criterion.
//!
//! Run with: cargo bench --bench pool_bench

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use filament_runtime::pool::{self, PoolKind, Poolable};

struct HotObj {
    #[allow(dead_code)]
    payload: [u8; 128],
}

impl Poolable for HotObj {
    const KIND: PoolKind = PoolKind::NodeShared;
    const LOW_WATER_MARK: usize = 1024;
    const HIGH_WATER_MARK: usize = 8192;
    const MAX_IDLE: Duration = Duration::from_secs(10);
    const MIN_THREAD_CACHE_SIZE: usize = 64;
    const TRANSFER_BATCH_SIZE: usize = 128;

    fn create() -> Self {
        HotObj { payload: [0; 128] }
    }
}

struct TlsObj;

impl Poolable for TlsObj {
    const KIND: PoolKind = PoolKind::ThreadLocal;
    const LOW_WATER_MARK: usize = 64;
    const HIGH_WATER_MARK: usize = 1024;
    const MAX_IDLE: Duration = Duration::from_secs(10);

    fn create() -> Self {
        TlsObj
    }
}

struct RawObj;

impl Poolable for RawObj {
    const KIND: PoolKind = PoolKind::Disabled;

    fn create() -> Self {
        RawObj
    }
}

fn bench_get_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_put");

    // Warm the caches so the hot path is what's measured.
    for _ in 0..16 {
        drop(pool::get::<HotObj>());
    }

    group.bench_function("node_shared_hot", |b| {
        b.iter(|| {
            black_box(pool::get::<HotObj>());
        });
    });

    group.bench_function("thread_local", |b| {
        b.iter(|| {
            black_box(pool::get::<TlsObj>());
        });
    });

    group.bench_function("disabled_baseline", |b| {
        b.iter(|| {
            black_box(pool::get::<RawObj>());
        });
    });

    group.finish();
}

fn bench_stack_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("stack_allocation");

    group.bench_function("user_stack_pooled", |b| {
        b.iter(|| {
            black_box(filament_runtime::stack::create_user_stack());
        });
    });

    group.bench_function("system_stack_pooled", |b| {
        b.iter(|| {
            black_box(filament_runtime::stack::create_system_stack());
        });
    });

    group.finish();
}

criterion_group!(benches, bench_get_put, bench_stack_allocation);
criterion_main!(benches);
