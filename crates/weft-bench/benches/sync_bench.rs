//! Synchronization primitive benchmarks.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use weft_core::barrier::{self, Barrier, BARRIER_SERIAL_THREAD};
use weft_core::mutex::{self, Mutex, MutexAttr, MUTEX_RECURSIVE};

fn bench_mutex_uncontended(c: &mut Criterion) {
    let m = Mutex::new();
    assert_eq!(mutex::init(&m, None), 0);
    c.bench_function("mutex_lock_unlock_uncontended", |b| {
        b.iter(|| {
            black_box(mutex::lock(&m));
            black_box(mutex::unlock(&m));
        });
    });
    assert_eq!(mutex::destroy(&m), 0);
}

fn bench_mutex_recursive_relock(c: &mut Criterion) {
    let mut attr = MutexAttr::new();
    assert_eq!(attr.set_kind(MUTEX_RECURSIVE), 0);
    let m = Mutex::new();
    assert_eq!(mutex::init(&m, Some(&attr)), 0);
    assert_eq!(mutex::lock(&m), 0);
    c.bench_function("mutex_recursive_relock", |b| {
        b.iter(|| {
            black_box(mutex::lock(&m));
            black_box(mutex::unlock(&m));
        });
    });
    assert_eq!(mutex::unlock(&m), 0);
    assert_eq!(mutex::destroy(&m), 0);
}

fn bench_barrier_single_thread(c: &mut Criterion) {
    let b = Barrier::new();
    assert_eq!(barrier::init(&b, None, 1), 0);
    c.bench_function("barrier_threshold_one_cycle", |bench| {
        bench.iter(|| {
            assert_eq!(barrier::wait(&b), BARRIER_SERIAL_THREAD);
        });
    });
    assert_eq!(barrier::destroy(&b), 0);
}

criterion_group!(
    benches,
    bench_mutex_uncontended,
    bench_mutex_recursive_relock,
    bench_barrier_single_thread
);
criterion_main!(benches);
