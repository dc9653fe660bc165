//! Context switch and uncontended lock costs

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use myrpc_core::SpinLock;
use myrpc_runtime::{Fiber, Mutex};

fn bench_resume_suspend(c: &mut Criterion) {
    let fiber = Fiber::new(|| loop {
        Fiber::suspend();
    })
    .expect("fiber stack");

    c.bench_function("fiber_resume_suspend", |b| {
        b.iter(|| black_box(fiber.resume()));
    });

    fiber.term();
}

fn bench_spawn_to_finish(c: &mut Criterion) {
    c.bench_function("fiber_create_run_drop", |b| {
        b.iter(|| {
            let fiber = Fiber::new(|| {
                black_box(1 + 1);
            })
            .expect("fiber stack");
            fiber.resume();
        });
    });
}

fn bench_uncontended_locks(c: &mut Criterion) {
    let mut group = c.benchmark_group("uncontended_lock");

    let mutex = Mutex::new(0u64);
    group.bench_function("fiber_mutex", |b| {
        b.iter(|| {
            *mutex.lock() += 1;
        });
    });

    let spin = SpinLock::new(0u64);
    group.bench_function("spinlock", |b| {
        b.iter(|| {
            *spin.lock() += 1;
        });
    });

    group.finish();
}

criterion_group!(benches, bench_resume_suspend, bench_spawn_to_finish, bench_uncontended_locks);
criterion_main!(benches);
