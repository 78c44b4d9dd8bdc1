use criterion::{black_box, criterion_group, criterion_main, Criterion};
use limit_rate::{
    CopierEvent, ManualClock, PipeSource, QuotaTable, RateLimiter, RecordingSink, ThrottledCopier,
};
use std::sync::Arc;
use std::time::Duration;

// Huge quota so every grant succeeds and the loop measures the accounting path.
fn grant_uncontended(c: &mut Criterion) {
    let clock = ManualClock::new();
    let limiter = RateLimiter::new(QuotaTable::uniform(u64::MAX / 2, 1000).unwrap())
        .with_clock(clock.clone());
    let mut state = limiter.register_limiter();

    c.bench_function("get_max_units_uncontended", |b| {
        b.iter(|| {
            clock.advance(Duration::from_micros(10));
            black_box(limiter.get_max_units(black_box(4096), Some(&mut state)))
        });
    });
}

fn grant_unregistered(c: &mut Criterion) {
    let limiter = RateLimiter::new(QuotaTable::uniform(1_048_576, 1000).unwrap());

    c.bench_function("get_max_units_unregistered", |b| {
        b.iter(|| black_box(limiter.get_max_units(black_box(4096), None)));
    });
}

fn grant_contended(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let limiter = Arc::new(RateLimiter::new(QuotaTable::uniform(u64::MAX / 2, 1000).unwrap()));

    c.bench_function("get_max_units_8_tasks", |b| {
        b.to_async(&rt).iter(|| {
            let limiter = limiter.clone();
            async move {
                let tasks = (0..8).map(|_| {
                    let limiter = limiter.clone();
                    tokio::spawn(async move {
                        let mut state = limiter.register_limiter();
                        for _ in 0..64 {
                            black_box(limiter.get_max_units(1024, Some(&mut state)));
                        }
                    })
                });
                futures::future::join_all(tasks).await;
            }
        });
    });
}

fn copy_one_body(c: &mut Criterion) {
    let clock = ManualClock::new();
    let limiter = Arc::new(
        RateLimiter::new(QuotaTable::uniform(1_048_576, 1000).unwrap()).with_clock(clock),
    );
    let body = vec![0u8; 64 * 1024];

    c.bench_function("copy_64k_body", |b| {
        b.iter(|| {
            let mut copier = ThrottledCopier::new(
                limiter.clone(),
                PipeSource::from_bytes(&body),
                RecordingSink::new(),
            );
            black_box(copier.handle(CopierEvent::WriteReady))
        });
    });
}

criterion_group!(benches, grant_uncontended, grant_unregistered, grant_contended, copy_one_body);
criterion_main!(benches);
