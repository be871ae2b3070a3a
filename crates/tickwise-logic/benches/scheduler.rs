use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tickwise_logic::cache::{CachePolicy, ExpiringCache, Ttl};
use tickwise_logic::geometry::Vec3;
use tickwise_logic::tier::TierClassifier;
use tickwise_logic::{ObjectHandle, OverrideFlags, Throttle};

const POPULATION: u32 = 5_000;

fn distance_squared(i: u32) -> f64 {
    let d = f64::from(i % 160);
    d * d
}

fn bench_should_update_steady_state(c: &mut Criterion) {
    let throttle: Throttle<Vec3> = Throttle::default();
    for i in 0..POPULATION {
        let h = ObjectHandle::from_index(i);
        throttle.should_update(h, 0, distance_squared(i), OverrideFlags::NONE);
    }

    c.bench_function("should_update_5000_objects", |b| {
        let mut step = 1u64;
        b.iter(|| {
            let mut updates = 0u32;
            for i in 0..POPULATION {
                if throttle.should_update(
                    ObjectHandle::from_index(i),
                    step,
                    black_box(distance_squared(i)),
                    OverrideFlags::NONE,
                ) {
                    updates += 1;
                }
            }
            step += 1;
            black_box(updates)
        })
    });
}

fn bench_sample(c: &mut Criterion) {
    let throttle: Throttle<Vec3> = Throttle::default();
    let far = 150.0 * 150.0;
    for i in 0..POPULATION {
        let h = ObjectHandle::from_index(i);
        throttle.should_update(h, 0, far, OverrideFlags::NONE);
        throttle.commit(h, 0, Vec3::ZERO);
        throttle.commit(h, 4, Vec3::new(4.0, 0.0, 0.0));
    }
    throttle.begin_step(5);

    c.bench_function("sample_5000_objects", |b| {
        b.iter(|| {
            let mut sum = 0.0;
            for i in 0..POPULATION {
                sum += throttle
                    .sample(ObjectHandle::from_index(i), black_box(0.5), &Vec3::ZERO)
                    .x;
            }
            black_box(sum)
        })
    });
}

fn bench_classify(c: &mut Criterion) {
    let tiers = TierClassifier::default();
    let distances: Vec<f64> = (0..POPULATION).map(distance_squared).collect();

    c.bench_function("classify_batch_5000", |b| {
        b.iter(|| black_box(tiers.classify_batch(black_box(&distances), 0.3)))
    });
}

fn bench_cache_hit(c: &mut Criterion) {
    let cache: ExpiringCache<u32, f32> = ExpiringCache::new(
        "bench",
        CachePolicy::default()
            .with_capacity(4096)
            .with_ttl(Ttl::Steps(20)),
    );
    for i in 0..4096 {
        cache.put(i, 0.5);
    }

    c.bench_function("expiring_cache_hit", |b| {
        let mut key = 0u32;
        b.iter(|| {
            key = (key + 1) % 4096;
            black_box(cache.get(black_box(&key)))
        })
    });
}

criterion_group!(
    benches,
    bench_should_update_steady_state,
    bench_sample,
    bench_classify,
    bench_cache_hit
);
criterion_main!(benches);
