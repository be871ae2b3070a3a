//! End-to-end scenarios through the public API.
//!
//! Each test drives a [`Throttle`] (or a bare cache) the way a host would:
//! begin the step, observe, decide, commit, sample.

use std::sync::Arc;
use std::time::Duration;

use tickwise_logic::cache::{CachePolicy, ExpiringCache, ManualClock, Ttl};
use tickwise_logic::config::ThrottleConfig;
use tickwise_logic::geometry::{CellPos, RegionPos, Vec3};
use tickwise_logic::lookup::{
    OcclusionCache, OcclusionKey, PathCache, PathKey, SpatialCache, VisibilityCache,
};
use tickwise_logic::motion::{MotionState, Orientation};
use tickwise_logic::schedule::Reason;
use tickwise_logic::{ObjectHandle, OverrideFlags, Throttle};

// ── Helpers ────────────────────────────────────────────────────────────

const FAR: f64 = 200.0 * 200.0;

fn x(v: f64) -> Vec3 {
    Vec3::new(v, 0.0, 0.0)
}

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

// ── Scheduling ─────────────────────────────────────────────────────────

#[test]
fn idle_distant_object_updates_every_fourth_step() {
    let throttle: Throttle<Vec3> = Throttle::default();
    let cow = ObjectHandle::from_index(0);

    let mut updated = Vec::new();
    for step in 0..=7 {
        throttle.begin_step(step);
        if throttle.should_update(cow, step, FAR, OverrideFlags::NONE) {
            updated.push(step);
            throttle.commit(cow, step, x(step as f64 * 10.0));
        }
    }
    assert_eq!(updated, vec![0, 4]);

    // Commits at 0 (x=0) and 4 (x=40); at step 6 plus half a step we are
    // 2.5 / 4 = 0.625 of the way.
    let drawn = throttle.sample_at(cow, 6, 0.5, &x(-1.0));
    assert!(approx(drawn.x, 25.0));
}

#[test]
fn override_wins_at_any_distance() {
    let throttle: Throttle<Vec3> = Throttle::default();
    let rider = ObjectHandle::from_index(5);
    let flags = OverrideFlags {
        is_observer_mount: true,
        ..OverrideFlags::NONE
    };
    for step in 0..20 {
        for distance_squared in [0.0, FAR, f64::INFINITY] {
            let decision = throttle.decide(rider, step, distance_squared, flags);
            assert!(decision.update);
            assert_eq!(decision.reason, Reason::Override);
        }
    }
}

#[test]
fn override_leaves_object_active_for_a_while() {
    let config = ThrottleConfig {
        active_window: 10,
        ..ThrottleConfig::default()
    };
    let throttle: Throttle<Vec3> = Throttle::new(&config).unwrap();
    let wolf = ObjectHandle::from_index(1);
    let hurt = OverrideFlags {
        recently_damaged: true,
        ..OverrideFlags::NONE
    };
    assert!(throttle.should_update(wolf, 100, FAR, hurt));
    for step in 101..110 {
        assert!(throttle.should_update(wolf, step, FAR, OverrideFlags::NONE));
    }
    let skipped = (110..118)
        .filter(|&step| !throttle.should_update(wolf, step, FAR, OverrideFlags::NONE))
        .count();
    assert_eq!(skipped, 6);
}

#[test]
fn recycled_handle_never_inherits_motion() {
    let throttle: Throttle<Vec3> = Throttle::default();
    let old = ObjectHandle::new(9, 0);
    throttle.should_update(old, 0, FAR, OverrideFlags::NONE);
    throttle.commit(old, 0, x(0.0));
    throttle.commit(old, 4, x(40.0));

    // Slot 9 is reused without a remove.
    let new = ObjectHandle::new(9, 1);
    let decision = throttle.decide(new, 5, FAR, OverrideFlags::NONE);
    assert!(decision.update);
    assert_eq!(decision.reason, Reason::Recycled);
    throttle.commit(new, 5, x(500.0));
    assert_eq!(throttle.sample_at(new, 6, 0.0, &x(0.0)), x(500.0));
}

#[test]
fn motion_state_blends_position_and_facing() {
    let throttle: Throttle<MotionState> = Throttle::default();
    let h = ObjectHandle::from_index(4);
    let facing = |yaw| MotionState {
        position: x(0.0),
        orientation: Some(Orientation { yaw, pitch: 0.0 }),
        pose: None,
    };
    throttle.should_update(h, 0, FAR, OverrideFlags::NONE);
    throttle.commit(h, 0, facing(350.0));
    let mut turned = facing(10.0);
    turned.position = x(8.0);
    throttle.commit(h, 4, turned);

    let drawn = throttle.sample_at(h, 5, 0.0, &MotionState::default());
    assert!(approx(drawn.position.x, 2.0));
    let yaw = drawn.orientation.map(|o| o.yaw).unwrap_or_default();
    assert!((yaw - 355.0).abs() < 1e-3);
}

// ── Stress ─────────────────────────────────────────────────────────────

#[test]
fn sustained_overload_saturates_stress() {
    let throttle: Throttle<Vec3> = Throttle::default();
    let target = throttle.config().stress.target_step_ms;
    for _ in 0..20 {
        throttle.record_step_duration(target * 2.0);
        assert!(throttle.stress_factor() <= 1.0);
    }
    assert_eq!(throttle.stress_factor(), 1.0);
    throttle.record_step_duration(target * 2.0);
    assert_eq!(throttle.stress_factor(), 1.0);
    assert!(throttle.is_under_load());
}

#[test]
fn stress_pulls_objects_into_stricter_tiers() {
    let throttle: Throttle<Vec3> = Throttle::default();
    let distance_squared = 20.0 * 20.0;
    assert_eq!(throttle.tier_for(distance_squared).update_interval, 1);
    let target = throttle.config().stress.target_step_ms;
    for _ in 0..20 {
        throttle.record_step_duration(target * 4.0);
    }
    // Near boundary 32 shrinks to 16 at full stress.
    assert_eq!(throttle.tier_for(distance_squared).update_interval, 2);
    // Close objects stay at full rate.
    assert_eq!(throttle.tier_for(7.0 * 7.0).update_interval, 1);
}

// ── Configuration ──────────────────────────────────────────────────────

#[test]
fn json_config_is_repaired_and_applied() {
    let json = r#"{
        "tiers": [
            { "name": "near", "max_distance": 24.0, "update_interval": 2 },
            { "name": "far", "update_interval": 0, "detail": "static_pose" }
        ],
        "caches": { "path": { "capacity": 16 } }
    }"#;
    let config = ThrottleConfig::from_json(json).unwrap();
    assert_eq!(config.tiers[0].update_interval, 1);
    assert_eq!(config.tiers[1].update_interval, 1);
    assert_eq!(config.caches.path.capacity, 16);
    assert_eq!(config.caches.path.ttl_ms, 3000);

    let throttle: Throttle<Vec3> = Throttle::new(&config).unwrap();
    assert!(throttle.tier_for(FAR).is_full_rate());
}

#[test]
fn live_refresh_resizes_attached_caches() {
    let throttle: Throttle<Vec3> = Throttle::default();
    let paths: Arc<PathCache<u32>> = Arc::new(PathCache::default());
    throttle.attach(paths.clone());
    for i in 0..50 {
        let key = PathKey::new(CellPos::new(i, 0, 0), CellPos::new(0, 0, i), 0);
        paths.find_or_compute(key, || Some(i as u32));
    }
    let mut config = ThrottleConfig::default();
    config.caches.path.capacity = 10;
    assert_eq!(throttle.refresh_from_config(&config), Ok(2));
    assert_eq!(paths.len(), 10);
}

// ── Caches ─────────────────────────────────────────────────────────────

#[test]
fn observer_movement_invalidates_occlusion() {
    let throttle: Throttle<Vec3> = Throttle::default();
    let occlusion = Arc::new(OcclusionCache::default());
    throttle.attach(occlusion.clone());
    let waterfall = OcclusionKey::new(CellPos::new(10, 60, 10), 3);

    throttle.begin_step(1);
    throttle.observe(Vec3::new(0.0, 64.0, 0.0));
    assert_eq!(occlusion.occlusion_or_compute(waterfall, || 0.7), 0.7);

    // Small shuffle: still cached.
    throttle.begin_step(2);
    throttle.observe(Vec3::new(1.0, 64.0, 1.0));
    assert_eq!(occlusion.occlusion_or_compute(waterfall, || 0.2), 0.7);

    // Walked three blocks: recomputed.
    throttle.begin_step(3);
    throttle.observe(Vec3::new(3.0, 64.0, 0.0));
    assert_eq!(occlusion.occlusion_or_compute(waterfall, || 0.2), 0.2);
}

#[test]
fn lru_evicts_least_recently_accessed() {
    let cache: ExpiringCache<&str, u32> =
        ExpiringCache::new("lru", CachePolicy::default().with_capacity(3));
    cache.put("a", 1);
    cache.put("b", 2);
    cache.put("c", 3);
    cache.get(&"a");
    cache.get(&"b");
    cache.put("d", 4);
    assert!(!cache.contains(&"c"));
    assert!(cache.contains(&"a"));
    assert!(cache.contains(&"b"));
    assert!(cache.contains(&"d"));
}

#[test]
fn ttl_round_trip_shrinks_cache() {
    let clock = Arc::new(ManualClock::new());
    let cache: ExpiringCache<u32, &str> = ExpiringCache::new(
        "ttl",
        CachePolicy::default().with_ttl(Ttl::Wall(Duration::from_secs(3))),
    )
    .with_clock(clock.clone());
    cache.put(1, "route");
    assert_eq!(cache.get(&1), Some("route"));
    clock.advance(Duration::from_secs(3));
    assert_eq!(cache.get(&1), None);
    assert_eq!(cache.len(), 0);
}

#[test]
fn region_unload_reaches_every_spatial_cache() {
    let throttle: Throttle<Vec3> = Throttle::default();
    let biomes: Arc<SpatialCache<u8>> = Arc::new(SpatialCache::default());
    let paths: Arc<PathCache<u32>> = Arc::new(PathCache::default());
    let occlusion = Arc::new(OcclusionCache::default());
    throttle.attach(biomes.clone());
    throttle.attach(paths.clone());
    throttle.attach(occlusion.clone());
    throttle.observe(Vec3::new(0.0, 64.0, 0.0));
    let edited = OcclusionKey::new(CellPos::new(2, 64, 2), 9);
    let elsewhere = OcclusionKey::new(CellPos::new(40, 64, 2), 9);
    occlusion.occlusion_or_compute(edited, || 0.3);
    occlusion.occlusion_or_compute(elsewhere, || 0.7);

    biomes.classify_or_compute(CellPos::new(2, 64, 2), || 1);
    biomes.classify_or_compute(CellPos::new(40, 64, 2), || 2);
    paths.find_or_compute(
        PathKey::new(CellPos::new(40, 64, 2), CellPos::new(3, 64, 3), 0),
        || Some(7),
    );

    assert_eq!(throttle.invalidate_region(RegionPos::new(0, 0)), 3);
    assert_eq!(biomes.region_count(), 1);
    assert!(paths.is_empty());
    assert_eq!(occlusion.get(&edited), None);
    assert_eq!(occlusion.get(&elsewhere), Some(0.7));
}

#[test]
fn visibility_skips_raycasts_between_checks() {
    let throttle: Throttle<Vec3> = Throttle::default();
    let visibility = Arc::new(VisibilityCache::default());
    throttle.attach(visibility.clone());
    let zombie = ObjectHandle::from_index(2);

    let mut raycasts = 0;
    for step in 100..120 {
        throttle.begin_step(step);
        visibility.is_visible(zombie, FAR, || {
            raycasts += 1;
            true
        });
    }
    // Steps 100 and 110: each result lives ten steps and 110 is a check step.
    assert_eq!(raycasts, 2);
}

// ── Sharing ────────────────────────────────────────────────────────────

#[test]
fn simulation_and_render_share_one_throttle() {
    let throttle: Arc<Throttle<Vec3>> = Arc::new(Throttle::default());
    let handles: Vec<ObjectHandle> = (0..64).map(ObjectHandle::from_index).collect();

    std::thread::scope(|scope| {
        let sim = Arc::clone(&throttle);
        let sim_handles = handles.clone();
        scope.spawn(move || {
            for step in 0..200 {
                sim.begin_step(step);
                for h in &sim_handles {
                    if sim.should_update(*h, step, FAR, OverrideFlags::NONE) {
                        sim.commit(*h, step, x(step as f64));
                    }
                }
            }
        });
        let render = Arc::clone(&throttle);
        scope.spawn(move || {
            for frame in 0..400 {
                for h in &handles {
                    let drawn = render.sample(*h, (frame % 3) as f64 / 3.0, &x(0.0));
                    assert!(drawn.x >= 0.0 && drawn.x < 200.0);
                }
            }
        });
    });
    assert_eq!(throttle.stats().tracked, 64);
}
