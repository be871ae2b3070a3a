//! Observer-relative caches: sound occlusion and line of sight.
//!
//! Both results depend on where the observer stands, so occlusion entries are
//! dropped wholesale once the observer strays far enough from where they were
//! computed, and visibility is rechecked on a fixed cadence.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::cache::{CachePolicy, CacheStats, ExpiringCache, Ttl};
use crate::config::{OcclusionSettings, ThrottleConfig, VisibilitySettings};
use crate::geometry::{CellPos, RegionPos, Vec3};
use crate::handle::ObjectHandle;

use super::LookupCache;

const STATIC_SOURCE_MARKERS: [&str; 5] = ["water", "lava", "fire", "ambient", "portal"];

/// Looping ambient sources that sit in one place and replay constantly.
/// These benefit most from occlusion caching.
pub fn is_static_source(sound_name: &str) -> bool {
    STATIC_SOURCE_MARKERS
        .iter()
        .any(|marker| sound_name.contains(marker))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OcclusionKey {
    pub source: CellPos,
    pub sound: u32,
}

impl OcclusionKey {
    pub fn new(source: CellPos, sound: u32) -> Self {
        Self { source, sound }
    }
}

fn valid_factor(factor: &f32) -> bool {
    factor.is_finite() && (0.0..=1.0).contains(factor)
}

fn occlusion_policy(settings: &OcclusionSettings) -> CachePolicy {
    CachePolicy::default()
        .with_capacity(settings.capacity)
        .with_ttl(Ttl::Steps(settings.ttl_steps))
        .with_movement_threshold(settings.invalidate_distance)
}

/// Occlusion factor per sound source, in `[0, 1]`.
#[derive(Debug)]
pub struct OcclusionCache {
    inner: ExpiringCache<OcclusionKey, f32>,
    cleanup_interval: AtomicU64,
    last_cleanup: AtomicU64,
}

impl Default for OcclusionCache {
    fn default() -> Self {
        Self::new(&OcclusionSettings::default())
    }
}

impl OcclusionCache {
    pub fn new(settings: &OcclusionSettings) -> Self {
        Self {
            inner: ExpiringCache::new("occlusion", occlusion_policy(settings))
                .with_validator(valid_factor),
            cleanup_interval: AtomicU64::new(settings.cleanup_interval),
            last_cleanup: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &OcclusionKey) -> Option<f32> {
        self.inner.get(key)
    }

    /// Cached factor, or run the raycast and cache its result.
    ///
    /// A factor outside `[0, 1]` is returned but not stored.
    pub fn occlusion_or_compute<F>(&self, key: OcclusionKey, raycast: F) -> f32
    where
        F: FnOnce() -> f32,
    {
        if let Some(factor) = self.inner.get(&key) {
            return factor;
        }
        let factor = raycast();
        if valid_factor(&factor) {
            self.inner.put(key, factor);
        }
        factor
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl LookupCache for OcclusionCache {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn begin_step(&self, step: u64) {
        self.inner.begin_step(step);
        let last = self.last_cleanup.load(Ordering::Relaxed);
        if step.saturating_sub(last) >= self.cleanup_interval.load(Ordering::Relaxed) {
            self.last_cleanup.store(step, Ordering::Relaxed);
            self.inner.sweep_expired();
        }
    }

    fn observe(&self, observer: Vec3) {
        self.inner.update_reference(observer);
    }

    /// Block edits in `region` change what sounds from there pass through.
    fn invalidate_region(&self, region: RegionPos) -> usize {
        self.inner.invalidate_where(|key, _| region.contains(&key.source))
    }

    fn invalidate_all(&self) {
        self.inner.invalidate_all();
    }

    fn apply_config(&self, config: &ThrottleConfig) {
        let settings = &config.caches.occlusion;
        self.inner.resize(settings.capacity);
        self.inner.set_ttl(Some(Ttl::Steps(settings.ttl_steps)));
        self.inner
            .set_movement_threshold(Some(settings.invalidate_distance));
        self.cleanup_interval
            .store(settings.cleanup_interval, Ordering::Relaxed);
    }

    fn stats(&self) -> CacheStats {
        self.inner.stats()
    }
}

// ── Visibility ──────────────────────────────────────────────────────────

/// Result of one line-of-sight test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisibilityRecord {
    pub visible: bool,
    pub checked_at: u64,
}

fn visibility_ttl(settings: &VisibilitySettings) -> Ttl {
    // A record is reused past `cache_duration` until the next check step.
    Ttl::Steps(settings.cache_duration + settings.check_interval)
}

/// Per-object line-of-sight results.
///
/// Objects inside the always-visible radius skip the test. Otherwise a
/// record younger than `cache_duration` is reused, an older one is reused
/// until the next step divisible by `check_interval`, and then the test
/// reruns.
#[derive(Debug)]
pub struct VisibilityCache {
    inner: ExpiringCache<ObjectHandle, VisibilityRecord>,
    settings: RwLock<VisibilitySettings>,
}

impl Default for VisibilityCache {
    fn default() -> Self {
        Self::new(&VisibilitySettings::default())
    }
}

impl VisibilityCache {
    pub fn new(settings: &VisibilitySettings) -> Self {
        let policy = CachePolicy::default()
            .with_capacity(settings.capacity)
            .with_ttl(visibility_ttl(settings));
        Self {
            inner: ExpiringCache::new("visibility", policy),
            settings: RwLock::new(settings.clone()),
        }
    }

    /// Whether `handle` can be seen, using `line_of_sight` only when the
    /// cached record is stale.
    pub fn is_visible<F>(&self, handle: ObjectHandle, distance_squared: f64, line_of_sight: F) -> bool
    where
        F: FnOnce() -> bool,
    {
        let (radius, cache_duration, check_interval) = {
            let s = self.settings.read();
            (s.always_visible_distance, s.cache_duration, s.check_interval.max(1))
        };
        if distance_squared < radius * radius {
            return true;
        }
        let step = self.inner.current_step();
        if let Some(record) = self.inner.get(&handle) {
            if step.saturating_sub(record.checked_at) < cache_duration
                || step % check_interval != 0
            {
                return record.visible;
            }
        }
        let visible = line_of_sight();
        self.inner.put(
            handle,
            VisibilityRecord {
                visible,
                checked_at: step,
            },
        );
        visible
    }

    pub fn remove(&self, handle: ObjectHandle) {
        self.inner.invalidate(&handle);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl LookupCache for VisibilityCache {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn begin_step(&self, step: u64) {
        self.inner.begin_step(step);
    }

    fn invalidate_all(&self) {
        self.inner.invalidate_all();
    }

    fn apply_config(&self, config: &ThrottleConfig) {
        let settings = &config.caches.visibility;
        self.inner.resize(settings.capacity);
        self.inner.set_ttl(Some(visibility_ttl(settings)));
        *self.settings.write() = settings.clone();
    }

    fn stats(&self) -> CacheStats {
        self.inner.stats()
    }
}
