//! The host-facing facade.
//!
//! [`Throttle`] wires the configuration snapshot, stress controller,
//! scheduler, interpolation cache and any attached lookup caches together
//! behind one `&self` API that both the simulation and render contexts can
//! share.
//!
//! Per step:
//!
//! 1. `begin_step(step)` and `observe(observer)`
//! 2. `should_update(handle, step, distance_squared, overrides)` per object
//! 3. real update, then `commit(handle, step, state)`
//! 4. `record_step_duration(ms)`
//!
//! Per frame: `sample(handle, sub_step, &live)`.
//!
//! ```
//! use tickwise_logic::geometry::Vec3;
//! use tickwise_logic::handle::ObjectHandle;
//! use tickwise_logic::schedule::OverrideFlags;
//! use tickwise_logic::throttle::Throttle;
//!
//! let throttle: Throttle<Vec3> = Throttle::default();
//! let cow = ObjectHandle::from_index(0);
//! let far = 100.0 * 100.0;
//! for step in 0..=4 {
//!     throttle.begin_step(step);
//!     if throttle.should_update(cow, step, far, OverrideFlags::NONE) {
//!         throttle.commit(cow, step, Vec3::new(step as f64, 0.0, 0.0));
//!     }
//! }
//! // Committed at steps 0 and 4; halfway to the next update we are still
//! // blending the 0 -> 4 move.
//! let drawn = throttle.sample_at(cow, 6, 0.0, &Vec3::ZERO);
//! assert_eq!(drawn, Vec3::new(2.0, 0.0, 0.0));
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::cache::CacheStats;
use crate::config::{ConfigError, SharedConfig, ThrottleConfig};
use crate::geometry::{RegionPos, Vec3};
use crate::handle::ObjectHandle;
use crate::lookup::LookupCache;
use crate::motion::{Interpolate, MotionCache, MotionState};
use crate::schedule::{Decision, OverrideFlags, Reason, ScheduleContext, UpdateScheduler};
use crate::stress::LoadController;
use crate::tier::{Tier, TierStats};

#[derive(Debug, Default)]
struct DecisionCounters {
    decisions: AtomicU64,
    updates: AtomicU64,
    overrides: AtomicU64,
    swept: AtomicU64,
}

/// Snapshot of everything the throttle tracks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottleStats {
    pub config_version: u64,
    pub enabled: bool,
    pub step: u64,
    pub stress: f64,
    pub average_step_ms: Option<f64>,
    pub tracked: usize,
    pub interpolated: usize,
    pub decisions: u64,
    pub updates: u64,
    pub overrides: u64,
    /// Schedule entries plus motion pairs evicted by horizon sweeps.
    pub swept: u64,
    pub caches: Vec<CacheStats>,
}

impl ThrottleStats {
    /// Fraction of decisions that ran the real update.
    pub fn update_ratio(&self) -> f64 {
        if self.decisions == 0 {
            1.0
        } else {
            self.updates as f64 / self.decisions as f64
        }
    }
}

/// Viewer-relative update throttle for one simulation.
pub struct Throttle<S: Interpolate = MotionState> {
    config: SharedConfig,
    load: LoadController,
    scheduler: UpdateScheduler,
    motion: MotionCache<S>,
    lookups: RwLock<Vec<Arc<dyn LookupCache>>>,
    step: AtomicU64,
    observer: RwLock<Option<Vec3>>,
    counters: DecisionCounters,
}

impl<S: Interpolate> Default for Throttle<S> {
    fn default() -> Self {
        let config = SharedConfig::default();
        let load = LoadController::new(config.snapshot().config.stress.clone());
        Self {
            config,
            load,
            scheduler: UpdateScheduler::new(),
            motion: MotionCache::new(),
            lookups: RwLock::new(Vec::new()),
            step: AtomicU64::new(0),
            observer: RwLock::new(None),
            counters: DecisionCounters::default(),
        }
    }
}

impl<S: Interpolate> Throttle<S> {
    pub fn new(config: &ThrottleConfig) -> Result<Self, Vec<ConfigError>> {
        let config = SharedConfig::new(config)?;
        let load = LoadController::new(config.snapshot().config.stress.clone());
        Ok(Self {
            config,
            load,
            ..Self::default()
        })
    }

    /// Register a lookup cache to receive step, observer, region and config
    /// events.
    pub fn attach(&self, cache: Arc<dyn LookupCache>) {
        cache.apply_config(&self.config.snapshot().config);
        cache.begin_step(self.current_step());
        if let Some(observer) = self.observer() {
            cache.observe(observer);
        }
        self.lookups.write().push(cache);
    }

    fn each_lookup(&self, mut f: impl FnMut(&dyn LookupCache)) {
        for cache in self.lookups.read().iter() {
            f(cache.as_ref());
        }
    }

    // ── Step lifecycle ──────────────────────────────────────────────────

    pub fn begin_step(&self, step: u64) {
        self.step.store(step, Ordering::Relaxed);
        self.each_lookup(|cache| cache.begin_step(step));

        let snapshot = self.config.snapshot();
        let config = &snapshot.config;
        if config.sweep_interval > 0 && step > 0 && step % config.sweep_interval == 0 {
            let scheduled = self.scheduler.sweep(step, config.entry_horizon);
            let motion = self.motion.sweep(step, config.entry_horizon);
            if scheduled + motion > 0 {
                self.counters
                    .swept
                    .fetch_add((scheduled + motion) as u64, Ordering::Relaxed);
                log::debug!(
                    "horizon sweep at step {}: {} schedule entries, {} motion pairs evicted",
                    step,
                    scheduled,
                    motion
                );
            }
        }
    }

    pub fn current_step(&self) -> u64 {
        self.step.load(Ordering::Relaxed)
    }

    /// Feed the observer position; movement-sensitive caches react to it.
    pub fn observe(&self, observer: Vec3) {
        if !observer.is_finite() {
            return;
        }
        *self.observer.write() = Some(observer);
        self.each_lookup(|cache| cache.observe(observer));
    }

    pub fn observer(&self) -> Option<Vec3> {
        *self.observer.read()
    }

    /// Squared distance from the last observed position, or 0 with no
    /// observer yet (everything counts as near).
    pub fn distance_squared_to_observer(&self, position: &Vec3) -> f64 {
        match self.observer() {
            Some(observer) => observer.distance_squared(position),
            None => 0.0,
        }
    }

    pub fn record_step_duration(&self, ms: f64) {
        self.load.record_step_duration(ms);
    }

    pub fn stress_factor(&self) -> f64 {
        self.load.stress_factor()
    }

    pub fn is_under_load(&self) -> bool {
        self.load.is_under_load()
    }

    // ── Scheduling ──────────────────────────────────────────────────────

    /// Full decision with tier and reason.
    pub fn decide(
        &self,
        handle: ObjectHandle,
        step: u64,
        distance_squared: f64,
        overrides: OverrideFlags,
    ) -> Decision {
        let snapshot = self.config.snapshot();
        if !snapshot.config.enabled {
            self.counters.decisions.fetch_add(1, Ordering::Relaxed);
            self.counters.updates.fetch_add(1, Ordering::Relaxed);
            return Decision {
                update: true,
                tier: Tier::FULL_RATE,
                reason: Reason::Disabled,
            };
        }
        let ctx = ScheduleContext {
            tiers: &snapshot.tiers,
            stress: self.load.stress_factor(),
            active_window: snapshot.config.active_window,
        };
        let decision = self
            .scheduler
            .decide(handle, step, distance_squared, overrides, &ctx);
        self.counters.decisions.fetch_add(1, Ordering::Relaxed);
        if decision.update {
            self.counters.updates.fetch_add(1, Ordering::Relaxed);
        }
        if decision.reason == Reason::Override {
            self.counters.overrides.fetch_add(1, Ordering::Relaxed);
        }
        decision
    }

    /// Whether the host should run the real update for `handle` this step.
    pub fn should_update(
        &self,
        handle: ObjectHandle,
        step: u64,
        distance_squared: f64,
        overrides: OverrideFlags,
    ) -> bool {
        self.decide(handle, step, distance_squared, overrides).update
    }

    /// Keep `handle` at full rate for the configured activity window.
    pub fn mark_active(&self, handle: ObjectHandle, step: u64) {
        let window = self.config.snapshot().config.active_window;
        self.scheduler.mark_active(handle, step, window);
    }

    /// Record the state produced by a real update.
    pub fn commit(&self, handle: ObjectHandle, step: u64, state: S) {
        if !self.config.snapshot().config.enabled {
            return;
        }
        let (interval, detail) = self.scheduler.commit(handle, step);
        self.motion.commit(handle, step, state, interval, detail);
    }

    /// Interpolated state at the current step.
    pub fn sample(&self, handle: ObjectHandle, sub_step: f64, live: &S) -> S {
        self.sample_at(handle, self.current_step(), sub_step, live)
    }

    pub fn sample_at(&self, handle: ObjectHandle, step: u64, sub_step: f64, live: &S) -> S {
        if !self.config.snapshot().config.enabled {
            return live.clone();
        }
        self.motion.sample(handle, step, sub_step, live)
    }

    /// Tier `distance_squared` falls in under the current stress.
    pub fn tier_for(&self, distance_squared: f64) -> Tier {
        self.config
            .snapshot()
            .tiers
            .classify(distance_squared, self.load.stress_factor())
    }

    /// Per-tier population of a batch of squared distances.
    pub fn classify_batch(&self, distances_squared: &[f64]) -> TierStats {
        self.config
            .snapshot()
            .tiers
            .classify_batch(distances_squared, self.load.stress_factor())
    }

    // ── Lifetime ────────────────────────────────────────────────────────

    /// Forget `handle`. Stale generations are ignored.
    pub fn remove(&self, handle: ObjectHandle) {
        self.scheduler.remove(handle);
        self.motion.remove(handle);
    }

    /// Drop all per-object state and every attached cache.
    pub fn clear_all(&self) {
        let tracked = self.scheduler.len();
        self.scheduler.clear();
        self.motion.clear();
        self.each_lookup(|cache| cache.invalidate_all());
        log::info!("throttle cleared: {} tracked objects dropped", tracked);
    }

    /// Forward a region unload or edit to the lookup caches.
    pub fn invalidate_region(&self, region: RegionPos) -> usize {
        let mut dropped = 0;
        self.each_lookup(|cache| dropped += cache.invalidate_region(region));
        dropped
    }

    // ── Configuration ───────────────────────────────────────────────────

    /// Validate and swap in a new configuration. Schedule and
    /// interpolation state carry over unless the master switch flips, since
    /// nothing is recorded while disabled. On error nothing changes.
    pub fn refresh_from_config(&self, config: &ThrottleConfig) -> Result<u64, Vec<ConfigError>> {
        let was_enabled = self.config.snapshot().config.enabled;
        let version = self.config.replace(config)?;
        let snapshot = self.config.snapshot();
        if snapshot.config.enabled != was_enabled {
            self.scheduler.clear();
            self.motion.clear();
        }
        self.load.reconfigure(snapshot.config.stress.clone());
        self.each_lookup(|cache| cache.apply_config(&snapshot.config));
        log::info!(
            "throttle config refreshed to version {} ({} tiers, enabled={})",
            version,
            snapshot.tiers.tier_count(),
            snapshot.config.enabled
        );
        Ok(version)
    }

    pub fn config_version(&self) -> u64 {
        self.config.version()
    }

    pub fn config(&self) -> ThrottleConfig {
        self.config.snapshot().config.clone()
    }

    // ── Introspection ───────────────────────────────────────────────────

    pub fn stats(&self) -> ThrottleStats {
        let snapshot = self.config.snapshot();
        let mut caches = Vec::new();
        self.each_lookup(|cache| caches.push(cache.stats()));
        ThrottleStats {
            config_version: snapshot.version,
            enabled: snapshot.config.enabled,
            step: self.current_step(),
            stress: self.load.stress_factor(),
            average_step_ms: self.load.average_step_ms(),
            tracked: self.scheduler.len(),
            interpolated: self.motion.len(),
            decisions: self.counters.decisions.load(Ordering::Relaxed),
            updates: self.counters.updates.load(Ordering::Relaxed),
            overrides: self.counters.overrides.load(Ordering::Relaxed),
            swept: self.counters.swept.load(Ordering::Relaxed),
            caches,
        }
    }

    /// One-line-per-component summary for debug overlays.
    pub fn debug_stats(&self) -> String {
        let stats = self.stats();
        let mut out = format!(
            "Throttle: step {}, stress {:.2}, {} tracked, {} interpolated, {:.1}% updated, enabled={}",
            stats.step,
            stats.stress,
            stats.tracked,
            stats.interpolated,
            stats.update_ratio() * 100.0,
            stats.enabled
        );
        for cache in &stats.caches {
            out.push_str(&format!(
                "\n  {}: {} entries, {:.1}% hit rate, {} evicted",
                cache.name,
                cache.entries,
                cache.hit_rate() * 100.0,
                cache.evictions
            ));
        }
        out
    }
}
