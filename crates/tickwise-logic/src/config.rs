//! Throttle configuration: data model, validation and live snapshots.
//!
//! The host owns configuration files; this module only parses a JSON
//! document it is handed, repairs recoverable mistakes, rejects the rest,
//! and publishes the result as an immutable, versioned snapshot.
//!
//! # Loading Flow
//!
//! 1. Parse with [`ThrottleConfig::from_json`] (or build in code)
//! 2. [`ThrottleConfig::sanitized`] clamps recoverable values (interval 0,
//!    near tier not every step, unsorted boundaries, zero cache sizes)
//! 3. [`validate_config`] reports anything that could not be repaired
//! 4. [`SharedConfig::replace`] swaps the new snapshot in atomically
//!
//! ```
//! use tickwise_logic::config::{validate_config, ThrottleConfig};
//!
//! let config = ThrottleConfig::default();
//! assert!(validate_config(&config).is_empty());
//! ```

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tier::{Detail, TierClassifier, TierSpec};

/// Longest accepted update interval, in steps.
pub const MAX_INTERVAL: u32 = 1024;

/// Top-level configuration for the scheduler, interpolation and caches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Master switch. When off every object updates every step.
    pub enabled: bool,
    /// Tiers in ascending boundary order; the first is the near tier.
    pub tiers: Vec<TierSpec>,
    /// Boundaries never shrink below this distance under stress.
    pub tier_floor: f64,
    /// `k` in `boundary * (1 - stress * k)`.
    pub stress_shrink: f64,
    /// Steps an object stays at full rate after `mark_active` or an override.
    pub active_window: u64,
    /// Schedule entries not updated for this many steps are evicted.
    pub entry_horizon: u64,
    /// How often (in steps) the horizon sweep runs.
    pub sweep_interval: u64,
    pub stress: StressConfig,
    pub caches: CacheSettings,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tiers: vec![
                TierSpec::bounded("near", 32.0, 1, Detail::Full),
                TierSpec::bounded("mid", 64.0, 2, Detail::Full),
                TierSpec::unbounded("far", 4, Detail::StaticPose),
            ],
            tier_floor: 8.0,
            stress_shrink: 0.5,
            active_window: 100, // ~5 s at 20 steps/s
            entry_horizon: 1200,
            sweep_interval: 200,
            stress: StressConfig::default(),
            caches: CacheSettings::default(),
        }
    }
}

/// Load-adaptive controller constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StressConfig {
    pub enabled: bool,
    /// Step duration the host is aiming for, in milliseconds.
    pub target_step_ms: f64,
    /// EMA weight of the newest sample.
    pub smoothing: f64,
    /// Stress rises while the average exceeds `target * raise_ratio`.
    pub raise_ratio: f64,
    pub raise_step: f64,
    pub lower_step: f64,
    /// `is_under_load` threshold.
    pub under_load_threshold: f64,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            target_step_ms: 50.0,
            smoothing: 0.1,
            raise_ratio: 1.5,
            raise_step: 0.05,
            lower_step: 0.02,
            under_load_threshold: 0.5,
        }
    }
}

/// Sizes and lifetimes for the lookup caches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub path: PathSettings,
    pub occlusion: OcclusionSettings,
    pub visibility: VisibilitySettings,
    pub spatial: SpatialSettings,
    pub rules: RuleSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    pub capacity: usize,
    pub ttl_ms: u64,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            capacity: 128,
            ttl_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OcclusionSettings {
    pub capacity: usize,
    pub ttl_steps: u64,
    /// Observer movement that resets the whole cache.
    pub invalidate_distance: f64,
    /// Steps between proactive sweeps of expired entries.
    pub cleanup_interval: u64,
}

impl Default for OcclusionSettings {
    fn default() -> Self {
        Self {
            capacity: 4096,
            ttl_steps: 20,
            invalidate_distance: 2.0,
            cleanup_interval: 40,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisibilitySettings {
    pub capacity: usize,
    /// Only re-test line of sight on steps divisible by this.
    pub check_interval: u64,
    /// A result is reused without question for this many steps.
    pub cache_duration: u64,
    /// Objects closer than this are always treated as visible.
    pub always_visible_distance: f64,
}

impl Default for VisibilitySettings {
    fn default() -> Self {
        Self {
            capacity: 4096,
            check_interval: 5,
            cache_duration: 10,
            always_visible_distance: 16.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpatialSettings {
    pub entries_per_region: usize,
    /// `None` keeps classifications until their region unloads.
    pub ttl_steps: Option<u64>,
}

impl Default for SpatialSettings {
    fn default() -> Self {
        Self {
            entries_per_region: 64,
            ttl_steps: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleSettings {
    pub capacity: usize,
}

impl Default for RuleSettings {
    fn default() -> Self {
        Self { capacity: 256 }
    }
}

/// A configuration problem. Some are repaired by
/// [`ThrottleConfig::sanitized`]; the rest make the configuration unusable.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("no tiers configured")]
    NoTiers,
    #[error("tier `{tier}` has update interval 0")]
    ZeroInterval { tier: String },
    #[error("tier `{tier}` interval {interval} exceeds {max}", max = MAX_INTERVAL)]
    IntervalTooLarge { tier: String, interval: u32 },
    #[error("near tier must update every step, got interval {0}")]
    NearIntervalNotOne(u32),
    #[error("tier `{tier}` updates more often than the tier before it")]
    IntervalsDecreasing { tier: String },
    #[error("tier `{tier}` has invalid boundary {value}")]
    InvalidBoundary { tier: String, value: f64 },
    #[error("tier `{tier}` boundary is not above the previous tier")]
    BoundariesNotAscending { tier: String },
    #[error("unbounded tier `{tier}` is not the last tier")]
    UnboundedTierNotLast { tier: String },
    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },
    #[error("{field} must be at least 1")]
    ZeroValue { field: &'static str },
}

/// Failure to turn a JSON document into a usable configuration.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0:?}")]
    Invalid(Vec<ConfigError>),
}

/// Validate a configuration, returning all errors found.
pub fn validate_config(config: &ThrottleConfig) -> Vec<ConfigError> {
    let mut errors = Vec::new();

    if config.tiers.is_empty() {
        errors.push(ConfigError::NoTiers);
    }

    let mut prev_interval = 0u32;
    let mut prev_boundary = 0.0f64;
    for (i, tier) in config.tiers.iter().enumerate() {
        if tier.update_interval == 0 {
            errors.push(ConfigError::ZeroInterval {
                tier: tier.name.clone(),
            });
        } else if tier.update_interval > MAX_INTERVAL {
            errors.push(ConfigError::IntervalTooLarge {
                tier: tier.name.clone(),
                interval: tier.update_interval,
            });
        }
        if i == 0 && tier.update_interval != 1 {
            errors.push(ConfigError::NearIntervalNotOne(tier.update_interval));
        }
        if tier.update_interval < prev_interval {
            errors.push(ConfigError::IntervalsDecreasing {
                tier: tier.name.clone(),
            });
        }
        prev_interval = prev_interval.max(tier.update_interval);

        match tier.max_distance {
            Some(d) if !d.is_finite() || d <= 0.0 => {
                errors.push(ConfigError::InvalidBoundary {
                    tier: tier.name.clone(),
                    value: d,
                });
            }
            Some(d) => {
                if d <= prev_boundary && i > 0 {
                    errors.push(ConfigError::BoundariesNotAscending {
                        tier: tier.name.clone(),
                    });
                }
                prev_boundary = prev_boundary.max(d);
            }
            None => {
                if i + 1 != config.tiers.len() {
                    errors.push(ConfigError::UnboundedTierNotLast {
                        tier: tier.name.clone(),
                    });
                }
            }
        }
    }

    check_range(&mut errors, "tier_floor", config.tier_floor, 0.0, f64::MAX);
    check_range(&mut errors, "stress_shrink", config.stress_shrink, 0.0, 1.0);
    check_nonzero(&mut errors, "sweep_interval", config.sweep_interval);
    check_nonzero(&mut errors, "entry_horizon", config.entry_horizon);

    let s = &config.stress;
    if !(s.target_step_ms.is_finite() && s.target_step_ms > 0.0) {
        errors.push(ConfigError::OutOfRange {
            field: "stress.target_step_ms",
            value: s.target_step_ms,
        });
    }
    if !(s.smoothing.is_finite() && s.smoothing > 0.0 && s.smoothing <= 1.0) {
        errors.push(ConfigError::OutOfRange {
            field: "stress.smoothing",
            value: s.smoothing,
        });
    }
    check_range(&mut errors, "stress.raise_ratio", s.raise_ratio, 1.0, 100.0);
    check_range(&mut errors, "stress.raise_step", s.raise_step, 0.0, 1.0);
    check_range(&mut errors, "stress.lower_step", s.lower_step, 0.0, 1.0);
    check_range(
        &mut errors,
        "stress.under_load_threshold",
        s.under_load_threshold,
        0.0,
        1.0,
    );

    let c = &config.caches;
    check_nonzero(&mut errors, "caches.path.capacity", c.path.capacity as u64);
    check_nonzero(&mut errors, "caches.path.ttl_ms", c.path.ttl_ms);
    check_nonzero(
        &mut errors,
        "caches.occlusion.capacity",
        c.occlusion.capacity as u64,
    );
    check_nonzero(&mut errors, "caches.occlusion.ttl_steps", c.occlusion.ttl_steps);
    check_nonzero(
        &mut errors,
        "caches.occlusion.cleanup_interval",
        c.occlusion.cleanup_interval,
    );
    check_range(
        &mut errors,
        "caches.occlusion.invalidate_distance",
        c.occlusion.invalidate_distance,
        0.0,
        f64::MAX,
    );
    check_nonzero(
        &mut errors,
        "caches.visibility.capacity",
        c.visibility.capacity as u64,
    );
    check_nonzero(
        &mut errors,
        "caches.visibility.check_interval",
        c.visibility.check_interval,
    );
    check_nonzero(
        &mut errors,
        "caches.visibility.cache_duration",
        c.visibility.cache_duration,
    );
    check_range(
        &mut errors,
        "caches.visibility.always_visible_distance",
        c.visibility.always_visible_distance,
        0.0,
        f64::MAX,
    );
    check_nonzero(
        &mut errors,
        "caches.spatial.entries_per_region",
        c.spatial.entries_per_region as u64,
    );
    if let Some(ttl) = c.spatial.ttl_steps {
        check_nonzero(&mut errors, "caches.spatial.ttl_steps", ttl);
    }
    check_nonzero(&mut errors, "caches.rules.capacity", c.rules.capacity as u64);

    errors
}

fn check_range(errors: &mut Vec<ConfigError>, field: &'static str, value: f64, lo: f64, hi: f64) {
    if !(value.is_finite() && (lo..=hi).contains(&value)) {
        errors.push(ConfigError::OutOfRange { field, value });
    }
}

fn check_nonzero(errors: &mut Vec<ConfigError>, field: &'static str, value: u64) {
    if value == 0 {
        errors.push(ConfigError::ZeroValue { field });
    }
}

fn clamp_f64(value: f64, lo: f64, hi: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value.clamp(lo, hi)
    } else {
        fallback
    }
}

impl ThrottleConfig {
    /// Parse, repair and validate a JSON document.
    ///
    /// Repairs are logged at warn level; anything left invalid afterwards
    /// is returned as [`LoadError::Invalid`].
    pub fn from_json(json: &str) -> Result<Self, LoadError> {
        let parsed: ThrottleConfig = serde_json::from_str(json)?;
        parsed.prepared().map_err(LoadError::Invalid)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    /// Sanitize (logging every repair) and then validate.
    pub fn prepared(&self) -> Result<Self, Vec<ConfigError>> {
        let (fixed, repairs) = self.sanitized();
        for repair in &repairs {
            log::warn!("config value adjusted at load: {}", repair);
        }
        let remaining = validate_config(&fixed);
        if remaining.is_empty() {
            Ok(fixed)
        } else {
            Err(remaining)
        }
    }

    /// Return a repaired copy plus the list of problems that were repaired.
    ///
    /// Boundaries that are non-finite or non-positive, and an empty tier
    /// list, are left alone for [`validate_config`] to reject.
    pub fn sanitized(&self) -> (Self, Vec<ConfigError>) {
        let mut out = self.clone();
        let mut repairs = Vec::new();

        for tier in &mut out.tiers {
            if tier.update_interval == 0 {
                repairs.push(ConfigError::ZeroInterval {
                    tier: tier.name.clone(),
                });
                tier.update_interval = 1;
            } else if tier.update_interval > MAX_INTERVAL {
                repairs.push(ConfigError::IntervalTooLarge {
                    tier: tier.name.clone(),
                    interval: tier.update_interval,
                });
                tier.update_interval = MAX_INTERVAL;
            }
        }

        let sort_key = |t: &TierSpec| t.max_distance.unwrap_or(f64::INFINITY);
        let ascending = out
            .tiers
            .windows(2)
            .all(|w| sort_key(&w[0]) < sort_key(&w[1]));
        if !ascending && out.tiers.iter().all(|t| !sort_key(t).is_nan()) {
            if let Some(w) = out
                .tiers
                .windows(2)
                .find(|w| sort_key(&w[0]) >= sort_key(&w[1]))
            {
                repairs.push(ConfigError::BoundariesNotAscending {
                    tier: w[1].name.clone(),
                });
            }
            out.tiers
                .sort_by(|a, b| sort_key(a).total_cmp(&sort_key(b)));
            out.tiers.dedup_by(|b, a| sort_key(a) == sort_key(b));
        }

        if let Some(pos) = out.tiers.iter().position(|t| t.max_distance.is_none()) {
            if pos + 1 < out.tiers.len() {
                repairs.push(ConfigError::UnboundedTierNotLast {
                    tier: out.tiers[pos].name.clone(),
                });
                out.tiers.truncate(pos + 1);
            }
        }

        if let Some(near) = out.tiers.first_mut() {
            if near.update_interval != 1 {
                repairs.push(ConfigError::NearIntervalNotOne(near.update_interval));
                near.update_interval = 1;
            }
        }

        let mut running = 1u32;
        for tier in &mut out.tiers {
            if tier.update_interval < running {
                repairs.push(ConfigError::IntervalsDecreasing {
                    tier: tier.name.clone(),
                });
                tier.update_interval = running;
            }
            running = tier.update_interval;
        }

        let before = (out.tier_floor, out.stress_shrink);
        out.tier_floor = clamp_f64(out.tier_floor, 0.0, f64::MAX, 0.0);
        out.stress_shrink = clamp_f64(out.stress_shrink, 0.0, 1.0, 0.0);
        if before.0 != out.tier_floor {
            repairs.push(ConfigError::OutOfRange {
                field: "tier_floor",
                value: before.0,
            });
        }
        if before.1 != out.stress_shrink {
            repairs.push(ConfigError::OutOfRange {
                field: "stress_shrink",
                value: before.1,
            });
        }

        let defaults = StressConfig::default();
        let s = &mut out.stress;
        let mut fix = |field: &'static str, value: &mut f64, lo: f64, hi: f64, fallback: f64| {
            let fixed = clamp_f64(*value, lo, hi, fallback);
            if fixed != *value {
                repairs.push(ConfigError::OutOfRange {
                    field,
                    value: *value,
                });
                *value = fixed;
            }
        };
        fix(
            "stress.target_step_ms",
            &mut s.target_step_ms,
            f64::MIN_POSITIVE,
            f64::MAX,
            defaults.target_step_ms,
        );
        fix(
            "stress.smoothing",
            &mut s.smoothing,
            f64::MIN_POSITIVE,
            1.0,
            defaults.smoothing,
        );
        fix(
            "stress.raise_ratio",
            &mut s.raise_ratio,
            1.0,
            100.0,
            defaults.raise_ratio,
        );
        fix("stress.raise_step", &mut s.raise_step, 0.0, 1.0, defaults.raise_step);
        fix("stress.lower_step", &mut s.lower_step, 0.0, 1.0, defaults.lower_step);
        fix(
            "stress.under_load_threshold",
            &mut s.under_load_threshold,
            0.0,
            1.0,
            defaults.under_load_threshold,
        );
        let c = &mut out.caches;
        fix(
            "caches.occlusion.invalidate_distance",
            &mut c.occlusion.invalidate_distance,
            0.0,
            f64::MAX,
            OcclusionSettings::default().invalidate_distance,
        );
        fix(
            "caches.visibility.always_visible_distance",
            &mut c.visibility.always_visible_distance,
            0.0,
            f64::MAX,
            VisibilitySettings::default().always_visible_distance,
        );

        let mut at_least_one = |field: &'static str, value: &mut u64| {
            if *value == 0 {
                repairs.push(ConfigError::ZeroValue { field });
                *value = 1;
            }
        };
        at_least_one("sweep_interval", &mut out.sweep_interval);
        at_least_one("entry_horizon", &mut out.entry_horizon);
        at_least_one("caches.path.ttl_ms", &mut c.path.ttl_ms);
        at_least_one("caches.occlusion.ttl_steps", &mut c.occlusion.ttl_steps);
        at_least_one(
            "caches.occlusion.cleanup_interval",
            &mut c.occlusion.cleanup_interval,
        );
        at_least_one(
            "caches.visibility.check_interval",
            &mut c.visibility.check_interval,
        );
        at_least_one(
            "caches.visibility.cache_duration",
            &mut c.visibility.cache_duration,
        );
        if let Some(ttl) = c.spatial.ttl_steps.as_mut() {
            at_least_one("caches.spatial.ttl_steps", ttl);
        }

        let mut capacity = |field: &'static str, value: &mut usize| {
            if *value == 0 {
                repairs.push(ConfigError::ZeroValue { field });
                *value = 1;
            }
        };
        capacity("caches.path.capacity", &mut c.path.capacity);
        capacity("caches.occlusion.capacity", &mut c.occlusion.capacity);
        capacity("caches.visibility.capacity", &mut c.visibility.capacity);
        capacity(
            "caches.spatial.entries_per_region",
            &mut c.spatial.entries_per_region,
        );
        capacity("caches.rules.capacity", &mut c.rules.capacity);

        (out, repairs)
    }
}

/// An immutable, validated configuration plus what is derived from it.
#[derive(Debug)]
pub struct ConfigSnapshot {
    pub version: u64,
    pub config: ThrottleConfig,
    pub tiers: TierClassifier,
}

impl ConfigSnapshot {
    fn build(version: u64, config: ThrottleConfig) -> Self {
        let tiers = TierClassifier::new(&config.tiers, config.tier_floor, config.stress_shrink);
        Self {
            version,
            config,
            tiers,
        }
    }
}

/// Live configuration shared between the simulation and render contexts.
///
/// Readers clone an `Arc` to the current snapshot and keep using it for
/// the rest of their call; a concurrent [`SharedConfig::replace`] never
/// exposes a half-written configuration.
#[derive(Debug)]
pub struct SharedConfig {
    current: RwLock<Arc<ConfigSnapshot>>,
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            current: RwLock::new(Arc::new(ConfigSnapshot::build(
                1,
                ThrottleConfig::default(),
            ))),
        }
    }
}

impl SharedConfig {
    pub fn new(config: &ThrottleConfig) -> Result<Self, Vec<ConfigError>> {
        let prepared = config.prepared()?;
        Ok(Self {
            current: RwLock::new(Arc::new(ConfigSnapshot::build(1, prepared))),
        })
    }

    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        Arc::clone(&self.current.read())
    }

    pub fn version(&self) -> u64 {
        self.current.read().version
    }

    /// Validate `config` and make it current, returning the new version.
    ///
    /// On error the previous snapshot stays in place.
    pub fn replace(&self, config: &ThrottleConfig) -> Result<u64, Vec<ConfigError>> {
        let prepared = config.prepared()?;
        let mut current = self.current.write();
        let version = current.version + 1;
        *current = Arc::new(ConfigSnapshot::build(version, prepared));
        Ok(version)
    }
}
