//! Domain lookup caches built on [`ExpiringCache`](crate::cache::ExpiringCache).
//!
//! | Cache | Key | Expiry |
//! |-------|-----|--------|
//! | [`PathCache`] | start cell, target cell, agent kind | LRU 128 + 3 s wall TTL |
//! | [`OcclusionCache`] | source cell, sound id | 20 steps + observer moved 2 units |
//! | [`VisibilityCache`] | object handle | check interval + cache duration |
//! | [`SpatialCache`] | region, then cell | per-region LRU 64, dropped on unload |
//! | [`RuleCache`] | rule kind + full input pattern | LRU 256 |
//! | [`MembershipCache`] | holder, tag | current step only |
//!
//! Every cache is a compute-through: a miss runs the caller's real
//! computation and stores the result. The [`LookupCache`] trait lets the
//! throttle facade fan out step, observer, region and config events to
//! whichever caches the host attached.

pub mod occlusion;
pub mod path;
pub mod rules;
pub mod spatial;

pub use occlusion::{
    is_static_source, OcclusionCache, OcclusionKey, VisibilityCache, VisibilityRecord,
};
pub use path::{PathCache, PathKey};
pub use rules::{ItemStack, MembershipCache, RuleCache, RuleKey};
pub use spatial::SpatialCache;

use crate::cache::CacheStats;
use crate::config::ThrottleConfig;
use crate::geometry::{RegionPos, Vec3};

/// Event hooks shared by all lookup caches.
pub trait LookupCache: Send + Sync {
    fn name(&self) -> &str;

    fn begin_step(&self, step: u64);

    /// Observer moved. Only movement-sensitive caches care.
    fn observe(&self, _observer: Vec3) {}

    /// A region was unloaded or edited.
    fn invalidate_region(&self, _region: RegionPos) -> usize {
        0
    }

    fn invalidate_all(&self);

    /// Pick up sizes and TTLs from a refreshed configuration.
    fn apply_config(&self, config: &ThrottleConfig);

    fn stats(&self) -> CacheStats;
}
