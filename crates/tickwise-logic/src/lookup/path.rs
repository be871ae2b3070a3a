//! Pathfinding result cache.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CachePolicy, CacheStats, Clock, ExpiringCache, Ttl};
use crate::config::{PathSettings, ThrottleConfig};
use crate::geometry::{CellPos, RegionPos};

use super::LookupCache;

/// Everything a path search depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PathKey {
    pub start: CellPos,
    pub target: CellPos,
    /// Movement capabilities of the agent (walker, swimmer, flyer...).
    pub agent_kind: u32,
}

impl PathKey {
    pub fn new(start: CellPos, target: CellPos, agent_kind: u32) -> Self {
        Self {
            start,
            target,
            agent_kind,
        }
    }

    fn touches(&self, region: RegionPos) -> bool {
        region.contains(&self.start) || region.contains(&self.target)
    }
}

fn policy(settings: &PathSettings) -> CachePolicy {
    CachePolicy::default()
        .with_capacity(settings.capacity)
        .with_ttl(Ttl::Wall(Duration::from_millis(settings.ttl_ms)))
}

/// Found paths, bounded by LRU and a wall-clock TTL.
///
/// Failed searches are not cached; the world may open a route at any time.
#[derive(Debug)]
pub struct PathCache<P> {
    inner: ExpiringCache<PathKey, P>,
}

impl<P: Clone> Default for PathCache<P> {
    fn default() -> Self {
        Self::new(&PathSettings::default())
    }
}

impl<P: Clone> PathCache<P> {
    pub fn new(settings: &PathSettings) -> Self {
        Self {
            inner: ExpiringCache::new("path", policy(settings)),
        }
    }

    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: self.inner.with_clock(clock),
        }
    }

    pub fn get(&self, key: &PathKey) -> Option<P> {
        self.inner.get(key)
    }

    /// Cached path, or run `search` and cache what it finds.
    pub fn find_or_compute<F>(&self, key: PathKey, search: F) -> Option<P>
    where
        F: FnOnce() -> Option<P>,
    {
        if let Some(path) = self.inner.get(&key) {
            return Some(path);
        }
        let path = search()?;
        self.inner.put(key, path.clone());
        Some(path)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl<P: Clone + Send> LookupCache for PathCache<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn begin_step(&self, step: u64) {
        self.inner.begin_step(step);
    }

    fn invalidate_region(&self, region: RegionPos) -> usize {
        self.inner.invalidate_where(|key, _| key.touches(region))
    }

    fn invalidate_all(&self) {
        self.inner.invalidate_all();
    }

    fn apply_config(&self, config: &ThrottleConfig) {
        let settings = &config.caches.path;
        self.inner.resize(settings.capacity);
        self.inner
            .set_ttl(Some(Ttl::Wall(Duration::from_millis(settings.ttl_ms))));
    }

    fn stats(&self) -> CacheStats {
        self.inner.stats()
    }
}
