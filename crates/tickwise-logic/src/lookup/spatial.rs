//! Per-region cache of cell classifications (biome, climate, zone...).
//!
//! Entries are grouped by region so a region unload drops its whole
//! sub-cache at once. Each region is capped independently; a full region
//! evicts its least recently used cell.

use std::collections::HashMap;

use parking_lot::{Mutex, RwLock};

use crate::cache::{CachePolicy, CacheStats, ExpiringCache, Ttl};
use crate::config::{SpatialSettings, ThrottleConfig};
use crate::geometry::{CellPos, RegionPos};

use super::LookupCache;

#[derive(Debug)]
pub struct SpatialCache<V: Clone> {
    regions: RwLock<HashMap<RegionPos, ExpiringCache<CellPos, V>>>,
    settings: RwLock<SpatialSettings>,
    step: RwLock<u64>,
    // Counters of sub-caches already dropped.
    retired: Mutex<CacheStats>,
}

impl<V: Clone> Default for SpatialCache<V> {
    fn default() -> Self {
        Self::new(&SpatialSettings::default())
    }
}

fn region_policy(settings: &SpatialSettings) -> CachePolicy {
    let policy = CachePolicy::default().with_capacity(settings.entries_per_region);
    match settings.ttl_steps {
        Some(ttl) => policy.with_ttl(Ttl::Steps(ttl)),
        None => policy,
    }
}

impl<V: Clone> SpatialCache<V> {
    pub fn new(settings: &SpatialSettings) -> Self {
        Self {
            regions: RwLock::new(HashMap::new()),
            settings: RwLock::new(settings.clone()),
            step: RwLock::new(0),
            retired: Mutex::new(CacheStats {
                name: "spatial".to_string(),
                ..CacheStats::default()
            }),
        }
    }

    pub fn get(&self, cell: CellPos) -> Option<V> {
        let regions = self.regions.read();
        match regions.get(&cell.region()) {
            Some(sub) => sub.get(&cell),
            None => {
                self.retired.lock().misses += 1;
                None
            }
        }
    }

    /// Cached classification of `cell`, or run `classify` and cache it.
    pub fn classify_or_compute<F>(&self, cell: CellPos, classify: F) -> V
    where
        F: FnOnce() -> V,
    {
        if let Some(value) = self.get(cell) {
            return value;
        }
        let value = classify();
        self.put(cell, value.clone());
        value
    }

    pub fn put(&self, cell: CellPos, value: V) {
        let region = cell.region();
        {
            let regions = self.regions.read();
            if let Some(sub) = regions.get(&region) {
                sub.put(cell, value);
                return;
            }
        }
        let mut regions = self.regions.write();
        let sub = regions.entry(region).or_insert_with(|| {
            let sub = ExpiringCache::new("spatial", region_policy(&self.settings.read()));
            sub.begin_step(*self.step.read());
            sub
        });
        sub.put(cell, value);
    }

    pub fn invalidate(&self, cell: CellPos) {
        if let Some(sub) = self.regions.read().get(&cell.region()) {
            sub.invalidate(&cell);
        }
    }

    /// Drop the sub-cache of `region`; returns how many cells it held.
    pub fn drop_region(&self, region: RegionPos) -> usize {
        let Some(sub) = self.regions.write().remove(&region) else {
            return 0;
        };
        let stats = sub.stats();
        self.retire(&stats);
        stats.entries
    }

    fn retire(&self, stats: &CacheStats) {
        let mut retired = self.retired.lock();
        retired.hits += stats.hits;
        retired.misses += stats.misses;
        retired.evictions += stats.evictions;
        retired.expirations += stats.expirations;
    }

    pub fn region_count(&self) -> usize {
        self.regions.read().len()
    }

    pub fn total_entries(&self) -> usize {
        self.regions.read().values().map(ExpiringCache::len).sum()
    }
}

impl<V: Clone + Send + Sync> LookupCache for SpatialCache<V> {
    fn name(&self) -> &str {
        "spatial"
    }

    fn begin_step(&self, step: u64) {
        *self.step.write() = step;
        for sub in self.regions.read().values() {
            sub.begin_step(step);
        }
    }

    fn invalidate_region(&self, region: RegionPos) -> usize {
        self.drop_region(region)
    }

    fn invalidate_all(&self) {
        let dropped: Vec<_> = self.regions.write().drain().map(|(_, sub)| sub).collect();
        for sub in dropped {
            self.retire(&sub.stats());
        }
    }

    fn apply_config(&self, config: &ThrottleConfig) {
        let settings = config.caches.spatial.clone();
        for sub in self.regions.read().values() {
            sub.resize(settings.entries_per_region);
            sub.set_ttl(settings.ttl_steps.map(Ttl::Steps));
        }
        *self.settings.write() = settings;
    }

    fn stats(&self) -> CacheStats {
        let mut stats = self.retired.lock().clone();
        let regions = self.regions.read();
        for sub in regions.values() {
            let live = sub.stats();
            stats.entries += live.entries;
            stats.hits += live.hits;
            stats.misses += live.misses;
            stats.evictions += live.evictions;
            stats.expirations += live.expirations;
        }
        stats.capacity = Some(self.settings.read().entries_per_region * regions.len());
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn computes_once_per_cell() {
        let cache: SpatialCache<u8> = SpatialCache::default();
        let cell = CellPos::new(3, 70, 9);
        assert_eq!(cache.classify_or_compute(cell, || 4), 4);
        assert_eq!(cache.classify_or_compute(cell, || 9), 4);
        assert_eq!(cache.region_count(), 1);
    }

    #[test]
    fn regions_capped_independently() {
        let cache: SpatialCache<u8> = SpatialCache::new(&SpatialSettings {
            entries_per_region: 4,
            ttl_steps: None,
        });
        for x in 0..10 {
            cache.put(CellPos::new(x, 0, 0), 1);
            cache.put(CellPos::new(x + 32, 0, 0), 2);
        }
        assert_eq!(cache.region_count(), 2);
        assert_eq!(cache.total_entries(), 8);
        // The most recent cells survive.
        assert_eq!(cache.get(CellPos::new(9, 0, 0)), Some(1));
        assert_eq!(cache.get(CellPos::new(0, 0, 0)), None);
    }

    #[test]
    fn unload_drops_only_that_region() {
        let cache: SpatialCache<u8> = SpatialCache::default();
        cache.put(CellPos::new(1, 0, 1), 1);
        cache.put(CellPos::new(2, 0, 2), 1);
        cache.put(CellPos::new(-1, 0, 1), 2);
        assert_eq!(cache.invalidate_region(RegionPos::new(0, 0)), 2);
        assert_eq!(cache.region_count(), 1);
        assert_eq!(cache.get(CellPos::new(-1, 0, 1)), Some(2));
        assert_eq!(cache.get(CellPos::new(1, 0, 1)), None);
    }

    #[test]
    fn stats_survive_unload() {
        let cache: SpatialCache<u8> = SpatialCache::default();
        let cell = CellPos::new(1, 0, 1);
        cache.classify_or_compute(cell, || 1);
        cache.classify_or_compute(cell, || 1);
        cache.invalidate_all();
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 0);
    }

    #[test]
    fn optional_ttl() {
        let cache: SpatialCache<u8> = SpatialCache::new(&SpatialSettings {
            entries_per_region: 64,
            ttl_steps: Some(10),
        });
        cache.begin_step(0);
        cache.put(CellPos::new(0, 0, 0), 1);
        cache.begin_step(9);
        assert_eq!(cache.get(CellPos::new(0, 0, 0)), Some(1));
        cache.begin_step(10);
        assert_eq!(cache.get(CellPos::new(0, 0, 0)), None);
    }
}
