//! Generic expiring cache.
//!
//! Every lookup cache in [`crate::lookup`] is one of these with a different
//! policy. A policy combines any of:
//!
//! | Policy            | Drops an entry when                                   |
//! |-------------------|-------------------------------------------------------|
//! | TTL (steps)       | `current_step - recorded_step >= ttl`                 |
//! | TTL (wall clock)  | `now - recorded_at >= ttl`                            |
//! | Step-scoped       | the host reports a new step (full clear)              |
//! | Movement          | the reference point drifts past a threshold (full clear) |
//! | LRU bound         | a `put` pushes the size over capacity                 |
//! | Validator         | the stored value no longer passes a structural check  |
//!
//! Expired and invalid entries are dropped lazily on read; `sweep_expired`
//! reclaims them proactively. Reads reorder the LRU list, so the map sits
//! behind a `Mutex` rather than a read-write lock.
//!
//! ```
//! use tickwise_logic::cache::{CachePolicy, ExpiringCache, Ttl};
//!
//! let cache: ExpiringCache<u32, &str> =
//!     ExpiringCache::new("demo", CachePolicy::default().with_ttl(Ttl::Steps(2)));
//! cache.begin_step(10);
//! cache.put(1, "one");
//! cache.begin_step(11);
//! assert_eq!(cache.get(&1), Some("one"));
//! cache.begin_step(12);
//! assert_eq!(cache.get(&1), None);
//! ```

use std::fmt;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::geometry::Vec3;

// ── Clocks ──────────────────────────────────────────────────────────────

/// Source of wall time for wall-clock TTLs.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Time since an arbitrary fixed origin.
    fn now(&self) -> Duration;
}

/// Real monotonic time.
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Hand-driven clock for tests and deterministic harnesses.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn set(&self, at: Duration) {
        self.nanos.store(at.as_nanos() as u64, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::Relaxed))
    }
}

// ── Policy ──────────────────────────────────────────────────────────────

/// Time-to-live of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// Simulation steps, measured against the last `begin_step`.
    Steps(u64),
    Wall(Duration),
}

/// Which invalidation rules a cache applies.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CachePolicy {
    pub ttl: Option<Ttl>,
    pub step_scoped: bool,
    pub movement_threshold: Option<f64>,
    /// `None` is unbounded.
    pub capacity: Option<usize>,
}

impl CachePolicy {
    pub fn with_ttl(mut self, ttl: Ttl) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn step_scoped(mut self) -> Self {
        self.step_scoped = true;
        self
    }

    pub fn with_movement_threshold(mut self, threshold: f64) -> Self {
        self.movement_threshold = Some(threshold);
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }
}

// ── Stats ───────────────────────────────────────────────────────────────

/// Point-in-time counters for one cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub name: String,
    pub entries: usize,
    pub capacity: Option<usize>,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    /// Full clears caused by a step change or observer movement.
    pub resets: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Fold another cache's counters into this one.
    pub fn merge(&mut self, other: &CacheStats) {
        self.entries += other.entries;
        self.capacity = match (self.capacity, other.capacity) {
            (Some(a), Some(b)) => Some(a + b),
            _ => None,
        };
        self.hits += other.hits;
        self.misses += other.misses;
        self.evictions += other.evictions;
        self.expirations += other.expirations;
        self.resets += other.resets;
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    resets: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn add(counter: &AtomicU64, n: usize) {
        if n > 0 {
            counter.fetch_add(n as u64, Ordering::Relaxed);
        }
    }
}

// ── Cache ───────────────────────────────────────────────────────────────

struct Entry<V> {
    value: V,
    recorded_step: u64,
    recorded_at: Duration,
}

struct Inner<K: Hash + Eq, V> {
    map: LruCache<K, Entry<V>>,
    step: u64,
    reference: Option<Vec3>,
    anchor: Option<Vec3>,
    policy: CachePolicy,
}

impl<K: Hash + Eq, V> Inner<K, V> {
    fn is_expired(&self, entry: &Entry<V>, now: Duration) -> bool {
        match self.policy.ttl {
            None => false,
            Some(Ttl::Steps(ttl)) => self.step.saturating_sub(entry.recorded_step) >= ttl,
            Some(Ttl::Wall(ttl)) => now.saturating_sub(entry.recorded_at) >= ttl,
        }
    }

    /// Whether the reference drifted past the threshold since the anchor.
    fn moved(&self) -> bool {
        match (self.policy.movement_threshold, self.reference, self.anchor) {
            (Some(threshold), Some(reference), Some(anchor)) => {
                anchor.distance_squared(&reference) > threshold * threshold
            }
            _ => false,
        }
    }

    /// Clear and re-anchor if the reference drifted past the threshold.
    fn check_movement(&mut self) -> bool {
        let (Some(threshold), Some(reference)) = (self.policy.movement_threshold, self.reference)
        else {
            return false;
        };
        match self.anchor {
            Some(anchor) if anchor.distance_squared(&reference) > threshold * threshold => {
                self.anchor = Some(reference);
                self.map.clear();
                true
            }
            Some(_) => false,
            None => {
                self.anchor = Some(reference);
                false
            }
        }
    }
}

fn new_map<K: Hash + Eq, V>(capacity: Option<usize>) -> LruCache<K, Entry<V>> {
    match capacity {
        Some(cap) => LruCache::new(non_zero(cap)),
        None => LruCache::unbounded(),
    }
}

fn non_zero(cap: usize) -> NonZeroUsize {
    NonZeroUsize::new(cap).unwrap_or(NonZeroUsize::MIN)
}

/// Key-value cache with pluggable expiry rules.
///
/// All methods take `&self`; the cache is safe to share between the
/// simulation and render contexts.
pub struct ExpiringCache<K: Hash + Eq, V> {
    name: String,
    inner: Mutex<Inner<K, V>>,
    clock: Arc<dyn Clock>,
    validator: Option<fn(&V) -> bool>,
    counters: Counters,
}

impl<K: Hash + Eq, V> fmt::Debug for ExpiringCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ExpiringCache")
            .field("name", &self.name)
            .field("entries", &inner.map.len())
            .field("policy", &inner.policy)
            .field("step", &inner.step)
            .finish()
    }
}

impl<K, V> ExpiringCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new(name: impl Into<String>, policy: CachePolicy) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                map: new_map(policy.capacity),
                step: 0,
                reference: None,
                anchor: None,
                policy,
            }),
            clock: Arc::new(MonotonicClock::default()),
            validator: None,
            counters: Counters::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Values failing `check` are treated as absent and removed on read.
    pub fn with_validator(mut self, check: fn(&V) -> bool) -> Self {
        self.validator = Some(check);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> CachePolicy {
        self.inner.lock().policy
    }

    fn movement_gate(&self, inner: &mut Inner<K, V>) {
        if inner.check_movement() {
            Counters::bump(&self.counters.resets);
            log::debug!(
                "{} cache cleared: reference moved past {:.2}",
                self.name,
                inner.policy.movement_threshold.unwrap_or_default()
            );
        }
    }

    /// Look up `key`, refreshing its LRU position on a hit.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.movement_gate(&mut inner);

        let state = match inner.map.peek(key) {
            None => None,
            Some(entry) if inner.is_expired(entry, now) => Some(false),
            Some(entry) if self.validator.is_some_and(|check| !check(&entry.value)) => {
                Some(false)
            }
            Some(_) => Some(true),
        };
        match state {
            Some(true) => {
                Counters::bump(&self.counters.hits);
                inner.map.get(key).map(|entry| entry.value.clone())
            }
            Some(false) => {
                inner.map.pop(key);
                Counters::bump(&self.counters.expirations);
                Counters::bump(&self.counters.misses);
                None
            }
            None => {
                Counters::bump(&self.counters.misses);
                None
            }
        }
    }

    /// Whether a live entry exists, without touching LRU order or stats.
    ///
    /// Entries a pending movement reset would clear count as absent; the
    /// reset itself still waits for the next `get` or `put`.
    pub fn contains(&self, key: &K) -> bool {
        let now = self.clock.now();
        let inner = self.inner.lock();
        if inner.moved() {
            return false;
        }
        inner.map.peek(key).is_some_and(|entry| {
            !inner.is_expired(entry, now) && self.validator.map_or(true, |check| check(&entry.value))
        })
    }

    /// Store `value`, evicting the least recently used entry if full.
    pub fn put(&self, key: K, value: V) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.movement_gate(&mut inner);
        let entry = Entry {
            value,
            recorded_step: inner.step,
            recorded_at: now,
        };
        if let Some((evicted, _)) = inner.map.push(key.clone(), entry) {
            if evicted != key {
                Counters::bump(&self.counters.evictions);
            }
        }
    }

    /// Return the cached value or compute, store and return a fresh one.
    ///
    /// `compute` runs without the lock held, so it may consult other caches.
    pub fn get_or_insert_with<F>(&self, key: K, compute: F) -> V
    where
        F: FnOnce() -> V,
    {
        if let Some(value) = self.get(&key) {
            return value;
        }
        let value = compute();
        self.put(key, value.clone());
        value
    }

    pub fn invalidate(&self, key: &K) -> Option<V> {
        self.inner.lock().map.pop(key).map(|entry| entry.value)
    }

    pub fn invalidate_all(&self) {
        self.inner.lock().map.clear();
    }

    /// Drop every entry matching `predicate`; returns how many went.
    pub fn invalidate_where<P>(&self, mut predicate: P) -> usize
    where
        P: FnMut(&K, &V) -> bool,
    {
        let mut inner = self.inner.lock();
        let doomed: Vec<K> = inner
            .map
            .iter()
            .filter(|(key, entry)| predicate(key, &entry.value))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            inner.map.pop(key);
        }
        doomed.len()
    }

    /// Advance the cache's notion of the current step.
    ///
    /// Step-scoped caches clear themselves when the step changes.
    pub fn begin_step(&self, step: u64) {
        let mut inner = self.inner.lock();
        if inner.step == step {
            return;
        }
        inner.step = step;
        if inner.policy.step_scoped && !inner.map.is_empty() {
            inner.map.clear();
            Counters::bump(&self.counters.resets);
        }
    }

    pub fn current_step(&self) -> u64 {
        self.inner.lock().step
    }

    /// Move the reference point used by the movement policy.
    ///
    /// The first reference becomes the anchor; later ones are compared to it
    /// on the next `get` or `put`.
    pub fn update_reference(&self, position: Vec3) {
        if !position.is_finite() {
            return;
        }
        let mut inner = self.inner.lock();
        inner.reference = Some(position);
        if inner.anchor.is_none() {
            inner.anchor = Some(position);
        }
    }

    /// Remove every expired or invalid entry now; returns how many went.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        if inner.policy.ttl.is_none() && self.validator.is_none() {
            return 0;
        }
        let doomed: Vec<K> = inner
            .map
            .iter()
            .filter(|(_, entry)| {
                inner.is_expired(entry, now)
                    || self.validator.is_some_and(|check| !check(&entry.value))
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            inner.map.pop(key);
        }
        Counters::add(&self.counters.expirations, doomed.len());
        doomed.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Change the LRU bound, evicting from the cold end if shrinking.
    pub fn resize(&self, capacity: usize) {
        let mut inner = self.inner.lock();
        let before = inner.map.len();
        let capacity = capacity.max(1);
        inner.map.resize(non_zero(capacity));
        inner.policy.capacity = Some(capacity);
        Counters::add(&self.counters.evictions, before - inner.map.len());
    }

    /// Applies to existing entries on their next read.
    pub fn set_ttl(&self, ttl: Option<Ttl>) {
        self.inner.lock().policy.ttl = ttl;
    }

    pub fn set_movement_threshold(&self, threshold: Option<f64>) {
        let mut inner = self.inner.lock();
        inner.policy.movement_threshold = threshold;
        if threshold.is_none() {
            inner.anchor = None;
        }
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            name: self.name.clone(),
            entries: inner.map.len(),
            capacity: inner.policy.capacity,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            resets: self.counters.resets.load(Ordering::Relaxed),
        }
    }
}
