//! Data-driven lookups: rule matching and tag membership.
//!
//! Rule results only change when the host reloads its data, so they live in
//! a plain LRU and are dropped explicitly. Membership answers are cheap to
//! recompute and only trusted for the current step.

use serde::{Deserialize, Serialize};

use crate::cache::{CachePolicy, CacheStats, ExpiringCache};
use crate::config::{RuleSettings, ThrottleConfig};

use super::LookupCache;

/// One occupied input slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemStack {
    pub item: u32,
    pub count: u16,
}

impl ItemStack {
    pub fn new(item: u32, count: u16) -> Self {
        Self { item, count }
    }
}

/// Rule kind plus the complete input layout.
///
/// The key holds every occupied slot with its index rather than a digest,
/// so two different layouts can never share an entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleKey {
    pub kind: u32,
    pub pattern: Vec<(usize, ItemStack)>,
}

impl RuleKey {
    /// Build from a slot grid; empty slots and zero-count stacks are skipped
    /// but keep their position.
    pub fn from_slots(kind: u32, slots: &[Option<ItemStack>]) -> Self {
        let pattern = slots
            .iter()
            .enumerate()
            .filter_map(|(slot, stack)| match stack {
                Some(stack) if stack.count > 0 => Some((slot, *stack)),
                _ => None,
            })
            .collect();
        Self { kind, pattern }
    }
}

/// Matched rule per input layout. `None` results are cached too.
#[derive(Debug)]
pub struct RuleCache<R> {
    inner: ExpiringCache<RuleKey, Option<R>>,
}

impl<R: Clone> Default for RuleCache<R> {
    fn default() -> Self {
        Self::new(&RuleSettings::default())
    }
}

impl<R: Clone> RuleCache<R> {
    pub fn new(settings: &RuleSettings) -> Self {
        Self {
            inner: ExpiringCache::new(
                "rules",
                CachePolicy::default().with_capacity(settings.capacity),
            ),
        }
    }

    /// Cached match for `key`, or run `matcher` and cache its answer.
    pub fn lookup_or_compute<F>(&self, key: RuleKey, matcher: F) -> Option<R>
    where
        F: FnOnce() -> Option<R>,
    {
        self.inner.get_or_insert_with(key, matcher)
    }

    /// `Some(None)` means "known not to match".
    pub fn get(&self, key: &RuleKey) -> Option<Option<R>> {
        self.inner.get(key)
    }

    pub fn is_cached(&self, key: &RuleKey) -> bool {
        self.inner.contains(key)
    }

    /// Forget every result for one rule kind.
    pub fn invalidate_kind(&self, kind: u32) -> usize {
        self.inner.invalidate_where(|key, _| key.kind == kind)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl<R: Clone + Send> LookupCache for RuleCache<R> {
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
        self.inner.resize(config.caches.rules.capacity);
    }

    fn stats(&self) -> CacheStats {
        self.inner.stats()
    }
}

/// Step-scoped `(holder, tag) -> bool` answers.
#[derive(Debug)]
pub struct MembershipCache {
    inner: ExpiringCache<(u64, u32), bool>,
}

impl Default for MembershipCache {
    fn default() -> Self {
        Self {
            inner: ExpiringCache::new("membership", CachePolicy::default().step_scoped()),
        }
    }
}

impl MembershipCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_member<F>(&self, holder: u64, tag: u32, check: F) -> bool
    where
        F: FnOnce() -> bool,
    {
        self.inner.get_or_insert_with((holder, tag), check)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl LookupCache for MembershipCache {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn begin_step(&self, step: u64) {
        self.inner.begin_step(step);
    }

    fn invalidate_all(&self) {
        self.inner.invalidate_all();
    }

    fn apply_config(&self, _config: &ThrottleConfig) {}

    fn stats(&self) -> CacheStats {
        self.inner.stats()
    }
}
