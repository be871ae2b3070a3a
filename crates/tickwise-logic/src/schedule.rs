//! Per-object update scheduling.
//!
//! Decides, for each object and step, whether the host should run the real
//! update. Overrides and the sticky activity window always win; otherwise the
//! object's distance tier sets an interval and a stable per-object phase
//! spreads tier members across it:
//!
//! ```text
//! due  <=>  (step + index % interval) % interval == 0
//! ```
//!
//! Anything the scheduler does not recognise (a handle it has never seen, or
//! a slot reused by a new generation) gets a full update and a fresh entry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::handle::ObjectHandle;
use crate::tier::{Detail, Tier, TierClassifier};

/// Per-query conditions that force a full update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideFlags {
    pub is_observer: bool,
    pub is_observer_mount: bool,
    pub in_combat: bool,
    pub recently_damaged: bool,
    pub has_active_target: bool,
}

impl OverrideFlags {
    pub const NONE: OverrideFlags = OverrideFlags {
        is_observer: false,
        is_observer_mount: false,
        in_combat: false,
        recently_damaged: false,
        has_active_target: false,
    };

    pub fn any(&self) -> bool {
        self.is_observer
            || self.is_observer_mount
            || self.in_combat
            || self.recently_damaged
            || self.has_active_target
    }
}

/// Why a decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    Override,
    /// Inside the sticky activity window.
    Active,
    /// First time this handle was seen.
    Untracked,
    /// Slot reused by a new generation.
    Recycled,
    Due,
    Skipped,
    /// Throttling is switched off; everything updates.
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub update: bool,
    pub tier: Tier,
    pub reason: Reason,
}

/// Inputs shared by every decision in one step.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleContext<'a> {
    pub tiers: &'a TierClassifier,
    pub stress: f64,
    pub active_window: u64,
}

#[derive(Debug)]
struct ScheduleEntry {
    generation: u32,
    last_update_step: u64,
    assigned_interval: u32,
    detail: Detail,
    active_until: Option<u64>,
    // Bumped under the read lock on the fast path.
    last_seen_step: AtomicU64,
}

impl ScheduleEntry {
    fn fresh(generation: u32, step: u64, interval: u32, detail: Detail) -> Self {
        Self {
            generation,
            last_update_step: step,
            assigned_interval: interval,
            detail,
            active_until: None,
            last_seen_step: AtomicU64::new(step),
        }
    }

    fn is_active(&self, step: u64) -> bool {
        self.active_until.is_some_and(|until| step < until)
    }

    fn touch(&self, step: u64) {
        self.last_seen_step.fetch_max(step, Ordering::Relaxed);
    }
}

/// Read-only view of one schedule entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryInfo {
    pub generation: u32,
    pub last_update_step: u64,
    pub assigned_interval: u32,
    pub detail: Detail,
    pub active_until: Option<u64>,
    pub last_seen_step: u64,
}

fn is_due(handle: ObjectHandle, step: u64, interval: u32) -> bool {
    let interval = interval.max(1);
    (step + handle.stable_phase(interval)) % u64::from(interval) == 0
}

/// Schedule entries keyed by handle index.
#[derive(Debug, Default)]
pub struct UpdateScheduler {
    entries: RwLock<HashMap<u32, ScheduleEntry>>,
}

impl UpdateScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full decision with tier and reason.
    pub fn decide(
        &self,
        handle: ObjectHandle,
        step: u64,
        distance_squared: f64,
        overrides: OverrideFlags,
        ctx: &ScheduleContext<'_>,
    ) -> Decision {
        let tier = ctx.tiers.classify(distance_squared, ctx.stress);

        // Steady state: known object, same tier, nothing sticky.
        if !overrides.any() {
            let entries = self.entries.read();
            if let Some(entry) = entries.get(&handle.index()) {
                if entry.generation == handle.generation()
                    && entry.assigned_interval == tier.update_interval
                    && entry.detail == tier.detail
                    && !entry.is_active(step)
                {
                    entry.touch(step);
                    let update = is_due(handle, step, tier.update_interval);
                    return Decision {
                        update,
                        tier,
                        reason: if update { Reason::Due } else { Reason::Skipped },
                    };
                }
            }
        }

        let mut entries = self.entries.write();
        let fresh = match entries.get(&handle.index()) {
            None => Some(Reason::Untracked),
            Some(entry) if entry.generation != handle.generation() => Some(Reason::Recycled),
            Some(_) => None,
        };
        let blank =
            || ScheduleEntry::fresh(handle.generation(), step, tier.update_interval, tier.detail);
        let entry = entries.entry(handle.index()).or_insert_with(blank);
        if fresh == Some(Reason::Recycled) {
            *entry = blank();
        }
        entry.touch(step);

        if overrides.any() {
            entry.active_until = Some(step.saturating_add(ctx.active_window));
        }
        if overrides.any() || entry.is_active(step) {
            entry.assigned_interval = 1;
            entry.detail = Detail::Full;
            let reason = if overrides.any() {
                Reason::Override
            } else {
                Reason::Active
            };
            return Decision {
                update: true,
                tier,
                reason,
            };
        }

        entry.assigned_interval = tier.update_interval;
        entry.detail = tier.detail;
        if let Some(reason) = fresh {
            return Decision {
                update: true,
                tier,
                reason,
            };
        }
        let update = is_due(handle, step, tier.update_interval);
        Decision {
            update,
            tier,
            reason: if update { Reason::Due } else { Reason::Skipped },
        }
    }

    pub fn should_update(
        &self,
        handle: ObjectHandle,
        step: u64,
        distance_squared: f64,
        overrides: OverrideFlags,
        ctx: &ScheduleContext<'_>,
    ) -> bool {
        self.decide(handle, step, distance_squared, overrides, ctx).update
    }

    /// Record that the host ran the update. Returns the interval and detail
    /// now in effect for interpolation; unknown handles get full rate.
    pub fn commit(&self, handle: ObjectHandle, step: u64) -> (u32, Detail) {
        let mut entries = self.entries.write();
        match entries.get_mut(&handle.index()) {
            Some(entry) if entry.generation == handle.generation() => {
                entry.last_update_step = step;
                entry.touch(step);
                (entry.assigned_interval, entry.detail)
            }
            _ => (1, Detail::Full),
        }
    }

    /// Open (or extend) the activity window for `handle` from `step`.
    pub fn mark_active(&self, handle: ObjectHandle, step: u64, window: u64) {
        let until = step.saturating_add(window);
        let mut entries = self.entries.write();
        let entry = entries
            .entry(handle.index())
            .or_insert_with(|| ScheduleEntry::fresh(handle.generation(), step, 1, Detail::Full));
        if entry.generation != handle.generation() {
            *entry = ScheduleEntry::fresh(handle.generation(), step, 1, Detail::Full);
        }
        entry.touch(step);
        entry.active_until = Some(entry.active_until.map_or(until, |old| old.max(until)));
    }

    pub fn entry(&self, handle: ObjectHandle) -> Option<EntryInfo> {
        let entries = self.entries.read();
        let entry = entries.get(&handle.index())?;
        (entry.generation == handle.generation()).then(|| EntryInfo {
            generation: entry.generation,
            last_update_step: entry.last_update_step,
            assigned_interval: entry.assigned_interval,
            detail: entry.detail,
            active_until: entry.active_until,
            last_seen_step: entry.last_seen_step.load(Ordering::Relaxed),
        })
    }

    /// Drop the entry; a stale generation leaves the slot's new owner alone.
    pub fn remove(&self, handle: ObjectHandle) -> bool {
        let mut entries = self.entries.write();
        match entries.get(&handle.index()) {
            Some(entry) if entry.generation == handle.generation() => {
                entries.remove(&handle.index());
                true
            }
            _ => false,
        }
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Evict entries not seen for `horizon` steps; returns how many went.
    pub fn sweep(&self, step: u64, horizon: u64) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| {
            step.saturating_sub(entry.last_seen_step.load(Ordering::Relaxed)) < horizon
        });
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAR: f64 = 1.0e6;

    fn ctx(tiers: &TierClassifier) -> ScheduleContext<'_> {
        ScheduleContext {
            tiers,
            stress: 0.0,
            active_window: 100,
        }
    }

    #[test]
    fn first_sight_is_full_update() {
        let tiers = TierClassifier::default();
        let s = UpdateScheduler::new();
        let d = s.decide(ObjectHandle::from_index(3), 17, FAR, OverrideFlags::NONE, &ctx(&tiers));
        assert!(d.update);
        assert_eq!(d.reason, Reason::Untracked);
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn far_object_updates_every_fourth_step() {
        let tiers = TierClassifier::default();
        let s = UpdateScheduler::new();
        let h = ObjectHandle::from_index(8);
        let updates: Vec<bool> = (0..9)
            .map(|step| s.should_update(h, step, FAR, OverrideFlags::NONE, &ctx(&tiers)))
            .collect();
        assert_eq!(
            updates,
            vec![true, false, false, false, true, false, false, false, true]
        );
    }

    #[test]
    fn phases_spread_a_tier() {
        let tiers = TierClassifier::default();
        let s = UpdateScheduler::new();
        let handles: Vec<ObjectHandle> = (0..4).map(ObjectHandle::from_index).collect();
        // Warm up so first-sight updates do not count.
        for h in &handles {
            s.decide(*h, 0, FAR, OverrideFlags::NONE, &ctx(&tiers));
        }
        for h in &handles {
            let hits = (4..8)
                .filter(|&step| s.should_update(*h, step, FAR, OverrideFlags::NONE, &ctx(&tiers)))
                .count();
            assert_eq!(hits, 1, "handle {h}");
        }
    }

    #[test]
    fn override_always_updates() {
        let tiers = TierClassifier::default();
        let s = UpdateScheduler::new();
        let h = ObjectHandle::from_index(1);
        let flags = OverrideFlags {
            in_combat: true,
            ..OverrideFlags::NONE
        };
        for step in 0..10 {
            for d in [0.0, FAR, f64::INFINITY, f64::NAN] {
                let decision = s.decide(h, step, d, flags, &ctx(&tiers));
                assert!(decision.update);
                assert_eq!(decision.reason, Reason::Override);
            }
        }
        assert_eq!(s.commit(h, 9), (1, Detail::Full));
    }

    #[test]
    fn activity_window_is_sticky() {
        let tiers = TierClassifier::default();
        let s = UpdateScheduler::new();
        let h = ObjectHandle::from_index(1);
        s.decide(h, 0, FAR, OverrideFlags::NONE, &ctx(&tiers));
        s.mark_active(h, 10, 5);
        for step in 10..15 {
            let d = s.decide(h, step, FAR, OverrideFlags::NONE, &ctx(&tiers));
            assert_eq!(d.reason, Reason::Active, "step {step}");
            assert!(d.update);
        }
        let d = s.decide(h, 15, FAR, OverrideFlags::NONE, &ctx(&tiers));
        assert_ne!(d.reason, Reason::Active);
        assert_eq!(s.entry(h).map(|e| e.assigned_interval), Some(4));
    }

    #[test]
    fn recycled_slot_starts_over() {
        let tiers = TierClassifier::default();
        let s = UpdateScheduler::new();
        let old = ObjectHandle::new(2, 0);
        let new = ObjectHandle::new(2, 1);
        s.decide(old, 0, FAR, OverrideFlags::NONE, &ctx(&tiers));
        s.mark_active(old, 0, 100);
        let d = s.decide(new, 1, FAR, OverrideFlags::NONE, &ctx(&tiers));
        assert!(d.update);
        assert_eq!(d.reason, Reason::Recycled);
        assert_eq!(s.entry(new).and_then(|e| e.active_until), None);
        assert!(s.entry(old).is_none());
        // Removing through the stale handle leaves the new owner alone.
        assert!(!s.remove(old));
        assert!(s.remove(new));
        assert!(s.is_empty());
    }

    #[test]
    fn commit_reports_interval_in_effect() {
        let tiers = TierClassifier::default();
        let s = UpdateScheduler::new();
        let h = ObjectHandle::from_index(0);
        s.decide(h, 0, FAR, OverrideFlags::NONE, &ctx(&tiers));
        assert_eq!(s.commit(h, 0), (4, Detail::StaticPose));
        assert_eq!(s.entry(h).map(|e| e.last_update_step), Some(0));
        assert_eq!(s.commit(ObjectHandle::from_index(99), 0), (1, Detail::Full));
    }

    #[test]
    fn sweep_evicts_idle_entries() {
        let tiers = TierClassifier::default();
        let s = UpdateScheduler::new();
        let a = ObjectHandle::from_index(0);
        let b = ObjectHandle::from_index(1);
        s.decide(a, 0, FAR, OverrideFlags::NONE, &ctx(&tiers));
        s.decide(b, 0, FAR, OverrideFlags::NONE, &ctx(&tiers));
        s.decide(b, 150, FAR, OverrideFlags::NONE, &ctx(&tiers));
        assert_eq!(s.sweep(200, 100), 1);
        assert!(s.entry(a).is_none());
        assert!(s.entry(b).is_some());
    }

    #[test]
    fn tier_change_takes_effect_immediately() {
        let tiers = TierClassifier::default();
        let s = UpdateScheduler::new();
        let h = ObjectHandle::from_index(1);
        s.decide(h, 0, FAR, OverrideFlags::NONE, &ctx(&tiers));
        // Walks into the near tier: every step from now on.
        for step in 1..5 {
            assert!(s.should_update(h, step, 4.0, OverrideFlags::NONE, &ctx(&tiers)));
        }
        assert_eq!(s.entry(h).map(|e| e.assigned_interval), Some(1));
    }
}
