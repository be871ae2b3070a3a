//! Render-side interpolation between committed samples.
//!
//! A throttled object only gets a fresh state every `interval` steps. The
//! motion cache keeps the last two committed states and blends between them
//! so the renderer sees smooth movement instead of a jump every few steps.
//!
//! `t = clamp(((step - committed_at) + sub_step) / interval, 0, 1)`

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::geometry::{lerp_angle_degrees, Vec3};
use crate::handle::ObjectHandle;
use crate::tier::Detail;

/// State that can be blended between two committed samples.
pub trait Interpolate: Clone {
    /// Blend from `self` towards `target`; `t` is already clamped to `[0, 1]`.
    fn interpolate(&self, target: &Self, t: f64) -> Self;

    /// Blend used for static-pose tiers. Defaults to a full blend.
    fn interpolate_static_pose(&self, target: &Self, t: f64) -> Self {
        self.interpolate(target, t)
    }
}

impl Interpolate for Vec3 {
    fn interpolate(&self, target: &Self, t: f64) -> Self {
        self.lerp(target, t)
    }
}

/// Facing in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Orientation {
    pub yaw: f32,
    pub pitch: f32,
}

impl Orientation {
    fn blend(&self, target: &Orientation, t: f32) -> Orientation {
        Orientation {
            yaw: lerp_angle_degrees(self.yaw, target.yaw, t),
            pitch: lerp_angle_degrees(self.pitch, target.pitch, t),
        }
    }
}

/// Animation parameters of a limbed object.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    pub limb_swing: f32,
    pub limb_swing_amount: f32,
    pub head_yaw: f32,
    pub head_pitch: f32,
}

impl Pose {
    fn blend(&self, target: &Pose, t: f32) -> Pose {
        Pose {
            limb_swing: self.limb_swing + (target.limb_swing - self.limb_swing) * t,
            limb_swing_amount: self.limb_swing_amount
                + (target.limb_swing_amount - self.limb_swing_amount) * t,
            head_yaw: lerp_angle_degrees(self.head_yaw, target.head_yaw, t),
            head_pitch: lerp_angle_degrees(self.head_pitch, target.head_pitch, t),
        }
    }
}

/// Everything the renderer reads from a dynamic object.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MotionState {
    pub position: Vec3,
    pub orientation: Option<Orientation>,
    pub pose: Option<Pose>,
}

impl MotionState {
    pub fn at(position: Vec3) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }

    fn blend_common(&self, target: &Self, t: f64) -> Self {
        let orientation = match (self.orientation, target.orientation) {
            (Some(from), Some(to)) => Some(from.blend(&to, t as f32)),
            (_, to) => to,
        };
        MotionState {
            position: self.position.lerp(&target.position, t),
            orientation,
            pose: target.pose,
        }
    }
}

impl Interpolate for MotionState {
    fn interpolate(&self, target: &Self, t: f64) -> Self {
        let mut out = self.blend_common(target, t);
        if let (Some(from), Some(to)) = (self.pose, target.pose) {
            out.pose = Some(from.blend(&to, t as f32));
        }
        out
    }

    fn interpolate_static_pose(&self, target: &Self, t: f64) -> Self {
        self.blend_common(target, t)
    }
}

/// The two most recent commits for one object.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionSamplePair<S> {
    pub generation: u32,
    pub previous: S,
    pub target: S,
    pub committed_at_step: u64,
    pub interval_at_commit: u32,
    pub detail: Detail,
}

impl<S: Interpolate> MotionSamplePair<S> {
    pub fn fraction(&self, step: u64, sub_step: f64) -> f64 {
        let interval = f64::from(self.interval_at_commit.max(1));
        let sub_step = if sub_step.is_finite() { sub_step } else { 0.0 };
        let elapsed = step.saturating_sub(self.committed_at_step) as f64 + sub_step;
        (elapsed / interval).clamp(0.0, 1.0)
    }

    pub fn blend(&self, t: f64) -> S {
        if t <= 0.0 {
            return self.previous.clone();
        }
        if t >= 1.0 {
            return self.target.clone();
        }
        match self.detail {
            Detail::Full => self.previous.interpolate(&self.target, t),
            Detail::StaticPose => self.previous.interpolate_static_pose(&self.target, t),
        }
    }
}

/// Sample pairs keyed by handle index.
#[derive(Debug)]
pub struct MotionCache<S> {
    pairs: RwLock<HashMap<u32, MotionSamplePair<S>>>,
}

impl<S> Default for MotionCache<S> {
    fn default() -> Self {
        Self {
            pairs: RwLock::new(HashMap::new()),
        }
    }
}

impl<S: Interpolate> MotionCache<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a freshly simulated state. The previous target becomes the
    /// blend origin; the first commit (or a recycled slot) seeds both.
    pub fn commit(&self, handle: ObjectHandle, step: u64, state: S, interval: u32, detail: Detail) {
        let mut pairs = self.pairs.write();
        match pairs.get_mut(&handle.index()) {
            Some(pair) if pair.generation == handle.generation() => {
                pair.previous = std::mem::replace(&mut pair.target, state);
                pair.committed_at_step = step;
                pair.interval_at_commit = interval;
                pair.detail = detail;
            }
            _ => {
                pairs.insert(
                    handle.index(),
                    MotionSamplePair {
                        generation: handle.generation(),
                        previous: state.clone(),
                        target: state,
                        committed_at_step: step,
                        interval_at_commit: interval,
                        detail,
                    },
                );
            }
        }
    }

    /// The state to render. Falls back to `live` when nothing usable is
    /// cached or the object is updated every step.
    pub fn sample(&self, handle: ObjectHandle, step: u64, sub_step: f64, live: &S) -> S {
        let pairs = self.pairs.read();
        match pairs.get(&handle.index()) {
            Some(pair) if pair.generation == handle.generation() && pair.interval_at_commit > 1 => {
                pair.blend(pair.fraction(step, sub_step))
            }
            _ => live.clone(),
        }
    }

    /// Blend fraction that `sample` would use, if a pair is cached.
    pub fn fraction(&self, handle: ObjectHandle, step: u64, sub_step: f64) -> Option<f64> {
        let pairs = self.pairs.read();
        let pair = pairs.get(&handle.index())?;
        (pair.generation == handle.generation()).then(|| pair.fraction(step, sub_step))
    }

    pub fn pair(&self, handle: ObjectHandle) -> Option<MotionSamplePair<S>> {
        let pairs = self.pairs.read();
        let pair = pairs.get(&handle.index())?;
        (pair.generation == handle.generation()).then(|| pair.clone())
    }

    pub fn remove(&self, handle: ObjectHandle) -> bool {
        let mut pairs = self.pairs.write();
        match pairs.get(&handle.index()) {
            Some(pair) if pair.generation == handle.generation() => {
                pairs.remove(&handle.index());
                true
            }
            _ => false,
        }
    }

    /// Drop pairs whose last commit is `horizon` or more steps old.
    pub fn sweep(&self, step: u64, horizon: u64) -> usize {
        let mut pairs = self.pairs.write();
        let before = pairs.len();
        pairs.retain(|_, pair| step.saturating_sub(pair.committed_at_step) < horizon);
        before - pairs.len()
    }

    pub fn clear(&self) {
        self.pairs.write().clear();
    }

    pub fn len(&self) -> usize {
        self.pairs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn x(v: f64) -> Vec3 {
        Vec3::new(v, 0.0, 0.0)
    }

    #[test]
    fn unknown_object_renders_live() {
        let cache: MotionCache<Vec3> = MotionCache::new();
        let live = x(3.0);
        assert_eq!(cache.sample(ObjectHandle::from_index(1), 5, 0.5, &live), live);
    }

    #[test]
    fn first_commit_seeds_both_samples() {
        let cache = MotionCache::new();
        let h = ObjectHandle::from_index(1);
        cache.commit(h, 0, x(10.0), 4, Detail::Full);
        let pair = cache.pair(h).unwrap();
        assert_eq!(pair.previous, pair.target);
        assert_eq!(cache.sample(h, 2, 0.0, &x(99.0)), x(10.0));
    }

    #[test]
    fn blends_across_the_interval() {
        let cache = MotionCache::new();
        let h = ObjectHandle::from_index(1);
        cache.commit(h, 0, x(0.0), 4, Detail::Full);
        cache.commit(h, 4, x(8.0), 4, Detail::Full);
        assert_eq!(cache.sample(h, 4, 0.0, &x(99.0)), x(0.0));
        assert_eq!(cache.sample(h, 6, 0.5, &x(99.0)), x(5.0));
        assert_eq!(cache.sample(h, 8, 0.0, &x(99.0)), x(8.0));
        // Past the interval it holds the target.
        assert_eq!(cache.sample(h, 20, 0.9, &x(99.0)), x(8.0));
    }

    #[test]
    fn full_rate_objects_render_live() {
        let cache = MotionCache::new();
        let h = ObjectHandle::from_index(1);
        cache.commit(h, 0, x(0.0), 1, Detail::Full);
        cache.commit(h, 1, x(1.0), 1, Detail::Full);
        assert_eq!(cache.sample(h, 1, 0.5, &x(1.2)), x(1.2));
    }

    #[test]
    fn fraction_clamps() {
        let cache = MotionCache::new();
        let h = ObjectHandle::from_index(0);
        cache.commit(h, 10, x(0.0), 4, Detail::Full);
        assert_eq!(cache.fraction(h, 9, 0.0), Some(0.0));
        assert_eq!(cache.fraction(h, 12, 0.5), Some(0.625));
        assert_eq!(cache.fraction(h, 40, 0.0), Some(1.0));
        assert_eq!(cache.fraction(h, 10, f64::NAN), Some(0.0));
    }

    #[test]
    fn orientation_takes_short_arc() {
        let from = MotionState {
            orientation: Some(Orientation {
                yaw: 170.0,
                pitch: 0.0,
            }),
            ..MotionState::default()
        };
        let to = MotionState {
            orientation: Some(Orientation {
                yaw: -170.0,
                pitch: 10.0,
            }),
            ..MotionState::default()
        };
        let mid = from.interpolate(&to, 0.25);
        let o = mid.orientation.unwrap();
        assert!((o.yaw - 175.0).abs() < 1e-3);
        assert!((o.pitch - 2.5).abs() < 1e-3);
    }

    #[test]
    fn static_pose_holds_target_pose() {
        let pose = |swing: f32| Pose {
            limb_swing: swing,
            limb_swing_amount: swing,
            ..Pose::default()
        };
        let from = MotionState {
            position: x(0.0),
            orientation: None,
            pose: Some(pose(0.0)),
        };
        let to = MotionState {
            position: x(4.0),
            orientation: None,
            pose: Some(pose(1.0)),
        };
        let full = from.interpolate(&to, 0.5);
        assert_eq!(full.pose, Some(pose(0.5)));
        let frozen = from.interpolate_static_pose(&to, 0.5);
        assert_eq!(frozen.position, x(2.0));
        assert_eq!(frozen.pose, Some(pose(1.0)));
    }

    #[test]
    fn recycled_slot_reseeds() {
        let cache = MotionCache::new();
        let old = ObjectHandle::new(3, 0);
        let new = ObjectHandle::new(3, 1);
        cache.commit(old, 0, x(0.0), 4, Detail::Full);
        cache.commit(old, 4, x(4.0), 4, Detail::Full);
        cache.commit(new, 5, x(100.0), 4, Detail::Full);
        let pair = cache.pair(new).unwrap();
        assert_eq!(pair.previous, x(100.0));
        assert!(cache.pair(old).is_none());
        assert_eq!(cache.sample(old, 6, 0.0, &x(7.0)), x(7.0));
        assert!(!cache.remove(old));
        assert!(cache.remove(new));
    }

    #[test]
    fn sweep_drops_stale_pairs() {
        let cache = MotionCache::new();
        cache.commit(ObjectHandle::from_index(0), 0, x(0.0), 4, Detail::Full);
        cache.commit(ObjectHandle::from_index(1), 90, x(0.0), 4, Detail::Full);
        assert_eq!(cache.sweep(100, 50), 1);
        assert_eq!(cache.len(), 1);
    }
}
