//! Distance tiers for viewer-relative update throttling.
//!
//! Objects near the observer are simulated every step; farther objects are
//! bucketed into tiers with longer update intervals. This module turns a
//! squared distance (plus the current stress factor) into a [`Tier`] and
//! offers batch helpers for sizing a population.
//!
//! # Default tiers
//!
//! | Tier | Boundary | Interval | Detail |
//! |------|----------|----------|--------|
//! | `near` | 32 | every step | full pose |
//! | `mid` | 64 | every 2nd step | full pose |
//! | `far` | beyond | every 4th step | static pose |
//!
//! Under load the bounded boundaries shrink by `1 - stress * stress_shrink`,
//! never below `tier_floor` (and never above their configured value), so
//! objects drop into stricter tiers sooner without the near tier collapsing
//! to nothing.
//!
//! ```
//! use tickwise_logic::tier::TierClassifier;
//!
//! let tiers = TierClassifier::default();
//! assert_eq!(tiers.classify(10.0 * 10.0, 0.0).update_interval, 1);
//! assert_eq!(tiers.classify(50.0 * 50.0, 0.0).update_interval, 2);
//! assert_eq!(tiers.classify(f64::INFINITY, 0.0).update_interval, 4);
//! ```

use serde::{Deserialize, Serialize};

/// How much of an object's state is refreshed in its tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Detail {
    /// Position, orientation and animation pose all blend.
    #[default]
    Full,
    /// Animation pose is held at the last committed sample.
    StaticPose,
}

/// Configured shape of one tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierSpec {
    pub name: String,
    /// Outer boundary distance (not squared). `None` = everything beyond.
    #[serde(default)]
    pub max_distance: Option<f64>,
    /// Steps between mandatory updates; 1 = every step.
    pub update_interval: u32,
    #[serde(default)]
    pub detail: Detail,
}

impl TierSpec {
    pub fn bounded(name: &str, max_distance: f64, update_interval: u32, detail: Detail) -> Self {
        Self {
            name: name.to_string(),
            max_distance: Some(max_distance),
            update_interval,
            detail,
        }
    }

    pub fn unbounded(name: &str, update_interval: u32, detail: Detail) -> Self {
        Self {
            name: name.to_string(),
            max_distance: None,
            update_interval,
            detail,
        }
    }
}

/// Result of classification. Ordered by `index` (0 = nearest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tier {
    pub index: u8,
    pub update_interval: u32,
    pub detail: Detail,
}

impl Tier {
    /// The tier used when nothing is known: full rate, full detail.
    pub const FULL_RATE: Tier = Tier {
        index: 0,
        update_interval: 1,
        detail: Detail::Full,
    };

    pub fn is_full_rate(&self) -> bool {
        self.update_interval <= 1
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Boundary {
    max_distance: Option<f64>,
    tier: Tier,
}

/// Maps squared distances to tiers. Built from a sanitized configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct TierClassifier {
    boundaries: Vec<Boundary>,
    names: Vec<String>,
    floor: f64,
    shrink: f64,
}

impl Default for TierClassifier {
    fn default() -> Self {
        let config = crate::config::ThrottleConfig::default();
        Self::new(&config.tiers, config.tier_floor, config.stress_shrink)
    }
}

impl TierClassifier {
    /// Build from tier specs in ascending boundary order.
    ///
    /// Intervals of 0 are read as 1. An empty list yields a single
    /// full-rate tier so classification can never skip an update it
    /// should not.
    pub fn new(specs: &[TierSpec], floor: f64, shrink: f64) -> Self {
        let mut boundaries: Vec<Boundary> = specs
            .iter()
            .take(usize::from(u8::MAX))
            .enumerate()
            .map(|(i, spec)| Boundary {
                max_distance: spec.max_distance,
                tier: Tier {
                    index: i as u8,
                    update_interval: spec.update_interval.max(1),
                    detail: spec.detail,
                },
            })
            .collect();
        let mut names: Vec<String> = specs.iter().map(|s| s.name.clone()).collect();
        if boundaries.is_empty() {
            boundaries.push(Boundary {
                max_distance: None,
                tier: Tier::FULL_RATE,
            });
            names = vec!["all".to_string()];
        }
        Self {
            boundaries,
            names,
            floor: if floor.is_finite() { floor.max(0.0) } else { 0.0 },
            shrink: if shrink.is_finite() {
                shrink.clamp(0.0, 1.0)
            } else {
                0.0
            },
        }
    }

    /// Classify a squared distance under the given stress factor.
    ///
    /// Non-finite or negative distances land in the farthest tier.
    pub fn classify(&self, distance_squared: f64, stress_factor: f64) -> Tier {
        if !distance_squared.is_finite() || distance_squared < 0.0 {
            return self.farthest();
        }
        let factor = self.shrink_factor(stress_factor);
        for boundary in &self.boundaries {
            match boundary.max_distance {
                None => return boundary.tier,
                Some(base) => {
                    let effective = self.effective_boundary(base, factor);
                    if distance_squared <= effective * effective {
                        return boundary.tier;
                    }
                }
            }
        }
        self.farthest()
    }

    /// Boundary distance of tier `index` under `stress_factor`, or `None`
    /// for an unbounded tier or an out-of-range index.
    pub fn effective_max_distance(&self, index: usize, stress_factor: f64) -> Option<f64> {
        let base = self.boundaries.get(index)?.max_distance?;
        Some(self.effective_boundary(base, self.shrink_factor(stress_factor)))
    }

    /// The tier with the longest interval.
    pub fn farthest(&self) -> Tier {
        self.boundaries
            .last()
            .map(|b| b.tier)
            .unwrap_or(Tier::FULL_RATE)
    }

    pub fn tier_count(&self) -> usize {
        self.boundaries.len()
    }

    pub fn tier_name(&self, index: usize) -> &str {
        self.names.get(index).map(String::as_str).unwrap_or("unknown")
    }

    /// Count a batch of squared distances per tier.
    pub fn classify_batch(&self, distances_squared: &[f64], stress_factor: f64) -> TierStats {
        let mut stats = TierStats {
            counts: vec![0; self.tier_count()],
            intervals: self
                .boundaries
                .iter()
                .map(|b| b.tier.update_interval)
                .collect(),
        };
        for &d in distances_squared {
            let tier = self.classify(d, stress_factor);
            stats.counts[usize::from(tier.index)] += 1;
        }
        stats
    }

    /// Partition batch indices into per-tier buckets, nearest first.
    pub fn partition_by_tier(
        &self,
        distances_squared: &[f64],
        stress_factor: f64,
    ) -> Vec<Vec<usize>> {
        let mut buckets = vec![Vec::new(); self.tier_count()];
        for (i, &d) in distances_squared.iter().enumerate() {
            let tier = self.classify(d, stress_factor);
            buckets[usize::from(tier.index)].push(i);
        }
        buckets
    }

    fn shrink_factor(&self, stress_factor: f64) -> f64 {
        let stress = if stress_factor.is_finite() {
            stress_factor.clamp(0.0, 1.0)
        } else {
            0.0
        };
        1.0 - stress * self.shrink
    }

    fn effective_boundary(&self, base: f64, factor: f64) -> f64 {
        (base * factor).max(base.min(self.floor))
    }
}

/// Per-tier population counts from [`TierClassifier::classify_batch`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TierStats {
    pub counts: Vec<usize>,
    pub intervals: Vec<u32>,
}

impl TierStats {
    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }

    /// Expected full updates per step (a full-rate object costs 1.0).
    pub fn estimated_cost(&self) -> f64 {
        self.counts
            .iter()
            .zip(&self.intervals)
            .map(|(&count, &interval)| count as f64 / f64::from(interval.max(1)))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sq(d: f64) -> f64 {
        d * d
    }

    #[test]
    fn near_mid_far_by_distance() {
        let tiers = TierClassifier::default();
        assert_eq!(tiers.classify(sq(0.0), 0.0).index, 0);
        assert_eq!(tiers.classify(sq(32.0), 0.0).index, 0);
        assert_eq!(tiers.classify(sq(32.5), 0.0).index, 1);
        assert_eq!(tiers.classify(sq(64.0), 0.0).index, 1);
        assert_eq!(tiers.classify(sq(100.0), 0.0).index, 2);
    }

    #[test]
    fn far_tier_uses_static_pose() {
        let tiers = TierClassifier::default();
        let far = tiers.classify(sq(500.0), 0.0);
        assert_eq!(far.detail, Detail::StaticPose);
        assert_eq!(far.update_interval, 4);
        assert_eq!(far, tiers.farthest());
    }

    #[test]
    fn degenerate_distances_are_farthest() {
        let tiers = TierClassifier::default();
        assert_eq!(tiers.classify(f64::NAN, 0.0), tiers.farthest());
        assert_eq!(tiers.classify(f64::INFINITY, 0.0), tiers.farthest());
        assert_eq!(tiers.classify(-1.0, 0.0), tiers.farthest());
    }

    #[test]
    fn stress_shrinks_boundaries() {
        let tiers = TierClassifier::default();
        // 30 units is near when relaxed; at full stress the near boundary
        // is 32 * (1 - 0.5) = 16.
        assert_eq!(tiers.classify(sq(30.0), 0.0).index, 0);
        assert_eq!(tiers.classify(sq(30.0), 1.0).index, 1);
        let near = tiers.effective_max_distance(0, 1.0).unwrap();
        assert!((near - 16.0).abs() < 1e-9);
    }

    #[test]
    fn floor_stops_shrinking() {
        let specs = vec![
            TierSpec::bounded("near", 10.0, 1, Detail::Full),
            TierSpec::unbounded("far", 4, Detail::Full),
        ];
        let tiers = TierClassifier::new(&specs, 8.0, 1.0);
        let near = tiers.effective_max_distance(0, 1.0).unwrap();
        assert!((near - 8.0).abs() < 1e-9);
        assert_eq!(tiers.classify(sq(7.9), 1.0).index, 0);
        assert_eq!(tiers.classify(0.0, 1.0).index, 0);
    }

    #[test]
    fn floor_never_raises_a_boundary() {
        let specs = vec![
            TierSpec::bounded("near", 4.0, 1, Detail::Full),
            TierSpec::unbounded("far", 4, Detail::Full),
        ];
        let tiers = TierClassifier::new(&specs, 8.0, 0.5);
        assert_eq!(tiers.effective_max_distance(0, 1.0), Some(4.0));
        assert_eq!(tiers.classify(sq(5.0), 0.0).index, 1);
    }

    #[test]
    fn bad_stress_values_are_ignored() {
        let tiers = TierClassifier::default();
        assert_eq!(
            tiers.classify(sq(30.0), f64::NAN),
            tiers.classify(sq(30.0), 0.0)
        );
        assert_eq!(
            tiers.classify(sq(30.0), 7.0),
            tiers.classify(sq(30.0), 1.0)
        );
    }

    #[test]
    fn empty_spec_list_is_full_rate() {
        let tiers = TierClassifier::new(&[], 0.0, 0.0);
        assert_eq!(tiers.classify(sq(1000.0), 0.0), Tier::FULL_RATE);
        assert_eq!(tiers.tier_count(), 1);
    }

    #[test]
    fn zero_interval_reads_as_one() {
        let specs = vec![TierSpec::unbounded("only", 0, Detail::Full)];
        let tiers = TierClassifier::new(&specs, 0.0, 0.0);
        assert_eq!(tiers.classify(1.0, 0.0).update_interval, 1);
    }

    #[test]
    fn tier_ordering_follows_index() {
        let tiers = TierClassifier::default();
        let near = tiers.classify(sq(1.0), 0.0);
        let mid = tiers.classify(sq(50.0), 0.0);
        let far = tiers.classify(sq(500.0), 0.0);
        assert!(near < mid && mid < far);
        assert_eq!(tiers.tier_name(1), "mid");
        assert_eq!(tiers.tier_name(9), "unknown");
    }

    #[test]
    fn batch_counts_and_cost() {
        let tiers = TierClassifier::default();
        let distances = vec![sq(1.0), sq(10.0), sq(40.0), sq(50.0), sq(200.0), f64::NAN];
        let stats = tiers.classify_batch(&distances, 0.0);
        assert_eq!(stats.counts, vec![2, 2, 2]);
        assert_eq!(stats.total(), 6);
        // 2/1 + 2/2 + 2/4
        assert!((stats.estimated_cost() - 3.5).abs() < 1e-9);
    }

    #[test]
    fn partition_returns_indices() {
        let tiers = TierClassifier::default();
        let distances = vec![sq(100.0), sq(1.0), sq(40.0)];
        let buckets = tiers.partition_by_tier(&distances, 0.0);
        assert_eq!(buckets, vec![vec![1], vec![2], vec![0]]);
    }

    #[test]
    fn large_population_cost_reduction() {
        // 5,000 objects spread evenly out to 320 units.
        let tiers = TierClassifier::default();
        let distances: Vec<f64> = (0..5000).map(|i| sq(i as f64 * 0.064)).collect();
        let stats = tiers.classify_batch(&distances, 0.0);
        assert_eq!(stats.total(), 5000);
        assert!(stats.estimated_cost() < 2000.0);
    }
}
