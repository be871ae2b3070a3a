//! Load-adaptive controller.
//!
//! Tracks a slow exponential moving average of step duration and turns it
//! into a stress factor in `[0, 1]`. Stress rises by `raise_step` while the
//! average is above `target * raise_ratio` and falls by the smaller
//! `lower_step` while it is below target; in between it holds.
//!
//! One context writes (`record_step_duration`), any number read
//! (`stress_factor`). The factor is kept in thousandths in an atomic so
//! readers never lock and repeated steps land exactly on 0 and 1.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::config::StressConfig;

const SCALE: u32 = 1000;

#[derive(Debug)]
struct ControllerState {
    average_ms: Option<f64>,
    config: StressConfig,
    raise: u32,
    lower: u32,
}

impl ControllerState {
    fn new(config: StressConfig) -> Self {
        Self {
            raise: to_units(config.raise_step),
            lower: to_units(config.lower_step),
            average_ms: None,
            config,
        }
    }
}

fn to_units(step: f64) -> u32 {
    (step.clamp(0.0, 1.0) * f64::from(SCALE)).round() as u32
}

/// Exponential-moving-average stress controller.
#[derive(Debug)]
pub struct LoadController {
    state: Mutex<ControllerState>,
    stress: AtomicU32,
}

impl Default for LoadController {
    fn default() -> Self {
        Self::new(StressConfig::default())
    }
}

impl LoadController {
    pub fn new(config: StressConfig) -> Self {
        Self {
            state: Mutex::new(ControllerState::new(config)),
            stress: AtomicU32::new(0),
        }
    }

    /// Feed the duration of the step that just finished.
    ///
    /// The first sample seeds the average. Non-finite or negative samples
    /// are ignored.
    pub fn record_step_duration(&self, ms: f64) {
        if !ms.is_finite() || ms < 0.0 {
            return;
        }
        let mut state = self.state.lock();
        if !state.config.enabled {
            return;
        }
        let smoothing = state.config.smoothing;
        let average = match state.average_ms {
            Some(prev) => prev * (1.0 - smoothing) + ms * smoothing,
            None => ms,
        };
        state.average_ms = Some(average);

        let target = state.config.target_step_ms;
        let before = self.stress.load(Ordering::Relaxed);
        let after = if average > target * state.config.raise_ratio {
            (before + state.raise).min(SCALE)
        } else if average < target {
            before.saturating_sub(state.lower)
        } else {
            before
        };
        if after != before {
            self.stress.store(after, Ordering::Relaxed);
            let threshold = state.config.under_load_threshold;
            let was = f64::from(before) / f64::from(SCALE) > threshold;
            let now = f64::from(after) / f64::from(SCALE) > threshold;
            if now && !was {
                log::info!(
                    "simulation under load: avg step {:.1} ms (target {:.1} ms), stress {:.2}",
                    average,
                    target,
                    f64::from(after) / f64::from(SCALE)
                );
            } else if was && !now {
                log::info!("simulation load recovered: avg step {:.1} ms", average);
            }
        }
    }

    /// Current stress in `[0, 1]`; 0 while disabled.
    pub fn stress_factor(&self) -> f64 {
        f64::from(self.stress.load(Ordering::Relaxed)) / f64::from(SCALE)
    }

    pub fn is_under_load(&self) -> bool {
        self.stress_factor() > self.state.lock().config.under_load_threshold
    }

    pub fn average_step_ms(&self) -> Option<f64> {
        self.state.lock().average_ms
    }

    /// Swap in new constants, keeping the running average and stress.
    /// Disabling resets stress to 0.
    pub fn reconfigure(&self, config: StressConfig) {
        let mut state = self.state.lock();
        let average = state.average_ms;
        let enabled = config.enabled;
        *state = ControllerState::new(config);
        if enabled {
            state.average_ms = average;
        } else {
            self.stress.store(0, Ordering::Relaxed);
        }
    }

    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.average_ms = None;
        self.stress.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> LoadController {
        LoadController::new(StressConfig {
            target_step_ms: 10.0,
            ..StressConfig::default()
        })
    }

    #[test]
    fn starts_relaxed() {
        let c = controller();
        assert_eq!(c.stress_factor(), 0.0);
        assert!(!c.is_under_load());
        assert_eq!(c.average_step_ms(), None);
    }

    #[test]
    fn first_sample_seeds_average() {
        let c = controller();
        c.record_step_duration(30.0);
        assert_eq!(c.average_step_ms(), Some(30.0));
        c.record_step_duration(10.0);
        // 30 * 0.9 + 10 * 0.1
        assert!((c.average_step_ms().unwrap() - 28.0).abs() < 1e-9);
    }

    #[test]
    fn overload_raises_by_fixed_step() {
        let c = controller();
        c.record_step_duration(20.0);
        assert!((c.stress_factor() - 0.05).abs() < 1e-12);
        c.record_step_duration(20.0);
        assert!((c.stress_factor() - 0.10).abs() < 1e-12);
    }

    #[test]
    fn dead_band_holds() {
        let c = LoadController::new(StressConfig {
            target_step_ms: 10.0,
            smoothing: 1.0,
            ..StressConfig::default()
        });
        c.record_step_duration(20.0);
        assert!((c.stress_factor() - 0.05).abs() < 1e-12);
        // Between target and 1.5x target nothing moves.
        c.record_step_duration(12.0);
        assert!((c.stress_factor() - 0.05).abs() < 1e-12);
        c.record_step_duration(5.0);
        assert!((c.stress_factor() - 0.03).abs() < 1e-12);
    }

    #[test]
    fn recovery_is_slower_than_escalation() {
        let c = controller();
        for _ in 0..10 {
            c.record_step_duration(20.0);
        }
        let peak = c.stress_factor();
        assert!((peak - 0.5).abs() < 1e-12);
        // Idle steps drag the average below target.
        for _ in 0..30 {
            c.record_step_duration(0.0);
        }
        let lowered = c.stress_factor();
        assert!(lowered < peak);
        assert!(lowered >= 0.0);
    }

    #[test]
    fn saturates_at_one() {
        let c = controller();
        for _ in 0..100 {
            c.record_step_duration(1000.0);
            assert!(c.stress_factor() <= 1.0);
        }
        assert_eq!(c.stress_factor(), 1.0);
        assert!(c.is_under_load());
    }

    #[test]
    fn never_below_zero() {
        let c = controller();
        for _ in 0..50 {
            c.record_step_duration(1.0);
        }
        assert_eq!(c.stress_factor(), 0.0);
    }

    #[test]
    fn garbage_samples_ignored() {
        let c = controller();
        c.record_step_duration(f64::NAN);
        c.record_step_duration(-5.0);
        c.record_step_duration(f64::INFINITY);
        assert_eq!(c.average_step_ms(), None);
    }

    #[test]
    fn disabled_reports_zero() {
        let c = controller();
        c.record_step_duration(100.0);
        assert!(c.stress_factor() > 0.0);
        c.reconfigure(StressConfig {
            enabled: false,
            ..StressConfig::default()
        });
        assert_eq!(c.stress_factor(), 0.0);
        c.record_step_duration(100.0);
        assert_eq!(c.stress_factor(), 0.0);
    }

    #[test]
    fn reconfigure_keeps_average() {
        let c = controller();
        c.record_step_duration(40.0);
        c.reconfigure(StressConfig {
            target_step_ms: 100.0,
            ..StressConfig::default()
        });
        assert_eq!(c.average_step_ms(), Some(40.0));
        assert!((c.stress_factor() - 0.05).abs() < 1e-12);
    }
}
