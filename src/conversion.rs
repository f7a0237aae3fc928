//! Expected conversion rate per SKU.
//!
//! Each SKU carries a scalar recursive estimate of its conversion rate. A new
//! observation is first scored against the prior estimate, then folded in.
//! Measurement noise shrinks with traffic (`r = R / sqrt(views)`), so a record
//! backed by many views moves the estimate more than one backed by a handful.

use serde::{Deserialize, Serialize};

use crate::algo::ScalarKalman;
use crate::config::ConversionConfig;

/// Per-SKU recursive estimate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConversionState {
    filter: ScalarKalman,
}

impl ConversionState {
    /// State with an explicit prior and observation count.
    pub fn with_prior(mean: f64, variance: f64, observations: u64) -> Self {
        Self {
            filter: ScalarKalman::from_parts(mean, variance, observations),
        }
    }

    pub fn mean(&self) -> f64 {
        self.filter.mean()
    }

    pub fn variance(&self) -> f64 {
        self.filter.variance()
    }

    pub fn observations(&self) -> u64 {
        self.filter.count()
    }
}

/// Conversion reading for one record, scored against the prior estimate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConversionReading {
    pub observed: f64,
    pub expected: f64,
    pub variance: f64,
    pub z_score: f64,
    pub observations: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConversionSignal {
    /// Conversion rate is undefined for a record without views.
    NoViews,
    /// Too few observations for the estimate to be trusted; never alert on this.
    InsufficientHistory { observations: u64, needed: u64 },
    Observed(ConversionReading),
}

impl ConversionSignal {
    pub fn reading(&self) -> Option<&ConversionReading> {
        match self {
            Self::Observed(r) => Some(r),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConversionTracker {
    config: ConversionConfig,
}

impl ConversionTracker {
    pub fn new(config: ConversionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConversionConfig {
        &self.config
    }

    /// Fresh state for a SKU seen for the first time.
    pub fn new_state(&self) -> ConversionState {
        ConversionState {
            filter: ScalarKalman::new(self.config.initial_mean, self.config.initial_variance),
        }
    }

    /// Score `purchases / views` against `state`, then update it.
    pub fn observe(&self, state: &mut ConversionState, purchases: u64, views: u64) -> ConversionSignal {
        if views == 0 {
            return ConversionSignal::NoViews;
        }
        let x = purchases as f64 / views as f64;
        let prior = state.filter;

        let r = self.config.measurement_noise / (views as f64).sqrt();
        state.filter.update(x, self.config.process_noise, r);
        state.filter.clamp_mean(0.0, 1.0);

        if prior.count() < self.config.min_observations {
            return ConversionSignal::InsufficientHistory {
                observations: prior.count(),
                needed: self.config.min_observations,
            };
        }

        ConversionSignal::Observed(ConversionReading {
            observed: x,
            expected: prior.mean(),
            variance: prior.variance(),
            z_score: prior.z_score(x, self.config.min_variance),
            observations: prior.count(),
        })
    }

    pub fn is_deviation(&self, reading: &ConversionReading) -> bool {
        reading.z_score.abs() > self.config.z_threshold
    }

    /// Expected rate if the SKU has enough history.
    pub fn expected(&self, state: &ConversionState) -> Option<f64> {
        (state.observations() >= self.config.min_observations).then(|| state.mean())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> ConversionTracker {
        ConversionTracker::new(ConversionConfig::default())
    }

    #[test]
    fn test_cold_start_reports_insufficient_history() {
        let tracker = tracker();
        let mut state = tracker.new_state();
        for i in 0..10 {
            let signal = tracker.observe(&mut state, 5, 100);
            assert_eq!(
                signal,
                ConversionSignal::InsufficientHistory {
                    observations: i,
                    needed: 10
                }
            );
        }
        assert!(tracker.observe(&mut state, 5, 100).reading().is_some());
        assert_eq!(state.observations(), 11);
    }

    #[test]
    fn test_no_views_leaves_state_untouched() {
        let tracker = tracker();
        let mut state = tracker.new_state();
        assert_eq!(tracker.observe(&mut state, 0, 0), ConversionSignal::NoViews);
        assert_eq!(state.observations(), 0);
    }

    #[test]
    fn test_large_jump_is_deviation() {
        let tracker = tracker();
        let mut state = ConversionState::with_prior(0.10, 0.01, 50);
        let signal = tracker.observe(&mut state, 40, 100);
        let reading = signal.reading().unwrap();
        assert!((reading.z_score - 3.0).abs() < 1e-9);
        assert!(tracker.is_deviation(reading));
        assert!(state.mean() > 0.10);
    }

    #[test]
    fn test_variance_bounded_and_positive() {
        let tracker = tracker();
        let mut state = tracker.new_state();
        for _ in 0..5_000 {
            tracker.observe(&mut state, 5, 100);
            assert!(state.variance() > 0.0);
            assert!(state.variance() <= 1.0);
        }
        // Settles near the steady-state of the recursion, well above zero.
        assert!(state.variance() >= ConversionConfig::default().process_noise);
        assert!((state.mean() - 0.05).abs() < 1e-6);
    }

    #[test]
    fn test_steady_traffic_does_not_deviate() {
        let tracker = tracker();
        let mut state = tracker.new_state();
        let mut deviations = 0;
        for i in 0..500u64 {
            let purchases = 4 + (i % 3);
            if let ConversionSignal::Observed(r) = tracker.observe(&mut state, purchases, 100) {
                if tracker.is_deviation(&r) {
                    deviations += 1;
                }
            }
        }
        assert_eq!(deviations, 0);
    }

    #[test]
    fn test_mean_clamped_to_unit_interval() {
        let tracker = tracker();
        let mut state = ConversionState::with_prior(0.99, 1.0, 50);
        tracker.observe(&mut state, 1_000, 1_000);
        assert!(state.mean() <= 1.0);
        assert!(tracker.expected(&state).is_some());
    }
}
