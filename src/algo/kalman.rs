use serde::{Deserialize, Serialize};

/// One-dimensional recursive estimator for a slowly drifting level.
///
/// `update` applies the gain `k = v / (v + q + r)` and then re-inflates the
/// variance by `q`, so the variance can never collapse to zero and grows back
/// toward uncertainty if observations stop being informative.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct ScalarKalman {
    mean: f64,
    variance: f64,
    count: u64,
}

impl ScalarKalman {
    pub fn new(initial_mean: f64, initial_variance: f64) -> Self {
        Self {
            mean: initial_mean,
            variance: initial_variance,
            count: 0,
        }
    }

    /// Restore an estimator from persisted parts.
    pub fn from_parts(mean: f64, variance: f64, count: u64) -> Self {
        Self {
            mean,
            variance,
            count,
        }
    }

    /// Fold in observation `x` with measurement noise `r`; returns the gain used.
    pub fn update(&mut self, x: f64, process_noise: f64, measurement_noise: f64) -> f64 {
        let denom = self.variance + process_noise + measurement_noise;
        let gain = if denom > 0.0 { self.variance / denom } else { 0.0 };
        self.mean += gain * (x - self.mean);
        self.variance = (1.0 - gain) * self.variance + process_noise;
        self.count += 1;
        gain
    }

    /// Standardised distance of `x` from the current estimate.
    pub fn z_score(&self, x: f64, min_variance: f64) -> f64 {
        (x - self.mean) / self.variance.max(min_variance).sqrt()
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn variance(&self) -> f64 {
        self.variance
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn clamp_mean(&mut self, lo: f64, hi: f64) {
        self.mean = self.mean.clamp(lo, hi);
    }
}
