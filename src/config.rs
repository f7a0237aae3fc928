//! Engine configuration.
//!
//! Every section is `#[serde(default)]` so a TOML file only has to name the
//! values it overrides. Defaults carry the documented detection constants.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::alert::Severity;
use crate::error::ConfigError;

// ============================================================================
// ROOT
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub baseline: BaselineConfig,
    pub drift: DriftConfig,
    pub conversion: ConversionConfig,
    pub features: FeatureConfig,
    pub scorer: ScorerConfig,
    pub alerts: AlertConfig,
    pub shards: ShardConfig,
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        info!(path = %path.display(), "loaded engine configuration");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.into(),
            }
        }

        if self.baseline.capacity == 0 {
            return Err(invalid("baseline.capacity", "must be positive"));
        }
        if self.baseline.min_samples > self.baseline.capacity {
            return Err(invalid(
                "baseline.min_samples",
                format!(
                    "{} exceeds baseline.capacity {}",
                    self.baseline.min_samples, self.baseline.capacity
                ),
            ));
        }
        if self.drift.psi_moderate >= self.drift.psi_significant {
            return Err(invalid(
                "drift.psi_moderate",
                "must be below drift.psi_significant",
            ));
        }
        if !(0.0..1.0).contains(&self.drift.ks_p_value) {
            return Err(invalid("drift.ks_p_value", "must lie in [0, 1)"));
        }
        if self.drift.bins < 2 {
            return Err(invalid("drift.bins", "need at least two bins"));
        }
        if self.drift.current_window == 0 || self.drift.min_window > self.drift.current_window {
            return Err(invalid(
                "drift.min_window",
                "must be positive and at most drift.current_window",
            ));
        }
        if self.drift.evaluate_every == 0 {
            return Err(invalid("drift.evaluate_every", "must be positive"));
        }
        if self.conversion.process_noise <= 0.0 || self.conversion.min_variance <= 0.0 {
            return Err(invalid(
                "conversion.process_noise",
                "process noise and variance floor must be positive",
            ));
        }
        if self.conversion.z_threshold <= 0.0 {
            return Err(invalid("conversion.z_threshold", "must be positive"));
        }
        if self.scorer.threshold >= 1.0 || self.scorer.threshold <= -1.0 {
            return Err(invalid("scorer.threshold", "must lie in (-1, 1)"));
        }
        if self.features.referrer_window == 0 {
            return Err(invalid("features.referrer_window", "must be positive"));
        }
        if self.shards.sku_shards == 0 || self.shards.alert_shards == 0 {
            return Err(invalid("shards", "shard counts must be positive"));
        }
        for (table, field) in [
            (&self.alerts.ack_sla, "alerts.ack_sla"),
            (&self.alerts.resolve_sla, "alerts.resolve_sla"),
        ] {
            if table.critical == 0 || table.high == 0 || table.medium == 0 || table.low == 0 {
                return Err(invalid(field, "every severity needs a positive deadline"));
            }
        }
        Ok(())
    }
}

// ============================================================================
// BASELINE
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BaselineConfig {
    /// Maximum values held per baseline window.
    pub capacity: usize,
    /// Values required before the window may serve as a drift reference.
    pub min_samples: usize,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            capacity: 5_000,
            min_samples: 1_000,
        }
    }
}

// ============================================================================
// DRIFT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftConfig {
    /// PSI at or above this is moderate drift (reported, never alerted).
    pub psi_moderate: f64,
    /// PSI strictly above this is significant drift.
    pub psi_significant: f64,
    /// KS p-value strictly below this is significant drift.
    pub ks_p_value: f64,
    /// Number of quantile bins for PSI.
    pub bins: usize,
    /// Floor substituted for empty bin proportions.
    pub epsilon: f64,
    /// Capacity of the per-metric current window.
    pub current_window: usize,
    /// Values required in the current window before scoring.
    pub min_window: usize,
    /// Evaluate drift once per this many values recorded for a metric.
    pub evaluate_every: u64,
    /// Also track a baseline per SKU.
    pub per_sku: bool,
    pub severity: DriftSeverityBands,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            psi_moderate: 0.1,
            psi_significant: 0.2,
            ks_p_value: 0.05,
            bins: 10,
            epsilon: 1e-4,
            current_window: 500,
            min_window: 100,
            evaluate_every: 50,
            per_sku: false,
            severity: DriftSeverityBands::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftSeverityBands {
    pub psi_critical: f64,
    pub psi_high: f64,
    pub ks_critical: f64,
    pub ks_high: f64,
}

impl Default for DriftSeverityBands {
    fn default() -> Self {
        Self {
            psi_critical: 0.5,
            psi_high: 0.3,
            ks_critical: 0.01,
            ks_high: 0.05,
        }
    }
}

impl DriftSeverityBands {
    pub fn classify(&self, psi: f64, ks_p_value: f64) -> Severity {
        if psi > self.psi_critical || ks_p_value < self.ks_critical {
            Severity::Critical
        } else if psi > self.psi_high || ks_p_value < self.ks_high {
            Severity::High
        } else {
            Severity::Medium
        }
    }
}

// ============================================================================
// CONVERSION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionConfig {
    /// Process noise added to the variance after every update.
    pub process_noise: f64,
    /// Observation noise at one view; scaled by 1/sqrt(views).
    pub measurement_noise: f64,
    pub initial_mean: f64,
    pub initial_variance: f64,
    /// Variance floor used for the z-score denominator.
    pub min_variance: f64,
    /// Observations required before a z-score is reported.
    pub min_observations: u64,
    pub z_threshold: f64,
    pub z_critical: f64,
    pub z_high: f64,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            process_noise: 0.01,
            measurement_noise: 0.05,
            initial_mean: 0.05,
            initial_variance: 1.0,
            min_variance: 1e-6,
            min_observations: 10,
            z_threshold: 2.0,
            z_critical: 3.0,
            z_high: 2.5,
        }
    }
}

impl ConversionConfig {
    pub fn classify(&self, z: f64) -> Severity {
        let z = z.abs();
        if z > self.z_critical {
            Severity::Critical
        } else if z > self.z_high {
            Severity::High
        } else {
            Severity::Medium
        }
    }
}

// ============================================================================
// FEATURES
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Number of recent referrers kept for the irregularity feature.
    pub referrer_window: usize,
    /// Divisor applied to absolute stock change.
    pub stock_change_scale: f64,
    /// Divisor applied to price for the magnitude feature.
    pub price_scale: f64,
    /// Divisor applied to stock for the magnitude feature.
    pub stock_scale: f64,
    /// Cap on the magnitude features.
    pub magnitude_cap: f64,
    /// Cart rates outside `[cart_rate_low, cart_rate_high]` are irregular.
    pub cart_rate_low: f64,
    pub cart_rate_high: f64,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            referrer_window: 1_000,
            stock_change_scale: 100.0,
            price_scale: 1_000.0,
            stock_scale: 1_000.0,
            magnitude_cap: 10.0,
            cart_rate_low: 0.01,
            cart_rate_high: 0.5,
        }
    }
}

// ============================================================================
// SCORER
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScorerConfig {
    /// Scores strictly below this are anomalous.
    pub threshold: f64,
    pub critical_below: f64,
    pub high_below: f64,
    /// Feature vectors collected before the binary fits a model.
    pub warmup_records: usize,
    pub forest: ForestConfig,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            threshold: -0.3,
            critical_below: -0.6,
            high_below: -0.45,
            warmup_records: 500,
            forest: ForestConfig::default(),
        }
    }
}

impl ScorerConfig {
    pub fn classify(&self, score: f64) -> Severity {
        if score < self.critical_below {
            Severity::Critical
        } else if score < self.high_below {
            Severity::High
        } else if score < self.threshold {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForestConfig {
    pub num_trees: usize,
    pub sample_size: usize,
    pub seed: u64,
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            num_trees: 100,
            sample_size: 256,
            seed: 42,
        }
    }
}

// ============================================================================
// ALERTS
// ============================================================================

/// Deadline in seconds per severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaTable {
    pub critical: u64,
    pub high: u64,
    pub medium: u64,
    pub low: u64,
}

impl SlaTable {
    pub fn deadline_for(&self, severity: Severity) -> chrono::Duration {
        let secs = match severity {
            Severity::Critical => self.critical,
            Severity::High => self.high,
            Severity::Medium => self.medium,
            Severity::Low => self.low,
        };
        chrono::Duration::seconds(secs as i64)
    }

    /// Response-time policy: time allowed before acknowledgment.
    pub fn acknowledgment() -> Self {
        Self {
            critical: 5 * 60,
            high: 15 * 60,
            medium: 60 * 60,
            low: 4 * 60 * 60,
        }
    }

    /// Time allowed before resolution.
    pub fn resolution() -> Self {
        Self {
            critical: 60 * 60,
            high: 4 * 60 * 60,
            medium: 24 * 60 * 60,
            low: 72 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub ack_sla: SlaTable,
    pub resolve_sla: SlaTable,
    /// How long resolved/expired alerts stay queryable.
    pub retention_secs: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            ack_sla: SlaTable::acknowledgment(),
            resolve_sla: SlaTable::resolution(),
            retention_secs: 24 * 60 * 60,
        }
    }
}

// ============================================================================
// SHARDS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardConfig {
    pub sku_shards: usize,
    pub alert_shards: usize,
    /// Upper bound on tracked SKUs across all shards.
    pub max_skus: usize,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            sku_shards: 16,
            alert_shards: 16,
            max_skus: 1_000_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.baseline.min_samples, 1_000);
        assert_eq!(config.conversion.min_observations, 10);
        assert_eq!(config.scorer.threshold, -0.3);
    }

    #[test]
    fn test_partial_toml_overrides() {
        let config = EngineConfig::from_toml_str(
            r#"
            [drift]
            psi_significant = 0.25
            per_sku = true

            [alerts.ack_sla]
            critical = 120
            high = 600
            medium = 1800
            low = 7200
            "#,
        )
        .unwrap();
        assert_eq!(config.drift.psi_significant, 0.25);
        assert!(config.drift.per_sku);
        assert_eq!(config.drift.psi_moderate, 0.1);
        assert_eq!(config.alerts.ack_sla.critical, 120);
        assert_eq!(config.alerts.resolve_sla, SlaTable::resolution());
    }

    #[test]
    fn test_rejects_inverted_psi_bands() {
        let err = EngineConfig::from_toml_str(
            r#"
            [drift]
            psi_moderate = 0.3
            psi_significant = 0.2
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "drift.psi_moderate", .. }));
    }

    #[test]
    fn test_rejects_min_samples_above_capacity() {
        let mut config = EngineConfig::default();
        config.baseline.capacity = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_severity_bands() {
        let drift = DriftSeverityBands::default();
        assert_eq!(drift.classify(0.6, 0.5), Severity::Critical);
        assert_eq!(drift.classify(0.1, 0.001), Severity::Critical);
        assert_eq!(drift.classify(0.35, 0.5), Severity::High);
        assert_eq!(drift.classify(0.25, 0.2), Severity::Medium);

        let conversion = ConversionConfig::default();
        assert_eq!(conversion.classify(-3.5), Severity::Critical);
        assert_eq!(conversion.classify(2.7), Severity::High);
        assert_eq!(conversion.classify(2.1), Severity::Medium);

        let scorer = ScorerConfig::default();
        assert_eq!(scorer.classify(-0.7), Severity::Critical);
        assert_eq!(scorer.classify(-0.5), Severity::High);
        assert_eq!(scorer.classify(-0.35), Severity::Medium);
    }

    #[test]
    fn test_sla_tables() {
        let ack = SlaTable::acknowledgment();
        assert_eq!(ack.deadline_for(Severity::Critical), chrono::Duration::minutes(5));
        assert_eq!(ack.deadline_for(Severity::High), chrono::Duration::minutes(15));
        assert_eq!(ack.deadline_for(Severity::Medium), chrono::Duration::hours(1));
        assert_eq!(ack.deadline_for(Severity::Low), chrono::Duration::hours(4));
        let resolve = SlaTable::resolution();
        for s in [Severity::Critical, Severity::High, Severity::Medium, Severity::Low] {
            assert!(resolve.deadline_for(s) > ack.deadline_for(s));
        }
    }
}
