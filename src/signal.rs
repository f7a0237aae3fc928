//! Triggering signals.
//!
//! Detector outputs are turned into at most one `Signal` each. Only outputs
//! that cross their trigger threshold become signals; "not ready" outcomes
//! have no constructor here, so they can never reach the alert manager.

use serde::{Deserialize, Serialize};

use crate::alert::{Category, Evidence, RecordSnapshot, Severity};
use crate::config::EngineConfig;
use crate::conversion::ConversionReading;
use crate::drift::{DriftDetector, DriftScore};
use crate::features::FeatureVector;
use crate::scorer::AnomalyScore;

use std::collections::BTreeMap;

/// A detector output that warrants an alert for `subject`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// SKU, or `"*"` for global drift
    pub subject: String,
    pub severity: Severity,
    pub evidence: Evidence,
}

impl Signal {
    pub fn category(&self) -> Category {
        self.evidence.category()
    }
}

/// Applies trigger thresholds and severity bands.
#[derive(Debug, Clone)]
pub struct SignalPolicy {
    config: EngineConfig,
    drift: DriftDetector,
}

impl SignalPolicy {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            config: config.clone(),
            drift: DriftDetector::new(config.drift.clone()),
        }
    }

    /// PSI above the significant band or KS p-value below its threshold.
    pub fn from_drift(&self, score: &DriftScore) -> Option<Signal> {
        if !self.drift.is_significant(score) {
            return None;
        }
        Some(Signal {
            subject: score.subject.clone(),
            severity: self
                .config
                .drift
                .severity
                .classify(score.psi, score.ks_p_value),
            evidence: Evidence::Drift {
                scores: BTreeMap::from([(score.metric, score.clone())]),
            },
        })
    }

    pub fn from_conversion(&self, sku: &str, reading: &ConversionReading) -> Option<Signal> {
        if reading.z_score.abs() <= self.config.conversion.z_threshold {
            return None;
        }
        Some(Signal {
            subject: sku.to_string(),
            severity: self.config.conversion.classify(reading.z_score),
            evidence: Evidence::Conversion { reading: *reading },
        })
    }

    pub fn from_anomaly(
        &self,
        sku: &str,
        score: &AnomalyScore,
        features: &FeatureVector,
        record: RecordSnapshot,
    ) -> Option<Signal> {
        if score.score >= self.config.scorer.threshold {
            return None;
        }
        Some(Signal {
            subject: sku.to_string(),
            severity: self.config.scorer.classify(score.score),
            evidence: Evidence::Anomaly {
                score: score.clone(),
                features: *features,
                record,
            },
        })
    }
}
