//! Distribution drift detection.
//!
//! `DriftDetector` is a pure scorer: it compares a current window against a
//! baseline snapshot with PSI and a two-sample KS test. `DriftMonitor` owns
//! the streaming side. Every metric has a current window; the value that
//! falls out of the current window graduates into the rolling baseline, so
//! the reference always trails the window being judged (ADWIN-style split of
//! one stream into a reference half and a recent half).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::algo::ks::ks_two_sample;
use crate::algo::psi::population_stability_index;
use crate::algo::RingBuffer;
use crate::baseline::{
    mean_std, BaselineCheckpoint, BaselineSnapshot, BaselineStore, Metric, MetricKey, Scope,
};
use crate::config::{BaselineConfig, DriftConfig};
use crate::metrics;
use crate::record::TelemetryRecord;

// ============================================================================
// SCORES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftLevel {
    Stable,
    /// PSI in the moderate band; reported but never alerted on
    Moderate,
    Significant,
}

/// Drift of one metric's current window against its baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftScore {
    pub metric: Metric,
    /// SKU, or `"*"` for global metrics
    pub subject: String,
    pub psi: f64,
    pub ks_statistic: f64,
    pub ks_p_value: f64,
    pub computed_at: DateTime<Utc>,
    pub baseline_mean: f64,
    pub baseline_std: f64,
    pub current_mean: f64,
    pub current_std: f64,
    pub baseline_size: usize,
    pub window_size: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DriftOutcome {
    /// The baseline cannot serve as a reference yet; never alert on this.
    InsufficientBaseline { have: usize, need: usize },
    Scored(DriftScore),
}

// ============================================================================
// DETECTOR
// ============================================================================

#[derive(Debug, Clone)]
pub struct DriftDetector {
    config: DriftConfig,
}

impl DriftDetector {
    pub fn new(config: DriftConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DriftConfig {
        &self.config
    }

    pub fn score(
        &self,
        key: &MetricKey,
        window: &[f64],
        baseline: &BaselineSnapshot,
        now: DateTime<Utc>,
    ) -> DriftOutcome {
        let baseline = match baseline {
            BaselineSnapshot::Ready(b) => b,
            BaselineSnapshot::NotReady { have, need } => {
                return DriftOutcome::InsufficientBaseline {
                    have: *have,
                    need: *need,
                };
            }
        };

        let mut current: Vec<f64> = window.iter().copied().filter(|v| v.is_finite()).collect();
        current.sort_by(f64::total_cmp);

        let psi = population_stability_index(
            &baseline.sorted,
            &current,
            self.config.bins,
            self.config.epsilon,
        );
        let (ks_statistic, ks_p_value) = ks_two_sample(&baseline.sorted, &current);
        let (current_mean, current_std) = mean_std(&current);

        DriftOutcome::Scored(DriftScore {
            metric: key.metric,
            subject: key.subject().to_string(),
            psi,
            ks_statistic,
            ks_p_value,
            computed_at: now,
            baseline_mean: baseline.mean,
            baseline_std: baseline.std_dev,
            current_mean,
            current_std,
            baseline_size: baseline.len(),
            window_size: current.len(),
        })
    }

    pub fn level(&self, score: &DriftScore) -> DriftLevel {
        if score.psi > self.config.psi_significant || score.ks_p_value < self.config.ks_p_value {
            DriftLevel::Significant
        } else if score.psi >= self.config.psi_moderate {
            DriftLevel::Moderate
        } else {
            DriftLevel::Stable
        }
    }

    pub fn is_significant(&self, score: &DriftScore) -> bool {
        self.level(score) == DriftLevel::Significant
    }
}

// ============================================================================
// MONITOR
// ============================================================================

#[derive(Debug)]
struct CurrentWindow {
    values: RingBuffer<f64>,
    /// Values observed since creation; drives the evaluation cadence
    seen: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowCheckpoint {
    pub key: MetricKey,
    pub values: Vec<f64>,
    pub seen: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriftCheckpoint {
    pub baselines: Vec<BaselineCheckpoint>,
    pub windows: Vec<WindowCheckpoint>,
}

pub struct DriftMonitor {
    detector: DriftDetector,
    baselines: BaselineStore,
    windows: RwLock<HashMap<MetricKey, Arc<Mutex<CurrentWindow>>>>,
}

impl DriftMonitor {
    pub fn new(drift: &DriftConfig, baseline: &BaselineConfig) -> Self {
        Self {
            detector: DriftDetector::new(drift.clone()),
            baselines: BaselineStore::new(baseline),
            windows: RwLock::new(HashMap::new()),
        }
    }

    pub fn detector(&self) -> &DriftDetector {
        &self.detector
    }

    pub fn baselines(&self) -> &BaselineStore {
        &self.baselines
    }

    fn window(&self, key: &MetricKey) -> Arc<Mutex<CurrentWindow>> {
        if let Some(w) = self.windows.read().get(key) {
            return Arc::clone(w);
        }
        let capacity = self.detector.config.current_window;
        let mut map = self.windows.write();
        Arc::clone(map.entry(key.clone()).or_insert_with(|| {
            Arc::new(Mutex::new(CurrentWindow {
                values: RingBuffer::new(capacity),
                seen: 0,
            }))
        }))
    }

    /// Push one value for `key`. Returns an outcome when this value lands on
    /// the evaluation cadence and the current window is large enough.
    pub fn observe(&self, key: &MetricKey, value: f64, now: DateTime<Utc>) -> Option<DriftOutcome> {
        if !value.is_finite() {
            return None;
        }
        let config = &self.detector.config;
        let window = self.window(key);
        let mut w = window.lock();

        if let Some(graduated) = w.values.push(value) {
            self.baselines.record(key, graduated);
        }
        w.seen += 1;

        if w.seen % config.evaluate_every.max(1) != 0 || w.values.len() < config.min_window {
            return None;
        }

        let current = w.values.to_vec();
        drop(w);
        // Sorting and scoring run unlocked; a value graduating concurrently
        // may appear in both the copy and the baseline.
        let snapshot = self.baselines.snapshot(key);
        let outcome = self.detector.score(key, &current, &snapshot, now);

        if let DriftOutcome::Scored(score) = &outcome {
            metrics::DRIFT_EVALUATIONS.inc();
            let level = self.detector.level(score);
            if level != DriftLevel::Significant {
                debug!(
                    metric = %key,
                    psi = score.psi,
                    ks_p_value = score.ks_p_value,
                    ?level,
                    "drift evaluated"
                );
            }
        }
        Some(outcome)
    }

    /// Feed every tracked metric of a record: global scope always, SKU scope
    /// when enabled.
    pub fn observe_record(&self, record: &TelemetryRecord, now: DateTime<Utc>) -> Vec<DriftOutcome> {
        let per_sku = self.detector.config.per_sku;
        let mut outcomes = Vec::new();
        for metric in Metric::ALL {
            let Some(value) = metric.extract(record) else {
                continue;
            };
            if let Some(o) = self.observe(&MetricKey::global(metric), value, now) {
                outcomes.push(o);
            }
            if per_sku {
                if let Some(o) = self.observe(&MetricKey::sku(metric, record.sku.clone()), value, now) {
                    outcomes.push(o);
                }
            }
        }
        outcomes
    }

    pub fn forget_sku(&self, sku: &str) {
        self.windows
            .write()
            .retain(|k, _| !matches!(&k.scope, Scope::Sku(s) if s == sku));
        self.baselines.forget_sku(sku);
    }

    pub fn checkpoint(&self) -> DriftCheckpoint {
        let windows = self
            .windows
            .read()
            .iter()
            .map(|(key, w)| {
                let w = w.lock();
                WindowCheckpoint {
                    key: key.clone(),
                    values: w.values.to_vec(),
                    seen: w.seen,
                }
            })
            .collect();
        DriftCheckpoint {
            baselines: self.baselines.checkpoint(),
            windows,
        }
    }

    pub fn restore(&self, checkpoint: DriftCheckpoint) {
        self.baselines.restore(checkpoint.baselines);
        let capacity = self.detector.config.current_window;
        let mut map = self.windows.write();
        for cp in checkpoint.windows {
            map.insert(
                cp.key,
                Arc::new(Mutex::new(CurrentWindow {
                    values: RingBuffer::from_values(capacity, &cp.values),
                    seen: cp.seen,
                })),
            );
        }
    }
}
