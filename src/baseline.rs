//! Rolling reference distributions for drift detection.
//!
//! Each tracked metric (globally, and optionally per SKU) owns a fixed-capacity
//! FIFO window. A window serves as a drift reference only once it holds
//! `min_samples` values.
//!
//! Locking: the key map sits behind a `RwLock` that is write-locked only when a
//! new key first appears; every window has its own `Mutex`, so writers to
//! different metrics never wait on each other while writers to the same
//! metric are serialized.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::algo::RingBuffer;
use crate::config::BaselineConfig;
use crate::record::TelemetryRecord;

/// Subject used for metrics tracked across all SKUs.
pub const GLOBAL_SUBJECT: &str = "*";

// ============================================================================
// METRIC KEYS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Price,
    Stock,
    ConversionRate,
    CartRate,
}

impl Metric {
    pub const ALL: [Metric; 4] = [
        Metric::Price,
        Metric::Stock,
        Metric::ConversionRate,
        Metric::CartRate,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Price => "price",
            Self::Stock => "stock",
            Self::ConversionRate => "conversion_rate",
            Self::CartRate => "cart_rate",
        }
    }

    /// Value of this metric in a record; rates are undefined without views.
    pub fn extract(&self, record: &TelemetryRecord) -> Option<f64> {
        match self {
            Self::Price => Some(record.price),
            Self::Stock => Some(record.stock as f64),
            Self::ConversionRate => record.conversion_rate(),
            Self::CartRate => record.cart_rate(),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    Global,
    Sku(String),
}

/// A metric together with the population it is tracked over.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricKey {
    pub metric: Metric,
    pub scope: Scope,
}

impl MetricKey {
    pub fn global(metric: Metric) -> Self {
        Self {
            metric,
            scope: Scope::Global,
        }
    }

    pub fn sku(metric: Metric, sku: impl Into<String>) -> Self {
        Self {
            metric,
            scope: Scope::Sku(sku.into()),
        }
    }

    /// Alert subject: the SKU, or `"*"` for global metrics.
    pub fn subject(&self) -> &str {
        match &self.scope {
            Scope::Global => GLOBAL_SUBJECT,
            Scope::Sku(sku) => sku,
        }
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.metric, self.subject())
    }
}

// ============================================================================
// SNAPSHOTS
// ============================================================================

/// Reference distribution, values ascending.
#[derive(Debug, Clone, PartialEq)]
pub struct Baseline {
    pub sorted: Vec<f64>,
    pub mean: f64,
    pub std_dev: f64,
}

impl Baseline {
    pub fn from_values(mut values: Vec<f64>) -> Self {
        values.retain(|v| v.is_finite());
        values.sort_by(f64::total_cmp);
        let (mean, std_dev) = mean_std(&values);
        Self {
            sorted: values,
            mean,
            std_dev,
        }
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BaselineSnapshot {
    Ready(Baseline),
    NotReady { have: usize, need: usize },
}

impl BaselineSnapshot {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }
}

/// Population mean and standard deviation; zeros for an empty slice.
pub fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

// ============================================================================
// STORE
// ============================================================================

#[derive(Debug)]
struct BaselineWindow {
    values: RingBuffer<f64>,
    ready_announced: bool,
}

/// Persisted form of one baseline window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineCheckpoint {
    pub key: MetricKey,
    /// Oldest first
    pub values: Vec<f64>,
}

pub struct BaselineStore {
    windows: RwLock<HashMap<MetricKey, Arc<Mutex<BaselineWindow>>>>,
    capacity: usize,
    min_samples: usize,
}

impl BaselineStore {
    pub fn new(config: &BaselineConfig) -> Self {
        Self {
            windows: RwLock::new(HashMap::new()),
            capacity: config.capacity.max(1),
            min_samples: config.min_samples,
        }
    }

    fn window(&self, key: &MetricKey) -> Arc<Mutex<BaselineWindow>> {
        if let Some(w) = self.windows.read().get(key) {
            return Arc::clone(w);
        }
        let mut map = self.windows.write();
        Arc::clone(map.entry(key.clone()).or_insert_with(|| {
            Arc::new(Mutex::new(BaselineWindow {
                values: RingBuffer::new(self.capacity),
                ready_announced: false,
            }))
        }))
    }

    /// Append a value to `key`'s window, evicting the oldest at capacity.
    /// Returns `true` on the call that first makes the window ready.
    pub fn record(&self, key: &MetricKey, value: f64) -> bool {
        if !value.is_finite() {
            return false;
        }
        let window = self.window(key);
        let mut w = window.lock();
        w.values.push(value);
        if !w.ready_announced && w.values.len() >= self.min_samples {
            w.ready_announced = true;
            info!(metric = %key, samples = w.values.len(), "baseline ready");
            return true;
        }
        false
    }

    pub fn snapshot(&self, key: &MetricKey) -> BaselineSnapshot {
        let Some(window) = self.windows.read().get(key).map(Arc::clone) else {
            return BaselineSnapshot::NotReady {
                have: 0,
                need: self.min_samples,
            };
        };
        let w = window.lock();
        if w.values.len() < self.min_samples {
            return BaselineSnapshot::NotReady {
                have: w.values.len(),
                need: self.min_samples,
            };
        }
        BaselineSnapshot::Ready(Baseline::from_values(w.values.to_vec()))
    }

    pub fn len(&self, key: &MetricKey) -> usize {
        self.windows
            .read()
            .get(key)
            .map(|w| w.lock().values.len())
            .unwrap_or(0)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn min_samples(&self) -> usize {
        self.min_samples
    }

    /// Drop the windows of one SKU (used when the SKU is evicted).
    pub fn forget_sku(&self, sku: &str) {
        self.windows
            .write()
            .retain(|k, _| !matches!(&k.scope, Scope::Sku(s) if s == sku));
    }

    pub fn checkpoint(&self) -> Vec<BaselineCheckpoint> {
        self.windows
            .read()
            .iter()
            .map(|(key, w)| BaselineCheckpoint {
                key: key.clone(),
                values: w.lock().values.to_vec(),
            })
            .collect()
    }

    pub fn restore(&self, checkpoints: Vec<BaselineCheckpoint>) {
        let mut map = self.windows.write();
        for cp in checkpoints {
            let values = RingBuffer::from_values(self.capacity, &cp.values);
            let ready = values.len() >= self.min_samples;
            map.insert(
                cp.key,
                Arc::new(Mutex::new(BaselineWindow {
                    values,
                    ready_announced: ready,
                })),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(capacity: usize, min_samples: usize) -> BaselineStore {
        BaselineStore::new(&BaselineConfig {
            capacity,
            min_samples,
        })
    }

    #[test]
    fn test_not_ready_below_minimum() {
        let store = store(100, 10);
        let key = MetricKey::global(Metric::Price);
        for i in 0..9 {
            assert!(!store.record(&key, i as f64));
        }
        assert_eq!(
            store.snapshot(&key),
            BaselineSnapshot::NotReady { have: 9, need: 10 }
        );
        assert!(store.record(&key, 9.0));
        assert!(store.snapshot(&key).is_ready());
        // Readiness is announced once.
        assert!(!store.record(&key, 10.0));
    }

    #[test]
    fn test_unknown_key_not_ready() {
        let store = store(100, 10);
        assert_eq!(
            store.snapshot(&MetricKey::sku(Metric::Stock, "A")),
            BaselineSnapshot::NotReady { have: 0, need: 10 }
        );
    }

    #[test]
    fn test_capacity_fifo() {
        let store = store(5, 1);
        let key = MetricKey::global(Metric::Stock);
        for i in 0..12 {
            store.record(&key, i as f64);
            assert!(store.len(&key) <= 5);
        }
        let BaselineSnapshot::Ready(b) = store.snapshot(&key) else {
            panic!("expected ready baseline");
        };
        assert_eq!(b.sorted, vec![7.0, 8.0, 9.0, 10.0, 11.0]);
        assert_eq!(b.mean, 9.0);
    }

    #[test]
    fn test_keys_are_independent() {
        let store = store(10, 2);
        let a = MetricKey::sku(Metric::Price, "A");
        let b = MetricKey::sku(Metric::Price, "B");
        store.record(&a, 1.0);
        store.record(&a, 2.0);
        assert!(store.snapshot(&a).is_ready());
        assert!(!store.snapshot(&b).is_ready());
        store.forget_sku("A");
        assert_eq!(store.len(&a), 0);
    }

    #[test]
    fn test_non_finite_values_ignored() {
        let store = store(10, 1);
        let key = MetricKey::global(Metric::CartRate);
        store.record(&key, f64::NAN);
        assert_eq!(store.len(&key), 0);
    }

    #[test]
    fn test_concurrent_metrics() {
        let store = Arc::new(store(1_000, 100));
        let handles: Vec<_> = Metric::ALL
            .into_iter()
            .map(|metric| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let key = MetricKey::global(metric);
                    for i in 0..500 {
                        store.record(&key, i as f64);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        for metric in Metric::ALL {
            assert_eq!(store.len(&MetricKey::global(metric)), 500);
        }
    }

    #[test]
    fn test_checkpoint_restore() {
        let original = store(10, 3);
        let key = MetricKey::sku(Metric::ConversionRate, "X");
        for v in [0.1, 0.2, 0.3, 0.4] {
            original.record(&key, v);
        }
        let restored = store(10, 3);
        restored.restore(original.checkpoint());
        assert_eq!(restored.snapshot(&key), original.snapshot(&key));
    }
}
