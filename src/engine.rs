//! Detection engine: one entry point per record.
//!
//! `process` runs a record through feature extraction, drift, conversion
//! tracking and anomaly scoring, converts triggering outputs into signals and
//! folds them into alerts. Everything that touches one SKU happens under that
//! SKU's registry shard lock, so records of one SKU apply in arrival order.
//! Lock order is registry shard, then referrer window / drift windows, then
//! alert shard, then the alert store; nothing acquires them in reverse.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::alert::{Alert, RecordSnapshot};
use crate::alert_manager::{
    AlertChange, AlertFilter, AlertManager, AlertStats, AlertUpdate, SweepReport,
};
use crate::checkpoint::{CHECKPOINT_VERSION, EngineCheckpoint};
use crate::config::EngineConfig;
use crate::conversion::{ConversionSignal, ConversionTracker};
use crate::drift::{DriftMonitor, DriftOutcome};
use crate::error::{CheckpointError, LifecycleError, PersistError, ScoreError};
use crate::features::{FeatureExtractor, FeatureVector, ReferrerWindow, RollingContext, SkuHistory};
use crate::metrics;
use crate::record::TelemetryRecord;
use crate::registry::{RegistryStats, SkuRegistry, SkuState};
use crate::scorer::{AnomalyModel, AnomalyScore, AnomalyScorer};
use crate::signal::{Signal, SignalPolicy};
use crate::store::AlertStore;

const NO_WATERMARK: i64 = i64::MIN;

/// Everything one record produced.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub features: FeatureVector,
    /// Drift evaluations that landed on this record
    pub drift: Vec<DriftOutcome>,
    pub conversion: ConversionSignal,
    /// `None` when no model is installed or the vector was rejected
    pub anomaly: Option<AnomalyScore>,
    pub rejected: Option<ScoreError>,
    pub updates: Vec<AlertUpdate>,
    /// SKU evicted from the registry to make room for this one
    pub evicted: Option<String>,
    pub persist_errors: Vec<PersistError>,
}

impl ProcessOutcome {
    pub fn opened(&self) -> impl Iterator<Item = &Alert> {
        self.updates.iter().filter_map(|u| match u {
            AlertUpdate::Opened(a) => Some(a),
            AlertUpdate::Refreshed(_) => None,
        })
    }
}

pub struct DetectionEngine {
    config: EngineConfig,
    drift: DriftMonitor,
    conversion: ConversionTracker,
    extractor: FeatureExtractor,
    scorer: AnomalyScorer,
    policy: SignalPolicy,
    registry: SkuRegistry,
    alerts: AlertManager,
    referrers: Mutex<ReferrerWindow>,
    /// Latest record timestamp processed, in epoch millis
    watermark: AtomicI64,
}

impl DetectionEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            drift: DriftMonitor::new(&config.drift, &config.baseline),
            conversion: ConversionTracker::new(config.conversion.clone()),
            extractor: FeatureExtractor::new(config.features.clone()),
            scorer: AnomalyScorer::new(config.scorer.clone()),
            policy: SignalPolicy::new(&config),
            registry: SkuRegistry::new(config.shards.sku_shards, config.shards.max_skus),
            alerts: AlertManager::new(config.alerts.clone(), config.shards.alert_shards),
            referrers: Mutex::new(ReferrerWindow::new(config.features.referrer_window)),
            watermark: AtomicI64::new(NO_WATERMARK),
            config,
        }
    }

    /// Persist every alert change through `store`.
    pub fn with_store(mut self, store: Arc<dyn AlertStore>) -> Self {
        self.alerts.set_store(store);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn install_model(&self, model: Arc<dyn AnomalyModel>) {
        self.scorer.install(model);
    }

    pub fn is_model_ready(&self) -> bool {
        self.scorer.is_ready()
    }

    pub fn drift(&self) -> &DriftMonitor {
        &self.drift
    }

    pub fn alerts(&self) -> &AlertManager {
        &self.alerts
    }

    pub fn registry_stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    pub fn sku_state(&self, sku: &str) -> Option<SkuState> {
        self.registry.get(sku)
    }

    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        match self.watermark.load(Ordering::Acquire) {
            NO_WATERMARK => None,
            millis => DateTime::from_timestamp_millis(millis),
        }
    }

    // ========================================================================
    // PROCESSING
    // ========================================================================

    pub fn process(&self, record: &TelemetryRecord, now: DateTime<Utc>) -> ProcessOutcome {
        let timer = metrics::PROCESSING_LATENCY.start_timer();
        metrics::RECORDS_TOTAL.inc();
        self.watermark
            .fetch_max(record.timestamp.timestamp_millis(), Ordering::AcqRel);

        let pinned = |sku: &str| self.alerts.has_active(sku);
        let create = || SkuState {
            conversion: self.conversion.new_state(),
            history: SkuHistory::default(),
        };
        let (mut outcome, evicted) =
            self.registry
                .with_sku(&record.sku, now, create, &pinned, |state, _| {
                    self.process_locked(record, state, now)
                });

        if let Some(sku) = &evicted {
            if self.config.drift.per_sku {
                self.drift.forget_sku(sku);
            }
        }
        outcome.evicted = evicted;

        timer.observe_duration();
        outcome
    }

    fn process_locked(
        &self,
        record: &TelemetryRecord,
        state: &mut SkuState,
        now: DateTime<Utc>,
    ) -> ProcessOutcome {
        let previous = state.history;

        let features = {
            let mut referrers = self.referrers.lock();
            let ctx = RollingContext {
                history: previous,
                expected_conversion: self.conversion.expected(&state.conversion),
                referrers: &referrers,
            };
            let features = self.extractor.extract(record, &ctx);
            referrers.observe(record.referrer_or_direct());
            features
        };

        let conversion =
            self.conversion
                .observe(&mut state.conversion, record.purchases, record.views);
        state.history.advance(record);

        let (anomaly, rejected) = match self.scorer.score(&record.record_ref(), &features) {
            Ok(score) => (Some(score), None),
            Err(ScoreError::ModelNotInstalled) => (None, None),
            Err(e) => {
                metrics::REJECTED_VECTORS.inc();
                warn!(sku = %record.sku, error = %e, "feature vector rejected");
                (None, Some(e))
            }
        };

        let drift = self.drift.observe_record(record, now);

        let mut signals: Vec<Signal> = Vec::new();
        for outcome in &drift {
            if let DriftOutcome::Scored(score) = outcome {
                signals.extend(self.policy.from_drift(score));
            }
        }
        if let Some(reading) = conversion.reading() {
            signals.extend(self.policy.from_conversion(&record.sku, reading));
        }
        if let Some(score) = &anomaly {
            signals.extend(self.policy.from_anomaly(
                &record.sku,
                score,
                &features,
                RecordSnapshot::capture(record, &previous),
            ));
        }

        let mut updates = Vec::with_capacity(signals.len());
        let mut persist_errors = Vec::new();
        for signal in signals {
            let (update, persisted) = self.alerts.on_signal(signal, now);
            if let Err(e) = persisted {
                persist_errors.push(e);
            }
            updates.push(update);
        }

        ProcessOutcome {
            features,
            drift,
            conversion,
            anomaly,
            rejected,
            updates,
            evicted: None,
            persist_errors,
        }
    }

    /// Flush the alert store, if any.
    pub fn flush(&self) -> Result<(), PersistError> {
        self.alerts.flush()
    }

    // ========================================================================
    // ALERT OPERATIONS
    // ========================================================================

    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        self.alerts.sweep(now)
    }

    pub fn acknowledge(&self, id: &str, now: DateTime<Utc>) -> Result<AlertChange, LifecycleError> {
        self.alerts.acknowledge(id, now)
    }

    pub fn resolve(&self, id: &str, now: DateTime<Utc>) -> Result<AlertChange, LifecycleError> {
        self.alerts.resolve(id, now)
    }

    pub fn get(&self, id: &str) -> Option<Alert> {
        self.alerts.get(id)
    }

    pub fn list(&self, filter: &AlertFilter) -> Vec<Alert> {
        self.alerts.list(filter)
    }

    pub fn stats(&self) -> AlertStats {
        self.alerts.stats()
    }

    // ========================================================================
    // CHECKPOINT
    // ========================================================================

    pub fn checkpoint(&self, now: DateTime<Utc>) -> EngineCheckpoint {
        EngineCheckpoint {
            version: CHECKPOINT_VERSION,
            created_at: now,
            skus: self.registry.checkpoint(),
            referrers: self.referrers.lock().to_vec(),
            drift: self.drift.checkpoint(),
            alerts: self.alerts.snapshot(),
            watermark: self.watermark(),
        }
    }

    /// Rebuild an engine from a checkpoint. The anomaly model and the alert
    /// store have to be supplied again.
    pub fn restore(config: EngineConfig, checkpoint: EngineCheckpoint) -> Self {
        let engine = Self::new(config);
        let skus = checkpoint.skus.len();
        let alerts = checkpoint.alerts.len();

        engine.registry.restore(checkpoint.skus);
        *engine.referrers.lock() =
            ReferrerWindow::from_values(engine.config.features.referrer_window, &checkpoint.referrers);
        engine.drift.restore(checkpoint.drift);
        engine.alerts.restore(checkpoint.alerts);
        if let Some(w) = checkpoint.watermark {
            engine
                .watermark
                .store(w.timestamp_millis(), Ordering::Release);
        }

        info!(
            skus,
            alerts,
            created_at = %checkpoint.created_at,
            "checkpoint restored"
        );
        engine
    }

    pub fn restore_bytes(config: EngineConfig, bytes: &[u8]) -> Result<Self, CheckpointError> {
        Ok(Self::restore(config, EngineCheckpoint::from_bytes(bytes)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{AlertStatus, Category, Severity};
    use crate::baseline::{Metric, MetricKey};
    use crate::features::Feature;
    use crate::store::MemoryAlertStore;
    use chrono::Duration;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
            + Duration::seconds(secs)
    }

    fn record(sku: &str, secs: i64, views: u64, purchases: u64) -> TelemetryRecord {
        TelemetryRecord {
            timestamp: t(secs),
            sku: sku.to_string(),
            price: 20.0,
            stock: 100,
            views,
            add_to_cart: purchases * 2,
            purchases,
            referrer: Some("google".to_string()),
        }
    }

    /// Flags any vector whose price change exceeds 50%.
    struct PriceJumpModel;

    impl AnomalyModel for PriceJumpModel {
        fn name(&self) -> &str {
            "price_jump"
        }

        fn score(&self, vector: &FeatureVector) -> f64 {
            -vector.get(Feature::PriceDeltaPct)
        }
    }

    #[test]
    fn test_conversion_spike_opens_one_alert() {
        let store = Arc::new(MemoryAlertStore::new());
        let engine = DetectionEngine::new(EngineConfig::default()).with_store(store.clone());
        for i in 0..30 {
            let outcome = engine.process(&record("SKU-1", i, 1_000, 50), t(i));
            assert!(outcome.updates.is_empty());
        }
        // Settled estimate: mean 0.05, variance near 0.017, so 0.5 is ~3.5 sigma out.
        let outcome = engine.process(&record("SKU-1", 30, 1_000, 500), t(30));
        let opened: Vec<&Alert> = outcome.opened().collect();
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].category, Category::Conversion);
        assert_eq!(opened[0].severity, Severity::Critical);

        // The spike pulled the estimate up; a collapse to zero deviates again.
        let again = engine.process(&record("SKU-1", 31, 1_000, 0), t(31));
        assert!(matches!(again.updates.as_slice(), [AlertUpdate::Refreshed(_)]));
        assert_eq!(engine.stats().total, 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_no_views_skips_conversion() {
        let engine = DetectionEngine::new(EngineConfig::default());
        let outcome = engine.process(&record("SKU-1", 0, 0, 0), t(0));
        assert_eq!(outcome.conversion, ConversionSignal::NoViews);
        assert_eq!(engine.sku_state("SKU-1").unwrap().conversion.observations(), 0);
    }

    #[test]
    fn test_anomaly_requires_installed_model() {
        let engine = DetectionEngine::new(EngineConfig::default());
        let mut jump = record("SKU-2", 1, 100, 5);
        engine.process(&record("SKU-2", 0, 100, 5), t(0));
        jump.price = 40.0;
        let outcome = engine.process(&jump, t(1));
        assert!(outcome.anomaly.is_none());
        assert!(outcome.rejected.is_none());

        engine.install_model(Arc::new(PriceJumpModel));
        let mut again = jump.clone();
        again.price = 80.0;
        again.timestamp = t(2);
        let outcome = engine.process(&again, t(2));
        let score = outcome.anomaly.as_ref().unwrap();
        assert_eq!(score.score, -1.0);
        let alert = outcome.opened().next().unwrap();
        assert_eq!(alert.category, Category::Anomaly);
        assert!(alert.explanation.contains("Large price change (100.0%)"));
    }

    #[test]
    fn test_neutral_first_record_is_not_anomalous() {
        let engine = DetectionEngine::new(EngineConfig::default());
        engine.install_model(Arc::new(PriceJumpModel));
        let outcome = engine.process(&record("SKU-3", 0, 100, 5), t(0));
        assert_eq!(outcome.features.get(Feature::PriceDeltaPct), 0.0);
        assert!(outcome.updates.is_empty());
    }

    #[test]
    fn test_persist_failure_keeps_alert() {
        let store = Arc::new(MemoryAlertStore::new());
        let engine = DetectionEngine::new(EngineConfig::default()).with_store(store.clone());
        engine.install_model(Arc::new(PriceJumpModel));
        engine.process(&record("SKU-4", 0, 100, 5), t(0));
        let mut jump = record("SKU-4", 1, 100, 5);
        jump.price = 50.0;
        store.fail_next(1);
        let outcome = engine.process(&jump, t(1));
        assert_eq!(outcome.persist_errors.len(), 1);
        assert!(outcome.persist_errors[0].is_retryable());
        let id = &outcome.opened().next().unwrap().id;
        assert!(engine.get(id).is_some());
        assert!(store.is_empty());

        let change = engine.acknowledge(id, t(2)).unwrap();
        assert!(change.persisted.is_ok());
        assert_eq!(store.latest(id).unwrap().status, AlertStatus::Acknowledged);
    }

    #[test]
    fn test_sweep_expires_and_persists() {
        let store = Arc::new(MemoryAlertStore::new());
        let engine = DetectionEngine::new(EngineConfig::default()).with_store(store.clone());
        engine.install_model(Arc::new(PriceJumpModel));
        engine.process(&record("SKU-5", 0, 100, 5), t(0));
        let mut jump = record("SKU-5", 1, 100, 5);
        jump.price = 60.0;
        let id = engine.process(&jump, t(1)).opened().next().unwrap().id.clone();

        // Critical: five minutes to acknowledge.
        assert!(engine.sweep(t(200)).expired.is_empty());
        let swept = engine.sweep(t(1 + 301));
        assert_eq!(swept.expired.len(), 1);
        assert_eq!(store.latest(&id).unwrap().status, AlertStatus::Expired);
        assert!(engine.acknowledge(&id, t(400)).is_err());
    }

    #[test]
    fn test_rejected_vector_still_feeds_drift_and_conversion() {
        let engine = DetectionEngine::new(EngineConfig::default());
        engine.install_model(Arc::new(PriceJumpModel));
        let mut tiny = record("SKU-6", 0, 100, 5);
        tiny.price = 1e-300;
        let first = engine.process(&tiny, t(0));
        assert!(first.rejected.is_none());
        assert!(first.anomaly.is_some());

        let mut huge = record("SKU-6", 1, 100, 5);
        huge.price = f64::MAX;
        let outcome = engine.process(&huge, t(1));
        let Some(ScoreError::InvalidFeature { feature, value, .. }) = &outcome.rejected else {
            panic!("expected a rejection, got {:?}", outcome.rejected);
        };
        assert_eq!(*feature, Feature::PriceDeltaPct);
        assert!(value.is_infinite());
        assert!(outcome.anomaly.is_none());
        assert!(outcome.updates.is_empty());

        let state = engine.sku_state("SKU-6").unwrap();
        assert_eq!(state.conversion.observations(), 2);
        assert_eq!(state.history.last_price, Some(f64::MAX));
        let price_window = engine
            .drift()
            .checkpoint()
            .windows
            .into_iter()
            .find(|w| w.key == MetricKey::global(Metric::Price))
            .unwrap();
        assert_eq!(price_window.values, vec![1e-300, f64::MAX]);
    }

    #[test]
    fn test_watermark_tracks_latest_record() {
        let engine = DetectionEngine::new(EngineConfig::default());
        assert_eq!(engine.watermark(), None);
        engine.process(&record("A", 10, 1, 0), t(10));
        engine.process(&record("B", 5, 1, 0), t(5));
        assert_eq!(engine.watermark(), Some(t(10)));
    }
}
