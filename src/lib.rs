//! skuwatch: detection and alerting over per-SKU e-commerce telemetry.
//!
//! Records flow through [`DetectionEngine::process`]: distribution drift
//! against rolling baselines, a recursive conversion-rate estimate per SKU and
//! a pluggable multivariate outlier model. Triggering outputs become alerts
//! with SLA deadlines, deduplicated per `(sku, category)`.

pub mod algo;
pub mod alert;
pub mod alert_manager;
pub mod baseline;
pub mod checkpoint;
pub mod config;
pub mod conversion;
pub mod drift;
pub mod engine;
pub mod error;
pub mod features;
pub mod metrics;
pub mod pipeline;
pub mod record;
pub mod registry;
pub mod scorer;
pub mod signal;
pub mod store;

pub use alert::{Alert, AlertStatus, AlertWire, Category, Evidence, Severity};
pub use alert_manager::{AlertChange, AlertFilter, AlertManager, AlertStats, AlertUpdate, SweepReport};
pub use baseline::{BaselineSnapshot, BaselineStore, Metric, MetricKey};
pub use checkpoint::EngineCheckpoint;
pub use config::EngineConfig;
pub use conversion::{ConversionReading, ConversionSignal, ConversionTracker};
pub use drift::{DriftDetector, DriftMonitor, DriftOutcome, DriftScore};
pub use engine::{DetectionEngine, ProcessOutcome};
pub use error::{CheckpointError, ConfigError, LifecycleError, ModelError, PersistError, ScoreError};
pub use features::{Feature, FeatureExtractor, FeatureVector, RollingContext};
pub use pipeline::{Pipeline, PipelineConfig};
pub use record::TelemetryRecord;
pub use scorer::{AnomalyModel, AnomalyScore, AnomalyScorer, IsolationForestModel};
pub use signal::Signal;
pub use store::{AlertStore, JsonlAlertLog, MemoryAlertStore};
