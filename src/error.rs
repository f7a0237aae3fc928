//! Error types shared across the engine.
//!
//! "Not ready" is deliberately absent here: detectors that lack history report
//! it through their outcome enums, never through `Err`.

use thiserror::Error;

use crate::alert::{AlertStatus, LifecycleEvent};
use crate::features::Feature;

/// Rejection of a feature vector by the anomaly scorer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScoreError {
    #[error("feature `{feature}` is out of contract (value {value}): {reason}")]
    InvalidFeature {
        feature: Feature,
        value: f64,
        reason: &'static str,
    },
    #[error("no anomaly model installed")]
    ModelNotInstalled,
}

/// Invalid alert lifecycle operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("cannot apply `{event:?}` to an alert in status `{from:?}`")]
    InvalidTransition {
        from: AlertStatus,
        event: LifecycleEvent,
    },
    #[error("alert not found: {0}")]
    NotFound(String),
}

/// Failure writing engine state to an external store.
///
/// The in-memory state stays authoritative when one of these is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistError {
    #[error("persistence queue is full")]
    Backpressure,
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("i/o failure: {0}")]
    Io(String),
    #[error("serialization failure: {0}")]
    Serialization(String),
}

impl PersistError {
    /// Whether a retry of the same write can succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Serialization(_))
    }
}

impl From<std::io::Error> for PersistError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// A loaded anomaly model that cannot be evaluated safely.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("tree {tree} splits on dimension {split_dim} of a {dimensions}-dimensional forest")]
    SplitOutOfRange {
        tree: usize,
        split_dim: usize,
        dimensions: usize,
    },
}

/// Checkpoint encode/decode failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckpointError {
    #[error("serialization failed: {0}")]
    SerializationFailed(String),
    #[error("deserialization failed: {0}")]
    DeserializationFailed(String),
    #[error("unsupported checkpoint version: {found} (max supported: {max_supported})")]
    UnsupportedVersion { found: u32, max_supported: u32 },
}

/// Configuration loading and validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config value `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persist_error_retryability() {
        assert!(PersistError::Backpressure.is_retryable());
        assert!(PersistError::Io("disk full".into()).is_retryable());
        assert!(PersistError::Unavailable("db down".into()).is_retryable());
        assert!(!PersistError::Serialization("bad utf8".into()).is_retryable());
    }

    #[test]
    fn test_invalid_feature_message_names_feature() {
        let err = ScoreError::InvalidFeature {
            feature: Feature::PriceDeltaPct,
            value: f64::NAN,
            reason: "not finite",
        };
        assert!(err.to_string().contains("price_delta_pct"));
    }
}
