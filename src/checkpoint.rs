//! Engine checkpoint and recovery.
//!
//! The engine owns no storage: `DetectionEngine::checkpoint` produces this
//! structure and the caller decides where the bytes go. The installed anomaly
//! model is not part of a checkpoint and has to be installed again after a
//! restore.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::alert::Alert;
use crate::drift::DriftCheckpoint;
use crate::error::CheckpointError;
use crate::registry::SkuCheckpoint;

/// Version for checkpoint format migrations
pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineCheckpoint {
    /// Format version
    pub version: u32,
    pub created_at: DateTime<Utc>,
    /// Conversion estimate and price/stock history per SKU
    pub skus: Vec<SkuCheckpoint>,
    /// Recent referrers, oldest first
    pub referrers: Vec<String>,
    /// Baselines and current windows per metric key
    pub drift: DriftCheckpoint,
    /// Open and acknowledged alerts, plus terminal alerts still retained
    pub alerts: Vec<Alert>,
    /// Latest record timestamp processed
    pub watermark: Option<DateTime<Utc>>,
}

impl EngineCheckpoint {
    pub fn empty(created_at: DateTime<Utc>) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            created_at,
            skus: Vec::new(),
            referrers: Vec::new(),
            drift: DriftCheckpoint::default(),
            alerts: Vec::new(),
            watermark: None,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CheckpointError> {
        bincode::serialize(self).map_err(|e| CheckpointError::SerializationFailed(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CheckpointError> {
        let checkpoint: EngineCheckpoint = bincode::deserialize(bytes)
            .map_err(|e| CheckpointError::DeserializationFailed(e.to_string()))?;

        if checkpoint.version > CHECKPOINT_VERSION {
            return Err(CheckpointError::UnsupportedVersion {
                found: checkpoint.version,
                max_supported: CHECKPOINT_VERSION,
            });
        }

        Ok(checkpoint)
    }

    pub fn size_bytes(&self) -> usize {
        self.to_bytes().map(|b| b.len()).unwrap_or(0)
    }
}
