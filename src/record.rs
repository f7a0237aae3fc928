//! Validated telemetry record as admitted to the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Referrer bucket used when a record carries no referrer.
pub const DIRECT_REFERRER: &str = "direct";

/// One telemetry event for a SKU.
///
/// The ingestion layer guarantees `price > 0` and
/// `purchases <= add_to_cart <= views` before a record reaches the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub timestamp: DateTime<Utc>,
    pub sku: String,
    pub price: f64,
    pub stock: u64,
    pub views: u64,
    pub add_to_cart: u64,
    pub purchases: u64,
    #[serde(default)]
    pub referrer: Option<String>,
}

impl TelemetryRecord {
    /// purchases / views, or `None` when there were no views.
    pub fn conversion_rate(&self) -> Option<f64> {
        (self.views > 0).then(|| self.purchases as f64 / self.views as f64)
    }

    /// add_to_cart / views, or `None` when there were no views.
    pub fn cart_rate(&self) -> Option<f64> {
        (self.views > 0).then(|| self.add_to_cart as f64 / self.views as f64)
    }

    pub fn referrer_or_direct(&self) -> &str {
        self.referrer.as_deref().unwrap_or(DIRECT_REFERRER)
    }

    /// Stable reference used in anomaly evidence.
    pub fn record_ref(&self) -> String {
        format!("{}@{}", self.sku, self.timestamp.to_rfc3339())
    }
}
