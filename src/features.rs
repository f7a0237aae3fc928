//! Feature engineering for the anomaly scorer.
//!
//! `FeatureExtractor::extract` is a pure function of a record and a
//! `RollingContext`. All mutable history (last price/stock per SKU, the
//! recent referrer mix) lives with the caller and is advanced only after
//! extraction, so the same record and context always yield the same vector.
//!
//! Degenerate inputs map to the neutral sentinel 0.0: the first record of a
//! SKU has no price or stock delta, a SKU without conversion history has no
//! deviation, an empty referrer window says nothing about irregularity.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::algo::RingBuffer;
use crate::config::FeatureConfig;
use crate::error::ScoreError;
use crate::record::TelemetryRecord;

pub const NUM_FEATURES: usize = 7;

// ============================================================================
// FEATURES
// ============================================================================

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    PriceDeltaPct = 0,
    StockChange = 1,
    ReferrerIrregularity = 2,
    ConversionDeviation = 3,
    CartIrregularity = 4,
    PriceMagnitude = 5,
    StockMagnitude = 6,
}

impl Feature {
    pub const ALL: [Feature; NUM_FEATURES] = [
        Feature::PriceDeltaPct,
        Feature::StockChange,
        Feature::ReferrerIrregularity,
        Feature::ConversionDeviation,
        Feature::CartIrregularity,
        Feature::PriceMagnitude,
        Feature::StockMagnitude,
    ];

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::PriceDeltaPct => "price_delta_pct",
            Self::StockChange => "stock_change",
            Self::ReferrerIrregularity => "referrer_irregularity",
            Self::ConversionDeviation => "conversion_deviation",
            Self::CartIrregularity => "cart_irregularity",
            Self::PriceMagnitude => "price_magnitude",
            Self::StockMagnitude => "stock_magnitude",
        }
    }

    /// Whether the feature is bounded to [0, 1].
    fn is_unit_bounded(&self) -> bool {
        matches!(self, Self::ReferrerIrregularity | Self::CartIrregularity)
    }

    /// Human phrasing used in anomaly explanations.
    pub fn describe(&self, value: f64) -> String {
        match self {
            Self::PriceDeltaPct => format!("Large price change ({:.1}%)", value * 100.0),
            Self::StockChange => "Significant stock change".to_string(),
            Self::ReferrerIrregularity => "Unusual referrer pattern".to_string(),
            Self::ConversionDeviation => "Conversion rate deviation".to_string(),
            Self::CartIrregularity => "Abnormal cart-to-view ratio".to_string(),
            Self::PriceMagnitude => "Unusually high price".to_string(),
            Self::StockMagnitude => "Unusually high stock level".to_string(),
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Fixed-size feature vector, indexed by `Feature`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector(pub [f64; NUM_FEATURES]);

impl FeatureVector {
    /// All sentinel values: what a record with no history would produce.
    pub fn neutral() -> Self {
        Self([0.0; NUM_FEATURES])
    }

    pub fn get(&self, feature: Feature) -> f64 {
        self.0[feature.index()]
    }

    pub fn set(&mut self, feature: Feature, value: f64) {
        self.0[feature.index()] = value;
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    /// Reject vectors outside the scorer's input contract, naming the first
    /// offending feature.
    pub fn validate(&self) -> Result<(), ScoreError> {
        for feature in Feature::ALL {
            let value = self.get(feature);
            let reason = if !value.is_finite() {
                Some("not finite")
            } else if value < 0.0 {
                Some("negative")
            } else if feature.is_unit_bounded() && value > 1.0 {
                Some("exceeds 1.0")
            } else {
                None
            };
            if let Some(reason) = reason {
                return Err(ScoreError::InvalidFeature {
                    feature,
                    value,
                    reason,
                });
            }
        }
        Ok(())
    }
}

impl AsRef<[f64]> for FeatureVector {
    fn as_ref(&self) -> &[f64] {
        &self.0
    }
}

// ============================================================================
// ROLLING AGGREGATES
// ============================================================================

/// Recent referrer mix across all SKUs.
#[derive(Debug, Clone)]
pub struct ReferrerWindow {
    recent: RingBuffer<String>,
    counts: HashMap<String, usize>,
}

impl ReferrerWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            recent: RingBuffer::new(capacity),
            counts: HashMap::new(),
        }
    }

    pub fn observe(&mut self, referrer: &str) {
        if let Some(evicted) = self.recent.push(referrer.to_string()) {
            if let Some(c) = self.counts.get_mut(&evicted) {
                *c -= 1;
                if *c == 0 {
                    self.counts.remove(&evicted);
                }
            }
        }
        *self.counts.entry(referrer.to_string()).or_insert(0) += 1;
    }

    pub fn count(&self, referrer: &str) -> usize {
        self.counts.get(referrer).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty()
    }

    /// 1 - count / count of the most common referrer. The most common
    /// referrer scores 0, an unseen one 1. An empty window scores 0.
    pub fn irregularity(&self, referrer: &str) -> f64 {
        let max = self.counts.values().copied().max().unwrap_or(0);
        if max == 0 {
            return 0.0;
        }
        1.0 - self.count(referrer) as f64 / max as f64
    }

    /// Oldest first
    pub fn to_vec(&self) -> Vec<String> {
        self.recent.to_vec()
    }

    pub fn from_values(capacity: usize, values: &[String]) -> Self {
        let mut window = Self::new(capacity);
        for v in values {
            window.observe(v);
        }
        window
    }
}

/// Last observed price and stock for one SKU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SkuHistory {
    pub last_price: Option<f64>,
    pub last_stock: Option<u64>,
}

impl SkuHistory {
    pub fn advance(&mut self, record: &TelemetryRecord) {
        self.last_price = Some(record.price);
        self.last_stock = Some(record.stock);
    }
}

/// Everything extraction may read besides the record itself.
#[derive(Debug, Clone, Copy)]
pub struct RollingContext<'a> {
    pub history: SkuHistory,
    /// Expected conversion rate, once the SKU has enough history
    pub expected_conversion: Option<f64>,
    pub referrers: &'a ReferrerWindow,
}

// ============================================================================
// EXTRACTOR
// ============================================================================

#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    config: FeatureConfig,
}

impl FeatureExtractor {
    pub fn new(config: FeatureConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.config
    }

    pub fn extract(&self, record: &TelemetryRecord, ctx: &RollingContext<'_>) -> FeatureVector {
        let c = &self.config;
        let mut v = FeatureVector::neutral();

        if let Some(last) = ctx.history.last_price.filter(|p| *p > 0.0) {
            v.set(Feature::PriceDeltaPct, ((record.price - last) / last).abs());
        }

        if let Some(last) = ctx.history.last_stock {
            let delta = record.stock.abs_diff(last) as f64;
            v.set(Feature::StockChange, delta / c.stock_change_scale);
        }

        v.set(
            Feature::ReferrerIrregularity,
            ctx.referrers.irregularity(record.referrer_or_direct()),
        );

        if let (Some(current), Some(expected)) = (record.conversion_rate(), ctx.expected_conversion) {
            let deviation = if expected > 0.0 {
                ((current - expected) / expected).abs()
            } else if current > 0.0 {
                1.0
            } else {
                0.0
            };
            v.set(Feature::ConversionDeviation, deviation);
        }

        if let Some(cart_rate) = record.cart_rate() {
            if cart_rate > c.cart_rate_high || cart_rate < c.cart_rate_low {
                v.set(Feature::CartIrregularity, 1.0);
            }
        }

        v.set(
            Feature::PriceMagnitude,
            (record.price / c.price_scale).min(c.magnitude_cap),
        );
        v.set(
            Feature::StockMagnitude,
            (record.stock as f64 / c.stock_scale).min(c.magnitude_cap),
        );

        v
    }
}
