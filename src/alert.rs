//! Alerts and their lifecycle.
//!
//! The lifecycle is a tagged state machine. Only these transitions exist:
//!
//! ```text
//! Open ── acknowledge ──> Acknowledged ── resolve ──> Resolved
//!   │ \                        │
//!   │  └──── resolve ──────────┼──────────────────> Resolved
//!   └─────── expire ───────────┴── expire ────────> Expired
//! ```
//!
//! Resolved and Expired are terminal. Deadlines are fixed when the alert
//! opens; escalation may pull them earlier, nothing pushes them later.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::baseline::{GLOBAL_SUBJECT, Metric};
use crate::config::SlaTable;
use crate::conversion::ConversionReading;
use crate::drift::DriftScore;
use crate::error::LifecycleError;
use crate::features::{FeatureVector, SkuHistory};
use crate::record::TelemetryRecord;
use crate::scorer::AnomalyScore;

// ============================================================================
// CLASSIFICATION
// ============================================================================

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Critical,
        Severity::High,
        Severity::Medium,
        Severity::Low,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Drift,
    Anomaly,
    Conversion,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Drift, Category::Anomaly, Category::Conversion];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Drift => "drift",
            Self::Anomaly => "anomaly",
            Self::Conversion => "conversion",
        }
    }

    /// Remediation hint attached to every alert of this category.
    pub fn suggested_fix(&self) -> &'static str {
        match self {
            Self::Drift => {
                "Review metric trends and investigate root cause. Check for data quality issues or system changes."
            }
            Self::Anomaly => {
                "Investigate data quality and system behavior. Check for bot activity, data pipeline issues, or pricing errors."
            }
            Self::Conversion => {
                "Review conversion funnel and user behavior. Check for checkout issues, pricing problems, or inventory availability."
            }
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// LIFECYCLE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Open,
    Acknowledged,
    Resolved,
    Expired,
}

impl AlertStatus {
    pub const ALL: [AlertStatus; 4] = [
        AlertStatus::Open,
        AlertStatus::Acknowledged,
        AlertStatus::Resolved,
        AlertStatus::Expired,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::Expired)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Acknowledged => "acknowledged",
            Self::Resolved => "resolved",
            Self::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleEvent {
    Acknowledge,
    Resolve,
    Expire,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertState {
    Open,
    Acknowledged {
        at: DateTime<Utc>,
    },
    Resolved {
        at: DateTime<Utc>,
        acknowledged_at: Option<DateTime<Utc>>,
    },
    Expired {
        at: DateTime<Utc>,
        acknowledged_at: Option<DateTime<Utc>>,
    },
}

impl AlertState {
    pub fn status(&self) -> AlertStatus {
        match self {
            Self::Open => AlertStatus::Open,
            Self::Acknowledged { .. } => AlertStatus::Acknowledged,
            Self::Resolved { .. } => AlertStatus::Resolved,
            Self::Expired { .. } => AlertStatus::Expired,
        }
    }

    pub fn acknowledged_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Open => None,
            Self::Acknowledged { at } => Some(*at),
            Self::Resolved { acknowledged_at, .. } | Self::Expired { acknowledged_at, .. } => {
                *acknowledged_at
            }
        }
    }

    /// When the alert reached a terminal state.
    pub fn closed_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Resolved { at, .. } | Self::Expired { at, .. } => Some(*at),
            _ => None,
        }
    }

    pub fn apply(&self, event: LifecycleEvent, at: DateTime<Utc>) -> Result<Self, LifecycleError> {
        let acknowledged_at = self.acknowledged_at();
        match (self, event) {
            (Self::Open, LifecycleEvent::Acknowledge) => Ok(Self::Acknowledged { at }),
            (Self::Open | Self::Acknowledged { .. }, LifecycleEvent::Resolve) => {
                Ok(Self::Resolved { at, acknowledged_at })
            }
            (Self::Open | Self::Acknowledged { .. }, LifecycleEvent::Expire) => {
                Ok(Self::Expired { at, acknowledged_at })
            }
            _ => Err(LifecycleError::InvalidTransition {
                from: self.status(),
                event,
            }),
        }
    }
}

// ============================================================================
// EVIDENCE
// ============================================================================

/// Record fields captured with an anomaly, for triage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSnapshot {
    pub price: f64,
    pub stock: u64,
    pub views: u64,
    pub add_to_cart: u64,
    pub purchases: u64,
    pub referrer: String,
    /// Price and stock of the SKU's previous record
    pub previous_price: Option<f64>,
    pub previous_stock: Option<u64>,
}

impl RecordSnapshot {
    pub fn capture(record: &TelemetryRecord, previous: &SkuHistory) -> Self {
        Self {
            price: record.price,
            stock: record.stock,
            views: record.views,
            add_to_cart: record.add_to_cart,
            purchases: record.purchases,
            referrer: record.referrer_or_direct().to_string(),
            previous_price: previous.last_price,
            previous_stock: previous.last_stock,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Evidence {
    /// Latest score for every metric that drifted on this subject.
    Drift { scores: BTreeMap<Metric, DriftScore> },
    Anomaly {
        score: AnomalyScore,
        features: FeatureVector,
        record: RecordSnapshot,
    },
    Conversion { reading: ConversionReading },
}

impl Evidence {
    pub fn category(&self) -> Category {
        match self {
            Self::Drift { .. } => Category::Drift,
            Self::Anomaly { .. } => Category::Anomaly,
            Self::Conversion { .. } => Category::Conversion,
        }
    }

    /// Fold a newer signal of the same category into this evidence.
    pub fn merge(&mut self, newer: Evidence) {
        match (self, newer) {
            (Self::Drift { scores }, Self::Drift { scores: newer }) => scores.extend(newer),
            (this, newer) => *this = newer,
        }
    }

    /// Reference values from before the triggering signal.
    pub fn last_good_state(&self) -> BTreeMap<String, f64> {
        let mut state = BTreeMap::new();
        match self {
            Self::Drift { scores } => {
                for (metric, s) in scores {
                    state.insert(format!("baseline_{}", metric), s.baseline_mean);
                    state.insert(format!("baseline_{}_std", metric), s.baseline_std);
                }
            }
            Self::Anomaly { record, .. } => {
                if let Some(p) = record.previous_price {
                    state.insert("price".to_string(), p);
                }
                if let Some(s) = record.previous_stock {
                    state.insert("stock".to_string(), s as f64);
                }
            }
            Self::Conversion { reading } => {
                state.insert("expected_conversion".to_string(), reading.expected);
                state.insert("uncertainty".to_string(), reading.variance.sqrt());
            }
        }
        state
    }

    /// Deterministic explanation for `subject`.
    pub fn explain(&self, subject: &str) -> String {
        match self {
            Self::Drift { scores } => {
                let scope = if subject == GLOBAL_SUBJECT {
                    "all SKUs".to_string()
                } else {
                    subject.to_string()
                };
                scores
                    .iter()
                    .map(|(metric, s)| {
                        format!(
                            "{} drift detected ({}): PSI={:.3}, KS p-value={:.4}. Baseline: {:.2}, Recent: {:.2}",
                            capitalize(metric.name()),
                            scope,
                            s.psi,
                            s.ks_p_value,
                            s.baseline_mean,
                            s.current_mean
                        )
                    })
                    .collect::<Vec<_>>()
                    .join(" | ")
            }
            Self::Anomaly {
                score, features, ..
            } => {
                let reasons: Vec<String> = score
                    .top_features(3)
                    .map(|(f, _)| f.describe(features.get(*f)))
                    .collect();
                let reasons = if reasons.is_empty() {
                    "Multiple subtle anomalies detected".to_string()
                } else {
                    reasons.join("; ")
                };
                format!(
                    "Anomaly detected for {} (score {:.3}): {}",
                    subject, score.score, reasons
                )
            }
            Self::Conversion { reading } => format!(
                "Conversion rate deviation for {}: Expected {:.2}%, Observed {:.2}% (z-score: {:.2})",
                subject,
                reading.expected * 100.0,
                reading.observed * 100.0,
                reading.z_score
            ),
        }
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

// ============================================================================
// ALERT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    /// SKU, or `"*"` for drift across all SKUs
    pub sku: String,
    pub category: Category,
    pub severity: Severity,
    pub state: AlertState,
    pub opened_at: DateTime<Utc>,
    /// Acknowledgment deadline
    pub sla_deadline: DateTime<Utc>,
    pub resolution_deadline: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    /// Triggering signals folded into this alert, including the first
    pub trigger_count: u32,
    pub evidence: Evidence,
    pub explanation: String,
}

impl Alert {
    pub fn open(
        sku: &str,
        severity: Severity,
        evidence: Evidence,
        now: DateTime<Utc>,
        ack_sla: &SlaTable,
        resolve_sla: &SlaTable,
    ) -> Self {
        let explanation = evidence.explain(sku);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sku: sku.to_string(),
            category: evidence.category(),
            severity,
            state: AlertState::Open,
            opened_at: now,
            sla_deadline: now + ack_sla.deadline_for(severity),
            resolution_deadline: now + resolve_sla.deadline_for(severity),
            last_updated: now,
            trigger_count: 1,
            evidence,
            explanation,
        }
    }

    pub fn status(&self) -> AlertStatus {
        self.state.status()
    }

    /// Open or acknowledged.
    pub fn is_active(&self) -> bool {
        !self.status().is_terminal()
    }

    /// Fold a repeated trigger into this alert. A more severe signal
    /// escalates the severity and may only shorten the deadlines.
    pub fn refresh(
        &mut self,
        severity: Severity,
        evidence: Evidence,
        now: DateTime<Utc>,
        ack_sla: &SlaTable,
        resolve_sla: &SlaTable,
    ) {
        if severity > self.severity {
            self.severity = severity;
            self.sla_deadline = self
                .sla_deadline
                .min(self.opened_at + ack_sla.deadline_for(severity));
            self.resolution_deadline = self
                .resolution_deadline
                .min(self.opened_at + resolve_sla.deadline_for(severity));
        }
        self.evidence.merge(evidence);
        self.explanation = self.evidence.explain(&self.sku);
        self.trigger_count = self.trigger_count.saturating_add(1);
        self.last_updated = self.last_updated.max(now);
    }

    pub fn apply(&mut self, event: LifecycleEvent, now: DateTime<Utc>) -> Result<(), LifecycleError> {
        self.state = self.state.apply(event, now)?;
        self.last_updated = self.last_updated.max(now);
        Ok(())
    }

    /// Whether the deadline that governs the current state has passed.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            AlertState::Open => now > self.sla_deadline,
            AlertState::Acknowledged { .. } => now > self.resolution_deadline,
            _ => false,
        }
    }

    pub fn to_wire(&self) -> AlertWire {
        AlertWire {
            id: self.id.clone(),
            sku: self.sku.clone(),
            category: self.category,
            severity: self.severity,
            status: self.status(),
            opened_at: self.opened_at,
            sla_deadline: self.sla_deadline,
            resolution_deadline: self.resolution_deadline,
            last_updated: self.last_updated,
            acknowledged_at: self.state.acknowledged_at(),
            closed_at: self.state.closed_at(),
            trigger_count: self.trigger_count,
            explanation: self.explanation.clone(),
            evidence: EvidenceWire {
                details: self.evidence.clone(),
                last_good_state: self.evidence.last_good_state(),
                suggested_fix: self.category.suggested_fix().to_string(),
            },
        }
    }
}

/// JSON shape handed to dashboards and alert logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertWire {
    pub id: String,
    pub sku: String,
    pub category: Category,
    pub severity: Severity,
    pub status: AlertStatus,
    pub opened_at: DateTime<Utc>,
    pub sla_deadline: DateTime<Utc>,
    pub resolution_deadline: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub trigger_count: u32,
    pub explanation: String,
    pub evidence: EvidenceWire,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceWire {
    pub details: Evidence,
    pub last_good_state: BTreeMap<String, f64>,
    pub suggested_fix: String,
}
