//! Alert aggregation, deduplication and SLA enforcement.
//!
//! Alerts are sharded by subject (xxh3 of the SKU) so that signals for
//! different SKUs fold in parallel while signals for one SKU are applied in
//! order. Within a shard, `(sku, category)` maps to the one active alert for
//! that pair; a repeated trigger refreshes it in place.
//!
//! Every change is written to the attached `AlertStore` before the shard lock
//! is released, so the store sees the changes of one alert in the order they
//! were applied.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::alert::{Alert, AlertStatus, Category, LifecycleEvent, Severity};
use crate::config::AlertConfig;
use crate::error::{LifecycleError, PersistError};
use crate::metrics;
use crate::signal::Signal;
use crate::store::AlertStore;

#[derive(Debug, Clone, PartialEq)]
pub enum AlertUpdate {
    Opened(Alert),
    Refreshed(Alert),
}

impl AlertUpdate {
    pub fn alert(&self) -> &Alert {
        match self {
            Self::Opened(a) | Self::Refreshed(a) => a,
        }
    }

    pub fn into_alert(self) -> Alert {
        match self {
            Self::Opened(a) | Self::Refreshed(a) => a,
        }
    }
}

/// A lifecycle transition and the result of persisting it.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertChange {
    pub alert: Alert,
    pub persisted: Result<(), PersistError>,
}

/// Result of one SLA sweep.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub expired: Vec<Alert>,
    /// Terminal alerts dropped after the retention period
    pub purged: usize,
    /// Expirations the store did not accept
    pub persist_errors: Vec<PersistError>,
}

#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub severity: Option<Severity>,
    pub category: Option<Category>,
    pub sku: Option<String>,
    pub status: Option<AlertStatus>,
    pub limit: Option<usize>,
}

impl AlertFilter {
    fn matches(&self, alert: &Alert) -> bool {
        self.severity.is_none_or(|s| alert.severity == s)
            && self.category.is_none_or(|c| alert.category == c)
            && self.sku.as_deref().is_none_or(|s| alert.sku == s)
            && self.status.is_none_or(|s| alert.status() == s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertStats {
    pub total: usize,
    pub by_severity: BTreeMap<Severity, usize>,
    pub by_category: BTreeMap<Category, usize>,
    pub by_status: BTreeMap<AlertStatus, usize>,
    /// Alerts still open
    pub unacknowledged: usize,
}

#[derive(Default)]
struct AlertShard {
    /// All retained alerts by id
    alerts: HashMap<String, Alert>,
    /// Active alert id per `(sku, category)`
    active: HashMap<(String, Category), String>,
}

impl AlertShard {
    fn insert(&mut self, alert: Alert) {
        if alert.is_active() {
            self.active
                .insert((alert.sku.clone(), alert.category), alert.id.clone());
        }
        self.alerts.insert(alert.id.clone(), alert);
    }

    fn deactivate(&mut self, alert: &Alert) {
        let key = (alert.sku.clone(), alert.category);
        if self.active.get(&key) == Some(&alert.id) {
            self.active.remove(&key);
        }
    }
}

pub struct AlertManager {
    config: AlertConfig,
    shards: Vec<Mutex<AlertShard>>,
    store: Option<Arc<dyn AlertStore>>,
}

impl AlertManager {
    pub fn new(config: AlertConfig, shards: usize) -> Self {
        Self {
            config,
            shards: (0..shards.max(1))
                .map(|_| Mutex::new(AlertShard::default()))
                .collect(),
            store: None,
        }
    }

    /// Write every alert change through `store`.
    pub fn with_store(mut self, store: Arc<dyn AlertStore>) -> Self {
        self.set_store(store);
        self
    }

    pub fn set_store(&mut self, store: Arc<dyn AlertStore>) {
        self.store = Some(store);
    }

    pub fn config(&self) -> &AlertConfig {
        &self.config
    }

    /// Called with the alert's shard locked.
    fn persist(&self, alert: &Alert) -> Result<(), PersistError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        store.save_alert(&alert.to_wire()).inspect_err(|e| {
            metrics::PERSIST_FAILURES.inc();
            warn!(
                alert_id = %alert.id,
                sku = %alert.sku,
                error = %e,
                retryable = e.is_retryable(),
                "alert persistence failed"
            );
        })
    }

    /// Flush the attached store, if any.
    pub fn flush(&self) -> Result<(), PersistError> {
        match &self.store {
            Some(store) => store.flush(),
            None => Ok(()),
        }
    }

    fn shard_for(&self, sku: &str) -> &Mutex<AlertShard> {
        let idx = (xxh3_64(sku.as_bytes()) % self.shards.len() as u64) as usize;
        &self.shards[idx]
    }

    /// Fold a triggering signal into the active alert for its
    /// `(subject, category)`, opening one if there is none. The in-memory
    /// update stands even when the store rejects the write.
    pub fn on_signal(
        &self,
        signal: Signal,
        now: DateTime<Utc>,
    ) -> (AlertUpdate, Result<(), PersistError>) {
        let category = signal.category();
        let key = (signal.subject.clone(), category);
        let mut shard = self.shard_for(&signal.subject).lock();

        let existing = shard.active.get(&key).cloned();
        if let Some(alert) = existing.and_then(|id| shard.alerts.get_mut(&id)) {
            let before = alert.severity;
            alert.refresh(
                signal.severity,
                signal.evidence,
                now,
                &self.config.ack_sla,
                &self.config.resolve_sla,
            );
            metrics::ALERTS_REFRESHED.inc();
            if alert.severity > before {
                warn!(
                    alert_id = %alert.id,
                    sku = %alert.sku,
                    category = %category,
                    from = %before,
                    to = %alert.severity,
                    "alert escalated"
                );
            } else {
                debug!(
                    alert_id = %alert.id,
                    sku = %alert.sku,
                    category = %category,
                    triggers = alert.trigger_count,
                    "alert evidence refreshed"
                );
            }
            let alert = alert.clone();
            let persisted = self.persist(&alert);
            return (AlertUpdate::Refreshed(alert), persisted);
        }

        let alert = Alert::open(
            &signal.subject,
            signal.severity,
            signal.evidence,
            now,
            &self.config.ack_sla,
            &self.config.resolve_sla,
        );
        metrics::ALERTS_OPENED
            .with_label_values(&[category.name()])
            .inc();
        metrics::ACTIVE_ALERTS.inc();
        if alert.severity >= Severity::High {
            warn!(
                alert_id = %alert.id,
                sku = %alert.sku,
                category = %category,
                severity = %alert.severity,
                deadline = %alert.sla_deadline,
                "alert opened"
            );
        } else {
            info!(
                alert_id = %alert.id,
                sku = %alert.sku,
                category = %category,
                severity = %alert.severity,
                "alert opened"
            );
        }
        shard.insert(alert.clone());
        let persisted = self.persist(&alert);
        (AlertUpdate::Opened(alert), persisted)
    }

    fn transition(
        &self,
        id: &str,
        event: LifecycleEvent,
        now: DateTime<Utc>,
    ) -> Result<AlertChange, LifecycleError> {
        for shard in &self.shards {
            let mut shard = shard.lock();
            let Some(alert) = shard.alerts.get_mut(id) else {
                continue;
            };
            alert.apply(event, now)?;
            let alert = alert.clone();
            if !alert.is_active() {
                shard.deactivate(&alert);
                metrics::ACTIVE_ALERTS.dec();
            }
            info!(alert_id = %id, status = alert.status().name(), "alert transitioned");
            let persisted = self.persist(&alert);
            return Ok(AlertChange { alert, persisted });
        }
        Err(LifecycleError::NotFound(id.to_string()))
    }

    pub fn acknowledge(&self, id: &str, now: DateTime<Utc>) -> Result<AlertChange, LifecycleError> {
        self.transition(id, LifecycleEvent::Acknowledge, now)
    }

    pub fn resolve(&self, id: &str, now: DateTime<Utc>) -> Result<AlertChange, LifecycleError> {
        self.transition(id, LifecycleEvent::Resolve, now)
    }

    /// Expire overdue alerts and purge terminal alerts past retention.
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let retention = Duration::seconds(self.config.retention_secs as i64);
        let mut report = SweepReport::default();

        for shard in &self.shards {
            let mut shard = shard.lock();

            let overdue: Vec<String> = shard
                .alerts
                .values()
                .filter(|a| a.is_overdue(now))
                .map(|a| a.id.clone())
                .collect();
            for id in overdue {
                let Some(alert) = shard.alerts.get_mut(&id) else {
                    continue;
                };
                if alert.apply(LifecycleEvent::Expire, now).is_err() {
                    continue;
                }
                let alert = alert.clone();
                shard.deactivate(&alert);
                metrics::ALERTS_EXPIRED.inc();
                metrics::ACTIVE_ALERTS.dec();
                info!(
                    alert_id = %alert.id,
                    sku = %alert.sku,
                    category = %alert.category,
                    severity = %alert.severity,
                    "alert expired"
                );
                if let Err(e) = self.persist(&alert) {
                    report.persist_errors.push(e);
                }
                report.expired.push(alert);
            }

            let before = shard.alerts.len();
            shard.alerts.retain(|_, a| {
                a.state
                    .closed_at()
                    .is_none_or(|closed| closed + retention > now)
            });
            report.purged += before - shard.alerts.len();
        }

        if !report.expired.is_empty() || report.purged > 0 {
            debug!(
                expired = report.expired.len(),
                purged = report.purged,
                "sla sweep"
            );
        }
        report
    }

    pub fn get(&self, id: &str) -> Option<Alert> {
        self.shards
            .iter()
            .find_map(|shard| shard.lock().alerts.get(id).cloned())
    }

    /// The active alert for `(sku, category)`, if any.
    pub fn active_for(&self, sku: &str, category: Category) -> Option<Alert> {
        let shard = self.shard_for(sku).lock();
        shard
            .active
            .get(&(sku.to_string(), category))
            .and_then(|id| shard.alerts.get(id))
            .cloned()
    }

    pub fn has_active(&self, sku: &str) -> bool {
        let shard = self.shard_for(sku).lock();
        shard.active.keys().any(|(s, _)| s == sku)
    }

    /// Matching alerts, most recently opened first.
    pub fn list(&self, filter: &AlertFilter) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self
            .shards
            .iter()
            .flat_map(|shard| {
                shard
                    .lock()
                    .alerts
                    .values()
                    .filter(|a| filter.matches(a))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        alerts.sort_by(|a, b| b.opened_at.cmp(&a.opened_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            alerts.truncate(limit);
        }
        alerts
    }

    pub fn stats(&self) -> AlertStats {
        let mut stats = AlertStats::default();
        for shard in &self.shards {
            for alert in shard.lock().alerts.values() {
                stats.total += 1;
                *stats.by_severity.entry(alert.severity).or_insert(0) += 1;
                *stats.by_category.entry(alert.category).or_insert(0) += 1;
                *stats.by_status.entry(alert.status()).or_insert(0) += 1;
                if alert.status() == AlertStatus::Open {
                    stats.unacknowledged += 1;
                }
            }
        }
        stats
    }

    /// Every retained alert, for checkpointing.
    pub fn snapshot(&self) -> Vec<Alert> {
        self.shards
            .iter()
            .flat_map(|shard| shard.lock().alerts.values().cloned().collect::<Vec<_>>())
            .collect()
    }

    pub fn restore(&self, alerts: Vec<Alert>) {
        let mut active = 0usize;
        for alert in alerts {
            if alert.is_active() {
                active += 1;
            }
            self.shard_for(&alert.sku).lock().insert(alert);
        }
        metrics::ACTIVE_ALERTS.add(active as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{AlertWire, Evidence};
    use crate::conversion::ConversionReading;
    use crate::store::MemoryAlertStore;
    use crossbeam_channel::{Receiver, Sender, bounded};

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn signal(sku: &str, severity: Severity, z: f64) -> Signal {
        Signal {
            subject: sku.to_string(),
            severity,
            evidence: Evidence::Conversion {
                reading: ConversionReading {
                    observed: 0.4,
                    expected: 0.1,
                    variance: 0.01,
                    z_score: z,
                    observations: 30,
                },
            },
        }
    }

    fn manager() -> AlertManager {
        AlertManager::new(AlertConfig::default(), 4)
    }

    fn fold(m: &AlertManager, signal: Signal, now: DateTime<Utc>) -> AlertUpdate {
        let (update, persisted) = m.on_signal(signal, now);
        assert_eq!(persisted, Ok(()));
        update
    }

    #[test]
    fn test_repeated_trigger_updates_in_place() {
        let m = manager();
        let first = fold(&m, signal("A", Severity::Medium, 2.2), t0());
        assert!(matches!(first, AlertUpdate::Opened(_)));
        let later = t0() + Duration::minutes(1);
        let second = fold(&m, signal("A", Severity::Medium, 2.4), later);
        let AlertUpdate::Refreshed(alert) = second else {
            panic!("expected refresh");
        };
        assert_eq!(alert.id, first.alert().id);
        assert_eq!(alert.last_updated, later);
        assert_eq!(alert.trigger_count, 2);
        assert_eq!(m.stats().total, 1);
    }

    #[test]
    fn test_distinct_pairs_open_distinct_alerts() {
        let m = manager();
        fold(&m, signal("A", Severity::Medium, 2.2), t0());
        fold(&m, signal("B", Severity::Medium, 2.2), t0());
        assert_eq!(m.stats().total, 2);
        assert!(m.has_active("A"));
        assert!(!m.has_active("C"));
    }

    #[test]
    fn test_sweep_expires_unacknowledged() {
        let m = manager();
        let id = fold(&m, signal("A", Severity::Critical, 3.5), t0())
            .into_alert()
            .id;
        assert!(m.sweep(t0() + Duration::minutes(4)).expired.is_empty());
        let report = m.sweep(t0() + Duration::minutes(6));
        assert_eq!(report.expired.len(), 1);
        assert_eq!(m.get(&id).unwrap().status(), AlertStatus::Expired);
        assert!(!m.has_active("A"));

        // Expired never returns to open or acknowledged.
        assert!(matches!(
            m.acknowledge(&id, t0() + Duration::minutes(7)),
            Err(LifecycleError::InvalidTransition { .. })
        ));
        assert!(m.sweep(t0() + Duration::minutes(8)).expired.is_empty());
        assert_eq!(m.get(&id).unwrap().status(), AlertStatus::Expired);

        // A new trigger after expiry opens a fresh alert.
        let fresh = fold(&m, signal("A", Severity::Medium, 2.2), t0() + Duration::minutes(9));
        assert!(matches!(fresh, AlertUpdate::Opened(ref a) if a.id != id));
    }

    #[test]
    fn test_acknowledged_expires_on_resolution_deadline() {
        let m = manager();
        let id = fold(&m, signal("A", Severity::Critical, 3.5), t0())
            .into_alert()
            .id;
        m.acknowledge(&id, t0() + Duration::minutes(2)).unwrap();
        assert!(m.sweep(t0() + Duration::minutes(30)).expired.is_empty());
        let report = m.sweep(t0() + Duration::minutes(61));
        assert_eq!(report.expired.len(), 1);
        assert_eq!(
            report.expired[0].state.acknowledged_at(),
            Some(t0() + Duration::minutes(2))
        );
    }

    #[test]
    fn test_resolve_and_retention_purge() {
        let m = manager();
        let id = fold(&m, signal("A", Severity::Low, 2.1), t0())
            .into_alert()
            .id;
        m.resolve(&id, t0() + Duration::minutes(1)).unwrap();
        assert_eq!(
            m.resolve(&id, t0() + Duration::minutes(2)),
            Err(LifecycleError::InvalidTransition {
                from: AlertStatus::Resolved,
                event: LifecycleEvent::Resolve
            })
        );
        assert_eq!(m.sweep(t0() + Duration::hours(1)).purged, 0);
        assert_eq!(m.sweep(t0() + Duration::hours(25)).purged, 1);
        assert!(m.get(&id).is_none());
        assert_eq!(
            m.acknowledge(&id, t0()),
            Err(LifecycleError::NotFound(id.clone()))
        );
    }

    #[test]
    fn test_list_filters_and_order() {
        let m = manager();
        fold(&m, signal("A", Severity::Medium, 2.2), t0());
        fold(&m, signal("B", Severity::High, 2.7), t0() + Duration::seconds(1));
        fold(&m, signal("C", Severity::Medium, 2.2), t0() + Duration::seconds(2));

        let all = m.list(&AlertFilter::default());
        let skus: Vec<&str> = all.iter().map(|a| a.sku.as_str()).collect();
        assert_eq!(skus, vec!["C", "B", "A"]);

        let medium = m.list(&AlertFilter {
            severity: Some(Severity::Medium),
            limit: Some(1),
            ..AlertFilter::default()
        });
        assert_eq!(medium.len(), 1);
        assert_eq!(medium[0].sku, "C");

        let stats = m.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.unacknowledged, 3);
        assert_eq!(stats.by_severity[&Severity::Medium], 2);
        assert_eq!(stats.by_category[&Category::Conversion], 3);
    }

    #[test]
    fn test_restore_rebuilds_dedup_index() {
        let m = manager();
        let id = fold(&m, signal("A", Severity::Medium, 2.2), t0())
            .into_alert()
            .id;
        let restored = manager();
        restored.restore(m.snapshot());
        let update = fold(&restored, signal("A", Severity::Medium, 2.3), t0());
        assert_eq!(update.alert().id, id);
        assert!(matches!(update, AlertUpdate::Refreshed(_)));
    }

    /// Holds the write of an alert's second trigger until released.
    struct GatedStore {
        inner: MemoryAlertStore,
        entered: Sender<()>,
        release: Receiver<()>,
    }

    impl AlertStore for GatedStore {
        fn save_alert(&self, alert: &AlertWire) -> Result<(), PersistError> {
            if alert.trigger_count == 2 && alert.status == AlertStatus::Open {
                let _ = self.entered.send(());
                let _ = self.release.recv();
            }
            self.inner.save_alert(alert)
        }
    }

    #[test]
    fn test_store_sees_changes_in_applied_order() {
        let (entered_tx, entered_rx) = bounded(1);
        let (release_tx, release_rx) = bounded(1);
        let store = Arc::new(GatedStore {
            inner: MemoryAlertStore::new(),
            entered: entered_tx,
            release: release_rx,
        });
        let m = AlertManager::new(AlertConfig::default(), 4).with_store(store.clone());
        let id = fold(&m, signal("A", Severity::Critical, 3.5), t0())
            .into_alert()
            .id;

        std::thread::scope(|scope| {
            let refresh = scope.spawn(|| {
                m.on_signal(signal("A", Severity::Critical, 3.6), t0() + Duration::minutes(1))
            });
            entered_rx.recv().unwrap();
            // The refresh write is in flight; the sweep must wait for it.
            let sweep = scope.spawn(|| m.sweep(t0() + Duration::minutes(10)));
            std::thread::sleep(std::time::Duration::from_millis(50));
            release_tx.send(()).unwrap();

            let (update, persisted) = refresh.join().unwrap();
            assert!(matches!(update, AlertUpdate::Refreshed(_)));
            assert_eq!(persisted, Ok(()));
            let report = sweep.join().unwrap();
            assert_eq!(report.expired.len(), 1);
            assert!(report.persist_errors.is_empty());
        });

        assert_eq!(m.get(&id).unwrap().status(), AlertStatus::Expired);
        let written: Vec<AlertStatus> = store
            .inner
            .saved()
            .iter()
            .filter(|a| a.id == id)
            .map(|a| a.status)
            .collect();
        assert_eq!(
            written,
            vec![AlertStatus::Open, AlertStatus::Open, AlertStatus::Expired]
        );
        assert_eq!(store.inner.latest(&id).unwrap().status, AlertStatus::Expired);
    }

    #[test]
    fn test_rejected_write_keeps_transition() {
        let store = Arc::new(MemoryAlertStore::new());
        let m = AlertManager::new(AlertConfig::default(), 2).with_store(store.clone());
        let id = fold(&m, signal("A", Severity::High, 2.7), t0()).into_alert().id;
        store.fail_next(1);
        let change = m.acknowledge(&id, t0() + Duration::minutes(1)).unwrap();
        assert!(change.persisted.is_err());
        assert_eq!(change.alert.status(), AlertStatus::Acknowledged);
        assert_eq!(m.get(&id).unwrap().status(), AlertStatus::Acknowledged);
        assert_eq!(store.latest(&id).unwrap().status, AlertStatus::Open);
    }
}
