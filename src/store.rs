//! Persistence ports for alert changes.
//!
//! The engine hands every opened, refreshed or transitioned alert to an
//! `AlertStore`. Store failures never roll back in-memory state; they are
//! returned to the caller as `PersistError` so it can retry.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::info;

use crate::alert::AlertWire;
use crate::error::PersistError;

pub trait AlertStore: Send + Sync {
    fn save_alert(&self, alert: &AlertWire) -> Result<(), PersistError>;

    fn flush(&self) -> Result<(), PersistError> {
        Ok(())
    }
}

// ============================================================================
// IN-MEMORY
// ============================================================================

/// Keeps every saved alert version in order. Can be told to fail the next
/// `n` writes.
#[derive(Default)]
pub struct MemoryAlertStore {
    saved: Mutex<Vec<AlertWire>>,
    fail_next: AtomicUsize,
}

impl MemoryAlertStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, writes: usize) {
        self.fail_next.store(writes, Ordering::SeqCst);
    }

    pub fn saved(&self) -> Vec<AlertWire> {
        self.saved.lock().clone()
    }

    /// Latest saved version of the alert with `id`.
    pub fn latest(&self, id: &str) -> Option<AlertWire> {
        self.saved.lock().iter().rev().find(|a| a.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.saved.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AlertStore for MemoryAlertStore {
    fn save_alert(&self, alert: &AlertWire) -> Result<(), PersistError> {
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PersistError::Unavailable("injected failure".to_string()));
        }
        self.saved.lock().push(alert.clone());
        Ok(())
    }
}

// ============================================================================
// JSON LINES
// ============================================================================

/// Appends alerts as JSON lines to `alerts_<YYYYMMDDHH>.jsonl`, starting a new
/// file whenever an alert's `last_updated` falls in a new UTC hour.
pub struct JsonlAlertLog {
    dir: PathBuf,
    current: Mutex<Option<(String, BufWriter<File>)>>,
}

impl JsonlAlertLog {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, PersistError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        info!(dir = %dir.display(), "alert log active");
        Ok(Self {
            dir,
            current: Mutex::new(None),
        })
    }

    pub fn hour_key(at: DateTime<Utc>) -> String {
        at.format("%Y%m%d%H").to_string()
    }

    pub fn path_for(&self, at: DateTime<Utc>) -> PathBuf {
        self.dir
            .join(format!("alerts_{}.jsonl", Self::hour_key(at)))
    }

    fn open_file(&self, at: DateTime<Utc>) -> Result<BufWriter<File>, PersistError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(at))?;
        Ok(BufWriter::with_capacity(64 * 1024, file))
    }
}

impl AlertStore for JsonlAlertLog {
    fn save_alert(&self, alert: &AlertWire) -> Result<(), PersistError> {
        let mut line = serde_json::to_vec(alert)
            .map_err(|e| PersistError::Serialization(e.to_string()))?;
        line.push(b'\n');

        let hour = Self::hour_key(alert.last_updated);
        let mut current = self.current.lock();
        let rotate = current.as_ref().is_none_or(|(open_hour, _)| *open_hour != hour);
        if rotate {
            if let Some((_, mut previous)) = current.take() {
                previous.flush()?;
            }
            *current = Some((hour.clone(), self.open_file(alert.last_updated)?));
        }
        if let Some((_, writer)) = current.as_mut() {
            writer.write_all(&line)?;
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), PersistError> {
        if let Some((_, writer)) = self.current.lock().as_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}

impl Drop for JsonlAlertLog {
    fn drop(&mut self) {
        let _ = AlertStore::flush(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{Alert, Evidence, Severity};
    use crate::config::SlaTable;
    use crate::conversion::ConversionReading;
    use chrono::Duration;

    fn wire(at: DateTime<Utc>) -> AlertWire {
        Alert::open(
            "SKU-9",
            Severity::High,
            Evidence::Conversion {
                reading: ConversionReading {
                    observed: 0.4,
                    expected: 0.1,
                    variance: 0.01,
                    z_score: 3.0,
                    observations: 12,
                },
            },
            at,
            &SlaTable::acknowledgment(),
            &SlaTable::resolution(),
        )
        .to_wire()
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T12:10:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_memory_store_failure_injection() {
        let store = MemoryAlertStore::new();
        store.fail_next(1);
        let alert = wire(t0());
        let err = store.save_alert(&alert).unwrap_err();
        assert!(err.is_retryable());
        assert!(store.is_empty());
        store.save_alert(&alert).unwrap();
        assert_eq!(store.latest(&alert.id), Some(alert));
    }

    #[test]
    fn test_jsonl_rotates_hourly() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlAlertLog::open(dir.path()).unwrap();
        let first = wire(t0());
        let second = wire(t0() + Duration::minutes(5));
        let third = wire(t0() + Duration::hours(1));
        for a in [&first, &second, &third] {
            log.save_alert(a).unwrap();
        }
        log.flush().unwrap();

        let noon = std::fs::read_to_string(log.path_for(t0())).unwrap();
        let lines: Vec<AlertWire> = noon
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines, vec![first, second]);

        let one = std::fs::read_to_string(log.path_for(third.last_updated)).unwrap();
        assert_eq!(one.lines().count(), 1);
        assert!(log.path_for(t0()).ends_with("alerts_2024050112.jsonl"));
    }
}
