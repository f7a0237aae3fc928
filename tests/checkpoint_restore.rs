use chrono::{DateTime, Duration, Utc};
use skuwatch::checkpoint::CHECKPOINT_VERSION;
use skuwatch::{
    AlertFilter, AlertUpdate, Category, CheckpointError, DetectionEngine, EngineCheckpoint,
    EngineConfig, TelemetryRecord,
};

fn t(secs: i64) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-06-01T08:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
        + Duration::seconds(secs)
}

fn record(sku: &str, secs: i64, price: f64, purchases: u64) -> TelemetryRecord {
    TelemetryRecord {
        timestamp: t(secs),
        sku: sku.to_string(),
        price,
        stock: 75,
        views: 1_000,
        add_to_cart: 200,
        purchases,
        referrer: if secs % 3 == 0 {
            None
        } else {
            Some("newsletter".to_string())
        },
    }
}

fn small_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.baseline.capacity = 100;
    config.baseline.min_samples = 50;
    config.drift.current_window = 40;
    config.drift.min_window = 20;
    config.drift.evaluate_every = 10;
    config
}

fn warmed_engine() -> DetectionEngine {
    let engine = DetectionEngine::new(small_config());
    for i in 0..120 {
        let sku = ["A", "B", "C"][i as usize % 3];
        engine.process(&record(sku, i, 10.0 + (i % 7) as f64, 50), t(i));
    }
    // Conversion spike on A leaves an open alert behind.
    engine.process(&record("A", 120, 10.0, 500), t(120));
    engine
}

#[test]
fn test_restore_preserves_state_and_alerts() {
    let engine = warmed_engine();
    let open = engine
        .alerts()
        .active_for("A", Category::Conversion)
        .expect("open conversion alert");

    let bytes = engine.checkpoint(t(121)).to_bytes().unwrap();
    let restored = DetectionEngine::restore_bytes(small_config(), &bytes).unwrap();

    for sku in ["A", "B", "C"] {
        assert_eq!(restored.sku_state(sku), engine.sku_state(sku), "{sku}");
    }
    assert_eq!(restored.get(&open.id), Some(open.clone()));
    assert_eq!(restored.stats(), engine.stats());
    assert_eq!(restored.watermark(), Some(t(120)));
    assert_eq!(
        restored.list(&AlertFilter::default()).len(),
        engine.list(&AlertFilter::default()).len()
    );

    // Both engines continue identically, and the restored one refreshes the
    // alert it inherited instead of opening a new one.
    let next = record("A", 122, 10.0, 0);
    let original = engine.process(&next, t(122));
    let resumed = restored.process(&next, t(122));
    assert_eq!(original.features, resumed.features);
    assert_eq!(original.conversion, resumed.conversion);
    assert_eq!(original.drift, resumed.drift);
    let [AlertUpdate::Refreshed(alert)] = resumed.updates.as_slice() else {
        panic!("expected refresh, got {:?}", resumed.updates);
    };
    assert_eq!(alert.id, open.id);
}

#[test]
fn test_checkpoint_version_is_current() {
    let checkpoint = warmed_engine().checkpoint(t(200));
    assert_eq!(checkpoint.version, CHECKPOINT_VERSION);
    assert_eq!(checkpoint.skus.len(), 3);
    assert!(!checkpoint.drift.baselines.is_empty());
    assert!(checkpoint.size_bytes() > 0);
}

#[test]
fn test_restore_rejects_future_version() {
    let mut checkpoint = EngineCheckpoint::empty(t(0));
    checkpoint.version = CHECKPOINT_VERSION + 3;
    let bytes = checkpoint.to_bytes().unwrap();
    assert!(matches!(
        DetectionEngine::restore_bytes(EngineConfig::default(), &bytes),
        Err(CheckpointError::UnsupportedVersion { .. })
    ));
}
