//! Process-wide Prometheus metrics.
//!
//! Statics register themselves with the default registry on first use.
//! Exposition is left to the embedding process; `render` produces the text
//! format for a scrape endpoint or a shutdown dump.

use once_cell::sync::Lazy;
use prometheus::{Counter, CounterVec, Gauge, Histogram, HistogramOpts, Opts, TextEncoder};

// ============================================================================
// METRICS
// ============================================================================

pub static RECORDS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    let c = Counter::new("skuwatch_records_total", "Total telemetry records processed").unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static DROPPED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    let c = Counter::new(
        "skuwatch_dropped_total",
        "Total records dropped due to backpressure",
    )
    .unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static DRIFT_EVALUATIONS: Lazy<Counter> = Lazy::new(|| {
    let c = Counter::new(
        "skuwatch_drift_evaluations_total",
        "Drift evaluations against a ready baseline",
    )
    .unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static ALERTS_OPENED: Lazy<CounterVec> = Lazy::new(|| {
    let c = CounterVec::new(
        Opts::new("skuwatch_alerts_opened_total", "Alerts opened by category"),
        &["category"],
    )
    .unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static ALERTS_REFRESHED: Lazy<Counter> = Lazy::new(|| {
    let c = Counter::new(
        "skuwatch_alerts_refreshed_total",
        "Triggering signals folded into an existing alert",
    )
    .unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static ALERTS_EXPIRED: Lazy<Counter> = Lazy::new(|| {
    let c = Counter::new("skuwatch_alerts_expired_total", "Alerts expired by SLA sweep").unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static ACTIVE_ALERTS: Lazy<Gauge> = Lazy::new(|| {
    let g = Gauge::new("skuwatch_active_alerts", "Open or acknowledged alerts").unwrap();
    prometheus::register(Box::new(g.clone())).unwrap();
    g
});

pub static REJECTED_VECTORS: Lazy<Counter> = Lazy::new(|| {
    let c = Counter::new(
        "skuwatch_rejected_vectors_total",
        "Feature vectors rejected by the anomaly scorer",
    )
    .unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static PERSIST_FAILURES: Lazy<Counter> = Lazy::new(|| {
    let c = Counter::new(
        "skuwatch_persist_failures_total",
        "Alert writes the store did not accept",
    )
    .unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static TRACKED_SKUS: Lazy<Gauge> = Lazy::new(|| {
    let g = Gauge::new("skuwatch_tracked_skus", "SKUs with live per-SKU state").unwrap();
    prometheus::register(Box::new(g.clone())).unwrap();
    g
});

pub static EVICTIONS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    let c = Counter::new(
        "skuwatch_evictions_total",
        "Idle SKUs evicted to stay within capacity",
    )
    .unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static PROCESSING_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    let h = Histogram::with_opts(HistogramOpts::new(
        "skuwatch_processing_duration_seconds",
        "Histogram of per-record processing latency",
    ))
    .unwrap();
    prometheus::register(Box::new(h.clone())).unwrap();
    h
});

/// Text exposition of everything in the default registry.
pub fn render() -> Result<String, prometheus::Error> {
    TextEncoder::new().encode_to_string(&prometheus::gather())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_touched_metrics() {
        RECORDS_TOTAL.inc();
        ALERTS_OPENED.with_label_values(&["drift"]).inc();
        let text = render().unwrap();
        assert!(text.contains("skuwatch_records_total"));
        assert!(text.contains("skuwatch_alerts_opened_total"));
    }
}
