//! skuwatch - per-SKU drift, conversion and outlier alerting
//!
//! Usage:
//!   skuwatch records.jsonl --alerts-dir alerts/
//!   tail -f feed.jsonl | skuwatch --config skuwatch.toml --model forest.json
//!   skuwatch replay.jsonl --event-time --checkpoint-out state.bin

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use crossbeam_channel::{Receiver, bounded, select};
use parking_lot::Mutex;
use skuwatch::engine::ProcessOutcome;
use skuwatch::features::FeatureVector;
use skuwatch::pipeline::{OutcomeHook, PipelineStats, SubmitError};
use skuwatch::{
    DetectionEngine, EngineConfig, IsolationForestModel, JsonlAlertLog, Pipeline,
    PipelineConfig, TelemetryRecord, metrics,
};
use tokio::sync::oneshot;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "skuwatch")]
#[command(about = "Streaming drift, conversion and outlier alerting for SKU telemetry")]
struct Cli {
    /// JSON-lines record file; reads stdin when omitted
    input: Option<PathBuf>,

    /// Engine configuration (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Pre-fitted isolation forest (JSON); otherwise one is fitted on warmup records
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// Write the warmup-fitted model here
    #[arg(long)]
    save_model: Option<PathBuf>,

    /// Worker shards (defaults to available parallelism)
    #[arg(long)]
    shards: Option<usize>,

    /// Records buffered per shard
    #[arg(long, default_value = "100000")]
    queue_capacity: usize,

    /// Drop records when a shard queue is full instead of waiting
    #[arg(long)]
    drop_on_full: bool,

    /// Seconds between SLA sweeps
    #[arg(long, default_value = "30")]
    sweep_interval_secs: u64,

    /// Directory for hourly alert logs
    #[arg(long, default_value = "alerts")]
    alerts_dir: PathBuf,

    /// Write Prometheus text exposition here on shutdown
    #[arg(long)]
    metrics_out: Option<PathBuf>,

    /// Treat record timestamps as the clock (for replays)
    #[arg(long)]
    event_time: bool,

    /// Restore engine state from this checkpoint before reading
    #[arg(long)]
    checkpoint_in: Option<PathBuf>,

    /// Write an engine checkpoint here on shutdown
    #[arg(long)]
    checkpoint_out: Option<PathBuf>,

    /// Log as JSON
    #[arg(long)]
    log_json: bool,
}

#[derive(Debug, Default)]
struct IngestStats {
    lines: u64,
    malformed: u64,
    dropped: u64,
}

type LineResult = io::Result<Vec<u8>>;

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn build_engine(cli: &Cli, config: EngineConfig) -> Result<DetectionEngine> {
    let engine = match &cli.checkpoint_in {
        Some(path) => {
            let bytes = std::fs::read(path)
                .with_context(|| format!("reading checkpoint {}", path.display()))?;
            DetectionEngine::restore_bytes(config, &bytes)?
        }
        None => DetectionEngine::new(config),
    };
    let log = JsonlAlertLog::open(&cli.alerts_dir)
        .with_context(|| format!("opening alert log in {}", cli.alerts_dir.display()))?;
    Ok(engine.with_store(Arc::new(log)))
}

/// Collects feature vectors until the warmup quota is met, then fits and
/// installs an isolation forest.
fn warmup_hook(engine: Arc<DetectionEngine>, save_to: Option<PathBuf>) -> OutcomeHook {
    let quota = engine.config().scorer.warmup_records.max(1);
    let forest = engine.config().scorer.forest.clone();
    let collected: Mutex<Vec<FeatureVector>> = Mutex::new(Vec::with_capacity(quota));
    let fitted = AtomicBool::new(false);

    Arc::new(move |_: &TelemetryRecord, outcome: &ProcessOutcome| {
        if fitted.load(Ordering::Acquire) {
            return;
        }
        let population = {
            let mut collected = collected.lock();
            if outcome.features.validate().is_ok() {
                collected.push(outcome.features);
            }
            if collected.len() < quota || fitted.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *collected)
        };
        let Some(model) = IsolationForestModel::fit(&population, &forest) else {
            return;
        };
        if let Some(path) = &save_to {
            match serde_json::to_vec(&model) {
                Ok(bytes) => {
                    if let Err(e) = std::fs::write(path, bytes) {
                        warn!(path = %path.display(), error = %e, "failed to save model");
                    }
                }
                Err(e) => warn!(error = %e, "failed to encode model"),
            }
        }
        engine.install_model(Arc::new(model));
    })
}

/// Read raw lines on a detached thread; a read blocked on an idle stdin then
/// cannot hold up shutdown.
fn spawn_line_reader(input: Option<PathBuf>) -> Result<Receiver<LineResult>> {
    let reader: Box<dyn BufRead + Send> = match &input {
        Some(path) => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("opening {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(io::stdin())),
    };
    let (tx, rx) = bounded(1_024);
    thread::Builder::new()
        .name("skuwatch-reader".to_string())
        .spawn(move || {
            for line in reader.split(b'\n') {
                if tx.send(line).is_err() {
                    break;
                }
            }
        })
        .context("spawning reader thread")?;
    Ok(rx)
}

/// Feed lines into the pipeline until EOF or `stop`, then drain it.
fn ingest(
    lines: Receiver<LineResult>,
    stop: Receiver<()>,
    pipeline: Pipeline,
    drop_on_full: bool,
) -> Result<(IngestStats, PipelineStats)> {
    let mut stats = IngestStats::default();
    loop {
        let next = select! {
            recv(lines) -> line => line.ok(),
            recv(stop) -> _ => None,
        };
        let Some(line) = next else {
            break;
        };
        let mut line = line.context("reading input")?;
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        stats.lines += 1;
        let record = match simd_json::from_slice::<TelemetryRecord>(&mut line) {
            Ok(record) => record,
            Err(e) => {
                stats.malformed += 1;
                warn!(line = stats.lines, error = %e, "skipping malformed record");
                continue;
            }
        };
        let submitted = if drop_on_full {
            pipeline.try_submit(record)
        } else {
            pipeline.submit(record)
        };
        match submitted {
            Ok(()) => {}
            Err(SubmitError::Full(shard)) => {
                stats.dropped += 1;
                if stats.dropped.is_power_of_two() {
                    warn!(shard, dropped = stats.dropped, "shard queue full, dropping records");
                }
            }
            Err(SubmitError::Closed) => break,
        }
    }
    Ok((stats, pipeline.shutdown()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let _ = &*metrics::RECORDS_TOTAL;
    let _ = &*metrics::DROPPED_TOTAL;
    let _ = &*metrics::PROCESSING_LATENCY;

    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let pipeline_config = PipelineConfig {
        shards: cli.shards.unwrap_or_else(|| PipelineConfig::default().shards),
        queue_capacity: cli.queue_capacity,
        event_time: cli.event_time,
    };
    config.shards.sku_shards = config.shards.sku_shards.max(pipeline_config.shards);
    config.validate()?;

    let engine = Arc::new(build_engine(&cli, config)?);
    info!(shards = pipeline_config.shards, event_time = cli.event_time, "skuwatch starting");

    let hook = match &cli.model {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading model {}", path.display()))?;
            let model: IsolationForestModel =
                serde_json::from_str(&json).context("decoding model")?;
            engine.install_model(Arc::new(model));
            None
        }
        None => Some(warmup_hook(Arc::clone(&engine), cli.save_model.clone())),
    };

    let pipeline = Pipeline::spawn(Arc::clone(&engine), &pipeline_config, hook)?;

    // SLA sweeper
    let (stop_sweeper, mut sweeper_stopped) = oneshot::channel::<()>();
    let sweeper_engine = Arc::clone(&engine);
    let event_time = cli.event_time;
    let mut interval = tokio::time::interval(Duration::from_secs(cli.sweep_interval_secs.max(1)));
    let sweeper = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = if event_time {
                        sweeper_engine.watermark().unwrap_or_else(Utc::now)
                    } else {
                        Utc::now()
                    };
                    sweeper_engine.sweep(now);
                }
                _ = &mut sweeper_stopped => break,
            }
        }
    });

    let lines = spawn_line_reader(cli.input.clone())?;
    let (stop_tx, stop_rx) = bounded::<()>(1);
    let drop_on_full = cli.drop_on_full;
    let mut reader =
        tokio::task::spawn_blocking(move || ingest(lines, stop_rx, pipeline, drop_on_full));

    let (ingest_stats, pipeline_stats) = tokio::select! {
        res = &mut reader => res??,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down, draining queues");
            let _ = stop_tx.send(());
            reader.await??
        }
    };

    let _ = stop_sweeper.send(());
    sweeper.await?;

    let now = if cli.event_time {
        engine.watermark().unwrap_or_else(Utc::now)
    } else {
        Utc::now()
    };
    engine.sweep(now);
    engine.flush()?;

    if let Some(path) = &cli.checkpoint_out {
        let bytes = engine.checkpoint(now).to_bytes()?;
        std::fs::write(path, bytes)
            .with_context(|| format!("writing checkpoint {}", path.display()))?;
        info!(path = %path.display(), "checkpoint written");
    }
    if let Some(path) = &cli.metrics_out {
        std::fs::write(path, metrics::render()?)
            .with_context(|| format!("writing metrics {}", path.display()))?;
    }

    let stats = engine.stats();
    info!(
        lines = ingest_stats.lines,
        malformed = ingest_stats.malformed,
        dropped = ingest_stats.dropped,
        processed = pipeline_stats.total(),
        alerts = stats.total,
        unacknowledged = stats.unacknowledged,
        "skuwatch finished"
    );
    Ok(())
}
