//! Streaming front end: one worker thread per shard.
//!
//! Records are routed to a shard by `xxh3(sku)` and queued on a bounded
//! channel, so one SKU always lands on the same worker and is processed in
//! arrival order. `try_submit` never blocks; a full queue drops the record and
//! counts it.

use std::sync::Arc;
use std::thread;

use chrono::Utc;
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use thiserror::Error;
use tracing::{error, info};
use xxhash_rust::xxh3::xxh3_64;

use crate::engine::{DetectionEngine, ProcessOutcome};
use crate::metrics;
use crate::record::TelemetryRecord;

/// Called on the worker thread after every processed record.
pub type OutcomeHook = Arc<dyn Fn(&TelemetryRecord, &ProcessOutcome) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub shards: usize,
    /// Records buffered per shard before `try_submit` starts dropping
    pub queue_capacity: usize,
    /// Use the record timestamp as "now" instead of the wall clock
    pub event_time: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            shards: thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(8),
            queue_capacity: 100_000,
            event_time: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("shard {0} queue is full")]
    Full(usize),
    #[error("pipeline is shut down")]
    Closed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Records processed per shard
    pub processed: Vec<u64>,
    /// Workers that panicked
    pub failed_workers: usize,
}

impl PipelineStats {
    pub fn total(&self) -> u64 {
        self.processed.iter().sum()
    }
}

struct ShardWorker {
    id: usize,
    rx: Receiver<TelemetryRecord>,
    engine: Arc<DetectionEngine>,
    hook: Option<OutcomeHook>,
    event_time: bool,
}

impl ShardWorker {
    fn spawn(self) -> std::io::Result<thread::JoinHandle<u64>> {
        thread::Builder::new()
            .name(format!("skuwatch-shard-{}", self.id))
            .spawn(move || {
                let id = self.id;
                let processed = self.run();
                info!(shard = id, processed, "shard worker stopped");
                processed
            })
    }

    fn run(self) -> u64 {
        info!(shard = self.id, "shard worker active");
        let mut processed = 0u64;
        while let Ok(record) = self.rx.recv() {
            let now = if self.event_time {
                record.timestamp
            } else {
                Utc::now()
            };
            let outcome = self.engine.process(&record, now);
            if let Some(hook) = &self.hook {
                hook(&record, &outcome);
            }
            processed += 1;
        }
        processed
    }
}

pub struct Pipeline {
    engine: Arc<DetectionEngine>,
    senders: Vec<Sender<TelemetryRecord>>,
    workers: Vec<thread::JoinHandle<u64>>,
}

impl Pipeline {
    pub fn spawn(
        engine: Arc<DetectionEngine>,
        config: &PipelineConfig,
        hook: Option<OutcomeHook>,
    ) -> std::io::Result<Self> {
        let shards = config.shards.max(1);
        let mut senders = Vec::with_capacity(shards);
        let mut workers = Vec::with_capacity(shards);
        for id in 0..shards {
            let (tx, rx) = bounded(config.queue_capacity.max(1));
            senders.push(tx);
            workers.push(
                ShardWorker {
                    id,
                    rx,
                    engine: Arc::clone(&engine),
                    hook: hook.clone(),
                    event_time: config.event_time,
                }
                .spawn()?,
            );
        }
        info!(shards, queue_capacity = config.queue_capacity, "pipeline started");
        Ok(Self {
            engine,
            senders,
            workers,
        })
    }

    pub fn engine(&self) -> &Arc<DetectionEngine> {
        &self.engine
    }

    pub fn shard_for(&self, sku: &str) -> usize {
        (xxh3_64(sku.as_bytes()) % self.senders.len() as u64) as usize
    }

    /// Queue without blocking; a full shard queue drops the record.
    pub fn try_submit(&self, record: TelemetryRecord) -> Result<(), SubmitError> {
        let shard = self.shard_for(&record.sku);
        match self.senders[shard].try_send(record) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                metrics::DROPPED_TOTAL.inc();
                Err(SubmitError::Full(shard))
            }
            Err(TrySendError::Disconnected(_)) => Err(SubmitError::Closed),
        }
    }

    /// Queue, waiting for room if the shard is full.
    pub fn submit(&self, record: TelemetryRecord) -> Result<(), SubmitError> {
        let shard = self.shard_for(&record.sku);
        self.senders[shard]
            .send(record)
            .map_err(|_| SubmitError::Closed)
    }

    /// Close the queues and wait for the workers to drain them.
    pub fn shutdown(self) -> PipelineStats {
        drop(self.senders);
        let mut stats = PipelineStats::default();
        for (shard, handle) in self.workers.into_iter().enumerate() {
            match handle.join() {
                Ok(processed) => stats.processed.push(processed),
                Err(_) => {
                    error!(shard, "shard worker panicked");
                    stats.processed.push(0);
                    stats.failed_workers += 1;
                }
            }
        }
        info!(records = stats.total(), "all shards drained");
        stats
    }
}
