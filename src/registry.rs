//! Memory-bounded per-SKU state arena.
//!
//! SKUs are spread over `Mutex` shards by xxh3 hash. All per-SKU state for one
//! record is mutated under that SKU's shard lock, which serializes records of
//! the same SKU while other shards proceed in parallel. When a shard is full
//! the least recently seen SKU is evicted, skipping SKUs the caller pins
//! (those with an active alert).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;
use xxhash_rust::xxh3::xxh3_64;

use crate::conversion::ConversionState;
use crate::features::SkuHistory;
use crate::metrics;

/// Mutable state kept per SKU.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkuState {
    pub conversion: ConversionState,
    pub history: SkuHistory,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkuMeta {
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub records: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkuCheckpoint {
    pub sku: String,
    pub state: SkuState,
    pub meta: SkuMeta,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistryStats {
    pub tracked: usize,
    pub total_creations: u64,
    pub total_evictions: u64,
}

struct SkuEntry {
    state: SkuState,
    meta: SkuMeta,
}

#[derive(Default)]
struct RegistryShard {
    entries: HashMap<String, SkuEntry>,
    creations: u64,
    evictions: u64,
}

impl RegistryShard {
    fn eviction_candidate(&self, pinned: &dyn Fn(&str) -> bool) -> Option<String> {
        self.entries
            .iter()
            .filter(|(sku, _)| !pinned(sku))
            .min_by(|a, b| {
                a.1.meta
                    .last_seen
                    .cmp(&b.1.meta.last_seen)
                    .then_with(|| a.0.cmp(b.0))
            })
            .map(|(sku, _)| sku.clone())
    }
}

pub struct SkuRegistry {
    shards: Vec<Mutex<RegistryShard>>,
    per_shard_capacity: usize,
}

impl SkuRegistry {
    pub fn new(shards: usize, max_skus: usize) -> Self {
        let shards = shards.max(1);
        Self {
            shards: (0..shards)
                .map(|_| Mutex::new(RegistryShard::default()))
                .collect(),
            per_shard_capacity: max_skus.div_ceil(shards).max(1),
        }
    }

    fn shard_for(&self, sku: &str) -> &Mutex<RegistryShard> {
        let idx = (xxh3_64(sku.as_bytes()) % self.shards.len() as u64) as usize;
        &self.shards[idx]
    }

    /// Run `f` on the state of `sku` with the shard locked, creating the state
    /// with `create` on first sight. Returns `f`'s result and the SKU evicted to
    /// make room, if any.
    pub fn with_sku<R>(
        &self,
        sku: &str,
        now: DateTime<Utc>,
        create: impl FnOnce() -> SkuState,
        pinned: &dyn Fn(&str) -> bool,
        f: impl FnOnce(&mut SkuState, &SkuMeta) -> R,
    ) -> (R, Option<String>) {
        let mut shard = self.shard_for(sku).lock();
        let mut evicted = None;

        if !shard.entries.contains_key(sku) {
            if shard.entries.len() >= self.per_shard_capacity {
                match shard.eviction_candidate(pinned) {
                    Some(victim) => {
                        shard.entries.remove(&victim);
                        shard.evictions += 1;
                        metrics::EVICTIONS_TOTAL.inc();
                        metrics::TRACKED_SKUS.dec();
                        evicted = Some(victim);
                    }
                    None => warn!(sku, "sku shard full and every entry pinned; growing"),
                }
            }
            shard.creations += 1;
            metrics::TRACKED_SKUS.inc();
        }

        let entry = shard
            .entries
            .entry(sku.to_string())
            .or_insert_with(|| SkuEntry {
                state: create(),
                meta: SkuMeta {
                    first_seen: now,
                    last_seen: now,
                    records: 0,
                },
            });
        entry.meta.last_seen = entry.meta.last_seen.max(now);
        entry.meta.records += 1;
        let result = f(&mut entry.state, &entry.meta);
        (result, evicted)
    }

    pub fn get(&self, sku: &str) -> Option<SkuState> {
        self.shard_for(sku).lock().entries.get(sku).map(|e| e.state)
    }

    pub fn meta(&self, sku: &str) -> Option<SkuMeta> {
        self.shard_for(sku).lock().entries.get(sku).map(|e| e.meta)
    }

    pub fn contains(&self, sku: &str) -> bool {
        self.shard_for(sku).lock().entries.contains_key(sku)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for shard in &self.shards {
            let shard = shard.lock();
            stats.tracked += shard.entries.len();
            stats.total_creations += shard.creations;
            stats.total_evictions += shard.evictions;
        }
        stats
    }

    pub fn checkpoint(&self) -> Vec<SkuCheckpoint> {
        self.shards
            .iter()
            .flat_map(|shard| {
                shard
                    .lock()
                    .entries
                    .iter()
                    .map(|(sku, e)| SkuCheckpoint {
                        sku: sku.clone(),
                        state: e.state,
                        meta: e.meta,
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn restore(&self, checkpoints: Vec<SkuCheckpoint>) {
        let count = checkpoints.len();
        for cp in checkpoints {
            self.shard_for(&cp.sku).lock().entries.insert(
                cp.sku,
                SkuEntry {
                    state: cp.state,
                    meta: cp.meta,
                },
            );
        }
        metrics::TRACKED_SKUS.add(count as f64);
    }
}
