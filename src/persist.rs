//! Checkpointing of cache entries and destination counters.
//!
//! A checkpoint is a single JSON document. Only state that survives a
//! process boundary is written: cached pages keep their wall-clock stamp and
//! TTL, destinations keep their lifetime counters. Open circuits, leases and
//! in-flight windows are not persisted; they re-learn from
//! live traffic.

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::budget::DestinationRegistry;
use crate::cache::ResultCache;

/// One checkpointed result page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedPage {
    pub key: String,
    pub html: String,
    pub stored_at: SystemTime,
    pub ttl: Duration,
}

/// Lifetime counters for one destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationCounters {
    pub destination: String,
    pub requests: u64,
    pub blocks: u64,
}

/// On-disk snapshot of restorable searcher state.
#[derive(Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    pub saved_at: SystemTime,
    pub cache: Vec<CachedPage>,
    pub destinations: Vec<DestinationCounters>,
}

impl Checkpoint {
    /// Capture the current cache contents and destination counters.
    pub fn capture(cache: &ResultCache, registry: &DestinationRegistry) -> Self {
        let cache = cache
            .export()
            .into_iter()
            .map(|(key, html, stored_at, ttl)| CachedPage {
                key,
                html: html.as_str().to_string(),
                stored_at,
                ttl,
            })
            .collect();
        let destinations = registry
            .snapshot()
            .into_iter()
            .map(|(destination, snap)| DestinationCounters {
                destination,
                requests: snap.requests,
                blocks: snap.blocks,
            })
            .collect();
        Self {
            saved_at: SystemTime::now(),
            cache,
            destinations,
        }
    }

    /// Apply a checkpoint, skipping entries that expired while the process
    /// was down. Returns the number of cache entries restored.
    pub fn apply(&self, cache: &ResultCache, registry: &DestinationRegistry) -> usize {
        let mut restored = 0;
        for page in &self.cache {
            if cache.restore(page.key.clone(), page.html.clone(), page.stored_at, page.ttl) {
                restored += 1;
            } else {
                debug!("Skipping expired checkpoint entry {}", page.key);
            }
        }
        for counters in &self.destinations {
            registry.restore_counters(&counters.destination, counters.requests, counters.blocks);
        }
        info!(
            "Restored {restored}/{} cache entries and {} destinations from checkpoint",
            self.cache.len(),
            self.destinations.len()
        );
        restored
    }
}

/// Write a checkpoint to disk as JSON.
pub fn save(path: &Path, checkpoint: &Checkpoint) -> anyhow::Result<()> {
    let json = serde_json::to_string(checkpoint).context("failed to serialize checkpoint")?;
    fs::write(path, json)
        .with_context(|| format!("failed to write checkpoint to {}", path.display()))?;
    debug!(
        "Checkpointed {} cache entries to {}",
        checkpoint.cache.len(),
        path.display()
    );
    Ok(())
}

/// Read a checkpoint from disk.
pub fn load(path: &Path) -> anyhow::Result<Checkpoint> {
    let json = fs::read_to_string(path)
        .with_context(|| format!("failed to read checkpoint from {}", path.display()))?;
    serde_json::from_str(&json).context("failed to parse checkpoint")
}
