//! TransferHistory – append-only log of migration outcomes.
//!
//! Records live in a bounded in-memory ring (most recent 100) and an
//! append-only JSONL file. At startup the ring is rehydrated from the file
//! tail, best effort: corrupt lines are skipped with a warning.

use std::collections::{HashMap, VecDeque};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::{TransferRecord, WorldId};

/// In-memory ring capacity.
pub const HISTORY_CAP: usize = 100;

/// Per-world migration flow counts derived from the ring.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorldTransferStats {
    pub transfers_in: u64,
    pub transfers_out: u64,
    pub transfers_in_success: u64,
    pub transfers_out_success: u64,
    pub transfers_in_failed: u64,
    pub transfers_out_failed: u64,
}

#[derive(Default)]
struct HistoryInner {
    ring: VecDeque<TransferRecord>,
    migrations_in: HashMap<WorldId, u64>,
    migrations_out: HashMap<WorldId, u64>,
}

pub struct TransferHistory {
    inner: Mutex<HistoryInner>,
    path: PathBuf,
}

impl TransferHistory {
    /// Open the history at `path`, rehydrating the ring from the tail of
    /// the existing log file if there is one.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut inner = HistoryInner::default();

        match fs::read_to_string(&path) {
            Ok(body) => {
                let mut loaded = 0usize;
                for line in body.lines() {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<TransferRecord>(line) {
                        Ok(record) => {
                            if inner.ring.len() == HISTORY_CAP {
                                inner.ring.pop_front();
                            }
                            inner.ring.push_back(record);
                            loaded += 1;
                        }
                        Err(e) => warn!("Failed to parse history line: {}", e),
                    }
                }
                info!("Loaded {} transfer record(s) from history file", loaded);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No transfer history file found, starting fresh");
            }
            Err(e) => error!("Failed to load transfer history: {}", e),
        }

        Self {
            inner: Mutex::new(inner),
            path,
        }
    }

    /// Append a record to the ring and the log file, and bump the per-world
    /// flow counters on success.
    pub fn log(&self, record: TransferRecord) {
        {
            let mut inner = self.inner.lock();
            if inner.ring.len() == HISTORY_CAP {
                inner.ring.pop_front();
            }
            if record.success {
                *inner
                    .migrations_out
                    .entry(record.source_world_id.clone())
                    .or_insert(0) += 1;
                *inner
                    .migrations_in
                    .entry(record.dest_world_id.clone())
                    .or_insert(0) += 1;
            }
            inner.ring.push_back(record.clone());
        }
        self.append_to_file(&record);

        let status = if record.success {
            "success".to_string()
        } else {
            format!("failed: {}", record.error.as_deref().unwrap_or("unknown"))
        };
        debug!(
            "Transfer {} {} {} -> {} ({})",
            record.entity_type,
            record.entity_old_id,
            record.source_world_name,
            record.dest_world_name,
            status
        );
    }

    fn append_to_file(&self, record: &TransferRecord) {
        let result = (|| -> std::io::Result<()> {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            let line = serde_json::to_string(record)?;
            writeln!(file, "{}", line)?;
            Ok(())
        })();
        if let Err(e) = result {
            error!("Failed to write transfer log: {}", e);
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Records from the in-memory ring, most recent first.
    pub fn query(
        &self,
        limit: usize,
        world_id: Option<&str>,
        success_only: bool,
    ) -> Vec<TransferRecord> {
        let inner = self.inner.lock();
        inner
            .ring
            .iter()
            .rev()
            .filter(|r| {
                world_id.map_or(true, |w| r.source_world_id == w || r.dest_world_id == w)
            })
            .filter(|r| !success_only || r.success)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn get(&self, transfer_id: &str) -> Option<TransferRecord> {
        self.inner
            .lock()
            .ring
            .iter()
            .find(|r| r.transfer_id == transfer_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().ring.is_empty()
    }

    /// Flow stats for one world, derived from the current ring contents.
    pub fn world_stats(&self, world_id: &str) -> WorldTransferStats {
        let inner = self.inner.lock();
        let mut stats = WorldTransferStats::default();
        for record in &inner.ring {
            if record.dest_world_id == world_id {
                stats.transfers_in += 1;
                if record.success {
                    stats.transfers_in_success += 1;
                } else {
                    stats.transfers_in_failed += 1;
                }
            }
            if record.source_world_id == world_id {
                stats.transfers_out += 1;
                if record.success {
                    stats.transfers_out_success += 1;
                } else {
                    stats.transfers_out_failed += 1;
                }
            }
        }
        stats
    }

    /// Migrations in/out of a world since the last call, then reset.
    pub fn take_migration_counts(&self, world_id: &str) -> (u64, u64) {
        let mut inner = self.inner.lock();
        let in_count = inner.migrations_in.remove(world_id).unwrap_or(0);
        let out_count = inner.migrations_out.remove(world_id).unwrap_or(0);
        (in_count, out_count)
    }
}
