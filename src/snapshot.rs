//! SnapshotStore – durable, versioned world snapshots.
//!
//! Layout: `<root>/<world_id>/snapshots/snapshot_<YYYYMMDD_HHMMSS>.json`.
//! Writes go to a temp file in the same directory and are atomically
//! renamed into place, so a partially written snapshot is never
//! observable. Saves are serialized per world.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::{TransferContext, TransferRegistry};
use crate::error::SnapshotError;
use crate::manager::WorldInstance;
use crate::runner::{short, WorldRunner};
use crate::types::WorldId;

pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// On-disk document
// ---------------------------------------------------------------------------

/// World identity and policy, as embedded in a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub seed: Option<u64>,
    pub world_type: String,
    #[serde(default = "default_true")]
    pub persistent: bool,
    #[serde(default = "default_true")]
    pub allow_transfers: bool,
}

fn default_true() -> bool {
    true
}

/// Ecosystem counters carried across restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EcosystemCounters {
    pub births: u64,
    pub deaths: u64,
    pub generation: u32,
    #[serde(default)]
    pub death_causes: HashMap<String, u64>,
}

/// The versioned snapshot document. Immutable after write: `frame` and
/// `entities` always describe the same tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldSnapshot {
    pub schema_version: u32,
    pub world_id: WorldId,
    pub saved_at: String,
    pub frame: u64,
    pub metadata: SnapshotMetadata,
    pub entities: Vec<Value>,
    #[serde(default)]
    pub ecosystem: EcosystemCounters,
    #[serde(default)]
    pub paused: bool,
}

/// Header-level description of one snapshot file, for listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub filename: String,
    pub filepath: String,
    pub saved_at: String,
    pub frame: u64,
    pub entity_count: usize,
    pub size_bytes: u64,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct SnapshotStore {
    root: PathBuf,
    registry: Arc<TransferRegistry>,
    /// One save at a time per world.
    write_locks: Mutex<HashMap<WorldId, Arc<Mutex<()>>>>,
}

impl SnapshotStore {
    /// `root` is the `data/worlds` directory.
    pub fn new(root: impl Into<PathBuf>, registry: Arc<TransferRegistry>) -> Self {
        Self {
            root: root.into(),
            registry,
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    fn world_dir(&self, world_id: &str) -> PathBuf {
        self.root.join(world_id).join("snapshots")
    }

    fn write_lock_for(&self, world_id: &str) -> Arc<Mutex<()>> {
        self.write_locks
            .lock()
            .entry(world_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // -----------------------------------------------------------------------
    // Save
    // -----------------------------------------------------------------------

    /// Capture and persist the instance's current state. Returns the
    /// snapshot path, or `None` with the failure logged.
    pub fn save(&self, instance: &WorldInstance) -> Option<PathBuf> {
        let registry = self.registry.clone();
        let ctx = TransferContext::default();

        // Capture entities and counters under the runner lock, then write
        // outside it.
        let (entities, counters, frame, paused) =
            instance
                .runner
                .with_world_state(|backend, frame, paused| {
                    let mut entities = Vec::new();
                    for entity in backend.entities() {
                        match registry.try_serialize(entity, &ctx) {
                            Ok(data) => entities.push(Value::Object(data)),
                            Err(e) => debug!(
                                "Skipping {} in snapshot of {}: {}",
                                entity.snapshot_type(),
                                short(&instance.world_id),
                                e
                            ),
                        }
                    }
                    let eco = backend.stats();
                    let counters = EcosystemCounters {
                        births: eco.births,
                        deaths: eco.deaths,
                        generation: eco.generation,
                        death_causes: eco.death_causes.clone(),
                    };
                    (entities, counters, frame, paused)
                });

        let snapshot = WorldSnapshot {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            world_id: instance.world_id.clone(),
            saved_at: Utc::now().to_rfc3339(),
            frame,
            metadata: SnapshotMetadata {
                name: instance.name.clone(),
                description: instance.description.clone(),
                seed: instance.seed,
                world_type: instance.world_type.clone(),
                persistent: instance.persistent,
                allow_transfers: instance.allow_transfers,
            },
            entities,
            ecosystem: counters,
            paused,
        };

        match self.write_snapshot(&snapshot) {
            Ok(path) => {
                info!(
                    "Saved world {} to {} ({} entities at frame {})",
                    short(&instance.world_id),
                    path.file_name().and_then(|n| n.to_str()).unwrap_or("?"),
                    snapshot.entities.len(),
                    frame
                );
                Some(path)
            }
            Err(e) => {
                error!(
                    "Failed to save world {}: {}",
                    short(&instance.world_id),
                    e
                );
                None
            }
        }
    }

    fn write_snapshot(&self, snapshot: &WorldSnapshot) -> std::io::Result<PathBuf> {
        let dir = self.world_dir(&snapshot.world_id);
        fs::create_dir_all(&dir)?;

        let filename = format!("snapshot_{}.json", Utc::now().format("%Y%m%d_%H%M%S"));
        let path = dir.join(&filename);
        let tmp = dir.join(format!("{}.tmp", filename));

        let lock = self.write_lock_for(&snapshot.world_id);
        let _guard = lock.lock();

        let body = serde_json::to_vec_pretty(snapshot)?;
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &path)?;
        Ok(path)
    }

    // -----------------------------------------------------------------------
    // Load & restore
    // -----------------------------------------------------------------------

    /// Parse and validate a snapshot file. Distinguishes a missing file
    /// from a corrupt or incomplete one.
    pub fn load(&self, path: &Path) -> Result<WorldSnapshot, SnapshotError> {
        let body = match fs::read(path) {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SnapshotError::Missing(path.to_path_buf()))
            }
            Err(e) => return Err(SnapshotError::Io(e)),
        };

        let value: Value = serde_json::from_slice(&body).map_err(|source| {
            SnapshotError::Corrupt {
                path: path.to_path_buf(),
                source,
            }
        })?;
        for field in ["schema_version", "world_id", "frame", "metadata", "entities"] {
            if value.get(field).is_none() {
                return Err(SnapshotError::MissingField(field));
            }
        }
        serde_json::from_value(value).map_err(|source| SnapshotError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Restore a snapshot into `runner`'s backend.
    ///
    /// Entities deserialize in two passes: everything except nectar first,
    /// then nectar with its `source_plant_id` rewritten to the freshly
    /// assigned plant ids. Returns false on error, leaving the backend
    /// empty but consistent.
    pub fn restore(&self, snapshot: &WorldSnapshot, runner: &WorldRunner) -> bool {
        let registry = self.registry.clone();
        let restored = runner.with_backend(|backend| {
            backend.clear();

            let mut plants_by_old_id: HashMap<String, String> = HashMap::new();
            let mut restored_count = 0usize;

            // Pass 1: non-dependent entities.
            for data in &snapshot.entities {
                let entity_type = data.get("type").and_then(Value::as_str).unwrap_or("");
                if entity_type == "nectar" {
                    continue;
                }
                let old_id = data
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                match registry.try_deserialize(data, backend) {
                    Ok(new_id) => {
                        restored_count += 1;
                        if entity_type == "plant" {
                            plants_by_old_id.insert(old_id, new_id);
                        }
                    }
                    Err(e) => {
                        error!(
                            "Failed to restore {} in world {}: {}",
                            entity_type,
                            short(&snapshot.world_id),
                            e
                        );
                        backend.clear();
                        return None;
                    }
                }
            }

            // Pass 2: nectar, resolving parent plants by their new ids.
            for data in &snapshot.entities {
                if data.get("type").and_then(Value::as_str) != Some("nectar") {
                    continue;
                }
                let old_plant_id = data
                    .get("source_plant_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let Some(new_plant_id) = plants_by_old_id.get(old_plant_id) else {
                    warn!(
                        "Skipping nectar restoration: missing source plant {}",
                        old_plant_id
                    );
                    continue;
                };
                let mut rewritten = data.clone();
                if let Some(map) = rewritten.as_object_mut() {
                    map.insert("source_plant_id".into(), Value::from(new_plant_id.clone()));
                }
                match registry.try_deserialize(&rewritten, backend) {
                    Ok(_) => restored_count += 1,
                    Err(e) => {
                        error!(
                            "Failed to restore nectar in world {}: {}",
                            short(&snapshot.world_id),
                            e
                        );
                        backend.clear();
                        return None;
                    }
                }
            }

            let eco = backend.stats_mut();
            eco.births = snapshot.ecosystem.births;
            eco.deaths = snapshot.ecosystem.deaths;
            eco.generation = snapshot.ecosystem.generation;
            eco.death_causes = snapshot.ecosystem.death_causes.clone();

            Some(restored_count)
        });

        match restored {
            Some(count) => {
                runner.mark_restored(snapshot.frame, snapshot.paused);
                info!(
                    "Restored world {} to frame {} ({} entities)",
                    short(&snapshot.world_id),
                    snapshot.frame,
                    count
                );
                true
            }
            None => false,
        }
    }

    // -----------------------------------------------------------------------
    // Listing, retention, discovery
    // -----------------------------------------------------------------------

    /// Snapshot headers for one world, newest first.
    pub fn list(&self, world_id: &str) -> Vec<SnapshotInfo> {
        let dir = self.world_dir(world_id);
        let Ok(entries) = fs::read_dir(&dir) else {
            return Vec::new();
        };

        let mut infos = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !filename.starts_with("snapshot_") || !filename.ends_with(".json") {
                continue;
            }
            match self.load(&path) {
                Ok(snapshot) => infos.push(SnapshotInfo {
                    filename: filename.to_string(),
                    filepath: path.to_string_lossy().to_string(),
                    saved_at: snapshot.saved_at,
                    frame: snapshot.frame,
                    entity_count: snapshot.entities.len(),
                    size_bytes: entry.metadata().map(|m| m.len()).unwrap_or(0),
                }),
                Err(e) => {
                    warn!("Failed to read snapshot {}: {}", filename, e);
                }
            }
        }
        // Timestamped filenames sort chronologically.
        infos.sort_by(|a, b| b.filename.cmp(&a.filename));
        infos
    }

    /// Delete all but the newest `max_keep` snapshots for a world.
    pub fn retain(&self, world_id: &str, max_keep: usize) -> usize {
        let snapshots = self.list(world_id);
        if snapshots.len() <= max_keep {
            return 0;
        }
        let mut deleted = 0;
        for info in &snapshots[max_keep..] {
            match fs::remove_file(&info.filepath) {
                Ok(()) => deleted += 1,
                Err(e) => warn!("Failed to delete snapshot {}: {}", info.filename, e),
            }
        }
        if deleted > 0 {
            info!(
                "Cleaned up {} old snapshot(s) for world {}",
                deleted,
                short(world_id)
            );
        }
        deleted
    }

    /// Latest snapshot path per world, by scanning the store root. Lets
    /// startup rehydrate without a separate manifest.
    pub fn discover_all(&self) -> HashMap<WorldId, PathBuf> {
        let mut found = HashMap::new();
        let Ok(entries) = fs::read_dir(&self.root) else {
            return found;
        };
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let Some(world_id) = entry.file_name().to_str().map(String::from) else {
                continue;
            };
            if let Some(latest) = self.list(&world_id).first() {
                found.insert(world_id, PathBuf::from(&latest.filepath));
            }
        }
        info!("Found {} world(s) with saved snapshots", found.len());
        found
    }

    pub fn registry(&self) -> &Arc<TransferRegistry> {
        &self.registry
    }
}
