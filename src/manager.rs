//! WorldManager – process-wide registry of world instances.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{info, warn};
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use crate::backend::{create_backend, world_type_meta};
use crate::error::WorldError;
use crate::runner::{short, RunnerConfig, WorldRunner};
use crate::types::{WorldId, WorldStatus};

// ---------------------------------------------------------------------------
// World instance
// ---------------------------------------------------------------------------

/// One hosted world: identity and policy, plus the runner that owns the
/// backend. The manager owns instances; everything else holds `Arc`s.
pub struct WorldInstance {
    pub world_id: WorldId,
    pub world_type: String,
    pub mode_id: String,
    pub name: String,
    pub description: String,
    pub persistent: bool,
    pub allow_transfers: bool,
    pub seed: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub runner: Arc<WorldRunner>,
}

impl WorldInstance {
    pub fn status(&self) -> WorldStatus {
        WorldStatus {
            world_id: self.world_id.clone(),
            world_type: self.world_type.clone(),
            mode_id: self.mode_id.clone(),
            name: self.name.clone(),
            view_mode: self.runner.view_mode().to_string(),
            frame_count: self.runner.frame_count(),
            paused: self.runner.paused(),
            persistent: self.persistent,
            created_at: self.created_at.to_rfc3339(),
            description: self.description.clone(),
        }
    }
}

/// Options for [`WorldManager::create`].
#[derive(Debug, Clone, Default)]
pub struct CreateWorldOptions {
    pub config: Option<Value>,
    pub seed: Option<u64>,
    pub persistent: bool,
    pub description: String,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Registry of all active worlds. Creation rejects unknown world types;
/// deleting the last world is permitted.
pub struct WorldManager {
    worlds: RwLock<HashMap<WorldId, Arc<WorldInstance>>>,
    default_world_id: RwLock<Option<WorldId>>,
    runner_config: RunnerConfig,
}

impl WorldManager {
    pub fn new(runner_config: RunnerConfig) -> Self {
        Self {
            worlds: RwLock::new(HashMap::new()),
            default_world_id: RwLock::new(None),
            runner_config,
        }
    }

    /// Create a world with a fresh UUID id. The runner is *not* started –
    /// callers decide when the tick loop begins.
    pub fn create(
        &self,
        world_type: &str,
        name: impl Into<String>,
        options: CreateWorldOptions,
    ) -> Result<Arc<WorldInstance>, WorldError> {
        self.create_with_id(Uuid::new_v4().to_string(), world_type, name, options)
    }

    /// Create a world under a caller-chosen id (snapshot restore keeps the
    /// persisted world id stable across restarts).
    pub fn create_with_id(
        &self,
        world_id: WorldId,
        world_type: &str,
        name: impl Into<String>,
        options: CreateWorldOptions,
    ) -> Result<Arc<WorldInstance>, WorldError> {
        let meta = world_type_meta(world_type).ok_or_else(|| WorldError::UnknownType {
            requested: world_type.to_string(),
            known: crate::backend::world_type_registry()
                .into_iter()
                .map(|m| m.world_type)
                .collect(),
        })?;

        let mut persistent = options.persistent;
        if persistent && !meta.supports_persistence {
            warn!(
                "World type '{}' does not support persistence; creating as non-persistent",
                world_type
            );
            persistent = false;
        }

        let allow_transfers = meta.supports_transfer
            && options
                .config
                .as_ref()
                .and_then(|c| c.get("allow_transfers"))
                .and_then(Value::as_bool)
                .unwrap_or(true);

        let backend = create_backend(world_type, options.seed, options.config.as_ref())?;
        let runner = Arc::new(WorldRunner::new(
            world_id.clone(),
            backend,
            meta.mode_id.clone(),
            meta.view_mode.clone(),
            self.runner_config.clone(),
        ));

        let instance = Arc::new(WorldInstance {
            world_id: world_id.clone(),
            world_type: world_type.to_string(),
            mode_id: meta.mode_id,
            name: name.into(),
            description: options.description,
            persistent,
            allow_transfers,
            seed: options.seed,
            created_at: Utc::now(),
            runner,
        });

        self.worlds.write().insert(world_id.clone(), instance.clone());
        let mut default = self.default_world_id.write();
        if default.is_none() {
            *default = Some(world_id.clone());
        }
        info!("Created {} world {} ({})", world_type, short(&world_id), instance.name);
        Ok(instance)
    }

    pub fn get(&self, world_id: &str) -> Option<Arc<WorldInstance>> {
        self.worlds.read().get(world_id).cloned()
    }

    /// Lookup by id, falling back to the default world when `world_id` is
    /// `None`.
    pub fn get_or_default(&self, world_id: Option<&str>) -> Option<Arc<WorldInstance>> {
        match world_id {
            Some(id) => self.get(id),
            None => {
                let default = self.default_world_id.read().clone()?;
                self.get(&default)
            }
        }
    }

    pub fn list(&self, world_type: Option<&str>) -> Vec<WorldStatus> {
        let mut statuses: Vec<WorldStatus> = self
            .worlds
            .read()
            .values()
            .filter(|w| world_type.map_or(true, |t| w.world_type == t))
            .map(|w| w.status())
            .collect();
        statuses.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        statuses
    }

    pub fn iter(&self) -> Vec<Arc<WorldInstance>> {
        self.worlds.read().values().cloned().collect()
    }

    pub fn world_ids(&self) -> Vec<WorldId> {
        self.worlds.read().keys().cloned().collect()
    }

    pub fn world_count(&self) -> usize {
        self.worlds.read().len()
    }

    pub fn default_world_id(&self) -> Option<WorldId> {
        self.default_world_id.read().clone()
    }

    pub fn set_default(&self, world_id: WorldId) {
        *self.default_world_id.write() = Some(world_id);
    }

    /// Remove a world from the registry, returning the instance so the
    /// caller can stop its runner, clear its connections and close its
    /// broadcast entry. Deleting the last world leaves an empty registry.
    pub fn delete(&self, world_id: &str) -> Option<Arc<WorldInstance>> {
        let removed = self.worlds.write().remove(world_id)?;
        let mut default = self.default_world_id.write();
        if default.as_deref() == Some(world_id) {
            *default = self.worlds.read().keys().next().cloned();
        }
        info!("Deleted world {}", short(world_id));
        Some(removed)
    }
}
