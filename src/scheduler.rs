//! MigrationScheduler – probabilistic entity migration along connections.
//!
//! Every `check_interval` the scheduler snapshots the connection list and
//! rolls a d100 per connection. Local migrations commit **destination
//! first, then remove from the source** – a crash between the two can at
//! worst duplicate an entity, never lose one. Remote migrations invert
//! this: the entity leaves the source before the wire send (the wire is
//! the commit point) and is restored on failure.
//!
//! The `no_root_spots` outcome is back-pressure, not an error: the
//! migration aborts silently, no transfer record is written, and the
//! source keeps its entity.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::Utc;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use serde_json::Value;
use uuid::Uuid;

use crate::codec::{TransferContext, TransferRegistry};
use crate::connection::ConnectionStore;
use crate::discovery::DiscoveryService;
use crate::error::{ErrorCode, TransferError};
use crate::history::TransferHistory;
use crate::manager::{WorldInstance, WorldManager};
use crate::peer::{PeerClient, PeerError};
use crate::protocol::RemoteTransferRequest;
use crate::runner::short;
use crate::types::{Connection, EntityId, ServerId, TransferRecord};

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(2);

/// What the source lock handed us: one eligible entity, serialized.
struct PickedEntity {
    old_id: EntityId,
    entity_type: String,
    generation: Option<u32>,
    energy: Option<f64>,
    data: Value,
    selection_seed: u64,
}

/// Serialization failed for the entity the dice picked.
struct PickError {
    old_id: EntityId,
    entity_type: String,
    generation: Option<u32>,
    selection_seed: u64,
    error: TransferError,
}

pub struct MigrationScheduler {
    connections: Arc<ConnectionStore>,
    manager: Arc<WorldManager>,
    history: Arc<TransferHistory>,
    registry: Arc<TransferRegistry>,
    discovery: Option<Arc<DiscoveryService>>,
    peers: Option<Arc<PeerClient>>,
    local_server_id: ServerId,
    check_interval: Duration,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl MigrationScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connections: Arc<ConnectionStore>,
        manager: Arc<WorldManager>,
        history: Arc<TransferHistory>,
        registry: Arc<TransferRegistry>,
        discovery: Option<Arc<DiscoveryService>>,
        peers: Option<Arc<PeerClient>>,
        local_server_id: ServerId,
        check_interval: Duration,
    ) -> Self {
        info!(
            "MigrationScheduler initialized (check_interval={:.1}s)",
            check_interval.as_secs_f32()
        );
        Self {
            connections,
            manager,
            history,
            registry,
            discovery,
            peers,
            local_server_id,
            check_interval,
            task: Mutex::new(None),
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            warn!("Migration scheduler already running");
            return;
        }
        let scheduler = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            scheduler.run_loop().await;
        }));
        info!("Migration scheduler started");
    }

    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
            info!("Migration scheduler stopped");
        }
    }

    async fn run_loop(&self) {
        let mut check_count: u64 = 0;
        loop {
            tokio::time::sleep(self.check_interval).await;
            check_count += 1;

            let connections = self.connections.list();
            if check_count % 6 == 0 {
                debug!(
                    "Migration check #{}: {} active connection(s)",
                    check_count,
                    connections.len()
                );
            }

            // Each connection is independently wrapped: one bad connection
            // never kills the loop.
            for connection in connections {
                self.check_migration(&connection).await;
            }
        }
    }

    /// Run exactly one pass over one connection, dice included. Exposed so
    /// tests can drive the scheduler without the background task.
    pub async fn check_migration(&self, connection: &Connection) {
        let roll = rand::thread_rng().gen_range(1..=100u32);
        if roll > connection.probability as u32 {
            return;
        }
        if connection.is_remote() {
            self.perform_remote_migration(connection).await;
        } else {
            self.perform_local_migration(connection);
        }
    }

    // -----------------------------------------------------------------------
    // Selection
    // -----------------------------------------------------------------------

    /// Pick one migratable entity from the source and serialize it under
    /// the source runner's lock. `Ok(None)` means nothing eligible.
    fn pick_entity(
        &self,
        source: &WorldInstance,
        connection: &Connection,
    ) -> Result<Option<PickedEntity>, PickError> {
        let registry = self.registry.clone();
        let seed = selection_seed(&connection.connection_id);
        let direction = connection.direction;

        source.runner.with_backend(move |backend| {
            let eligible: Vec<usize> = backend
                .entities()
                .iter()
                .enumerate()
                .filter(|(_, e)| registry.is_migratable(e))
                .map(|(i, _)| i)
                .collect();
            if eligible.is_empty() {
                return Ok(None);
            }

            let mut rng = Pcg64::seed_from_u64(seed);
            let index = eligible[rng.gen_range(0..eligible.len())];
            let entity = &backend.entities()[index];

            let ctx = TransferContext {
                migration_direction: Some(direction),
            };
            match registry.try_serialize(entity, &ctx) {
                Ok(data) => Ok(Some(PickedEntity {
                    old_id: entity.id.clone(),
                    entity_type: entity.snapshot_type().to_string(),
                    generation: entity.generation(),
                    energy: entity.energy(),
                    data: Value::Object(data),
                    selection_seed: seed,
                })),
                Err(error) => Err(PickError {
                    old_id: entity.id.clone(),
                    entity_type: entity.snapshot_type().to_string(),
                    generation: entity.generation(),
                    selection_seed: seed,
                    error,
                }),
            }
        })
    }

    // -----------------------------------------------------------------------
    // Local migration
    // -----------------------------------------------------------------------

    fn perform_local_migration(&self, connection: &Connection) {
        let source = self.manager.get(&connection.source_world_id);
        let dest = self.manager.get(&connection.dest_world_id);
        let (Some(source), Some(dest)) = (source, dest) else {
            warn!(
                "Migration failed: world not found (source={}, dest={})",
                short(&connection.source_world_id),
                short(&connection.dest_world_id)
            );
            return;
        };

        // Paused worlds neither emit nor accept migrants.
        if source.runner.paused() || dest.runner.paused() {
            return;
        }

        let picked = match self.pick_entity(&source, connection) {
            Ok(Some(picked)) => picked,
            Ok(None) => return,
            Err(pick) => {
                warn!("Cannot serialize entity for migration: {}", pick.error);
                self.history.log(self.record(
                    connection,
                    &pick.entity_type,
                    pick.old_id,
                    None,
                    &source,
                    Some(&dest),
                    false,
                    Some(pick.error.message),
                    pick.generation,
                    Some(pick.selection_seed),
                ));
                return;
            }
        };

        // Commit at the destination first.
        let registry = self.registry.clone();
        let data = picked.data.clone();
        let commit = dest
            .runner
            .with_backend(move |backend| registry.try_deserialize(&data, backend));

        let new_id = match commit {
            Ok(new_id) => new_id,
            Err(e) if e.code == ErrorCode::NoRootSpots => {
                // Back-pressure: abort silently, no record, source intact.
                return;
            }
            Err(e) => {
                self.history.log(self.record(
                    connection,
                    &picked.entity_type,
                    picked.old_id,
                    None,
                    &source,
                    Some(&dest),
                    false,
                    Some(e.message),
                    picked.generation,
                    Some(picked.selection_seed),
                ));
                return;
            }
        };

        // Then remove the original from the source. A crash between the
        // two steps duplicates; the next full snapshot cycle reconciles.
        let is_fish = picked.entity_type == "fish";
        let energy = picked.energy.unwrap_or(0.0);
        let old_id = picked.old_id.clone();
        let removed = source.runner.with_backend(move |backend| {
            let removed = backend.remove(&old_id).is_some();
            if removed && is_fish {
                backend.record_energy_burn("migration", energy);
            }
            removed
        });
        if !removed {
            debug!(
                "Entity {} vanished from source before removal; destination copy stands",
                picked.old_id
            );
        }
        if is_fish {
            dest.runner
                .with_backend(|backend| backend.record_energy_gain("migration_in", energy));
        }

        source.runner.invalidate_cache();
        dest.runner.invalidate_cache();

        self.history.log(self.record(
            connection,
            &picked.entity_type,
            picked.old_id,
            Some(new_id),
            &source,
            Some(&dest),
            true,
            None,
            picked.generation,
            Some(picked.selection_seed),
        ));
        debug!(
            "Migrated {} from {} to {} (probability={}%)",
            picked.entity_type, source.name, dest.name, connection.probability
        );
    }

    // -----------------------------------------------------------------------
    // Remote migration
    // -----------------------------------------------------------------------

    async fn perform_remote_migration(&self, connection: &Connection) {
        let (Some(discovery), Some(peers)) = (&self.discovery, &self.peers) else {
            warn!("Cannot perform remote migration: discovery service or peer client not available");
            return;
        };

        let Some(source) = self.manager.get(&connection.source_world_id) else {
            warn!(
                "Remote migration failed: source world not found: {}",
                short(&connection.source_world_id)
            );
            return;
        };
        if source.runner.paused() {
            return;
        }

        let picked = match self.pick_entity(&source, connection) {
            Ok(Some(picked)) => picked,
            Ok(None) => return,
            Err(pick) => {
                warn!(
                    "Cannot serialize entity for remote migration: {}",
                    pick.error
                );
                return;
            }
        };

        let dest_server_id = connection.dest_server_id.clone().unwrap_or_default();
        let Some(dest_server) = discovery.get(&dest_server_id) else {
            warn!(
                "Remote migration failed: destination server not found: {}",
                dest_server_id
            );
            self.history.log(self.record(
                connection,
                &picked.entity_type,
                picked.old_id,
                None,
                &source,
                None,
                false,
                Some(ErrorCode::UnknownServer.as_str().to_string()),
                picked.generation,
                Some(picked.selection_seed),
            ));
            return;
        };

        // The wire is the commit point: remove before sending.
        let is_fish = picked.entity_type == "fish";
        let energy = picked.energy.unwrap_or(0.0);
        let old_id = picked.old_id.clone();
        let removed = source.runner.with_backend(move |backend| {
            let removed = backend.remove(&old_id).is_some();
            if removed && is_fish {
                backend.record_energy_burn("migration", energy);
            }
            removed
        });
        if !removed {
            return;
        }
        source.runner.invalidate_cache();

        let request = RemoteTransferRequest {
            destination_world_id: connection.dest_world_id.clone(),
            entity_data: picked.data.clone(),
            source_server_id: self.local_server_id.clone(),
            source_world_id: connection.source_world_id.clone(),
        };
        let outcome = peers.remote_transfer_entity(&dest_server, &request).await;

        match outcome {
            Ok(response) if response.success => {
                info!(
                    "Remote migration: {} from {} to {}:{} (probability={}%)",
                    picked.entity_type,
                    source.name,
                    dest_server_id,
                    short(&connection.dest_world_id),
                    connection.probability
                );
                self.history.log(self.record(
                    connection,
                    &picked.entity_type,
                    picked.old_id,
                    response.entity.and_then(|e| e.new_id),
                    &source,
                    None,
                    true,
                    None,
                    picked.generation,
                    Some(picked.selection_seed),
                ));
            }
            Ok(response) => {
                let error_msg = response
                    .error
                    .unwrap_or_else(|| "unknown error".to_string());
                self.restore_entity(&source, &picked);

                if error_msg == ErrorCode::NoRootSpots.as_str() {
                    // Peer-side back-pressure: restore silently.
                    return;
                }
                warn!("Remote migration failed: {}", error_msg);
                self.history.log(self.record(
                    connection,
                    &picked.entity_type,
                    picked.old_id,
                    None,
                    &source,
                    None,
                    false,
                    Some(error_msg),
                    picked.generation,
                    Some(picked.selection_seed),
                ));
            }
            Err(e) => {
                self.restore_entity(&source, &picked);
                let error_msg = match e {
                    PeerError::Unreachable { .. } => {
                        ErrorCode::UnreachableServer.as_str().to_string()
                    }
                    other => other.to_string(),
                };
                warn!("Remote migration failed: {}", error_msg);
                self.history.log(self.record(
                    connection,
                    &picked.entity_type,
                    picked.old_id,
                    None,
                    &source,
                    None,
                    false,
                    Some(error_msg),
                    picked.generation,
                    Some(picked.selection_seed),
                ));
            }
        }
    }

    /// Put a removed entity back into its source world after a failed
    /// remote send.
    fn restore_entity(&self, source: &WorldInstance, picked: &PickedEntity) {
        let registry = self.registry.clone();
        let data = picked.data.clone();
        let is_fish = picked.entity_type == "fish";
        let energy = picked.energy.unwrap_or(0.0);
        let restored = source.runner.with_backend(move |backend| {
            let restored = registry.try_deserialize(&data, backend);
            if restored.is_ok() && is_fish {
                // Cancel out the burn recorded on removal.
                backend.record_energy_gain("migration_restore", energy);
            }
            restored
        });
        match restored {
            Ok(_) => source.runner.invalidate_cache(),
            Err(e) => error!(
                "Failed to restore entity {} after migration failure: {}",
                picked.old_id, e
            ),
        }
    }

    // -----------------------------------------------------------------------
    // Records
    // -----------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        connection: &Connection,
        entity_type: &str,
        old_id: EntityId,
        new_id: Option<EntityId>,
        source: &WorldInstance,
        dest: Option<&WorldInstance>,
        success: bool,
        error: Option<String>,
        generation: Option<u32>,
        selection_seed: Option<u64>,
    ) -> TransferRecord {
        let (dest_world_id, dest_world_name) = match dest {
            Some(dest) => (dest.world_id.clone(), dest.name.clone()),
            None => {
                let server = connection.dest_server_id.clone().unwrap_or_default();
                (
                    format!("{}:{}", server, connection.dest_world_id),
                    format!("Remote world on {}", server),
                )
            }
        };
        TransferRecord {
            transfer_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now().to_rfc3339(),
            entity_type: entity_type.to_string(),
            entity_old_id: old_id,
            entity_new_id: new_id,
            source_world_id: source.world_id.clone(),
            source_world_name: source.name.clone(),
            dest_world_id,
            dest_world_name,
            success,
            error,
            generation,
            selection_seed,
        }
    }
}

/// Deterministic selection seed from the connection id and the wall-clock
/// second. Stored on the transfer record so runs are reproducible when the
/// seed is known.
fn selection_seed(connection_id: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    connection_id.hash(&mut hasher);
    secs.hash(&mut hasher);
    hasher.finish()
}
