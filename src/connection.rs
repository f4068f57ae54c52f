//! ConnectionStore – the set of directed migration links between worlds.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use log::{debug, error, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::runner::short;
use crate::types::{Connection, ServerId, WorldId};

#[derive(Debug, Default, Serialize, Deserialize)]
struct ConnectionFile {
    connections: Vec<Connection>,
}

/// Mutex-guarded `connection_id → Connection` map, persisted as a single
/// JSON file with temp-file + atomic-rename writes.
pub struct ConnectionStore {
    connections: Mutex<HashMap<String, Connection>>,
    path: PathBuf,
}

impl ConnectionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            path: path.into(),
        }
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    /// Add or update a connection. At most one connection exists per
    /// ordered `(source, dest)` pair – an existing connection on the same
    /// pair is replaced. The reverse pair is untouched.
    pub fn add(&self, mut connection: Connection) {
        connection.ensure_id();
        let mut connections = self.connections.lock();

        let pair = connection.pair_key();
        let duplicates: Vec<String> = connections
            .values()
            .filter(|c| c.pair_key() == pair)
            .map(|c| c.connection_id.clone())
            .collect();
        for id in duplicates {
            connections.remove(&id);
            info!("Removed duplicate connection {} (same direction)", id);
        }

        info!(
            "Added connection: {} -> {} ({}%, {})",
            short(&connection.source_world_id),
            short(&connection.dest_world_id),
            connection.probability,
            connection.direction
        );
        connections.insert(connection.connection_id.clone(), connection);
    }

    pub fn remove(&self, connection_id: &str) -> bool {
        match self.connections.lock().remove(connection_id) {
            Some(conn) => {
                info!(
                    "Removed connection: {} -> {}",
                    short(&conn.source_world_id),
                    short(&conn.dest_world_id)
                );
                true
            }
            None => false,
        }
    }

    /// Remove every connection in which the world appears in either role.
    /// Used when a world is deleted.
    pub fn clear_for_world(&self, world_id: &str) -> usize {
        let mut connections = self.connections.lock();
        let to_remove: Vec<String> = connections
            .values()
            .filter(|c| c.source_world_id == world_id || c.dest_world_id == world_id)
            .map(|c| c.connection_id.clone())
            .collect();
        for id in &to_remove {
            connections.remove(id);
        }
        if !to_remove.is_empty() {
            info!(
                "Cleared {} connection(s) for world {}",
                to_remove.len(),
                short(world_id)
            );
        }
        to_remove.len()
    }

    /// Remove connections where **both** endpoints are local and at least
    /// one endpoint is not in `valid_world_ids`. Remote endpoints are never
    /// treated as invalid – this server cannot say whether a world exists
    /// on another server.
    pub fn validate(&self, valid_world_ids: &[WorldId], local_server_id: &ServerId) -> usize {
        let valid: std::collections::HashSet<&WorldId> = valid_world_ids.iter().collect();
        let mut connections = self.connections.lock();

        let is_local =
            |server_id: &Option<ServerId>| server_id.as_ref().map_or(true, |s| s == local_server_id);

        let to_remove: Vec<String> = connections
            .values()
            .filter(|c| {
                if !is_local(&c.source_server_id) || !is_local(&c.dest_server_id) {
                    debug!(
                        "Preserving remote connection: {} -> {}",
                        short(&c.source_world_id),
                        short(&c.dest_world_id)
                    );
                    return false;
                }
                !valid.contains(&c.source_world_id) || !valid.contains(&c.dest_world_id)
            })
            .map(|c| c.connection_id.clone())
            .collect();

        for id in &to_remove {
            if let Some(conn) = connections.remove(id) {
                info!(
                    "Removed invalid local connection: {} -> {} (referenced missing world)",
                    short(&conn.source_world_id),
                    short(&conn.dest_world_id)
                );
            }
        }
        to_remove.len()
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn get(&self, connection_id: &str) -> Option<Connection> {
        self.connections.lock().get(connection_id).cloned()
    }

    pub fn list(&self) -> Vec<Connection> {
        self.connections.lock().values().cloned().collect()
    }

    /// Connections whose *source* is the given world – the scheduler's
    /// primary query.
    pub fn for_world(
        &self,
        world_id: &str,
        direction: Option<crate::types::Direction>,
    ) -> Vec<Connection> {
        self.connections
            .lock()
            .values()
            .filter(|c| c.source_world_id == world_id)
            .filter(|c| direction.map_or(true, |d| c.direction == d))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Persist the full set atomically. Errors are logged, not raised – a
    /// failed save never takes down a caller.
    pub fn save(&self) -> bool {
        let snapshot = ConnectionFile {
            connections: self.list(),
        };
        let result = (|| -> std::io::Result<()> {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            let tmp = self.path.with_extension("tmp");
            fs::write(&tmp, serde_json::to_vec_pretty(&snapshot)?)?;
            fs::rename(&tmp, &self.path)?;
            Ok(())
        })();
        match result {
            Ok(()) => {
                debug!("Saved {} connection(s)", snapshot.connections.len());
                true
            }
            Err(e) => {
                error!("Failed to save connections: {}", e);
                false
            }
        }
    }

    /// Load the persisted set, replacing the in-memory map. Returns the
    /// number of connections restored.
    pub fn load(&self) -> usize {
        let body = match fs::read(&self.path) {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No existing connection file found");
                return 0;
            }
            Err(e) => {
                error!("Failed to read connection file: {}", e);
                return 0;
            }
        };
        let file: ConnectionFile = match serde_json::from_slice(&body) {
            Ok(file) => file,
            Err(e) => {
                error!("Failed to parse connection file: {}", e);
                return 0;
            }
        };

        let mut connections = self.connections.lock();
        connections.clear();
        for mut conn in file.connections {
            conn.ensure_id();
            connections.insert(conn.connection_id.clone(), conn);
        }
        info!("Restored {} connection(s)", connections.len());
        connections.len()
    }
}
