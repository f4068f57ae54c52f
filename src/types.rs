//! Core model types shared across all modules.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Stable identifier of one world instance (UUID or short slug).
pub type WorldId = String;

/// Stable identifier of one server in the mesh.
pub type ServerId = String;

/// Identifier of an entity, unique **within** one world only. Migration
/// allocates a fresh id at the destination.
pub type EntityId = String;

// ---------------------------------------------------------------------------
// Server registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Online,
    Degraded,
    Offline,
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerStatus::Online => write!(f, "online"),
            ServerStatus::Degraded => write!(f, "degraded"),
            ServerStatus::Offline => write!(f, "offline"),
        }
    }
}

/// One peer in the mesh, as exchanged over the discovery endpoints.
///
/// Created on first registration, mutated on each heartbeat. Heartbeat
/// timestamps live in the discovery registry, not here – a `ServerInfo` is
/// a lookup key, never ownership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub server_id: ServerId,
    pub host: String,
    pub port: u16,
    pub hostname: String,
    pub status: ServerStatus,
    pub version: String,
    pub world_count: usize,
    pub is_local: bool,
    #[serde(default)]
    pub uptime_seconds: f64,
}

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Left,
    Right,
}

impl Default for Direction {
    fn default() -> Self {
        Direction::Right
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Left => write!(f, "left"),
            Direction::Right => write!(f, "right"),
        }
    }
}

/// A directed probabilistic migration link between two worlds.
///
/// Both endpoints may live on this server (local connection) or on two
/// different servers (remote connection). At most one connection exists per
/// ordered `(source, dest)` pair; the reverse pair is independent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    #[serde(default)]
    pub connection_id: String,
    pub source_world_id: WorldId,
    pub dest_world_id: WorldId,
    /// Percentage chance of a migration per scheduler check (0–100).
    #[serde(default = "default_probability")]
    pub probability: u8,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_server_id: Option<ServerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_server_id: Option<ServerId>,
}

fn default_probability() -> u8 {
    25
}

impl Connection {
    pub fn new(source: impl Into<WorldId>, dest: impl Into<WorldId>, probability: u8) -> Self {
        let source = source.into();
        let dest = dest.into();
        Self {
            connection_id: format!("{}->{}", source, dest),
            source_world_id: source,
            dest_world_id: dest,
            probability,
            direction: Direction::default(),
            source_server_id: None,
            dest_server_id: None,
        }
    }

    /// Fill in the default `"{source}->{dest}"` id when none was supplied.
    pub fn ensure_id(&mut self) {
        if self.connection_id.is_empty() {
            self.connection_id = format!("{}->{}", self.source_world_id, self.dest_world_id);
        }
    }

    /// A connection is remote iff both server ids are set and differ.
    pub fn is_remote(&self) -> bool {
        match (&self.source_server_id, &self.dest_server_id) {
            (Some(src), Some(dst)) => src != dst,
            _ => false,
        }
    }

    /// Uniqueness key: the ordered `(source, dest)` pair.
    pub fn pair_key(&self) -> (WorldId, WorldId) {
        (self.source_world_id.clone(), self.dest_world_id.clone())
    }
}

// ---------------------------------------------------------------------------
// Transfer records
// ---------------------------------------------------------------------------

/// Outcome of one entity transfer, successful or not. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRecord {
    pub transfer_id: String,
    /// ISO-8601 UTC timestamp.
    pub timestamp: String,
    pub entity_type: String,
    pub entity_old_id: EntityId,
    pub entity_new_id: Option<EntityId>,
    pub source_world_id: WorldId,
    pub source_world_name: String,
    pub dest_world_id: WorldId,
    pub dest_world_name: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<u32>,
    /// Seed used to pick the migrating entity, for reproducible runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_seed: Option<u64>,
}

// ---------------------------------------------------------------------------
// World status & type metadata
// ---------------------------------------------------------------------------

/// Point-in-time status of a world instance, as returned by the HTTP API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldStatus {
    pub world_id: WorldId,
    pub world_type: String,
    pub mode_id: String,
    pub name: String,
    pub view_mode: String,
    pub frame_count: u64,
    pub paused: bool,
    pub persistent: bool,
    pub created_at: String,
    #[serde(default)]
    pub description: String,
}

/// Static capabilities of one registered world type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldTypeMeta {
    pub mode_id: String,
    pub world_type: String,
    pub view_mode: String,
    pub display_name: String,
    pub supports_persistence: bool,
    pub supports_actions: bool,
    pub supports_websocket: bool,
    pub supports_transfer: bool,
}
