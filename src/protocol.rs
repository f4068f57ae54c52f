//! State-frame and transfer wire protocol.
//!
//! This module owns **every message that crosses the process boundary**
//! between a world runner and any consumer (browser WebSocket, another
//! server, the HTTP API).
//!
//! ## Frame kinds
//!
//! | `type`    | Direction          | Contents                                |
//! |-----------|--------------------|-----------------------------------------|
//! | `update`  | server → client    | Full self-contained world state         |
//! | `delta`   | server → client    | Changes since the previous emission     |
//! | command   | client → server    | `{command, data?}` JSON text frame      |
//!
//! ## Design rules
//!
//! 1. Every struct is `Serialize + Deserialize` with snake_case JSON.
//! 2. No backend-internal types leak out (`EntityState`, root spot indexes…).
//! 3. Every outbound frame carries `frame: u64` and `world_id`.
//! 4. Optional fields are omitted, not null, so delta frames stay small.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{EntityId, ServerId, WorldId};

// ---------------------------------------------------------------------------
// Entity frames
// ---------------------------------------------------------------------------

/// Full per-entity payload used on `update` frames and in the `added` list
/// of `delta` frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityFrame {
    pub id: EntityId,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub x: f32,
    pub y: f32,
    #[serde(default)]
    pub vel_x: f32,
    #[serde(default)]
    pub vel_y: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_energy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub species: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub food_type: Option<String>,
    /// For nectar: the plant this nectar blob belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_plant_id: Option<EntityId>,
}

impl EntityFrame {
    /// Fast-changing subset carried on every delta frame.
    pub fn to_delta(&self) -> DeltaEntityFrame {
        DeltaEntityFrame {
            id: self.id.clone(),
            x: self.x,
            y: self.y,
            vel_x: self.vel_x,
            vel_y: self.vel_y,
            energy: self.energy,
        }
    }
}

/// Fast-changing fields of one entity, for `delta` frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaEntityFrame {
    pub id: EntityId,
    pub x: f32,
    pub y: f32,
    #[serde(default)]
    pub vel_x: f32,
    #[serde(default)]
    pub vel_y: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy: Option<f64>,
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Ecosystem statistics included in both frame kinds. Expensive extras
/// (event lists, leaderboards) ride only on full frames.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsPayload {
    pub frame: u64,
    pub population: usize,
    /// Entity counts keyed by snapshot type (`fish`, `plant`, …).
    #[serde(default)]
    pub counts: HashMap<String, usize>,
    pub births: u64,
    pub deaths: u64,
    pub generation: u32,
    #[serde(default)]
    pub death_causes: HashMap<String, u64>,
    pub total_energy: f64,
    #[serde(default)]
    pub energy_gains: HashMap<String, f64>,
    #[serde(default)]
    pub energy_burns: HashMap<String, f64>,
    #[serde(default)]
    pub fast_forward: bool,
}

// ---------------------------------------------------------------------------
// State frames
// ---------------------------------------------------------------------------

fn update_tag() -> String {
    "update".to_string()
}

fn delta_tag() -> String {
    "delta".to_string()
}

/// Full snapshot with complete entity data. Self-contained: a client can
/// render from this frame alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullStatePayload {
    #[serde(rename = "type", default = "update_tag")]
    pub tag: String,
    pub frame: u64,
    pub elapsed_time: u64,
    pub entities: Vec<EntityFrame>,
    pub stats: StatsPayload,
    /// World-type-specific events (opaque to the core).
    #[serde(default)]
    pub events: Vec<Value>,
    #[serde(default)]
    pub leaderboard: Vec<Value>,
    pub world_id: WorldId,
    pub mode_id: String,
    pub world_type: String,
    pub view_mode: String,
}

/// Delta update that only carries incremental changes relative to the
/// previous emission. Event lists are deliberately omitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaStatePayload {
    #[serde(rename = "type", default = "delta_tag")]
    pub tag: String,
    pub frame: u64,
    pub elapsed_time: u64,
    pub updates: Vec<DeltaEntityFrame>,
    pub added: Vec<EntityFrame>,
    pub removed: Vec<EntityId>,
    pub stats: StatsPayload,
    pub world_id: WorldId,
    pub mode_id: String,
    pub world_type: String,
    pub view_mode: String,
}

/// Either frame kind, as handed to the broadcast layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatePayload {
    Full(FullStatePayload),
    Delta(DeltaStatePayload),
}

impl StatePayload {
    pub fn frame(&self) -> u64 {
        match self {
            StatePayload::Full(p) => p.frame,
            StatePayload::Delta(p) => p.frame,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, StatePayload::Full(_))
    }

    /// Canonical JSON as a UTF-8 byte string.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

// ---------------------------------------------------------------------------
// Client commands (WebSocket, text frames)
// ---------------------------------------------------------------------------

/// Command sent by a client over the WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientCommand {
    pub command: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// Error frame sent to a client without closing the connection.
pub fn ws_error_frame(message: impl Into<String>) -> Value {
    serde_json::json!({ "success": false, "error": message.into() })
}

// ---------------------------------------------------------------------------
// Cross-server transfer messages
// ---------------------------------------------------------------------------

/// Body of `POST /api/remote-transfer` – one serialized entity arriving
/// from a peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteTransferRequest {
    pub destination_world_id: WorldId,
    pub entity_data: Value,
    pub source_server_id: ServerId,
    pub source_world_id: WorldId,
}

/// Identity of a transferred entity as reported back to the sender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferredEntity {
    pub old_id: EntityId,
    pub new_id: Option<EntityId>,
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_server: Option<ServerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_world: Option<WorldId>,
    pub destination_world: WorldId,
}

/// Outcome of a remote transfer, as returned by the peer. Error bodies
/// (409 back-pressure, 403 policy) omit `success`, so it defaults to false.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteTransferResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<TransferredEntity>,
}
