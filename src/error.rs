//! Error taxonomy.
//!
//! The string codes in [`ErrorCode`] are part of the wire contract with
//! peers and with transfer codecs – they must stay stable across versions.
//! Within a component, richer `thiserror` enums are fine; every call that
//! crosses a component boundary returns either a value or a tagged
//! [`TransferError`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Stable codes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Unknown world type or codec type.
    UnknownType,
    /// Serialized entity without a `type` field.
    MissingType,
    /// No codec can serialize this entity.
    UnsupportedEntity,
    /// Malformed request or malformed serialized entity.
    InvalidPayload,
    SerializeFailed,
    DeserializeFailed,
    /// Destination lacks space. Silent at scheduler level; 409 on the wire.
    NoRootSpots,
    /// Destination policy forbids incoming transfers.
    TransfersDisabled,
    /// Peer not present in the discovery registry.
    UnknownServer,
    /// Peer client exhausted its retries.
    UnreachableServer,
    WorldNotFound,
    ConnectionNotFound,
    TransferNotFound,
    /// World refused a command after repeated step failures.
    DegradedRunner,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::UnknownType => "unknown_type",
            ErrorCode::MissingType => "missing_type",
            ErrorCode::UnsupportedEntity => "unsupported_entity",
            ErrorCode::InvalidPayload => "invalid_payload",
            ErrorCode::SerializeFailed => "serialize_failed",
            ErrorCode::DeserializeFailed => "deserialize_failed",
            ErrorCode::NoRootSpots => "no_root_spots",
            ErrorCode::TransfersDisabled => "transfers_disabled",
            ErrorCode::UnknownServer => "unknown_server",
            ErrorCode::UnreachableServer => "unreachable_server",
            ErrorCode::WorldNotFound => "world_not_found",
            ErrorCode::ConnectionNotFound => "connection_not_found",
            ErrorCode::TransferNotFound => "transfer_not_found",
            ErrorCode::DegradedRunner => "degraded_runner",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tagged cross-component error
// ---------------------------------------------------------------------------

/// The tagged error record exchanged between components (and, serialized,
/// with peers). Never raised across a boundary – always returned.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct TransferError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,
}

impl TransferError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: Map::new(),
        }
    }

    pub fn with_context(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Component-internal errors
// ---------------------------------------------------------------------------

/// Snapshot load/restore failures. A missing snapshot is distinct from a
/// corrupt one so callers can react differently.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot not found: {}", .0.display())]
    Missing(std::path::PathBuf),
    #[error("snapshot is not valid JSON: {}: {source}", .path.display())]
    Corrupt {
        path: std::path::PathBuf,
        source: serde_json::Error,
    },
    #[error("snapshot missing mandatory field '{0}'")]
    MissingField(&'static str),
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),
}

/// World creation / lookup failures.
#[derive(Debug, thiserror::Error)]
pub enum WorldError {
    #[error("unknown world type '{requested}' (known: {})", .known.join(", "))]
    UnknownType {
        requested: String,
        known: Vec<String>,
    },
    #[error("world not found: {0}")]
    NotFound(String),
}
