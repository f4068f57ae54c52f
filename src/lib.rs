//! World Mesh
//!
//! A federated simulation server: each node hosts a set of independently
//! ticking 2D ecosystem worlds, serves live state over WebSocket, persists
//! world state across restarts, and exchanges entities with peer servers
//! through probabilistic connections.
//!
//! ## Architecture
//!
//! ```text
//! StartupManager  (startup.rs)  ← ordered bring-up, AppContext
//!   ├── WorldManager  (manager.rs)  ← owns WorldRunners
//!   │     └── WorldRunner  (runner.rs)  ← tick loop, state cache
//!   │           └── WorldBackend  (backend.rs)  ← tank / petri / soccer
//!   ├── BroadcastHub  (broadcast.rs)  ← WebSocket fan-out
//!   ├── MigrationScheduler  (scheduler.rs)  ← dice rolls, transfers
//!   │     ├── ConnectionStore  (connection.rs)
//!   │     ├── TransferRegistry  (codec.rs)  ← per-type entity codecs
//!   │     └── TransferHistory  (history.rs)
//!   ├── DiscoveryService  (discovery.rs)  ← peer registry, heartbeats
//!   ├── PeerClient  (peer.rs)  ← retrying HTTP client
//!   └── SnapshotStore  (snapshot.rs)  ← atomic versioned snapshots
//! ```
//!
//! The HTTP/WebSocket surface lives in `api.rs` and is served by the
//! `world-mesh-server` binary.

// Wire protocol and model types are always available (no server feature
// needed).
pub mod error;
pub mod protocol;
pub mod types;

// Server-side modules require the `server` feature.
#[cfg(feature = "server")]
pub mod api;
#[cfg(feature = "server")]
pub mod autosave;
#[cfg(feature = "server")]
pub mod backend;
#[cfg(feature = "server")]
pub mod broadcast;
#[cfg(feature = "server")]
pub mod codec;
#[cfg(feature = "server")]
pub mod config;
#[cfg(feature = "server")]
pub mod connection;
#[cfg(feature = "server")]
pub mod discovery;
#[cfg(feature = "server")]
pub mod history;
#[cfg(feature = "server")]
pub mod manager;
#[cfg(feature = "server")]
pub mod peer;
#[cfg(feature = "server")]
pub mod runner;
#[cfg(feature = "server")]
pub mod scheduler;
#[cfg(feature = "server")]
pub mod security;
#[cfg(feature = "server")]
pub mod snapshot;
#[cfg(feature = "server")]
pub mod startup;

// Convenience re-exports.
pub use error::{ErrorCode, TransferError};
pub use types::{Connection, Direction, ServerInfo, ServerStatus, TransferRecord, WorldStatus};

#[cfg(feature = "server")]
pub use backend::{Entity, EntityState, WorldBackend};
#[cfg(feature = "server")]
pub use codec::{TransferCodec, TransferRegistry};
#[cfg(feature = "server")]
pub use config::ServerConfig;
#[cfg(feature = "server")]
pub use manager::{WorldInstance, WorldManager};
#[cfg(feature = "server")]
pub use runner::WorldRunner;
#[cfg(feature = "server")]
pub use startup::{AppContext, StartupManager};
