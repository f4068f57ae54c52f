//! world-mesh-server binary
//!
//! Starts the world host, restores persisted worlds, and joins the
//! federation mesh.
//!
//! ## Configuration (environment / CLI)
//!
//! | Key                                 | Default        | Description                         |
//! |-------------------------------------|----------------|-------------------------------------|
//! | `SERVER_ID`                         | `local-server` | Local server identifier             |
//! | `API_PORT`                          | `8000`         | HTTP/WebSocket listen port          |
//! | `DATA_DIR`                          | `data`         | Root of persisted state             |
//! | `DISCOVERY_SERVER_URL`              | *(none)*       | Peer hub to register with           |
//! | `DISCOVERY_API_KEY`                 | *(none)*       | Shared secret for discovery routes  |
//! | `ALLOW_PRIVATE_SERVER_REGISTRATION` | `false`        | Accept private/loopback peer hosts  |
//! | `PRODUCTION`                        | `false`        | Strict CORS                         |
//! | `ALLOWED_ORIGINS`                   | *(empty)*      | Comma-separated CORS origins        |
//! | `LOG_LEVEL`                         | `info`         | Log filter directive                |
//! | `HEARTBEAT_INTERVAL`                | `2`            | Seconds between self-heartbeats     |
//! | `HEARTBEAT_TIMEOUT`                 | `6`            | Seconds before a peer is offline    |
//! | `MIGRATION_CHECK_INTERVAL`          | `2`            | Seconds between migration checks    |
//! | `AUTO_SAVE_INTERVAL`                | `300`          | Seconds between world auto-saves    |

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use world_mesh::api;
use world_mesh::config::ServerConfig;
use world_mesh::startup::StartupManager;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "world-mesh-server", about = "World Mesh federation server", version)]
struct Args {
    /// Local server identifier
    #[arg(long, env = "SERVER_ID", default_value = "local-server")]
    server_id: String,

    /// HTTP/WebSocket listen port
    #[arg(long, env = "API_PORT", default_value_t = 8000)]
    api_port: u16,

    /// Root directory for persisted state
    #[arg(long, env = "DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Optional discovery hub URL (e.g. http://hub.example.com:8000)
    #[arg(long, env = "DISCOVERY_SERVER_URL")]
    discovery_server_url: Option<String>,

    /// Shared secret required on discovery endpoints
    #[arg(long, env = "DISCOVERY_API_KEY")]
    discovery_api_key: Option<String>,

    /// Accept registrations from private / loopback hosts
    #[arg(long, env = "ALLOW_PRIVATE_SERVER_REGISTRATION", default_value_t = false)]
    allow_private_server_registration: bool,

    /// Production mode: strict CORS
    #[arg(long, env = "PRODUCTION", default_value_t = false)]
    production: bool,

    /// Comma-separated allowed CORS origins
    #[arg(long, env = "ALLOWED_ORIGINS", value_delimiter = ',', default_value = "")]
    allowed_origins: Vec<String>,

    /// Log filter directive
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Seconds between self-heartbeats
    #[arg(long, env = "HEARTBEAT_INTERVAL", default_value_t = 2.0)]
    heartbeat_interval: f64,

    /// Seconds without a heartbeat before a peer is marked offline
    #[arg(long, env = "HEARTBEAT_TIMEOUT", default_value_t = 6.0)]
    heartbeat_timeout: f64,

    /// Seconds between migration scheduler checks
    #[arg(long, env = "MIGRATION_CHECK_INTERVAL", default_value_t = 2.0)]
    migration_check_interval: f64,

    /// Seconds between automatic world snapshots
    #[arg(long, env = "AUTO_SAVE_INTERVAL", default_value_t = 300.0)]
    auto_save_interval: f64,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            server_id: self.server_id,
            api_port: self.api_port,
            data_dir: self.data_dir,
            discovery_server_url: self.discovery_server_url,
            discovery_api_key: self.discovery_api_key,
            allow_private_server_registration: self.allow_private_server_registration,
            production: self.production,
            allowed_origins: self
                .allowed_origins
                .into_iter()
                .filter(|o| !o.is_empty())
                .collect(),
            heartbeat_interval: Duration::from_secs_f64(self.heartbeat_interval),
            heartbeat_timeout: Duration::from_secs_f64(self.heartbeat_timeout),
            migration_check_interval: Duration::from_secs_f64(self.migration_check_interval),
            auto_save_interval: Duration::from_secs_f64(self.auto_save_interval),
        }
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.log_level.clone())),
        )
        .init();

    log::info!(
        "Starting world-mesh-server (server_id='{}', port={}, data_dir={})",
        args.server_id,
        args.api_port,
        args.data_dir.display(),
    );

    let config = args.into_config();
    let port = config.api_port;

    // World bring-up failures are fatal; federation steps degrade softly.
    let startup = StartupManager::build(config)?;
    startup.initialize().await?;

    let ctx = startup.context();
    let router = api::router(ctx);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    log::info!("Listening on {}", addr);

    let server = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    );

    // Run until shutdown signal.
    tokio::select! {
        result = server => {
            log::error!("HTTP server exited unexpectedly");
            result.context("server error")?;
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutting down (SIGINT)");
        }
    }

    startup.shutdown().await;
    Ok(())
}
