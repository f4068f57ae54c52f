//! One config struct for the whole server, populated from the environment
//! at startup. No module reads environment variables on its own.

use std::path::PathBuf;
use std::time::Duration;

use crate::discovery::DiscoveryConfig;
use crate::runner::RunnerConfig;
use crate::types::{ServerInfo, ServerStatus};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Local server identifier (`SERVER_ID`).
    pub server_id: String,
    /// HTTP listen port (`API_PORT`).
    pub api_port: u16,
    /// Root of all persisted state (`DATA_DIR`).
    pub data_dir: PathBuf,
    /// Optional peer hub to register with (`DISCOVERY_SERVER_URL`).
    pub discovery_server_url: Option<String>,
    /// Shared secret for discovery endpoints (`DISCOVERY_API_KEY`).
    pub discovery_api_key: Option<String>,
    /// Allow private/loopback peer hosts (`ALLOW_PRIVATE_SERVER_REGISTRATION`).
    pub allow_private_server_registration: bool,
    /// Strict CORS (`PRODUCTION`).
    pub production: bool,
    /// Comma-separated allowed origins (`ALLOWED_ORIGINS`).
    pub allowed_origins: Vec<String>,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub migration_check_interval: Duration,
    pub auto_save_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_id: "local-server".to_string(),
            api_port: 8000,
            data_dir: PathBuf::from("data"),
            discovery_server_url: None,
            discovery_api_key: None,
            allow_private_server_registration: false,
            production: false,
            allowed_origins: Vec::new(),
            heartbeat_interval: Duration::from_secs(2),
            heartbeat_timeout: Duration::from_secs(6),
            migration_check_interval: Duration::from_secs(2),
            auto_save_interval: Duration::from_secs(300),
        }
    }
}

impl ServerConfig {
    pub fn worlds_dir(&self) -> PathBuf {
        self.data_dir.join("worlds")
    }

    pub fn connections_file(&self) -> PathBuf {
        self.data_dir.join("connections.json")
    }

    pub fn registry_file(&self) -> PathBuf {
        self.data_dir.join("server_registry.json")
    }

    pub fn transfers_file(&self) -> PathBuf {
        self.data_dir.join("transfers.log")
    }

    pub fn discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            heartbeat_interval: self.heartbeat_interval,
            heartbeat_timeout: self.heartbeat_timeout,
            ..DiscoveryConfig::default()
        }
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig::default()
    }

    /// Parse `DISCOVERY_SERVER_URL` (e.g. `http://192.168.1.10:8000`) into
    /// a minimal hub `ServerInfo`.
    pub fn discovery_hub_info(&self) -> Option<ServerInfo> {
        let url = self.discovery_server_url.as_deref()?;
        let rest = url
            .strip_prefix("http://")
            .or_else(|| url.strip_prefix("https://"))
            .unwrap_or(url);
        let rest = rest.split('/').next().unwrap_or(rest);
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => (host, port.parse::<u16>().ok()?),
            None => (rest, 8000),
        };
        if host.is_empty() {
            return None;
        }
        Some(ServerInfo {
            server_id: "discovery-hub".to_string(),
            host: host.to_string(),
            port,
            hostname: host.to_string(),
            status: ServerStatus::Online,
            version: "unknown".to_string(),
            world_count: 0,
            is_local: false,
            uptime_seconds: 0.0,
        })
    }
}
