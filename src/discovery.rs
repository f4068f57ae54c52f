//! DiscoveryService – heartbeat-based peer registry.
//!
//! Every mutation persists the full registry (servers plus heartbeat
//! timestamps) to a single file, so staleness survives restarts. A
//! background cleanup loop reclassifies peers by heartbeat age:
//!
//! | Age                        | Result            |
//! |----------------------------|-------------------|
//! | > `prune_timeout`          | removed entirely  |
//! | > `heartbeat_timeout`      | status = offline  |
//! | > 2 × `heartbeat_interval` | status = degraded |
//! | otherwise                  | status = online   |

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::{ServerId, ServerInfo, ServerStatus};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Expected cadence of peer heartbeats.
    pub heartbeat_interval: Duration,
    /// Heartbeat age after which a peer is marked offline.
    pub heartbeat_timeout: Duration,
    /// Cadence of the stale-server sweep.
    pub cleanup_interval: Duration,
    /// Heartbeat age after which a peer is removed entirely.
    pub prune_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(2),
            heartbeat_timeout: Duration::from_secs(6),
            cleanup_interval: Duration::from_secs(5),
            prune_timeout: Duration::from_secs(3600),
        }
    }
}

// ---------------------------------------------------------------------------
// Persistence format
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    servers: Vec<ServerInfo>,
    #[serde(default)]
    last_heartbeats: HashMap<ServerId, f64>,
    #[serde(default)]
    updated_at: f64,
}

#[derive(Default)]
struct DiscoveryInner {
    servers: HashMap<ServerId, ServerInfo>,
    last_heartbeat: HashMap<ServerId, f64>,
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

pub struct DiscoveryService {
    inner: Mutex<DiscoveryInner>,
    config: DiscoveryConfig,
    path: PathBuf,
    cleanup_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DiscoveryService {
    pub fn new(path: impl Into<PathBuf>, config: DiscoveryConfig) -> Self {
        let service = Self {
            inner: Mutex::new(DiscoveryInner::default()),
            config,
            path: path.into(),
            cleanup_task: Mutex::new(None),
        };
        service.load_registry();
        info!(
            "DiscoveryService initialized with {} server(s)",
            service.inner.lock().servers.len()
        );
        service
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Registration & heartbeats
    // -----------------------------------------------------------------------

    /// Register a server. An existing entry with the same `host:port` but a
    /// different id is evicted first – that is a server restarting under a
    /// new identity.
    pub fn register(&self, mut server_info: ServerInfo) {
        {
            let mut inner = self.inner.lock();
            let server_id = server_info.server_id.clone();

            let stale: Vec<ServerId> = inner
                .servers
                .values()
                .filter(|s| {
                    s.server_id != server_id
                        && s.host == server_info.host
                        && s.port == server_info.port
                })
                .map(|s| s.server_id.clone())
                .collect();
            for stale_id in stale {
                info!(
                    "Found duplicate server {} at {}:{}; removing in favor of {}",
                    stale_id, server_info.host, server_info.port, server_id
                );
                inner.servers.remove(&stale_id);
                inner.last_heartbeat.remove(&stale_id);
            }

            let was_offline = inner
                .servers
                .get(&server_id)
                .map(|s| s.status == ServerStatus::Offline)
                .unwrap_or(false);

            server_info.status = ServerStatus::Online;
            inner.last_heartbeat.insert(server_id.clone(), now_secs());
            inner.servers.insert(server_id.clone(), server_info.clone());

            if was_offline {
                info!("Server {} came back online", server_id);
            } else {
                info!(
                    "Server registered: {} at {}:{} ({})",
                    server_id, server_info.host, server_info.port, server_info.hostname
                );
            }
        }
        self.save_registry();
    }

    pub fn unregister(&self, server_id: &str) -> bool {
        let removed = {
            let mut inner = self.inner.lock();
            let removed = inner.servers.remove(server_id).is_some();
            inner.last_heartbeat.remove(server_id);
            removed
        };
        if removed {
            info!("Server unregistered: {}", server_id);
            self.save_registry();
        }
        removed
    }

    /// Record a heartbeat. Returns false for an unknown id – the caller
    /// should re-register.
    pub fn heartbeat(&self, server_id: &str, server_info: Option<ServerInfo>) -> bool {
        let mut inner = self.inner.lock();
        if !inner.servers.contains_key(server_id) {
            warn!("Heartbeat from unregistered server: {}", server_id);
            return false;
        }
        inner.last_heartbeat.insert(server_id.to_string(), now_secs());

        if let Some(mut info) = server_info {
            let was_offline = inner
                .servers
                .get(server_id)
                .map(|s| s.status == ServerStatus::Offline)
                .unwrap_or(false);
            if was_offline {
                info.status = ServerStatus::Online;
                info!("Server {} status changed to online", server_id);
            }
            inner.servers.insert(server_id.to_string(), info);
        } else if let Some(existing) = inner.servers.get_mut(server_id) {
            if existing.status == ServerStatus::Offline {
                existing.status = ServerStatus::Online;
                info!("Server {} status changed to online", server_id);
            }
        }
        true
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn get(&self, server_id: &str) -> Option<ServerInfo> {
        self.inner.lock().servers.get(server_id).cloned()
    }

    pub fn list(
        &self,
        status_filter: Option<ServerStatus>,
        include_local: bool,
    ) -> Vec<ServerInfo> {
        self.inner
            .lock()
            .servers
            .values()
            .filter(|s| status_filter.map_or(true, |f| s.status == f))
            .filter(|s| include_local || !s.is_local)
            .cloned()
            .collect()
    }

    pub fn server_count(&self) -> usize {
        self.inner.lock().servers.len()
    }

    // -----------------------------------------------------------------------
    // Cleanup
    // -----------------------------------------------------------------------

    /// One sweep of the stale-server check. Persists when anything changed.
    /// Returns the number of status changes plus prunes.
    pub fn cleanup_stale_servers(&self) -> usize {
        let changes = {
            let mut inner = self.inner.lock();
            let now = now_secs();
            let mut changes = 0usize;
            let mut to_prune = Vec::new();

            let heartbeat_timeout = self.config.heartbeat_timeout.as_secs_f64();
            let degraded_after = self.config.heartbeat_interval.as_secs_f64() * 2.0;
            let prune_timeout = self.config.prune_timeout.as_secs_f64();

            let ids: Vec<ServerId> = inner.servers.keys().cloned().collect();
            for server_id in ids {
                let age = now - inner.last_heartbeat.get(&server_id).copied().unwrap_or(0.0);
                if age > prune_timeout {
                    to_prune.push(server_id);
                    continue;
                }
                let new_status = if age > heartbeat_timeout {
                    ServerStatus::Offline
                } else if age > degraded_after {
                    ServerStatus::Degraded
                } else {
                    ServerStatus::Online
                };
                if let Some(server) = inner.servers.get_mut(&server_id) {
                    if server.status != new_status {
                        server.status = new_status;
                        info!("Server {} status changed to {}", server_id, new_status);
                        changes += 1;
                    }
                }
            }

            for server_id in to_prune {
                inner.servers.remove(&server_id);
                inner.last_heartbeat.remove(&server_id);
                info!(
                    "Pruned stale server: {} (inactive for > {:.0}s)",
                    server_id, prune_timeout
                );
                changes += 1;
            }
            changes
        };

        if changes > 0 {
            self.save_registry();
        }
        changes
    }

    /// Spawn the periodic cleanup loop. No-op when already running.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.cleanup_task.lock();
        if task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            return;
        }
        let service = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(service.config.cleanup_interval).await;
                service.cleanup_stale_servers();
            }
        }));
        info!("DiscoveryService cleanup loop started");
    }

    pub async fn stop(&self) {
        let task = self.cleanup_task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
            info!("DiscoveryService cleanup loop stopped");
        }
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    fn load_registry(&self) {
        let body = match fs::read(&self.path) {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No existing server registry found");
                return;
            }
            Err(e) => {
                error!("Failed to read server registry: {}", e);
                return;
            }
        };
        let file: RegistryFile = match serde_json::from_slice(&body) {
            Ok(file) => file,
            Err(e) => {
                error!("Failed to parse server registry: {}", e);
                return;
            }
        };

        let mut inner = self.inner.lock();
        for server in file.servers {
            let last = file
                .last_heartbeats
                .get(&server.server_id)
                .copied()
                .unwrap_or(0.0);
            inner.last_heartbeat.insert(server.server_id.clone(), last);
            inner.servers.insert(server.server_id.clone(), server);
        }
        info!("Loaded {} server(s) from registry", inner.servers.len());
    }

    fn save_registry(&self) {
        // Snapshot under the lock, write outside it.
        let file = {
            let inner = self.inner.lock();
            RegistryFile {
                servers: inner.servers.values().cloned().collect(),
                last_heartbeats: inner.last_heartbeat.clone(),
                updated_at: now_secs(),
            }
        };
        let result = (|| -> std::io::Result<()> {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            let tmp = self.path.with_extension("tmp");
            fs::write(&tmp, serde_json::to_vec_pretty(&file)?)?;
            fs::rename(&tmp, &self.path)?;
            Ok(())
        })();
        match result {
            Ok(()) => debug!("Server registry saved to disk"),
            Err(e) => error!("Failed to save server registry: {}", e),
        }
    }
}
