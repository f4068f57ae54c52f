//! StartupManager – ordered bring-up and tear-down of every subsystem.
//!
//! The order is part of the contract: worlds first (fatal on failure),
//! then connections, broadcast, discovery, federation, scheduler and
//! auto-save – each federation step allowed to fail in isolation. Shutdown
//! walks the same list in reverse, each step time-bounded and best-effort.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use log::{error, info, warn};
use parking_lot::Mutex;

use crate::autosave::AutoSaveService;
use crate::broadcast::BroadcastHub;
use crate::codec::TransferRegistry;
use crate::config::ServerConfig;
use crate::connection::ConnectionStore;
use crate::discovery::DiscoveryService;
use crate::history::TransferHistory;
use crate::manager::{CreateWorldOptions, WorldManager};
use crate::peer::{PeerClient, PeerClientConfig};
use crate::runner::short;
use crate::scheduler::MigrationScheduler;
use crate::security::WebSocketLimiter;
use crate::snapshot::SnapshotStore;
use crate::types::{ServerInfo, ServerStatus};

/// Wall-clock cap per shutdown step.
const SHUTDOWN_STEP_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// AppContext
// ---------------------------------------------------------------------------

/// Explicitly owned handles to every process-wide service. Created once at
/// startup and passed down – there is no ambient process state.
pub struct AppContext {
    pub config: ServerConfig,
    pub registry: Arc<TransferRegistry>,
    pub manager: Arc<WorldManager>,
    pub connections: Arc<ConnectionStore>,
    pub snapshots: Arc<SnapshotStore>,
    pub history: Arc<TransferHistory>,
    pub discovery: Arc<DiscoveryService>,
    pub peers: Arc<PeerClient>,
    pub hub: Arc<BroadcastHub>,
    pub autosave: Arc<AutoSaveService>,
    pub scheduler: Arc<MigrationScheduler>,
    pub ws_limiter: WebSocketLimiter,
    started_at: Instant,
}

impl AppContext {
    pub fn uptime_seconds(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    /// This server's own registry entry, refreshed on every heartbeat.
    pub fn local_server_info(&self) -> ServerInfo {
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        ServerInfo {
            server_id: self.config.server_id.clone(),
            host: hostname.clone(),
            port: self.config.api_port,
            hostname,
            status: ServerStatus::Online,
            version: env!("CARGO_PKG_VERSION").to_string(),
            world_count: self.manager.world_count(),
            is_local: true,
            uptime_seconds: self.uptime_seconds(),
        }
    }
}

// ---------------------------------------------------------------------------
// StartupManager
// ---------------------------------------------------------------------------

pub struct StartupManager {
    ctx: Arc<AppContext>,
    hub_info: Option<ServerInfo>,
    heartbeat_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl StartupManager {
    /// Wire up every service from the config. Nothing starts yet.
    pub fn build(config: ServerConfig) -> anyhow::Result<Self> {
        let registry = Arc::new(TransferRegistry::with_defaults());
        let manager = Arc::new(WorldManager::new(config.runner_config()));
        let connections = Arc::new(ConnectionStore::new(config.connections_file()));
        let snapshots = Arc::new(SnapshotStore::new(config.worlds_dir(), registry.clone()));
        let history = Arc::new(TransferHistory::new(config.transfers_file()));
        let discovery = Arc::new(DiscoveryService::new(
            config.registry_file(),
            config.discovery_config(),
        ));
        let peers = Arc::new(
            PeerClient::new(PeerClientConfig {
                discovery_api_key: config.discovery_api_key.clone(),
                ..PeerClientConfig::default()
            })
            .context("failed to build peer HTTP client")?,
        );

        let runner_config = config.runner_config();
        let emit_interval = Duration::from_secs_f32(
            runner_config.websocket_update_interval as f32 / runner_config.tick_rate_hz,
        );
        let hub = Arc::new(BroadcastHub::new(emit_interval));

        let autosave = Arc::new(AutoSaveService::new(
            manager.clone(),
            snapshots.clone(),
            config.auto_save_interval,
        ));
        let scheduler = Arc::new(MigrationScheduler::new(
            connections.clone(),
            manager.clone(),
            history.clone(),
            registry.clone(),
            Some(discovery.clone()),
            Some(peers.clone()),
            config.server_id.clone(),
            config.migration_check_interval,
        ));

        let hub_info = config.discovery_hub_info();
        if let Some(hub_info) = &hub_info {
            info!(
                "Discovery hub configured: {}:{}",
                hub_info.host, hub_info.port
            );
        } else if config.discovery_server_url.is_some() {
            warn!(
                "Failed to parse DISCOVERY_SERVER_URL: {:?}",
                config.discovery_server_url
            );
        }

        let ctx = Arc::new(AppContext {
            config,
            registry,
            manager,
            connections,
            snapshots,
            history,
            discovery,
            peers,
            hub,
            autosave,
            scheduler,
            ws_limiter: WebSocketLimiter::default(),
            started_at: Instant::now(),
        });

        Ok(Self {
            ctx,
            hub_info,
            heartbeat_task: Mutex::new(None),
        })
    }

    pub fn context(&self) -> Arc<AppContext> {
        self.ctx.clone()
    }

    // -----------------------------------------------------------------------
    // Startup
    // -----------------------------------------------------------------------

    /// Bring every subsystem up in order. World bring-up failures abort;
    /// every federation step is allowed to fail in isolation.
    pub async fn initialize(&self) -> anyhow::Result<()> {
        info!("STARTUP: beginning server initialization");

        // 1–2. Worlds from snapshots, or a default world.
        self.restore_worlds()
            .context("world bring-up failed")?;

        // 3. Connections.
        let restored = self.ctx.connections.load();
        info!("Restored {} connection(s)", restored);

        // 4–5. Tick loops. Migration dependencies are injected by
        // construction: the scheduler holds the manager handle, never the
        // reverse.
        for instance in self.ctx.manager.iter() {
            let paused = instance.runner.paused();
            instance.runner.start(paused);
        }

        // 6. Broadcast entries.
        for instance in self.ctx.manager.iter() {
            self.ctx.hub.register(instance.runner.clone());
        }

        // 7. Discovery + local registration + self-heartbeat.
        self.ctx.discovery.start();
        self.ctx.discovery.register(self.ctx.local_server_info());
        info!("Local server registered: {}", self.ctx.config.server_id);
        self.start_heartbeat_task();

        // 8. Register with the discovery hub (best effort, non-fatal).
        if let Some(hub_info) = &self.hub_info {
            let ok = self
                .ctx
                .peers
                .register_server(hub_info, &self.ctx.local_server_info())
                .await;
            if ok {
                info!(
                    "Registered with discovery hub at {}:{}",
                    hub_info.host, hub_info.port
                );
            } else {
                warn!(
                    "Failed to register with discovery hub at {}:{}",
                    hub_info.host, hub_info.port
                );
            }
        }

        // 9. Prune dead local-local connections.
        let removed = self.ctx.connections.validate(
            &self.ctx.manager.world_ids(),
            &self.ctx.config.server_id,
        );
        if removed > 0 {
            info!("Startup cleanup: removed {} invalid connection(s)", removed);
        }

        // 10–11. Scheduler and auto-save.
        self.ctx.scheduler.start();
        self.ctx.autosave.start();

        info!("STARTUP: server initialization complete");
        Ok(())
    }

    fn restore_worlds(&self) -> anyhow::Result<()> {
        let found = self.ctx.snapshots.discover_all();
        for (world_id, path) in found {
            info!(
                "Restoring world {} from {}",
                short(&world_id),
                path.display()
            );
            let snapshot = match self.ctx.snapshots.load(&path) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    error!("Failed to load snapshot for {}: {}", short(&world_id), e);
                    continue;
                }
            };
            let instance = match self.ctx.manager.create_with_id(
                world_id.clone(),
                &snapshot.metadata.world_type,
                snapshot.metadata.name.clone(),
                CreateWorldOptions {
                    config: None,
                    seed: snapshot.metadata.seed,
                    persistent: snapshot.metadata.persistent,
                    description: snapshot.metadata.description.clone(),
                },
            ) {
                Ok(instance) => instance,
                Err(e) => {
                    error!("Failed to recreate world {}: {}", short(&world_id), e);
                    continue;
                }
            };
            if !self.ctx.snapshots.restore(&snapshot, &instance.runner) {
                error!("Failed to restore world {}", short(&world_id));
            }
        }

        // Cold start with an empty data dir: one default world, snapshotted
        // immediately so the next boot is a restore.
        if self.ctx.manager.world_count() == 0 {
            info!("No worlds restored, creating default world");
            let default = self.ctx.manager.create(
                "tank",
                "World 1",
                CreateWorldOptions {
                    persistent: true,
                    description: "A local ecosystem world".to_string(),
                    ..CreateWorldOptions::default()
                },
            )?;
            if self.ctx.snapshots.save(&default).is_none() {
                warn!("Failed to create initial snapshot");
            }
        }

        info!(
            "World manager has {} world(s)",
            self.ctx.manager.world_count()
        );
        Ok(())
    }

    fn start_heartbeat_task(&self) {
        let ctx = self.ctx.clone();
        let hub_info = self.hub_info.clone();
        let interval = ctx.config.heartbeat_interval;
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let info = ctx.local_server_info();
                ctx.discovery.heartbeat(&ctx.config.server_id, Some(info.clone()));
                if let Some(hub) = &hub_info {
                    if !ctx.peers.send_heartbeat(hub, &info).await {
                        warn!(
                            "Failed to send heartbeat to discovery hub at {}:{}",
                            hub.host, hub.port
                        );
                    }
                }
            }
        });
        *self.heartbeat_task.lock() = Some(task);
        info!("Heartbeat task started");
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Tear down in reverse bring-up order. Every step is best-effort and
    /// time-bounded; a failing step never blocks the rest.
    pub async fn shutdown(&self) {
        info!("SHUTDOWN: beginning graceful shutdown");

        // 1. Final save of every persistent world.
        let saved = self.ctx.autosave.save_all_now();
        info!("Saved {} persistent world(s) before shutdown", saved);

        // 2. Connections.
        if !self.ctx.connections.save() {
            warn!("Failed to save connections on shutdown");
        }

        // 3. Auto-save loop.
        bounded(self.ctx.autosave.stop()).await;

        // 4. Broadcast tasks.
        self.ctx.hub.stop_all();

        // 5. Migration scheduler.
        bounded(self.ctx.scheduler.stop()).await;

        // 6. World runners.
        for instance in self.ctx.manager.iter() {
            bounded(instance.runner.stop()).await;
        }

        // 7. Self-heartbeat.
        let task = self.heartbeat_task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = bounded(task).await;
        }

        // 8. Discovery cleanup loop.
        bounded(self.ctx.discovery.stop()).await;

        // 9. Peer client: the pool closes when the last handle drops.
        info!("SHUTDOWN: cleanup complete");
    }
}

/// Cap a shutdown step at the step timeout; expiry abandons the wait.
async fn bounded<F: std::future::Future>(step: F) -> Option<F::Output> {
    match tokio::time::timeout(SHUTDOWN_STEP_TIMEOUT, step).await {
        Ok(output) => Some(output),
        Err(_) => {
            warn!("Shutdown step exceeded {:?}; forcing", SHUTDOWN_STEP_TIMEOUT);
            None
        }
    }
}
