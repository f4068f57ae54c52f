//! AutoSaveService – periodic snapshots of persistent worlds.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use parking_lot::Mutex;

use crate::manager::WorldManager;
use crate::runner::short;
use crate::snapshot::SnapshotStore;

/// Snapshots kept per world after each save.
pub const MAX_SNAPSHOTS: usize = 10;

pub struct AutoSaveService {
    manager: Arc<WorldManager>,
    store: Arc<SnapshotStore>,
    interval: Duration,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl AutoSaveService {
    pub fn new(manager: Arc<WorldManager>, store: Arc<SnapshotStore>, interval: Duration) -> Self {
        Self {
            manager,
            store,
            interval,
            task: Mutex::new(None),
        }
    }

    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            warn!("Auto-save service already running");
            return;
        }
        let service = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(service.interval).await;
                service.save_all_now();
            }
        }));
        info!(
            "Auto-save service started (interval: {:.0}s)",
            self.interval.as_secs_f32()
        );
    }

    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
            info!("Auto-save service stopped");
        }
    }

    /// Save every persistent world immediately and trim old snapshots.
    /// Returns the number of worlds saved.
    pub fn save_all_now(&self) -> usize {
        let mut saved = 0;
        for instance in self.manager.iter() {
            if !instance.persistent {
                continue;
            }
            match self.store.save(&instance) {
                Some(_) => {
                    self.store.retain(&instance.world_id, MAX_SNAPSHOTS);
                    saved += 1;
                }
                None => warn!("Auto-save failed for world {}", short(&instance.world_id)),
            }
        }
        info!("Saved {} persistent world(s)", saved);
        saved
    }

    /// Out-of-band save of one world (manual save endpoint).
    pub fn save_world_now(&self, world_id: &str) -> Option<std::path::PathBuf> {
        let instance = self.manager.get(world_id)?;
        let path = self.store.save(&instance);
        if path.is_some() {
            self.store.retain(world_id, MAX_SNAPSHOTS);
        }
        path
    }
}
