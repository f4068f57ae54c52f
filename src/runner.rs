//! WorldRunner – drives one backend in its own tick task.
//!
//! ## Tick contract
//!
//! While running and not paused the backend advances at the target tick
//! rate (default 30 Hz, ×5 when fast-forwarding). Every step happens under
//! the runner's exclusive lock; nothing reads entity state while a step is
//! in flight, and the lock is never held across I/O.
//!
//! ## State pipeline
//!
//! `get_state` serves a cached payload when the frame hasn't advanced,
//! throttles emissions to every `websocket_update_interval` frames, and
//! otherwise builds either a self-contained full frame or a delta frame
//! (`updates` / `added` / `removed` against the previous emission). A full
//! frame is forced every `delta_sync_interval` frames.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde_json::Value;

use crate::backend::WorldBackend;
use crate::error::{ErrorCode, TransferError};
use crate::protocol::{
    ws_error_frame, DeltaStatePayload, EntityFrame, FullStatePayload, StatePayload, StatsPayload,
};
use crate::types::{EntityId, WorldId};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Base tick rate in Hz.
    pub tick_rate_hz: f32,
    /// Tick rate multiplier while fast-forwarding.
    pub fast_forward_multiplier: f32,
    /// Frames between broadcast emissions.
    pub websocket_update_interval: u32,
    /// Frames between forced full snapshots.
    pub delta_sync_interval: u64,
    /// Consecutive step failures before the runner turns degraded.
    pub max_step_failures: u32,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            tick_rate_hz: 30.0,
            fast_forward_multiplier: 5.0,
            websocket_update_interval: 2,
            delta_sync_interval: 90,
            max_step_failures: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// Publisher state
// ---------------------------------------------------------------------------

/// Cache + delta bookkeeping, owned by the runner lock.
#[derive(Default)]
struct PublisherState {
    cached: Option<StatePayload>,
    cached_frame: Option<u64>,
    frames_since_emit: u32,
    last_full_frame: Option<u64>,
    last_entities: std::collections::HashSet<EntityId>,
}

impl PublisherState {
    fn invalidate(&mut self) {
        self.cached = None;
        self.cached_frame = None;
        self.frames_since_emit = 0;
        self.last_full_frame = None;
        self.last_entities.clear();
    }
}

struct RunnerInner {
    backend: Box<dyn WorldBackend>,
    frame_count: u64,
    paused: bool,
    fast_forward: bool,
    degraded: bool,
    failure_streak: u32,
    publisher: PublisherState,
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Owns one [`WorldBackend`] and its tick task.
pub struct WorldRunner {
    world_id: WorldId,
    world_type: String,
    mode_id: String,
    view_mode: String,
    config: RunnerConfig,
    inner: Mutex<RunnerInner>,
    running: AtomicBool,
    tick_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl WorldRunner {
    pub fn new(
        world_id: WorldId,
        backend: Box<dyn WorldBackend>,
        mode_id: impl Into<String>,
        view_mode: impl Into<String>,
        config: RunnerConfig,
    ) -> Self {
        let world_type = backend.world_type().to_string();
        Self {
            world_id,
            world_type,
            mode_id: mode_id.into(),
            view_mode: view_mode.into(),
            config,
            inner: Mutex::new(RunnerInner {
                backend,
                frame_count: 0,
                paused: false,
                fast_forward: false,
                degraded: false,
                failure_streak: 0,
                publisher: PublisherState::default(),
            }),
            running: AtomicBool::new(false),
            tick_task: Mutex::new(None),
        }
    }

    // -----------------------------------------------------------------------
    // Properties
    // -----------------------------------------------------------------------

    pub fn world_id(&self) -> &WorldId {
        &self.world_id
    }

    pub fn world_type(&self) -> &str {
        &self.world_type
    }

    pub fn mode_id(&self) -> &str {
        &self.mode_id
    }

    pub fn view_mode(&self) -> &str {
        &self.view_mode
    }

    pub fn frame_count(&self) -> u64 {
        self.inner.lock().frame_count
    }

    pub fn paused(&self) -> bool {
        self.inner.lock().paused
    }

    pub fn fast_forward(&self) -> bool {
        self.inner.lock().fast_forward
    }

    pub fn degraded(&self) -> bool {
        self.inner.lock().degraded
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Spawn the tick loop. No-op when already running.
    pub fn start(self: &Arc<Self>, start_paused: bool) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Runner {} already running", short(&self.world_id));
            return;
        }
        self.inner.lock().paused = start_paused;

        let runner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let base = Duration::from_secs_f32(1.0 / runner.config.tick_rate_hz);
            loop {
                let fast = runner.inner.lock().fast_forward;
                let period = if fast {
                    base.div_f32(runner.config.fast_forward_multiplier)
                } else {
                    base
                };
                tokio::time::sleep(period).await;
                if !runner.running.load(Ordering::SeqCst) {
                    break;
                }
                // Hold the lock only long enough to tick.
                runner.tick_once();
            }
            debug!("Tick loop for {} ended", short(&runner.world_id));
        });
        *self.tick_task.lock() = Some(handle);
        info!(
            "Runner {} started (paused={})",
            short(&self.world_id),
            start_paused
        );
    }

    /// Cancel the tick task and wait for it to finish.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.tick_task.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        info!("Runner {} stopped", short(&self.world_id));
    }

    fn tick_once(&self) {
        let mut inner = self.inner.lock();
        if inner.paused || inner.degraded {
            return;
        }
        match inner.backend.step(None) {
            Ok(()) => {
                inner.frame_count += 1;
                inner.failure_streak = 0;
            }
            Err(e) => {
                // Frame counter does not advance on a failed step.
                error!("Step failed for {}: {}", short(&self.world_id), e);
                inner.failure_streak += 1;
                if inner.failure_streak >= self.config.max_step_failures {
                    inner.degraded = true;
                    warn!(
                        "Runner {} degraded after {} consecutive step failures",
                        short(&self.world_id),
                        inner.failure_streak
                    );
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Stepping & reset
    // -----------------------------------------------------------------------

    /// Advance exactly one frame, regardless of the tick loop.
    pub fn step(&self, actions: Option<&Value>) -> Result<u64, TransferError> {
        let mut inner = self.inner.lock();
        if inner.degraded {
            return Err(degraded_error(&self.world_id));
        }
        if let Err(e) = inner.backend.step(actions) {
            error!("Step failed for {}: {}", short(&self.world_id), e);
            inner.failure_streak += 1;
            if inner.failure_streak >= self.config.max_step_failures {
                inner.degraded = true;
                warn!(
                    "Runner {} degraded after {} consecutive step failures",
                    short(&self.world_id),
                    inner.failure_streak
                );
            }
            return Err(
                TransferError::new(ErrorCode::DegradedRunner, e.to_string())
                    .with_context("world_id", self.world_id.clone()),
            );
        }
        inner.frame_count += 1;
        inner.failure_streak = 0;
        Ok(inner.frame_count)
    }

    /// Reset the backend. Clears the degraded flag and the frame counter.
    pub fn reset(&self, seed: Option<u64>, config: Option<&Value>) {
        let mut inner = self.inner.lock();
        inner.backend.reset(seed, config);
        inner.frame_count = 0;
        inner.degraded = false;
        inner.failure_streak = 0;
        inner.publisher.invalidate();
    }

    // -----------------------------------------------------------------------
    // Backend access (migration, snapshots)
    // -----------------------------------------------------------------------

    /// Run `f` against the backend under the runner lock. The lock must not
    /// be held across I/O – keep `f` pure computation.
    pub fn with_backend<R>(&self, f: impl FnOnce(&mut dyn WorldBackend) -> R) -> R {
        let mut inner = self.inner.lock();
        f(inner.backend.as_mut())
    }

    /// Read-only backend view plus frame counter and paused flag, for
    /// snapshot capture.
    pub fn with_world_state<R>(&self, f: impl FnOnce(&dyn WorldBackend, u64, bool) -> R) -> R {
        let inner = self.inner.lock();
        f(inner.backend.as_ref(), inner.frame_count, inner.paused)
    }

    /// Adopt frame counter and paused flag after a snapshot restore.
    pub fn mark_restored(&self, frame: u64, paused: bool) {
        let mut inner = self.inner.lock();
        inner.frame_count = frame;
        inner.paused = paused;
        inner.degraded = false;
        inner.failure_streak = 0;
        inner.publisher.invalidate();
    }

    /// Invalidate the payload cache; the next `get_state` rebuilds from
    /// scratch. Called after any externally driven mutation.
    pub fn invalidate_cache(&self) {
        self.inner.lock().publisher.invalidate();
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Handle a client command. Commands are idempotent in effect when
    /// repeated in the same logical state.
    pub fn handle_command(
        &self,
        command: &str,
        data: Option<&Value>,
    ) -> Result<Option<Value>, TransferError> {
        match command {
            "pause" => {
                let mut inner = self.inner.lock();
                inner.paused = true;
                inner.publisher.invalidate();
                Ok(None)
            }
            "resume" => {
                let mut inner = self.inner.lock();
                inner.paused = false;
                inner.publisher.invalidate();
                Ok(None)
            }
            "fast_forward" => {
                let mut inner = self.inner.lock();
                let enabled = data
                    .and_then(|d| d.get("enabled"))
                    .and_then(Value::as_bool)
                    .unwrap_or(!inner.fast_forward);
                inner.fast_forward = enabled;
                inner.publisher.invalidate();
                Ok(Some(serde_json::json!({ "fast_forward": enabled })))
            }
            "reset" => {
                let seed = data.and_then(|d| d.get("seed")).and_then(Value::as_u64);
                let config = data.and_then(|d| d.get("config"));
                self.reset(seed, config);
                Ok(Some(serde_json::json!({ "frame_count": 0 })))
            }
            "step" => {
                let actions = data.and_then(|d| d.get("actions"));
                let frame = self.step(actions)?;
                Ok(Some(serde_json::json!({ "frame_count": frame })))
            }
            other => {
                let mut inner = self.inner.lock();
                if inner.degraded {
                    return Err(degraded_error(&self.world_id));
                }
                match inner.backend.handle_command(other, data) {
                    Some(response) => {
                        inner.publisher.invalidate();
                        Ok(Some(response))
                    }
                    None => {
                        debug!(
                            "Unsupported command for world {}: {}",
                            short(&self.world_id),
                            other
                        );
                        Ok(Some(ws_error_frame(format!(
                            "Unsupported command: {}",
                            other
                        ))))
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // State pipeline
    // -----------------------------------------------------------------------

    pub fn get_state(&self, force_full: bool, allow_delta: bool) -> StatePayload {
        let mut inner = self.inner.lock();
        let current_frame = inner.frame_count;
        let running = self.running();

        // Fast path: the world has not advanced since the cached build.
        if inner.publisher.cached_frame == Some(current_frame) {
            if let Some(cached) = &inner.publisher.cached {
                if !force_full || cached.is_full() {
                    return cached.clone();
                }
            }
        }

        // Throttle: skip rebuilds between emission frames unless forced.
        inner.publisher.frames_since_emit += 1;
        let should_rebuild = force_full
            || !running
            || inner.publisher.frames_since_emit >= self.config.websocket_update_interval;
        if !should_rebuild {
            if let Some(cached) = &inner.publisher.cached {
                return cached.clone();
            }
        }
        inner.publisher.frames_since_emit = 0;

        let is_full = force_full
            || !allow_delta
            || inner.publisher.last_full_frame.is_none()
            || current_frame.saturating_sub(inner.publisher.last_full_frame.unwrap_or(0))
                >= self.config.delta_sync_interval;

        let inner = &mut *inner;
        let entities: Vec<EntityFrame> =
            inner.backend.entities().iter().map(|e| e.to_frame()).collect();
        let stats = build_stats(inner.backend.as_ref(), current_frame, inner.fast_forward);
        let elapsed_time = current_frame * 33;

        let payload = if is_full {
            let mut extras = inner.backend.extras();
            let events = extras
                .remove("events")
                .and_then(|v| v.as_array().cloned())
                .unwrap_or_default();
            let leaderboard = extras
                .remove("leaderboard")
                .and_then(|v| v.as_array().cloned())
                .unwrap_or_default();
            inner.publisher.last_full_frame = Some(current_frame);
            inner.publisher.last_entities = entities.iter().map(|e| e.id.clone()).collect();
            StatePayload::Full(FullStatePayload {
                tag: "update".to_string(),
                frame: current_frame,
                elapsed_time,
                entities,
                stats,
                events,
                leaderboard,
                world_id: self.world_id.clone(),
                mode_id: self.mode_id.clone(),
                world_type: self.world_type.clone(),
                view_mode: self.view_mode.clone(),
            })
        } else {
            let added: Vec<EntityFrame> = entities
                .iter()
                .filter(|e| !inner.publisher.last_entities.contains(&e.id))
                .cloned()
                .collect();
            let current_ids: std::collections::HashSet<&str> =
                entities.iter().map(|e| e.id.as_str()).collect();
            let removed: Vec<EntityId> = inner
                .publisher
                .last_entities
                .iter()
                .filter(|id| !current_ids.contains(id.as_str()))
                .cloned()
                .collect();
            let updates = entities.iter().map(|e| e.to_delta()).collect();
            inner.publisher.last_entities = entities.iter().map(|e| e.id.clone()).collect();
            StatePayload::Delta(DeltaStatePayload {
                tag: "delta".to_string(),
                frame: current_frame,
                elapsed_time,
                updates,
                added,
                removed,
                stats,
                world_id: self.world_id.clone(),
                mode_id: self.mode_id.clone(),
                world_type: self.world_type.clone(),
                view_mode: self.view_mode.clone(),
            })
        };

        inner.publisher.cached = Some(payload.clone());
        inner.publisher.cached_frame = Some(current_frame);
        payload
    }

    /// Canonical JSON bytes of a payload. Serializations slower than 50 ms
    /// are logged – they eat directly into broadcast latency.
    pub fn serialize_state(&self, payload: &StatePayload) -> Vec<u8> {
        let started = std::time::Instant::now();
        let bytes = payload.to_bytes().unwrap_or_else(|e| {
            error!("Failed to serialize state for {}: {}", short(&self.world_id), e);
            Vec::new()
        });
        let elapsed = started.elapsed();
        if elapsed > Duration::from_millis(50) {
            warn!(
                "Slow state serialization for {}: frame {} took {:.2} ms ({} bytes)",
                short(&self.world_id),
                payload.frame(),
                elapsed.as_secs_f64() * 1000.0,
                bytes.len()
            );
        }
        bytes
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn build_stats(backend: &dyn WorldBackend, frame: u64, fast_forward: bool) -> StatsPayload {
    let eco = backend.stats();
    let mut counts: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    let mut total_energy = 0.0;
    for entity in backend.entities() {
        *counts.entry(entity.snapshot_type().to_string()).or_insert(0) += 1;
        total_energy += entity.energy().unwrap_or(0.0);
    }
    StatsPayload {
        frame,
        population: backend.entities().len(),
        counts,
        births: eco.births,
        deaths: eco.deaths,
        generation: eco.generation,
        death_causes: eco.death_causes.clone(),
        total_energy,
        energy_gains: eco.energy_gains.clone(),
        energy_burns: eco.energy_burns.clone(),
        fast_forward,
    }
}

fn degraded_error(world_id: &str) -> TransferError {
    TransferError::new(
        ErrorCode::DegradedRunner,
        "world refused the command after repeated step failures",
    )
    .with_context("world_id", world_id)
}

/// First eight characters of an id, for log lines.
pub(crate) fn short(id: &str) -> &str {
    &id[..id.len().min(8)]
}
