//! BroadcastHub – fan-out of state frames to WebSocket subscribers.
//!
//! One tick task per world with subscribers: it pulls
//! `runner.get_state()` on a timer and pushes the serialized bytes to
//! every subscriber channel. A world with zero subscribers has its task
//! wound down to save CPU and re-spawned on the next subscription.
//! Subscribers whose channel is gone are dropped on the next emission –
//! a single bad client never stalls the loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::runner::{short, WorldRunner};
use crate::types::WorldId;

/// Buffered frames per subscriber before sends start failing.
const SUBSCRIBER_QUEUE: usize = 16;

struct Subscriber {
    id: u64,
    sender: mpsc::Sender<Bytes>,
}

struct WorldChannel {
    runner: Arc<WorldRunner>,
    subscribers: Vec<Subscriber>,
    task: Option<tokio::task::JoinHandle<()>>,
    next_subscriber_id: u64,
}

/// Handle returned to a WebSocket session: frames arrive on `receiver`
/// until the caller unsubscribes.
pub struct Subscription {
    pub world_id: WorldId,
    pub subscriber_id: u64,
    pub receiver: mpsc::Receiver<Bytes>,
}

pub struct BroadcastHub {
    channels: Mutex<HashMap<WorldId, WorldChannel>>,
    emit_interval: Duration,
}

impl BroadcastHub {
    /// `emit_interval` defaults to the runner frame rate divided by its
    /// websocket update interval (~15 Hz at the defaults).
    pub fn new(emit_interval: Duration) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            emit_interval,
        }
    }

    /// Make a world broadcastable. Idempotent.
    pub fn register(&self, runner: Arc<WorldRunner>) {
        let mut channels = self.channels.lock();
        channels
            .entry(runner.world_id().clone())
            .or_insert_with(|| WorldChannel {
                runner,
                subscribers: Vec::new(),
                task: None,
                next_subscriber_id: 0,
            });
    }

    /// Subscribe to a world's frames. Returns the subscription plus one
    /// immediate full-state frame, or `None` for an unregistered world.
    pub fn subscribe(self: &Arc<Self>, world_id: &str) -> Option<(Subscription, Bytes)> {
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_QUEUE);
        let (subscriber_id, runner) = {
            let mut channels = self.channels.lock();
            let channel = channels.get_mut(world_id)?;
            channel.next_subscriber_id += 1;
            let id = channel.next_subscriber_id;
            channel.subscribers.push(Subscriber { id, sender });
            if channel
                .task
                .as_ref()
                .map(|t| t.is_finished())
                .unwrap_or(true)
            {
                channel.task = Some(self.spawn_tick_task(world_id.to_string()));
            }
            (id, channel.runner.clone())
        };

        // New clients render immediately from one self-contained frame.
        let full = runner.get_state(true, false);
        let initial = Bytes::from(runner.serialize_state(&full));

        debug!(
            "Subscriber {} attached to world {}",
            subscriber_id,
            short(world_id)
        );
        Some((
            Subscription {
                world_id: world_id.to_string(),
                subscriber_id,
                receiver,
            },
            initial,
        ))
    }

    pub fn unsubscribe(&self, world_id: &str, subscriber_id: u64) {
        let mut channels = self.channels.lock();
        if let Some(channel) = channels.get_mut(world_id) {
            channel.subscribers.retain(|s| s.id != subscriber_id);
            debug!(
                "Subscriber {} detached from world {}",
                subscriber_id,
                short(world_id)
            );
        }
    }

    pub fn subscriber_count(&self, world_id: &str) -> usize {
        self.channels
            .lock()
            .get(world_id)
            .map(|c| c.subscribers.len())
            .unwrap_or(0)
    }

    /// Drop a world's channel entirely (world deletion / shutdown).
    pub fn remove_world(&self, world_id: &str) {
        let removed = self.channels.lock().remove(world_id);
        if let Some(channel) = removed {
            if let Some(task) = channel.task {
                task.abort();
            }
            info!("Broadcast stopped for world {}", short(world_id));
        }
    }

    /// Stop every tick task and drop all subscribers.
    pub fn stop_all(&self) {
        let mut channels = self.channels.lock();
        for (world_id, channel) in channels.iter_mut() {
            if let Some(task) = channel.task.take() {
                task.abort();
            }
            channel.subscribers.clear();
            debug!("Broadcast task stopped for world {}", short(world_id));
        }
    }

    fn spawn_tick_task(self: &Arc<Self>, world_id: WorldId) -> tokio::task::JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(hub.emit_interval).await;

                // Grab the runner and sender list without holding the lock
                // across sends.
                let snapshot = {
                    let channels = hub.channels.lock();
                    channels.get(&world_id).map(|c| {
                        (
                            c.runner.clone(),
                            c.subscribers
                                .iter()
                                .map(|s| (s.id, s.sender.clone()))
                                .collect::<Vec<_>>(),
                        )
                    })
                };
                let Some((runner, senders)) = snapshot else {
                    break;
                };

                if senders.is_empty() {
                    // Park the task; the next subscribe re-spawns it.
                    let mut channels = hub.channels.lock();
                    if let Some(channel) = channels.get_mut(&world_id) {
                        if channel.subscribers.is_empty() {
                            channel.task = None;
                            debug!("Broadcast parked for idle world {}", short(&world_id));
                            break;
                        }
                    } else {
                        break;
                    }
                    continue;
                }

                // Degraded runners stay responsive to commands but do not
                // broadcast.
                if runner.degraded() {
                    continue;
                }

                let payload = runner.get_state(false, true);
                let bytes = Bytes::from(runner.serialize_state(&payload));

                let mut dead = Vec::new();
                for (id, sender) in &senders {
                    match sender.try_send(bytes.clone()) {
                        Ok(()) => {}
                        // A slow client just skips this frame.
                        Err(mpsc::error::TrySendError::Full(_)) => {}
                        Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*id),
                    }
                }
                if !dead.is_empty() {
                    let mut channels = hub.channels.lock();
                    if let Some(channel) = channels.get_mut(&world_id) {
                        channel.subscribers.retain(|s| !dead.contains(&s.id));
                    }
                }
            }
        })
    }
}
