//! Poll Scheduler - one loop per physical link
//!
//! Every channel on the link keeps its own `next_due` instant. The loop
//! sleeps until the earliest one, then polls every due channel in
//! `(next_due, registration order)` order, strictly one read at a time on
//! the shared `Transport`. After each attempt, good or bad, the channel is
//! rescheduled at `attempt start + interval`, so a slow read cannot push the
//! schedule later and a stalled channel never bursts to catch up.
//!
//! Configuration changes arrive over an mpsc channel and are applied only
//! between reads. Cancellation is observed while sleeping and between
//! reads; an in-flight read always runs to completion or to its timeout.

use chrono::{DateTime, Utc};
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::channel::Channel;
use super::transform;
use super::transport::Transport;
use crate::live_buffer::LiveBuffer;
use crate::storage::SampleQueue;
use crate::types::{ChannelHealth, ChannelStatus, ConnectionState, HealthTransition};

const HEALTH_EVENT_CAPACITY: usize = 64;

/// Wall-clock timestamps derived from the tokio clock, so sample times stay
/// monotonic and follow paused time in tests.
#[derive(Debug, Clone, Copy)]
pub struct WallClock {
    base_utc: DateTime<Utc>,
    base_instant: Instant,
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl WallClock {
    pub fn new() -> Self {
        Self {
            base_utc: Utc::now(),
            base_instant: Instant::now(),
        }
    }

    pub fn at(&self, instant: Instant) -> DateTime<Utc> {
        let elapsed = instant.saturating_duration_since(self.base_instant);
        chrono::Duration::from_std(elapsed)
            .map_or(self.base_utc, |d| self.base_utc + d)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.at(Instant::now())
    }
}

/// A configuration change for a running scheduler.
#[derive(Debug, Clone)]
pub enum ChannelChange {
    /// Add a new channel or replace the definition of an existing one
    Upsert(Channel),
    Remove(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("poll loop for link '{0}' terminated abnormally")]
    Crashed(String),
}

// ============================================================================
// Poll loop (owned by the spawned task while running)
// ============================================================================

#[derive(Debug)]
struct Slot {
    channel: Channel,
    next_due: Instant,
    status: ChannelStatus,
}

impl Slot {
    fn new(channel: Channel) -> Self {
        let status = ChannelStatus {
            name: channel.name.to_string(),
            ..ChannelStatus::default()
        };
        Self {
            channel,
            next_due: Instant::now(),
            status,
        }
    }
}

#[derive(Debug)]
struct PollLoop {
    transport: Transport,
    slots: Vec<Slot>,
    live: Arc<LiveBuffer>,
    queue: SampleQueue,
    degraded_after: u32,
    clock: WallClock,
    changes: mpsc::UnboundedReceiver<ChannelChange>,
    health_tx: broadcast::Sender<HealthTransition>,
    status: Arc<RwLock<Vec<ChannelStatus>>>,
}

impl PollLoop {
    async fn run(mut self, cancel: CancellationToken) -> Self {
        info!(
            link = %self.transport.name(),
            endpoint = %self.transport.endpoint(),
            channels = self.slots.len(),
            "Poll scheduler started"
        );

        loop {
            while let Ok(change) = self.changes.try_recv() {
                self.apply(change);
            }
            if cancel.is_cancelled() {
                break;
            }

            let Some(next_due) = self.slots.iter().map(|s| s.next_due).min() else {
                // Nothing to poll until a channel is added
                tokio::select! {
                    () = cancel.cancelled() => break,
                    Some(change) = self.changes.recv() => self.apply(change),
                }
                continue;
            };

            if next_due > Instant::now() {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    Some(change) = self.changes.recv() => {
                        self.apply(change);
                        continue;
                    }
                    () = tokio::time::sleep_until(next_due) => {}
                }
            }

            let now = Instant::now();
            let mut due: Vec<usize> = (0..self.slots.len())
                .filter(|&i| self.slots[i].next_due <= now)
                .collect();
            due.sort_by_key(|&i| (self.slots[i].next_due, i));

            for idx in due {
                if cancel.is_cancelled() {
                    break;
                }
                self.poll_slot(idx).await;
            }
        }

        self.transport.disconnect().await;
        info!(link = %self.transport.name(), "Poll scheduler stopped");
        self
    }

    async fn poll_slot(&mut self, idx: usize) {
        let channel = self.slots[idx].channel.clone();
        let started = Instant::now();
        let timestamp = self.clock.at(started);

        let result = match self.transport.ensure_connected().await {
            Ok(()) => {
                self.transport
                    .read(channel.slave_id, channel.function_code, channel.address, channel.count)
                    .await
            }
            Err(e) => Err(e),
        };

        let degraded_after = self.degraded_after;
        let slot = &mut self.slots[idx];
        slot.next_due = started + channel.interval;
        slot.status.total_polls += 1;

        let transition = match result {
            Ok(words) => {
                let samples = transform::to_samples(&channel, &words, timestamp);
                for sample in &samples {
                    self.live.push(sample.clone());
                }
                self.queue.enqueue(samples);

                slot.status.consecutive_failures = 0;
                slot.status.last_success = Some(timestamp);
                slot.status.last_error = None;
                (slot.status.health == ChannelHealth::Degraded).then(|| {
                    slot.status.health = ChannelHealth::Healthy;
                    info!(channel = %channel.name, "Channel recovered");
                    (ChannelHealth::Degraded, ChannelHealth::Healthy)
                })
            }
            Err(e) => {
                slot.status.consecutive_failures += 1;
                slot.status.total_failures += 1;
                slot.status.last_error = Some(e.to_string());
                debug!(
                    channel = %channel.name,
                    failures = slot.status.consecutive_failures,
                    error = %e,
                    "Poll failed"
                );
                (slot.status.health == ChannelHealth::Healthy
                    && slot.status.consecutive_failures >= degraded_after)
                    .then(|| {
                        slot.status.health = ChannelHealth::Degraded;
                        warn!(
                            channel = %channel.name,
                            failures = slot.status.consecutive_failures,
                            error = %e,
                            "Channel degraded"
                        );
                        (ChannelHealth::Healthy, ChannelHealth::Degraded)
                    })
            }
        };

        if let Some((from, to)) = transition {
            let _ = self.health_tx.send(HealthTransition {
                channel: channel.name.to_string(),
                from,
                to,
            });
        }
        self.publish_status();
    }

    fn apply(&mut self, change: ChannelChange) {
        match change {
            ChannelChange::Upsert(channel) => {
                if let Some(slot) = self
                    .slots
                    .iter_mut()
                    .find(|s| s.channel.name == channel.name)
                {
                    // Keep counters and schedule; a shorter interval takes
                    // effect from the next attempt
                    debug!(channel = %channel.name, "Channel updated");
                    slot.channel = channel;
                } else {
                    debug!(channel = %channel.name, "Channel added");
                    self.slots.push(Slot::new(channel));
                }
            }
            ChannelChange::Remove(name) => {
                let before = self.slots.len();
                self.slots.retain(|s| *s.channel.name != *name);
                if self.slots.len() < before {
                    // A read that finished after the caller cleared the
                    // series may have pushed it back
                    self.live.remove_channel(&name);
                    debug!(channel = %name, "Channel removed");
                }
            }
        }
        self.publish_status();
    }

    fn publish_status(&self) {
        let snapshot = self.slots.iter().map(|s| s.status.clone()).collect();
        *self.status.write().unwrap_or_else(|e| e.into_inner()) = snapshot;
    }
}

// ============================================================================
// Public handle
// ============================================================================

#[derive(Debug)]
enum Worker {
    Idle(Box<PollLoop>),
    Running {
        cancel: CancellationToken,
        handle: JoinHandle<PollLoop>,
    },
    Crashed,
}

/// Drives all channels of one link.
///
/// `start` is a no-op while already running. `stop` waits for the loop to
/// finish its in-flight read and hands the transport back, so the scheduler
/// can be started again.
#[derive(Debug)]
pub struct PollScheduler {
    link: String,
    endpoint: String,
    worker: Worker,
    connection: watch::Receiver<ConnectionState>,
    health_tx: broadcast::Sender<HealthTransition>,
    change_tx: mpsc::UnboundedSender<ChannelChange>,
    status: Arc<RwLock<Vec<ChannelStatus>>>,
}

impl PollScheduler {
    pub fn new(
        transport: Transport,
        channels: Vec<Channel>,
        live: Arc<LiveBuffer>,
        queue: SampleQueue,
        degraded_after: u32,
    ) -> Self {
        let (change_tx, changes) = mpsc::unbounded_channel();
        let (health_tx, _) = broadcast::channel(HEALTH_EVENT_CAPACITY);
        let status = Arc::new(RwLock::new(Vec::new()));

        let poll_loop = PollLoop {
            transport,
            slots: channels.into_iter().map(Slot::new).collect(),
            live,
            queue,
            degraded_after: degraded_after.max(1),
            clock: WallClock::new(),
            changes,
            health_tx: health_tx.clone(),
            status: status.clone(),
        };
        poll_loop.publish_status();

        Self {
            link: poll_loop.transport.name().to_string(),
            endpoint: poll_loop.transport.endpoint(),
            connection: poll_loop.transport.subscribe(),
            worker: Worker::Idle(Box::new(poll_loop)),
            health_tx,
            change_tx,
            status,
        }
    }

    pub fn link(&self) -> &str {
        &self.link
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub const fn is_running(&self) -> bool {
        matches!(self.worker, Worker::Running { .. })
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.borrow().clone()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    pub fn subscribe_health(&self) -> broadcast::Receiver<HealthTransition> {
        self.health_tx.subscribe()
    }

    /// Per-channel counters in registration order.
    pub fn channel_status(&self) -> Vec<ChannelStatus> {
        self.status.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Spawn the poll loop. No-op if already running.
    pub fn start(&mut self) -> Result<(), SchedulerError> {
        match std::mem::replace(&mut self.worker, Worker::Crashed) {
            Worker::Idle(poll_loop) => {
                let cancel = CancellationToken::new();
                let handle = tokio::spawn(poll_loop.run(cancel.clone()));
                self.worker = Worker::Running { cancel, handle };
                Ok(())
            }
            running @ Worker::Running { .. } => {
                debug!(link = %self.link, "Scheduler already running");
                self.worker = running;
                Ok(())
            }
            Worker::Crashed => Err(SchedulerError::Crashed(self.link.clone())),
        }
    }

    /// Signal the loop and wait for it to finish. No-op if not running.
    pub async fn stop(&mut self) -> Result<(), SchedulerError> {
        match std::mem::replace(&mut self.worker, Worker::Crashed) {
            Worker::Running { cancel, handle } => {
                cancel.cancel();
                match handle.await {
                    Ok(poll_loop) => {
                        self.worker = Worker::Idle(Box::new(poll_loop));
                        Ok(())
                    }
                    Err(e) => {
                        error!(link = %self.link, error = %e, "Poll loop did not shut down cleanly");
                        Err(SchedulerError::Crashed(self.link.clone()))
                    }
                }
            }
            Worker::Crashed => Err(SchedulerError::Crashed(self.link.clone())),
            idle => {
                self.worker = idle;
                Ok(())
            }
        }
    }

    pub fn upsert_channel(&mut self, channel: Channel) {
        self.submit(ChannelChange::Upsert(channel));
    }

    pub fn remove_channel(&mut self, name: &str) {
        self.submit(ChannelChange::Remove(name.to_string()));
    }

    fn submit(&mut self, change: ChannelChange) {
        match &mut self.worker {
            Worker::Idle(poll_loop) => poll_loop.apply(change),
            Worker::Running { .. } => {
                if self.change_tx.send(change).is_err() {
                    warn!(link = %self.link, "Poll loop gone, channel change discarded");
                }
            }
            Worker::Crashed => {
                warn!(link = %self.link, "Scheduler crashed, channel change discarded");
            }
        }
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        if let Worker::Running { cancel, .. } = &self.worker {
            cancel.cancel();
        }
    }
}
