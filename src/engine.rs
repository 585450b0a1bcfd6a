//! Acquisition engine - one session of links, channels and persistence
//!
//! Owns the channel registry, one `PollScheduler` per link, the shared live
//! buffer and the persistence writer. All configuration changes go through
//! here: they are validated against the registry first and only then
//! forwarded to the scheduler of the channel's link.

use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::acquisition::channel::{Channel, ChannelRegistry};
use crate::acquisition::scheduler::{PollScheduler, SchedulerError};
use crate::acquisition::transport::Transport;
use crate::config::{AcquisitionConfig, ChannelConfig, ConfigError, LinkConfig};
use crate::live_buffer::LiveBuffer;
use crate::storage::{PersistenceWriter, QueueStats, SampleQueue, SampleStore, WriterStats};
use crate::types::{ChannelStatus, ConnectionState};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Snapshot of one link for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct LinkStatus {
    pub name: String,
    pub endpoint: String,
    pub connection: ConnectionState,
    pub running: bool,
    pub channels: Vec<ChannelStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub links: Vec<LinkStatus>,
    pub queue: QueueStats,
    /// `None` in live-only mode
    pub writer: Option<WriterStats>,
}

#[derive(Debug)]
struct WriterTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Debug)]
pub struct AcquisitionEngine {
    registry: ChannelRegistry,
    schedulers: Vec<PollScheduler>,
    live: Arc<LiveBuffer>,
    queue: SampleQueue,
    writer: Option<PersistenceWriter>,
    writer_stats: Option<Arc<Mutex<WriterStats>>>,
    writer_task: Option<WriterTask>,
    default_interval: std::time::Duration,
    running: bool,
}

impl AcquisitionEngine {
    /// Build an engine talking to the real TCP/RTU links of `config`.
    ///
    /// `store` is ignored when `storage.interval_secs` is 0.
    pub fn new(
        config: &AcquisitionConfig,
        store: Option<Arc<dyn SampleStore>>,
    ) -> Result<Self, EngineError> {
        Self::with_transports(config, store, Transport::from_link)
    }

    /// Build an engine with caller-supplied transports, one per link.
    pub fn with_transports<F>(
        config: &AcquisitionConfig,
        store: Option<Arc<dyn SampleStore>>,
        mut make_transport: F,
    ) -> Result<Self, EngineError>
    where
        F: FnMut(&LinkConfig) -> Transport,
    {
        config.validate()?;

        let writer = match (store, config.storage.flush_interval()) {
            (Some(store), Some(interval)) => Some(PersistenceWriter::new(
                store,
                interval,
                config.storage.queue_ceiling,
            )),
            (Some(_), None) => {
                info!("storage.interval_secs = 0, running live-only");
                None
            }
            (None, _) => None,
        };
        let queue = writer
            .as_ref()
            .map_or_else(SampleQueue::disabled, PersistenceWriter::queue);
        let live = Arc::new(LiveBuffer::new(config.live.window_capacity));

        let default_interval = config.default_interval();
        let mut registry = ChannelRegistry::new();
        let mut schedulers = Vec::with_capacity(config.links.len());
        for link in &config.links {
            let link_name = link.name.trim();
            for channel_cfg in &link.channels {
                registry.insert(link_name, Channel::from_config(channel_cfg, default_interval)?)?;
            }
            schedulers.push(PollScheduler::new(
                make_transport(link),
                registry.channels_for(link_name),
                live.clone(),
                queue.clone(),
                config.acquisition.degraded_after,
            ));
        }

        Ok(Self {
            registry,
            schedulers,
            live,
            queue,
            writer_stats: writer.as_ref().map(PersistenceWriter::stats_handle),
            writer,
            writer_task: None,
            default_interval,
            running: false,
        })
    }

    pub const fn is_running(&self) -> bool {
        self.running
    }

    pub fn live(&self) -> Arc<LiveBuffer> {
        self.live.clone()
    }

    pub const fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn scheduler(&self, link: &str) -> Option<&PollScheduler> {
        self.schedulers.iter().find(|s| s.link() == link)
    }

    /// Start the writer and every link's scheduler. No-op while running.
    pub fn start(&mut self) -> Result<(), EngineError> {
        if self.running {
            return Ok(());
        }
        if let (Some(writer), None) = (&self.writer, &self.writer_task) {
            let cancel = CancellationToken::new();
            let handle = writer.clone().spawn(cancel.clone());
            self.writer_task = Some(WriterTask { cancel, handle });
        }
        for scheduler in &mut self.schedulers {
            scheduler.start()?;
        }
        self.running = true;
        info!(
            links = self.schedulers.len(),
            channels = self.registry.len(),
            persistence = self.writer.is_some(),
            "Acquisition engine started"
        );
        Ok(())
    }

    /// Stop all schedulers, then let the writer flush what they acquired.
    pub async fn stop(&mut self) -> Result<(), EngineError> {
        let mut first_error = None;
        for scheduler in &mut self.schedulers {
            if let Err(e) = scheduler.stop().await {
                first_error.get_or_insert(e);
            }
        }

        if let Some(task) = self.writer_task.take() {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                warn!(error = %e, "Persistence writer task ended abnormally");
            }
        }

        if self.running {
            info!(pending = self.queue.len(), "Acquisition engine stopped");
        }
        self.running = false;
        first_error.map_or(Ok(()), |e| Err(e.into()))
    }

    /// Validate and register a new channel on `link`.
    pub fn add_channel(&mut self, link: &str, config: &ChannelConfig) -> Result<Channel, EngineError> {
        let idx = self.scheduler_index(link)?;
        let channel = Channel::from_config(config, self.default_interval)?;
        let stored = self.registry.insert(link, channel)?;
        self.schedulers[idx].upsert_channel(stored.clone());
        info!(link, channel = %stored.name, "Channel added");
        Ok(stored)
    }

    /// Replace an existing channel's parameters. Takes effect at the
    /// channel's next poll boundary.
    pub fn update_channel(&mut self, link: &str, config: &ChannelConfig) -> Result<Channel, EngineError> {
        let idx = self.scheduler_index(link)?;
        let channel = Channel::from_config(config, self.default_interval)?;
        let stored = self.registry.update(link, channel)?;
        self.schedulers[idx].upsert_channel(stored.clone());
        info!(link, channel = %stored.name, "Channel updated");
        Ok(stored)
    }

    pub fn remove_channel(&mut self, name: &str) -> Result<Channel, EngineError> {
        let (link, channel) = self.registry.remove(name)?;
        if let Ok(idx) = self.scheduler_index(&link) {
            self.schedulers[idx].remove_channel(name);
        }
        self.live.remove_channel(name);
        info!(link = %link, channel = %name, "Channel removed");
        Ok(channel)
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            running: self.running,
            links: self
                .schedulers
                .iter()
                .map(|s| LinkStatus {
                    name: s.link().to_string(),
                    endpoint: s.endpoint().to_string(),
                    connection: s.connection_state(),
                    running: s.is_running(),
                    channels: s.channel_status(),
                })
                .collect(),
            queue: self.queue.stats(),
            writer: self
                .writer_stats
                .as_ref()
                .map(|s| s.lock().unwrap_or_else(|e| e.into_inner()).clone()),
        }
    }

    fn scheduler_index(&self, link: &str) -> Result<usize, ConfigError> {
        self.schedulers
            .iter()
            .position(|s| s.link() == link)
            .ok_or_else(|| ConfigError::UnknownLink(link.to_string()))
    }
}
