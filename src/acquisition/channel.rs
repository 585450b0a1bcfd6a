//! Validated channel definitions and the channel registry.
//!
//! A `Channel` can only be built through `Channel::from_config`, so every
//! value that reaches a scheduler has already passed the range checks.

use std::sync::Arc;
use std::time::Duration;

use super::transform::RegisterMode;
use crate::config::{defaults, ChannelConfig, ConfigError};
use crate::types::FunctionCode;

/// One independently scheduled acquisition target.
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub name: Arc<str>,
    pub slave_id: u8,
    pub address: u16,
    pub count: u16,
    pub function_code: FunctionCode,
    pub unit: Arc<str>,
    pub scale: f64,
    pub offset: f64,
    pub interval: Duration,
    pub color: Option<String>,
    pub register_mode: RegisterMode,
}

impl Channel {
    /// Validate a raw definition. `default_interval` applies when the
    /// definition has no `interval_ms` of its own.
    pub fn from_config(cfg: &ChannelConfig, default_interval: Duration) -> Result<Self, ConfigError> {
        let name = cfg.name.trim();
        let invalid = |reason: String| ConfigError::InvalidChannel {
            channel: name.to_string(),
            reason,
        };

        if name.is_empty() {
            return Err(ConfigError::InvalidChannel {
                channel: cfg.name.clone(),
                reason: "name must not be empty".to_string(),
            });
        }
        if !(defaults::MIN_SLAVE_ID..=defaults::MAX_SLAVE_ID).contains(&cfg.slave_id) {
            return Err(invalid(format!(
                "slave_id {} outside {}-{}",
                cfg.slave_id,
                defaults::MIN_SLAVE_ID,
                defaults::MAX_SLAVE_ID
            )));
        }
        let function_code = FunctionCode::try_from(cfg.function_code).map_err(invalid)?;
        if cfg.count == 0 || cfg.count > function_code.max_count() {
            return Err(invalid(format!(
                "count {} outside 1-{} for function code {}",
                cfg.count,
                function_code.max_count(),
                function_code.code()
            )));
        }
        if u32::from(cfg.address) + u32::from(cfg.count) > 65_536 {
            return Err(invalid(format!(
                "address {} + count {} runs past the end of the register space",
                cfg.address, cfg.count
            )));
        }
        if !cfg.scale.is_finite() || !cfg.offset.is_finite() {
            return Err(invalid("scale and offset must be finite numbers".to_string()));
        }

        let interval = cfg
            .interval_ms
            .map_or(default_interval, Duration::from_millis);
        let min = Duration::from_millis(defaults::MIN_POLL_INTERVAL_MS);
        let max = Duration::from_millis(defaults::MAX_POLL_INTERVAL_MS);
        if interval < min || interval > max {
            return Err(invalid(format!(
                "interval {} ms outside {}-{} ms",
                interval.as_millis(),
                defaults::MIN_POLL_INTERVAL_MS,
                defaults::MAX_POLL_INTERVAL_MS
            )));
        }

        Ok(Self {
            name: Arc::from(name),
            slave_id: cfg.slave_id,
            address: cfg.address,
            count: cfg.count,
            function_code,
            unit: Arc::from(cfg.unit.as_str()),
            scale: cfg.scale,
            offset: cfg.offset,
            interval,
            color: cfg.color.clone().filter(|c| !c.trim().is_empty()),
            register_mode: cfg.register_mode,
        })
    }

    /// Inverse of `from_config`, for saving presets and configs.
    pub fn to_config(&self) -> ChannelConfig {
        ChannelConfig {
            name: self.name.to_string(),
            slave_id: self.slave_id,
            address: self.address,
            count: self.count,
            function_code: self.function_code.code(),
            unit: self.unit.to_string(),
            scale: self.scale,
            offset: self.offset,
            interval_ms: u64::try_from(self.interval.as_millis()).ok(),
            color: self.color.clone(),
            register_mode: self.register_mode,
        }
    }

    /// Register addresses that produce samples.
    pub fn sample_addresses(&self) -> impl Iterator<Item = u16> + '_ {
        let n = match self.register_mode {
            RegisterMode::PerRegister => self.count,
            RegisterMode::FirstOnly => 1,
        };
        (0..n).map(move |i| self.address.wrapping_add(i))
    }
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Debug, Clone)]
struct RegistryEntry {
    link: String,
    channel: Channel,
}

/// Authoritative set of active channels, in registration order.
///
/// Holds at most `MAX_CHANNELS` entries with unique names across all links.
#[derive(Debug, Clone, Default)]
pub struct ChannelRegistry {
    entries: Vec<RegistryEntry>,
    colors_assigned: usize,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add a channel to `link`. Returns the stored copy, color filled in.
    pub fn insert(&mut self, link: &str, mut channel: Channel) -> Result<Channel, ConfigError> {
        if self.position(&channel.name).is_some() {
            return Err(ConfigError::DuplicateChannel(channel.name.to_string()));
        }
        if self.entries.len() >= defaults::MAX_CHANNELS {
            return Err(ConfigError::TooManyChannels {
                max: defaults::MAX_CHANNELS,
            });
        }
        if channel.color.is_none() {
            let color = defaults::CHANNEL_PALETTE[self.colors_assigned % defaults::CHANNEL_PALETTE.len()];
            channel.color = Some(color.to_string());
            self.colors_assigned += 1;
        }
        self.entries.push(RegistryEntry {
            link: link.to_string(),
            channel: channel.clone(),
        });
        Ok(channel)
    }

    /// Replace the parameters of an existing channel, keeping its
    /// registration slot. The channel must stay on the same link.
    pub fn update(&mut self, link: &str, mut channel: Channel) -> Result<Channel, ConfigError> {
        let idx = self
            .position(&channel.name)
            .ok_or_else(|| ConfigError::UnknownChannel(channel.name.to_string()))?;
        let entry = &mut self.entries[idx];
        if entry.link != link {
            return Err(ConfigError::WrongLink {
                channel: channel.name.to_string(),
                owner: entry.link.clone(),
                requested: link.to_string(),
            });
        }
        if channel.color.is_none() {
            channel.color.clone_from(&entry.channel.color);
        }
        entry.channel = channel.clone();
        Ok(channel)
    }

    /// Remove a channel, returning its link and last definition.
    pub fn remove(&mut self, name: &str) -> Result<(String, Channel), ConfigError> {
        let idx = self
            .position(name)
            .ok_or_else(|| ConfigError::UnknownChannel(name.to_string()))?;
        let entry = self.entries.remove(idx);
        Ok((entry.link, entry.channel))
    }

    pub fn get(&self, name: &str) -> Option<&Channel> {
        self.position(name).map(|i| &self.entries[i].channel)
    }

    pub fn link_of(&self, name: &str) -> Option<&str> {
        self.position(name).map(|i| self.entries[i].link.as_str())
    }

    /// Channels of one link, in registration order.
    pub fn channels_for(&self, link: &str) -> Vec<Channel> {
        self.entries
            .iter()
            .filter(|e| e.link == link)
            .map(|e| e.channel.clone())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Channel)> {
        self.entries.iter().map(|e| (e.link.as_str(), &e.channel))
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| &*e.channel.name == name)
    }
}
