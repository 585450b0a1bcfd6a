//! Acquisition Configuration - links, channels and intervals as TOML values
//!
//! Every struct implements `Default`, so an empty file (or no file at all)
//! yields a valid, channel-less configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use super::defaults;
use crate::acquisition::channel::{Channel, ChannelRegistry};
use crate::acquisition::rtu;
use crate::acquisition::transform::RegisterMode;

/// Environment variable naming a config file.
pub const CONFIG_ENV_VAR: &str = "MODBUS_DAQ_CONFIG";

/// File looked up in the working directory when the env var is unset.
pub const LOCAL_CONFIG_FILE: &str = "modbus_daq.toml";

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config I/O error ({}): {1}", .0.display())]
    Io(PathBuf, #[source] std::io::Error),

    #[error("config parse error ({}): {1}", .0.display())]
    Parse(PathBuf, #[source] toml::de::Error),

    #[error("config serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("config validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("channel '{channel}': {reason}")]
    InvalidChannel { channel: String, reason: String },

    #[error("duplicate channel name '{0}'")]
    DuplicateChannel(String),

    #[error("channel limit reached ({max} channels)")]
    TooManyChannels { max: usize },

    #[error("unknown channel '{0}'")]
    UnknownChannel(String),

    #[error("unknown link '{0}'")]
    UnknownLink(String),

    #[error("channel '{channel}' belongs to link '{owner}', not '{requested}'")]
    WrongLink {
        channel: String,
        owner: String,
        requested: String,
    },
}

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration for an acquisition session.
///
/// Load with `AcquisitionConfig::load()` which searches:
/// 1. `$MODBUS_DAQ_CONFIG`
/// 2. `./modbus_daq.toml`
/// 3. Built-in defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    #[serde(default)]
    pub acquisition: PollingConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub live: LiveConfig,

    /// Physical links, each with the channels polled over it
    #[serde(default)]
    pub links: Vec<LinkConfig>,
}

impl AcquisitionConfig {
    /// Load configuration using the standard search order.
    pub fn load() -> Self {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), links = config.links.len(), "Loaded config from {CONFIG_ENV_VAR}");
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from {CONFIG_ENV_VAR}, falling back");
                    }
                }
            } else {
                warn!(path = %path, "{CONFIG_ENV_VAR} points to non-existent file, falling back");
            }
        }

        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!(links = config.links.len(), "Loaded config from ./{LOCAL_CONFIG_FILE}");
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./{LOCAL_CONFIG_FILE}, using defaults");
                }
            }
        }

        info!("No {LOCAL_CONFIG_FILE} found, using built-in defaults (no channels)");
        Self::default()
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config = Self::from_toml_str(&contents)
            .map_err(|e| match e {
                ConfigError::Parse(_, inner) => ConfigError::Parse(path.to_path_buf(), inner),
                other => other,
            })?;
        Ok(config)
    }

    /// Parse and validate TOML text. Unknown keys are logged, not rejected.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        for w in super::validation::validate_unknown_keys(contents) {
            warn!("{}", w);
        }

        let config: Self = toml::from_str(contents)
            .map_err(|e| ConfigError::Parse(PathBuf::from("<inline>"), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = self.to_toml()?;
        std::fs::write(path, contents).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        info!(path = %path.display(), "Config saved");
        Ok(())
    }

    /// Poll interval used by channels that do not set their own.
    pub fn default_interval(&self) -> Duration {
        Duration::from_millis(self.acquisition.default_interval_ms)
    }

    /// Validate every section, collecting all problems before failing.
    ///
    /// Channels go through the same registry checks used at runtime, so a
    /// config that validates here can be started without `ConfigError`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        let interval = self.acquisition.default_interval_ms;
        if !(defaults::MIN_POLL_INTERVAL_MS..=defaults::MAX_POLL_INTERVAL_MS).contains(&interval) {
            errors.push(format!(
                "acquisition.default_interval_ms = {interval} is outside {}-{} ms",
                defaults::MIN_POLL_INTERVAL_MS,
                defaults::MAX_POLL_INTERVAL_MS
            ));
        }
        if self.acquisition.degraded_after == 0 {
            errors.push("acquisition.degraded_after must be at least 1".to_string());
        }

        if self.storage.interval_secs > defaults::MAX_STORAGE_INTERVAL_SECS {
            errors.push(format!(
                "storage.interval_secs = {} exceeds {} s",
                self.storage.interval_secs,
                defaults::MAX_STORAGE_INTERVAL_SECS
            ));
        }
        if self.storage.queue_ceiling == 0 {
            errors.push("storage.queue_ceiling must be greater than 0".to_string());
        }
        if self.live.window_capacity == 0 {
            errors.push("live.window_capacity must be greater than 0".to_string());
        }

        let mut link_names = HashSet::new();
        let mut registry = ChannelRegistry::new();
        for link in &self.links {
            let name = link.name.trim();
            if name.is_empty() {
                errors.push("links: link name must not be empty".to_string());
            } else if !link_names.insert(name.to_string()) {
                errors.push(format!("links: duplicate link name '{name}'"));
            }
            if link.failure_threshold == 0 {
                errors.push(format!("links.{name}.failure_threshold must be at least 1"));
            }
            if link.read_timeout_ms == Some(0) {
                errors.push(format!("links.{name}.read_timeout_ms must be greater than 0"));
            }
            errors.extend(link.transport.problems(name));

            for channel_cfg in &link.channels {
                let added = Channel::from_config(channel_cfg, self.default_interval())
                    .and_then(|channel| registry.insert(name, channel));
                if let Err(e) = added {
                    errors.push(e.to_string());
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_interval_ms")]
    pub default_interval_ms: u64,

    /// Consecutive failures before a channel is marked `Degraded`
    #[serde(default = "default_degraded_after")]
    pub degraded_after: u32,
}

fn default_interval_ms() -> u64 {
    defaults::DEFAULT_POLL_INTERVAL_MS
}
fn default_degraded_after() -> u32 {
    defaults::DEGRADED_AFTER_FAILURES
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            default_interval_ms: default_interval_ms(),
            degraded_after: default_degraded_after(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// sled database directory
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,

    /// Flush cadence in seconds; 0 keeps the session live-only
    #[serde(default = "default_storage_interval")]
    pub interval_secs: u64,

    /// Pending samples kept before the oldest are dropped
    #[serde(default = "default_queue_ceiling")]
    pub queue_ceiling: usize,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from(defaults::STORAGE_PATH)
}
fn default_storage_interval() -> u64 {
    defaults::STORAGE_INTERVAL_SECS
}
fn default_queue_ceiling() -> usize {
    defaults::PENDING_QUEUE_CEILING
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
            interval_secs: default_storage_interval(),
            queue_ceiling: default_queue_ceiling(),
        }
    }
}

impl StorageConfig {
    /// `None` when persistence is disabled.
    pub fn flush_interval(&self) -> Option<Duration> {
        (self.interval_secs > 0).then(|| Duration::from_secs(self.interval_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    #[serde(default = "default_window_capacity")]
    pub window_capacity: usize,
}

fn default_window_capacity() -> usize {
    defaults::LIVE_WINDOW_CAPACITY
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            window_capacity: default_window_capacity(),
        }
    }
}

// ============================================================================
// Links
// ============================================================================

/// One physical Modbus link and the channels polled over it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    pub name: String,

    pub transport: TransportConfig,

    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_reconnect_cooldown")]
    pub reconnect_cooldown_ms: u64,

    /// Overrides the per-transport default round-trip timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_timeout_ms: Option<u64>,

    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

fn default_failure_threshold() -> u32 {
    defaults::TRANSPORT_FAILURE_THRESHOLD
}
fn default_reconnect_cooldown() -> u64 {
    defaults::RECONNECT_COOLDOWN_MS
}

impl LinkConfig {
    pub fn new(name: impl Into<String>, transport: TransportConfig) -> Self {
        Self {
            name: name.into(),
            transport,
            failure_threshold: default_failure_threshold(),
            reconnect_cooldown_ms: default_reconnect_cooldown(),
            read_timeout_ms: None,
            channels: Vec::new(),
        }
    }

    /// Effective round-trip timeout. RTU links derive theirs from the baud rate.
    pub fn read_timeout(&self) -> Duration {
        if let Some(ms) = self.read_timeout_ms {
            return Duration::from_millis(ms);
        }
        match &self.transport {
            TransportConfig::Tcp { .. } => Duration::from_millis(defaults::TCP_READ_TIMEOUT_MS),
            TransportConfig::Rtu { baud_rate, .. } => rtu::derived_timeout(*baud_rate),
        }
    }

    pub fn reconnect_cooldown(&self) -> Duration {
        Duration::from_millis(self.reconnect_cooldown_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    Tcp {
        host: String,
        #[serde(default = "default_tcp_port")]
        port: u16,
    },
    Rtu {
        device: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
        #[serde(default)]
        parity: Parity,
    },
}

fn default_tcp_port() -> u16 {
    defaults::MODBUS_TCP_PORT
}
fn default_baud_rate() -> u32 {
    defaults::RTU_BAUD_RATE
}
fn default_data_bits() -> u8 {
    defaults::RTU_DATA_BITS
}
fn default_stop_bits() -> u8 {
    defaults::RTU_STOP_BITS
}

impl TransportConfig {
    fn problems(&self, link: &str) -> Vec<String> {
        let mut errors = Vec::new();
        match self {
            Self::Tcp { host, port } => {
                if host.trim().is_empty() {
                    errors.push(format!("links.{link}.transport.host must not be empty"));
                }
                if *port == 0 {
                    errors.push(format!("links.{link}.transport.port must not be 0"));
                }
            }
            Self::Rtu {
                device,
                baud_rate,
                data_bits,
                stop_bits,
                ..
            } => {
                if device.trim().is_empty() {
                    errors.push(format!("links.{link}.transport.device must not be empty"));
                }
                if *baud_rate == 0 {
                    errors.push(format!("links.{link}.transport.baud_rate must be greater than 0"));
                }
                if !(5..=8).contains(data_bits) {
                    errors.push(format!("links.{link}.transport.data_bits = {data_bits} (expected 5-8)"));
                }
                if !matches!(stop_bits, 1 | 2) {
                    errors.push(format!("links.{link}.transport.stop_bits = {stop_bits} (expected 1 or 2)"));
                }
            }
        }
        errors
    }

    /// Short human-readable endpoint, used in logs.
    pub fn endpoint(&self) -> String {
        match self {
            Self::Tcp { host, port } => format!("tcp://{host}:{port}"),
            Self::Rtu {
                device, baud_rate, ..
            } => format!("rtu://{device}@{baud_rate}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

// ============================================================================
// Channels
// ============================================================================

/// Raw channel definition as written in the config file.
///
/// Turned into a validated `Channel` by `Channel::from_config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,

    pub slave_id: u8,

    pub address: u16,

    #[serde(default = "default_count")]
    pub count: u16,

    #[serde(default = "default_function_code")]
    pub function_code: u8,

    #[serde(default)]
    pub unit: String,

    #[serde(default = "default_scale")]
    pub scale: f64,

    #[serde(default)]
    pub offset: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,

    #[serde(default)]
    pub register_mode: RegisterMode,
}

fn default_count() -> u16 {
    1
}
fn default_function_code() -> u8 {
    3
}
fn default_scale() -> f64 {
    1.0
}

impl ChannelConfig {
    /// Holding-register channel with every optional field at its default.
    pub fn new(name: impl Into<String>, slave_id: u8, address: u16) -> Self {
        Self {
            name: name.into(),
            slave_id,
            address,
            count: default_count(),
            function_code: default_function_code(),
            unit: String::new(),
            scale: default_scale(),
            offset: 0.0,
            interval_ms: None,
            color: None,
            register_mode: RegisterMode::default(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[acquisition]
default_interval_ms = 500

[storage]
path = "/tmp/daq.db"
interval_secs = 10

[[links]]
name = "plc-1"
failure_threshold = 5
[links.transport]
kind = "tcp"
host = "192.168.1.10"

[[links.channels]]
name = "boiler_temp"
slave_id = 5
address = 100
scale = 0.1
unit = "degC"

[[links]]
name = "rs485"
[links.transport]
kind = "rtu"
device = "/dev/ttyUSB0"
baud_rate = 19200
parity = "even"

[[links.channels]]
name = "flow"
slave_id = 2
address = 0
count = 2
function_code = 4
interval_ms = 250
register_mode = "first_only"
"#;

    #[test]
    fn test_default_config_is_valid() {
        let config = AcquisitionConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.links.is_empty());
        assert_eq!(config.storage.interval_secs, 5);
        assert_eq!(config.live.window_capacity, 1000);
    }

    #[test]
    fn test_parse_full_config() {
        let config = AcquisitionConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.links.len(), 2);
        assert_eq!(config.acquisition.default_interval_ms, 500);

        let tcp = &config.links[0];
        assert_eq!(tcp.failure_threshold, 5);
        assert_eq!(
            tcp.transport,
            TransportConfig::Tcp {
                host: "192.168.1.10".into(),
                port: 502
            }
        );
        assert_eq!(tcp.channels[0].function_code, 3);
        assert_eq!(tcp.channels[0].count, 1);
        assert_eq!(tcp.read_timeout(), Duration::from_millis(1000));

        let rtu = &config.links[1];
        assert!(matches!(
            rtu.transport,
            TransportConfig::Rtu {
                baud_rate: 19200,
                parity: Parity::Even,
                ..
            }
        ));
        assert_eq!(rtu.channels[0].register_mode, RegisterMode::FirstOnly);
    }

    #[test]
    fn test_empty_string_parses_to_defaults() {
        let config = AcquisitionConfig::from_toml_str("").unwrap();
        assert_eq!(config.acquisition.default_interval_ms, 1000);
    }

    #[test]
    fn test_validation_collects_every_problem() {
        let mut config = AcquisitionConfig::from_toml_str(SAMPLE).unwrap();
        config.acquisition.default_interval_ms = 5;
        config.storage.queue_ceiling = 0;
        config.links[1].name = "plc-1".into();
        config.links[0].channels[0].slave_id = 0;

        match config.validate() {
            Err(ConfigError::Validation(errors)) => {
                assert_eq!(errors.len(), 4, "{errors:?}");
                assert!(errors.iter().any(|e| e.contains("default_interval_ms")));
                assert!(errors.iter().any(|e| e.contains("duplicate link")));
                assert!(errors.iter().any(|e| e.contains("slave")));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_channel_across_links_rejected() {
        let mut config = AcquisitionConfig::from_toml_str(SAMPLE).unwrap();
        config.links[1].channels[0].name = "boiler_temp".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate channel"));
    }

    #[test]
    fn test_storage_interval_zero_disables_flush() {
        let mut storage = StorageConfig::default();
        assert_eq!(storage.flush_interval(), Some(Duration::from_secs(5)));
        storage.interval_secs = 0;
        assert_eq!(storage.flush_interval(), None);
    }

    #[test]
    fn test_roundtrip_through_toml() {
        let config = AcquisitionConfig::from_toml_str(SAMPLE).unwrap();
        let text = config.to_toml().unwrap();
        let again = AcquisitionConfig::from_toml_str(&text).unwrap();
        assert_eq!(again.links[1].channels, config.links[1].channels);
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daq.toml");
        let config = AcquisitionConfig::from_toml_str(SAMPLE).unwrap();
        config.save_to_file(&path).unwrap();

        let loaded = AcquisitionConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.links.len(), 2);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = AcquisitionConfig::load_from_file(Path::new("/nonexistent/daq.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(..)));
    }
}
