//! Shared data structures for the acquisition pipeline
//!
//! - `FunctionCode`: the four Modbus read operations
//! - `Sample`: one engineering-unit reading produced by a successful poll
//! - `PersistedRecord`: a row of the `modbus_data` history
//! - `ConnectionState` / `ChannelHealth`: link and channel status

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ============================================================================
// Function Codes
// ============================================================================

/// Modbus read function code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum FunctionCode {
    /// 0x01 Read Coils
    Coils,
    /// 0x02 Read Discrete Inputs
    DiscreteInputs,
    /// 0x03 Read Holding Registers
    HoldingRegisters,
    /// 0x04 Read Input Registers
    InputRegisters,
}

impl FunctionCode {
    pub const fn code(self) -> u8 {
        match self {
            Self::Coils => 1,
            Self::DiscreteInputs => 2,
            Self::HoldingRegisters => 3,
            Self::InputRegisters => 4,
        }
    }

    /// Largest quantity a single request may ask for.
    pub const fn max_count(self) -> u16 {
        match self {
            Self::Coils | Self::DiscreteInputs => 2000,
            Self::HoldingRegisters | Self::InputRegisters => 125,
        }
    }

    /// Bit-valued codes return one boolean per address.
    pub const fn is_bit_access(self) -> bool {
        matches!(self, Self::Coils | Self::DiscreteInputs)
    }

    /// Export label, e.g. `0x03`.
    pub fn hex_label(self) -> String {
        format!("0x{:02X}", self.code())
    }
}

impl TryFrom<u8> for FunctionCode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Coils),
            2 => Ok(Self::DiscreteInputs),
            3 => Ok(Self::HoldingRegisters),
            4 => Ok(Self::InputRegisters),
            other => Err(format!("unsupported function code {other} (expected 1-4)")),
        }
    }
}

impl From<FunctionCode> for u8 {
    fn from(fc: FunctionCode) -> Self {
        fc.code()
    }
}

impl std::fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Coils => write!(f, "coils"),
            Self::DiscreteInputs => write!(f, "discrete inputs"),
            Self::HoldingRegisters => write!(f, "holding registers"),
            Self::InputRegisters => write!(f, "input registers"),
        }
    }
}

// ============================================================================
// Samples
// ============================================================================

/// A single acquired value. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Name of the channel that produced it
    pub channel: Arc<str>,
    pub slave_id: u8,
    /// Register address of this value (channel start address + register index)
    pub address: u16,
    pub function_code: FunctionCode,
    pub timestamp: DateTime<Utc>,
    pub raw: u16,
    /// `raw * scale + offset`
    pub value: f64,
    pub unit: Arc<str>,
}

/// One row of the `modbus_data` history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub slave_id: u8,
    pub address: u16,
    pub function_code: FunctionCode,
    pub value: f64,
    pub unit: String,
}

impl PersistedRecord {
    pub fn from_sample(id: u64, sample: &Sample) -> Self {
        Self {
            id,
            timestamp: sample.timestamp,
            slave_id: sample.slave_id,
            address: sample.address,
            function_code: sample.function_code,
            value: sample.value,
            unit: sample.unit.to_string(),
        }
    }
}

// ============================================================================
// Link & Channel Status
// ============================================================================

/// Connection state of one physical link. Written only by its `Transport`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

impl ConnectionState {
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Error(reason) => write!(f, "Error: {reason}"),
        }
    }
}

/// Presentation-level health of a channel. `Degraded` is never terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChannelHealth {
    #[default]
    Healthy,
    Degraded,
}

impl std::fmt::Display for ChannelHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "Healthy"),
            Self::Degraded => write!(f, "Degraded"),
        }
    }
}

/// Point-in-time view of a channel's polling counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub name: String,
    pub health: ChannelHealth,
    pub consecutive_failures: u32,
    pub total_polls: u64,
    pub total_failures: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Emitted by a scheduler whenever a channel crosses the degraded threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthTransition {
    pub channel: String,
    pub from: ChannelHealth,
    pub to: ChannelHealth,
}
