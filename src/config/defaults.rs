//! System-wide default constants.
//!
//! Grouped by subsystem. Config structs reference these for their serde
//! defaults so a missing key and a fresh `Default` agree.

// ============================================================================
// Channels
// ============================================================================

/// Maximum number of channels polled concurrently across all links.
pub const MAX_CHANNELS: usize = 10;

/// Default poll interval when a channel does not set its own (ms).
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;

/// Allowed poll interval range (ms).
pub const MIN_POLL_INTERVAL_MS: u64 = 10;
pub const MAX_POLL_INTERVAL_MS: u64 = 60_000;

/// Consecutive failed polls before a channel is reported `Degraded`.
pub const DEGRADED_AFTER_FAILURES: u32 = 3;

/// Valid Modbus slave address range.
pub const MIN_SLAVE_ID: u8 = 1;
pub const MAX_SLAVE_ID: u8 = 247;

/// Display colors handed out by registration order when a channel has none.
pub const CHANNEL_PALETTE: [&str; 16] = [
    "blue", "red", "green", "orange", "purple", "brown", "pink", "gray",
    "olive", "cyan", "magenta", "navy", "teal", "maroon", "gold", "black",
];

// ============================================================================
// Transport
// ============================================================================

/// Consecutive link-level failures before the transport enters `Error`.
pub const TRANSPORT_FAILURE_THRESHOLD: u32 = 3;

/// Wait after entering `Error` before the next reconnect attempt (ms).
pub const RECONNECT_COOLDOWN_MS: u64 = 2_000;

/// Round-trip timeout for a Modbus TCP request (ms).
pub const TCP_READ_TIMEOUT_MS: u64 = 1_000;

/// Connect timeout for a Modbus TCP socket (ms).
pub const TCP_CONNECT_TIMEOUT_MS: u64 = 3_000;

/// Default Modbus TCP port.
pub const MODBUS_TCP_PORT: u16 = 502;

/// Default serial line parameters.
pub const RTU_BAUD_RATE: u32 = 9_600;
pub const RTU_DATA_BITS: u8 = 8;
pub const RTU_STOP_BITS: u8 = 1;

/// Fixed allowance added to the computed RTU frame time for device
/// turnaround and OS scheduling (ms).
pub const RTU_TURNAROUND_MS: u64 = 200;

/// Lower bound for a derived RTU timeout (ms).
pub const RTU_MIN_TIMEOUT_MS: u64 = 250;

// ============================================================================
// Live Buffer
// ============================================================================

/// Points kept per (channel, address) window.
pub const LIVE_WINDOW_CAPACITY: usize = 1_000;

// ============================================================================
// Persistence
// ============================================================================

/// Storage flush interval (seconds). 0 disables persistence.
pub const STORAGE_INTERVAL_SECS: u64 = 5;

/// Upper bound for the storage interval (seconds).
pub const MAX_STORAGE_INTERVAL_SECS: u64 = 3_600;

/// Pending-queue ceiling before the oldest samples are dropped.
pub const PENDING_QUEUE_CEILING: usize = 100_000;

/// Default sled database directory.
pub const STORAGE_PATH: &str = "./data/modbus_data.db";

/// Default row limit for history queries issued from the CLI.
pub const HISTORY_QUERY_LIMIT: usize = 1_000;

// ============================================================================
// Engine
// ============================================================================

/// How often `run` logs a status summary (seconds).
pub const STATUS_LOG_INTERVAL_SECS: u64 = 10;
