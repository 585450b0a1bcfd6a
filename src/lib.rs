//! modbus-daq: Modbus acquisition engine
//!
//! Polls up to ten channels over Modbus TCP or RTU links, converts raw
//! register words to engineering units, keeps a rolling live window per
//! register and persists samples to an embedded sled store on its own
//! cadence.
//!
//! ## Architecture
//!
//! - **Transport**: one connection state machine per physical link
//! - **Poll Scheduler**: one loop per link, reads strictly serialized
//! - **Live Buffer**: lock-free snapshots for display consumers
//! - **Persistence Writer**: bounded queue, batched flushes
//! - **History**: range queries, grouping, transactional deletes

pub mod acquisition;
pub mod config;
pub mod engine;
pub mod live_buffer;
pub mod storage;
pub mod types;

pub use config::{AcquisitionConfig, ChannelConfig, ConfigError, LinkConfig, TransportConfig};
pub use engine::{AcquisitionEngine, EngineError, EngineStatus, LinkStatus};
pub use live_buffer::{LiveBuffer, LiveWindow, SeriesKey};
pub use storage::{HistoryStore, InMemoryStore, SampleStore, StorageError};
pub use types::{
    ChannelHealth, ChannelStatus, ConnectionState, FunctionCode, HealthTransition,
    PersistedRecord, Sample,
};
