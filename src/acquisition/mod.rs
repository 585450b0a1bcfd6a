//! Modbus acquisition
//!
//! - `driver`: byte-level client seam and the transport error taxonomy
//! - `tcp` / `rtu`: `tokio-modbus` drivers
//! - `simulated`: in-process device for tests and demos
//! - `transport`: connection state machine for one physical link
//! - `channel`: validated channels and the channel registry
//! - `transform`: raw words to engineering values
//! - `scheduler`: per-link poll loop

pub mod channel;
pub mod driver;
pub mod rtu;
pub mod scheduler;
pub mod simulated;
pub mod tcp;
pub mod transform;
pub mod transport;

pub use channel::{Channel, ChannelRegistry};
pub use driver::{ModbusDriver, ProtocolError, TransportError};
pub use scheduler::{ChannelChange, PollScheduler, SchedulerError, WallClock};
pub use simulated::{SimDevice, SimReply};
pub use transform::{engineering_value, to_samples, RegisterMode};
pub use transport::{Transport, TransportPolicy, TransportStats};
