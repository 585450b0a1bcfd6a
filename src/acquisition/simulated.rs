//! In-process Modbus device for tests and `run --simulate`.
//!
//! A `SimDevice` is a shared register map plus per-register reply scripts.
//! Each `SimulatedDriver` it hands out behaves like a link to that device:
//! it honours latency, can be taken offline, and records every request
//! (start and finish instants) so tests can check serialization.

use async_trait::async_trait;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use super::driver::{ModbusDriver, ProtocolError, TransportError};
use crate::types::FunctionCode;

/// Most recent requests kept in the log; older ones are discarded.
pub const REQUEST_LOG_CAPACITY: usize = 4096;

/// Scripted answer for the next request at one register address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimReply {
    /// Answer from the register map
    Normal,
    /// Never answer; the transport timeout fires
    Timeout,
    Exception(u8),
    CrcError,
}

/// What unmapped registers read as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fallback {
    #[default]
    Zero,
    /// Slow sine per address with a little noise
    Waveform,
    /// Exception 0x02, illegal data address
    IllegalAddress,
}

/// One request as seen by the device.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestRecord {
    pub slave_id: u8,
    pub function_code: FunctionCode,
    pub address: u16,
    pub count: u16,
    pub started: Instant,
    pub finished: Instant,
}

type RegisterKey = (u8, FunctionCode, u16);

#[derive(Debug)]
struct SimState {
    registers: HashMap<RegisterKey, u16>,
    scripts: HashMap<RegisterKey, VecDeque<SimReply>>,
    latency: Duration,
    online: bool,
    fallback: Fallback,
    log: VecDeque<RequestRecord>,
    log_capacity: usize,
    connects: u32,
    epoch: Instant,
}

#[derive(Debug, Clone)]
pub struct SimDevice {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDevice {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                registers: HashMap::new(),
                scripts: HashMap::new(),
                latency: Duration::from_millis(5),
                online: true,
                fallback: Fallback::Zero,
                log: VecDeque::new(),
                log_capacity: REQUEST_LOG_CAPACITY,
                connects: 0,
                epoch: Instant::now(),
            })),
        }
    }

    /// Device whose unmapped registers produce a live-looking signal.
    pub fn waveform() -> Self {
        let device = Self::new();
        device.lock().fallback = Fallback::Waveform;
        device
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.lock().latency = latency;
        self
    }

    /// Keep at most `capacity` request records (0 disables the log).
    pub fn with_log_capacity(self, capacity: usize) -> Self {
        {
            let mut state = self.lock();
            state.log_capacity = capacity;
            let excess = state.log.len().saturating_sub(capacity);
            state.log.drain(..excess);
        }
        self
    }

    pub fn with_fallback(self, fallback: Fallback) -> Self {
        self.lock().fallback = fallback;
        self
    }

    pub fn set_register(&self, slave_id: u8, fc: FunctionCode, address: u16, value: u16) {
        self.lock().registers.insert((slave_id, fc, address), value);
    }

    /// Queue replies for requests starting at `address`. Once drained the
    /// register answers normally again.
    pub fn script(&self, slave_id: u8, fc: FunctionCode, address: u16, replies: impl IntoIterator<Item = SimReply>) {
        self.lock()
            .scripts
            .entry((slave_id, fc, address))
            .or_default()
            .extend(replies);
    }

    /// An offline device refuses connects and leaves reads unanswered.
    pub fn set_online(&self, online: bool) {
        self.lock().online = online;
    }

    /// Logged requests, oldest first.
    pub fn requests(&self) -> Vec<RequestRecord> {
        self.lock().log.iter().cloned().collect()
    }

    pub fn connect_count(&self) -> u32 {
        self.lock().connects
    }

    pub fn driver(&self, name: impl Into<String>) -> SimulatedDriver {
        SimulatedDriver {
            device: self.clone(),
            name: name.into(),
            connected: false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register_value(state: &SimState, key: RegisterKey) -> Result<u16, TransportError> {
        if let Some(v) = state.registers.get(&key) {
            return Ok(*v);
        }
        match state.fallback {
            Fallback::Zero => Ok(0),
            Fallback::IllegalAddress => Err(ProtocolError::Exception(0x02).into()),
            Fallback::Waveform => {
                let (slave, fc, address) = key;
                if fc.is_bit_access() {
                    return Ok(u16::from(rand::thread_rng().gen_bool(0.5)));
                }
                let t = state.epoch.elapsed().as_secs_f64();
                let phase = f64::from(address) * 0.7 + f64::from(slave);
                let noise: f64 = rand::thread_rng().gen_range(-5.0..5.0);
                let value = 500.0f64.mul_add((t / 10.0 + phase).sin(), 1000.0) + noise;
                Ok(value.clamp(0.0, f64::from(u16::MAX)) as u16)
            }
        }
    }
}

/// Writes the request log entry when the read completes or is abandoned.
struct LogGuard {
    device: SimDevice,
    record: Option<RequestRecord>,
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        if let Some(mut record) = self.record.take() {
            record.finished = Instant::now();
            let mut state = self.device.lock();
            if state.log_capacity == 0 {
                return;
            }
            if state.log.len() >= state.log_capacity {
                state.log.pop_front();
            }
            state.log.push_back(record);
        }
    }
}

/// A link to a `SimDevice`.
#[derive(Debug)]
pub struct SimulatedDriver {
    device: SimDevice,
    name: String,
    connected: bool,
}

#[async_trait]
impl ModbusDriver for SimulatedDriver {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let mut state = self.device.lock();
        if !state.online {
            self.connected = false;
            return Err(TransportError::Connection(format!("{}: device offline", self.name)));
        }
        state.connects += 1;
        self.connected = true;
        Ok(())
    }

    async fn read(
        &mut self,
        slave_id: u8,
        function_code: FunctionCode,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }

        let now = Instant::now();
        let _guard = LogGuard {
            device: self.device.clone(),
            record: Some(RequestRecord {
                slave_id,
                function_code,
                address,
                count,
                started: now,
                finished: now,
            }),
        };

        let (reply, latency, online) = {
            let mut state = self.device.lock();
            let reply = state
                .scripts
                .get_mut(&(slave_id, function_code, address))
                .and_then(VecDeque::pop_front)
                .unwrap_or(SimReply::Normal);
            (reply, state.latency, state.online)
        };

        tokio::time::sleep(latency).await;

        if !online || reply == SimReply::Timeout {
            std::future::pending::<()>().await;
        }
        match reply {
            SimReply::Exception(code) => return Err(ProtocolError::Exception(code).into()),
            SimReply::CrcError => return Err(ProtocolError::CrcMismatch.into()),
            SimReply::Normal | SimReply::Timeout => {}
        }

        let state = self.device.lock();
        (0..count)
            .map(|i| SimDevice::register_value(&state, (slave_id, function_code, address.wrapping_add(i))))
            .collect()
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }

    fn endpoint(&self) -> String {
        format!("sim://{}", self.name)
    }
}
