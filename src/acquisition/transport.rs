//! Transport: one physical Modbus link and its connection state.
//!
//! The transport is the only writer of its `ConnectionState`; observers get
//! a `watch` receiver. A single failed read does not flip the link to
//! `Error`. Only `failure_threshold` consecutive link-level failures do, and
//! after that no reconnect is attempted until `reconnect_cooldown` elapses.

use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::driver::{ModbusDriver, TransportError};
use super::rtu::RtuConnector;
use super::tcp::TcpConnector;
use crate::config::{defaults, LinkConfig, TransportConfig};
use crate::types::{ConnectionState, FunctionCode};

/// Failure and timing policy for one link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportPolicy {
    pub read_timeout: Duration,
    pub failure_threshold: u32,
    pub reconnect_cooldown: Duration,
}

impl Default for TransportPolicy {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(defaults::TCP_READ_TIMEOUT_MS),
            failure_threshold: defaults::TRANSPORT_FAILURE_THRESHOLD,
            reconnect_cooldown: Duration::from_millis(defaults::RECONNECT_COOLDOWN_MS),
        }
    }
}

impl TransportPolicy {
    pub fn from_link(link: &LinkConfig) -> Self {
        Self {
            read_timeout: link.read_timeout(),
            failure_threshold: link.failure_threshold.max(1),
            reconnect_cooldown: link.reconnect_cooldown(),
        }
    }
}

/// Counters since the transport was created.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransportStats {
    pub connects: u64,
    pub connect_failures: u64,
    pub reads: u64,
    pub read_failures: u64,
    pub timeouts: u64,
}

pub struct Transport {
    name: String,
    driver: Box<dyn ModbusDriver>,
    policy: TransportPolicy,
    state_tx: watch::Sender<ConnectionState>,
    /// Link-level failures since the last good response
    consecutive_failures: u32,
    /// When the link last entered `Error`
    error_since: Option<Instant>,
    stats: TransportStats,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("name", &self.name)
            .field("endpoint", &self.driver.endpoint())
            .field("state", &*self.state_tx.borrow())
            .finish_non_exhaustive()
    }
}

impl Transport {
    pub fn new(name: impl Into<String>, driver: impl ModbusDriver, policy: TransportPolicy) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            name: name.into(),
            driver: Box::new(driver),
            policy,
            state_tx,
            consecutive_failures: 0,
            error_since: None,
            stats: TransportStats::default(),
        }
    }

    /// Build the TCP or RTU driver described by a link config.
    pub fn from_link(link: &LinkConfig) -> Self {
        let policy = TransportPolicy::from_link(link);
        match &link.transport {
            TransportConfig::Tcp { host, port } => {
                Self::new(&link.name, TcpConnector::new(host, *port).into_driver(), policy)
            }
            TransportConfig::Rtu {
                device,
                baud_rate,
                data_bits,
                stop_bits,
                parity,
            } => Self::new(
                &link.name,
                RtuConnector::new(device, *baud_rate)
                    .with_framing(*data_bits, *stop_bits, *parity)
                    .into_driver(),
                policy,
            ),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> String {
        self.driver.endpoint()
    }

    pub fn policy(&self) -> &TransportPolicy {
        &self.policy
    }

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn stats(&self) -> TransportStats {
        self.stats.clone()
    }

    /// Open the link. Returns the resulting state.
    pub async fn connect(&mut self) -> ConnectionState {
        if let Err(e) = self.open_link().await {
            debug!(link = %self.name, error = %e, "Connect attempt failed");
        }
        self.state()
    }

    /// Connect if the link is down and not cooling down after an error.
    pub async fn ensure_connected(&mut self) -> Result<(), TransportError> {
        match self.state() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Error(_) => {
                if let Some(since) = self.error_since {
                    if since.elapsed() < self.policy.reconnect_cooldown {
                        return Err(TransportError::CoolingDown);
                    }
                }
                debug!(link = %self.name, "Cool-down elapsed, reconnecting");
            }
            ConnectionState::Disconnected | ConnectionState::Connecting => {}
        }
        self.open_link().await
    }

    /// A refused connect counts toward `failure_threshold` like a failed
    /// read; below it the link drops back to `Disconnected` and the next
    /// poll retries without a cool-down.
    async fn open_link(&mut self) -> Result<(), TransportError> {
        self.set_state(ConnectionState::Connecting);
        match self.driver.connect().await {
            Ok(()) => {
                self.stats.connects += 1;
                self.consecutive_failures = 0;
                self.error_since = None;
                info!(link = %self.name, endpoint = %self.driver.endpoint(), "Link connected");
                self.set_state(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                self.stats.connect_failures += 1;
                warn!(link = %self.name, endpoint = %self.driver.endpoint(), error = %e, "Link connect failed");
                self.set_state(ConnectionState::Disconnected);
                self.record_link_failure(&e).await;
                Err(e)
            }
        }
    }

    /// One bounded round trip. Only valid while `Connected`.
    pub async fn read(
        &mut self,
        slave_id: u8,
        function_code: FunctionCode,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        if !self.state_tx.borrow().is_connected() {
            return Err(TransportError::NotConnected);
        }

        self.stats.reads += 1;
        let result = match tokio::time::timeout(
            self.policy.read_timeout,
            self.driver.read(slave_id, function_code, address, count),
        )
        .await
        {
            Ok(r) => r,
            Err(_) => Err(TransportError::Timeout),
        };

        match &result {
            Ok(_) => self.consecutive_failures = 0,
            Err(e) => {
                self.stats.read_failures += 1;
                if *e == TransportError::Timeout {
                    self.stats.timeouts += 1;
                }
                if e.is_link_failure() {
                    self.record_link_failure(e).await;
                } else {
                    // The device answered; the link itself is fine
                    self.consecutive_failures = 0;
                }
            }
        }
        result
    }

    pub async fn disconnect(&mut self) {
        self.driver.disconnect().await;
        self.consecutive_failures = 0;
        self.error_since = None;
        if *self.state_tx.borrow() != ConnectionState::Disconnected {
            info!(link = %self.name, "Link disconnected");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    async fn record_link_failure(&mut self, error: &TransportError) {
        self.consecutive_failures += 1;
        debug!(
            link = %self.name,
            failures = self.consecutive_failures,
            threshold = self.policy.failure_threshold,
            error = %error,
            "Link-level failure"
        );
        if self.consecutive_failures < self.policy.failure_threshold {
            return;
        }

        let reason = format!(
            "{} consecutive failures, last: {error}",
            self.consecutive_failures
        );
        warn!(
            link = %self.name,
            cooldown_ms = self.policy.reconnect_cooldown.as_millis() as u64,
            reason = %reason,
            "Link entering error state"
        );
        self.driver.disconnect().await;
        self.consecutive_failures = 0;
        self.error_since = Some(Instant::now());
        self.set_state(ConnectionState::Error(reason));
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::simulated::{SimDevice, SimReply};

    const FC: FunctionCode = FunctionCode::HoldingRegisters;

    fn policy(threshold: u32, cooldown_ms: u64) -> TransportPolicy {
        TransportPolicy {
            read_timeout: Duration::from_millis(100),
            failure_threshold: threshold,
            reconnect_cooldown: Duration::from_millis(cooldown_ms),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_publishes_state() {
        let device = SimDevice::new();
        let mut transport = Transport::new("plc", device.driver("plc"), policy(3, 0));
        let mut rx = transport.subscribe();
        assert_eq!(transport.state(), ConnectionState::Disconnected);

        assert_eq!(transport.connect().await, ConnectionState::Connected);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), ConnectionState::Connected);

        transport.disconnect().await;
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_requires_connection() {
        let device = SimDevice::new();
        let mut transport = Transport::new("plc", device.driver("plc"), policy(3, 0));
        assert_eq!(
            transport.read(1, FC, 0, 1).await.unwrap_err(),
            TransportError::NotConnected
        );
        assert!(device.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_only_after_threshold() {
        let device = SimDevice::new();
        device.script(1, FC, 0, [SimReply::Timeout, SimReply::Timeout, SimReply::Timeout]);
        let mut transport = Transport::new("plc", device.driver("plc"), policy(3, 1_000));
        transport.connect().await;

        for _ in 0..2 {
            assert_eq!(transport.read(1, FC, 0, 1).await.unwrap_err(), TransportError::Timeout);
            assert_eq!(transport.state(), ConnectionState::Connected);
        }
        assert_eq!(transport.read(1, FC, 0, 1).await.unwrap_err(), TransportError::Timeout);
        assert!(matches!(transport.state(), ConnectionState::Error(_)));
        assert_eq!(transport.stats().timeouts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let device = SimDevice::new();
        device.script(
            1,
            FC,
            0,
            [SimReply::CrcError, SimReply::CrcError, SimReply::Normal, SimReply::CrcError, SimReply::CrcError],
        );
        let mut transport = Transport::new("plc", device.driver("plc"), policy(3, 0));
        transport.connect().await;

        for _ in 0..5 {
            let _ = transport.read(1, FC, 0, 1).await;
        }
        assert_eq!(transport.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exceptions_do_not_trip_link() {
        let device = SimDevice::new();
        device.script(1, FC, 0, [SimReply::Exception(2); 5]);
        let mut transport = Transport::new("plc", device.driver("plc"), policy(2, 0));
        transport.connect().await;
        for _ in 0..5 {
            assert!(transport.read(1, FC, 0, 1).await.is_err());
        }
        assert_eq!(transport.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_then_reconnect() {
        let device = SimDevice::new();
        device.script(1, FC, 0, [SimReply::Timeout]);
        let mut transport = Transport::new("plc", device.driver("plc"), policy(1, 500));
        transport.ensure_connected().await.unwrap();
        assert!(transport.read(1, FC, 0, 1).await.is_err());
        assert!(matches!(transport.state(), ConnectionState::Error(_)));

        assert_eq!(
            transport.ensure_connected().await.unwrap_err(),
            TransportError::CoolingDown
        );
        tokio::time::sleep(Duration::from_millis(500)).await;
        transport.ensure_connected().await.unwrap();
        assert_eq!(transport.state(), ConnectionState::Connected);
        assert_eq!(device.connect_count(), 2);
        assert!(transport.read(1, FC, 0, 1).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failures_count_toward_threshold() {
        let device = SimDevice::new();
        device.set_online(false);
        let mut transport = Transport::new("plc", device.driver("plc"), policy(3, 1_000));

        for _ in 0..2 {
            let err = transport.ensure_connected().await.unwrap_err();
            assert!(matches!(err, TransportError::Connection(_)));
            assert_eq!(transport.state(), ConnectionState::Disconnected);
        }
        assert!(matches!(
            transport.ensure_connected().await.unwrap_err(),
            TransportError::Connection(_)
        ));
        assert!(matches!(transport.state(), ConnectionState::Error(_)));
        assert_eq!(transport.stats().connect_failures, 3);
        assert_eq!(
            transport.ensure_connected().await.unwrap_err(),
            TransportError::CoolingDown
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_success_clears_connect_failures() {
        let device = SimDevice::new();
        device.set_online(false);
        let mut transport = Transport::new("plc", device.driver("plc"), policy(2, 1_000));
        assert_eq!(transport.connect().await, ConnectionState::Disconnected);

        device.set_online(true);
        assert_eq!(transport.connect().await, ConnectionState::Connected);

        device.set_online(false);
        assert_eq!(transport.connect().await, ConnectionState::Disconnected);
    }

    #[test]
    fn test_policy_from_rtu_link_derives_timeout() {
        let link = LinkConfig::new(
            "rs485",
            TransportConfig::Rtu {
                device: "/dev/ttyUSB0".into(),
                baud_rate: 9_600,
                data_bits: 8,
                stop_bits: 1,
                parity: crate::config::Parity::None,
            },
        );
        let p = TransportPolicy::from_link(&link);
        assert_eq!(p.read_timeout, Duration::from_millis(502));
        assert_eq!(p.failure_threshold, 3);
    }
}
