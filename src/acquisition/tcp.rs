//! Modbus TCP link: one long-lived socket per device endpoint.

use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tracing::debug;

use super::driver::{classify_io, ClientDriver, Connector, TransportError};
use crate::config::defaults;

pub type TcpDriver = ClientDriver<TcpConnector>;

#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: Duration::from_millis(defaults::TCP_CONNECT_TIMEOUT_MS),
        }
    }

    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn into_driver(self) -> TcpDriver {
        ClientDriver::new(self)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn open(&self) -> Result<Context, TransportError> {
        let target = format!("{}:{}", self.host, self.port);
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&target))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::Connection(format!("{target}: {e}")))?;

        // Keepalive surfaces half-open sockets between polls
        let sock_ref = socket2::SockRef::from(&stream);
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(Duration::from_secs(30))
            .with_interval(Duration::from_secs(10));
        let _ = sock_ref.set_tcp_keepalive(&keepalive);
        stream.set_nodelay(true).map_err(|e| classify_io(&e))?;

        debug!(endpoint = %target, "TCP socket established");
        Ok(tcp::attach_slave(stream, Slave(1)))
    }

    fn endpoint(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::driver::ModbusDriver;

    #[test]
    fn test_endpoint_format() {
        let driver = TcpConnector::new("10.0.0.5", 1502).into_driver();
        assert_eq!(driver.endpoint(), "tcp://10.0.0.5:1502");
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_error() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut driver = TcpConnector::new("127.0.0.1", port)
            .with_connect_timeout(Duration::from_secs(2))
            .into_driver();
        let err = driver.connect().await.unwrap_err();
        assert!(matches!(err, TransportError::Connection(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_read_without_connect_fails() {
        let mut driver = TcpConnector::new("127.0.0.1", 502).into_driver();
        let err = driver
            .read(1, crate::types::FunctionCode::HoldingRegisters, 0, 1)
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::NotConnected);
    }
}
