//! Modbus client seam and link error taxonomy.
//!
//! `ModbusDriver` is the byte-level request/response collaborator a
//! `Transport` owns. `ClientDriver` implements it on top of a
//! `tokio-modbus` client context opened by a link-specific `Connector`
//! (TCP socket or serial line).

use async_trait::async_trait;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;

use crate::types::FunctionCode;

// ============================================================================
// Errors
// ============================================================================

/// Malformed or rejected response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("CRC mismatch")]
    CrcMismatch,

    #[error("exception response 0x{0:02X}")]
    Exception(u8),

    #[error("malformed response: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("request timed out")]
    Timeout,

    #[error("link not connected")]
    NotConnected,

    #[error("link cooling down before reconnect")]
    CoolingDown,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl TransportError {
    /// Whether this failure says something about the link itself.
    ///
    /// An exception response proves the device answered, so it counts
    /// against the channel but not against the link's failure threshold.
    pub const fn is_link_failure(&self) -> bool {
        !matches!(self, Self::Protocol(ProtocolError::Exception(_)))
    }
}

// ============================================================================
// Driver Seam
// ============================================================================

#[async_trait]
pub trait ModbusDriver: Send + 'static {
    /// Open (or reopen) the underlying link.
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// One request/response round trip. Bit-valued codes return 0/1 per address.
    async fn read(
        &mut self,
        slave_id: u8,
        function_code: FunctionCode,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError>;

    /// Drop the link. Safe to call when not connected.
    async fn disconnect(&mut self);

    /// Human-readable endpoint for logs.
    fn endpoint(&self) -> String;
}

/// Opens a `tokio-modbus` client context for one physical link.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self) -> Result<Context, TransportError>;
    fn endpoint(&self) -> String;
}

/// `ModbusDriver` backed by a `tokio-modbus` client context.
pub struct ClientDriver<C: Connector> {
    connector: C,
    ctx: Option<Context>,
}

impl<C: Connector> ClientDriver<C> {
    pub const fn new(connector: C) -> Self {
        Self {
            connector,
            ctx: None,
        }
    }
}

#[async_trait]
impl<C: Connector> ModbusDriver for ClientDriver<C> {
    async fn connect(&mut self) -> Result<(), TransportError> {
        self.disconnect().await;
        self.ctx = Some(self.connector.open().await?);
        Ok(())
    }

    async fn read(
        &mut self,
        slave_id: u8,
        function_code: FunctionCode,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let ctx = self.ctx.as_mut().ok_or(TransportError::NotConnected)?;
        ctx.set_slave(Slave(slave_id));

        let mut values = match function_code {
            FunctionCode::Coils => ctx
                .read_coils(address, count)
                .await
                .map_err(classify)?
                .map(bits_to_words),
            FunctionCode::DiscreteInputs => ctx
                .read_discrete_inputs(address, count)
                .await
                .map_err(classify)?
                .map(bits_to_words),
            FunctionCode::HoldingRegisters => ctx
                .read_holding_registers(address, count)
                .await
                .map_err(classify)?,
            FunctionCode::InputRegisters => ctx
                .read_input_registers(address, count)
                .await
                .map_err(classify)?,
        }
        .map_err(|code| ProtocolError::Exception(u8::from(code)))?;

        // Devices occasionally pad bit reads to a byte boundary.
        if function_code.is_bit_access() {
            values.truncate(usize::from(count));
        }
        if values.len() != usize::from(count) {
            return Err(ProtocolError::Malformed(format!(
                "expected {count} values, got {}",
                values.len()
            ))
            .into());
        }
        Ok(values)
    }

    async fn disconnect(&mut self) {
        if let Some(mut ctx) = self.ctx.take() {
            let _ = ctx.disconnect().await;
        }
    }

    fn endpoint(&self) -> String {
        self.connector.endpoint()
    }
}

fn bits_to_words(bits: Vec<bool>) -> Vec<u16> {
    bits.into_iter().map(u16::from).collect()
}

/// Map a `tokio-modbus` client error onto the link taxonomy.
fn classify(err: tokio_modbus::Error) -> TransportError {
    match err {
        tokio_modbus::Error::Transport(e) => classify_io(&e),
        other => ProtocolError::Malformed(other.to_string()).into(),
    }
}

pub(crate) fn classify_io(e: &std::io::Error) -> TransportError {
    use std::io::ErrorKind;
    match e.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => TransportError::Timeout,
        ErrorKind::InvalidData if e.to_string().to_ascii_lowercase().contains("crc") => {
            ProtocolError::CrcMismatch.into()
        }
        ErrorKind::InvalidData | ErrorKind::UnexpectedEof => {
            ProtocolError::Malformed(e.to_string()).into()
        }
        _ => TransportError::Connection(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_exception_is_not_link_failure() {
        assert!(!TransportError::Protocol(ProtocolError::Exception(2)).is_link_failure());
        assert!(TransportError::Timeout.is_link_failure());
        assert!(TransportError::Protocol(ProtocolError::CrcMismatch).is_link_failure());
    }

    #[test]
    fn test_classify_io_errors() {
        assert_eq!(
            classify_io(&io::Error::new(io::ErrorKind::TimedOut, "slow")),
            TransportError::Timeout
        );
        assert_eq!(
            classify_io(&io::Error::new(io::ErrorKind::InvalidData, "Invalid CRC")),
            TransportError::Protocol(ProtocolError::CrcMismatch)
        );
        assert!(matches!(
            classify_io(&io::Error::new(io::ErrorKind::InvalidData, "bad length")),
            TransportError::Protocol(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            classify_io(&io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
            TransportError::Connection(_)
        ));
    }

    #[test]
    fn test_exception_display() {
        assert_eq!(
            TransportError::from(ProtocolError::Exception(0x02)).to_string(),
            "exception response 0x02"
        );
    }

    #[test]
    fn test_bits_to_words() {
        assert_eq!(bits_to_words(vec![true, false, true]), vec![1, 0, 1]);
    }
}
