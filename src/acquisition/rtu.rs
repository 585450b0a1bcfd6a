//! Modbus RTU link over a serial line.
//!
//! The round-trip timeout scales with baud rate: a full request plus the
//! largest possible response at 11 bits per character, plus a fixed
//! turnaround allowance.

use async_trait::async_trait;
use std::time::Duration;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tokio_serial::SerialStream;
use tracing::debug;

use super::driver::{ClientDriver, Connector, TransportError};
use crate::config::{defaults, Parity};

pub type RtuDriver = ClientDriver<RtuConnector>;

/// Read request frame: address, function, start, quantity, CRC.
const REQUEST_FRAME_BYTES: u64 = 8;

/// Largest read response frame: address, function, byte count, 250 data bytes, CRC.
const MAX_RESPONSE_FRAME_BYTES: u64 = 255;

/// Start bit, 8 data bits, parity or second stop bit, stop bit.
const BITS_PER_CHAR: u64 = 11;

/// Round-trip timeout for a serial link at `baud_rate`.
pub fn derived_timeout(baud_rate: u32) -> Duration {
    let baud = u64::from(baud_rate.max(1));
    let frame_bits = (REQUEST_FRAME_BYTES + MAX_RESPONSE_FRAME_BYTES) * BITS_PER_CHAR;
    let wire_ms = (frame_bits * 1000).div_ceil(baud);
    Duration::from_millis((wire_ms + defaults::RTU_TURNAROUND_MS).max(defaults::RTU_MIN_TIMEOUT_MS))
}

#[derive(Debug, Clone)]
pub struct RtuConnector {
    device: String,
    baud_rate: u32,
    data_bits: u8,
    stop_bits: u8,
    parity: Parity,
}

impl RtuConnector {
    pub fn new(device: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            device: device.into(),
            baud_rate,
            data_bits: defaults::RTU_DATA_BITS,
            stop_bits: defaults::RTU_STOP_BITS,
            parity: Parity::None,
        }
    }

    pub const fn with_framing(mut self, data_bits: u8, stop_bits: u8, parity: Parity) -> Self {
        self.data_bits = data_bits;
        self.stop_bits = stop_bits;
        self.parity = parity;
        self
    }

    pub fn into_driver(self) -> RtuDriver {
        ClientDriver::new(self)
    }

    fn serial_data_bits(&self) -> tokio_serial::DataBits {
        match self.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        }
    }

    const fn serial_stop_bits(&self) -> tokio_serial::StopBits {
        if self.stop_bits == 2 {
            tokio_serial::StopBits::Two
        } else {
            tokio_serial::StopBits::One
        }
    }

    const fn serial_parity(&self) -> tokio_serial::Parity {
        match self.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        }
    }
}

#[async_trait]
impl Connector for RtuConnector {
    async fn open(&self) -> Result<Context, TransportError> {
        let builder = tokio_serial::new(&self.device, self.baud_rate)
            .data_bits(self.serial_data_bits())
            .stop_bits(self.serial_stop_bits())
            .parity(self.serial_parity())
            .timeout(derived_timeout(self.baud_rate));

        let port = SerialStream::open(&builder).map_err(|e| {
            TransportError::Connection(format!("failed to open serial port {}: {e}", self.device))
        })?;

        debug!(device = %self.device, baud = self.baud_rate, "Serial port opened");
        Ok(rtu::attach_slave(port, Slave(1)))
    }

    fn endpoint(&self) -> String {
        format!("rtu://{}@{}", self.device, self.baud_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::driver::ModbusDriver;

    #[test]
    fn test_timeout_scales_with_baud() {
        // 263 bytes * 11 bits at 9600 baud = 302 ms on the wire
        assert_eq!(derived_timeout(9_600), Duration::from_millis(302 + 200));
        assert!(derived_timeout(1_200) > derived_timeout(9_600));
        assert_eq!(derived_timeout(115_200), Duration::from_millis(250));
    }

    #[test]
    fn test_zero_baud_does_not_divide_by_zero() {
        assert!(derived_timeout(0) > Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_missing_device_is_connection_error() {
        let mut driver = RtuConnector::new("/dev/does-not-exist-modbus", 9_600).into_driver();
        let err = driver.connect().await.unwrap_err();
        assert!(matches!(err, TransportError::Connection(_)), "{err:?}");
    }

    #[test]
    fn test_framing_mapping() {
        let c = RtuConnector::new("/dev/ttyS0", 19_200).with_framing(7, 2, Parity::Even);
        assert_eq!(c.serial_data_bits(), tokio_serial::DataBits::Seven);
        assert_eq!(c.serial_stop_bits(), tokio_serial::StopBits::Two);
        assert_eq!(c.serial_parity(), tokio_serial::Parity::Even);
        assert_eq!(c.endpoint(), "rtu:///dev/ttyS0@19200");
    }
}
