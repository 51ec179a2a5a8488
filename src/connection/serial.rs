//! 串口连接
//!
//! [`Transport`] over a real serial device, opened with mio-serial.

use log::debug;
use mio_serial::SerialPort;
use std::io::{self, Read, Write};
use std::time::Duration;

use crate::config::serial_config::SerialConfig;
use crate::connection::{Connector, Transport};
use crate::session::SessionError;

/// Initial read timeout; every read sets its own afterwards.
const OPEN_TIMEOUT: Duration = Duration::from_millis(50);

/// 串口传输
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    /// 打开串口（使用mio-serial）
    pub fn open(config: &SerialConfig) -> Result<Self, SessionError> {
        debug!("Opening serial port {} at {} baud", config.port, config.baud_rate);
        let port = mio_serial::new(&config.port, config.baud_rate)
            .timeout(OPEN_TIMEOUT)
            .open()
            .map_err(|e| SessionError::Open {
                port: config.port.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self { port })
    }
}

impl Transport for SerialTransport {
    fn read_chunk(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        // A zero timeout would block forever on some platforms
        self.port
            .set_timeout(timeout.max(Duration::from_millis(1)))
            .map_err(io::Error::from)?;
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        Write::write_all(&mut self.port, data)?;
        self.port.flush()
    }
}

/// Opens real serial ports.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialConnector;

impl Connector for SerialConnector {
    fn connect(&self, serial: &SerialConfig) -> Result<Box<dyn Transport>, SessionError> {
        Ok(Box::new(SerialTransport::open(serial)?))
    }
}
