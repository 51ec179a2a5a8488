//! 连接管理模块
//!
//! Byte-level access to a target's console. A [`Connector`] opens a
//! [`Transport`] for a serial endpoint; the [`PortRegistry`] makes sure no two
//! sessions ever hold the same physical port at once.

use std::collections::HashSet;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::debug;

use crate::config::serial_config::SerialConfig;
use crate::session::SessionError;

mod serial;
pub use serial::{SerialConnector, SerialTransport};

#[cfg(test)]
pub(crate) mod fake;

/// Raw console channel.
pub trait Transport: Send {
    /// Reads whatever arrives within `timeout`. `Ok(0)` means nothing arrived.
    fn read_chunk(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    /// Writes and flushes `data`.
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;
}

/// Opens transports for serial endpoints.
pub trait Connector: Send + Sync {
    fn connect(&self, serial: &SerialConfig) -> Result<Box<dyn Transport>, SessionError>;
}

/// Tracks which ports currently have an open session.
#[derive(Debug, Clone, Default)]
pub struct PortRegistry {
    claimed: Arc<Mutex<HashSet<String>>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `port`, failing with [`SessionError::PortBusy`] if someone holds it.
    pub fn acquire(&self, port: &str) -> Result<PortGuard, SessionError> {
        let mut claimed = self.claimed.lock().unwrap_or_else(PoisonError::into_inner);
        if !claimed.insert(port.to_string()) {
            return Err(SessionError::PortBusy(port.to_string()));
        }
        debug!("Claimed serial port {port}");
        Ok(PortGuard {
            port: port.to_string(),
            claimed: Arc::clone(&self.claimed),
        })
    }

    pub fn is_claimed(&self, port: &str) -> bool {
        self.claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(port)
    }
}

/// Exclusive claim on a port; released on drop.
#[derive(Debug)]
pub struct PortGuard {
    port: String,
    claimed: Arc<Mutex<HashSet<String>>>,
}

impl PortGuard {
    pub fn port(&self) -> &str {
        &self.port
    }
}

impl Drop for PortGuard {
    fn drop(&mut self) {
        self.claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.port);
        debug!("Released serial port {}", self.port);
    }
}
