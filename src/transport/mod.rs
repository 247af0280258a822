//! Channels to the display controller.

pub mod http;
pub mod serial;

use std::path::Path;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::BootState;

pub use http::{HttpSettings, HttpTransport};
pub use serial::{SerialAccess, SerialSettings, SerialTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum TransportKind {
    Serial,
    Http,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Serial => write!(f, "serial"),
            TransportKind::Http => write!(f, "http"),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to open {target}: {reason}")]
    Open { target: String, reason: String },
    /// Another process holds the exclusive lock on the port.
    #[error("{0} is locked by another process")]
    Busy(String),
    #[error("timed out after {0:?} waiting for a reply")]
    Timeout(Duration),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("http: {0}")]
    Http(String),
}

impl TransportError {
    /// Whether the channel itself is gone, as opposed to a silent device.
    pub fn is_link_failure(&self) -> bool {
        !matches!(self, TransportError::Timeout(_))
    }
}

/// One open channel to the controller.
pub trait DeviceTransport: Send {
    fn kind(&self) -> TransportKind;

    /// Send one command line and return the reply text.
    fn send_line(&mut self, command: &str) -> Result<String, TransportError>;

    /// What the controller announced when the channel opened.
    fn boot_state(&self) -> BootState {
        BootState::Firmware
    }

    /// Try to kick a controller out of its loader; returns the new boot state.
    fn recover(&mut self) -> Result<BootState, TransportError> {
        Ok(self.boot_state())
    }

    /// Release the channel. Safe to call more than once.
    fn close(&mut self) {}
}

/// Opens concrete transports; the seam tests replace.
pub trait TransportOpener: Send {
    fn open_serial(
        &mut self,
        path: &Path,
        access: SerialAccess,
    ) -> Result<Box<dyn DeviceTransport>, TransportError>;

    fn open_http(&mut self, host: &str) -> Result<Box<dyn DeviceTransport>, TransportError>;
}

/// Opens real serial ports and HTTP clients.
#[derive(Debug, Clone, Default)]
pub struct SystemOpener {
    pub serial: SerialSettings,
    pub http: HttpSettings,
}

impl TransportOpener for SystemOpener {
    fn open_serial(
        &mut self,
        path: &Path,
        access: SerialAccess,
    ) -> Result<Box<dyn DeviceTransport>, TransportError> {
        let transport = SerialTransport::open(path, access, &self.serial)?;
        Ok(Box::new(transport))
    }

    fn open_http(&mut self, host: &str) -> Result<Box<dyn DeviceTransport>, TransportError> {
        let transport = HttpTransport::new(host, &self.http)?;
        Ok(Box::new(transport))
    }
}
