//! One conversation with the display controller.
//!
//! A session owns at most one transport. It resolves where the controller
//! lives, copes with a controller sitting in its ROM loader, retries a broken
//! link once with fresh resolution, and remembers whatever worked.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::{DEFAULT_BRIGHTNESS, DeviceAddress, DeviceConfig, JsonStore};
use crate::error::{Error, Result};
use crate::locator::{DeviceLocator, Discovered};
use crate::protocol::{BootState, Command, clamp_brightness, parse_current, parse_set_ack};
use crate::transport::{
    DeviceTransport, SerialAccess, TransportError, TransportKind, TransportOpener,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    /// Serial controller answered with ROM loader output; recovery pending.
    BootloaderWait,
    Ready,
    /// A command is in flight.
    Busy,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub transport: TransportKind,
    /// `Shared` skips the exclusive lock altogether.
    pub access: SerialAccess,
    /// Address given explicitly by the user; wins over the persisted one.
    pub pinned: Option<DeviceAddress>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            transport: TransportKind::Http,
            access: SerialAccess::Exclusive,
            pinned: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrightnessAck {
    /// Value sent after clamping.
    pub requested: u8,
    /// Value the controller reported, or `requested` when unconfirmed.
    pub applied: u8,
    pub confirmed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrightnessSource {
    Live,
    Cached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Brightness {
    pub value: u8,
    pub source: BrightnessSource,
}

pub struct DeviceSession {
    opener: Box<dyn TransportOpener>,
    locator: DeviceLocator,
    store: JsonStore<DeviceConfig>,
    config: DeviceConfig,
    options: SessionOptions,
    state: SessionState,
    transport: Option<Box<dyn DeviceTransport>>,
    address: Option<DeviceAddress>,
    non_exclusive: bool,
}

impl DeviceSession {
    pub fn new(
        options: SessionOptions,
        locator: DeviceLocator,
        opener: Box<dyn TransportOpener>,
        store: JsonStore<DeviceConfig>,
    ) -> Self {
        let config = store.load();
        Self {
            opener,
            locator,
            store,
            config,
            non_exclusive: options.access == SerialAccess::Shared,
            options,
            state: SessionState::Disconnected,
            transport: None,
            address: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// True when the serial port is open without the exclusive lock.
    pub fn non_exclusive(&self) -> bool {
        self.non_exclusive
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.options.transport
    }

    pub fn address(&self) -> Option<&DeviceAddress> {
        self.address.as_ref()
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn connect(&mut self) -> Result<()> {
        self.establish(false)
    }

    /// Retry bootloader recovery on the open transport.
    pub fn recover(&mut self) -> Result<()> {
        if self.transport.is_none() {
            return self.connect();
        }
        if self.state != SessionState::BootloaderWait {
            return Ok(());
        }
        let Some(transport) = self.transport.as_mut() else {
            return Err(Error::Connect("no transport open".into()));
        };
        match transport.recover() {
            Ok(BootState::Bootloader) => {
                warn!("controller still in bootloader after recovery attempt");
                self.state = SessionState::BootloaderWait;
                Err(Error::BootloaderStuck)
            }
            Ok(boot) => {
                info!(?boot, "controller recovered from bootloader");
                self.state = SessionState::Ready;
                Ok(())
            }
            Err(err) => {
                self.drop_transport();
                Err(Error::ConnectionLost(err.to_string()))
            }
        }
    }

    pub fn set_brightness(&mut self, value: i32, allow_zero: bool) -> Result<BrightnessAck> {
        let requested = clamp_brightness(value, allow_zero);
        if i32::from(requested) != value {
            debug!(value, requested, "brightness clamped");
        }
        let reply = self.exchange(Command::Set(requested))?;
        let ack = match parse_set_ack(&reply) {
            Some(applied) => BrightnessAck {
                requested,
                applied,
                confirmed: true,
            },
            None => {
                warn!(requested, reply = %reply, "brightness change not acknowledged");
                BrightnessAck {
                    requested,
                    applied: requested,
                    confirmed: false,
                }
            }
        };
        info!(brightness = ack.applied, confirmed = ack.confirmed, "brightness set");
        self.config.last_brightness = ack.applied;
        self.persist();
        Ok(ack)
    }

    /// Live reading when possible, else the last remembered value.
    pub fn get_brightness(&mut self) -> Brightness {
        let cached = Brightness {
            value: self.config.last_brightness,
            source: BrightnessSource::Cached,
        };
        match self.exchange(Command::Get) {
            Ok(reply) => match parse_current(&reply) {
                Some(value) => Brightness {
                    value,
                    source: BrightnessSource::Live,
                },
                None => {
                    debug!(reply = %reply, "no brightness in reply; using cached value");
                    cached
                }
            },
            Err(err) => {
                warn!(error = %err, cached = cached.value, "live brightness unavailable");
                cached
            }
        }
    }

    pub fn adjust_brightness(&mut self, delta: i32, allow_zero: bool) -> Result<BrightnessAck> {
        let current = self.get_brightness().value;
        self.set_brightness(i32::from(current).saturating_add(delta), allow_zero)
    }

    pub fn get_version(&mut self) -> Result<String> {
        self.query(Command::Version)
    }

    pub fn ping(&mut self) -> Result<String> {
        self.query(Command::Ping)
    }

    /// Network discovery that ignores the remembered host; the result is persisted.
    pub fn discover(&mut self) -> Result<Discovered> {
        let found = self
            .locator
            .discover_fresh()
            .ok_or_else(|| Error::Connect("display controller not found on the local network".into()))?;
        self.remember(&DeviceAddress::HttpEndpoint(found.host.clone()));
        Ok(found)
    }

    /// Use `host` for this session and remember it for later ones.
    pub fn pin_host(&mut self, host: &str) {
        let address = DeviceAddress::HttpEndpoint(host.to_string());
        self.remember(&address);
        if self.options.transport == TransportKind::Http {
            self.options.pinned = Some(address);
        }
    }

    pub fn close(&mut self) {
        self.drop_transport();
    }

    fn query(&mut self, command: Command) -> Result<String> {
        let reply = self.exchange(command)?;
        if reply.trim().is_empty() {
            return Err(Error::DeviceUnresponsive {
                command: command.to_string(),
            });
        }
        Ok(reply)
    }

    fn ensure_ready(&mut self) -> Result<()> {
        match self.state {
            SessionState::Ready if self.transport.is_some() => Ok(()),
            SessionState::BootloaderWait => Err(Error::BootloaderStuck),
            _ => self.connect(),
        }
    }

    /// Send one command; a broken link gets one reconnect and one resend.
    fn exchange(&mut self, command: Command) -> Result<String> {
        self.ensure_ready()?;
        let err = match self.send_once(command) {
            Ok(reply) => return Ok(reply),
            Err(err) => err,
        };
        if !err.is_link_failure() {
            return Err(Error::DeviceUnresponsive {
                command: command.to_string(),
            });
        }

        warn!(%command, error = %err, "transport failed; reconnecting");
        self.drop_transport();
        self.establish(true)
            .map_err(|reconnect| Error::ConnectionLost(format!("{err}; reconnect failed: {reconnect}")))?;

        match self.send_once(command) {
            Ok(reply) => Ok(reply),
            Err(TransportError::Timeout(_)) => Err(Error::DeviceUnresponsive {
                command: command.to_string(),
            }),
            Err(err) => {
                self.drop_transport();
                Err(Error::ConnectionLost(err.to_string()))
            }
        }
    }

    fn send_once(&mut self, command: Command) -> std::result::Result<String, TransportError> {
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no transport open"))?;
        self.state = SessionState::Busy;
        let result = transport.send_line(&command.as_line());
        self.state = SessionState::Ready;
        result
    }

    /// Open a transport; `fresh` ignores the persisted address.
    fn establish(&mut self, fresh: bool) -> Result<()> {
        self.drop_transport();
        self.state = SessionState::Connecting;
        let opened = match self.options.transport {
            TransportKind::Serial => self.open_serial(fresh),
            TransportKind::Http => self.open_http(fresh),
        };
        let (address, transport) = match opened {
            Ok(opened) => opened,
            Err(err) => {
                self.state = SessionState::Disconnected;
                return Err(err);
            }
        };

        info!(address = %address, non_exclusive = self.non_exclusive, "connected to display controller");
        self.remember(&address);
        let boot = transport.boot_state();
        self.transport = Some(transport);
        self.address = Some(address);

        if boot == BootState::Bootloader {
            warn!("controller is in its bootloader; attempting recovery");
            self.state = SessionState::BootloaderWait;
            return self.recover();
        }
        self.state = SessionState::Ready;
        Ok(())
    }

    fn open_serial(&mut self, fresh: bool) -> Result<(DeviceAddress, Box<dyn DeviceTransport>)> {
        let preferred: Option<PathBuf> = match &self.options.pinned {
            Some(DeviceAddress::SerialPath(path)) => Some(path.clone()),
            _ if fresh => None,
            _ => self.config.port.clone(),
        };
        let path = self.locator.resolve_serial(preferred.as_deref());
        let first = match self.open_serial_at(&path) {
            Ok(transport) => return Ok((DeviceAddress::SerialPath(path), transport)),
            Err(err) => err,
        };

        let rescanned = self.locator.resolve_serial(None);
        if rescanned == path {
            return Err(Error::Connect(first.to_string()));
        }
        info!(
            failed = %path.display(),
            port = %rescanned.display(),
            error = %first,
            "serial open failed; trying rescanned port"
        );
        let transport = self
            .open_serial_at(&rescanned)
            .map_err(|err| Error::Connect(err.to_string()))?;
        Ok((DeviceAddress::SerialPath(rescanned), transport))
    }

    fn open_serial_at(
        &mut self,
        path: &Path,
    ) -> std::result::Result<Box<dyn DeviceTransport>, TransportError> {
        self.non_exclusive = self.options.access == SerialAccess::Shared;
        match self.opener.open_serial(path, self.options.access) {
            Err(TransportError::Busy(target)) if self.options.access == SerialAccess::Exclusive => {
                warn!(port = %target, "serial port is locked; retrying with shared access");
                let transport = self.opener.open_serial(path, SerialAccess::Shared)?;
                self.non_exclusive = true;
                Ok(transport)
            }
            other => other,
        }
    }

    fn open_http(&mut self, fresh: bool) -> Result<(DeviceAddress, Box<dyn DeviceTransport>)> {
        let host = match &self.options.pinned {
            Some(DeviceAddress::HttpEndpoint(host)) => host.clone(),
            _ => {
                let cached = if fresh { None } else { self.config.host.as_deref() };
                self.locator
                    .discover(cached)
                    .ok_or_else(|| {
                        Error::Connect("display controller not found on the local network".into())
                    })?
                    .host
            }
        };
        let transport = self
            .opener
            .open_http(&host)
            .map_err(|err| Error::Connect(err.to_string()))?;
        Ok((DeviceAddress::HttpEndpoint(host), transport))
    }

    fn remember(&mut self, address: &DeviceAddress) {
        if self.config.address(address.kind()).as_ref() == Some(address) {
            return;
        }
        self.config.remember(address);
        self.persist();
    }

    fn persist(&self) {
        if let Err(err) = self.store.save(&self.config) {
            warn!(error = %err, "failed to save device config");
        }
    }

    fn drop_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.address = None;
        self.state = SessionState::Disconnected;
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl Default for Brightness {
    fn default() -> Self {
        Self {
            value: DEFAULT_BRIGHTNESS,
            source: BrightnessSource::Cached,
        }
    }
}
