use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg, OFlag};
use serialport::{ClearBuffer, FlowControl, SerialPort, TTYPort};
use tracing::{debug, info, warn};

use super::{DeviceTransport, TransportError, TransportKind};
use crate::protocol::{BootState, RECOVERY_SIGNAL, classify_banner};

/// Lines the firmware prints on its own while idle; never part of a reply.
const HEARTBEAT_PREFIX: &str = "Heartbeat:";

/// Upper bound on bytes drained from the port in one go.
const MAX_DRAIN: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialAccess {
    /// Hold an advisory lock so no other process talks to the controller.
    Exclusive,
    /// Open without locking; other processes may share the port.
    Shared,
}

#[derive(Debug, Clone)]
pub struct SerialSettings {
    pub baud_rate: u32,
    pub read_timeout: Duration,
    /// The controller resets when the port opens; nothing is sent before this elapses.
    pub settle_delay: Duration,
    /// How long to wait for a firmware banner after the recovery signal.
    pub boot_timeout: Duration,
    /// Extra lines arriving within this window belong to the same reply.
    pub reply_linger: Duration,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            read_timeout: Duration::from_secs(2),
            settle_delay: Duration::from_secs(2),
            boot_timeout: Duration::from_secs(15),
            reply_linger: Duration::from_millis(100),
        }
    }
}

pub struct SerialTransport {
    target: String,
    port: Option<TTYPort>,
    /// Advisory lock on the device node, held while the port is open.
    lock: Option<Flock<File>>,
    settings: SerialSettings,
    boot: BootState,
}

impl SerialTransport {
    pub fn open(
        path: &Path,
        access: SerialAccess,
        settings: &SerialSettings,
    ) -> Result<Self, TransportError> {
        let target = path.display().to_string();
        let mut port = serialport::new(target.as_str(), settings.baud_rate)
            .timeout(settings.read_timeout)
            .flow_control(FlowControl::None)
            .open_native()
            .map_err(|err| open_error(&target, err))?;

        // serialport grabs TIOCEXCL on open; ownership is an flock instead so
        // a shared open stays possible.
        port.set_exclusive(false)
            .map_err(|err| open_error(&target, err))?;
        let lock = match access {
            SerialAccess::Exclusive => Some(lock_exclusive(path, &target)?),
            SerialAccess::Shared => None,
        };

        info!(port = %target, ?access, "serial port opened; waiting for controller reset");
        thread::sleep(settings.settle_delay);

        let mut transport = Self {
            target,
            port: Some(port),
            lock,
            settings: settings.clone(),
            boot: BootState::Silent,
        };
        let banner = transport.drain()?;
        transport.boot = classify_banner(&banner);
        debug!(port = %transport.target, boot = ?transport.boot, banner = %banner.trim(), "boot banner");
        if transport.boot == BootState::Bootloader {
            warn!(port = %transport.target, "controller is in its ROM bootloader");
        }
        Ok(transport)
    }

    fn port(&mut self) -> Result<&mut TTYPort, TransportError> {
        self.port
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port closed").into())
    }

    /// Read whatever is already buffered without waiting.
    fn drain(&mut self) -> Result<String, TransportError> {
        let port = self.port()?;
        let mut collected = Vec::new();
        while collected.len() < MAX_DRAIN {
            let pending = port.bytes_to_read().map_err(io::Error::from)? as usize;
            if pending == 0 {
                break;
            }
            let mut buf = vec![0u8; pending.min(MAX_DRAIN - collected.len())];
            match port.read(&mut buf) {
                Ok(n) => collected.extend_from_slice(&buf[..n]),
                Err(err) if err.kind() == io::ErrorKind::TimedOut => break,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(String::from_utf8_lossy(&collected).into_owned())
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let port = self.port()?;
        port.write_all(bytes)?;
        port.flush()?;
        Ok(())
    }
}

impl DeviceTransport for SerialTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn send_line(&mut self, command: &str) -> Result<String, TransportError> {
        let read_timeout = self.settings.read_timeout;
        let linger = self.settings.reply_linger;

        self.port()?
            .clear(ClearBuffer::Input)
            .map_err(io::Error::from)?;
        self.write_bytes(format!("{command}\n").as_bytes())?;

        let port = self.port()?;
        let Some(mut reply) = next_reply_line(port, read_timeout)? else {
            return Err(TransportError::Timeout(read_timeout));
        };

        port.set_timeout(linger).map_err(io::Error::from)?;
        let trailing = append_trailing(port, &mut reply, linger);
        port.set_timeout(read_timeout).map_err(io::Error::from)?;
        trailing?;

        debug!(port = %self.target, command, reply = %reply, "serial exchange");
        Ok(reply)
    }

    fn boot_state(&self) -> BootState {
        self.boot
    }

    fn recover(&mut self) -> Result<BootState, TransportError> {
        info!(port = %self.target, "sending recovery signal to controller");
        self.write_bytes(&[RECOVERY_SIGNAL])?;

        let deadline = Instant::now() + self.settings.boot_timeout;
        let mut seen = String::new();
        while Instant::now() < deadline {
            seen.push_str(&self.drain()?);
            if classify_banner(&seen) == BootState::Firmware {
                self.boot = BootState::Firmware;
                info!(port = %self.target, "controller firmware is up");
                return Ok(self.boot);
            }
            thread::sleep(Duration::from_millis(250));
        }

        // Quiet firmware never prints a banner; ask it directly.
        match self.send_line("version") {
            Ok(reply) if classify_banner(&reply) == BootState::Firmware => {
                self.boot = BootState::Firmware;
            }
            Ok(reply) => debug!(port = %self.target, reply = %reply, "no firmware marker in version reply"),
            Err(TransportError::Timeout(_)) => {}
            Err(err) => return Err(err),
        }
        Ok(self.boot)
    }

    fn close(&mut self) {
        // Port first, then the lock.
        let was_open = self.port.take().is_some();
        self.lock = None;
        if was_open {
            debug!(port = %self.target, "serial port closed");
        }
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_error(target: &str, err: serialport::Error) -> TransportError {
    if err.description.to_ascii_lowercase().contains("busy") {
        TransportError::Busy(target.to_string())
    } else {
        TransportError::Open {
            target: target.to_string(),
            reason: err.to_string(),
        }
    }
}

/// Take a non-blocking `flock` on the device node. The lock lives on its own
/// descriptor, so it survives exactly as long as the returned guard.
fn lock_exclusive(path: &Path, target: &str) -> Result<Flock<File>, TransportError> {
    let file = OpenOptions::new()
        .read(true)
        .custom_flags((OFlag::O_NOCTTY | OFlag::O_NONBLOCK).bits())
        .open(path)
        .map_err(|err| TransportError::Open {
            target: target.to_string(),
            reason: format!("could not open port for locking: {err}"),
        })?;
    Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
        if errno == Errno::EWOULDBLOCK {
            TransportError::Busy(target.to_string())
        } else {
            TransportError::Open {
                target: target.to_string(),
                reason: format!("could not lock port: {errno}"),
            }
        }
    })
}

/// Next non-empty line, or `None` if nothing complete arrives in `window`.
/// A trailing partial line is returned once the reader goes quiet.
fn read_line<R: Read>(reader: &mut R, window: Duration) -> io::Result<Option<String>> {
    let deadline = Instant::now() + window;
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    while Instant::now() < deadline {
        match reader.read(&mut byte) {
            Ok(0) => continue,
            Ok(_) if byte[0] == b'\n' => {
                let text = String::from_utf8_lossy(&line).trim().to_string();
                if !text.is_empty() {
                    return Ok(Some(text));
                }
                line.clear();
            }
            Ok(_) => line.push(byte[0]),
            Err(err) if err.kind() == io::ErrorKind::TimedOut => break,
            Err(err) => return Err(err),
        }
    }
    let text = String::from_utf8_lossy(&line).trim().to_string();
    Ok((!text.is_empty()).then_some(text))
}

/// First line of a reply within `window`, skipping heartbeats.
fn next_reply_line<R: Read>(reader: &mut R, window: Duration) -> io::Result<Option<String>> {
    let deadline = Instant::now() + window;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match read_line(reader, remaining)? {
            Some(line) if line.starts_with(HEARTBEAT_PREFIX) => continue,
            other => return Ok(other),
        }
    }
}

/// The firmware may print a warning before its acknowledgement; keep both.
fn append_trailing<R: Read>(reader: &mut R, reply: &mut String, linger: Duration) -> io::Result<()> {
    while let Some(more) = read_line(reader, linger)? {
        if more.starts_with(HEARTBEAT_PREFIX) {
            continue;
        }
        reply.push('\n');
        reply.push_str(&more);
    }
    Ok(())
}
