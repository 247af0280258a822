//! Line protocol spoken by the display controller firmware.
//!
//! Commands are ASCII lines terminated by `\n`. The firmware answers with
//! free text; only a few markers are meaningful.

use once_cell::sync::Lazy;
use regex::Regex;

/// Lowest brightness sent unless zero is explicitly allowed.
pub const MIN_SAFE_BRIGHTNESS: u8 = 5;
pub const MAX_BRIGHTNESS: u8 = 100;

/// Ctrl-C; nudges an ESP32 sitting in its ROM loader.
pub const RECOVERY_SIGNAL: u8 = 0x03;

const BOOTLOADER_MARKERS: &[&str] = &["ESP-ROM:", "rst:0x", "waiting for download"];
const FIRMWARE_MARKERS: &[&str] = &[
    "iMac Dimmer Starting",
    "Heartbeat:",
    "Brightness Control Ready",
    "Firmware:",
];

static SET_ACK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Brightness set to:?\s*(\d{1,3})").expect("valid regex"));
static CURRENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Current brightness:?\s*(\d{1,3})\s*%").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Version,
    Ping,
    Get,
    Set(u8),
}

impl Command {
    pub fn as_line(&self) -> String {
        match self {
            Command::Version => "version".to_string(),
            Command::Ping => "ping".to_string(),
            Command::Get => "get".to_string(),
            Command::Set(value) => value.to_string(),
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_line())
    }
}

/// What the first bytes after opening a serial port say about the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    /// Application firmware banner seen.
    Firmware,
    /// Only ROM loader output seen.
    Bootloader,
    /// Nothing recognisable; assumed ready.
    Silent,
}

pub fn classify_banner(text: &str) -> BootState {
    // ROM chatter precedes the firmware banner on a normal boot.
    if FIRMWARE_MARKERS.iter().any(|m| text.contains(m)) {
        BootState::Firmware
    } else if BOOTLOADER_MARKERS.iter().any(|m| text.contains(m)) {
        BootState::Bootloader
    } else {
        BootState::Silent
    }
}

/// Clamp a requested brightness into the range the controller may be sent.
pub fn clamp_brightness(value: i32, allow_zero: bool) -> u8 {
    let floor = if allow_zero { 0 } else { MIN_SAFE_BRIGHTNESS };
    value.clamp(i32::from(floor), i32::from(MAX_BRIGHTNESS)) as u8
}

/// Value acknowledged by a `Brightness set to: N%` reply.
pub fn parse_set_ack(reply: &str) -> Option<u8> {
    capture_percent(&SET_ACK, reply)
}

/// Value reported by a `Current brightness: N%` reply.
pub fn parse_current(reply: &str) -> Option<u8> {
    capture_percent(&CURRENT, reply)
}

fn capture_percent(re: &Regex, reply: &str) -> Option<u8> {
    re.captures(reply)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u8>().ok())
        .filter(|v| *v <= MAX_BRIGHTNESS)
}
