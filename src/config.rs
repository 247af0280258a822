//! Persisted records for the display controller and the auto-dimmer.
//!
//! Both records live in small JSON files under the user's config directory.
//! A missing file yields defaults; a malformed one yields defaults plus a
//! warning. Writes replace the file atomically.

use std::fs;
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::transport::TransportKind;

pub const DEVICE_CONFIG_FILE: &str = "imacdisplay.conf";
pub const DIMMER_CONFIG_FILE: &str = "auto_dimmer.json";

/// Brightness reported when nothing better is known.
pub const DEFAULT_BRIGHTNESS: u8 = 70;

/// Where the controller was last found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceAddress {
    SerialPath(PathBuf),
    HttpEndpoint(String),
}

impl DeviceAddress {
    pub fn kind(&self) -> TransportKind {
        match self {
            DeviceAddress::SerialPath(_) => TransportKind::Serial,
            DeviceAddress::HttpEndpoint(_) => TransportKind::Http,
        }
    }
}

impl std::fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceAddress::SerialPath(path) => write!(f, "{}", path.display()),
            DeviceAddress::HttpEndpoint(host) => write!(f, "http://{host}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Last serial node the controller answered on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<PathBuf>,
    /// Last host or IP the controller answered on.
    #[serde(default, rename = "esp32_ip", skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default = "default_brightness")]
    pub last_brightness: u8,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            port: None,
            host: None,
            last_brightness: default_brightness(),
        }
    }
}

impl DeviceConfig {
    pub fn address(&self, kind: TransportKind) -> Option<DeviceAddress> {
        match kind {
            TransportKind::Serial => self.port.clone().map(DeviceAddress::SerialPath),
            TransportKind::Http => self.host.clone().map(DeviceAddress::HttpEndpoint),
        }
    }

    pub fn remember(&mut self, address: &DeviceAddress) {
        match address {
            DeviceAddress::SerialPath(path) => self.port = Some(path.clone()),
            DeviceAddress::HttpEndpoint(host) => self.host = Some(host.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimmerConfig {
    #[serde(default = "default_idle_minutes")]
    pub idle_minutes: f64,
    #[serde(default = "default_dim_level")]
    pub dim_level: u8,
    /// Poll interval in seconds.
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Local>>,
}

impl Default for DimmerConfig {
    fn default() -> Self {
        Self {
            idle_minutes: default_idle_minutes(),
            dim_level: default_dim_level(),
            check_interval: default_check_interval(),
            last_updated: None,
        }
    }
}

impl DimmerConfig {
    /// Idle time after which the panel is dimmed. Out-of-range minutes
    /// saturate to `Duration::MAX` (never dim).
    pub fn idle_threshold(&self) -> Duration {
        Duration::try_from_secs_f64((self.idle_minutes * 60.0).max(0.0)).unwrap_or(Duration::MAX)
    }

    /// Replace settings that cannot be honoured with their defaults.
    pub fn normalize(&mut self) {
        let threshold_ok = self.idle_minutes.is_finite()
            && self.idle_minutes >= 0.0
            && Duration::try_from_secs_f64(self.idle_minutes * 60.0).is_ok();
        if !threshold_ok {
            warn!(
                idle_minutes = self.idle_minutes,
                fallback = default_idle_minutes(),
                "idle_minutes out of range; using default"
            );
            self.idle_minutes = default_idle_minutes();
        }
        if self.dim_level > 100 {
            warn!(dim_level = self.dim_level, "dim_level above 100; clamping");
            self.dim_level = 100;
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval.max(1))
    }
}

fn default_brightness() -> u8 {
    DEFAULT_BRIGHTNESS
}

fn default_idle_minutes() -> f64 {
    10.0
}

fn default_dim_level() -> u8 {
    0
}

fn default_check_interval() -> u64 {
    30
}

/// Default directory for both config files (`$XDG_CONFIG_HOME` or `~/.config`).
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir().unwrap_or_else(|| PathBuf::from(".config"))
}

/// JSON file holding one record of type `T`.
#[derive(Debug, Clone)]
pub struct JsonStore<T> {
    path: PathBuf,
    pretty: bool,
    _record: PhantomData<fn() -> T>,
}

impl<T> JsonStore<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pretty: false,
            _record: PhantomData,
        }
    }

    /// Write indented JSON instead of a single line.
    pub fn pretty(mut self) -> Self {
        self.pretty = true;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the record, falling back to defaults on any failure.
    pub fn load(&self) -> T {
        match self.try_load() {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(path = %self.path.display(), "config file missing; using defaults");
                T::default()
            }
            Err(err) => {
                warn!(error = %err, "failed to load config; using defaults");
                T::default()
            }
        }
    }

    fn try_load(&self) -> Result<Option<T>> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(Error::ConfigIo {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|source| Error::ConfigFormat {
                path: self.path.clone(),
                source,
            })
    }

    pub fn save(&self, record: &T) -> Result<()> {
        let encoded = if self.pretty {
            serde_json::to_vec_pretty(record)
        } else {
            serde_json::to_vec(record)
        }
        .map_err(|source| Error::ConfigFormat {
            path: self.path.clone(),
            source,
        })?;

        let io_err = |source| Error::ConfigIo {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, encoded).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)?;
        debug!(path = %self.path.display(), "config saved");
        Ok(())
    }
}
