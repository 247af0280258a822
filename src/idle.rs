//! User idle-time measurement.
//!
//! [`ChainedIdleSource`] asks each [`IdleStrategy`] in order on every sample
//! and takes the first answer. When nothing answers the user is treated as
//! active, so an unmeasurable system is never dimmed.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::command::{CommandError, run_with_timeout};

/// Reported when the screen is locked or blanked, forcing the idle branch.
pub const LOCKED_IDLE: Duration = Duration::from_secs(999_999);

const TOOL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum IdleError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("unrecognised output: {0:?}")]
    Unparseable(String),
}

pub trait IdleSource {
    /// Current user idle time. Never fails; zero means "active".
    fn sample(&mut self) -> Duration;
}

pub trait IdleStrategy: Send {
    fn name(&self) -> &'static str;
    fn idle_time(&self) -> Result<Duration, IdleError>;
}

pub struct ChainedIdleSource {
    strategies: Vec<Box<dyn IdleStrategy>>,
}

impl ChainedIdleSource {
    pub fn new(strategies: Vec<Box<dyn IdleStrategy>>) -> Self {
        Self { strategies }
    }

    /// The desktop tool chain, most precise first.
    pub fn system() -> Self {
        Self::new(vec![
            Box::new(Xprintidle),
            Box::new(ScreenSaverDbus),
            Box::new(WhoIdle),
            Box::new(XsetDpms),
            Box::new(GnomeScreensaver),
        ])
    }
}

impl IdleSource for ChainedIdleSource {
    fn sample(&mut self) -> Duration {
        for strategy in &self.strategies {
            match strategy.idle_time() {
                Ok(idle) => {
                    trace!(strategy = strategy.name(), idle = ?idle, "idle sample");
                    return idle;
                }
                Err(err) => debug!(strategy = strategy.name(), error = %err, "idle strategy failed"),
            }
        }
        warn!("could not determine idle time; assuming active");
        Duration::ZERO
    }
}

/// `xprintidle`: X11 idle milliseconds.
pub struct Xprintidle;

impl IdleStrategy for Xprintidle {
    fn name(&self) -> &'static str {
        "xprintidle"
    }

    fn idle_time(&self) -> Result<Duration, IdleError> {
        let out = run_with_timeout("xprintidle", &[], TOOL_TIMEOUT)?;
        parse_millis(&out)
    }
}

/// freedesktop ScreenSaver session idle time over D-Bus (KDE, some Wayland sessions).
pub struct ScreenSaverDbus;

impl IdleStrategy for ScreenSaverDbus {
    fn name(&self) -> &'static str {
        "qdbus-screensaver"
    }

    fn idle_time(&self) -> Result<Duration, IdleError> {
        let out = run_with_timeout(
            "qdbus",
            &[
                "org.freedesktop.ScreenSaver",
                "/ScreenSaver",
                "GetSessionIdleTime",
            ],
            TOOL_TIMEOUT,
        )?;
        parse_millis(&out)
    }
}

/// Terminal idle column from `who -u`.
pub struct WhoIdle;

impl IdleStrategy for WhoIdle {
    fn name(&self) -> &'static str {
        "who"
    }

    fn idle_time(&self) -> Result<Duration, IdleError> {
        let out = run_with_timeout("who", &["-u"], TOOL_TIMEOUT)?;
        parse_who_idle(&out)
    }
}

/// DPMS monitor state from `xset q`; a powered-down monitor counts as locked.
pub struct XsetDpms;

impl IdleStrategy for XsetDpms {
    fn name(&self) -> &'static str {
        "xset"
    }

    fn idle_time(&self) -> Result<Duration, IdleError> {
        let out = run_with_timeout("xset", &["q"], TOOL_TIMEOUT)?;
        parse_xset_monitor(&out)
    }
}

pub struct GnomeScreensaver;

impl IdleStrategy for GnomeScreensaver {
    fn name(&self) -> &'static str {
        "gnome-screensaver"
    }

    fn idle_time(&self) -> Result<Duration, IdleError> {
        let out = run_with_timeout("gnome-screensaver-command", &["--query"], TOOL_TIMEOUT)?;
        parse_screensaver_query(&out)
    }
}

fn parse_millis(out: &str) -> Result<Duration, IdleError> {
    out.trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| IdleError::Unparseable(out.trim().to_string()))
}

/// Smallest idle value across `who -u` sessions.
///
/// Columns are NAME LINE DATE TIME IDLE PID; IDLE is `.` (under a minute),
/// `old` (over a day) or `HH:MM`.
pub fn parse_who_idle(out: &str) -> Result<Duration, IdleError> {
    let mut best: Option<Duration> = None;
    for line in out.lines() {
        let Some(field) = line.split_whitespace().nth(4) else {
            continue;
        };
        let idle = match field {
            "." => Duration::ZERO,
            "old" => Duration::from_secs(24 * 3600),
            other => match other.split_once(':') {
                Some((h, m)) => match (h.parse::<u64>(), m.parse::<u64>()) {
                    (Ok(h), Ok(m)) => Duration::from_secs(h * 3600 + m * 60),
                    _ => continue,
                },
                None => continue,
            },
        };
        best = Some(best.map_or(idle, |b| b.min(idle)));
    }
    best.ok_or_else(|| IdleError::Unparseable(out.trim().to_string()))
}

pub fn parse_xset_monitor(out: &str) -> Result<Duration, IdleError> {
    let state = out
        .lines()
        .find_map(|line| line.trim().strip_prefix("Monitor is "))
        .ok_or_else(|| IdleError::Unparseable("no DPMS monitor state".to_string()))?;
    if state.trim().eq_ignore_ascii_case("on") {
        // The monitor being on says nothing about how long the user has been away.
        Err(IdleError::Unparseable(format!("monitor is {}", state.trim())))
    } else {
        Ok(LOCKED_IDLE)
    }
}

pub fn parse_screensaver_query(out: &str) -> Result<Duration, IdleError> {
    let lower = out.to_ascii_lowercase();
    if lower.contains("is active") {
        Ok(LOCKED_IDLE)
    } else if lower.contains("is inactive") {
        Err(IdleError::Unparseable("screensaver inactive".to_string()))
    } else {
        Err(IdleError::Unparseable(out.trim().to_string()))
    }
}
