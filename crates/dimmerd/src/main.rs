//! `imac-dimmerd`: dims the display panel while the desktop is idle.
//!
//! SIGINT and SIGTERM end the poll loop and restore the brightness in force
//! before dimming.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::runtime::Handle;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use imac_dimmer::config::{
    DEVICE_CONFIG_FILE, DIMMER_CONFIG_FILE, DeviceAddress, DimmerConfig, JsonStore,
    default_config_dir,
};
use imac_dimmer::dimmer::AutoDimmer;
use imac_dimmer::idle::{ChainedIdleSource, IdleSource};
use imac_dimmer::locator::{DeviceLocator, LocatorSettings};
use imac_dimmer::session::{DeviceSession, SessionOptions};
use imac_dimmer::transport::{SerialAccess, SystemOpener, TransportKind};

const TEST_SAMPLES: usize = 5;
const TEST_GAP: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Parser)]
#[command(
    name = "imac-dimmerd",
    version,
    about = "Dim the display panel when the desktop goes idle"
)]
struct Args {
    /// Idle minutes before dimming (fractions allowed).
    #[arg(long, value_parser = parse_minutes)]
    minutes: Option<f64>,

    /// Brightness to dim to (0-100).
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=100))]
    level: Option<u8>,

    /// Seconds between idle checks.
    #[arg(long)]
    interval: Option<u64>,

    /// How to reach the controller.
    #[arg(long, value_enum, default_value_t = TransportKind::Http)]
    transport: TransportKind,

    /// Serial device node (serial transport only).
    #[arg(long)]
    port: Option<PathBuf>,

    /// Sample idle time a few times and exit.
    #[arg(long)]
    test: bool,

    /// Print idle time, brightness and settings, then exit.
    #[arg(long)]
    status: bool,

    /// Save the effective settings as the new defaults, then exit.
    #[arg(long)]
    save_config: bool,

    /// Directory holding imacdisplay.conf and auto_dimmer.json.
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Logging level (error|warn|info|debug|trace).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_minutes(raw: &str) -> std::result::Result<f64, String> {
    let minutes: f64 = raw
        .parse()
        .map_err(|_| format!("'{raw}' is not a number"))?;
    if !minutes.is_finite() || minutes < 0.0 {
        return Err(format!("'{raw}' must be a finite number of minutes >= 0"));
    }
    if Duration::try_from_secs_f64(minutes * 60.0).is_err() {
        return Err(format!("'{raw}' minutes is too long"));
    }
    Ok(minutes)
}

impl Args {
    fn apply_overrides(&self, config: &mut DimmerConfig) {
        if let Some(minutes) = self.minutes {
            config.idle_minutes = minutes;
        }
        if let Some(level) = self.level {
            config.dim_level = level;
        }
        if let Some(interval) = self.interval {
            config.check_interval = interval;
        }
    }
}

#[tokio::main]
async fn main() {
    if let Err(err) = try_main().await {
        error!(error = ?err, "imac-dimmerd exited with error");
        std::process::exit(1);
    }
}

async fn try_main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level)?;

    let cancel = CancellationToken::new();
    watch_signals(cancel.clone())?;

    // Device I/O is blocking; keep it off the async workers.
    let handle = Handle::current();
    tokio::task::spawn_blocking(move || run(args, cancel, handle))
        .await
        .context("dimmer thread panicked")?
}

fn run(args: Args, cancel: CancellationToken, handle: Handle) -> Result<()> {
    if args.test {
        sample_idle(&cancel, &handle);
        return Ok(());
    }

    let config_dir = args.config_dir.clone().unwrap_or_else(default_config_dir);
    let dimmer_store = JsonStore::new(config_dir.join(DIMMER_CONFIG_FILE)).pretty();
    let mut config: DimmerConfig = dimmer_store.load();
    args.apply_overrides(&mut config);

    let options = SessionOptions {
        transport: args.transport,
        access: SerialAccess::Exclusive,
        pinned: args.port.clone().map(DeviceAddress::SerialPath),
    };
    let locator = DeviceLocator::system(LocatorSettings::default())?;
    let session = DeviceSession::new(
        options,
        locator,
        Box::new(SystemOpener::default()),
        JsonStore::new(config_dir.join(DEVICE_CONFIG_FILE)),
    );
    let mut dimmer = AutoDimmer::new(ChainedIdleSource::system(), session, config, dimmer_store);

    if args.save_config {
        dimmer
            .save_config()
            .context("failed to save auto-dimmer settings")?;
        println!("settings saved");
        return Ok(());
    }
    if args.status {
        println!("{}", dimmer.status());
        return Ok(());
    }

    dimmer.run(&cancel, &handle);
    info!("auto-dimmer stopped");
    Ok(())
}

fn sample_idle(cancel: &CancellationToken, handle: &Handle) {
    let mut idle = ChainedIdleSource::system();
    for n in 1..=TEST_SAMPLES {
        let sample = idle.sample();
        let whole = Duration::from_secs(sample.as_secs());
        println!(
            "sample {n}/{TEST_SAMPLES}: idle {}",
            humantime::format_duration(whole)
        );
        if n == TEST_SAMPLES {
            break;
        }
        let cancelled = handle.block_on(async {
            tokio::select! {
                _ = cancel.cancelled() => true,
                _ = tokio::time::sleep(TEST_GAP) => false,
            }
        });
        if cancelled {
            break;
        }
    }
}

fn watch_signals(cancel: CancellationToken) -> Result<()> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to register SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("failed to register SIGINT handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM; shutting down"),
            _ = sigint.recv() => info!("received SIGINT; shutting down"),
        }
        cancel.cancel();
    });
    Ok(())
}

fn init_tracing(level: &str) -> Result<()> {
    let filter = EnvFilter::builder()
        .parse(level)
        .with_context(|| format!("invalid log level '{level}'"))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_replace_loaded_values() {
        let args = Args::parse_from(["imac-dimmerd", "--minutes", "5", "--level", "10", "--interval", "15"]);
        let mut config = DimmerConfig::default();
        args.apply_overrides(&mut config);
        assert_eq!(config.idle_minutes, 5.0);
        assert_eq!(config.dim_level, 10);
        assert_eq!(config.check_interval, 15);
    }

    #[test]
    fn level_outside_percent_range_is_rejected() {
        assert!(Args::try_parse_from(["imac-dimmerd", "--level", "150"]).is_err());
    }

    #[test]
    fn unbounded_minutes_are_rejected() {
        for bad in ["inf", "NaN", "-1", "1e300", "soon"] {
            assert!(
                Args::try_parse_from(["imac-dimmerd", "--minutes", bad]).is_err(),
                "accepted --minutes {bad}"
            );
        }
        let args = Args::parse_from(["imac-dimmerd", "--minutes", "0.5"]);
        assert_eq!(args.minutes, Some(0.5));
    }

    #[test]
    fn no_flags_keep_loaded_values() {
        let args = Args::parse_from(["imac-dimmerd"]);
        let mut config = DimmerConfig {
            idle_minutes: 3.5,
            ..DimmerConfig::default()
        };
        args.apply_overrides(&mut config);
        assert_eq!(config.idle_minutes, 3.5);
        assert_eq!(config.check_interval, 30);
    }
}
