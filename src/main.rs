//! `imacdisplay`: one-shot brightness control for the display controller.
//!
//! Thin dispatcher over the library session; all device logic lives there.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use imac_dimmer::config::{DEVICE_CONFIG_FILE, DeviceAddress, JsonStore, default_config_dir};
use imac_dimmer::locator::{DeviceLocator, LocatorSettings};
use imac_dimmer::session::{BrightnessAck, BrightnessSource, DeviceSession, SessionOptions};
use imac_dimmer::transport::{SerialAccess, SystemOpener, TransportKind};

#[derive(Debug, Parser)]
#[command(
    name = "imacdisplay",
    version,
    about = "Control the brightness of the ESP32-driven display panel"
)]
struct Cli {
    /// Controller host or IP address; remembered for later runs.
    #[arg(long, global = true, value_name = "HOST")]
    ip: Option<String>,

    /// How to reach the controller.
    #[arg(long, global = true, value_enum, default_value_t = TransportKind::Http)]
    transport: TransportKind,

    /// Serial device node (serial transport only). Auto-detected when omitted.
    #[arg(long, global = true, value_name = "PATH")]
    port: Option<PathBuf>,

    /// Open the serial port without taking the exclusive lock.
    #[arg(long, global = true)]
    non_exclusive: bool,

    /// Permit brightness 0 (panel fully off).
    #[arg(long, global = true)]
    allow_zero: bool,

    /// Directory holding imacdisplay.conf.
    #[arg(long, global = true, value_name = "DIR")]
    config_dir: Option<PathBuf>,

    /// Logging level (error|warn|info|debug|trace).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the current brightness.
    Get,
    /// Set brightness to a percentage (0-100).
    Set {
        #[arg(allow_negative_numbers = true)]
        value: i32,
    },
    /// Raise brightness by a step.
    Increment {
        #[arg(default_value_t = 10)]
        step: i32,
    },
    /// Lower brightness by a step.
    Decrement {
        #[arg(default_value_t = 10)]
        step: i32,
    },
    /// Print the controller firmware version.
    Version,
    /// Check that the controller answers.
    Ping,
    /// Search the local network for the controller and remember it.
    Discover,
}

fn main() {
    if let Err(err) = try_main() {
        error!(error = ?err, "imacdisplay failed");
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;

    let mut session = open_session(&cli)?;
    match cli.command {
        Commands::Get => {
            let brightness = session.get_brightness();
            match brightness.source {
                BrightnessSource::Live => println!("{}%", brightness.value),
                BrightnessSource::Cached => println!("{}% (last known)", brightness.value),
            }
        }
        Commands::Set { value } => {
            let ack = session
                .set_brightness(value, cli.allow_zero)
                .context("failed to set brightness")?;
            report(&ack);
        }
        Commands::Increment { step } => {
            let ack = session
                .adjust_brightness(step, cli.allow_zero)
                .context("failed to raise brightness")?;
            report(&ack);
        }
        Commands::Decrement { step } => {
            let ack = session
                .adjust_brightness(step.saturating_neg(), cli.allow_zero)
                .context("failed to lower brightness")?;
            report(&ack);
        }
        Commands::Version => {
            let version = session.get_version().context("failed to query version")?;
            println!("{version}");
        }
        Commands::Ping => {
            let reply = session.ping().context("controller did not answer ping")?;
            println!("{reply}");
        }
        Commands::Discover => {
            let found = session.discover().context("discovery failed")?;
            info!(step = ?found.step, "discovery finished");
            println!("{}", found.host);
        }
    }
    session.close();
    Ok(())
}

fn open_session(cli: &Cli) -> Result<DeviceSession> {
    let config_dir = cli.config_dir.clone().unwrap_or_else(default_config_dir);
    let store = JsonStore::new(config_dir.join(DEVICE_CONFIG_FILE));
    let options = SessionOptions {
        transport: cli.transport,
        access: if cli.non_exclusive {
            SerialAccess::Shared
        } else {
            SerialAccess::Exclusive
        },
        pinned: cli.port.clone().map(DeviceAddress::SerialPath),
    };
    let locator = DeviceLocator::system(LocatorSettings::default())?;
    let mut session = DeviceSession::new(options, locator, Box::new(SystemOpener::default()), store);
    if let Some(ip) = &cli.ip {
        session.pin_host(ip);
    }
    Ok(session)
}

fn report(ack: &BrightnessAck) {
    if ack.confirmed {
        println!("brightness set to {}%", ack.applied);
    } else {
        println!("brightness sent as {}% (not confirmed)", ack.requested);
    }
}

fn init_tracing(level: &str) -> Result<()> {
    let filter = EnvFilter::builder()
        .parse(level)
        .with_context(|| format!("invalid log level '{level}'"))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}
