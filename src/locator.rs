//! Finding the display controller.
//!
//! Serial resolution always produces a path; whether it opens is the
//! session's problem. Network discovery walks an ordered list of steps and
//! stops at the first host that answers the `/version` liveness probe.

use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::blocking::Client;
use tracing::{debug, info, warn};

use crate::command::run_with_timeout;
use crate::transport::http::version_responds;

static IPV4: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{1,3}(?:\.\d{1,3}){3})\b").expect("valid regex"));
static MAC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b([0-9a-fA-F]{2}(?::[0-9a-fA-F]{2}){5})\b").expect("valid regex")
});
static ROUTE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{1,3}\.\d{1,3}\.\d{1,3})\.\d{1,3}/\d+.*\bsrc\s+\d{1,3}(?:\.\d{1,3}){3}")
        .expect("valid regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryStep {
    /// Address remembered from an earlier session.
    Cached,
    /// Well-known mDNS hostname.
    Hostname,
    /// Vendor hardware prefixes in the ARP/neighbour table.
    NeighborTable,
    /// Zeroconf `_http._tcp` records with a matching name.
    ServiceBrowse,
    /// Conventional host numbers on attached /24 networks.
    SubnetScan,
}

impl DiscoveryStep {
    pub const ALL: [DiscoveryStep; 5] = [
        DiscoveryStep::Cached,
        DiscoveryStep::Hostname,
        DiscoveryStep::NeighborTable,
        DiscoveryStep::ServiceBrowse,
        DiscoveryStep::SubnetScan,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovered {
    pub host: String,
    pub step: DiscoveryStep,
}

#[derive(Debug, Clone)]
pub struct LocatorSettings {
    pub steps: Vec<DiscoveryStep>,
    pub hostname: String,
    /// Stale default shipped with early configs; never worth probing.
    pub placeholder_host: String,
    /// Timeout for the cached and hostname probes.
    pub direct_timeout: Duration,
    /// Timeout for each probe of a scanned candidate.
    pub probe_timeout: Duration,
    pub vendor_ouis: Vec<String>,
    pub service_keywords: Vec<String>,
    pub scan_endings: Vec<u8>,
    pub max_subnets: usize,
    pub serial_dir: PathBuf,
    /// Device node prefixes, most preferred first.
    pub serial_prefixes: Vec<String>,
    pub serial_default: PathBuf,
}

impl Default for LocatorSettings {
    fn default() -> Self {
        Self {
            steps: DiscoveryStep::ALL.to_vec(),
            hostname: "imacdimmer.local".to_string(),
            placeholder_host: "192.168.1.100".to_string(),
            direct_timeout: Duration::from_secs(3),
            probe_timeout: Duration::from_secs(1),
            vendor_ouis: ["10:00:3b", "24:6f:28", "30:ae:a4", "7c:df:a1", "cc:50:e3"]
                .into_iter()
                .map(String::from)
                .collect(),
            service_keywords: ["esp32", "arduino", "imacdimmer"]
                .into_iter()
                .map(String::from)
                .collect(),
            scan_endings: vec![27, 100, 101, 102, 200, 201, 202, 150, 151, 152],
            max_subnets: 3,
            serial_dir: PathBuf::from("/dev"),
            serial_prefixes: vec!["ttyACM".to_string(), "ttyUSB".to_string()],
            serial_default: PathBuf::from("/dev/ttyACM0"),
        }
    }
}

/// The host-side facts discovery depends on.
pub trait NetworkEnvironment: Send {
    /// `GET /version` liveness probe.
    fn probe(&self, host: &str, timeout: Duration) -> bool;
    /// Raw ARP/neighbour table text.
    fn neighbor_table(&self) -> Result<String>;
    /// Raw `avahi-browse -p` output.
    fn service_browse(&self) -> Result<String>;
    /// Raw `ip route` output.
    fn routes(&self) -> Result<String>;
}

pub struct SystemNetwork {
    client: Client,
}

impl SystemNetwork {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .build()
            .context("failed to build HTTP client for discovery")?;
        Ok(Self { client })
    }
}

impl NetworkEnvironment for SystemNetwork {
    fn probe(&self, host: &str, timeout: Duration) -> bool {
        version_responds(&self.client, host, timeout)
    }

    fn neighbor_table(&self) -> Result<String> {
        match fs::read_to_string("/proc/net/arp") {
            Ok(table) => Ok(table),
            Err(err) => {
                debug!(error = %err, "no /proc/net/arp; falling back to arp -a");
                run_with_timeout("arp", &["-a"], Duration::from_secs(5))
                    .context("failed to read ARP table")
            }
        }
    }

    fn service_browse(&self) -> Result<String> {
        run_with_timeout(
            "avahi-browse",
            &["-t", "-r", "-p", "_http._tcp"],
            Duration::from_secs(10),
        )
        .context("failed to browse zeroconf services")
    }

    fn routes(&self) -> Result<String> {
        run_with_timeout("ip", &["route"], Duration::from_secs(5))
            .context("failed to list routes")
    }
}

pub struct DeviceLocator {
    settings: LocatorSettings,
    network: Box<dyn NetworkEnvironment>,
}

impl DeviceLocator {
    pub fn new(settings: LocatorSettings, network: Box<dyn NetworkEnvironment>) -> Self {
        Self { settings, network }
    }

    pub fn system(settings: LocatorSettings) -> Result<Self> {
        Ok(Self::new(settings, Box::new(SystemNetwork::new()?)))
    }

    pub fn settings(&self) -> &LocatorSettings {
        &self.settings
    }

    /// Pick a serial node: `preferred` if it exists, else the best match in
    /// the device directory, else the fixed default.
    pub fn resolve_serial(&self, preferred: Option<&Path>) -> PathBuf {
        if let Some(path) = preferred {
            if path.exists() {
                return path.to_path_buf();
            }
            info!(port = %path.display(), "configured serial port not found; scanning");
        }

        let mut candidates: Vec<(usize, PathBuf)> = Vec::new();
        match fs::read_dir(&self.settings.serial_dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let name = entry.file_name();
                    let Some(name) = name.to_str() else {
                        continue;
                    };
                    if let Some(rank) = self
                        .settings
                        .serial_prefixes
                        .iter()
                        .position(|prefix| name.starts_with(prefix.as_str()))
                    {
                        candidates.push((rank, entry.path()));
                    }
                }
            }
            Err(err) => warn!(
                dir = %self.settings.serial_dir.display(),
                error = %err,
                "failed to list serial devices"
            ),
        }
        candidates.sort();

        match candidates.into_iter().next() {
            Some((_, path)) => {
                debug!(port = %path.display(), "serial port detected");
                path
            }
            None => {
                debug!(port = %self.settings.serial_default.display(), "no serial candidates; using default");
                self.settings.serial_default.clone()
            }
        }
    }

    /// Run every configured step, starting with `cached` when it is usable.
    pub fn discover(&self, cached: Option<&str>) -> Option<Discovered> {
        for step in &self.settings.steps {
            let found = match step {
                DiscoveryStep::Cached => self.try_cached(cached),
                DiscoveryStep::Hostname => self.try_hostname(),
                DiscoveryStep::NeighborTable => self.try_neighbor_table(),
                DiscoveryStep::ServiceBrowse => self.try_service_browse(),
                DiscoveryStep::SubnetScan => self.try_subnet_scan(),
            };
            if let Some(host) = found {
                info!(host = %host, step = ?step, "display controller found");
                return Some(Discovered { host, step: *step });
            }
            debug!(step = ?step, "discovery step found nothing");
        }
        warn!("display controller not found on the local network");
        None
    }

    /// Discovery that ignores any remembered address.
    pub fn discover_fresh(&self) -> Option<Discovered> {
        self.discover(None)
    }

    fn try_cached(&self, cached: Option<&str>) -> Option<String> {
        let host = cached
            .map(str::trim)
            .filter(|h| !h.is_empty() && *h != self.settings.placeholder_host)?;
        self.network
            .probe(host, self.settings.direct_timeout)
            .then(|| host.to_string())
    }

    fn try_hostname(&self) -> Option<String> {
        let host = self.settings.hostname.as_str();
        self.network
            .probe(host, self.settings.direct_timeout)
            .then(|| host.to_string())
    }

    fn try_neighbor_table(&self) -> Option<String> {
        let table = match self.network.neighbor_table() {
            Ok(table) => table,
            Err(err) => {
                debug!(error = %err, "neighbour table unavailable");
                return None;
            }
        };
        parse_neighbors(&table)
            .into_iter()
            .filter(|(_, mac)| {
                self.settings
                    .vendor_ouis
                    .iter()
                    .any(|oui| mac.starts_with(&oui.to_ascii_lowercase()))
            })
            .map(|(ip, _)| ip.to_string())
            .find(|ip| {
                debug!(ip = %ip, "vendor hardware address in neighbour table");
                self.network.probe(ip, self.settings.probe_timeout)
            })
    }

    fn try_service_browse(&self) -> Option<String> {
        let records = match self.network.service_browse() {
            Ok(out) => parse_service_records(&out),
            Err(err) => {
                debug!(error = %err, "service browse unavailable");
                return None;
            }
        };
        records
            .into_iter()
            .filter(|record| {
                let name = record.name.to_ascii_lowercase();
                let hostname = record.hostname.to_ascii_lowercase();
                self.settings.service_keywords.iter().any(|kw| {
                    let kw = kw.to_ascii_lowercase();
                    name.contains(&kw) || hostname.contains(&kw)
                })
            })
            .map(|record| record.address.to_string())
            .find(|ip| self.network.probe(ip, self.settings.probe_timeout))
    }

    fn try_subnet_scan(&self) -> Option<String> {
        let prefixes = match self.network.routes() {
            Ok(out) => parse_route_prefixes(&out),
            Err(err) => {
                debug!(error = %err, "routing table unavailable");
                return None;
            }
        };
        let prefixes: Vec<String> = prefixes
            .into_iter()
            .take(self.settings.max_subnets)
            .collect();
        info!(subnets = ?prefixes, "scanning local subnets");

        for prefix in &prefixes {
            for ending in &self.settings.scan_endings {
                let ip = format!("{prefix}.{ending}");
                if self.network.probe(&ip, self.settings.probe_timeout) {
                    return Some(ip);
                }
            }
        }
        None
    }
}

/// `(ip, lowercase mac)` pairs from `/proc/net/arp`, `arp -a` or `ip neigh`.
pub fn parse_neighbors(table: &str) -> Vec<(Ipv4Addr, String)> {
    table
        .lines()
        .filter_map(|line| {
            let ip = IPV4
                .captures(line)
                .and_then(|c| c[1].parse::<Ipv4Addr>().ok())?;
            let mac = MAC.captures(line)?[1].to_ascii_lowercase();
            (mac != "00:00:00:00:00:00").then_some((ip, mac))
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub name: String,
    pub hostname: String,
    pub address: Ipv4Addr,
}

/// Resolved IPv4 records from `avahi-browse -p` (`=;iface;proto;name;type;domain;host;addr;port;txt`).
pub fn parse_service_records(out: &str) -> Vec<ServiceRecord> {
    out.lines()
        .filter(|line| line.starts_with("=;"))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(';').collect();
            if fields.len() < 8 {
                return None;
            }
            let address = fields[7].parse::<Ipv4Addr>().ok()?;
            Some(ServiceRecord {
                name: fields[3].to_string(),
                hostname: fields[6].to_string(),
                address,
            })
        })
        .collect()
}

/// `/24` prefixes (`a.b.c`) of directly attached networks, in route order.
pub fn parse_route_prefixes(out: &str) -> Vec<String> {
    let mut prefixes: Vec<String> = Vec::new();
    for line in out.lines() {
        let Some(caps) = ROUTE.captures(line.trim()) else {
            continue;
        };
        let prefix = caps[1].to_string();
        if prefix.starts_with("169.254") || prefixes.contains(&prefix) {
            continue;
        }
        prefixes.push(prefix);
    }
    prefixes
}
