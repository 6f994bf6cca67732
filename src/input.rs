//! Provides a means to read, parse and hold the engine's configuration.
use std::fs;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde_derive::Deserialize;

use crate::config::{BlacklistConfig, EngineConfig, RetryPolicy, WorkerCounts};

const LOWEST_PORT_NUMBER: u16 = 1;
const TOP_PORT_NUMBER: u16 = 65535;

pub type Ports = Vec<u16>;

pub fn parse_ports_and_ranges(input: &str) -> Result<Ports, String> {
    let mut ports = Vec::new();

    for part in input.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((start, end)) => ports.extend(parse_port_range(part, start, end)?),
            None => ports.push(parse_single_port(part)?),
        }
    }

    validate_ports(ports)
}

/// Rejects empty lists and port 0, then sorts and deduplicates `ports`.
fn validate_ports(mut ports: Ports) -> Result<Ports, String> {
    if ports.is_empty() {
        return Err(String::from("No valid ports or ranges provided"));
    }
    if let Some(port) = ports.iter().find(|&&p| p < LOWEST_PORT_NUMBER) {
        return Err(format!(
            "Port {port} must be between {LOWEST_PORT_NUMBER} and {TOP_PORT_NUMBER}"
        ));
    }

    ports.sort_unstable();
    ports.dedup();
    Ok(ports)
}

/// Config file ports go through the same checks as `--ports`.
fn deserialize_ports<'de, D>(deserializer: D) -> Result<Option<Ports>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let ports = <Ports as serde::Deserialize>::deserialize(deserializer)?;
    validate_ports(ports)
        .map(Some)
        .map_err(serde::de::Error::custom)
}

fn parse_port_range(range: &str, start: &str, end: &str) -> Result<Vec<u16>, String> {
    if end.contains('-') {
        return Err(format!(
            "Invalid range format '{range}'. Expected 'start-end'. Example: 8000-8010."
        ));
    }
    let start: u16 = start
        .parse()
        .map_err(|_| format!("Invalid start port '{start}' in range '{range}'"))?;
    let end: u16 = end
        .parse()
        .map_err(|_| format!("Invalid end port '{end}' in range '{range}'"))?;

    if start > end {
        return Err(format!(
            "Start port {start} is greater than end port {end} in range '{range}'"
        ));
    }
    if start < LOWEST_PORT_NUMBER {
        return Err(format!(
            "Ports in range '{range}' must be between {LOWEST_PORT_NUMBER} and {TOP_PORT_NUMBER}"
        ));
    }
    Ok((start..=end).collect())
}

fn parse_single_port(port: &str) -> Result<u16, String> {
    let parsed: u16 = port
        .parse()
        .map_err(|_| format!("Invalid port number '{port}'"))?;
    if parsed < LOWEST_PORT_NUMBER {
        return Err(format!(
            "Port {parsed} must be between {LOWEST_PORT_NUMBER} and {TOP_PORT_NUMBER}"
        ));
    }
    Ok(parsed)
}

/// A host given on the command line: an address, optionally with its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserHost {
    pub addr: IpAddr,
    pub name: Option<String>,
}

pub fn parse_user_host(input: &str) -> Result<UserHost, String> {
    let (addr, name) = match input.split_once('=') {
        Some((addr, name)) => (addr, Some(name.trim())),
        None => (input, None),
    };
    let addr = addr
        .trim()
        .parse()
        .map_err(|_| format!("Invalid address '{addr}'"))?;
    match name {
        Some("") => Err(format!("Empty host name in '{input}'")),
        name => Ok(UserHost {
            addr,
            name: name.map(str::to_owned),
        }),
    }
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "netforage",
    version = env!("CARGO_PKG_VERSION"),
    max_term_width = 120,
    help_template = "{bin} {version}\n{about}\n\nUSAGE:\n    {usage}\n\nOPTIONS:\n{options}",
)]
/// Autonomous Internet host discovery.
/// Reverse resolves random addresses, attempts zone transfers of every zone
/// it learns about and grabs service banners from the hosts it finds.
/// WARNING The scanner connects to arbitrary hosts on the Internet. Make sure
/// you are allowed to do that from where you run it.
pub struct Opts {
    /// Whether to ignore the configuration file or not.
    #[arg(short, long)]
    pub no_config: bool,

    /// Custom path to config file
    #[arg(short, long, value_parser)]
    pub config_path: Option<PathBuf>,

    /// A comma-delimited list or file of DNS resolvers.
    #[arg(long)]
    pub resolver: Option<String>,

    /// Workers drawing random addresses.
    #[arg(long, default_value = "2")]
    pub address_workers: usize,

    /// Workers reverse resolving drawn addresses.
    #[arg(long, default_value = "16")]
    pub name_workers: usize,

    /// Zone transfer workers.
    #[arg(long, default_value = "4")]
    pub xfr_workers: usize,

    /// Port probing workers.
    #[arg(long, default_value = "8")]
    pub scan_workers: usize,

    /// Capacity of the queues between workers.
    #[arg(long, default_value = "64")]
    pub queue_depth: usize,

    /// How often idle workers wake up, and how long feeders with nothing
    /// to do back off, in milliseconds.
    #[arg(long, default_value = "5000")]
    pub active_timeout: u64,

    /// The timeout in milliseconds of a single probe or zone transfer read.
    #[arg(short, long, default_value = "10000")]
    pub timeout: u64,

    /// The number of tries of a storage call or reverse lookup failing with
    /// a temporary error.
    #[arg(long, default_value = "5")]
    pub tries: u32,

    /// Milliseconds between two tries.
    #[arg(long, default_value = "250")]
    pub retry_delay: u64,

    /// Port name servers are asked for zone transfers on.
    #[arg(long, default_value = "53")]
    pub xfr_port: u16,

    /// Where zone transfers are spooled to.
    #[arg(long)]
    pub spool_dir: Option<PathBuf>,

    /// Regular expressions of host names to ignore, replacing the built-in list.
    #[arg(long, value_delimiter = ',')]
    pub blacklist_names: Option<Vec<String>>,

    /// CIDRs or addresses to ignore, replacing the built-in list.
    #[arg(long, value_delimiter = ',')]
    pub blacklist_addresses: Option<Vec<String>>,

    /// Ports tried in random order once a host's likely ports are done.
    /// Examples: 21,22,80 or 8000-8010,22
    #[arg(short, long, value_parser = parse_ports_and_ranges)]
    pub ports: Option<Ports>,

    /// Hosts to start from, as ADDRESS or ADDRESS=NAME. Named hosts are stored
    /// as they are, bare addresses are reverse resolved.
    #[arg(long = "host", value_parser = parse_user_host)]
    pub hosts: Vec<UserHost>,
}

impl Opts {
    pub fn read() -> Self {
        Self::parse()
    }

    /// Merges the values found within the user configuration file into
    /// the command line options.
    pub fn merge(&mut self, config: &Config) {
        if !self.no_config {
            self.merge_required(config);
            self.merge_optional(config);
        }
    }

    fn merge_required(&mut self, config: &Config) {
        macro_rules! merge_required {
            ($($field: ident),+) => {
                $(
                    if let Some(e) = &config.$field {
                        self.$field = e.clone();
                    }
                )+
            }
        }

        merge_required!(
            address_workers,
            name_workers,
            xfr_workers,
            scan_workers,
            queue_depth,
            active_timeout,
            timeout,
            tries,
            retry_delay,
            xfr_port
        );
    }

    fn merge_optional(&mut self, config: &Config) {
        macro_rules! merge_optional {
            ($($field: ident),+) => {
                $(
                    if config.$field.is_some() {
                        self.$field = config.$field.clone();
                    }
                )+
            }
        }

        merge_optional!(
            resolver,
            spool_dir,
            blacklist_names,
            blacklist_addresses,
            ports
        );
    }

    /// The engine settings these options describe. Anything not given falls
    /// back to [`EngineConfig::default`].
    pub fn engine_config(&self) -> EngineConfig {
        let defaults = EngineConfig::default();
        let blacklist = BlacklistConfig {
            name_patterns: self
                .blacklist_names
                .clone()
                .unwrap_or(defaults.blacklist.name_patterns),
            address_ranges: self
                .blacklist_addresses
                .clone()
                .unwrap_or(defaults.blacklist.address_ranges),
        };
        let mut ports = defaults.ports;
        if let Some(fallback) = &self.ports {
            ports.fallback.clone_from(fallback);
        }

        EngineConfig {
            workers: WorkerCounts {
                address: self.address_workers,
                name: self.name_workers,
                xfr: self.xfr_workers,
                scan: self.scan_workers,
            },
            queue_depth: self.queue_depth,
            active_timeout: Duration::from_millis(self.active_timeout),
            probe_timeout: Duration::from_millis(self.timeout),
            retry: RetryPolicy {
                attempts: self.tries.max(1),
                delay: Duration::from_millis(self.retry_delay),
            },
            spool_dir: self.spool_dir.clone().unwrap_or(defaults.spool_dir),
            xfr_port: self.xfr_port,
            blacklist,
            ports,
        }
    }
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            no_config: true,
            config_path: None,
            resolver: None,
            address_workers: 2,
            name_workers: 16,
            xfr_workers: 4,
            scan_workers: 8,
            queue_depth: 64,
            active_timeout: 5_000,
            timeout: 10_000,
            tries: 5,
            retry_delay: 250,
            xfr_port: 53,
            spool_dir: None,
            blacklist_names: None,
            blacklist_addresses: None,
            ports: None,
            hosts: vec![],
        }
    }
}

/// Struct used to deserialize the options specified within our config file.
/// These will be further merged with our command line arguments in order to
/// generate the final Opts struct.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    resolver: Option<String>,
    address_workers: Option<usize>,
    name_workers: Option<usize>,
    xfr_workers: Option<usize>,
    scan_workers: Option<usize>,
    queue_depth: Option<usize>,
    active_timeout: Option<u64>,
    timeout: Option<u64>,
    tries: Option<u32>,
    retry_delay: Option<u64>,
    xfr_port: Option<u16>,
    spool_dir: Option<PathBuf>,
    blacklist_names: Option<Vec<String>>,
    blacklist_addresses: Option<Vec<String>>,
    #[serde(default, deserialize_with = "deserialize_ports")]
    ports: Option<Ports>,
}

impl Config {
    /// Reads the configuration file with TOML format and parses it into a
    /// Config struct. A missing file is an empty configuration.
    ///
    /// # Format
    ///
    /// resolver = "1.1.1.1,9.9.9.9"
    /// name_workers = 32
    /// timeout = 5000
    /// blacklist_addresses = ["10.0.0.0/8", "192.168.0.0/16"]
    /// ports = [21, 22, 23, 80, 443]
    ///
    pub fn read(custom_config_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let config_path = custom_config_path.unwrap_or_else(default_config_path);
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("cannot read {}", config_path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("invalid configuration in {}", config_path.display()))
    }
}

/// Constructs default path to config toml
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".netforage.toml")
}
