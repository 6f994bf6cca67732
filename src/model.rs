//! The records the discovery pipeline produces and hands to storage.
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// Identity assigned by the storage collaborator.
pub type RowId = i64;

/// How a [`Host`] found its way into storage.
///
/// The numeric codes are what storage persists, so they must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum HostSource {
    RandomGeneration = 1,
    ZoneTransfer = 2,
    MailExchanger = 3,
    NameServer = 4,
    UserSupplied = 5,
}

impl HostSource {
    pub const fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for HostSource {
    type Error = ModelError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(Self::RandomGeneration),
            2 => Ok(Self::ZoneTransfer),
            3 => Ok(Self::MailExchanger),
            4 => Ok(Self::NameServer),
            5 => Ok(Self::UserSupplied),
            other => Err(ModelError::InvalidSource(other)),
        }
    }
}

impl fmt::Display for HostSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RandomGeneration => "Generator",
            Self::ZoneTransfer => "XFR",
            Self::MailExchanger => "MX",
            Self::NameServer => "NS",
            Self::UserSupplied => "User",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("invalid host source code {0}")]
    InvalidSource(u8),
    #[error("zone {0} cannot be finished before it was started")]
    FinishedBeforeStart(String),
}

/// A host on the wide, wide Internet.
///
/// Address, name and source are fixed at construction; only the metadata
/// filled in by later processes is mutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    id: Option<RowId>,
    addr: IpAddr,
    name: String,
    added: DateTime<Utc>,
    last_contact: Option<DateTime<Utc>>,
    pub sysname: Option<String>,
    pub location: Option<String>,
    source: HostSource,
}

impl Host {
    /// Creates a not yet persisted host. A trailing root dot on the name is dropped.
    pub fn new(addr: IpAddr, name: &str, source: HostSource) -> Self {
        Self {
            id: None,
            addr,
            name: normalize_name(name),
            added: Utc::now(),
            last_contact: None,
            sysname: None,
            location: None,
            source,
        }
    }

    pub const fn id(&self) -> Option<RowId> {
        self.id
    }

    pub const fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn source(&self) -> HostSource {
        self.source
    }

    pub const fn added(&self) -> DateTime<Utc> {
        self.added
    }

    pub const fn last_contact(&self) -> Option<DateTime<Utc>> {
        self.last_contact
    }

    /// Called by storage once the host has been assigned its identity.
    #[must_use]
    pub fn persisted(mut self, id: RowId, added: DateTime<Utc>) -> Self {
        self.id = Some(id);
        self.added = added;
        self
    }

    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.last_contact = Some(at);
    }
}

/// A DNS zone we may attempt a zone transfer on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    pub id: Option<RowId>,
    pub name: String,
    pub added: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub success: bool,
}

impl Zone {
    pub fn new(name: &str) -> Self {
        Self {
            id: None,
            name: normalize_name(name),
            added: Utc::now(),
            started: None,
            finished: None,
            success: false,
        }
    }

    /// A zone without a finished timestamp is eligible for a transfer attempt.
    pub const fn is_finished(&self) -> bool {
        self.finished.is_some()
    }

    pub fn start(&mut self, at: DateTime<Utc>) {
        self.started = Some(at);
    }

    pub fn finish(&mut self, at: DateTime<Utc>, success: bool) -> Result<(), ModelError> {
        if self.started.is_none() {
            return Err(ModelError::FinishedBeforeStart(self.name.clone()));
        }
        self.finished = Some(at);
        self.success = success;
        Ok(())
    }
}

/// The outcome of probing a single port on a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Option<RowId>,
    pub host_id: Option<RowId>,
    pub port: u16,
    pub success: bool,
    pub response: String,
    pub timestamp: DateTime<Utc>,
}

impl Service {
    pub fn success(host: &Host, port: u16, response: String) -> Self {
        Self {
            id: None,
            host_id: host.id(),
            port,
            success: true,
            response,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(host: &Host, port: u16, reason: String) -> Self {
        Self {
            success: false,
            ..Self::success(host, port, reason)
        }
    }
}

/// The subsystems the control surface can address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubsystemId {
    Generator,
    GeneratorAddress,
    GeneratorName,
    Xfr,
    Scanner,
}

impl SubsystemId {
    pub const ALL: [Self; 5] = [
        Self::Generator,
        Self::GeneratorAddress,
        Self::GeneratorName,
        Self::Xfr,
        Self::Scanner,
    ];
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown subsystem {0:?}")]
pub struct UnknownSubsystem(pub String);

impl TryFrom<u8> for SubsystemId {
    type Error = UnknownSubsystem;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(Self::Generator),
            2 => Ok(Self::GeneratorAddress),
            3 => Ok(Self::GeneratorName),
            4 => Ok(Self::Xfr),
            5 => Ok(Self::Scanner),
            other => Err(UnknownSubsystem(other.to_string())),
        }
    }
}

impl FromStr for SubsystemId {
    type Err = UnknownSubsystem;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(code) = s.parse::<u8>() {
            return Self::try_from(code);
        }
        match s.to_ascii_lowercase().as_str() {
            "generator" => Ok(Self::Generator),
            "generatoraddress" | "generator-address" => Ok(Self::GeneratorAddress),
            "generatorname" | "generator-name" => Ok(Self::GeneratorName),
            "xfr" => Ok(Self::Xfr),
            "scanner" => Ok(Self::Scanner),
            _ => Err(UnknownSubsystem(s.to_owned())),
        }
    }
}

impl fmt::Display for SubsystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Generator => "Generator",
            Self::GeneratorAddress => "GeneratorAddress",
            Self::GeneratorName => "GeneratorName",
            Self::Xfr => "XFR",
            Self::Scanner => "Scanner",
        };
        f.write_str(name)
    }
}

/// Lowercases a DNS name and drops the trailing root dot.
pub fn normalize_name(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Strips the leftmost label of `name`, yielding its parent zone.
///
/// Returns `None` when nothing is left after the first label.
///
/// ```rust
/// # use netforage::model::parent_zone;
/// assert_eq!(parent_zone("www.example.com."), Some("example.com".to_owned()));
/// assert_eq!(parent_zone("www."), None);
/// ```
pub fn parent_zone(name: &str) -> Option<String> {
    let name = normalize_name(name);
    let (_, parent) = name.split_once('.')?;
    if parent.is_empty() {
        None
    } else {
        Some(parent.to_owned())
    }
}

/// A zone without any dot looks like a bare top-level domain.
pub fn is_top_level(zone: &str) -> bool {
    !normalize_name(zone).contains('.')
}
