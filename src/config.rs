//! Plain configuration values handed to the subsystem constructors.
//!
//! Everything the engine needs to know is passed in here, so tests can build
//! a pipeline with their own blacklists, port lists and timings.
use std::path::PathBuf;
use std::time::Duration;

use crate::blacklist::{DEFAULT_ADDRESS_RANGES, DEFAULT_NAME_PATTERNS};
use crate::scanner::ports::PortPlan;

/// Fixed-delay, bounded retry of transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_millis(250),
        }
    }
}

/// Seed lists for the two blacklist matchers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlacklistConfig {
    pub name_patterns: Vec<String>,
    pub address_ranges: Vec<String>,
}

impl BlacklistConfig {
    /// Blacklists that never match, for tests that need every candidate through.
    pub const fn empty() -> Self {
        Self {
            name_patterns: Vec::new(),
            address_ranges: Vec::new(),
        }
    }
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            name_patterns: DEFAULT_NAME_PATTERNS.iter().map(|&p| p.to_owned()).collect(),
            address_ranges: DEFAULT_ADDRESS_RANGES
                .iter()
                .map(|&r| r.to_owned())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCounts {
    pub address: usize,
    pub name: usize,
    pub xfr: usize,
    pub scan: usize,
}

impl Default for WorkerCounts {
    fn default() -> Self {
        Self {
            address: 2,
            name: 16,
            xfr: 4,
            scan: 8,
        }
    }
}

/// Everything the engine needs, resolved from the command line and config file.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub workers: WorkerCounts,
    /// Capacity of every bounded queue.
    pub queue_depth: usize,
    /// Heartbeat period of idle workers and back-off of feeders with nothing to do.
    pub active_timeout: Duration,
    /// Connect/read deadline of a single probe or transfer read.
    pub probe_timeout: Duration,
    pub retry: RetryPolicy,
    /// Directory receiving one spool file per attempted zone transfer.
    pub spool_dir: PathBuf,
    /// Port AXFR requests go to on every name server.
    pub xfr_port: u16,
    pub blacklist: BlacklistConfig,
    pub ports: PortPlan,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: WorkerCounts::default(),
            queue_depth: 64,
            active_timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            spool_dir: std::env::temp_dir().join("netforage-xfr"),
            xfr_port: 53,
            blacklist: BlacklistConfig::default(),
            ports: PortPlan::default(),
        }
    }
}
