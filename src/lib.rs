//! This crate exposes the internals of netforage, an autonomous Internet
//! host discovery engine.
//!
//! Three subsystems feed each other through storage:
//!
//! 1. The [`Generator`](crate::generator::Generator) reverse resolves random
//!    IPv4 addresses and stores every host that has a name.
//! 2. The [`Xfr`](crate::xfr::Xfr) harvester attempts a zone transfer of the
//!    parent zone of every stored host, storing the hosts the transfer
//!    reveals, which in turn register their own zones.
//! 3. The [`Scanner`](crate::scanner::Scanner) samples stored hosts and
//!    probes one port at a time, recording banners, server headers and
//!    version strings.
//!
//! [`Nexus`](crate::nexus::Nexus) owns all three and is what a control
//! surface drives.
//!
//! ## Basic Usage Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use netforage::config::EngineConfig;
//! use netforage::nexus::Nexus;
//! use netforage::resolver::DnsLookup;
//! use netforage::storage::MemoryStorage;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let storage = Arc::new(MemoryStorage::new());
//!     let lookup = Arc::new(DnsLookup::from_option(&None).await);
//!     let nexus = Nexus::new(&EngineConfig::default(), storage, lookup)?;
//!
//!     // Hosts can be handed in by hand; their zone is queued for transfer.
//!     nexus.add_host("192.0.2.10".parse()?, "www.example.org").await?;
//!
//!     let stats = nexus.stats().await?;
//!     assert_eq!((stats.hosts, stats.zones), (1, 1));
//!     Ok(())
//! }
//! ```
#![allow(clippy::needless_doctest_main)]

pub mod blacklist;

pub mod config;

pub mod generator;

pub mod input;

pub mod model;

pub mod nexus;

pub mod queue;

pub mod resolver;

pub mod scanner;

pub mod sink;

pub mod storage;

pub mod worker;

pub mod xfr;
