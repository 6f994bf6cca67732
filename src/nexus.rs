//! The orchestrator owning the three discovery subsystems.
//!
//! [`Nexus`] is what a control surface talks to: it starts and stops the
//! subsystems as a unit, and routes per-subsystem queries and worker scaling
//! by [`SubsystemId`].
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::info;
use thiserror::Error;

use crate::blacklist::BlacklistError;
use crate::config::EngineConfig;
use crate::generator::Generator;
use crate::model::{Host, HostSource, RowId, SubsystemId};
use crate::resolver::Lookup;
use crate::scanner::probe::ProbeError;
use crate::scanner::Scanner;
use crate::sink::HostSink;
use crate::storage::{Storage, StorageError};
use crate::xfr::Xfr;

#[derive(Debug, Error)]
pub enum NexusError {
    #[error("invalid blacklist: {0}")]
    Blacklist(#[from] BlacklistError),
    #[error("cannot set up the prober: {0}")]
    Probe(#[from] ProbeError),
}

/// Point-in-time counts of what storage holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
    pub hosts: i64,
    pub zones: i64,
    pub services: i64,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} hosts, {} zones, {} services",
            self.hosts, self.zones, self.services
        )
    }
}

pub struct Nexus {
    generator: Generator,
    xfr: Xfr,
    scanner: Scanner,
    active: AtomicBool,
    storage: Arc<dyn Storage>,
    sink: HostSink,
}

impl fmt::Debug for Nexus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Nexus")
            .field("active", &self.is_active())
            .field("generator", &self.generator)
            .field("xfr", &self.xfr)
            .field("scanner", &self.scanner)
            .finish_non_exhaustive()
    }
}

impl Nexus {
    pub fn new(
        config: &EngineConfig,
        storage: Arc<dyn Storage>,
        lookup: Arc<dyn Lookup>,
    ) -> Result<Self, NexusError> {
        Ok(Self {
            generator: Generator::new(config, Arc::clone(&storage), Arc::clone(&lookup))?,
            xfr: Xfr::new(config, Arc::clone(&storage), lookup)?,
            scanner: Scanner::new(config, Arc::clone(&storage))?,
            active: AtomicBool::new(false),
            sink: HostSink::new(Arc::clone(&storage), config.retry),
            storage,
        })
    }

    /// Starts Generator, XFR and Scanner, in that order.
    pub fn start(&self) {
        info!("Starting all subsystems");
        self.generator.start();
        self.xfr.start();
        self.scanner.start();
        self.active.store(true, Ordering::SeqCst);
    }

    /// Signals every subsystem to stop. Work in flight is not waited for.
    pub fn stop(&self) {
        info!("Stopping all subsystems");
        self.generator.stop();
        self.xfr.stop();
        self.scanner.stop();
        self.active.store(false, Ordering::SeqCst);
    }

    /// Whether [`Nexus::start`] was called more recently than [`Nexus::stop`].
    ///
    /// A subsystem that shut itself down does not clear this.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn active_flag(&self, id: SubsystemId) -> bool {
        match id {
            SubsystemId::Generator | SubsystemId::GeneratorAddress | SubsystemId::GeneratorName => {
                self.generator.is_active()
            }
            SubsystemId::Xfr => self.xfr.is_active(),
            SubsystemId::Scanner => self.scanner.is_active(),
        }
    }

    pub fn worker_count(&self, id: SubsystemId) -> usize {
        match id {
            SubsystemId::Generator => {
                self.generator.address_workers() + self.generator.name_workers()
            }
            SubsystemId::GeneratorAddress => self.generator.address_workers(),
            SubsystemId::GeneratorName => self.generator.name_workers(),
            SubsystemId::Xfr => self.xfr.worker_count(),
            SubsystemId::Scanner => self.scanner.worker_count(),
        }
    }

    /// Adds a worker to a running subsystem. `Generator` adds one of each kind.
    pub fn start_one(&self, id: SubsystemId) -> bool {
        match id {
            SubsystemId::Generator => {
                let address = self.generator.start_address_worker();
                let name = self.generator.start_name_worker();
                address && name
            }
            SubsystemId::GeneratorAddress => self.generator.start_address_worker(),
            SubsystemId::GeneratorName => self.generator.start_name_worker(),
            SubsystemId::Xfr => self.xfr.start_one(),
            SubsystemId::Scanner => self.scanner.start_one(),
        }
    }

    /// Stops the newest worker of a subsystem. `Generator` stops one of each kind.
    pub fn stop_one(&self, id: SubsystemId) -> bool {
        match id {
            SubsystemId::Generator => {
                let address = self.generator.stop_address_worker();
                let name = self.generator.stop_name_worker();
                address || name
            }
            SubsystemId::GeneratorAddress => self.generator.stop_address_worker(),
            SubsystemId::GeneratorName => self.generator.stop_name_worker(),
            SubsystemId::Xfr => self.xfr.stop_one(),
            SubsystemId::Scanner => self.scanner.stop_one(),
        }
    }

    /// Stores a host named by the operator and registers its zone.
    ///
    /// Returns `None` if the address is already known.
    pub async fn add_host(&self, addr: IpAddr, name: &str) -> Result<Option<RowId>, StorageError> {
        self.sink
            .accept(&Host::new(addr, name, HostSource::UserSupplied))
            .await
    }

    /// Hands `addr` to the Generator's name workers, as if it had been drawn
    /// at random. False if it was seen before, is blacklisted or the
    /// Generator is not running.
    pub async fn submit(&self, addr: IpAddr) -> bool {
        self.generator.submit(addr).await
    }

    pub async fn stats(&self) -> Result<Stats, StorageError> {
        Ok(Stats {
            hosts: self.storage.host_get_count().await?,
            zones: self.storage.zone_get_count().await?,
            services: self.storage.service_get_count().await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BlacklistConfig, WorkerCounts};
    use crate::resolver::LookupError;
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Silent;

    #[async_trait]
    impl Lookup for Silent {
        async fn reverse(&self, _: IpAddr) -> Result<Vec<String>, LookupError> {
            Err(LookupError::NotFound)
        }

        async fn addresses(&self, _: &str) -> Result<Vec<IpAddr>, LookupError> {
            Err(LookupError::NotFound)
        }

        async fn name_servers(&self, _: &str) -> Result<Vec<String>, LookupError> {
            Err(LookupError::NotFound)
        }
    }

    fn nexus() -> (Nexus, Arc<MemoryStorage>) {
        let config = EngineConfig {
            workers: WorkerCounts {
                address: 1,
                name: 2,
                xfr: 1,
                scan: 3,
            },
            active_timeout: Duration::from_millis(20),
            blacklist: BlacklistConfig::empty(),
            spool_dir: std::env::temp_dir().join("netforage-nexus-test"),
            ..EngineConfig::default()
        };
        let storage = Arc::new(MemoryStorage::new());
        let nexus = Nexus::new(&config, storage.clone(), Arc::new(Silent)).unwrap();
        (nexus, storage)
    }

    #[tokio::test]
    async fn routes_by_subsystem() {
        let (nexus, _) = nexus();
        assert!(!nexus.is_active());
        for id in SubsystemId::ALL {
            assert!(!nexus.active_flag(id));
            assert!(!nexus.start_one(id));
        }

        nexus.start();
        assert!(nexus.is_active());
        assert!(SubsystemId::ALL.iter().all(|&id| nexus.active_flag(id)));
        assert_eq!(nexus.worker_count(SubsystemId::GeneratorAddress), 1);
        assert_eq!(nexus.worker_count(SubsystemId::GeneratorName), 2);
        assert_eq!(nexus.worker_count(SubsystemId::Generator), 3);
        assert_eq!(nexus.worker_count(SubsystemId::Xfr), 1);
        assert_eq!(nexus.worker_count(SubsystemId::Scanner), 3);

        assert!(nexus.start_one(SubsystemId::Generator));
        assert_eq!(nexus.worker_count(SubsystemId::Generator), 5);
        assert!(nexus.stop_one(SubsystemId::Scanner));
        assert_eq!(nexus.worker_count(SubsystemId::Scanner), 2);
        assert!(nexus.stop_one(SubsystemId::Xfr));
        assert!(!nexus.stop_one(SubsystemId::Xfr));

        nexus.stop();
        assert!(!nexus.is_active());
        assert!(SubsystemId::ALL.iter().all(|&id| !nexus.active_flag(id)));
    }

    #[tokio::test]
    async fn user_hosts_register_their_zone() {
        let (nexus, storage) = nexus();
        let addr: IpAddr = "198.51.100.80".parse().unwrap();

        assert!(nexus.add_host(addr, "intranet.corp.example.org").await.unwrap().is_some());
        assert_eq!(nexus.add_host(addr, "again.example.org").await.unwrap(), None);

        let zone = storage.zone_get_by_name("corp.example.org").await.unwrap().unwrap();
        assert!(!zone.is_finished());
        assert_eq!(
            nexus.stats().await.unwrap(),
            Stats {
                hosts: 1,
                zones: 1,
                services: 0
            }
        );
    }
}
