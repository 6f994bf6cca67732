//! Discovery of hosts by reverse resolving random IPv4 addresses.
//!
//! Address workers draw random addresses, name workers look their PTR
//! records up, and a single host worker persists whatever survives both
//! blacklists, registering the parent zone of each new host for the zone
//! transfer subsystem.
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use log::{debug, error, info, trace, warn};
use rand::rngs::OsRng;
use rand::TryRngCore;
use tokio_util::sync::CancellationToken;

use crate::blacklist::{BlacklistError, Blacklists};
use crate::config::{EngineConfig, RetryPolicy};
use crate::model::{Host, HostSource};
use crate::queue::{heartbeat, Queue};
use crate::resolver::{reverse_with_retry, Lookup, LookupError};
use crate::sink::{drain_hosts, HostSink};
use crate::storage::Storage;
use crate::worker::{Lifecycle, WorkerPool};

/// Consecutive failures to read the system random source an address worker
/// tolerates before it quits.
const MAX_RNG_FAILURES: u32 = 5;

/// Addresses remembered as seen before the set is cleared. Random draws
/// from the whole IPv4 space rarely repeat, so forgetting costs little.
const SEEN_CAPACITY: usize = 1 << 20;

/// State every Generator worker shares.
struct Shared {
    lookup: Arc<dyn Lookup>,
    blacklists: Blacklists,
    sink: HostSink,
    /// Addresses admitted since the set was last cleared, so none is looked
    /// up twice in a row.
    seen: DashSet<IpAddr>,
    seen_capacity: usize,
    addresses: Queue<IpAddr>,
    hosts: Queue<Host>,
    retry: RetryPolicy,
    period: Duration,
}

impl Shared {
    /// Atomically records `addr` as seen, then checks the address blacklist.
    fn admit(&self, addr: IpAddr) -> bool {
        if self.seen.len() >= self.seen_capacity {
            debug!("Forgetting {} addresses seen so far", self.seen.len());
            self.seen.clear();
        }
        if !self.seen.insert(addr) {
            trace!("{addr} has been seen before");
            return false;
        }
        if self.blacklists.addresses.matches(&addr) {
            trace!("{addr} is blacklisted");
            return false;
        }
        true
    }

    /// Reverse resolves `addr` and queues the resulting host, if any.
    async fn resolve(&self, addr: IpAddr, token: &CancellationToken) {
        let names = match reverse_with_retry(self.lookup.as_ref(), addr, self.retry).await {
            Ok(names) => names,
            Err(LookupError::Transient(e)) => {
                warn!("Giving up on reverse lookup of {addr}: {e}");
                return;
            }
            Err(e) => {
                debug!("Reverse lookup of {addr} failed: {e}");
                return;
            }
        };

        let Some(name) = names.iter().find(|n| !n.trim_end_matches('.').is_empty()) else {
            return;
        };
        let host = Host::new(addr, name, HostSource::RandomGeneration);
        if self.blacklists.names.matches(host.name()) {
            trace!("{} ({addr}) is blacklisted", host.name());
            return;
        }

        trace!("{addr} resolves to {}", host.name());
        self.hosts.send(host, token).await;
    }
}

async fn address_worker(id: usize, token: CancellationToken, shared: Arc<Shared>) {
    debug!("Address worker #{id:02} starting up...");
    let mut failures = 0;

    while !token.is_cancelled() {
        let mut octets = [0u8; 4];
        if let Err(e) = OsRng.try_fill_bytes(&mut octets) {
            failures += 1;
            error!("Address worker #{id:02} cannot read random bytes ({failures}/{MAX_RNG_FAILURES}): {e}");
            if failures >= MAX_RNG_FAILURES {
                error!("Address worker #{id:02} gives up");
                return;
            }
            continue;
        }
        failures = 0;

        let addr = IpAddr::V4(Ipv4Addr::from(octets));
        if !shared.admit(addr) {
            tokio::task::yield_now().await;
            continue;
        }
        if !shared.addresses.send(addr, &token).await {
            break;
        }
    }

    debug!("Address worker #{id:02} quitting...");
}

async fn name_worker(id: usize, token: CancellationToken, shared: Arc<Shared>) {
    debug!("Name worker #{id:02} starting up...");
    let mut wake = heartbeat(shared.period);

    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            addr = shared.addresses.recv() => {
                let Some(addr) = addr else { break };
                shared.resolve(addr, &token).await;
            }
            _ = wake.tick() => trace!("Name worker #{id:02} idle"),
        }
    }

    debug!("Name worker #{id:02} quitting...");
}

/// Finds hosts by reverse resolving random addresses.
pub struct Generator {
    shared: Arc<Shared>,
    address_count: usize,
    name_count: usize,
    lifecycle: Lifecycle,
    address_pool: WorkerPool,
    name_pool: WorkerPool,
    host_pool: WorkerPool,
}

impl std::fmt::Debug for Generator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generator")
            .field("active", &self.is_active())
            .field("address_workers", &self.address_pool.len())
            .field("name_workers", &self.name_pool.len())
            .finish_non_exhaustive()
    }
}

impl Generator {
    pub fn new(
        config: &EngineConfig,
        storage: Arc<dyn Storage>,
        lookup: Arc<dyn Lookup>,
    ) -> Result<Self, BlacklistError> {
        let shared = Shared {
            lookup,
            blacklists: Blacklists::from_config(&config.blacklist)?,
            sink: HostSink::new(storage, config.retry),
            seen: DashSet::new(),
            seen_capacity: SEEN_CAPACITY,
            addresses: Queue::new(config.queue_depth),
            hosts: Queue::new(config.queue_depth),
            retry: config.retry,
            period: config.active_timeout,
        };

        Ok(Self {
            shared: Arc::new(shared),
            address_count: config.workers.address,
            name_count: config.workers.name,
            lifecycle: Lifecycle::default(),
            address_pool: WorkerPool::new("Address"),
            name_pool: WorkerPool::new("Name"),
            host_pool: WorkerPool::new("Generator host"),
        })
    }

    /// Spawns the configured number of address and name workers plus the
    /// host worker. Does nothing if already running.
    pub fn start(&self) {
        let Some(root) = self.lifecycle.begin() else {
            warn!("Generator is already running");
            return;
        };
        info!(
            "Starting Generator with {} address and {} name workers",
            self.address_count, self.name_count
        );

        for _ in 0..self.address_count {
            self.spawn_address_worker(&root);
        }
        for _ in 0..self.name_count {
            self.spawn_name_worker(&root);
        }

        let shared = Arc::clone(&self.shared);
        let subsystem = root.clone();
        self.host_pool.spawn(&root, move |_, token| async move {
            if let Err(e) = drain_hosts(
                "Generator",
                &shared.hosts,
                &shared.sink,
                &token,
                shared.period,
            )
            .await
            {
                error!("Generator host worker failed, stopping Generator: {e}");
                subsystem.cancel();
            }
        });
    }

    /// Signals every worker to quit. Items in flight are not waited for.
    pub fn stop(&self) {
        if self.lifecycle.end() {
            info!("Stopping Generator");
        }
        self.address_pool.stop_all();
        self.name_pool.stop_all();
        self.host_pool.stop_all();
    }

    pub fn is_active(&self) -> bool {
        self.lifecycle.is_active()
    }

    pub fn address_workers(&self) -> usize {
        self.address_pool.len()
    }

    pub fn name_workers(&self) -> usize {
        self.name_pool.len()
    }

    /// Adds one address worker to the running Generator.
    pub fn start_address_worker(&self) -> bool {
        let Some(root) = self.lifecycle.current() else {
            return false;
        };
        self.spawn_address_worker(&root);
        true
    }

    /// Adds one name worker to the running Generator.
    pub fn start_name_worker(&self) -> bool {
        let Some(root) = self.lifecycle.current() else {
            return false;
        };
        self.spawn_name_worker(&root);
        true
    }

    pub fn stop_address_worker(&self) -> bool {
        self.address_pool.stop_one()
    }

    pub fn stop_name_worker(&self) -> bool {
        self.name_pool.stop_one()
    }

    /// Feeds a user supplied address through the same dedup, blacklist and
    /// reverse lookup path as generated ones.
    ///
    /// Returns false if the Generator is not running or the address was
    /// rejected.
    pub async fn submit(&self, addr: IpAddr) -> bool {
        let Some(root) = self.lifecycle.current() else {
            return false;
        };
        self.shared.admit(addr) && self.shared.addresses.send(addr, &root).await
    }

    fn spawn_address_worker(&self, root: &CancellationToken) {
        let shared = Arc::clone(&self.shared);
        self.address_pool
            .spawn(root, move |id, token| address_worker(id, token, shared));
    }

    fn spawn_name_worker(&self, root: &CancellationToken) {
        let shared = Arc::clone(&self.shared);
        self.name_pool
            .spawn(root, move |id, token| name_worker(id, token, shared));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BlacklistConfig, WorkerCounts};
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;

    struct NoNames;

    #[async_trait]
    impl Lookup for NoNames {
        async fn reverse(&self, _addr: IpAddr) -> Result<Vec<String>, LookupError> {
            Err(LookupError::NotFound)
        }

        async fn addresses(&self, _name: &str) -> Result<Vec<IpAddr>, LookupError> {
            Err(LookupError::NotFound)
        }

        async fn name_servers(&self, _zone: &str) -> Result<Vec<String>, LookupError> {
            Err(LookupError::NotFound)
        }
    }

    fn generator(address: usize, name: usize) -> Generator {
        let config = EngineConfig {
            workers: WorkerCounts {
                address,
                name,
                ..WorkerCounts::default()
            },
            blacklist: BlacklistConfig {
                name_patterns: Vec::new(),
                address_ranges: vec!["10.0.0.0/8".to_owned()],
            },
            ..EngineConfig::default()
        };
        Generator::new(&config, Arc::new(MemoryStorage::new()), Arc::new(NoNames)).unwrap()
    }

    #[tokio::test]
    async fn admission_deduplicates_and_filters() {
        let generator = generator(0, 0);
        let shared = &generator.shared;

        assert!(shared.admit("198.51.100.1".parse().unwrap()));
        assert!(!shared.admit("198.51.100.1".parse().unwrap()));
        assert!(!shared.admit("10.1.2.3".parse().unwrap()));
        // Blacklisted addresses are remembered too.
        assert!(!shared.admit("10.1.2.3".parse().unwrap()));
    }

    #[test]
    fn seen_addresses_are_forgotten_at_capacity() {
        let mut generator = generator(0, 0);
        Arc::get_mut(&mut generator.shared).unwrap().seen_capacity = 2;
        let shared = &generator.shared;

        assert!(shared.admit("198.51.100.1".parse().unwrap()));
        assert!(shared.admit("198.51.100.2".parse().unwrap()));
        assert!(shared.admit("198.51.100.3".parse().unwrap()));
        assert_eq!(shared.seen.len(), 1);
        assert!(!shared.admit("198.51.100.3".parse().unwrap()));
        assert!(shared.admit("198.51.100.1".parse().unwrap()));
    }

    #[tokio::test]
    async fn pools_scale_one_worker_at_a_time() {
        let generator = generator(1, 2);
        assert!(!generator.start_name_worker());

        generator.start();
        assert!(generator.is_active());
        assert_eq!((generator.address_workers(), generator.name_workers()), (1, 2));

        assert!(generator.start_name_worker());
        assert!(generator.stop_address_worker());
        assert_eq!((generator.address_workers(), generator.name_workers()), (0, 3));

        generator.stop();
        assert!(!generator.is_active());
        assert_eq!((generator.address_workers(), generator.name_workers()), (0, 0));
    }

    #[tokio::test]
    async fn submit_needs_a_running_generator() {
        let generator = generator(0, 0);
        let addr: IpAddr = "192.0.2.44".parse().unwrap();
        assert!(!generator.submit(addr).await);

        generator.start();
        assert!(generator.submit(addr).await);
        assert!(!generator.submit(addr).await);
        generator.stop();
    }
}
