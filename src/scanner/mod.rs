//! Probing the hosts in storage for the services they run.
//!
//! A feeder samples hosts from storage and proposes them to the scan
//! workers together with the ports already probed on each. A worker picks
//! one new port, probes it and hands the outcome to the collector, which
//! persists successful probes. Ports that failed are remembered in memory
//! so the next round moves on to another one.
pub mod ports;
pub mod probe;
pub mod snmp;
pub mod telnet;

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, error, info, trace, warn};
use tokio_util::sync::CancellationToken;

use crate::config::{EngineConfig, RetryPolicy};
use crate::model::{Host, RowId, Service};
use crate::queue::{heartbeat, Queue};
use crate::storage::{retry, Storage, StorageError};
use crate::worker::{Lifecycle, WorkerPool};

use ports::{pick_port, PortPlan};
use probe::{ProbeError, Prober};

/// Consecutive storage failures the feeder rides out before it stops the
/// Scanner.
const MAX_FEED_ERRORS: u32 = 5;

/// A host to scan, with the ports already probed on it.
#[derive(Debug, Clone)]
struct Proposal {
    host: Host,
    known: HashSet<u16>,
}

/// The outcome of one probe, on its way to storage.
#[derive(Debug, Clone)]
pub struct ScanResult {
    pub host: Host,
    pub service: Service,
}

struct Shared {
    storage: Arc<dyn Storage>,
    prober: Prober,
    plan: PortPlan,
    proposals: Queue<Proposal>,
    results: Queue<ScanResult>,
    workers: WorkerPool,
    /// Ports whose last probe failed, per host. Failures are never stored.
    failed: DashMap<IpAddr, HashSet<u16>>,
    retry: RetryPolicy,
    period: Duration,
}

impl Shared {
    async fn idle(&self, token: &CancellationToken) -> bool {
        tokio::select! {
            () = token.cancelled() => false,
            () = tokio::time::sleep(self.period) => true,
        }
    }

    async fn proposals(&self, n: usize) -> Result<Vec<Proposal>, StorageError> {
        let hosts = retry(self.retry, "HostGetRandom", || self.storage.host_get_random(n)).await?;

        let mut proposals = Vec::with_capacity(hosts.len());
        for host in hosts {
            let services = retry(self.retry, "ServiceGetByHost", || {
                self.storage.service_get_by_host(&host)
            })
            .await?;
            proposals.push(Proposal {
                known: services.into_keys().collect(),
                host,
            });
        }
        Ok(proposals)
    }

    async fn feed(&self, root: &CancellationToken, token: &CancellationToken) {
        debug!("Scan feeder starting up...");
        let mut failures = 0;

        while !token.is_cancelled() {
            let batch = self.workers.len().max(1);
            let proposals = match self.proposals(batch).await {
                Ok(proposals) => {
                    failures = 0;
                    proposals
                }
                Err(e) if e.is_retryable() && failures + 1 < MAX_FEED_ERRORS => {
                    failures += 1;
                    warn!("Failed to sample {batch} hosts ({failures}/{MAX_FEED_ERRORS}): {e}");
                    if !self.idle(token).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    error!("Failed to sample {batch} hosts, stopping Scanner: {e}");
                    root.cancel();
                    return;
                }
            };

            if proposals.is_empty() {
                trace!("No hosts to scan yet");
                if !self.idle(token).await {
                    break;
                }
                continue;
            }

            for proposal in proposals {
                if !self.proposals.send(proposal, token).await {
                    break;
                }
            }
        }

        debug!("Scan feeder quitting...");
    }

    /// Probes one new port of the proposed host, skipping the ports that
    /// failed before.
    ///
    /// Once every port has been tried, the failed ones are forgotten and come
    /// up again in later rounds.
    async fn scan(&self, proposal: Proposal, token: &CancellationToken) {
        let Proposal { host, mut known } = proposal;
        let addr = host.addr();
        if let Some(failed) = self.failed.get(&addr) {
            known.extend(failed.iter().copied());
        }
        let port = {
            let mut rng = rand::rng();
            pick_port(&host, &known, &self.plan, &mut rng)
        };
        let Some(port) = port else {
            if self.failed.remove(&addr).is_some() {
                trace!("Every port of {addr} has been tried, failed ones are due again");
            } else {
                trace!("Every port of {addr} has been probed");
            }
            return;
        };

        let kind = self.plan.probe_for(port);
        let res = tokio::select! {
            biased;
            () = token.cancelled() => return,
            res = self.prober.probe(kind, SocketAddr::new(addr, port)) => res,
        };
        let service = match res {
            Ok(response) => {
                debug!("{addr}:{port} answered {response:?}");
                Service::success(&host, port, response)
            }
            Err(e) => {
                trace!("{addr}:{port} failed: {e}");
                self.failed.entry(addr).or_default().insert(port);
                Service::failure(&host, port, e.to_string())
            }
        };

        self.results.send(ScanResult { host, service }, token).await;
    }

    async fn work(&self, id: usize, token: &CancellationToken) {
        debug!("Scan worker #{id:02} starting up...");
        let mut wake = heartbeat(self.period);

        loop {
            tokio::select! {
                biased;
                () = token.cancelled() => break,
                proposal = self.proposals.recv() => {
                    let Some(proposal) = proposal else { break };
                    self.scan(proposal, token).await;
                }
                _ = wake.tick() => trace!("Scan worker #{id:02} idle"),
            }
        }

        debug!("Scan worker #{id:02} quitting...");
    }

    async fn collect(&self, result: &ScanResult) -> Result<Option<RowId>, StorageError> {
        let ScanResult { host, service } = result;
        if !service.success {
            trace!(
                "Dropping failed probe of {}:{}: {}",
                host.addr(),
                service.port,
                service.response
            );
            return Ok(None);
        }

        match retry(self.retry, "ServiceAdd", || self.storage.service_add(host, service)).await {
            Ok(id) => {
                info!(
                    "{} ({}) port {}: {}",
                    host.name(),
                    host.addr(),
                    service.port,
                    service.response
                );
                Ok(Some(id))
            }
            Err(
                e @ (StorageError::Invalid(_)
                | StorageError::Missing { .. }
                | StorageError::Duplicate { .. }),
            ) => {
                warn!("Cannot record port {} of {}: {e}", service.port, host.addr());
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn drain_results(&self, token: &CancellationToken) -> Result<(), StorageError> {
        debug!("Scan collector starting up...");
        let mut wake = heartbeat(self.period);

        loop {
            tokio::select! {
                biased;
                () = token.cancelled() => break,
                result = self.results.recv() => {
                    let Some(result) = result else { break };
                    self.collect(&result).await?;
                }
                _ = wake.tick() => trace!("Scan collector idle"),
            }
        }

        debug!("Scan collector quitting...");
        Ok(())
    }
}

/// Probes the ports of known hosts.
pub struct Scanner {
    shared: Arc<Shared>,
    worker_count: usize,
    lifecycle: Lifecycle,
    feeder: WorkerPool,
    collector: WorkerPool,
}

impl std::fmt::Debug for Scanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner")
            .field("active", &self.is_active())
            .field("workers", &self.worker_count())
            .finish_non_exhaustive()
    }
}

impl Scanner {
    pub fn new(config: &EngineConfig, storage: Arc<dyn Storage>) -> Result<Self, ProbeError> {
        let shared = Shared {
            storage,
            prober: Prober::new(config.probe_timeout)?,
            plan: config.ports.clone(),
            proposals: Queue::new(config.workers.scan.max(1)),
            results: Queue::new(config.queue_depth),
            workers: WorkerPool::new("Scan"),
            failed: DashMap::new(),
            retry: config.retry,
            period: config.active_timeout,
        };

        Ok(Self {
            shared: Arc::new(shared),
            worker_count: config.workers.scan,
            lifecycle: Lifecycle::default(),
            feeder: WorkerPool::new("Scan feeder"),
            collector: WorkerPool::new("Scan collector"),
        })
    }

    pub fn start(&self) {
        let Some(root) = self.lifecycle.begin() else {
            warn!("Scanner is already running");
            return;
        };
        info!("Starting Scanner with {} workers", self.worker_count);

        for _ in 0..self.worker_count {
            self.spawn_worker(&root);
        }

        let shared = Arc::clone(&self.shared);
        let subsystem = root.clone();
        self.feeder.spawn(&root, move |_, token| async move {
            shared.feed(&subsystem, &token).await;
        });

        let shared = Arc::clone(&self.shared);
        let subsystem = root.clone();
        self.collector.spawn(&root, move |_, token| async move {
            if let Err(e) = shared.drain_results(&token).await {
                error!("Scan collector failed, stopping Scanner: {e}");
                subsystem.cancel();
            }
        });
    }

    pub fn stop(&self) {
        if self.lifecycle.end() {
            info!("Stopping Scanner");
        }
        self.shared.workers.stop_all();
        self.feeder.stop_all();
        self.collector.stop_all();
    }

    pub fn is_active(&self) -> bool {
        self.lifecycle.is_active()
    }

    pub fn worker_count(&self) -> usize {
        self.shared.workers.len()
    }

    pub fn start_one(&self) -> bool {
        let Some(root) = self.lifecycle.current() else {
            return false;
        };
        self.spawn_worker(&root);
        true
    }

    pub fn stop_one(&self) -> bool {
        self.shared.workers.stop_one()
    }

    /// Records `result` the way the collector does: successes are stored,
    /// failures dropped. Returns the new service id, if one was stored.
    pub async fn collect(&self, result: &ScanResult) -> Result<Option<RowId>, StorageError> {
        self.shared.collect(result).await
    }

    fn spawn_worker(&self, root: &CancellationToken) {
        let shared = Arc::clone(&self.shared);
        self.shared.workers.spawn(root, move |id, token| async move {
            shared.work(id, &token).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerCounts;
    use crate::model::HostSource;
    use crate::storage::MemoryStorage;
    use crate::scanner::probe::Probe;
    use std::collections::HashMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn config(scan: usize) -> EngineConfig {
        EngineConfig {
            workers: WorkerCounts {
                scan,
                ..WorkerCounts::default()
            },
            active_timeout: Duration::from_millis(20),
            probe_timeout: Duration::from_millis(500),
            ..EngineConfig::default()
        }
    }

    async fn stored_host(storage: &MemoryStorage, addr: &str, name: &str) -> Host {
        let host = Host::new(addr.parse().unwrap(), name, HostSource::MailExchanger);
        let id = storage.host_add(&host).await.unwrap();
        storage.host_get_by_id(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn collector_keeps_successes_only() {
        let storage = Arc::new(MemoryStorage::new());
        let scanner = Scanner::new(&config(1), storage.clone()).unwrap();
        let host = stored_host(&storage, "192.0.2.25", "mx.example.com").await;

        let ok = ScanResult {
            service: Service::success(&host, 25, "220 mx.example.com ESMTP".to_owned()),
            host: host.clone(),
        };
        let failed = ScanResult {
            service: Service::failure(&host, 110, "timed out".to_owned()),
            host: host.clone(),
        };

        assert!(scanner.collect(&ok).await.unwrap().is_some());
        assert_eq!(scanner.collect(&failed).await.unwrap(), None);

        let services = storage.service_get_by_host(&host).await.unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[&25].response, "220 mx.example.com ESMTP");
        assert!(services[&25].success);
    }

    #[tokio::test]
    async fn collector_skips_unknown_hosts() {
        let storage = Arc::new(MemoryStorage::new());
        let scanner = Scanner::new(&config(1), storage.clone()).unwrap();
        let host = Host::new("192.0.2.1".parse().unwrap(), "ghost.example.com", HostSource::UserSupplied);

        let result = ScanResult {
            service: Service::success(&host, 80, "nginx".to_owned()),
            host,
        };
        assert_eq!(scanner.collect(&result).await.unwrap(), None);
        assert_eq!(storage.service_get_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn proposals_carry_known_ports() {
        let storage = Arc::new(MemoryStorage::new());
        let scanner = Scanner::new(&config(1), storage.clone()).unwrap();
        let host = stored_host(&storage, "192.0.2.25", "mx.example.com").await;
        storage
            .service_add(&host, &Service::success(&host, 25, "220".to_owned()))
            .await
            .unwrap();

        let proposals = scanner.shared.proposals(4).await.unwrap();
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].known, HashSet::from([25]));
    }

    /// Mail ports only, with `banner` read as a plaintext greeting.
    fn mail_plan(mail: Vec<u16>, banner: u16) -> PortPlan {
        PortPlan {
            mail,
            name_server: Vec::new(),
            ftp: Vec::new(),
            web: Vec::new(),
            fallback: Vec::new(),
            probes: HashMap::from([(banner, Probe::Banner)]),
        }
    }

    /// Greets every client with an SMTP banner, returning the port.
    async fn smtp_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (mut sock, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    sock.write_all(b"220 mx.example.com ESMTP\r\n").await.unwrap();
                    let mut rest = Vec::new();
                    let _ = sock.read_to_end(&mut rest).await;
                });
            }
        });
        port
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn failed_port_is_skipped_next_round() {
        let closed = closed_port().await;
        let open = smtp_server().await;
        let storage = Arc::new(MemoryStorage::new());
        let mut config = config(1);
        config.ports = mail_plan(vec![closed, open], open);
        let scanner = Scanner::new(&config, storage.clone()).unwrap();
        let host = stored_host(&storage, "127.0.0.1", "mx.example.com").await;
        let shared = &scanner.shared;
        let token = CancellationToken::new();

        let mut results = Vec::new();
        for _ in 0..2 {
            let known = storage.service_get_by_host(&host).await.unwrap();
            let proposal = Proposal {
                host: host.clone(),
                known: known.into_keys().collect(),
            };
            shared.scan(proposal, &token).await;
            let result = shared.results.recv().await.unwrap();
            shared.collect(&result).await.unwrap();
            results.push(result);
        }

        assert_eq!(results[0].service.port, closed);
        assert!(!results[0].service.success);
        assert_eq!(results[1].service.port, open);
        assert!(results[1].service.success);

        let services = storage.service_get_by_host(&host).await.unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[&open].response, "220 mx.example.com ESMTP");

        // Nothing left to try: the failed port is forgotten for later rounds.
        let proposal = Proposal {
            host: host.clone(),
            known: services.into_keys().collect(),
        };
        shared.scan(proposal, &token).await;
        assert!(shared.failed.is_empty());
    }

    #[tokio::test]
    async fn running_scanner_records_mail_banner() {
        let port = smtp_server().await;
        let storage = Arc::new(MemoryStorage::new());
        let mut config = config(1);
        config.ports = mail_plan(vec![port], port);
        let scanner = Scanner::new(&config, storage.clone()).unwrap();
        let host = stored_host(&storage, "127.0.0.1", "relay.example.com").await;

        scanner.start();
        let mut services = HashMap::new();
        for _ in 0..200 {
            services = storage.service_get_by_host(&host).await.unwrap();
            if !services.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        scanner.stop();

        let smtp = &services[&port];
        assert!(smtp.success);
        assert_eq!(smtp.response, "220 mx.example.com ESMTP");
    }

    #[tokio::test]
    async fn runs_and_scales_workers() {
        let storage = Arc::new(MemoryStorage::new());
        let scanner = Scanner::new(&config(2), storage).unwrap();
        assert!(!scanner.start_one());

        scanner.start();
        assert!(scanner.is_active());
        assert_eq!(scanner.worker_count(), 2);

        assert!(scanner.start_one());
        assert_eq!(scanner.worker_count(), 3);
        assert!(scanner.stop_one());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(scanner.worker_count(), 2);

        scanner.stop();
        assert!(!scanner.is_active());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(scanner.worker_count(), 0);
    }
}
