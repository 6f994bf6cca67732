//! Harvesting hosts from DNS zone transfers.
//!
//! A feeder pulls unfinished zones from storage, workers try an AXFR against
//! each of the zone's name servers and turn the transferred address, NS and
//! MX records into hosts. Every transferred record also lands in a spool
//! file per zone.
mod transfer;

pub use transfer::{axfr_query, AxfrStream, XfrError};

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use futures::stream::{self, StreamExt};
use hickory_resolver::proto::rr::{RData, Record};
use itertools::Itertools;
use log::{debug, error, info, trace, warn};
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;

use crate::blacklist::{BlacklistError, Blacklists};
use crate::config::{EngineConfig, RetryPolicy};
use crate::model::{is_top_level, Host, HostSource, Zone};
use crate::queue::{heartbeat, Queue};
use crate::resolver::{with_retry, Lookup, LookupError};
use crate::sink::{drain_hosts, HostSink};
use crate::storage::{retry, Storage, StorageError};
use crate::worker::{Lifecycle, WorkerPool};

/// How many NS/MX targets are resolved at once.
const RESOLVE_CONCURRENCY: usize = 8;

/// Turns a batch of transferred records into hosts.
///
/// A/AAAA records become [`HostSource::ZoneTransfer`] hosts. NS and MX
/// targets are resolved and every address becomes a host of the matching
/// source, temporary resolver failures being retried under `policy`.
/// Record owners are checked against the name blacklist, every address
/// against the address blacklist. Other record types are ignored.
pub async fn hosts_from_records(
    records: &[Record],
    blacklists: &Blacklists,
    lookup: &dyn Lookup,
    policy: RetryPolicy,
) -> Vec<Host> {
    let mut hosts = Vec::new();
    let mut targets = Vec::new();

    for record in records {
        let owner = record.name().to_utf8();
        let candidate = match record.data() {
            Some(RData::A(a)) => Ok(IpAddr::V4(a.0)),
            Some(RData::AAAA(aaaa)) => Ok(IpAddr::V6(aaaa.0)),
            Some(RData::NS(ns)) => Err((ns.0.to_utf8(), HostSource::NameServer)),
            Some(RData::MX(mx)) => Err((mx.exchange().to_utf8(), HostSource::MailExchanger)),
            _ => continue,
        };
        if owner.starts_with("*.") || blacklists.names.matches(owner.trim_end_matches('.')) {
            trace!("Skipping record of {owner}");
            continue;
        }

        match candidate {
            Ok(addr) => {
                if !blacklists.addresses.matches(&addr) {
                    hosts.push(Host::new(addr, &owner, HostSource::ZoneTransfer));
                }
            }
            Err(target) => targets.push(target),
        }
    }

    let resolved: Vec<Vec<Host>> = stream::iter(targets.into_iter().unique())
        .map(|(name, source)| async move {
            match with_retry(policy, "Address lookup", || lookup.addresses(&name)).await {
                Ok(addrs) => addrs
                    .into_iter()
                    .filter(|addr| !blacklists.addresses.matches(addr))
                    .map(|addr| Host::new(addr, &name, source))
                    .collect::<Vec<_>>(),
                Err(LookupError::NotFound) => Vec::new(),
                Err(e) => {
                    debug!("Cannot resolve {source} target {name}: {e}");
                    Vec::new()
                }
            }
        })
        .buffer_unordered(RESOLVE_CONCURRENCY)
        .collect()
        .await;

    hosts.extend(resolved.into_iter().flatten());
    hosts
}

/// The debug copy of one zone's transferred records.
struct Spool {
    path: PathBuf,
    out: Option<BufWriter<File>>,
    records: usize,
}

impl Spool {
    async fn create(dir: &Path, zone: &str) -> Self {
        let path = dir.join(zone.replace(['/', '\\'], "_"));
        let out = match File::create(&path).await {
            Ok(file) => Some(BufWriter::new(file)),
            Err(e) => {
                warn!("Cannot create spool file {}: {e}", path.display());
                None
            }
        };
        Self {
            path,
            out,
            records: 0,
        }
    }

    async fn append(&mut self, records: &[Record]) {
        self.records += records.len();
        let Some(out) = self.out.as_mut() else { return };
        let text: String = records.iter().map(|r| format!("{r}\n")).collect();
        if let Err(e) = out.write_all(text.as_bytes()).await {
            warn!("Cannot write spool file {}: {e}", self.path.display());
            self.out = None;
        }
    }

    /// Flushes the file, or deletes it if nothing was transferred.
    async fn finish(mut self) {
        if let Some(out) = self.out.as_mut() {
            if let Err(e) = out.flush().await {
                warn!("Cannot flush spool file {}: {e}", self.path.display());
            }
        }
        drop(self.out.take());
        if self.records == 0 {
            if let Err(e) = fs::remove_file(&self.path).await {
                trace!("Cannot remove empty spool file {}: {e}", self.path.display());
            }
        }
    }
}

struct Shared {
    storage: Arc<dyn Storage>,
    lookup: Arc<dyn Lookup>,
    blacklists: Blacklists,
    sink: HostSink,
    zones: Queue<Zone>,
    hosts: Queue<Host>,
    /// Zones handed to the workers and not yet done with.
    in_flight: DashSet<String>,
    workers: WorkerPool,
    retry: RetryPolicy,
    period: Duration,
    read_timeout: Duration,
    spool_dir: PathBuf,
    xfr_port: u16,
}

impl Shared {
    /// Pulls unfinished zones out of storage, at most one per worker and round.
    async fn feed(&self, root: &CancellationToken, token: &CancellationToken) {
        debug!("Zone feeder starting up...");

        while !token.is_cancelled() {
            let batch = self.workers.len().max(1);
            let limit = batch + self.in_flight.len();
            let zones = match retry(self.retry, "ZoneGetUnfinished", || {
                self.storage.zone_get_unfinished(limit)
            })
            .await
            {
                Ok(zones) => zones,
                Err(e) => {
                    error!("Failed to get {batch} unfinished zones, stopping XFR: {e}");
                    root.cancel();
                    return;
                }
            };

            let due = zones
                .into_iter()
                .filter(|z| !self.in_flight.contains(&z.name))
                .take(batch)
                .collect_vec();
            if due.is_empty() {
                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(self.period) => continue,
                }
            }

            for zone in due {
                let name = zone.name.clone();
                self.in_flight.insert(name.clone());
                if !self.zones.send(zone, token).await {
                    self.in_flight.remove(&name);
                    break;
                }
            }
        }

        debug!("Zone feeder quitting...");
    }

    async fn work(&self, id: usize, token: &CancellationToken) {
        debug!("XFR worker #{id:02} starting up...");
        let mut wake = heartbeat(self.period);

        loop {
            tokio::select! {
                biased;
                () = token.cancelled() => break,
                zone = self.zones.recv() => {
                    let Some(zone) = zone else { break };
                    let name = zone.name.clone();
                    let res = self.harvest(zone, token).await;
                    self.in_flight.remove(&name);
                    if let Err(e) = res {
                        error!("XFR worker #{id:02} cannot update zone {name}: {e}");
                        break;
                    }
                }
                _ = wake.tick() => trace!("XFR worker #{id:02} idle"),
            }
        }

        debug!("XFR worker #{id:02} quitting...");
    }

    /// Attempts a transfer of `zone` from each of its name servers in turn,
    /// until one yields records.
    ///
    /// A transfer interrupted by cancellation, or name servers that cannot
    /// be looked up for the time being, leave the zone unfinished, so it is
    /// picked up again later.
    async fn harvest(&self, zone: Zone, token: &CancellationToken) -> Result<(), StorageError> {
        if is_top_level(&zone.name) {
            debug!("Not transferring top-level zone {}", zone.name);
            self.mark_started(&zone).await?;
            return self.mark_finished(&zone, false).await;
        }

        let servers = match with_retry(self.retry, "Name server lookup", || {
            self.lookup.name_servers(&zone.name)
        })
        .await
        {
            Ok(servers) => servers,
            Err(LookupError::NotFound) => Vec::new(),
            Err(LookupError::Transient(e)) => {
                warn!("Name servers of {} unavailable, leaving it for later: {e}", zone.name);
                return Ok(());
            }
            Err(e) => {
                debug!("Cannot find name servers of {}: {e}", zone.name);
                Vec::new()
            }
        };
        self.mark_started(&zone).await?;

        let mut spool = Spool::create(&self.spool_dir, &zone.name).await;
        let mut success = false;
        'servers: for server in &servers {
            let addrs = match with_retry(self.retry, "Address lookup", || {
                self.lookup.addresses(server)
            })
            .await
            {
                Ok(addrs) => addrs,
                Err(e) => {
                    debug!("Cannot resolve name server {server}: {e}");
                    continue;
                }
            };
            for addr in addrs {
                debug!("Attempting AXFR of {} from {server} ({addr})", zone.name);
                let target = SocketAddr::new(addr, self.xfr_port);
                match self.transfer(&zone, target, &mut spool, token).await {
                    Ok(0) => {}
                    Ok(n) => {
                        info!("Transferred {n} records of {} from {server}", zone.name);
                        success = true;
                        break 'servers;
                    }
                    Err(XfrError::Cancelled) => {
                        spool.finish().await;
                        return Ok(());
                    }
                    Err(e) => debug!("AXFR of {} from {server} ({addr}) failed: {e}", zone.name),
                }
            }
        }
        spool.finish().await;

        self.mark_finished(&zone, success).await
    }

    async fn mark_started(&self, zone: &Zone) -> Result<(), StorageError> {
        retry(self.retry, "ZoneMarkStarted", || {
            self.storage.zone_mark_started(zone)
        })
        .await
    }

    async fn mark_finished(&self, zone: &Zone, success: bool) -> Result<(), StorageError> {
        retry(self.retry, "ZoneMarkFinished", || {
            self.storage.zone_mark_finished(zone, success)
        })
        .await
    }

    /// Runs one transfer, returning the number of records received. A server
    /// failing midway still counts whatever it sent before.
    async fn transfer(
        &self,
        zone: &Zone,
        server: SocketAddr,
        spool: &mut Spool,
        token: &CancellationToken,
    ) -> Result<usize, XfrError> {
        let mut stream = AxfrStream::connect(server, &zone.name, self.read_timeout).await?;
        let mut count = 0;

        loop {
            let records = tokio::select! {
                biased;
                () = token.cancelled() => return Err(XfrError::Cancelled),
                batch = stream.next_batch() => match batch {
                    Ok(Some(records)) => records,
                    Ok(None) => break,
                    Err(e) if count > 0 => {
                        debug!("AXFR of {} from {server} broke off: {e}", zone.name);
                        break;
                    }
                    Err(e) => return Err(e),
                },
            };

            count += records.len();
            spool.append(&records).await;
            let hosts =
                hosts_from_records(&records, &self.blacklists, self.lookup.as_ref(), self.retry)
                    .await;
            for host in hosts {
                if !self.hosts.send(host, token).await {
                    return Err(XfrError::Cancelled);
                }
            }
        }

        Ok(count)
    }
}

/// Zone transfer subsystem.
pub struct Xfr {
    shared: Arc<Shared>,
    worker_count: usize,
    lifecycle: Lifecycle,
    feeder: WorkerPool,
    host_pool: WorkerPool,
}

impl std::fmt::Debug for Xfr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Xfr")
            .field("active", &self.is_active())
            .field("workers", &self.worker_count())
            .finish_non_exhaustive()
    }
}

impl Xfr {
    pub fn new(
        config: &EngineConfig,
        storage: Arc<dyn Storage>,
        lookup: Arc<dyn Lookup>,
    ) -> Result<Self, BlacklistError> {
        let shared = Shared {
            sink: HostSink::new(Arc::clone(&storage), config.retry),
            storage,
            lookup,
            blacklists: Blacklists::from_config(&config.blacklist)?,
            zones: Queue::new(config.workers.xfr.max(1)),
            hosts: Queue::new(config.queue_depth),
            in_flight: DashSet::new(),
            workers: WorkerPool::new("XFR"),
            retry: config.retry,
            period: config.active_timeout,
            read_timeout: config.probe_timeout,
            spool_dir: config.spool_dir.clone(),
            xfr_port: config.xfr_port,
        };

        Ok(Self {
            shared: Arc::new(shared),
            worker_count: config.workers.xfr,
            lifecycle: Lifecycle::default(),
            feeder: WorkerPool::new("Zone feeder"),
            host_pool: WorkerPool::new("XFR host"),
        })
    }

    pub fn start(&self) {
        let Some(root) = self.lifecycle.begin() else {
            warn!("XFR is already running");
            return;
        };
        info!("Starting XFR with {} workers", self.worker_count);

        if let Err(e) = std::fs::create_dir_all(&self.shared.spool_dir) {
            warn!(
                "Cannot create spool directory {}: {e}",
                self.shared.spool_dir.display()
            );
        }

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
        self.host_pool.spawn(&root, move |_, token| async move {
            if let Err(e) = drain_hosts("XFR", &shared.hosts, &shared.sink, &token, shared.period).await {
                error!("XFR host worker failed, stopping XFR: {e}");
                subsystem.cancel();
            }
        });
    }

    pub fn stop(&self) {
        if self.lifecycle.end() {
            info!("Stopping XFR");
        }
        self.shared.workers.stop_all();
        self.feeder.stop_all();
        self.host_pool.stop_all();
    }

    pub fn is_active(&self) -> bool {
        self.lifecycle.is_active()
    }

    /// Number of transfer workers currently running.
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

    fn spawn_worker(&self, root: &CancellationToken) {
        let shared = Arc::clone(&self.shared);
        self.shared.workers.spawn(root, move |id, token| async move {
            shared.work(id, &token).await;
        });
    }
}
