//! Persisting discovered hosts, and feeding their parent zones back into the
//! zone transfer backlog.
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, trace};
use tokio_util::sync::CancellationToken;

use crate::config::RetryPolicy;
use crate::model::{is_top_level, parent_zone, Host, RowId, Zone};
use crate::queue::{heartbeat, Queue};
use crate::storage::{retry, Storage, StorageError};

#[derive(Clone)]
pub struct HostSink {
    storage: Arc<dyn Storage>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for HostSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostSink").field("retry", &self.retry).finish()
    }
}

impl HostSink {
    pub fn new(storage: Arc<dyn Storage>, retry: RetryPolicy) -> Self {
        Self { storage, retry }
    }

    /// Stores `host` and registers its parent zone.
    ///
    /// A host whose address is already known is not an error; `None` is
    /// returned and no zone is derived.
    pub async fn accept(&self, host: &Host) -> Result<Option<RowId>, StorageError> {
        let id = match retry(self.retry, "HostAdd", || self.storage.host_add(host)).await {
            Ok(id) => id,
            Err(StorageError::Duplicate { what }) => {
                trace!("Skipping {what}, already known");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        debug!(
            "Added host #{id} {} ({}) from {}",
            host.name(),
            host.addr(),
            host.source()
        );

        self.register_parent_zone(host.name()).await?;
        Ok(Some(id))
    }

    /// Registers the zone `name` belongs to, unless it looks like a
    /// top-level domain or is already tracked.
    pub async fn register_parent_zone(&self, name: &str) -> Result<Option<RowId>, StorageError> {
        let Some(zone) = parent_zone(name) else {
            return Ok(None);
        };
        if is_top_level(&zone) {
            trace!("Not registering top-level zone {zone}");
            return Ok(None);
        }

        let known = retry(self.retry, "ZoneGetByName", || {
            self.storage.zone_get_by_name(&zone)
        })
        .await?;
        if known.is_some() {
            return Ok(None);
        }

        let candidate = Zone::new(&zone);
        match retry(self.retry, "ZoneAdd", || self.storage.zone_add(&candidate)).await {
            Ok(id) => {
                info!("Registered zone {zone} for transfer");
                Ok(Some(id))
            }
            // Somebody else got there first.
            Err(StorageError::Duplicate { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Drains `queue` into `sink` until `token` is cancelled.
///
/// Busy storage that outlasts the retries costs the host at hand; anything
/// worse ends the worker.
pub async fn drain_hosts(
    role: &str,
    queue: &Queue<Host>,
    sink: &HostSink,
    token: &CancellationToken,
    period: Duration,
) -> Result<(), StorageError> {
    debug!("{role} host worker starting up...");
    let mut wake = heartbeat(period);

    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            host = queue.recv() => {
                let Some(host) = host else { break };
                match sink.accept(&host).await {
                    Ok(_) => {}
                    Err(e) if e.is_retryable() => {
                        error!("Failed to add host {} ({}): {e}", host.name(), host.addr());
                    }
                    Err(e) => return Err(e),
                }
            }
            _ = wake.tick() => trace!("{role} host worker idle"),
        }
    }

    debug!("{role} host worker quitting...");
    Ok(())
}
