//! The interface to durable storage of hosts, zones and services.
//!
//! Storage itself lives outside the engine; the subsystems only see the
//! [`Storage`] trait. [`MemoryStorage`] is a complete in-process
//! implementation used by the binary and the tests.
mod memory;

pub use memory::MemoryStorage;

use std::collections::HashMap;
use std::future::Future;

use async_trait::async_trait;
use log::{debug, warn};
use thiserror::Error;

use crate::config::RetryPolicy;
use crate::model::{Host, RowId, Service, Zone};

#[derive(Debug, Error)]
pub enum StorageError {
    /// Contention or a busy lock; the same call may succeed a moment later.
    #[error("storage is busy: {0}")]
    Busy(String),
    #[error("{what} already exists")]
    Duplicate { what: String },
    #[error("{what} does not exist")]
    Missing { what: String },
    #[error("invalid record: {0}")]
    Invalid(String),
    #[error("storage backend failed: {0}")]
    Backend(String),
}

impl StorageError {
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy(_))
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Durable home of everything the engine discovers.
///
/// Hosts, zones and services are never deleted through this interface.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn host_add(&self, host: &Host) -> Result<RowId>;
    async fn host_get_by_id(&self, id: RowId) -> Result<Option<Host>>;
    /// Up to `n` hosts picked at random.
    async fn host_get_random(&self, n: usize) -> Result<Vec<Host>>;
    async fn host_get_count(&self) -> Result<i64>;

    async fn service_add(&self, host: &Host, service: &Service) -> Result<RowId>;
    /// All recorded probe results of `host`, keyed by port.
    async fn service_get_by_host(&self, host: &Host) -> Result<HashMap<u16, Service>>;
    async fn service_get_count(&self) -> Result<i64>;

    async fn zone_add(&self, zone: &Zone) -> Result<RowId>;
    async fn zone_get_by_name(&self, name: &str) -> Result<Option<Zone>>;
    /// Up to `limit` zones without a finished timestamp, oldest added first.
    async fn zone_get_unfinished(&self, limit: usize) -> Result<Vec<Zone>>;
    async fn zone_get_count(&self) -> Result<i64>;
    async fn zone_mark_started(&self, zone: &Zone) -> Result<()>;
    async fn zone_mark_finished(&self, zone: &Zone, success: bool) -> Result<()>;
}

/// Runs `op`, retrying retryable failures with a fixed delay.
///
/// After `policy.attempts` tries the last error is returned; non-retryable
/// errors are returned immediately.
pub async fn retry<T, F, Fut>(policy: RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_retryable() && attempt < attempts => {
                debug!("{what} failed on attempt {attempt}/{attempts}, retrying: {e}");
                attempt += 1;
                tokio::time::sleep(policy.delay).await;
            }
            Err(e) => {
                if e.is_retryable() {
                    warn!("{what} still failing after {attempts} attempts: {e}");
                }
                return Err(e);
            }
            ok => return ok,
        }
    }
}
