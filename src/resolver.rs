//! Name resolution: building the DNS resolver and the lookups the
//! discovery subsystems need.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use async_trait::async_trait;
use hickory_resolver::{
    config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts},
    error::{ResolveError, ResolveErrorKind},
    proto::op::ResponseCode,
    TokioAsyncResolver,
};
use itertools::Itertools;
use log::{debug, trace};
use thiserror::Error;
use tokio::{fs, io};

use crate::config::RetryPolicy;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LookupError {
    /// The name or address simply has no such record. Not worth logging.
    #[error("no such record")]
    NotFound,
    /// Temporary failure in name resolution; worth another try.
    #[error("temporary failure in name resolution: {0}")]
    Transient(String),
    #[error("lookup failed: {0}")]
    Failed(String),
}

impl From<ResolveError> for LookupError {
    fn from(e: ResolveError) -> Self {
        match e.kind() {
            ResolveErrorKind::NoRecordsFound { response_code, .. } => match *response_code {
                ResponseCode::ServFail => Self::Transient(e.to_string()),
                ResponseCode::NoError | ResponseCode::NXDomain => Self::NotFound,
                _ => Self::Failed(e.to_string()),
            },
            ResolveErrorKind::Timeout | ResolveErrorKind::NoConnections => {
                Self::Transient(e.to_string())
            }
            ResolveErrorKind::Io(_) | ResolveErrorKind::Proto(_) => Self::Transient(e.to_string()),
            _ => Self::Failed(e.to_string()),
        }
    }
}

/// The lookups the discovery pipeline performs.
#[async_trait]
pub trait Lookup: Send + Sync {
    /// PTR names of `addr`.
    async fn reverse(&self, addr: IpAddr) -> Result<Vec<String>, LookupError>;
    /// A and AAAA addresses of `name`.
    async fn addresses(&self, name: &str) -> Result<Vec<IpAddr>, LookupError>;
    /// Authoritative name servers of `zone`.
    async fn name_servers(&self, zone: &str) -> Result<Vec<String>, LookupError>;
}

/// [`Lookup`] backed by a hickory resolver.
#[derive(Debug, Clone)]
pub struct DnsLookup {
    resolver: TokioAsyncResolver,
}

impl DnsLookup {
    pub const fn new(resolver: TokioAsyncResolver) -> Self {
        Self { resolver }
    }

    /// Builds the resolver from the `--resolver` option, see [`build_resolver`].
    pub async fn from_option(resolver: &Option<String>) -> Self {
        Self::new(build_resolver(resolver).await)
    }
}

/// Makes `name` fully qualified so search domains never get appended.
fn fqdn(name: &str) -> String {
    if name.ends_with('.') {
        name.to_owned()
    } else {
        format!("{name}.")
    }
}

#[async_trait]
impl Lookup for DnsLookup {
    async fn reverse(&self, addr: IpAddr) -> Result<Vec<String>, LookupError> {
        let names = self
            .resolver
            .reverse_lookup(addr)
            .await?
            .iter()
            .map(|ptr| ptr.0.to_utf8())
            .collect_vec();
        Ok(names)
    }

    async fn addresses(&self, name: &str) -> Result<Vec<IpAddr>, LookupError> {
        let addrs = self.resolver.lookup_ip(fqdn(name)).await?.iter().collect_vec();
        Ok(addrs)
    }

    async fn name_servers(&self, zone: &str) -> Result<Vec<String>, LookupError> {
        let servers = self
            .resolver
            .ns_lookup(fqdn(zone))
            .await?
            .iter()
            .map(|ns| ns.0.to_utf8())
            .collect_vec();
        Ok(servers)
    }
}

/// Runs the lookup `op` until it gives an answer, retrying temporary
/// failures up to `policy.attempts` times.
///
/// `NotFound` and `Failed` are final and returned at once.
pub async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, LookupError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LookupError>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Err(LookupError::Transient(e)) if attempt < attempts => {
                debug!("{what} failed temporarily ({attempt}/{attempts}): {e}");
                attempt += 1;
                tokio::time::sleep(policy.delay).await;
            }
            res => return res,
        }
    }
}

/// Reverse-resolves `addr`, retrying temporary failures.
///
/// "No such host" comes back as an empty list rather than an error, an
/// address without a PTR record is the common case.
pub async fn reverse_with_retry(
    lookup: &dyn Lookup,
    addr: IpAddr,
    policy: RetryPolicy,
) -> Result<Vec<String>, LookupError> {
    match with_retry(policy, "Reverse lookup", || lookup.reverse(addr)).await {
        Err(LookupError::NotFound) => {
            trace!("{addr} has no PTR record");
            Ok(Vec::new())
        }
        res => res,
    }
}

/// Builds the resolver every lookup goes through.
///
/// `--resolver` names either a file with one server address per line or a
/// comma separated list of addresses; unparsable entries are ignored. Without
/// it the system configuration is used, and Cloudflare over TLS when that
/// cannot be read.
pub async fn build_resolver(resolver: &Option<String>) -> TokioAsyncResolver {
    match resolver {
        Some(r) => {
            let mut config = ResolverConfig::new();
            let resolver_ips = match read_resolver_file(r).await {
                Ok(ips) => ips,
                Err(_) => r
                    .split(',')
                    .filter_map(|r| IpAddr::from_str(r.trim()).ok())
                    .collect::<Vec<_>>(),
            };
            for ip in resolver_ips {
                config.add_name_server(NameServerConfig::new(
                    SocketAddr::new(ip, 53),
                    Protocol::Udp,
                ));
            }
            TokioAsyncResolver::tokio(config, ResolverOpts::default())
        }
        None => TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|_| {
            TokioAsyncResolver::tokio(ResolverConfig::cloudflare_tls(), ResolverOpts::default())
        }),
    }
}

/// Reads the name server addresses listed in `path`.
async fn read_resolver_file(path: &str) -> io::Result<Vec<IpAddr>> {
    let ips = fs::read_to_string(path)
        .await?
        .lines()
        .filter_map(|line| IpAddr::from_str(line.trim()).ok())
        .collect();

    Ok(ips)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct Flaky {
        calls: AtomicU32,
        failures: u32,
        outcome: Result<Vec<String>, LookupError>,
    }

    #[async_trait]
    impl Lookup for Flaky {
        async fn reverse(&self, _addr: IpAddr) -> Result<Vec<String>, LookupError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                Err(LookupError::Transient("SERVFAIL".to_owned()))
            } else {
                self.outcome.clone()
            }
        }

        async fn addresses(&self, _name: &str) -> Result<Vec<IpAddr>, LookupError> {
            Err(LookupError::NotFound)
        }

        async fn name_servers(&self, _zone: &str) -> Result<Vec<String>, LookupError> {
            Err(LookupError::NotFound)
        }
    }

    const FAST: RetryPolicy = RetryPolicy {
        attempts: 5,
        delay: Duration::from_millis(1),
    };

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let lookup = Flaky {
            calls: AtomicU32::new(0),
            failures: 3,
            outcome: Ok(vec!["host.example.com.".to_owned()]),
        };
        let names = reverse_with_retry(&lookup, "192.0.2.1".parse().unwrap(), FAST)
            .await
            .unwrap();

        assert_eq!(names, ["host.example.com."]);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let lookup = Flaky {
            calls: AtomicU32::new(0),
            failures: u32::MAX,
            outcome: Ok(Vec::new()),
        };
        let res = reverse_with_retry(&lookup, "192.0.2.1".parse().unwrap(), FAST).await;

        assert!(matches!(res, Err(LookupError::Transient(_))));
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn no_such_host_is_an_empty_answer() {
        let lookup = Flaky {
            calls: AtomicU32::new(0),
            failures: 0,
            outcome: Err(LookupError::NotFound),
        };
        let names = reverse_with_retry(&lookup, "192.0.2.1".parse().unwrap(), FAST)
            .await
            .unwrap();

        assert!(names.is_empty());
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn names_are_made_fully_qualified() {
        assert_eq!(fqdn("example.com"), "example.com.");
        assert_eq!(fqdn("example.com."), "example.com.");
    }
}
