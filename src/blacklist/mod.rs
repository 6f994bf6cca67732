//! Self-ordering blacklists for host names and addresses.
//!
//! A [`Blacklist`] is an ordered list of patterns, each with a hit counter.
//! Whenever a pattern matches, its counter goes up and the list is re-sorted
//! by descending hit count, so the handful of patterns that catch most
//! candidates end up being tried first.
mod defaults;

pub use defaults::{DEFAULT_ADDRESS_RANGES, DEFAULT_NAME_PATTERNS};

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use cidr_utils::cidr::IpCidr;
use log::trace;
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlacklistError {
    #[error("invalid name pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("invalid network {network:?}: {reason}")]
    Network { network: String, reason: String },
}

/// Something a blacklist entry can be matched with.
pub trait Pattern: fmt::Display + Send + Sync {
    type Input: ?Sized;

    fn matches(&self, candidate: &Self::Input) -> bool;
}

impl Pattern for Regex {
    type Input = str;

    fn matches(&self, candidate: &str) -> bool {
        self.is_match(candidate)
    }
}

impl Pattern for IpCidr {
    type Input = IpAddr;

    fn matches(&self, candidate: &IpAddr) -> bool {
        self.contains(candidate)
    }
}

#[derive(Debug)]
struct Entry<P> {
    pattern: P,
    hits: AtomicU64,
}

/// An ordered list of patterns that promotes frequent hitters.
///
/// Lookups share a read lock; only the re-sort after a hit is exclusive.
#[derive(Debug)]
pub struct Blacklist<P> {
    items: RwLock<Vec<Entry<P>>>,
}

/// Blacklist matched against host names.
pub type NameBlacklist = Blacklist<Regex>;

/// Blacklist matched against network addresses.
pub type AddressBlacklist = Blacklist<IpCidr>;

impl<P: Pattern> Blacklist<P> {
    pub fn new(patterns: impl IntoIterator<Item = P>) -> Self {
        let items = patterns
            .into_iter()
            .map(|pattern| Entry {
                pattern,
                hits: AtomicU64::new(0),
            })
            .collect();

        Self {
            items: RwLock::new(items),
        }
    }

    /// Returns true if any pattern matches `candidate`.
    ///
    /// The first matching entry gets its hit counter bumped, then the whole
    /// list is re-sorted by descending hit count. A miss never takes the
    /// write lock.
    pub fn matches(&self, candidate: &P::Input) -> bool {
        let hit = {
            let items = self.items.read().unwrap_or_else(PoisonError::into_inner);
            items.iter().any(|entry| {
                if entry.pattern.matches(candidate) {
                    entry.hits.fetch_add(1, Ordering::Relaxed);
                    trace!("Blacklist hit on {}", entry.pattern);
                    true
                } else {
                    false
                }
            })
        };

        if hit {
            let mut items = self.items.write().unwrap_or_else(PoisonError::into_inner);
            // Stable, so entries with equal counts keep their relative order.
            items.sort_by(|a, b| {
                b.hits
                    .load(Ordering::Relaxed)
                    .cmp(&a.hits.load(Ordering::Relaxed))
            });
        }

        hit
    }

    /// The current order of the list, with each entry's hit count.
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|entry| (entry.pattern.to_string(), entry.hits.load(Ordering::Relaxed)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl NameBlacklist {
    /// Compiles the given patterns. A malformed pattern fails the whole list.
    pub fn from_patterns<S: AsRef<str>>(patterns: &[S]) -> Result<Self, BlacklistError> {
        let compiled = patterns
            .iter()
            .map(|p| {
                Regex::new(p.as_ref()).map_err(|source| BlacklistError::Pattern {
                    pattern: p.as_ref().to_owned(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self::new(compiled))
    }
}

impl AddressBlacklist {
    /// Parses the given CIDR networks. A malformed network fails the whole list.
    pub fn from_networks<S: AsRef<str>>(networks: &[S]) -> Result<Self, BlacklistError> {
        let parsed = networks
            .iter()
            .map(|n| {
                IpCidr::from_str(n.as_ref()).map_err(|e| BlacklistError::Network {
                    network: n.as_ref().to_owned(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self::new(parsed))
    }
}

/// The pair of blacklists every discovering subsystem filters through.
#[derive(Debug)]
pub struct Blacklists {
    pub names: NameBlacklist,
    pub addresses: AddressBlacklist,
}

impl Blacklists {
    pub fn from_config(config: &crate::config::BlacklistConfig) -> Result<Self, BlacklistError> {
        Ok(Self {
            names: NameBlacklist::from_patterns(&config.name_patterns)?,
            addresses: AddressBlacklist::from_networks(&config.address_ranges)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BlacklistConfig;
    use parameterized::parameterized;

    #[test]
    fn default_seed_lists_compile() {
        let lists = Blacklists::from_config(&BlacklistConfig::default()).unwrap();
        assert_eq!(lists.names.len(), DEFAULT_NAME_PATTERNS.len());
        assert_eq!(lists.addresses.len(), DEFAULT_ADDRESS_RANGES.len());
    }

    #[parameterized(name = {
        "www.my-cool-domain.com",
        "customer-wiki.my-cool-domain.com",
        "localhost",
        "p5b0c1d2e.dip0.t-ipconnect.de",
        "84-112-3-7.cable.example.net",
        "ns1.example.org",
    }, expected = {
        false, true, true, false, true, false
    })]
    fn default_names(name: &str, expected: bool) {
        let names = NameBlacklist::from_patterns(DEFAULT_NAME_PATTERNS).unwrap();
        assert_eq!(names.matches(name), expected);
    }

    #[parameterized(addr = {
        "10.1.2.3", "192.168.178.1", "127.0.0.1", "8.8.8.8", "93.184.216.34", "::1", "2a00:1450::1"
    }, expected = {
        true, true, true, false, false, true, false
    })]
    fn default_addresses(addr: &str, expected: bool) {
        let addresses = AddressBlacklist::from_networks(DEFAULT_ADDRESS_RANGES).unwrap();
        assert_eq!(addresses.matches(&addr.parse().unwrap()), expected);
    }

    #[test]
    fn malformed_seeds_are_rejected() {
        assert!(matches!(
            NameBlacklist::from_patterns(&["(unclosed"]),
            Err(BlacklistError::Pattern { .. })
        ));
        assert!(matches!(
            AddressBlacklist::from_networks(&["10.0.0.0/33"]),
            Err(BlacklistError::Network { .. })
        ));
    }

    #[test]
    fn frequent_hitter_moves_to_front() {
        let names = NameBlacklist::from_patterns(&["^alpha", "^beta", "^gamma", "^delta"]).unwrap();

        for _ in 0..3 {
            assert!(names.matches("delta.example.com"));
        }

        let order = names.snapshot();
        assert_eq!(order[0], ("^delta".to_owned(), 3));
        assert!(order[1..].iter().all(|(_, hits)| *hits == 0));
    }

    #[test]
    fn hit_counters_count_true_results_only() {
        let addresses = AddressBlacklist::from_networks(&["10.0.0.0/8", "192.0.2.0/24"]).unwrap();

        assert!(addresses.matches(&"192.0.2.1".parse().unwrap()));
        assert!(addresses.matches(&"192.0.2.77".parse().unwrap()));
        assert!(!addresses.matches(&"198.51.100.1".parse().unwrap()));
        assert!(addresses.matches(&"10.9.9.9".parse().unwrap()));

        let counts: u64 = addresses.snapshot().iter().map(|(_, hits)| hits).sum();
        assert_eq!(counts, 3);
        assert_eq!(addresses.snapshot()[0], ("192.0.2.0/24".to_owned(), 2));
    }

    #[test]
    fn empty_list_never_matches() {
        let names = NameBlacklist::from_patterns::<&str>(&[]).unwrap();
        assert!(names.is_empty());
        assert!(!names.matches("localhost"));
    }

    #[test]
    fn concurrent_matching_keeps_counts() {
        let names = std::sync::Arc::new(
            NameBlacklist::from_patterns(&["^a", "^b", "^c"]).unwrap(),
        );

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let names = std::sync::Arc::clone(&names);
                std::thread::spawn(move || {
                    let name = if i % 2 == 0 { "a.example" } else { "c.example" };
                    for _ in 0..100 {
                        assert!(names.matches(name));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let total: u64 = names.snapshot().iter().map(|(_, hits)| hits).sum();
        assert_eq!(total, 800);
    }
}
