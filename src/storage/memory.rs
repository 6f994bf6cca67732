use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use rand::seq::IndexedRandom;

use super::{Result, Storage, StorageError};
use crate::model::{normalize_name, Host, RowId, Service, Zone};

#[derive(Debug, Default)]
struct State {
    hosts: Vec<Host>,
    host_by_addr: HashMap<IpAddr, RowId>,
    services: Vec<Service>,
    services_by_host: HashMap<RowId, Vec<usize>>,
    zones: Vec<Zone>,
    zone_by_name: HashMap<String, RowId>,
}

impl State {
    fn zone_mut(&mut self, zone: &Zone) -> Result<&mut Zone> {
        let id = match zone.id {
            Some(id) => Some(id),
            None => self.zone_by_name.get(&normalize_name(&zone.name)).copied(),
        };
        id.and_then(|id| self.zones.get_mut(index(id)?))
            .ok_or_else(|| StorageError::Missing {
                what: format!("zone {}", zone.name),
            })
    }
}

/// Row ids start at 1, so id `n` lives at index `n - 1`.
fn index(id: RowId) -> Option<usize> {
    usize::try_from(id).ok()?.checked_sub(1)
}

fn count(len: usize) -> i64 {
    i64::try_from(len).unwrap_or(i64::MAX)
}

fn next_id(len: usize) -> RowId {
    count(len).saturating_add(1)
}

/// Keeps every record in process memory.
///
/// Enforces the same constraints a relational backend would: unique host
/// addresses, unique zone names, services only for known hosts.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: Mutex<State>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sample_hosts(&self, n: usize) -> Vec<Host> {
        let state = self.state();
        let mut rng = rand::rng();
        state.hosts.choose_multiple(&mut rng, n).cloned().collect()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn host_add(&self, host: &Host) -> Result<RowId> {
        let mut state = self.state();
        if state.host_by_addr.contains_key(&host.addr()) {
            return Err(StorageError::Duplicate {
                what: format!("host {}", host.addr()),
            });
        }

        let id = next_id(state.hosts.len());
        state.host_by_addr.insert(host.addr(), id);
        state.hosts.push(host.clone().persisted(id, Utc::now()));
        Ok(id)
    }

    async fn host_get_by_id(&self, id: RowId) -> Result<Option<Host>> {
        Ok(index(id).and_then(|i| self.state().hosts.get(i).cloned()))
    }

    async fn host_get_random(&self, n: usize) -> Result<Vec<Host>> {
        Ok(self.sample_hosts(n))
    }

    async fn host_get_count(&self) -> Result<i64> {
        Ok(count(self.state().hosts.len()))
    }

    async fn service_add(&self, host: &Host, service: &Service) -> Result<RowId> {
        let host_id = host
            .id()
            .or(service.host_id)
            .ok_or_else(|| StorageError::Invalid(format!("service on {} without host id", host.addr())))?;
        if service.port == 0 {
            return Err(StorageError::Invalid("port 0".to_owned()));
        }

        let mut state = self.state();
        let host_index = index(host_id)
            .filter(|&i| i < state.hosts.len())
            .ok_or_else(|| StorageError::Missing {
                what: format!("host #{host_id}"),
            })?;

        let now = Utc::now();
        let id = next_id(state.services.len());
        let position = state.services.len();
        state.services.push(Service {
            id: Some(id),
            host_id: Some(host_id),
            timestamp: now,
            ..service.clone()
        });
        state
            .services_by_host
            .entry(host_id)
            .or_default()
            .push(position);
        state.hosts[host_index].touch(now);
        Ok(id)
    }

    async fn service_get_by_host(&self, host: &Host) -> Result<HashMap<u16, Service>> {
        let Some(host_id) = host.id() else {
            return Ok(HashMap::new());
        };

        let state = self.state();
        let services: HashMap<u16, Service> = state
            .services_by_host
            .get(&host_id)
            .map(|positions| {
                positions
                    .iter()
                    .map(|&i| (state.services[i].port, state.services[i].clone()))
                    .collect()
            })
            .unwrap_or_default();
        Ok(services)
    }

    async fn service_get_count(&self) -> Result<i64> {
        Ok(count(self.state().services.len()))
    }

    async fn zone_add(&self, zone: &Zone) -> Result<RowId> {
        let name = normalize_name(&zone.name);
        if name.is_empty() {
            return Err(StorageError::Invalid("empty zone name".to_owned()));
        }

        let mut state = self.state();
        if state.zone_by_name.contains_key(&name) {
            return Err(StorageError::Duplicate {
                what: format!("zone {name}"),
            });
        }

        let id = next_id(state.zones.len());
        state.zone_by_name.insert(name.clone(), id);
        state.zones.push(Zone {
            id: Some(id),
            name,
            ..zone.clone()
        });
        Ok(id)
    }

    async fn zone_get_by_name(&self, name: &str) -> Result<Option<Zone>> {
        let state = self.state();
        Ok(state
            .zone_by_name
            .get(&normalize_name(name))
            .and_then(|&id| state.zones.get(index(id)?))
            .cloned())
    }

    async fn zone_get_unfinished(&self, limit: usize) -> Result<Vec<Zone>> {
        let state = self.state();
        let mut zones: Vec<Zone> = state
            .zones
            .iter()
            .filter(|z| !z.is_finished())
            .cloned()
            .collect();
        zones.sort_by_key(|z| (z.added, z.id));
        zones.truncate(limit);
        Ok(zones)
    }

    async fn zone_get_count(&self) -> Result<i64> {
        Ok(count(self.state().zones.len()))
    }

    async fn zone_mark_started(&self, zone: &Zone) -> Result<()> {
        let mut state = self.state();
        state.zone_mut(zone)?.start(Utc::now());
        Ok(())
    }

    async fn zone_mark_finished(&self, zone: &Zone, success: bool) -> Result<()> {
        let mut state = self.state();
        state
            .zone_mut(zone)?
            .finish(Utc::now(), success)
            .map_err(|e| StorageError::Invalid(e.to_string()))
    }
}
