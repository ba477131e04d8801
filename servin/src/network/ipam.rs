//! IPv4 address management for a managed bridge.
//!
//! The allocation state is persisted in `networks/<bridge>.json` and guarded
//! by a single mutex. Allocation is deterministic: the lowest free address
//! wins, so identical pool snapshots always produce identical assignments.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use ipnet::Ipv4Net;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::errors::{ServinError, ServinResult};
use crate::runtime::layout::FilesystemLayout;
use crate::store::{atomic_write_json, load_json};

/// Persisted bridge network state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeNetworkRecord {
    pub name: String,
    pub subnet: Ipv4Net,
    pub gateway: Ipv4Addr,
    /// Allocated address -> container id.
    #[serde(default)]
    pub allocations: BTreeMap<Ipv4Addr, String>,
}

impl BridgeNetworkRecord {
    pub fn new(name: &str, subnet: Ipv4Net) -> Self {
        // First usable host is the bridge's own gateway address.
        let gateway = subnet
            .hosts()
            .next()
            .unwrap_or_else(|| subnet.addr());
        Self {
            name: name.to_string(),
            subnet,
            gateway,
            allocations: BTreeMap::new(),
        }
    }
}

/// Mutex-guarded allocator over one bridge's pool.
pub struct IpamPool {
    path: PathBuf,
    state: Mutex<BridgeNetworkRecord>,
}

impl IpamPool {
    /// Load (or initialize) the pool for a bridge.
    pub fn open(layout: &FilesystemLayout, bridge: &str, subnet: Ipv4Net) -> ServinResult<Self> {
        let path = layout.networks_dir().join(format!("{bridge}.json"));
        let record =
            load_json(&path)?.unwrap_or_else(|| BridgeNetworkRecord::new(bridge, subnet));
        atomic_write_json(&path, &record)?;
        Ok(Self {
            path,
            state: Mutex::new(record),
        })
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.state.lock().gateway
    }

    pub fn subnet(&self) -> Ipv4Net {
        self.state.lock().subnet
    }

    /// Allocate the lowest free address for a container.
    pub fn allocate(&self, container_id: &str) -> ServinResult<Ipv4Addr> {
        let mut state = self.state.lock();

        // Re-allocation for the same container returns its existing address.
        if let Some((ip, _)) = state
            .allocations
            .iter()
            .find(|(_, owner)| owner.as_str() == container_id)
        {
            return Ok(*ip);
        }

        let gateway = state.gateway;
        let candidate = state
            .subnet
            .hosts()
            .find(|ip| *ip != gateway && !state.allocations.contains_key(ip));
        let ip = candidate.ok_or_else(|| {
            ServinError::Isolation(format!("address pool {} exhausted", state.subnet))
        })?;

        state.allocations.insert(ip, container_id.to_string());
        atomic_write_json(&self.path, &*state)?;
        Ok(ip)
    }

    /// Return a container's address to the pool. Idempotent.
    pub fn release(&self, container_id: &str) -> ServinResult<()> {
        let mut state = self.state.lock();
        let before = state.allocations.len();
        state
            .allocations
            .retain(|_, owner| owner.as_str() != container_id);
        if state.allocations.len() != before {
            atomic_write_json(&self.path, &*state)?;
        }
        Ok(())
    }

    /// Address currently held by a container, if any.
    pub fn lookup(&self, container_id: &str) -> Option<Ipv4Addr> {
        self.state
            .lock()
            .allocations
            .iter()
            .find(|(_, owner)| owner.as_str() == container_id)
            .map(|(ip, _)| *ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_pool() -> (tempfile::TempDir, IpamPool) {
        let dir = tempdir().unwrap();
        let layout = FilesystemLayout::new(dir.path().to_path_buf());
        layout.prepare().unwrap();
        let subnet: Ipv4Net = "10.88.0.0/24".parse().unwrap();
        let pool = IpamPool::open(&layout, "servin0", subnet).unwrap();
        (dir, pool)
    }

    #[test]
    fn test_allocation_is_lowest_first() {
        let (_dir, pool) = test_pool();
        assert_eq!(pool.gateway(), "10.88.0.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(
            pool.allocate("c1").unwrap(),
            "10.88.0.2".parse::<Ipv4Addr>().unwrap()
        );
        assert_eq!(
            pool.allocate("c2").unwrap(),
            "10.88.0.3".parse::<Ipv4Addr>().unwrap()
        );
    }

    #[test]
    fn test_no_two_containers_share_an_ip() {
        let (_dir, pool) = test_pool();
        let a = pool.allocate("c1").unwrap();
        let b = pool.allocate("c2").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_release_returns_address_to_pool() {
        let (_dir, pool) = test_pool();
        let first = pool.allocate("c1").unwrap();
        pool.allocate("c2").unwrap();
        pool.release("c1").unwrap();
        // The freed address is the lowest again.
        assert_eq!(pool.allocate("c3").unwrap(), first);
    }

    #[test]
    fn test_allocate_is_idempotent_per_container() {
        let (_dir, pool) = test_pool();
        let a = pool.allocate("c1").unwrap();
        assert_eq!(pool.allocate("c1").unwrap(), a);
        assert_eq!(pool.lookup("c1"), Some(a));
    }

    #[test]
    fn test_pool_state_survives_reopen() {
        let dir = tempdir().unwrap();
        let layout = FilesystemLayout::new(dir.path().to_path_buf());
        layout.prepare().unwrap();
        let subnet: Ipv4Net = "10.88.0.0/24".parse().unwrap();

        let first;
        {
            let pool = IpamPool::open(&layout, "servin0", subnet).unwrap();
            first = pool.allocate("c1").unwrap();
        }
        let pool = IpamPool::open(&layout, "servin0", subnet).unwrap();
        assert_eq!(pool.lookup("c1"), Some(first));
        assert_ne!(pool.allocate("c2").unwrap(), first);
    }
}
