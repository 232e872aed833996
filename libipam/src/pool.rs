use std::collections::BTreeMap;
use std::fs::File;
use std::net::Ipv4Addr;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use ipnetwork::Ipv4Network;
use log::{debug, info, warn};
use nix::fcntl::Flock;
use serde::{Deserialize, Serialize};

use crate::bitmap::Bitmap;
use crate::disk::{FileLockExt, Store};
use crate::error::PoolError;
use crate::range::AddressRange;

/// Everything that is persisted for one pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolState {
    pub pool_name: String,
    pub cidr_range: String,
    pub gateway: Ipv4Addr,
    pub path: PathBuf,
    pub total_ips: usize,
    /// Highest slot handed out by a forward scan that is still in use.
    pub last_allocated_ip: Option<usize>,
    pub allocation: Bitmap,
    /// `<containerId>/<ifname>` -> address
    #[serde(default)]
    pub owners: BTreeMap<String, Ipv4Addr>,
}

impl PoolState {
    fn fresh(name: &str, range: &AddressRange, path: &Path) -> Self {
        let total = range.total();
        PoolState {
            pool_name: name.to_string(),
            cidr_range: range.subnet().to_string(),
            gateway: range.gateway(),
            path: path.to_path_buf(),
            total_ips: total,
            last_allocated_ip: None,
            allocation: Bitmap::new(total),
            owners: BTreeMap::new(),
        }
    }

    /// Reverse scan from the high-water mark first, so slots freed below it
    /// are reused before the mark moves; a reverse hit leaves the mark alone.
    fn claim(&mut self) -> Option<usize> {
        if let Some(last) = self.last_allocated_ip {
            let upper = last.min(self.total_ips.saturating_sub(1));
            if let Some(index) = (0..=upper).rev().find(|&i| !self.allocation.get(i)) {
                self.allocation.set(index);
                return Some(index);
            }
        }

        let start = self.last_allocated_ip.map_or(0, |last| last + 1);
        let index = (start..self.total_ips).find(|&i| !self.allocation.get(i))?;
        self.allocation.set(index);
        self.last_allocated_ip = Some(index);
        Some(index)
    }

    fn unclaim(&mut self, index: usize) {
        self.allocation.clear(index);
        if self.last_allocated_ip == Some(index) {
            self.last_allocated_ip = (0..index).rev().find(|&i| self.allocation.get(i));
        }
    }

    fn check(&self, path: &Path) -> Result<(), PoolError> {
        let corrupt = |reason: String| PoolError::Corrupt {
            path: path.to_path_buf(),
            reason,
        };
        if self.allocation.len() != self.total_ips {
            return Err(corrupt(format!(
                "bitmap has {} slots, total_ips is {}",
                self.allocation.len(),
                self.total_ips
            )));
        }
        if let Some(last) = self.last_allocated_ip
            && last >= self.total_ips
        {
            return Err(corrupt(format!(
                "last_allocated_ip {last} is outside {} slots",
                self.total_ips
            )));
        }
        Ok(())
    }

    /// Drops owner records that do not point at an allocated slot. Keeping
    /// them would make every later release of that owner fail.
    fn prune_owners(&mut self, range: &AddressRange) {
        let allocation = &self.allocation;
        let pool = &self.pool_name;
        self.owners.retain(|owner, address| {
            let held = range.index(*address).is_some_and(|i| allocation.get(i));
            if !held {
                warn!("pool {pool}: dropping stale record {owner} -> {address}");
            }
            held
        });
    }
}

/// Bitmap allocator over one IPv4 subnet.
///
/// The in-memory state is guarded by a mutex, which only orders callers
/// inside this process. Use [`AddressPool::lock`] around every
/// load-mutate-save sequence to exclude other plugin processes.
#[derive(Debug)]
pub struct AddressPool {
    range: AddressRange,
    store: Store,
    state: Mutex<PoolState>,
}

impl AddressPool {
    /// Builds an all-free pool. The gateway defaults to the first host of
    /// `cidr`; override it with [`AddressPool::with_gateway`].
    pub fn new(
        pool_name: &str,
        cidr: &str,
        storage_path: impl AsRef<Path>,
    ) -> Result<Self, PoolError> {
        if pool_name.is_empty() || cidr.is_empty() || storage_path.as_ref().as_os_str().is_empty()
        {
            return Err(PoolError::Configuration(
                "pool name, CIDR range and storage path cannot be empty".to_string(),
            ));
        }
        let subnet: Ipv4Network = cidr
            .parse()
            .map_err(|e| PoolError::Configuration(format!("invalid CIDR range {cidr}: {e}")))?;
        let range = AddressRange::new(subnet, None)?;
        Self::build(pool_name, range, storage_path.as_ref())
    }

    pub fn with_gateway(self, gateway: Ipv4Addr) -> Result<Self, PoolError> {
        let range = AddressRange::new(self.range.subnet(), Some(gateway))?;
        let name = self.state().pool_name.clone();
        Self::build(&name, range, self.store.dir())
    }

    fn build(pool_name: &str, range: AddressRange, storage_path: &Path) -> Result<Self, PoolError> {
        let store = Store::new(storage_path, pool_name)?;
        let state = PoolState::fresh(pool_name, &range, storage_path);
        Ok(AddressPool {
            range,
            store,
            state: Mutex::new(state),
        })
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> String {
        self.state().pool_name.clone()
    }

    pub fn range(&self) -> &AddressRange {
        &self.range
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn total_addresses(&self) -> usize {
        self.range.total()
    }

    pub fn last_allocated_index(&self) -> Option<usize> {
        self.state().last_allocated_ip
    }

    pub fn allocated_count(&self) -> usize {
        self.state().allocation.count_ones()
    }

    pub fn snapshot(&self) -> PoolState {
        self.state().clone()
    }

    pub fn is_allocated(&self, address: Ipv4Addr) -> bool {
        self.range
            .index(address)
            .is_some_and(|i| self.state().allocation.get(i))
    }

    pub fn allocate(&self) -> Result<Ipv4Addr, PoolError> {
        let mut state = self.state();
        self.claim_in(&mut state)
    }

    fn claim_in(&self, state: &mut PoolState) -> Result<Ipv4Addr, PoolError> {
        let index = state
            .claim()
            .ok_or_else(|| PoolError::Exhausted(state.pool_name.clone()))?;
        let address = self
            .range
            .address(index)
            .ok_or_else(|| PoolError::Exhausted(state.pool_name.clone()))?;
        debug!(
            "pool {}: allocated {address} (slot {index}, high-water {:?})",
            state.pool_name, state.last_allocated_ip
        );
        Ok(address)
    }

    pub fn release(&self, address: Ipv4Addr) -> Result<(), PoolError> {
        let mut state = self.state();
        self.release_in(&mut state, address)
    }

    fn release_in(&self, state: &mut PoolState, address: Ipv4Addr) -> Result<(), PoolError> {
        let released = self.range.index(address).filter(|&i| state.allocation.get(i));
        let Some(index) = released else {
            return Err(PoolError::NotAllocated {
                pool: state.pool_name.clone(),
                address,
            });
        };
        state.unclaim(index);
        state.owners.retain(|_, owned| *owned != address);
        debug!(
            "pool {}: released {address} (slot {index}, high-water {:?})",
            state.pool_name, state.last_allocated_ip
        );
        Ok(())
    }

    /// Allocates an address and records `owner` as its holder. An owner
    /// holds at most one address per pool.
    pub fn allocate_for(&self, owner: &str) -> Result<Ipv4Addr, PoolError> {
        let mut state = self.state();
        if let Some(&address) = state.owners.get(owner) {
            return Err(PoolError::AlreadyAllocated {
                pool: state.pool_name.clone(),
                owner: owner.to_string(),
                address,
            });
        }
        let address = self.claim_in(&mut state)?;
        state.owners.insert(owner.to_string(), address);
        Ok(address)
    }

    /// Releases whatever `owner` holds. Returns `None` when the owner has
    /// no recorded address.
    pub fn release_for(&self, owner: &str) -> Result<Option<Ipv4Addr>, PoolError> {
        let mut state = self.state();
        let Some(address) = state.owners.get(owner).copied() else {
            return Ok(None);
        };
        self.release_in(&mut state, address)?;
        Ok(Some(address))
    }

    pub fn address_of(&self, owner: &str) -> Option<Ipv4Addr> {
        self.state().owners.get(owner).copied()
    }

    pub fn save(&self) -> Result<(), PoolError> {
        let state = self.state();
        self.store.write(&state)
    }

    /// Replaces the in-memory state with the persisted one. A missing file
    /// comes back as a storage error; see [`PoolError::is_missing`].
    pub fn load(&self) -> Result<(), PoolError> {
        let path = self.store.state_path();
        let loaded = self.store.read()?;
        loaded.check(&path)?;

        if loaded.cidr_range != self.range.subnet().to_string()
            || loaded.gateway != self.range.gateway()
        {
            return Err(PoolError::Configuration(format!(
                "pool {} was created for {} via {}, now configured as {} via {}",
                loaded.pool_name,
                loaded.cidr_range,
                loaded.gateway,
                self.range.subnet(),
                self.range.gateway()
            )));
        }
        if loaded.total_ips != self.range.total() {
            return Err(PoolError::Corrupt {
                path,
                reason: format!(
                    "total_ips {} does not match {} for {}",
                    loaded.total_ips,
                    self.range.total(),
                    loaded.cidr_range
                ),
            });
        }

        let mut loaded = loaded;
        loaded.prune_owners(&self.range);
        *self.state() = loaded;
        Ok(())
    }

    /// Takes the cross-process lock and loads the persisted state. A
    /// missing state file means the network is used for the first time and
    /// the pool stays all-free.
    pub fn lock(&self) -> Result<PoolGuard<'_>, PoolError> {
        let lock = self.store.new_lock()?;
        match self.load() {
            Ok(()) => {}
            Err(e) if e.is_missing() => {
                info!(
                    "pool {}: no state at {}, starting empty",
                    self.name(),
                    self.store.state_path().display()
                );
            }
            Err(e) => return Err(e),
        }
        Ok(PoolGuard {
            pool: self,
            _lock: lock,
        })
    }
}

/// Holds the network's file lock. [`PoolGuard::commit`] persists the pool
/// before the lock is released; dropping the guard releases it without
/// saving.
pub struct PoolGuard<'a> {
    pool: &'a AddressPool,
    _lock: Flock<File>,
}

impl PoolGuard<'_> {
    pub fn commit(self) -> Result<(), PoolError> {
        self.pool.save()
    }
}

impl Deref for PoolGuard<'_> {
    type Target = AddressPool;

    fn deref(&self) -> &AddressPool {
        self.pool
    }
}
