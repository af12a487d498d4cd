//! Resource Pool Allocation
//!
//! Hands out the next free identifier from a bounded space. Index 0 of
//! every space belongs to the server; allocation starts at index 1 and
//! always continues one past the highest value in use. Values freed below
//! the maximum are not reclaimed.

use crate::profile::Slot;
use crate::store::{ProfileStore, StoreError};
use ipnetwork::IpNetwork;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use thiserror::Error;

/// Pool errors
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool exhausted ({capacity} values)")]
    Exhausted { capacity: u64 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Space of allocatable values
#[derive(Debug, Clone)]
pub enum PoolSpace {
    /// Usable host addresses of a network
    Addresses(IpNetwork),
    /// `<prefix>1` .. `<prefix><limit>`
    Names { prefix: String, limit: u64 },
}

impl PoolSpace {
    /// Number of indices, including the reserved index 0
    pub fn capacity(&self) -> u64 {
        match self {
            PoolSpace::Addresses(net) => host_range(net).1,
            PoolSpace::Names { limit, .. } => limit.saturating_add(1),
        }
    }

    /// Value at `index`
    pub fn value_at(&self, index: u64) -> Option<Slot> {
        if index >= self.capacity() {
            return None;
        }
        match self {
            PoolSpace::Addresses(net) => {
                let (first, _) = host_range(net);
                let offset = u128::from(index);
                let addr = match net {
                    IpNetwork::V4(_) => IpAddr::V4(Ipv4Addr::from((first + offset) as u32)),
                    IpNetwork::V6(_) => IpAddr::V6(Ipv6Addr::from(first + offset)),
                };
                Some(Slot::Address(addr))
            }
            PoolSpace::Names { prefix, .. } => Some(Slot::Name(format!("{prefix}{index}"))),
        }
    }

    /// Index of `slot`, or `None` if it lies outside this space
    pub fn index_of(&self, slot: &Slot) -> Option<u64> {
        let index = match (self, slot) {
            (PoolSpace::Addresses(net), Slot::Address(addr)) => {
                if !net.contains(*addr) {
                    return None;
                }
                let (first, _) = host_range(net);
                let value = match addr {
                    IpAddr::V4(v4) => u128::from(u32::from(*v4)),
                    IpAddr::V6(v6) => u128::from(*v6),
                };
                u64::try_from(value.checked_sub(first)?).ok()?
            }
            (PoolSpace::Names { prefix, .. }, Slot::Name(name)) => {
                let digits = name.strip_prefix(prefix.as_str())?;
                let index: u64 = digits.parse().ok()?;
                if index.to_string() != digits {
                    return None;
                }
                index
            }
            _ => return None,
        };
        (index < self.capacity()).then_some(index)
    }
}

/// First usable host (as an integer) and number of usable hosts.
fn host_range(net: &IpNetwork) -> (u128, u64) {
    match net {
        IpNetwork::V4(v4) => {
            let base = u128::from(u32::from(v4.network()));
            let size = 1u128 << (32 - u32::from(v4.prefix()));
            if v4.prefix() >= 31 {
                (base, size as u64)
            } else {
                // network and broadcast addresses are not hosts
                (base + 1, (size - 2) as u64)
            }
        }
        IpNetwork::V6(v6) => {
            let base = u128::from(v6.network());
            let bits = 128 - u32::from(v6.prefix());
            let size = if bits >= 64 { u128::from(u64::MAX) } else { 1u128 << bits };
            if v6.prefix() >= 127 {
                (base, size as u64)
            } else {
                (base + 1, (size - 1) as u64)
            }
        }
    }
}

/// Resource pool for one deployment
///
/// Values are "taken" when held by a stored profile or by a live
/// [`Lease`]. The next value is computed under the lease lock so two
/// concurrent creates can never pick the same candidate.
#[derive(Clone)]
pub struct ResourcePool {
    space: PoolSpace,
    leased: Arc<Mutex<BTreeSet<u64>>>,
}

impl ResourcePool {
    pub fn new(space: PoolSpace) -> Self {
        Self {
            space,
            leased: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Reserve the next value after the highest one in use.
    pub fn allocate(&self, store: &ProfileStore) -> Result<Lease, PoolError> {
        let mut leased = self.leased.lock();

        let stored_max = store
            .slots()?
            .iter()
            .filter_map(|slot| self.space.index_of(slot))
            .max();
        let leased_max = leased.iter().next_back().copied();

        let candidate = match stored_max.max(leased_max) {
            Some(max) => max.saturating_add(1),
            None => 1,
        };
        let capacity = self.space.capacity();
        let value = self
            .space
            .value_at(candidate)
            .ok_or(PoolError::Exhausted { capacity })?;

        leased.insert(candidate);
        tracing::debug!(index = candidate, value = %value, "Leased pool value");

        Ok(Lease {
            value,
            index: candidate,
            leased: Arc::clone(&self.leased),
        })
    }

    /// Number of values currently reserved but not yet released
    pub fn leased(&self) -> usize {
        self.leased.lock().len()
    }
}

/// Reservation of one pool value; released on drop.
#[derive(Debug)]
pub struct Lease {
    value: Slot,
    index: u64,
    leased: Arc<Mutex<BTreeSet<u64>>>,
}

impl Lease {
    pub fn value(&self) -> &Slot {
        &self.value
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.leased.lock().remove(&self.index);
    }
}
