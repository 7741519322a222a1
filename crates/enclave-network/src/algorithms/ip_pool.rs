//! # IP Address Pool
//!
//! Hands out host addresses from the enclave subnet, lowest free first.
//!
//! The network and broadcast addresses are never issued, and addresses
//! reserved at construction (gateway, API container, ...) stay taken for the
//! pool's whole lifetime. Releasing an address that is not currently issued is
//! reported as an error so that double frees surface as bugs.

use crate::domain::{invariant_usable_host, IpPoolError};
use ipnet::Ipv4Net;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct PoolState {
    /// Addresses handed out and not yet released.
    issued: BTreeSet<Ipv4Addr>,
}

/// Thread-safe allocator over one IPv4 subnet.
#[derive(Debug)]
pub struct IpAddressPool {
    subnet: Ipv4Net,
    /// Pre-taken addresses; never issued, never released.
    reserved: BTreeSet<Ipv4Addr>,
    state: Mutex<PoolState>,
}

impl IpAddressPool {
    /// Create a pool over `subnet` with `reserved` addresses pre-taken.
    ///
    /// Reserved addresses must lie inside the subnet; reserving the network or
    /// broadcast address is accepted and has no effect.
    pub fn new<I>(subnet: Ipv4Net, reserved: I) -> Result<Self, IpPoolError>
    where
        I: IntoIterator<Item = Ipv4Addr>,
    {
        let subnet = subnet.trunc();
        if subnet.prefix_len() >= 31 {
            return Err(IpPoolError::SubnetTooSmall(subnet));
        }

        let mut reserved_set = BTreeSet::new();
        for ip in reserved {
            if !subnet.contains(&ip) {
                return Err(IpPoolError::OutOfRange { ip, subnet });
            }
            if invariant_usable_host(ip, &subnet) {
                reserved_set.insert(ip);
            }
        }

        debug!(
            "[enclave-net] IP pool over {} with {} reserved address(es)",
            subnet,
            reserved_set.len()
        );

        Ok(Self {
            subnet,
            reserved: reserved_set,
            state: Mutex::new(PoolState::default()),
        })
    }

    /// Take the lowest free host address.
    pub fn allocate(&self) -> Result<Ipv4Addr, IpPoolError> {
        let mut state = self.state.lock();
        let free = self
            .subnet
            .hosts()
            .find(|ip| !self.reserved.contains(ip) && !state.issued.contains(ip));

        match free {
            Some(ip) => {
                state.issued.insert(ip);
                debug!("[enclave-net] Allocated {} from {}", ip, self.subnet);
                Ok(ip)
            }
            None => {
                warn!("[enclave-net] IP pool {} exhausted", self.subnet);
                Err(IpPoolError::Exhausted {
                    subnet: self.subnet,
                })
            }
        }
    }

    /// Return a previously allocated address to the pool.
    pub fn release(&self, ip: Ipv4Addr) -> Result<(), IpPoolError> {
        if !self.subnet.contains(&ip) {
            return Err(IpPoolError::OutOfRange {
                ip,
                subnet: self.subnet,
            });
        }

        let mut state = self.state.lock();
        if !state.issued.remove(&ip) {
            warn!("[enclave-net] Release of {} which is not allocated", ip);
            return Err(IpPoolError::NotAllocated(ip));
        }
        debug!("[enclave-net] Released {} back to {}", ip, self.subnet);
        Ok(())
    }

    /// True if the address is reserved or currently issued.
    pub fn is_taken(&self, ip: Ipv4Addr) -> bool {
        self.reserved.contains(&ip) || self.state.lock().issued.contains(&ip)
    }

    /// Addresses currently issued (reserved ones excluded).
    pub fn allocated(&self) -> BTreeSet<Ipv4Addr> {
        self.state.lock().issued.clone()
    }

    /// Number of addresses this pool can ever issue at once.
    pub fn capacity(&self) -> usize {
        self.subnet.hosts().count() - self.reserved.len()
    }

    /// Subnet the pool allocates from.
    pub fn subnet(&self) -> Ipv4Net {
        self.subnet
    }
}
