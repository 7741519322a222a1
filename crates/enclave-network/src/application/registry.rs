//! # Service Registry
//!
//! Binds each logical service ID to its runtime network identity: GUID,
//! leased IP, partition and lifecycle state.
//!
//! The registry exclusively owns registration records. An IP lease leaves the
//! registry as an [`IpLease`] on deregistration and goes back to the pool only
//! when that token is handed to [`ServiceRegistry::release`], so the address
//! is returned exactly once and the caller decides when.

use crate::algorithms::{IpAddressPool, PartitionTopology};
use crate::domain::{
    PartitionId, RegistryError, ServiceGuid, ServiceId, ServiceIdSet, ServiceRegistration,
    ServiceState,
};
use crate::ports::TimeSource;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info};

/// Address still held by a deregistered service.
///
/// Not `Clone`: consuming it in [`ServiceRegistry::release`] is the only way
/// to give the address back.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "dropping a lease leaks its address until the enclave is destroyed"]
pub struct IpLease {
    service_id: ServiceId,
    guid: ServiceGuid,
    ip: Ipv4Addr,
}

impl IpLease {
    /// Service the address belonged to.
    pub fn service_id(&self) -> &ServiceId {
        &self.service_id
    }

    /// Registration the address belonged to.
    pub fn guid(&self) -> &ServiceGuid {
        &self.guid
    }

    /// The held address.
    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }
}

/// Registry of services in one enclave.
pub struct ServiceRegistry {
    pool: IpAddressPool,
    clock: Arc<dyn TimeSource>,
    default_partition: PartitionId,
    active: HashMap<ServiceId, ServiceRegistration>,
    /// Uncapped; see [`ServiceRegistry::history`].
    history: Vec<ServiceRegistration>,
    last_registered_at: HashMap<ServiceId, u64>,
}

impl ServiceRegistry {
    /// Create an empty registry leasing from `pool`.
    pub fn new(
        pool: IpAddressPool,
        clock: Arc<dyn TimeSource>,
        default_partition: PartitionId,
    ) -> Self {
        Self {
            pool,
            clock,
            default_partition,
            active: HashMap::new(),
            history: Vec::new(),
            last_registered_at: HashMap::new(),
        }
    }

    /// Register a service, leasing it an address.
    ///
    /// `partition` defaults to the default partition; the caller is
    /// responsible for checking that an explicit partition exists.
    pub fn register(
        &mut self,
        service_id: ServiceId,
        partition: Option<PartitionId>,
    ) -> Result<ServiceRegistration, RegistryError> {
        if service_id.is_blank() {
            return Err(RegistryError::InvalidServiceId);
        }
        if self.active.contains_key(&service_id) {
            return Err(RegistryError::DuplicateActiveService(service_id));
        }

        let ip = self.pool.allocate()?;
        let registered_at_ms = self.next_timestamp(&service_id);
        let partition_id = partition.unwrap_or_else(|| self.default_partition.clone());
        let registration =
            ServiceRegistration::new(service_id.clone(), ip, partition_id, registered_at_ms);

        info!(
            service_id = %service_id,
            guid = %registration.guid,
            ip = %ip,
            "[enclave-net] Registered service"
        );
        self.active.insert(service_id, registration.clone());
        Ok(registration)
    }

    /// Transition a registered service to `Running`.
    pub fn mark_running(&mut self, service_id: &ServiceId) -> Result<(), RegistryError> {
        let registration = self
            .active
            .get_mut(service_id)
            .ok_or_else(|| RegistryError::NotFound(service_id.clone()))?;
        if !registration.state.can_transition_to(ServiceState::Running) {
            return Err(RegistryError::InvalidTransition {
                service: service_id.clone(),
                from: registration.state,
                to: ServiceState::Running,
            });
        }
        registration.state = ServiceState::Running;
        debug!("[enclave-net] Service '{}' is running", service_id);
        Ok(())
    }

    /// Mark a service removed and hand back its address lease.
    ///
    /// The address stays taken until the lease is released.
    pub fn deregister(&mut self, service_id: &ServiceId) -> Result<IpLease, RegistryError> {
        let mut registration = self
            .active
            .remove(service_id)
            .ok_or_else(|| RegistryError::NotFound(service_id.clone()))?;
        registration.state = ServiceState::Removed;

        let lease = IpLease {
            service_id: registration.service_id.clone(),
            guid: registration.guid.clone(),
            ip: registration.ip,
        };
        info!(
            service_id = %service_id,
            guid = %registration.guid,
            "[enclave-net] Deregistered service"
        );
        self.history.push(registration);
        Ok(lease)
    }

    /// Return a lease's address to the pool.
    pub fn release(&mut self, lease: IpLease) -> Result<(), RegistryError> {
        self.pool.release(lease.ip)?;
        debug!(
            "[enclave-net] Released {} held by '{}'",
            lease.ip, lease.service_id
        );
        Ok(())
    }

    /// Deregister and release immediately.
    pub fn deregister_and_release(&mut self, service_id: &ServiceId) -> Result<(), RegistryError> {
        let lease = self.deregister(service_id)?;
        self.release(lease)
    }

    /// Deregister every active service and release its address.
    ///
    /// Returns the released addresses.
    pub fn release_all(&mut self) -> Result<Vec<Ipv4Addr>, RegistryError> {
        let ids = self.service_ids().sorted();
        let mut released = Vec::with_capacity(ids.len());
        for service_id in ids {
            let lease = self.deregister(&service_id)?;
            released.push(lease.ip);
            self.release(lease)?;
        }
        Ok(released)
    }

    /// Active registration for `service_id`.
    pub fn lookup(&self, service_id: &ServiceId) -> Result<&ServiceRegistration, RegistryError> {
        self.active
            .get(service_id)
            .ok_or_else(|| RegistryError::NotFound(service_id.clone()))
    }

    /// IDs of every active service.
    pub fn service_ids(&self) -> ServiceIdSet {
        self.active.keys().cloned().collect()
    }

    /// Active service ID to leased address.
    pub fn addresses(&self) -> HashMap<ServiceId, Ipv4Addr> {
        self.active
            .iter()
            .map(|(id, registration)| (id.clone(), registration.ip))
            .collect()
    }

    /// Removed registrations, oldest first.
    ///
    /// Grows for the enclave's lifetime without a cap; an enclave holds at
    /// most a few hundred services, so this stays small.
    pub fn history(&self) -> &[ServiceRegistration] {
        &self.history
    }

    /// Copy each active service's partition from `topology`.
    pub fn sync_partitions(&mut self, topology: &PartitionTopology) {
        for (service_id, registration) in self.active.iter_mut() {
            if let Some(partition) = topology.partition_of(service_id) {
                registration.partition_id = partition.clone();
            }
        }
    }

    /// Number of active services.
    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// True if no service is active.
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// The backing address pool.
    pub fn pool(&self) -> &IpAddressPool {
        &self.pool
    }

    /// Registration timestamps for one service ID strictly increase, so
    /// successive GUIDs never collide even within one millisecond.
    fn next_timestamp(&mut self, service_id: &ServiceId) -> u64 {
        let now = self.clock.now_millis();
        let stamp = match self.last_registered_at.get(service_id) {
            Some(last) if *last >= now => last + 1,
            _ => now,
        };
        self.last_registered_at.insert(service_id.clone(), stamp);
        stamp
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("subnet", &self.pool.subnet())
            .field("active", &self.active.len())
            .field("history", &self.history.len())
            .finish()
    }
}
