//! # Partition Topology
//!
//! In-memory model of partitions, their members and pairwise connectivity.
//!
//! ## Invariants
//!
//! - A service belongs to exactly one partition; `move_service` is the only
//!   way to change which one.
//! - The default partition always exists.
//! - Connection overrides are keyed by [`PartitionConnectionId`], so lookups
//!   are symmetric, and never reference a partition that no longer exists.
//! - An override equal to the default connection is not stored.
//!
//! Partitions must be created before services can be moved into them.

use crate::domain::{
    invariant_exact_coverage, PartitionConnection, PartitionConnectionId, PartitionId, ServiceId,
    ServiceIdSet, TopologyError,
};
use std::collections::HashMap;
use tracing::debug;

/// Proposed membership for a bulk repartition.
pub type PartitionMembership = HashMap<PartitionId, ServiceIdSet>;

/// Proposed connection overrides for a bulk repartition.
pub type ConnectionOverrides = HashMap<PartitionConnectionId, PartitionConnection>;

/// Partition graph of one enclave.
///
/// Cheap to clone; a clone is a full snapshot that compares equal to the
/// original until either is mutated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionTopology {
    default_partition: PartitionId,
    default_connection: PartitionConnection,
    partition_services: HashMap<PartitionId, ServiceIdSet>,
    service_partitions: HashMap<ServiceId, PartitionId>,
    connections: ConnectionOverrides,
}

impl PartitionTopology {
    /// Create a topology containing only the (empty) default partition.
    pub fn new(default_partition: PartitionId, default_connection: PartitionConnection) -> Self {
        let mut partition_services = HashMap::new();
        partition_services.insert(default_partition.clone(), ServiceIdSet::new());
        Self {
            default_partition,
            default_connection,
            partition_services,
            service_partitions: HashMap::new(),
            connections: HashMap::new(),
        }
    }

    /// Partition new services are placed in.
    pub fn default_partition(&self) -> &PartitionId {
        &self.default_partition
    }

    /// Connectivity for pairs without an override.
    pub fn default_connection(&self) -> PartitionConnection {
        self.default_connection
    }

    /// Create an empty partition.
    pub fn create_partition(&mut self, id: PartitionId) -> Result<(), TopologyError> {
        if self.partition_services.contains_key(&id) {
            return Err(TopologyError::PartitionAlreadyExists(id));
        }
        debug!("[enclave-net] Created partition '{}'", id);
        self.partition_services.insert(id, ServiceIdSet::new());
        Ok(())
    }

    /// Delete an empty, non-default partition and its overrides.
    pub fn delete_partition(&mut self, id: &PartitionId) -> Result<(), TopologyError> {
        if id == &self.default_partition {
            return Err(TopologyError::DefaultPartitionUndeletable(id.clone()));
        }
        let members = self
            .partition_services
            .get(id)
            .ok_or_else(|| TopologyError::UnknownPartition(id.clone()))?;
        if !members.is_empty() {
            return Err(TopologyError::PartitionNotEmpty {
                partition: id.clone(),
                members: members.len(),
            });
        }
        self.partition_services.remove(id);
        self.prune_stale_connections();
        debug!("[enclave-net] Deleted partition '{}'", id);
        Ok(())
    }

    /// Place a service that is not yet tracked into `partition`.
    pub fn add_service(
        &mut self,
        service: ServiceId,
        partition: &PartitionId,
    ) -> Result<(), TopologyError> {
        if let Some(existing) = self.service_partitions.get(&service) {
            return Err(TopologyError::ServiceAlreadyAssigned {
                service,
                partition: existing.clone(),
            });
        }
        let members = self
            .partition_services
            .get_mut(partition)
            .ok_or_else(|| TopologyError::UnknownPartition(partition.clone()))?;
        members.add(service.clone());
        self.service_partitions.insert(service, partition.clone());
        Ok(())
    }

    /// Stop tracking a service. Returns the partition it was in, or `None`
    /// if it was not tracked.
    pub fn remove_service(&mut self, service: &ServiceId) -> Option<PartitionId> {
        let partition = self.service_partitions.remove(service)?;
        if let Some(members) = self.partition_services.get_mut(&partition) {
            members.remove(service);
        }
        Some(partition)
    }

    /// Move a tracked service to `destination`.
    pub fn move_service(
        &mut self,
        service: &ServiceId,
        destination: &PartitionId,
    ) -> Result<(), TopologyError> {
        let source = self
            .service_partitions
            .get(service)
            .cloned()
            .ok_or_else(|| TopologyError::UnknownService(service.clone()))?;
        if !self.partition_services.contains_key(destination) {
            return Err(TopologyError::UnknownPartition(destination.clone()));
        }
        if &source == destination {
            return Ok(());
        }

        // Both checks passed; the two set updates below cannot fail.
        if let Some(members) = self.partition_services.get_mut(&source) {
            members.remove(service);
        }
        if let Some(members) = self.partition_services.get_mut(destination) {
            members.add(service.clone());
        }
        self.service_partitions
            .insert(service.clone(), destination.clone());

        debug!(
            "[enclave-net] Moved service '{}' from '{}' to '{}'",
            service, source, destination
        );
        Ok(())
    }

    /// Store the connection between two partitions.
    pub fn set_partition_connection(
        &mut self,
        a: &PartitionId,
        b: &PartitionId,
        connection: PartitionConnection,
    ) -> Result<(), TopologyError> {
        let key = self.connection_key(a, b)?;
        if connection == self.default_connection {
            self.connections.remove(&key);
        } else {
            self.connections.insert(key, connection);
        }
        Ok(())
    }

    /// Drop the override between two partitions, if any.
    pub fn unset_partition_connection(
        &mut self,
        a: &PartitionId,
        b: &PartitionId,
    ) -> Result<(), TopologyError> {
        let key = self.connection_key(a, b)?;
        self.connections.remove(&key);
        Ok(())
    }

    /// Change the fallback connection. Existing overrides are kept.
    pub fn set_default_connection(&mut self, connection: PartitionConnection) {
        self.default_connection = connection;
    }

    /// Connectivity between two partitions: the override if present, else
    /// the default. A partition is always connected to itself.
    pub fn effective_connection(
        &self,
        a: &PartitionId,
        b: &PartitionId,
    ) -> Result<PartitionConnection, TopologyError> {
        self.ensure_partition(a)?;
        self.ensure_partition(b)?;
        Ok(match PartitionConnectionId::new(a.clone(), b.clone()) {
            None => PartitionConnection::CONNECTED,
            Some(key) => self
                .connections
                .get(&key)
                .copied()
                .unwrap_or(self.default_connection),
        })
    }

    /// Atomically replace membership, overrides and default connection.
    ///
    /// Every service in `registered` must appear in exactly one partition of
    /// `membership`; no other service may appear. Overrides may only name
    /// partitions present in `membership`. On any violation nothing changes.
    /// The default partition is kept (empty) if `membership` omits it.
    pub fn replace_topology(
        &mut self,
        membership: PartitionMembership,
        connections: ConnectionOverrides,
        default_connection: PartitionConnection,
        registered: &ServiceIdSet,
    ) -> Result<(), TopologyError> {
        if membership.is_empty() {
            return Err(TopologyError::NoPartitions);
        }
        invariant_exact_coverage(&membership, registered)?;
        for key in connections.keys() {
            for side in [key.first(), key.second()] {
                if !membership.contains_key(side) {
                    return Err(TopologyError::UnknownPartition(side.clone()));
                }
            }
        }

        let mut partition_services = membership;
        partition_services
            .entry(self.default_partition.clone())
            .or_default();

        let service_partitions = partition_services
            .iter()
            .flat_map(|(partition, members)| {
                members
                    .iter()
                    .map(move |service| (service.clone(), partition.clone()))
            })
            .collect();

        let connections = connections
            .into_iter()
            .filter(|(_, c)| *c != default_connection)
            .collect();

        self.partition_services = partition_services;
        self.service_partitions = service_partitions;
        self.connections = connections;
        self.default_connection = default_connection;

        debug!(
            "[enclave-net] Topology replaced: {} partition(s), {} override(s)",
            self.partition_services.len(),
            self.connections.len()
        );
        Ok(())
    }

    /// Partition a service belongs to.
    pub fn partition_of(&self, service: &ServiceId) -> Option<&PartitionId> {
        self.service_partitions.get(service)
    }

    /// Members of a partition.
    pub fn members(&self, partition: &PartitionId) -> Option<&ServiceIdSet> {
        self.partition_services.get(partition)
    }

    /// True if the partition exists.
    pub fn has_partition(&self, partition: &PartitionId) -> bool {
        self.partition_services.contains_key(partition)
    }

    /// All partitions with their members.
    pub fn partitions(&self) -> impl Iterator<Item = (&PartitionId, &ServiceIdSet)> {
        self.partition_services.iter()
    }

    /// Partition IDs, sorted.
    pub fn partition_ids(&self) -> Vec<PartitionId> {
        let mut ids: Vec<_> = self.partition_services.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stored overrides.
    pub fn connection_overrides(&self) -> &ConnectionOverrides {
        &self.connections
    }

    /// Every tracked service.
    pub fn services(&self) -> ServiceIdSet {
        self.service_partitions.keys().cloned().collect()
    }

    fn ensure_partition(&self, id: &PartitionId) -> Result<(), TopologyError> {
        if self.partition_services.contains_key(id) {
            Ok(())
        } else {
            Err(TopologyError::UnknownPartition(id.clone()))
        }
    }

    fn connection_key(
        &self,
        a: &PartitionId,
        b: &PartitionId,
    ) -> Result<PartitionConnectionId, TopologyError> {
        self.ensure_partition(a)?;
        self.ensure_partition(b)?;
        PartitionConnectionId::new(a.clone(), b.clone())
            .ok_or_else(|| TopologyError::SelfConnection(a.clone()))
    }

    fn prune_stale_connections(&mut self) {
        let partitions = &self.partition_services;
        self.connections.retain(|key, _| {
            partitions.contains_key(key.first()) && partitions.contains_key(key.second())
        });
    }
}
