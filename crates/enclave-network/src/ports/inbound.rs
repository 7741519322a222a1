//! # Inbound Ports
//!
//! API the runtime backend, instruction layer and transport call into.

use crate::algorithms::{ConnectionOverrides, PartitionMembership, PartitionTopology};
use crate::domain::{
    AddServiceOutcome, Blocklist, EnclaveNetworkError, EnclaveStatus, EnforcementReport,
    PartitionConnection, PartitionConnectionId, PartitionId, RemoveServiceOutcome, ServiceId,
    ServiceIdSet, ServiceRegistration, TopologyError,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Caller-supplied deadline and cancellation for one mutating operation.
///
/// Both only bound the enforcement phase; a committed topology change is
/// never rolled back because enforcement was cut short.
#[derive(Clone, Debug, Default)]
pub struct OperationContext {
    /// Budget for the whole enforcement phase, measured from its start.
    pub deadline: Option<Duration>,
    /// Abandons in-flight sidecar updates when triggered.
    pub cancel: CancellationToken,
}

impl OperationContext {
    /// No deadline, never cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the enforcement deadline.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Use an existing cancellation token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Fully resolved arguments for a repartition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RepartitionRequest {
    /// Partition ID to member services.
    pub membership: PartitionMembership,
    /// Explicit pairwise connections, in any order.
    pub connections: Vec<(PartitionId, PartitionId, PartitionConnection)>,
    /// Fallback for pairs without an entry.
    pub default_connection: PartitionConnection,
}

impl RepartitionRequest {
    /// Empty request with the given fallback connection.
    pub fn new(default_connection: PartitionConnection) -> Self {
        Self {
            membership: PartitionMembership::new(),
            connections: Vec::new(),
            default_connection,
        }
    }

    /// Add a partition with its members.
    pub fn partition<I, S>(mut self, id: impl Into<PartitionId>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ServiceId>,
    {
        self.membership
            .insert(id.into(), members.into_iter().map(Into::<ServiceId>::into).collect());
        self
    }

    /// Add an explicit connection between two partitions.
    pub fn connection(
        mut self,
        a: impl Into<PartitionId>,
        b: impl Into<PartitionId>,
        connection: PartitionConnection,
    ) -> Self {
        self.connections.push((a.into(), b.into(), connection));
        self
    }

    /// Canonicalize connection pairs. Later entries for the same pair win.
    pub fn connection_overrides(&self) -> Result<ConnectionOverrides, TopologyError> {
        let mut overrides = ConnectionOverrides::new();
        for (a, b, connection) in &self.connections {
            let key = PartitionConnectionId::new(a.clone(), b.clone())
                .ok_or_else(|| TopologyError::SelfConnection(a.clone()))?;
            overrides.insert(key, *connection);
        }
        Ok(overrides)
    }
}

/// One mutating request to the enclave network.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetworkCommand {
    /// Register a service, optionally into an existing partition.
    AddService {
        /// Service to add
        service_id: ServiceId,
        /// Target partition; the default partition when `None`
        partition: Option<PartitionId>,
    },
    /// Deregister a service.
    RemoveService {
        /// Service to remove
        service_id: ServiceId,
    },
    /// Replace the whole partition configuration.
    Repartition(RepartitionRequest),
    /// Create an empty partition.
    CreatePartition {
        /// New partition
        partition: PartitionId,
    },
    /// Move one service to another partition.
    MoveService {
        /// Service to move
        service_id: ServiceId,
        /// Destination partition
        partition: PartitionId,
    },
    /// Set the connection between two partitions.
    SetPartitionConnection {
        /// One side
        a: PartitionId,
        /// Other side
        b: PartitionId,
        /// Connectivity to store
        connection: PartitionConnection,
    },
    /// Change the fallback connection.
    SetDefaultConnection {
        /// New fallback
        connection: PartitionConnection,
    },
    /// Push blocklists again without touching topology.
    ReapplyEnforcement {
        /// Restrict to these services; all when `None`
        only: Option<ServiceIdSet>,
    },
}

impl NetworkCommand {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::AddService { .. } => "add_service",
            Self::RemoveService { .. } => "remove_service",
            Self::Repartition(_) => "repartition",
            Self::CreatePartition { .. } => "create_partition",
            Self::MoveService { .. } => "move_service",
            Self::SetPartitionConnection { .. } => "set_partition_connection",
            Self::SetDefaultConnection { .. } => "set_default_connection",
            Self::ReapplyEnforcement { .. } => "reapply_enforcement",
        }
    }
}

/// Result of a successfully executed [`NetworkCommand`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Service registered.
    ServiceAdded(AddServiceOutcome),
    /// Service deregistered.
    ServiceRemoved(RemoveServiceOutcome),
    /// Topology changed (or enforcement reapplied) and pushed.
    Enforced(EnforcementReport),
    /// Topology changed without touching sidecars.
    Applied,
}

impl CommandOutcome {
    /// Enforcement report carried by the outcome, if any.
    pub fn enforcement(&self) -> Option<&EnforcementReport> {
        match self {
            Self::ServiceAdded(outcome) => Some(&outcome.enforcement),
            Self::ServiceRemoved(outcome) => Some(&outcome.enforcement),
            Self::Enforced(report) => Some(report),
            Self::Applied => None,
        }
    }
}

/// Result of [`NetworkCommand`] batch execution.
///
/// Commands run in order; the first authoritative error stops the batch.
/// Enforcement failures are not authoritative and never stop it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Outcomes of the commands that succeeded, in order.
    pub completed: Vec<CommandOutcome>,
    /// Index and error of the command that stopped the batch.
    pub failed: Option<(usize, EnclaveNetworkError)>,
}

impl BatchOutcome {
    /// True if every command succeeded.
    pub fn is_success(&self) -> bool {
        self.failed.is_none()
    }
}

/// Enclave network API - inbound port.
///
/// Mutations are serialized per enclave; queries may run concurrently with
/// each other and observe the last committed state.
#[async_trait]
pub trait EnclaveNetworkApi: Send + Sync {
    /// Register a service and push updated blocklists to every sidecar.
    async fn add_service(
        &self,
        service_id: ServiceId,
        partition: Option<PartitionId>,
        ctx: &OperationContext,
    ) -> Result<AddServiceOutcome, EnclaveNetworkError>;

    /// Deregister a service, push to the remaining sidecars, then release
    /// its address.
    async fn remove_service(
        &self,
        service_id: &ServiceId,
        ctx: &OperationContext,
    ) -> Result<RemoveServiceOutcome, EnclaveNetworkError>;

    /// Atomically replace the partition configuration and push to every
    /// sidecar.
    async fn repartition(
        &self,
        request: RepartitionRequest,
        ctx: &OperationContext,
    ) -> Result<EnforcementReport, EnclaveNetworkError>;

    /// Recompute from the committed topology and push again.
    async fn reapply_enforcement(
        &self,
        only: Option<&ServiceIdSet>,
        ctx: &OperationContext,
    ) -> Result<EnforcementReport, EnclaveNetworkError>;

    /// Active registration.
    fn service(&self, service_id: &ServiceId) -> Result<ServiceRegistration, EnclaveNetworkError>;

    /// IDs of every active service.
    fn service_ids(&self) -> ServiceIdSet;

    /// Leased address of an active service.
    fn service_ip(&self, service_id: &ServiceId) -> Result<Ipv4Addr, EnclaveNetworkError>;

    /// Partition of an active service.
    fn partition_of(&self, service_id: &ServiceId) -> Result<PartitionId, EnclaveNetworkError>;

    /// Copy of the committed topology.
    fn topology_snapshot(&self) -> PartitionTopology;

    /// Blocklists derived from the committed topology.
    fn blocklists(&self) -> Result<HashMap<ServiceId, Blocklist>, EnclaveNetworkError>;

    /// Enclave lifecycle state.
    fn status(&self) -> EnclaveStatus;
}
