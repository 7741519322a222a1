//! # Domain Errors
//!
//! Error types for the enclave network subsystem, grouped by the component
//! that raises them and unified under [`EnclaveNetworkError`].

use super::value_objects::{PartitionId, ServiceId};
use crate::domain::ServiceState;
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Errors raised by the IP address pool.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IpPoolError {
    /// Every usable address in the subnet is taken.
    #[error("No free IP addresses left in {subnet}")]
    Exhausted {
        /// Subnet the pool allocates from
        subnet: Ipv4Net,
    },

    /// Released an address the pool never handed out (or already released).
    #[error("IP address {0} is not currently allocated")]
    NotAllocated(Ipv4Addr),

    /// Address does not belong to the pool's subnet.
    #[error("IP address {ip} is outside subnet {subnet}")]
    OutOfRange {
        /// Offending address
        ip: Ipv4Addr,
        /// Subnet the pool allocates from
        subnet: Ipv4Net,
    },

    /// Subnet has no host addresses once network/broadcast are excluded.
    #[error("Subnet {0} has no usable host addresses")]
    SubnetTooSmall(Ipv4Net),
}

/// Errors raised by the partition topology.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    /// Partition ID already in use.
    #[error("Partition '{0}' already exists")]
    PartitionAlreadyExists(PartitionId),

    /// Partition ID is not part of the topology.
    #[error("Partition '{0}' does not exist")]
    UnknownPartition(PartitionId),

    /// Service is not tracked by the topology.
    #[error("Service '{0}' is not part of the topology")]
    UnknownService(ServiceId),

    /// Service already belongs to a partition.
    #[error("Service '{service}' is already assigned to partition '{partition}'")]
    ServiceAlreadyAssigned {
        /// Service being added
        service: ServiceId,
        /// Its current partition
        partition: PartitionId,
    },

    /// A partition was paired with itself.
    #[error("Partition '{0}' cannot have a connection to itself")]
    SelfConnection(PartitionId),

    /// Repartition left registered services without a partition.
    #[error("All services must be allocated to a partition, but these were not: {}", join_ids(.missing))]
    IncompleteServiceCoverage {
        /// Registered services absent from the proposed membership
        missing: Vec<ServiceId>,
    },

    /// Repartition placed a service in more than one partition.
    #[error("Services assigned to more than one partition: {}", join_ids(.services))]
    DuplicateAssignment {
        /// Services appearing twice
        services: Vec<ServiceId>,
    },

    /// Repartition referenced services that are not registered.
    #[error("Unknown services in partition definitions: {}", join_ids(.services))]
    UnknownServicesInMembership {
        /// Unregistered services
        services: Vec<ServiceId>,
    },

    /// Repartition supplied no partitions at all.
    #[error("Cannot repartition with no partitions")]
    NoPartitions,

    /// The default partition is the home of new services and cannot be removed.
    #[error("The default partition '{0}' cannot be deleted")]
    DefaultPartitionUndeletable(PartitionId),

    /// Only empty partitions may be deleted.
    #[error("Partition '{partition}' still has {members} member(s)")]
    PartitionNotEmpty {
        /// Partition being deleted
        partition: PartitionId,
        /// Remaining member count
        members: usize,
    },
}

/// Errors raised by the service registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// An active registration with this ID exists.
    #[error("Service '{0}' is already registered")]
    DuplicateActiveService(ServiceId),

    /// No active registration with this ID.
    #[error("Service '{0}' not found")]
    NotFound(ServiceId),

    /// Empty or whitespace-only service ID.
    #[error("Service ID cannot be empty or whitespace")]
    InvalidServiceId,

    /// Lifecycle transition not allowed.
    #[error("Service '{service}' cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        /// Service being transitioned
        service: ServiceId,
        /// Current state
        from: ServiceState,
        /// Requested state
        to: ServiceState,
    },

    /// Address allocation or release failed.
    #[error(transparent)]
    Pool(#[from] IpPoolError),
}

/// Errors from pushing a blocklist to a networking sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SidecarError {
    /// Sidecar did not answer before the deadline.
    #[error("Sidecar did not respond within {after_ms}ms")]
    Timeout {
        /// Deadline that elapsed
        after_ms: u64,
    },

    /// Caller cancelled the operation before this sidecar was updated.
    #[error("Enforcement cancelled before the sidecar was updated")]
    Cancelled,

    /// Service has no sidecar handle attached yet.
    #[error("No networking sidecar attached to service '{0}'")]
    NotAttached(ServiceId),

    /// Update issued before the sidecar's packet filter was initialized.
    #[error("Sidecar packet filter has not been initialized")]
    NotInitialized,

    /// Exec into the sidecar failed.
    #[error("Sidecar command '{command}' failed: {reason}")]
    ExecFailed {
        /// Command line that was run
        command: String,
        /// Failure reported by the runtime
        reason: String,
    },

    /// Sidecar is unreachable for another reason.
    #[error("Sidecar unavailable: {0}")]
    Unavailable(String),
}

/// Errors loading or validating configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("Failed to read config file '{path}': {reason}")]
    Io {
        /// File path
        path: String,
        /// Underlying I/O error
        reason: String,
    },

    /// Config text is not valid TOML for this schema.
    #[error("Failed to parse config: {0}")]
    Parse(String),

    /// A field holds an unusable value.
    #[error("Invalid config field '{field}': {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },
}

/// Errors installing the tracing subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TelemetryError {
    /// Log filter directive could not be parsed.
    #[error("Invalid log filter '{0}'")]
    InvalidFilter(String),

    /// A global subscriber is already installed, or installation failed.
    #[error("Failed to install tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Error category, mirroring how callers are expected to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Capacity ran out; caller must free some before retrying.
    ResourceExhausted,
    /// Request rejected before any mutation.
    InvariantViolation,
    /// State changed but a sidecar did not apply it; retry enforcement only.
    EnforcementFailure,
    /// Unknown service or partition.
    NotFound,
    /// Enclave cannot serve requests (torn down or feature disabled).
    Unavailable,
}

/// Crate-level error returned by the enclave network controller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnclaveNetworkError {
    /// IP pool failure.
    #[error(transparent)]
    Pool(#[from] IpPoolError),

    /// Topology validation or lookup failure.
    #[error(transparent)]
    Topology(#[from] TopologyError),

    /// Registry validation or lookup failure.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Sidecar could not be initialized on attach.
    #[error(transparent)]
    Sidecar(#[from] SidecarError),

    /// Configuration rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Logging could not be set up.
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    /// Topology and registry disagree; this is a bug, never user error.
    #[error("Topology inconsistency: {0}")]
    TopologyInconsistency(String),

    /// Partition operations requested while partitioning is disabled.
    #[error("Partitioning is not enabled for this enclave")]
    PartitioningDisabled,

    /// The enclave was destroyed.
    #[error("Enclave '{0}' has been torn down")]
    EnclaveTornDown(String),
}

impl EnclaveNetworkError {
    /// Classify the error for the caller.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Pool(IpPoolError::Exhausted { .. }) => ErrorKind::ResourceExhausted,
            Self::Pool(IpPoolError::NotAllocated(_)) => ErrorKind::NotFound,
            Self::Pool(_) => ErrorKind::InvariantViolation,
            Self::Registry(RegistryError::Pool(IpPoolError::Exhausted { .. })) => {
                ErrorKind::ResourceExhausted
            }
            Self::Registry(RegistryError::NotFound(_)) => ErrorKind::NotFound,
            Self::Registry(_) => ErrorKind::InvariantViolation,
            Self::Topology(TopologyError::UnknownService(_)) => ErrorKind::NotFound,
            Self::Topology(_) => ErrorKind::InvariantViolation,
            Self::Sidecar(_) => ErrorKind::EnforcementFailure,
            Self::Config(_) | Self::TopologyInconsistency(_) => ErrorKind::InvariantViolation,
            Self::Telemetry(_) => ErrorKind::Unavailable,
            Self::PartitioningDisabled | Self::EnclaveTornDown(_) => ErrorKind::Unavailable,
        }
    }
}

fn join_ids(ids: &[ServiceId]) -> String {
    ids.iter()
        .map(ServiceId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
