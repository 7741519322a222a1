//! # Enclave Network
//!
//! Network partitioning for test enclaves: every service of an enclave gets
//! an address on one flat subnet, and partitions decide which services may
//! talk to each other.
//!
//! **Architecture:** Hexagonal (DDD + Ports/Adapters)
//!
//! ## Purpose
//!
//! - Lease each service an address from the enclave subnet
//! - Group services into partitions with per-pair connectivity
//! - Derive, per service, the set of addresses it must drop
//! - Push those sets to per-service iptables sidecars concurrently
//!
//! ## Guarantees
//!
//! | Guarantee | Description |
//! |-----------|-------------|
//! | Unique leases | No two active services share an address |
//! | Exact coverage | Every active service is in exactly one partition |
//! | Atomic repartition | A rejected repartition changes nothing |
//! | No self-blocking | A service never blocks its own address |
//! | Isolated failures | One sidecar failing never affects another |
//!
//! ## Module Structure
//!
//! ```text
//! enclave-network/
//! ├── domain/          # IDs, registrations, reports, errors, invariants
//! ├── algorithms/      # IP pool, partition topology, blocklist derivation
//! ├── ports/           # Controller API (inbound) + sidecar/clock traits (outbound)
//! ├── application/     # Registry, sidecar enforcer, EnclaveNetworkController
//! ├── adapters/        # iptables sidecar, system clock
//! ├── config.rs        # EnclaveNetworkConfig
//! └── telemetry.rs     # tracing subscriber setup
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use enclave_network::{EnclaveNetworkApi, EnclaveNetworkConfig, EnclaveNetworkController};
//!
//! let controller = EnclaveNetworkController::with_system_clock(EnclaveNetworkConfig::default())?;
//! let ctx = OperationContext::new();
//! let added = controller.add_service("datastore".into(), None, &ctx).await?;
//! controller.attach_sidecar(&"datastore".into(), sidecar).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapters;
pub mod algorithms;
pub mod application;
pub mod config;
pub mod domain;
pub mod ports;
pub mod telemetry;

// Re-exports
pub use adapters::{EnclaveChain, IpTablesSidecar, RetryPolicy, SystemTimeSource};
pub use algorithms::{
    compute_blocklists, ConnectionOverrides, IpAddressPool, PartitionMembership,
    PartitionTopology,
};
pub use application::{
    EnclaveNetworkController, IpLease, ServiceRegistry, SidecarEnforcer, SidecarHandles,
};
pub use config::EnclaveNetworkConfig;
pub use domain::{
    AddServiceOutcome, Blocklist, ConfigError, EnclaveNetworkError, EnclaveStatus,
    EnforcementReport, ErrorKind, IpPoolError, PartitionConnection, PartitionConnectionId,
    PartitionId, RegistryError, RemoveServiceOutcome, ServiceGuid, ServiceId, ServiceIdSet,
    ServiceRegistration, ServiceState, SidecarError, TelemetryError, TopologyError,
    DEFAULT_CONNECTION_BLOCKED, DEFAULT_MAX_CONCURRENT_SIDECAR_UPDATES, DEFAULT_PARTITION_ID,
    DEFAULT_SIDECAR_TIMEOUT_MS,
};
pub use ports::{
    BatchOutcome, CommandOutcome, EnclaveNetworkApi, FixedTimeSource, InMemorySidecar,
    NetworkCommand, NetworkingSidecar, OperationContext, RecordingExecutor, RepartitionRequest,
    SidecarExecutor, TimeSource,
};
pub use telemetry::{init_tracing, TelemetryConfig};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
