//! # Ports Layer (Hexagonal Architecture)
//!
//! Inbound API consumed by callers, outbound capabilities the core depends on.

pub mod inbound;
pub mod outbound;

pub use inbound::{
    BatchOutcome, CommandOutcome, EnclaveNetworkApi, NetworkCommand, OperationContext,
    RepartitionRequest,
};
pub use outbound::{
    FixedTimeSource, InMemorySidecar, NetworkingSidecar, RecordingExecutor, SidecarExecutor,
    TimeSource,
};
