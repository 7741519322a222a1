//! # Application Module
//!
//! The enclave network controller and the registry and enforcer it drives.

pub mod enforcer;
pub mod registry;
pub mod service;

pub use enforcer::{SidecarEnforcer, SidecarHandles};
pub use registry::{IpLease, ServiceRegistry};
pub use service::EnclaveNetworkController;
