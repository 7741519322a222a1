//! # Adapters Layer (Hexagonal Architecture)
//!
//! Implements outbound port traits against real infrastructure.

mod clock;
mod iptables;

pub use clock::SystemTimeSource;
pub use iptables::{init_command, update_command, EnclaveChain, IpTablesSidecar, RetryPolicy};
