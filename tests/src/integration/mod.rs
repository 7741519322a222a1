//! # Integration Tests
//!
//! Exercise the enclave network through its public API only.

pub mod flows;
pub mod iptables;
