//! # Enclave Network Benchmarks
//!
//! Blocklist derivation and enforcement fan-out at enclave sizes from 10 to
//! 200 services.

pub mod blocklist;
pub mod enforcement;
