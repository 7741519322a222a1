//! # Enclave Network Test Suite
//!
//! Unified test crate for the enclave network.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! ├── benchmarks/       # Blocklist and enforcement performance
//! └── integration/      # Scenario and cross-component flows
//!     ├── scenarios.rs  # Pool, topology, blocklist and enforcement scenarios
//!     ├── flows.rs      # Controller lifecycle flows
//!     └── iptables.rs   # Controller driving iptables sidecars
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! # All tests
//! cargo test -p enclave-tests
//!
//! # By category
//! cargo test -p enclave-tests integration::scenarios::
//! cargo test -p enclave-tests integration::flows::
//!
//! # Benchmarks
//! cargo bench -p enclave-tests
//! ```

#![allow(unused_variables)]
#![allow(unused_imports)]
#![allow(dead_code)]

pub mod benchmarks;
pub mod integration;
