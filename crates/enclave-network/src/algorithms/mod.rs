//! # Algorithms Module
//!
//! IP allocation, partition topology and blocklist derivation.

pub mod blocklist;
pub mod ip_pool;
pub mod topology;

pub use blocklist::compute_blocklists;
pub use ip_pool::IpAddressPool;
pub use topology::{ConnectionOverrides, PartitionMembership, PartitionTopology};
