//! # Domain Invariants
//!
//! Rules that must hold for every enclave at every point in time.

use super::errors::{EnclaveNetworkError, TopologyError};
use super::value_objects::{Blocklist, PartitionId, ServiceId, ServiceIdSet};
use ipnet::Ipv4Net;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;

/// Partition every new service lands in.
pub const DEFAULT_PARTITION_ID: &str = "default";

/// Fallback connectivity for partition pairs without an override.
pub const DEFAULT_CONNECTION_BLOCKED: bool = false;

/// Maximum sidecar updates in flight per enforcement pass.
pub const DEFAULT_MAX_CONCURRENT_SIDECAR_UPDATES: usize = 8;

/// Per-sidecar deadline.
pub const DEFAULT_SIDECAR_TIMEOUT_MS: u64 = 10_000;

/// Invariant: an address handed to a service is a host address of the subnet.
///
/// Network and broadcast addresses are never usable.
pub fn invariant_usable_host(ip: Ipv4Addr, subnet: &Ipv4Net) -> bool {
    subnet.contains(&ip) && ip != subnet.network() && ip != subnet.broadcast()
}

/// Invariant: every service in `services` belongs to exactly one partition of
/// `membership`, and nothing else does.
///
/// Reports the first violated rule in this order: missing services, unknown
/// services, duplicated services.
pub fn invariant_exact_coverage(
    membership: &HashMap<PartitionId, ServiceIdSet>,
    services: &ServiceIdSet,
) -> Result<(), TopologyError> {
    let mut seen: HashSet<&ServiceId> = HashSet::new();
    let mut duplicated = ServiceIdSet::new();
    let mut unknown = ServiceIdSet::new();

    for members in membership.values() {
        for service in members {
            if !seen.insert(service) {
                duplicated.add(service.clone());
            }
            if !services.contains(service) {
                unknown.add(service.clone());
            }
        }
    }

    let missing: Vec<ServiceId> = services
        .sorted()
        .into_iter()
        .filter(|s| !seen.contains(s))
        .collect();

    if !missing.is_empty() {
        return Err(TopologyError::IncompleteServiceCoverage { missing });
    }
    if !unknown.is_empty() {
        return Err(TopologyError::UnknownServicesInMembership {
            services: unknown.sorted(),
        });
    }
    if !duplicated.is_empty() {
        return Err(TopologyError::DuplicateAssignment {
            services: duplicated.sorted(),
        });
    }
    Ok(())
}

/// Invariant: no service appears in its own blocklist.
pub fn invariant_no_self_blocking(
    blocklists: &HashMap<ServiceId, Blocklist>,
    addresses: &HashMap<ServiceId, Ipv4Addr>,
) -> Result<(), EnclaveNetworkError> {
    for (service, blocked) in blocklists {
        if let Some(ip) = addresses.get(service) {
            if blocked.contains(ip) {
                return Err(EnclaveNetworkError::TopologyInconsistency(format!(
                    "service '{}' blocks its own address {}",
                    service, ip
                )));
            }
        }
    }
    Ok(())
}
