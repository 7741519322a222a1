//! # Blocklist Calculator
//!
//! Derives, for every active service, the set of peer addresses its sidecar
//! must drop traffic from:
//!
//! ```text
//! blocked(S in P) = U { IP(s) : s in members(Q), Q != P, effective(P, Q) is blocked }
//! ```
//!
//! Always a full recomputation from the committed topology. Services in the
//! same partition share one blocklist, so the union is built once per
//! partition and then handed to each member.

use crate::algorithms::topology::PartitionTopology;
use crate::domain::{
    invariant_no_self_blocking, Blocklist, EnclaveNetworkError, PartitionId, ServiceId,
};
use std::collections::HashMap;
use std::net::Ipv4Addr;

/// Compute blocklists for every service in `addresses`.
///
/// `addresses` is the registry's view of active services and their leased
/// IPs. A service the topology does not place, or a topology member with no
/// address, is a [`EnclaveNetworkError::TopologyInconsistency`].
pub fn compute_blocklists(
    topology: &PartitionTopology,
    addresses: &HashMap<ServiceId, Ipv4Addr>,
) -> Result<HashMap<ServiceId, Blocklist>, EnclaveNetworkError> {
    let partition_ips = resolve_partition_ips(topology, addresses)?;

    let mut per_partition: HashMap<&PartitionId, Blocklist> = HashMap::new();
    for own in partition_ips.keys() {
        let mut blocked = Blocklist::new();
        for (other, ips) in &partition_ips {
            if other == own || ips.is_empty() {
                continue;
            }
            if topology.effective_connection(own, other)?.is_blocked {
                blocked.extend(ips.iter().copied());
            }
        }
        per_partition.insert(*own, blocked);
    }

    let mut blocklists = HashMap::with_capacity(addresses.len());
    for service in addresses.keys() {
        let partition = topology.partition_of(service).ok_or_else(|| {
            EnclaveNetworkError::TopologyInconsistency(format!(
                "service '{}' is registered but belongs to no partition",
                service
            ))
        })?;
        let blocked = per_partition.get(partition).cloned().ok_or_else(|| {
            EnclaveNetworkError::TopologyInconsistency(format!(
                "partition '{}' of service '{}' does not exist",
                partition, service
            ))
        })?;
        blocklists.insert(service.clone(), blocked);
    }

    invariant_no_self_blocking(&blocklists, addresses)?;
    Ok(blocklists)
}

/// Map each partition to the addresses of its members.
fn resolve_partition_ips<'t>(
    topology: &'t PartitionTopology,
    addresses: &HashMap<ServiceId, Ipv4Addr>,
) -> Result<HashMap<&'t PartitionId, Vec<Ipv4Addr>>, EnclaveNetworkError> {
    topology
        .partitions()
        .map(|(partition, members)| -> Result<_, EnclaveNetworkError> {
            let ips = members
                .iter()
                .map(|service| {
                    addresses.get(service).copied().ok_or_else(|| {
                        EnclaveNetworkError::TopologyInconsistency(format!(
                            "service '{}' in partition '{}' has no registered address",
                            service, partition
                        ))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok((partition, ips))
        })
        .collect()
}
