//! # Domain Value Objects
//!
//! Identifiers and set types shared by every enclave network component.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::net::Ipv4Addr;

/// Set of peer addresses a service's sidecar must drop traffic from.
///
/// Ordered so that sidecar commands built from it are deterministic.
pub type Blocklist = BTreeSet<Ipv4Addr>;

/// Stable, user-chosen service identifier (e.g. `"datastore"`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(String);

impl ServiceId {
    /// Create a service ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Empty or whitespace-only IDs are never accepted by the registry.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServiceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ServiceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Registration-unique identifier: `ServiceId + "_" + unix millis`.
///
/// Distinguishes successive registrations that reuse one `ServiceId`
/// within a single enclave lifetime.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceGuid(String);

impl ServiceGuid {
    /// Derive the GUID for a registration made at `registered_at_ms`.
    pub fn derive(service_id: &ServiceId, registered_at_ms: u64) -> Self {
        Self(format!("{}_{}", service_id.as_str(), registered_at_ms))
    }

    /// Borrow the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Partition identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(String);

impl PartitionId {
    /// Create a partition ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartitionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PartitionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Canonical key for the unordered pair `{a, b}` of distinct partitions.
///
/// `first <= second` always holds, so `(A, B)` and `(B, A)` map to the same
/// entry. [`PartitionConnectionId::new`] is the only constructor; inserts and
/// lookups both go through it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionConnectionId {
    first: PartitionId,
    second: PartitionId,
}

impl PartitionConnectionId {
    /// Build the canonical key, ordering the two IDs lexicographically.
    ///
    /// Returns `None` for a self-pair; a partition is always internally
    /// connected and never has an entry.
    pub fn new(a: PartitionId, b: PartitionId) -> Option<Self> {
        match a.cmp(&b) {
            std::cmp::Ordering::Less => Some(Self { first: a, second: b }),
            std::cmp::Ordering::Greater => Some(Self { first: b, second: a }),
            std::cmp::Ordering::Equal => None,
        }
    }

    /// Lexicographically smaller partition.
    pub fn first(&self) -> &PartitionId {
        &self.first
    }

    /// Lexicographically larger partition.
    pub fn second(&self) -> &PartitionId {
        &self.second
    }

    /// True if either side of the pair is `partition`.
    pub fn involves(&self, partition: &PartitionId) -> bool {
        &self.first == partition || &self.second == partition
    }
}

impl fmt::Display for PartitionConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}", self.first, self.second)
    }
}

/// Connectivity between two partitions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionConnection {
    /// Whether traffic between the two partitions is dropped.
    pub is_blocked: bool,
}

impl PartitionConnection {
    /// Traffic flows freely.
    pub const CONNECTED: Self = Self { is_blocked: false };

    /// Traffic is dropped in both directions.
    pub const BLOCKED: Self = Self { is_blocked: true };

    /// Build from the raw flag.
    pub fn blocked(is_blocked: bool) -> Self {
        Self { is_blocked }
    }
}

/// Hash-backed set of service IDs with first-class set algebra.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceIdSet(HashSet<ServiceId>);

impl ServiceIdSet {
    /// Empty set.
    pub fn new() -> Self {
        Self(HashSet::new())
    }

    /// Insert; returns false if already present.
    pub fn add(&mut self, id: ServiceId) -> bool {
        self.0.insert(id)
    }

    /// Remove; returns false if absent.
    pub fn remove(&mut self, id: &ServiceId) -> bool {
        self.0.remove(id)
    }

    /// Membership test.
    pub fn contains(&self, id: &ServiceId) -> bool {
        self.0.contains(id)
    }

    /// Elements in either set.
    pub fn union(&self, other: &Self) -> Self {
        Self(self.0.union(&other.0).cloned().collect())
    }

    /// Elements in `self` but not in `other`.
    pub fn difference(&self, other: &Self) -> Self {
        Self(self.0.difference(&other.0).cloned().collect())
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if the set has no elements.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = &ServiceId> {
        self.0.iter()
    }

    /// Elements sorted, for stable error messages and logs.
    pub fn sorted(&self) -> Vec<ServiceId> {
        let mut ids: Vec<_> = self.0.iter().cloned().collect();
        ids.sort();
        ids
    }
}

impl fmt::Display for ServiceIdSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<String> = self.sorted().iter().map(ToString::to_string).collect();
        f.write_str(&ids.join(", "))
    }
}

impl FromIterator<ServiceId> for ServiceIdSet {
    fn from_iter<I: IntoIterator<Item = ServiceId>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> FromIterator<&'a str> for ServiceIdSet {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        Self(iter.into_iter().map(ServiceId::from).collect())
    }
}

impl Extend<ServiceId> for ServiceIdSet {
    fn extend<I: IntoIterator<Item = ServiceId>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

impl IntoIterator for ServiceIdSet {
    type Item = ServiceId;
    type IntoIter = std::collections::hash_set::IntoIter<ServiceId>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a ServiceIdSet {
    type Item = &'a ServiceId;
    type IntoIter = std::collections::hash_set::Iter<'a, ServiceId>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
