//! # Domain Entities
//!
//! Service registrations, enclave lifecycle and enforcement reports.

use super::errors::SidecarError;
use super::value_objects::{PartitionId, ServiceGuid, ServiceId, ServiceIdSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

/// Lifecycle of a single service registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ServiceState {
    /// IP assigned, container not yet started.
    #[default]
    Registered,
    /// Container started by the runtime backend.
    Running,
    /// Deregistered; the record is history.
    Removed,
}

impl ServiceState {
    /// Check if transition to next state is valid.
    pub fn can_transition_to(&self, next: ServiceState) -> bool {
        matches!(
            (self, next),
            (Self::Registered, Self::Running)
                | (Self::Registered, Self::Removed)
                | (Self::Running, Self::Removed)
        )
    }

    /// Registered or running.
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Removed)
    }
}

/// Record binding a logical service to its runtime network identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRegistration {
    /// User-chosen identifier.
    pub service_id: ServiceId,
    /// Registration-unique identifier.
    pub guid: ServiceGuid,
    /// Address leased from the enclave pool.
    pub ip: Ipv4Addr,
    /// Partition the service currently belongs to.
    pub partition_id: PartitionId,
    /// Unix millis at registration.
    pub registered_at_ms: u64,
    /// Lifecycle state.
    pub state: ServiceState,
}

impl ServiceRegistration {
    /// Create a fresh registration in the `Registered` state.
    pub fn new(
        service_id: ServiceId,
        ip: Ipv4Addr,
        partition_id: PartitionId,
        registered_at_ms: u64,
    ) -> Self {
        Self {
            guid: ServiceGuid::derive(&service_id, registered_at_ms),
            service_id,
            ip,
            partition_id,
            registered_at_ms,
            state: ServiceState::Registered,
        }
    }

    /// Registered or running.
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }
}

/// Enclave lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EnclaveStatus {
    /// No service has ever been added.
    #[default]
    Empty,
    /// At least one service has been added.
    Active,
    /// Destroyed; every operation fails.
    TornDown,
}

/// Per-service outcome of one enforcement pass.
///
/// Holds exactly one entry per service that was attempted. Failures never
/// abort the pass; the caller inspects them and may retry the failed subset.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnforcementReport {
    outcomes: BTreeMap<ServiceId, Result<(), SidecarError>>,
}

impl EnforcementReport {
    /// Empty report (nothing attempted).
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome for one service.
    pub fn record(&mut self, service_id: ServiceId, outcome: Result<(), SidecarError>) {
        self.outcomes.insert(service_id, outcome);
    }

    /// Outcome for one service, if it was attempted.
    pub fn outcome(&self, service_id: &ServiceId) -> Option<&Result<(), SidecarError>> {
        self.outcomes.get(service_id)
    }

    /// All outcomes, ordered by service ID.
    pub fn outcomes(&self) -> &BTreeMap<ServiceId, Result<(), SidecarError>> {
        &self.outcomes
    }

    /// Services attempted.
    pub fn attempted(&self) -> usize {
        self.outcomes.len()
    }

    /// `(service, error)` pairs for every failure.
    pub fn failures(&self) -> Vec<(ServiceId, SidecarError)> {
        self.outcomes
            .iter()
            .filter_map(|(id, outcome)| outcome.as_ref().err().map(|e| (id.clone(), e.clone())))
            .collect()
    }

    /// Services whose sidecar did not apply its blocklist.
    pub fn failed_services(&self) -> ServiceIdSet {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| outcome.is_err())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// True if every attempted sidecar succeeded.
    pub fn is_clean(&self) -> bool {
        self.outcomes.values().all(Result::is_ok)
    }

    /// Fold another report into this one; later outcomes win.
    pub fn merge(&mut self, other: EnforcementReport) {
        self.outcomes.extend(other.outcomes);
    }
}

/// Result of adding a service: the authoritative registration plus the
/// separate enforcement outcome.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddServiceOutcome {
    /// Registration-unique identifier.
    pub guid: ServiceGuid,
    /// Leased address.
    pub ip: Ipv4Addr,
    /// Partition the service landed in.
    pub partition_id: PartitionId,
    /// Per-service sidecar results.
    pub enforcement: EnforcementReport,
}

/// Result of removing a service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoveServiceOutcome {
    /// Registration that was removed.
    pub guid: ServiceGuid,
    /// Address returned to the pool after enforcement.
    pub released_ip: Ipv4Addr,
    /// Per-service sidecar results for the remaining services.
    pub enforcement: EnforcementReport,
}
