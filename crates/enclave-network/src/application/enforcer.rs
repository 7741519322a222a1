//! # Sidecar Enforcer
//!
//! Pushes blocklists to per-service sidecars concurrently, bounded by a
//! semaphore, and aggregates one outcome per attempted service.
//!
//! One sidecar failing, timing out or being cancelled never affects any
//! other sidecar. Every push is a full replacement of the blocked set.
//!
//! A push that did not confirm may still have landed, so its sidecar's state
//! becomes unknown and the next pass pushes to it whatever the desired set.

use crate::domain::{Blocklist, EnforcementReport, ServiceId, SidecarError};
use crate::ports::{NetworkingSidecar, OperationContext};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Sidecar handles keyed by service.
pub type SidecarHandles = HashMap<ServiceId, Arc<dyn NetworkingSidecar>>;

/// What the enforcer knows about a sidecar's rules. `None` means the last
/// push did not confirm.
type AppliedState = HashMap<ServiceId, Option<Blocklist>>;

/// Bounded-concurrency blocklist dispatcher.
pub struct SidecarEnforcer {
    semaphore: Arc<Semaphore>,
    timeout: Duration,
    /// Last set each sidecar confirmed.
    last_applied: Arc<Mutex<AppliedState>>,
}

impl SidecarEnforcer {
    /// Enforcer running at most `max_concurrent` updates at once, each
    /// bounded by `timeout`.
    pub fn new(max_concurrent: usize, timeout: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            timeout,
            last_applied: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Push `blocklists` to the matching sidecars.
    ///
    /// A service is attempted when its blocklist is non-empty, differs from
    /// the last set its sidecar confirmed, or its previous push failed. An
    /// attempted service without a handle in `sidecars` is reported as
    /// [`SidecarError::NotAttached`].
    pub async fn apply_blocklists(
        &self,
        blocklists: &HashMap<ServiceId, Blocklist>,
        sidecars: &SidecarHandles,
        ctx: &OperationContext,
    ) -> EnforcementReport {
        let deadline = ctx.deadline.map(|d| Instant::now() + d);
        let mut report = EnforcementReport::new();
        let mut join_set: JoinSet<(ServiceId, Result<(), SidecarError>)> = JoinSet::new();
        let mut pending: Vec<ServiceId> = Vec::new();

        for (service_id, blocked) in blocklists {
            if !self.needs_push(service_id, blocked) {
                continue;
            }
            let Some(sidecar) = sidecars.get(service_id).cloned() else {
                report.record(
                    service_id.clone(),
                    Err(SidecarError::NotAttached(service_id.clone())),
                );
                continue;
            };

            pending.push(service_id.clone());
            let service_id = service_id.clone();
            let blocked = blocked.clone();
            let semaphore = Arc::clone(&self.semaphore);
            let cancel = ctx.cancel.clone();
            let last_applied = Arc::clone(&self.last_applied);
            let timeout = self.timeout;

            join_set.spawn(async move {
                let push = async {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|_| SidecarError::Unavailable("enforcer shut down".into()))?;
                    push_with_deadline(sidecar.as_ref(), &blocked, timeout, deadline).await
                };

                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(SidecarError::Cancelled),
                    result = push => result,
                };

                let confirmed = result.is_ok().then_some(blocked);
                last_applied.lock().insert(service_id.clone(), confirmed);
                (service_id, result)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((service_id, result)) => {
                    if let Err(e) = &result {
                        warn!(
                            service_id = %service_id,
                            error = %e,
                            "[enclave-net] Sidecar update failed"
                        );
                    }
                    report.record(service_id, result);
                }
                Err(join_err) => {
                    warn!(error = %join_err, "[enclave-net] Sidecar update task panicked");
                }
            }
        }

        for service_id in pending {
            if report.outcome(&service_id).is_none() {
                self.mark_unknown(&service_id);
                report.record(
                    service_id,
                    Err(SidecarError::Unavailable("update task aborted".into())),
                );
            }
        }

        info!(
            attempted = report.attempted(),
            failed = report.failed_services().len(),
            "[enclave-net] Enforcement pass finished"
        );
        report
    }

    /// Push one blocklist outside a pass, e.g. right after attaching.
    ///
    /// Bounded like a pass push: the per-sidecar timeout capped by the
    /// caller's deadline, and abandoned on cancellation.
    pub async fn push_one(
        &self,
        service_id: &ServiceId,
        sidecar: &dyn NetworkingSidecar,
        blocked: &Blocklist,
        ctx: &OperationContext,
    ) -> Result<(), SidecarError> {
        let deadline = ctx.deadline.map(|d| Instant::now() + d);
        let push = async {
            let _permit = Arc::clone(&self.semaphore)
                .acquire_owned()
                .await
                .map_err(|_| SidecarError::Unavailable("enforcer shut down".into()))?;
            push_with_deadline(sidecar, blocked, self.timeout, deadline).await
        };
        let result = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Err(SidecarError::Cancelled),
            result = push => result,
        };

        let confirmed = result.as_ref().ok().map(|_| blocked.clone());
        self.last_applied.lock().insert(service_id.clone(), confirmed);
        result
    }

    /// Forget what a sidecar was last told, e.g. after it is detached.
    pub fn forget(&self, service_id: &ServiceId) {
        self.last_applied.lock().remove(service_id);
    }

    /// Last set the sidecar of `service_id` confirmed. `None` also when its
    /// last push failed.
    pub fn last_applied(&self, service_id: &ServiceId) -> Option<Blocklist> {
        self.last_applied.lock().get(service_id).cloned().flatten()
    }

    /// True when the last push to `service_id` did not confirm.
    pub fn is_unknown(&self, service_id: &ServiceId) -> bool {
        matches!(self.last_applied.lock().get(service_id), Some(None))
    }

    fn mark_unknown(&self, service_id: &ServiceId) {
        self.last_applied.lock().insert(service_id.clone(), None);
    }

    /// Per-sidecar timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn needs_push(&self, service_id: &ServiceId, blocked: &Blocklist) -> bool {
        if !blocked.is_empty() {
            return true;
        }
        let changed = match self.last_applied.lock().get(service_id) {
            // Never pushed: the sidecar still has no rules.
            None => false,
            Some(None) => true,
            Some(Some(last)) => last != blocked,
        };
        if !changed {
            debug!(
                "[enclave-net] Skipping '{}': blocklist empty and unchanged",
                service_id
            );
        }
        changed
    }
}

impl std::fmt::Debug for SidecarEnforcer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SidecarEnforcer")
            .field("available_permits", &self.semaphore.available_permits())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Run one update bounded by the per-sidecar timeout and the pass deadline,
/// whichever comes first.
async fn push_with_deadline(
    sidecar: &dyn NetworkingSidecar,
    blocked: &Blocklist,
    timeout: Duration,
    deadline: Option<Instant>,
) -> Result<(), SidecarError> {
    let now = Instant::now();
    let mut until = now + timeout;
    if let Some(deadline) = deadline {
        until = until.min(deadline);
    }
    let budget_ms = until.saturating_duration_since(now).as_millis() as u64;

    match tokio::time::timeout_at(until, sidecar.update_blocked_ips(blocked)).await {
        Ok(result) => result,
        Err(_) => Err(SidecarError::Timeout {
            after_ms: budget_ms,
        }),
    }
}
