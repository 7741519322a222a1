//! # Enclave Network Controller
//!
//! Orchestrates registry, topology, blocklist calculation and sidecar
//! enforcement for one enclave.
//!
//! Every mutating operation runs as `mutate -> recompute -> enforce` and
//! holds the enclave's operation lock for the whole sequence, so mutations
//! never interleave. State lives behind a read/write lock that is only held
//! for the synchronous mutate and recompute steps; queries take the read
//! side and never wait on sidecars.

use crate::adapters::SystemTimeSource;
use crate::algorithms::{compute_blocklists, IpAddressPool, PartitionTopology};
use crate::application::enforcer::{SidecarEnforcer, SidecarHandles};
use crate::application::registry::{IpLease, ServiceRegistry};
use crate::config::EnclaveNetworkConfig;
use crate::domain::{
    AddServiceOutcome, Blocklist, EnclaveNetworkError, EnclaveStatus, EnforcementReport,
    PartitionConnection, PartitionId, RegistryError, RemoveServiceOutcome, ServiceId,
    ServiceIdSet, ServiceRegistration, SidecarError, TopologyError,
};
use crate::ports::{
    BatchOutcome, CommandOutcome, EnclaveNetworkApi, NetworkCommand, NetworkingSidecar,
    OperationContext, RepartitionRequest, TimeSource,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Mutable state of one enclave.
struct EnclaveState {
    status: EnclaveStatus,
    registry: ServiceRegistry,
    topology: PartitionTopology,
    sidecars: SidecarHandles,
}

/// Blocklists and the handles to push them to, captured under the lock.
struct EnforcementPlan {
    blocklists: HashMap<ServiceId, Blocklist>,
    sidecars: SidecarHandles,
}

/// Network controller for one enclave.
pub struct EnclaveNetworkController {
    config: EnclaveNetworkConfig,
    state: RwLock<EnclaveState>,
    /// Serializes mutate -> recompute -> enforce sequences.
    op_lock: Mutex<()>,
    enforcer: SidecarEnforcer,
}

impl EnclaveNetworkController {
    /// Create the network for a new, empty enclave.
    pub fn new(
        config: EnclaveNetworkConfig,
        clock: Arc<dyn TimeSource>,
    ) -> Result<Self, EnclaveNetworkError> {
        config.validate()?;

        let pool = IpAddressPool::new(config.subnet, config.reserved_addresses.iter().copied())?;
        let default_partition = PartitionId::new(config.default_partition.clone());
        let registry = ServiceRegistry::new(pool, clock, default_partition.clone());
        let topology = PartitionTopology::new(
            default_partition,
            PartitionConnection::blocked(config.default_connection_blocked),
        );
        let enforcer = SidecarEnforcer::new(
            config.max_concurrent_sidecar_updates,
            config.sidecar_timeout(),
        );

        info!(
            enclave_id = %config.enclave_id,
            subnet = %config.subnet,
            partitioning = config.partitioning_enabled,
            "[enclave-net] Enclave network created"
        );

        Ok(Self {
            config,
            state: RwLock::new(EnclaveState {
                status: EnclaveStatus::Empty,
                registry,
                topology,
                sidecars: SidecarHandles::new(),
            }),
            op_lock: Mutex::new(()),
            enforcer,
        })
    }

    /// Create with the host wall clock.
    pub fn with_system_clock(config: EnclaveNetworkConfig) -> Result<Self, EnclaveNetworkError> {
        Self::new(config, Arc::new(SystemTimeSource))
    }

    /// Configuration the enclave was created with.
    pub fn config(&self) -> &EnclaveNetworkConfig {
        &self.config
    }

    // =========================================================================
    // Partition operations
    // =========================================================================

    /// Create an empty partition.
    pub async fn create_partition(&self, partition: PartitionId) -> Result<(), EnclaveNetworkError> {
        self.mutate_only(move |topology, _| topology.create_partition(partition))
            .instrument(self.span("create_partition"))
            .await
    }

    /// Delete an empty, non-default partition.
    pub async fn delete_partition(&self, partition: &PartitionId) -> Result<(), EnclaveNetworkError> {
        self.mutate_only(|topology, _| topology.delete_partition(partition))
            .instrument(self.span("delete_partition"))
            .await
    }

    /// Move a service to another existing partition and push new blocklists.
    pub async fn move_service(
        &self,
        service_id: &ServiceId,
        partition: &PartitionId,
        ctx: &OperationContext,
    ) -> Result<EnforcementReport, EnclaveNetworkError> {
        self.mutate_and_enforce(ctx, |topology, _| {
            topology.move_service(service_id, partition)
        })
        .instrument(self.span("move_service"))
        .await
    }

    /// Set the connection between two partitions and push new blocklists.
    pub async fn set_partition_connection(
        &self,
        a: &PartitionId,
        b: &PartitionId,
        connection: PartitionConnection,
        ctx: &OperationContext,
    ) -> Result<EnforcementReport, EnclaveNetworkError> {
        self.mutate_and_enforce(ctx, |topology, _| {
            topology.set_partition_connection(a, b, connection)
        })
        .instrument(self.span("set_partition_connection"))
        .await
    }

    /// Drop the override between two partitions and push new blocklists.
    pub async fn unset_partition_connection(
        &self,
        a: &PartitionId,
        b: &PartitionId,
        ctx: &OperationContext,
    ) -> Result<EnforcementReport, EnclaveNetworkError> {
        self.mutate_and_enforce(ctx, |topology, _| {
            topology.unset_partition_connection(a, b)
        })
        .instrument(self.span("unset_partition_connection"))
        .await
    }

    /// Change the fallback connection and push new blocklists.
    pub async fn set_default_connection(
        &self,
        connection: PartitionConnection,
        ctx: &OperationContext,
    ) -> Result<EnforcementReport, EnclaveNetworkError> {
        self.mutate_and_enforce(ctx, |topology, _| {
            topology.set_default_connection(connection);
            Ok(())
        })
        .instrument(self.span("set_default_connection"))
        .await
    }

    // =========================================================================
    // Service lifecycle and sidecars
    // =========================================================================

    /// Record that a service's container has started.
    pub fn mark_running(&self, service_id: &ServiceId) -> Result<(), EnclaveNetworkError> {
        let mut state = self.state.write();
        self.ensure_active(&state)?;
        state.registry.mark_running(service_id)?;
        Ok(())
    }

    /// Attach a service's sidecar: initialize it, keep the handle and push
    /// the service's current blocklist.
    ///
    /// Initialization runs outside the operation lock and is bounded by the
    /// sidecar timeout; a sidecar that fails or hangs there is not kept. If
    /// the initial push fails the handle is kept and the error returned; a
    /// later enforcement pass retries it.
    pub async fn attach_sidecar(
        &self,
        service_id: &ServiceId,
        sidecar: Arc<dyn NetworkingSidecar>,
    ) -> Result<(), EnclaveNetworkError> {
        self.attach_inner(service_id, sidecar)
            .instrument(self.span("attach_sidecar"))
            .await
    }

    /// Drop a service's sidecar handle. Returns whether one was attached.
    pub fn detach_sidecar(&self, service_id: &ServiceId) -> bool {
        let removed = self.state.write().sidecars.remove(service_id).is_some();
        self.enforcer.forget(service_id);
        if removed {
            info!(service_id = %service_id, "[enclave-net] Sidecar detached");
        }
        removed
    }

    /// True if a sidecar handle is attached for the service.
    pub fn has_sidecar(&self, service_id: &ServiceId) -> bool {
        self.state.read().sidecars.contains_key(service_id)
    }

    /// True while `ip` is leased to a service or still held by a removal
    /// whose enforcement has not finished.
    pub fn is_address_taken(&self, ip: Ipv4Addr) -> bool {
        self.state.read().registry.pool().is_taken(ip)
    }

    /// Removed registrations, oldest first.
    pub fn history(&self) -> Vec<ServiceRegistration> {
        self.state.read().registry.history().to_vec()
    }

    /// Tear the enclave down: release every address, drop every sidecar and
    /// refuse all further mutations. Returns the released addresses; a second
    /// call releases nothing.
    pub async fn destroy(&self) -> Result<Vec<Ipv4Addr>, EnclaveNetworkError> {
        self.destroy_inner().instrument(self.span("destroy")).await
    }

    // =========================================================================
    // Command dispatch
    // =========================================================================

    /// Execute one command.
    pub async fn execute(
        &self,
        command: NetworkCommand,
        ctx: &OperationContext,
    ) -> Result<CommandOutcome, EnclaveNetworkError> {
        match command {
            NetworkCommand::AddService {
                service_id,
                partition,
            } => self
                .add_service(service_id, partition, ctx)
                .await
                .map(CommandOutcome::ServiceAdded),
            NetworkCommand::RemoveService { service_id } => self
                .remove_service(&service_id, ctx)
                .await
                .map(CommandOutcome::ServiceRemoved),
            NetworkCommand::Repartition(request) => self
                .repartition(request, ctx)
                .await
                .map(CommandOutcome::Enforced),
            NetworkCommand::CreatePartition { partition } => self
                .create_partition(partition)
                .await
                .map(|()| CommandOutcome::Applied),
            NetworkCommand::MoveService {
                service_id,
                partition,
            } => self
                .move_service(&service_id, &partition, ctx)
                .await
                .map(CommandOutcome::Enforced),
            NetworkCommand::SetPartitionConnection { a, b, connection } => self
                .set_partition_connection(&a, &b, connection, ctx)
                .await
                .map(CommandOutcome::Enforced),
            NetworkCommand::SetDefaultConnection { connection } => self
                .set_default_connection(connection, ctx)
                .await
                .map(CommandOutcome::Enforced),
            NetworkCommand::ReapplyEnforcement { only } => self
                .reapply_enforcement(only.as_ref(), ctx)
                .await
                .map(CommandOutcome::Enforced),
        }
    }

    /// Execute commands in order, stopping at the first error.
    pub async fn execute_batch(
        &self,
        commands: Vec<NetworkCommand>,
        ctx: &OperationContext,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for (index, command) in commands.into_iter().enumerate() {
            let name = command.name();
            match self.execute(command, ctx).await {
                Ok(result) => outcome.completed.push(result),
                Err(e) => {
                    warn!(
                        index,
                        command = name,
                        error = %e,
                        "[enclave-net] Batch stopped"
                    );
                    outcome.failed = Some((index, e));
                    break;
                }
            }
        }
        outcome
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn span(&self, op: &'static str) -> tracing::Span {
        info_span!(
            "enclave_op",
            enclave_id = %self.config.enclave_id,
            op,
            operation_id = %Uuid::new_v4()
        )
    }

    fn ensure_active(&self, state: &EnclaveState) -> Result<(), EnclaveNetworkError> {
        if state.status == EnclaveStatus::TornDown {
            return Err(EnclaveNetworkError::EnclaveTornDown(
                self.config.enclave_id.clone(),
            ));
        }
        Ok(())
    }

    fn ensure_partitioning(&self) -> Result<(), EnclaveNetworkError> {
        if !self.config.partitioning_enabled {
            return Err(EnclaveNetworkError::PartitioningDisabled);
        }
        Ok(())
    }

    /// Recompute blocklists from committed state. `None` when partitioning
    /// is disabled and nothing is enforced.
    fn plan(
        &self,
        state: &EnclaveState,
        only: Option<&ServiceIdSet>,
    ) -> Result<Option<EnforcementPlan>, EnclaveNetworkError> {
        if !self.config.partitioning_enabled {
            return Ok(None);
        }
        let mut blocklists =
            compute_blocklists(&state.topology, &state.registry.addresses()).map_err(|e| {
                error!(error = %e, "[enclave-net] Blocklist computation failed");
                e
            })?;
        if let Some(only) = only {
            blocklists.retain(|service_id, _| only.contains(service_id));
        }
        Ok(Some(EnforcementPlan {
            blocklists,
            sidecars: state.sidecars.clone(),
        }))
    }

    async fn enforce(
        &self,
        plan: Option<EnforcementPlan>,
        ctx: &OperationContext,
    ) -> EnforcementReport {
        match plan {
            Some(plan) => {
                self.enforcer
                    .apply_blocklists(&plan.blocklists, &plan.sidecars, ctx)
                    .await
            }
            None => EnforcementReport::new(),
        }
    }

    /// Validate and apply a topology mutation, then plan enforcement.
    ///
    /// The mutation sees the set of registered services and must leave the
    /// topology untouched when it fails.
    fn commit_topology<F>(&self, mutate: F) -> Result<Option<EnforcementPlan>, EnclaveNetworkError>
    where
        F: FnOnce(&mut PartitionTopology, &ServiceIdSet) -> Result<(), TopologyError>,
    {
        self.ensure_partitioning()?;
        let mut guard = self.state.write();
        let state = &mut *guard;
        self.ensure_active(state)?;

        let registered = state.registry.service_ids();
        mutate(&mut state.topology, &registered)?;
        state.registry.sync_partitions(&state.topology);
        self.plan(state, None)
    }

    /// Topology mutation that changes no blocklist, e.g. creating an empty
    /// partition.
    async fn mutate_only<F>(&self, mutate: F) -> Result<(), EnclaveNetworkError>
    where
        F: FnOnce(&mut PartitionTopology, &ServiceIdSet) -> Result<(), TopologyError> + Send,
    {
        let _guard = self.op_lock.lock().await;
        self.commit_topology(mutate)?;
        Ok(())
    }

    async fn mutate_and_enforce<F>(
        &self,
        ctx: &OperationContext,
        mutate: F,
    ) -> Result<EnforcementReport, EnclaveNetworkError>
    where
        F: FnOnce(&mut PartitionTopology, &ServiceIdSet) -> Result<(), TopologyError> + Send,
    {
        let _guard = self.op_lock.lock().await;
        let plan = self.commit_topology(mutate)?;
        let report = self.enforce(plan, ctx).await;
        log_report(&report);
        Ok(report)
    }

    fn commit_add(
        &self,
        service_id: ServiceId,
        partition: Option<PartitionId>,
    ) -> Result<(ServiceRegistration, Option<EnforcementPlan>), EnclaveNetworkError> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        self.ensure_active(state)?;

        if let Some(partition) = &partition {
            if partition != state.topology.default_partition() {
                self.ensure_partitioning()?;
            }
            if !state.topology.has_partition(partition) {
                return Err(TopologyError::UnknownPartition(partition.clone()).into());
            }
        }

        let registration = state.registry.register(service_id, partition)?;
        if let Err(e) = state
            .topology
            .add_service(registration.service_id.clone(), &registration.partition_id)
        {
            state
                .registry
                .deregister_and_release(&registration.service_id)?;
            return Err(EnclaveNetworkError::TopologyInconsistency(e.to_string()));
        }
        state.status = EnclaveStatus::Active;

        let plan = self.plan(state, None)?;
        Ok((registration, plan))
    }

    fn commit_remove(
        &self,
        service_id: &ServiceId,
    ) -> Result<(IpLease, Option<EnforcementPlan>), EnclaveNetworkError> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        self.ensure_active(state)?;

        let lease = state.registry.deregister(service_id)?;
        state.topology.remove_service(service_id);
        state.sidecars.remove(service_id);
        self.enforcer.forget(service_id);

        let plan = self.plan(state, None)?;
        Ok((lease, plan))
    }

    fn release_lease(&self, lease: IpLease) -> Result<Ipv4Addr, EnclaveNetworkError> {
        let ip = lease.ip();
        self.state.write().registry.release(lease)?;
        Ok(ip)
    }

    async fn add_service_inner(
        &self,
        service_id: ServiceId,
        partition: Option<PartitionId>,
        ctx: &OperationContext,
    ) -> Result<AddServiceOutcome, EnclaveNetworkError> {
        let _guard = self.op_lock.lock().await;
        let (registration, plan) = self.commit_add(service_id, partition)?;
        let enforcement = self.enforce(plan, ctx).await;
        log_report(&enforcement);

        Ok(AddServiceOutcome {
            guid: registration.guid,
            ip: registration.ip,
            partition_id: registration.partition_id,
            enforcement,
        })
    }

    async fn remove_service_inner(
        &self,
        service_id: &ServiceId,
        ctx: &OperationContext,
    ) -> Result<RemoveServiceOutcome, EnclaveNetworkError> {
        let _guard = self.op_lock.lock().await;
        let (lease, plan) = self.commit_remove(service_id)?;
        let guid = lease.guid().clone();

        // The address must stay taken until the remaining sidecars stopped
        // referencing it.
        let enforcement = self.enforce(plan, ctx).await;
        log_report(&enforcement);
        let released_ip = self.release_lease(lease)?;

        Ok(RemoveServiceOutcome {
            guid,
            released_ip,
            enforcement,
        })
    }

    async fn repartition_inner(
        &self,
        request: RepartitionRequest,
        ctx: &OperationContext,
    ) -> Result<EnforcementReport, EnclaveNetworkError> {
        let overrides = request.connection_overrides()?;
        let RepartitionRequest {
            membership,
            default_connection,
            ..
        } = request;

        self.mutate_and_enforce(ctx, move |topology, registered| {
            topology.replace_topology(membership, overrides, default_connection, registered)
        })
        .await
    }

    async fn attach_inner(
        &self,
        service_id: &ServiceId,
        sidecar: Arc<dyn NetworkingSidecar>,
    ) -> Result<(), EnclaveNetworkError> {
        self.current_blocklist(service_id)?;
        self.initialize_sidecar(service_id, sidecar.as_ref()).await?;

        let _guard = self.op_lock.lock().await;
        // The service may have gone away while the sidecar initialized.
        let blocked = self.current_blocklist(service_id)?;
        self.state
            .write()
            .sidecars
            .insert(service_id.clone(), Arc::clone(&sidecar));
        info!(service_id = %service_id, "[enclave-net] Sidecar attached");

        if let Some(blocked) = blocked {
            self.enforcer
                .push_one(service_id, sidecar.as_ref(), &blocked, &OperationContext::new())
                .await?;
        }
        Ok(())
    }

    async fn initialize_sidecar(
        &self,
        service_id: &ServiceId,
        sidecar: &dyn NetworkingSidecar,
    ) -> Result<(), SidecarError> {
        let timeout = self.enforcer.timeout();
        match tokio::time::timeout(timeout, sidecar.initialize()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    service_id = %service_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "[enclave-net] Sidecar initialization timed out"
                );
                Err(SidecarError::Timeout {
                    after_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Blocklist the service should currently enforce; `None` when
    /// partitioning is disabled.
    fn current_blocklist(
        &self,
        service_id: &ServiceId,
    ) -> Result<Option<Blocklist>, EnclaveNetworkError> {
        let state = self.state.read();
        self.ensure_active(&state)?;
        state.registry.lookup(service_id)?;
        if !self.config.partitioning_enabled {
            return Ok(None);
        }
        let mut blocklists = compute_blocklists(&state.topology, &state.registry.addresses())?;
        Ok(Some(blocklists.remove(service_id).unwrap_or_default()))
    }

    async fn destroy_inner(&self) -> Result<Vec<Ipv4Addr>, EnclaveNetworkError> {
        let _guard = self.op_lock.lock().await;
        self.tear_down()
    }

    fn tear_down(&self) -> Result<Vec<Ipv4Addr>, EnclaveNetworkError> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        if state.status == EnclaveStatus::TornDown {
            return Ok(Vec::new());
        }

        state.status = EnclaveStatus::TornDown;
        for service_id in state.sidecars.keys() {
            self.enforcer.forget(service_id);
        }
        state.sidecars.clear();
        state.topology = PartitionTopology::new(
            state.topology.default_partition().clone(),
            state.topology.default_connection(),
        );
        let released = state.registry.release_all()?;

        info!(
            released = released.len(),
            "[enclave-net] Enclave network torn down"
        );
        Ok(released)
    }

    async fn reapply_inner(
        &self,
        only: Option<&ServiceIdSet>,
        ctx: &OperationContext,
    ) -> Result<EnforcementReport, EnclaveNetworkError> {
        let _guard = self.op_lock.lock().await;
        let plan = {
            let state = self.state.read();
            self.ensure_active(&state)?;
            self.plan(&state, only)?
        };
        let report = self.enforce(plan, ctx).await;
        log_report(&report);
        Ok(report)
    }
}

fn log_report(report: &EnforcementReport) {
    if report.is_clean() {
        return;
    }
    for (service_id, error) in report.failures() {
        warn!(
            service_id = %service_id,
            error = %error,
            "[enclave-net] Blocklist not enforced; retry with reapply_enforcement"
        );
    }
}

#[async_trait]
impl EnclaveNetworkApi for EnclaveNetworkController {
    async fn add_service(
        &self,
        service_id: ServiceId,
        partition: Option<PartitionId>,
        ctx: &OperationContext,
    ) -> Result<AddServiceOutcome, EnclaveNetworkError> {
        self.add_service_inner(service_id, partition, ctx)
            .instrument(self.span("add_service"))
            .await
    }

    async fn remove_service(
        &self,
        service_id: &ServiceId,
        ctx: &OperationContext,
    ) -> Result<RemoveServiceOutcome, EnclaveNetworkError> {
        self.remove_service_inner(service_id, ctx)
            .instrument(self.span("remove_service"))
            .await
    }

    async fn repartition(
        &self,
        request: RepartitionRequest,
        ctx: &OperationContext,
    ) -> Result<EnforcementReport, EnclaveNetworkError> {
        self.repartition_inner(request, ctx)
            .instrument(self.span("repartition"))
            .await
    }

    async fn reapply_enforcement(
        &self,
        only: Option<&ServiceIdSet>,
        ctx: &OperationContext,
    ) -> Result<EnforcementReport, EnclaveNetworkError> {
        self.reapply_inner(only, ctx)
            .instrument(self.span("reapply_enforcement"))
            .await
    }

    fn service(&self, service_id: &ServiceId) -> Result<ServiceRegistration, EnclaveNetworkError> {
        Ok(self.state.read().registry.lookup(service_id)?.clone())
    }

    fn service_ids(&self) -> ServiceIdSet {
        self.state.read().registry.service_ids()
    }

    fn service_ip(&self, service_id: &ServiceId) -> Result<Ipv4Addr, EnclaveNetworkError> {
        Ok(self.state.read().registry.lookup(service_id)?.ip)
    }

    fn partition_of(&self, service_id: &ServiceId) -> Result<PartitionId, EnclaveNetworkError> {
        let state = self.state.read();
        state
            .topology
            .partition_of(service_id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(service_id.clone()).into())
    }

    fn topology_snapshot(&self) -> PartitionTopology {
        self.state.read().topology.clone()
    }

    fn blocklists(&self) -> Result<HashMap<ServiceId, Blocklist>, EnclaveNetworkError> {
        let state = self.state.read();
        compute_blocklists(&state.topology, &state.registry.addresses())
    }

    fn status(&self) -> EnclaveStatus {
        self.state.read().status
    }
}

impl std::fmt::Debug for EnclaveNetworkController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("EnclaveNetworkController")
            .field("enclave_id", &self.config.enclave_id)
            .field("status", &state.status)
            .field("services", &state.registry.len())
            .field("sidecars", &state.sidecars.len())
            .finish()
    }
}
