//! # Controller Lifecycle Flows
//!
//! Cross-component behaviour of [`EnclaveNetworkController`]: ordering of
//! blocks around service start and removal, cancellation, capacity, teardown
//! and batched commands.
//!
//! [`EnclaveNetworkController`]: enclave_network::EnclaveNetworkController

#[cfg(test)]
mod tests {
    use enclave_network::{
        Blocklist, CommandOutcome, EnclaveNetworkApi, EnclaveNetworkConfig,
        EnclaveNetworkController, EnclaveNetworkError, EnclaveStatus, ErrorKind,
        FixedTimeSource, InMemorySidecar, NetworkCommand, OperationContext,
        PartitionConnection, PartitionId, RepartitionRequest, ServiceId, ServiceIdSet,
        SidecarError,
    };
    use std::collections::HashSet;
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    // =============================================================================
    // TEST FIXTURES
    // =============================================================================

    fn controller_with(config: EnclaveNetworkConfig) -> EnclaveNetworkController {
        EnclaveNetworkController::new(config, Arc::new(FixedTimeSource::new(42))).unwrap()
    }

    fn controller() -> EnclaveNetworkController {
        controller_with(EnclaveNetworkConfig::for_testing())
    }

    fn sid(id: &str) -> ServiceId {
        ServiceId::new(id)
    }

    fn pid(id: &str) -> PartitionId {
        PartitionId::new(id)
    }

    /// Add a service and attach a healthy in-memory sidecar to it.
    async fn start(controller: &EnclaveNetworkController, id: &str) -> (Ipv4Addr, InMemorySidecar) {
        let ip = controller
            .add_service(sid(id), None, &OperationContext::new())
            .await
            .unwrap()
            .ip;
        let sidecar = InMemorySidecar::new();
        controller
            .attach_sidecar(&sid(id), Arc::new(sidecar.clone()))
            .await
            .unwrap();
        controller.mark_running(&sid(id)).unwrap();
        (ip, sidecar)
    }

    // =============================================================================
    // SERVICE START AND REMOVAL
    // =============================================================================

    /// Existing services block a newcomer before its own sidecar is attached.
    #[tokio::test]
    async fn test_new_service_is_blocked_before_it_starts() {
        let controller = controller();
        let ctx = OperationContext::new();
        let (_, web) = start(&controller, "web").await;

        controller.create_partition(pid("quarantine")).await.unwrap();
        controller
            .set_partition_connection(
                &pid("default"),
                &pid("quarantine"),
                PartitionConnection::BLOCKED,
                &ctx,
            )
            .await
            .unwrap();

        let added = controller
            .add_service(sid("suspect"), Some(pid("quarantine")), &ctx)
            .await
            .unwrap();

        assert_eq!(added.enforcement.outcome(&sid("web")), Some(&Ok(())));
        assert_eq!(web.current(), Some(Blocklist::from([added.ip])));
        assert_eq!(
            added.enforcement.outcome(&sid("suspect")),
            Some(&Err(SidecarError::NotAttached(sid("suspect"))))
        );
    }

    #[tokio::test]
    async fn test_removal_unblocks_then_frees_address() {
        let controller = controller();
        let ctx = OperationContext::new();
        let (_, web) = start(&controller, "web").await;
        let (db_ip, _) = start(&controller, "db").await;

        controller
            .repartition(
                RepartitionRequest::new(PartitionConnection::BLOCKED)
                    .partition("front", ["web"])
                    .partition("back", ["db"]),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(web.current(), Some(Blocklist::from([db_ip])));

        let removed = controller.remove_service(&sid("db"), &ctx).await.unwrap();
        assert_eq!(removed.released_ip, db_ip);
        assert!(removed.enforcement.is_clean());
        assert_eq!(web.current(), Some(Blocklist::new()));
        assert!(!controller.has_sidecar(&sid("db")));

        let history = controller.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].guid, removed.guid);

        // Same ID again: new GUID, reused address.
        let again = controller
            .add_service(sid("db"), None, &ctx)
            .await
            .unwrap();
        assert_eq!(again.ip, db_ip);
        assert_ne!(again.guid, removed.guid);
    }

    #[tokio::test]
    async fn test_duplicate_active_service_rejected() {
        let controller = controller();
        let ctx = OperationContext::new();
        controller.add_service(sid("api"), None, &ctx).await.unwrap();

        let err = controller
            .add_service(sid("api"), None, &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvariantViolation);
        assert_eq!(controller.service_ids().len(), 1);
    }

    // =============================================================================
    // CAPACITY AND CONCURRENCY
    // =============================================================================

    #[tokio::test]
    async fn test_pool_exhaustion_and_recovery() {
        let controller = controller_with(EnclaveNetworkConfig {
            subnet: "10.1.0.0/29".parse().unwrap(),
            reserved_addresses: vec![Ipv4Addr::new(10, 1, 0, 1)],
            ..EnclaveNetworkConfig::for_testing()
        });
        let ctx = OperationContext::new();

        for i in 0..5 {
            controller
                .add_service(sid(&format!("svc-{}", i)), None, &ctx)
                .await
                .unwrap();
        }
        let err = controller
            .add_service(sid("one-too-many"), None, &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        assert!(controller.service(&sid("one-too-many")).is_err());

        controller.remove_service(&sid("svc-2"), &ctx).await.unwrap();
        let added = controller
            .add_service(sid("one-too-many"), None, &ctx)
            .await
            .unwrap();
        assert_eq!(added.ip, Ipv4Addr::new(10, 1, 0, 4));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_adds_get_distinct_addresses() {
        let controller = Arc::new(controller());
        let mut handles = Vec::new();
        for i in 0..32 {
            let controller = Arc::clone(&controller);
            handles.push(tokio::spawn(async move {
                controller
                    .add_service(sid(&format!("svc-{}", i)), None, &OperationContext::new())
                    .await
                    .map(|outcome| outcome.ip)
            }));
        }

        let mut ips = HashSet::new();
        for handle in handles {
            assert!(ips.insert(handle.await.unwrap().unwrap()));
        }
        assert_eq!(ips.len(), 32);
        assert_eq!(controller.service_ids().len(), 32);
    }

    // =============================================================================
    // CANCELLATION AND DEADLINES
    // =============================================================================

    #[tokio::test]
    async fn test_cancelled_enforcement_keeps_committed_topology() {
        let controller = controller();
        let (ip1, s1) = start(&controller, "s1").await;
        let (ip2, s2) = start(&controller, "s2").await;
        controller.create_partition(pid("p2")).await.unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let cancelled = OperationContext::new().with_cancel(token);

        let report = controller
            .set_default_connection(PartitionConnection::BLOCKED, &cancelled)
            .await
            .unwrap();
        assert!(report.is_clean());

        let report = controller
            .move_service(&sid("s2"), &pid("p2"), &cancelled)
            .await
            .unwrap();
        assert_eq!(report.outcome(&sid("s1")), Some(&Err(SidecarError::Cancelled)));
        assert_eq!(controller.partition_of(&sid("s2")).unwrap(), pid("p2"));
        assert_eq!(s1.current(), Some(Blocklist::new()));

        let retry = controller
            .reapply_enforcement(Some(&report.failed_services()), &OperationContext::new())
            .await
            .unwrap();
        assert!(retry.is_clean());
        assert_eq!(s1.current(), Some(Blocklist::from([ip2])));
        assert_eq!(s2.current(), Some(Blocklist::from([ip1])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_deadline_bounds_slow_sidecar() {
        let controller = controller_with(EnclaveNetworkConfig {
            sidecar_timeout_ms: 30_000,
            ..EnclaveNetworkConfig::for_testing()
        });
        let ctx = OperationContext::new();
        controller.add_service(sid("s1"), None, &ctx).await.unwrap();
        let slow = InMemorySidecar::slow(Duration::from_secs(5));
        controller
            .attach_sidecar(&sid("s1"), Arc::new(slow.clone()))
            .await
            .unwrap();
        controller.add_service(sid("s2"), None, &ctx).await.unwrap();
        controller.create_partition(pid("p2")).await.unwrap();

        let report = controller
            .move_service(
                &sid("s2"),
                &pid("p2"),
                &OperationContext::new().with_deadline(Duration::from_millis(250)),
            )
            .await
            .unwrap();
        // s1 and s2 are still connected; only s1 was attempted and it was not
        // asked to change anything.
        assert!(report.outcome(&sid("s1")).is_none());

        let report = controller
            .set_default_connection(
                PartitionConnection::BLOCKED,
                &OperationContext::new().with_deadline(Duration::from_millis(250)),
            )
            .await
            .unwrap();
        assert_eq!(
            report.outcome(&sid("s1")),
            Some(&Err(SidecarError::Timeout { after_ms: 250 }))
        );
    }

    // =============================================================================
    // PARTITIONING TOGGLE AND TEARDOWN
    // =============================================================================

    #[tokio::test]
    async fn test_partitioning_disabled_never_touches_sidecars() {
        let controller = controller_with(EnclaveNetworkConfig {
            partitioning_enabled: false,
            ..EnclaveNetworkConfig::for_testing()
        });
        let ctx = OperationContext::new();
        let (_, s1) = start(&controller, "s1").await;
        let (_, s2) = start(&controller, "s2").await;

        let removed = controller.remove_service(&sid("s2"), &ctx).await.unwrap();
        assert_eq!(removed.enforcement.attempted(), 0);
        assert_eq!(s1.update_count(), 0);
        assert!(s1.is_initialized());

        let err = controller
            .set_default_connection(PartitionConnection::BLOCKED, &ctx)
            .await
            .unwrap_err();
        assert_eq!(err, EnclaveNetworkError::PartitioningDisabled);
        assert_eq!(err.kind(), ErrorKind::Unavailable);

        let err = controller
            .add_service(sid("s3"), Some(pid("elsewhere")), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err, EnclaveNetworkError::PartitioningDisabled);
    }

    #[tokio::test]
    async fn test_destroy_releases_everything_once() {
        let controller = controller();
        let ctx = OperationContext::new();
        let (ip1, _) = start(&controller, "s1").await;
        let (ip2, _) = start(&controller, "s2").await;
        assert_eq!(controller.status(), EnclaveStatus::Active);

        let mut released = controller.destroy().await.unwrap();
        released.sort();
        assert_eq!(released, vec![ip1, ip2]);
        assert_eq!(controller.status(), EnclaveStatus::TornDown);
        assert!(controller.service_ids().is_empty());
        assert_eq!(controller.history().len(), 2);

        for result in [
            controller.remove_service(&sid("s1"), &ctx).await.map(|_| ()),
            controller.add_service(sid("s3"), None, &ctx).await.map(|_| ()),
            controller.reapply_enforcement(None, &ctx).await.map(|_| ()),
            controller
                .attach_sidecar(&sid("s1"), Arc::new(InMemorySidecar::new()))
                .await,
        ] {
            assert!(matches!(result, Err(EnclaveNetworkError::EnclaveTornDown(_))));
        }
        assert!(controller.destroy().await.unwrap().is_empty());
    }

    // =============================================================================
    // BATCHED COMMANDS
    // =============================================================================

    #[tokio::test]
    async fn test_command_batch_builds_topology() {
        let controller = controller();
        let ctx = OperationContext::new();

        let outcome = controller
            .execute_batch(
                vec![
                    NetworkCommand::AddService {
                        service_id: sid("client"),
                        partition: None,
                    },
                    NetworkCommand::AddService {
                        service_id: sid("server"),
                        partition: None,
                    },
                    NetworkCommand::CreatePartition {
                        partition: pid("isolated"),
                    },
                    NetworkCommand::MoveService {
                        service_id: sid("server"),
                        partition: pid("isolated"),
                    },
                    NetworkCommand::SetPartitionConnection {
                        a: pid("isolated"),
                        b: pid("default"),
                        connection: PartitionConnection::BLOCKED,
                    },
                    NetworkCommand::ReapplyEnforcement { only: None },
                ],
                &ctx,
            )
            .await;

        assert!(outcome.is_success());
        assert_eq!(outcome.completed.len(), 6);
        assert!(matches!(outcome.completed[2], CommandOutcome::Applied));
        assert!(outcome.completed[5].enforcement().is_some());

        let server_ip = controller.service_ip(&sid("server")).unwrap();
        let blocklists = controller.blocklists().unwrap();
        assert_eq!(blocklists[&sid("client")], Blocklist::from([server_ip]));
    }

    #[tokio::test]
    async fn test_command_batch_stops_on_authoritative_error() {
        let controller = controller();
        let ctx = OperationContext::new();
        let only: ServiceIdSet = ["ghost"].into_iter().collect();

        let outcome = controller
            .execute_batch(
                vec![
                    NetworkCommand::AddService {
                        service_id: sid("a"),
                        partition: None,
                    },
                    NetworkCommand::ReapplyEnforcement { only: Some(only) },
                    NetworkCommand::RemoveService {
                        service_id: sid("ghost"),
                    },
                    NetworkCommand::RemoveService {
                        service_id: sid("a"),
                    },
                ],
                &ctx,
            )
            .await;

        assert_eq!(outcome.completed.len(), 2);
        let (index, err) = outcome.failed.unwrap();
        assert_eq!(index, 2);
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(controller.service(&sid("a")).is_ok());
    }

    #[tokio::test]
    async fn test_config_from_toml_drives_controller() {
        let config = EnclaveNetworkConfig::from_toml_str(
            r#"
            enclave_id = "toml-enclave"
            subnet = "192.168.50.0/24"
            reserved_addresses = ["192.168.50.1", "192.168.50.2"]
            default_partition = "lobby"
            default_connection_blocked = true
            "#,
        )
        .unwrap();
        let controller = controller_with(config);

        let added = controller
            .add_service(sid("api"), None, &OperationContext::new())
            .await
            .unwrap();
        assert_eq!(added.ip, Ipv4Addr::new(192, 168, 50, 3));
        assert_eq!(added.partition_id, pid("lobby"));
        assert_eq!(
            controller.topology_snapshot().default_connection(),
            PartitionConnection::BLOCKED
        );
    }
}
