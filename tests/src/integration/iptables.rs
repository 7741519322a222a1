//! # Controller → iptables Sidecar Flow
//!
//! Drives real [`IpTablesSidecar`] adapters from the controller and checks
//! the command lines that would run inside each sidecar container.
//!
//! [`IpTablesSidecar`]: enclave_network::IpTablesSidecar

#[cfg(test)]
mod tests {
    use enclave_network::{
        EnclaveChain, EnclaveNetworkApi, EnclaveNetworkConfig, EnclaveNetworkController,
        FixedTimeSource, IpTablesSidecar, OperationContext, PartitionConnection,
        RecordingExecutor, RepartitionRequest, RetryPolicy, ServiceId, SidecarError,
    };
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    fn sid(id: &str) -> ServiceId {
        ServiceId::new(id)
    }

    async fn attach_iptables(
        controller: &EnclaveNetworkController,
        id: &str,
        retry: RetryPolicy,
    ) -> (Arc<IpTablesSidecar<RecordingExecutor>>, RecordingExecutor) {
        let executor = RecordingExecutor::new();
        let sidecar = Arc::new(IpTablesSidecar::new(sid(id), executor.clone(), retry));
        controller
            .attach_sidecar(&sid(id), sidecar.clone())
            .await
            .unwrap();
        (sidecar, executor)
    }

    #[tokio::test]
    async fn test_partition_split_programs_both_sidecars() {
        let controller = EnclaveNetworkController::new(
            EnclaveNetworkConfig::for_testing(),
            Arc::new(FixedTimeSource::new(7)),
        )
        .unwrap();
        let ctx = OperationContext::new();
        controller.add_service(sid("alpha"), None, &ctx).await.unwrap();
        controller.add_service(sid("beta"), None, &ctx).await.unwrap();

        let (alpha, alpha_exec) = attach_iptables(&controller, "alpha", RetryPolicy::NONE).await;
        let (beta, beta_exec) = attach_iptables(&controller, "beta", RetryPolicy::NONE).await;

        // init, then the initial (empty) push swaps to the second chain
        assert_eq!(alpha_exec.commands().len(), 2);
        assert_eq!(alpha.live_chain().await, Some(EnclaveChain::Second));

        let report = controller
            .repartition(
                RepartitionRequest::new(PartitionConnection::CONNECTED)
                    .partition("left", ["alpha"])
                    .partition("right", ["beta"])
                    .connection("left", "right", PartitionConnection::BLOCKED),
                &ctx,
            )
            .await
            .unwrap();
        assert!(report.is_clean());

        let alpha_lines = alpha_exec.command_lines();
        assert_eq!(
            alpha_lines.last().unwrap(),
            "iptables -F ENCLAVE1 \
             && iptables -A ENCLAVE1 -s 10.0.0.3 -j DROP \
             && iptables -A ENCLAVE1 -d 10.0.0.3 -j DROP \
             && iptables -R INPUT 1 -j ENCLAVE1 && iptables -R OUTPUT 1 -j ENCLAVE1"
        );
        assert!(beta_exec
            .command_lines()
            .last()
            .unwrap()
            .contains("-s 10.0.0.2 -j DROP"));
        assert_eq!(alpha.live_chain().await, Some(EnclaveChain::First));
        assert_eq!(beta.live_chain().await, Some(EnclaveChain::First));

        // Healing the split flushes the rules on the other chain.
        controller
            .set_partition_connection(
                &"left".into(),
                &"right".into(),
                PartitionConnection::CONNECTED,
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(
            alpha_exec.command_lines().last().unwrap(),
            "iptables -F ENCLAVE2 && iptables -R INPUT 1 -j ENCLAVE2 && iptables -R OUTPUT 1 -j ENCLAVE2"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_exec_failure_is_retried_inside_the_sidecar() {
        let config = EnclaveNetworkConfig::for_testing();
        let controller =
            EnclaveNetworkController::new(config.clone(), Arc::new(FixedTimeSource::new(7)))
                .unwrap();
        let ctx = OperationContext::new();
        controller.add_service(sid("alpha"), None, &ctx).await.unwrap();
        let beta_ip = controller.add_service(sid("beta"), None, &ctx).await.unwrap().ip;
        assert_eq!(beta_ip, Ipv4Addr::new(10, 0, 0, 3));

        let retry = RetryPolicy {
            attempts: 2,
            ..config.retry_policy()
        };
        let (_, alpha_exec) = attach_iptables(&controller, "alpha", retry).await;
        alpha_exec.fail_next(SidecarError::Unavailable("container restarting".into()));

        let report = controller
            .set_default_connection(PartitionConnection::BLOCKED, &ctx)
            .await
            .unwrap();
        // Same partition: nothing to push yet.
        assert_eq!(report.attempted(), 0);

        controller.create_partition("solo".into()).await.unwrap();
        let report = controller
            .move_service(&sid("beta"), &"solo".into(), &ctx)
            .await
            .unwrap();
        assert_eq!(report.outcome(&sid("alpha")), Some(&Ok(())));

        // init, initial push, failed attempt, successful retry
        let lines = alpha_exec.command_lines();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[2], lines[3]);
        assert!(lines[3].contains("-d 10.0.0.3 -j DROP"));
    }
}
