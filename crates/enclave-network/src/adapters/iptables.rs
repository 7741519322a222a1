//! # iptables Networking Sidecar
//!
//! [`NetworkingSidecar`] backed by iptables inside the service's sidecar
//! container.
//!
//! Two custom chains alternate as the live chain. An update rebuilds the
//! background chain from scratch, then repoints rule 1 of `INPUT` and
//! `OUTPUT` at it, so the service never runs with a half-built rule set.

use crate::domain::{Blocklist, ServiceId, SidecarError};
use crate::ports::{NetworkingSidecar, SidecarExecutor};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const IPTABLES: &str = "iptables";
const FIRST_RULE: &str = "1"; // iptables chains are 1-indexed
const INTRINSIC_CHAINS: [&str; 2] = ["INPUT", "OUTPUT"];

/// One of the two alternating enclave chains.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnclaveChain {
    /// Live chain right after initialization.
    First,
    /// The other one.
    Second,
}

impl EnclaveChain {
    /// iptables chain name.
    pub fn name(self) -> &'static str {
        match self {
            Self::First => "ENCLAVE1",
            Self::Second => "ENCLAVE2",
        }
    }

    /// The chain that is not `self`.
    pub fn other(self) -> Self {
        match self {
            Self::First => Self::Second,
            Self::Second => Self::First,
        }
    }
}

/// Bounded retry with exponential backoff around a single exec call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first failure.
    pub attempts: u32,
    /// Sleep before the first retry; doubled for each later one.
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    /// Single attempt.
    pub const NONE: Self = Self {
        attempts: 0,
        initial_backoff: Duration::ZERO,
    };

    fn backoff(&self, retry: u32) -> Duration {
        self.initial_backoff
            .saturating_mul(2u32.saturating_pow(retry))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::NONE
    }
}

/// Create both chains and jump into the first from `INPUT` and `OUTPUT`.
pub fn init_command() -> Vec<String> {
    let mut cmd = vec![
        IPTABLES.to_string(),
        "-N".to_string(),
        EnclaveChain::First.name().to_string(),
        "&&".to_string(),
        IPTABLES.to_string(),
        "-N".to_string(),
        EnclaveChain::Second.name().to_string(),
    ];
    for intrinsic in INTRINSIC_CHAINS {
        cmd.extend(
            [
                "&&",
                IPTABLES,
                "-I",
                intrinsic,
                FIRST_RULE,
                "-j",
                EnclaveChain::First.name(),
            ]
            .map(String::from),
        );
    }
    cmd
}

/// Rebuild `background` to drop `blocked` and make it the live chain.
///
/// Addresses come out sorted and deduplicated because [`Blocklist`] is an
/// ordered set.
pub fn update_command(background: EnclaveChain, blocked: &Blocklist) -> Vec<String> {
    let chain = background.name();
    let mut cmd: Vec<String> = [IPTABLES, "-F", chain].map(String::from).to_vec();

    if !blocked.is_empty() {
        let ips = blocked
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        for direction in ["-s", "-d"] {
            cmd.extend(["&&", IPTABLES, "-A", chain, direction].map(String::from));
            cmd.push(ips.clone());
            cmd.extend(["-j", "DROP"].map(String::from));
        }
    }

    for intrinsic in INTRINSIC_CHAINS {
        cmd.extend(["&&", IPTABLES, "-R", intrinsic, FIRST_RULE, "-j", chain].map(String::from));
    }
    cmd
}

/// Sidecar that programs iptables through a [`SidecarExecutor`].
pub struct IpTablesSidecar<E: SidecarExecutor> {
    service_id: ServiceId,
    executor: E,
    retry: RetryPolicy,
    /// Live chain; `None` until initialized. Held across exec so updates to
    /// one sidecar never interleave.
    chain_in_use: Mutex<Option<EnclaveChain>>,
}

impl<E: SidecarExecutor> IpTablesSidecar<E> {
    /// Sidecar for `service_id`, not yet initialized.
    pub fn new(service_id: ServiceId, executor: E, retry: RetryPolicy) -> Self {
        Self {
            service_id,
            executor,
            retry,
            chain_in_use: Mutex::new(None),
        }
    }

    /// Chain currently jumped to from `INPUT`/`OUTPUT`.
    pub async fn live_chain(&self) -> Option<EnclaveChain> {
        *self.chain_in_use.lock().await
    }

    /// The wrapped executor.
    pub fn executor(&self) -> &E {
        &self.executor
    }

    async fn exec_with_retry(&self, command: &[String]) -> Result<(), SidecarError> {
        let mut retry = 0;
        loop {
            match self.executor.exec(command).await {
                Ok(()) => return Ok(()),
                Err(e) if retry < self.retry.attempts => {
                    let backoff = self.retry.backoff(retry);
                    warn!(
                        service_id = %self.service_id,
                        error = %e,
                        retry = retry + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        "[enclave-net] Sidecar exec failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    retry += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl<E: SidecarExecutor> NetworkingSidecar for IpTablesSidecar<E> {
    async fn initialize(&self) -> Result<(), SidecarError> {
        let mut chain_in_use = self.chain_in_use.lock().await;
        if chain_in_use.is_some() {
            return Ok(());
        }

        let cmd = init_command();
        debug!(
            service_id = %self.service_id,
            "[enclave-net] Running iptables init: {}",
            cmd.join(" ")
        );
        self.exec_with_retry(&cmd).await?;
        *chain_in_use = Some(EnclaveChain::First);
        info!(service_id = %self.service_id, "[enclave-net] Sidecar iptables initialized");
        Ok(())
    }

    async fn update_blocked_ips(&self, blocked: &Blocklist) -> Result<(), SidecarError> {
        let mut chain_in_use = self.chain_in_use.lock().await;
        let primary = chain_in_use.ok_or(SidecarError::NotInitialized)?;
        let background = primary.other();

        let cmd = update_command(background, blocked);
        debug!(
            service_id = %self.service_id,
            "[enclave-net] Running iptables update: {}",
            cmd.join(" ")
        );
        self.exec_with_retry(&cmd).await?;
        *chain_in_use = Some(background);
        info!(
            service_id = %self.service_id,
            blocked = blocked.len(),
            chain = background.name(),
            "[enclave-net] Sidecar iptables updated"
        );
        Ok(())
    }
}
