//! # Enclave Network Configuration
//!
//! Per-enclave settings, loaded from TOML or built in code.
//!
//! ```toml
//! enclave_id = "e2e-suite"
//! subnet = "10.8.0.0/24"
//! reserved_addresses = ["10.8.0.1"]
//! default_connection_blocked = false
//! max_concurrent_sidecar_updates = 8
//! sidecar_timeout_ms = 10000
//! ```

use crate::adapters::RetryPolicy;
use crate::domain::{
    ConfigError, DEFAULT_CONNECTION_BLOCKED, DEFAULT_MAX_CONCURRENT_SIDECAR_UPDATES,
    DEFAULT_PARTITION_ID, DEFAULT_SIDECAR_TIMEOUT_MS,
};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

/// Enclave network configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnclaveNetworkConfig {
    /// Identifier used in logs and errors.
    pub enclave_id: String,

    /// Flat subnet all services of the enclave share.
    pub subnet: Ipv4Net,

    /// Addresses never handed to services (gateway, API container).
    pub reserved_addresses: Vec<Ipv4Addr>,

    /// Partition new services land in.
    pub default_partition: String,

    /// Fallback connectivity for partition pairs without an override.
    pub default_connection_blocked: bool,

    /// When false, partition operations are refused and no blocklists are pushed.
    pub partitioning_enabled: bool,

    /// Upper bound on simultaneous sidecar updates.
    pub max_concurrent_sidecar_updates: usize,

    /// Per-sidecar deadline in milliseconds.
    pub sidecar_timeout_ms: u64,

    /// Extra attempts for a failed sidecar exec.
    pub sidecar_retry_attempts: u32,

    /// Backoff before the first retry; doubles on each further retry.
    pub sidecar_retry_backoff_ms: u64,
}

impl Default for EnclaveNetworkConfig {
    fn default() -> Self {
        Self {
            enclave_id: "enclave".to_string(),
            subnet: Ipv4Net::new(Ipv4Addr::new(172, 23, 0, 0), 16)
                .unwrap_or_else(|_| Ipv4Net::default()),
            reserved_addresses: vec![Ipv4Addr::new(172, 23, 0, 1)],
            default_partition: DEFAULT_PARTITION_ID.to_string(),
            default_connection_blocked: DEFAULT_CONNECTION_BLOCKED,
            partitioning_enabled: true,
            max_concurrent_sidecar_updates: DEFAULT_MAX_CONCURRENT_SIDECAR_UPDATES,
            sidecar_timeout_ms: DEFAULT_SIDECAR_TIMEOUT_MS,
            sidecar_retry_attempts: 2,
            sidecar_retry_backoff_ms: 100,
        }
    }
}

impl EnclaveNetworkConfig {
    /// Create a config for testing (small subnet, short deadlines).
    pub fn for_testing() -> Self {
        Self {
            enclave_id: "test-enclave".to_string(),
            subnet: Ipv4Net::new(Ipv4Addr::new(10, 0, 0, 0), 24)
                .unwrap_or_else(|_| Ipv4Net::default()),
            reserved_addresses: vec![Ipv4Addr::new(10, 0, 0, 1)],
            max_concurrent_sidecar_updates: 4,
            sidecar_timeout_ms: 500,
            sidecar_retry_attempts: 0,
            sidecar_retry_backoff_ms: 1,
            ..Self::default()
        }
    }

    /// Parse and validate TOML.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&text)
    }

    /// Reject values the enclave cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enclave_id.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "enclave_id",
                reason: "must not be empty".into(),
            });
        }
        if self.default_partition.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "default_partition",
                reason: "must not be empty".into(),
            });
        }
        if self.subnet.prefix_len() >= 31 {
            return Err(ConfigError::Invalid {
                field: "subnet",
                reason: format!("{} has no usable host addresses", self.subnet),
            });
        }
        if let Some(ip) = self
            .reserved_addresses
            .iter()
            .find(|ip| !self.subnet.contains(*ip))
        {
            return Err(ConfigError::Invalid {
                field: "reserved_addresses",
                reason: format!("{} is outside {}", ip, self.subnet),
            });
        }
        if self.max_concurrent_sidecar_updates == 0 {
            return Err(ConfigError::Invalid {
                field: "max_concurrent_sidecar_updates",
                reason: "must be at least 1".into(),
            });
        }
        if self.sidecar_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "sidecar_timeout_ms",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }

    /// Per-sidecar deadline.
    pub fn sidecar_timeout(&self) -> Duration {
        Duration::from_millis(self.sidecar_timeout_ms)
    }

    /// Retry settings for sidecar exec calls.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.sidecar_retry_attempts,
            initial_backoff: Duration::from_millis(self.sidecar_retry_backoff_ms),
        }
    }
}
