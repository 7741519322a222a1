//! # Outbound Ports
//!
//! Capabilities the enclave network core consumes from its collaborators:
//! per-service networking sidecars, exec into sidecar containers and a clock.

use crate::domain::{Blocklist, SidecarError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Per-service helper that programs the service's packet filter.
///
/// `update_blocked_ips` is a full replacement: after it returns `Ok` the
/// sidecar drops traffic to and from exactly the given addresses. Calling it
/// twice with the same set leaves the same end state.
#[async_trait]
pub trait NetworkingSidecar: Send + Sync {
    /// Prepare the packet filter. Called once when the sidecar is attached.
    async fn initialize(&self) -> Result<(), SidecarError>;

    /// Replace the blocked set.
    async fn update_blocked_ips(&self, blocked: &Blocklist) -> Result<(), SidecarError>;
}

/// Runs a shell command inside a sidecar container.
///
/// `command` is a tokenized command line; `&&` tokens chain sub-commands.
#[async_trait]
pub trait SidecarExecutor: Send + Sync {
    /// Execute the command; non-zero exit is an error.
    async fn exec(&self, command: &[String]) -> Result<(), SidecarError>;
}

/// Wall clock used to stamp registrations.
pub trait TimeSource: Send + Sync {
    /// Unix time in milliseconds.
    fn now_millis(&self) -> u64;
}

// =============================================================================
// Mock Implementations for Testing
// =============================================================================

#[derive(Debug, Default)]
struct InMemorySidecarState {
    initialized: bool,
    current: Option<Blocklist>,
    applied: Vec<Blocklist>,
    fail_with: Option<SidecarError>,
    fail_after_apply: Option<SidecarError>,
    delay: Option<Duration>,
    init_delay: Option<Duration>,
}

/// Sidecar that keeps its blocked set in memory.
///
/// Clones share state, so a test can keep one handle while the controller
/// owns another.
#[derive(Clone, Debug, Default)]
pub struct InMemorySidecar {
    state: Arc<Mutex<InMemorySidecarState>>,
}

impl InMemorySidecar {
    /// Healthy sidecar.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sidecar whose updates fail with `error` until [`Self::heal`].
    pub fn failing(error: SidecarError) -> Self {
        let sidecar = Self::new();
        sidecar.state.lock().fail_with = Some(error);
        sidecar
    }

    /// Sidecar whose updates take effect but then report `error`, like an
    /// exec that ran and lost its exit status.
    pub fn applies_then_fails(error: SidecarError) -> Self {
        let sidecar = Self::new();
        sidecar.state.lock().fail_after_apply = Some(error);
        sidecar
    }

    /// Sidecar whose `initialize` sleeps for `delay`.
    pub fn slow_init(delay: Duration) -> Self {
        let sidecar = Self::new();
        sidecar.state.lock().init_delay = Some(delay);
        sidecar
    }

    /// Sidecar that sleeps for `delay` before every update.
    pub fn slow(delay: Duration) -> Self {
        let sidecar = Self::new();
        sidecar.state.lock().delay = Some(delay);
        sidecar
    }

    /// Stop failing and stop delaying.
    pub fn heal(&self) {
        let mut state = self.state.lock();
        state.fail_with = None;
        state.fail_after_apply = None;
        state.delay = None;
        state.init_delay = None;
    }

    /// Blocked set currently in force, if any update took effect.
    pub fn current(&self) -> Option<Blocklist> {
        self.state.lock().current.clone()
    }

    /// Every applied set, oldest first.
    pub fn applied(&self) -> Vec<Blocklist> {
        self.state.lock().applied.clone()
    }

    /// Number of updates that took effect.
    pub fn update_count(&self) -> usize {
        self.state.lock().applied.len()
    }

    /// True once `initialize` has run.
    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }
}

#[async_trait]
impl NetworkingSidecar for InMemorySidecar {
    async fn initialize(&self) -> Result<(), SidecarError> {
        let delay = self.state.lock().init_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.state.lock().initialized = true;
        Ok(())
    }

    async fn update_blocked_ips(&self, blocked: &Blocklist) -> Result<(), SidecarError> {
        let delay = self.state.lock().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if let Some(error) = state.fail_with.clone() {
            return Err(error);
        }
        state.current = Some(blocked.clone());
        state.applied.push(blocked.clone());
        match state.fail_after_apply.clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Clock frozen at a settable instant.
#[derive(Debug, Default)]
pub struct FixedTimeSource {
    millis: AtomicU64,
}

impl FixedTimeSource {
    /// Clock reading `millis`.
    pub fn new(millis: u64) -> Self {
        Self {
            millis: AtomicU64::new(millis),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by_millis: u64) {
        self.millis.fetch_add(by_millis, Ordering::SeqCst);
    }
}

impl TimeSource for FixedTimeSource {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// Executor that records every command and can be scripted to fail.
#[derive(Clone, Debug, Default)]
pub struct RecordingExecutor {
    commands: Arc<Mutex<Vec<Vec<String>>>>,
    scripted_failures: Arc<Mutex<VecDeque<SidecarError>>>,
}

impl RecordingExecutor {
    /// Executor that always succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next call with `error`. Queued failures are consumed in order.
    pub fn fail_next(&self, error: SidecarError) {
        self.scripted_failures.lock().push_back(error);
    }

    /// Every command attempted, including failed ones.
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.commands.lock().clone()
    }

    /// Commands joined with spaces, for readable assertions.
    pub fn command_lines(&self) -> Vec<String> {
        self.commands
            .lock()
            .iter()
            .map(|tokens| tokens.join(" "))
            .collect()
    }
}

#[async_trait]
impl SidecarExecutor for RecordingExecutor {
    async fn exec(&self, command: &[String]) -> Result<(), SidecarError> {
        self.commands.lock().push(command.to_vec());
        match self.scripted_failures.lock().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}
