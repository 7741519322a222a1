//! System clock adapter.

use crate::ports::TimeSource;
use std::time::{SystemTime, UNIX_EPOCH};

/// [`TimeSource`] reading the host wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }
}
