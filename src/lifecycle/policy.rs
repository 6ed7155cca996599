//! Wait policy, lifecycle states and grace periods.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// How `end_invocation` waits for sinks to finish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadMode {
    /// Wait for every completion future, each bounded by its sink's timeout.
    #[default]
    Blocking,
    /// Return immediately; the next invocation waits for full completion.
    NonBlocking,
    /// Return immediately; the next invocation only waits for half-close.
    FullyAsync,
}

impl UploadMode {
    pub fn as_str(self) -> &'static str {
        match self {
            UploadMode::Blocking => "blocking",
            UploadMode::NonBlocking => "non_blocking",
            UploadMode::FullyAsync => "fully_async",
        }
    }
}

impl fmt::Display for UploadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "blocking" => Ok(UploadMode::Blocking),
            "non_blocking" | "nowait" => Ok(UploadMode::NonBlocking),
            "fully_async" => Ok(UploadMode::FullyAsync),
            other => Err(format!(
                "unknown upload mode '{}' (expected blocking, non_blocking or fully_async)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    WaitingPrevious,
    Active,
    Closing,
    /// Absorbing: reached from `Active` or `Closing` when the host crashes.
    Crashed,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Idle => "IDLE",
            LifecycleState::WaitingPrevious => "WAITING_PREVIOUS",
            LifecycleState::Active => "ACTIVE",
            LifecycleState::Closing => "CLOSING",
            LifecycleState::Crashed => "CRASHED",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bounds on every wait the manager performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleConfig {
    pub previous_invocation_grace: Duration,
    pub crash_grace: Duration,
    pub shutdown_grace: Duration,
    /// Coarse ceiling on a blocking `end_invocation`, layered over the
    /// per-sink timeouts.
    pub max_blocking_wait: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            previous_invocation_grace: Duration::from_secs(5),
            crash_grace: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(5),
            max_blocking_wait: Duration::from_secs(60 * 60),
        }
    }
}
