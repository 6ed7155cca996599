//! Per-sink outcome summary returned by `end_invocation`.

use serde::Serialize;

use crate::error::{ExitCode, SinkError};
use crate::lifecycle::policy::UploadMode;
use crate::transport::FutureMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum SinkStatus {
    Succeeded,
    Failed(String),
    TimedOut,
    Cancelled,
    /// Still draining in the background.
    Pending,
}

impl SinkStatus {
    pub fn from_result(result: Option<Result<(), SinkError>>) -> Self {
        match result {
            None => SinkStatus::Pending,
            Some(Ok(())) => SinkStatus::Succeeded,
            Some(Err(SinkError::CloseTimeout { .. })) => SinkStatus::TimedOut,
            Some(Err(SinkError::Cancelled { .. })) => SinkStatus::Cancelled,
            Some(Err(err)) => SinkStatus::Failed(err.to_string()),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SinkStatus::Succeeded => "succeeded",
            SinkStatus::Failed(_) => "failed",
            SinkStatus::TimedOut => "timed out",
            SinkStatus::Cancelled => "cancelled",
            SinkStatus::Pending => "pending",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SinkOutcome {
    pub name: String,
    pub status: SinkStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UploadReport {
    pub mode: UploadMode,
    pub outcomes: Vec<SinkOutcome>,
}

impl UploadReport {
    pub fn empty(mode: UploadMode) -> Self {
        Self {
            mode,
            outcomes: Vec::new(),
        }
    }

    /// Snapshot of every entry's current resolution.
    pub fn from_map(mode: UploadMode, map: &FutureMap) -> Self {
        let outcomes = map
            .iter()
            .map(|entry| SinkOutcome {
                name: entry.name().to_string(),
                status: SinkStatus::from_result(entry.peek()),
            })
            .collect();
        Self { mode, outcomes }
    }

    pub fn outcome(&self, name: &str) -> Option<&SinkStatus> {
        self.outcomes
            .iter()
            .find(|o| o.name == name)
            .map(|o| &o.status)
    }

    pub fn all_succeeded(&self) -> bool {
        self.outcomes
            .iter()
            .all(|o| o.status == SinkStatus::Succeeded)
    }

    /// Most severe exit classification implied by the outcomes. Pending sinks
    /// are not failures yet.
    pub fn exit_code(&self) -> Option<ExitCode> {
        self.outcomes
            .iter()
            .filter_map(|o| match o.status {
                SinkStatus::Succeeded | SinkStatus::Pending => None,
                SinkStatus::TimedOut | SinkStatus::Cancelled | SinkStatus::Failed(_) => {
                    Some(ExitCode::TransientUploadError)
                }
            })
            .max()
    }
}
