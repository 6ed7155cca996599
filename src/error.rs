//! Error types for the build event upload subsystem.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Per-sink errors.
///
/// These travel through shared completion futures, so they are `Clone` and carry
/// rendered messages rather than the underlying I/O or HTTP error values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("Unable to open build event sink '{sink}': {reason}")]
    Construction { sink: String, reason: String },

    #[error("Build event upload to '{sink}' failed: {reason}")]
    Transmission { sink: String, reason: String },

    #[error("Build event upload to '{sink}' timed out after {}s", .timeout.as_secs())]
    CloseTimeout { sink: String, timeout: Duration },

    #[error("Build event upload to '{sink}' was cancelled")]
    Cancelled { sink: String },

    #[error("Build event upload to '{sink}' was aborted")]
    Aborted { sink: String },
}

impl SinkError {
    pub fn sink(&self) -> &str {
        match self {
            SinkError::Construction { sink, .. }
            | SinkError::Transmission { sink, .. }
            | SinkError::CloseTimeout { sink, .. }
            | SinkError::Cancelled { sink }
            | SinkError::Aborted { sink } => sink,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SinkError::CloseTimeout { .. })
    }
}

/// Invalid option combination, detected before any sink opens.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid build event upload configuration: {}", .problems.join("; "))]
pub struct ConfigurationError {
    pub problems: Vec<String>,
}

impl ConfigurationError {
    pub fn new(problem: impl Into<String>) -> Self {
        Self {
            problems: vec![problem.into()],
        }
    }
}

impl From<config::ConfigError> for ConfigurationError {
    fn from(err: config::ConfigError) -> Self {
        ConfigurationError::new(err.to_string())
    }
}

/// Exit classification carried by an abrupt exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExitCode {
    EnvironmentalError,
    TransientUploadError,
    InternalError,
}

impl ExitCode {
    /// Numeric process exit status, matching the conventions of build tools.
    pub fn as_i32(self) -> i32 {
        match self {
            ExitCode::EnvironmentalError => 36,
            ExitCode::TransientUploadError => 38,
            ExitCode::InternalError => 37,
        }
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ExitCode::EnvironmentalError => "environmental-error",
            ExitCode::TransientUploadError => "transient-upload-error",
            ExitCode::InternalError => "internal-error",
        };
        f.write_str(label)
    }
}

/// Typed abrupt-exit signal raised by host lifecycle hooks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} ({code})")]
pub struct AbruptExit {
    pub message: String,
    pub code: ExitCode,
}

impl AbruptExit {
    pub fn new(message: impl Into<String>, code: ExitCode) -> Self {
        Self {
            message: message.into(),
            code,
        }
    }
}

/// Errors surfaced by the lifecycle manager and host hooks.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("Lifecycle operation '{op}' is not allowed in state {state}")]
    InvalidTransition { op: &'static str, state: String },

    #[error(transparent)]
    Abrupt(#[from] AbruptExit),
}

impl From<config::ConfigError> for UploadError {
    fn from(err: config::ConfigError) -> Self {
        UploadError::Configuration(err.into())
    }
}

impl UploadError {
    /// Convert into the abrupt-exit signal a host hook raises.
    pub fn into_abrupt_exit(self) -> AbruptExit {
        match self {
            UploadError::Configuration(err) => {
                AbruptExit::new(err.to_string(), ExitCode::EnvironmentalError)
            }
            UploadError::Sink(err) if err.is_timeout() => {
                AbruptExit::new(err.to_string(), ExitCode::TransientUploadError)
            }
            UploadError::Sink(err) => AbruptExit::new(err.to_string(), ExitCode::EnvironmentalError),
            err @ UploadError::InvalidTransition { .. } => {
                AbruptExit::new(err.to_string(), ExitCode::InternalError)
            }
            UploadError::Abrupt(exit) => exit,
        }
    }
}
