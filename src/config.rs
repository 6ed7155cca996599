//! Configuration
//!
//! Layered configuration for the upload subsystem: built-in defaults, the user's
//! global file, the workspace file, then `BEPSTREAM__` environment variables.
//! Only recognized keys are read; everything is validated before a sink opens.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigurationError;
use crate::lifecycle::{LifecycleConfig, UploadMode};
use crate::logging::LoggingConfig;
use crate::outerr::{DEFAULT_OUTERR_BUFFER_SIZE, DEFAULT_OUTERR_CHUNK_SIZE};

mod facade;
mod merge;
mod sources;

pub use facade::ConfigLoader;
pub use sources::global_file::global_config_path;
pub use sources::workspace_file::WORKSPACE_CONFIG_FILE;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BepConfig {
    #[serde(default)]
    pub upload: UploadOptions,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BepConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.upload.validate()
    }
}

/// A local build event file in one encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSinkOptions {
    pub path: PathBuf,

    /// Close timeout in seconds; 0 means no per-sink bound.
    #[serde(default)]
    pub timeout_secs: u64,
}

impl FileSinkOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            timeout_secs: 0,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Remote streaming backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendOptions {
    pub endpoint: String,

    #[serde(default)]
    pub timeout_secs: u64,

    #[serde(default)]
    pub project_id: Option<String>,

    #[serde(default)]
    pub keywords: Vec<String>,

    /// Prefix of the URL where results for an invocation can be viewed.
    #[serde(default)]
    pub results_url_prefix: Option<String>,

    /// Prefix of the URL describing a build request.
    #[serde(default)]
    pub request_url_prefix: Option<String>,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_ack_poll_interval_ms")]
    pub ack_poll_interval_ms: u64,
}

fn default_batch_size() -> usize {
    64
}

fn default_ack_poll_interval_ms() -> u64 {
    200
}

impl BackendOptions {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout_secs: 0,
            project_id: None,
            keywords: Vec::new(),
            results_url_prefix: None,
            request_url_prefix: None,
            batch_size: default_batch_size(),
            ack_poll_interval_ms: default_ack_poll_interval_ms(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn ack_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ack_poll_interval_ms)
    }
}

/// Recognized upload options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadOptions {
    #[serde(default)]
    pub text_file: Option<FileSinkOptions>,

    #[serde(default)]
    pub json_file: Option<FileSinkOptions>,

    #[serde(default)]
    pub binary_file: Option<FileSinkOptions>,

    #[serde(default)]
    pub backend: Option<BackendOptions>,

    #[serde(default)]
    pub upload_mode: UploadMode,

    /// Keep the backend client alive between commands.
    #[serde(default)]
    pub keep_backend_connections: bool,

    #[serde(default = "default_previous_invocation_grace_secs")]
    pub previous_invocation_grace_secs: u64,

    #[serde(default = "default_crash_grace_secs")]
    pub crash_grace_secs: u64,

    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    #[serde(default = "default_max_blocking_wait_secs")]
    pub max_blocking_wait_secs: u64,

    /// Commands whose events are uploaded. Other commands run with no sinks.
    #[serde(default = "default_allowed_commands")]
    pub allowed_commands: Vec<String>,

    /// Captured stdout/stderr bytes held before they are posted early.
    #[serde(default = "default_outerr_buffer_size")]
    pub outerr_buffer_size: usize,

    /// Largest piece of captured output carried by one event.
    #[serde(default = "default_outerr_chunk_size")]
    pub outerr_chunk_size: usize,
}

fn default_previous_invocation_grace_secs() -> u64 {
    5
}

fn default_crash_grace_secs() -> u64 {
    2
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

fn default_max_blocking_wait_secs() -> u64 {
    60 * 60
}

fn default_outerr_buffer_size() -> usize {
    DEFAULT_OUTERR_BUFFER_SIZE
}

fn default_outerr_chunk_size() -> usize {
    DEFAULT_OUTERR_CHUNK_SIZE
}

fn default_allowed_commands() -> Vec<String> {
    [
        "build", "test", "run", "coverage", "fetch", "query", "cquery", "aquery",
    ]
    .iter()
    .map(|c| c.to_string())
    .collect()
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            text_file: None,
            json_file: None,
            binary_file: None,
            backend: None,
            upload_mode: UploadMode::default(),
            keep_backend_connections: false,
            previous_invocation_grace_secs: default_previous_invocation_grace_secs(),
            crash_grace_secs: default_crash_grace_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            max_blocking_wait_secs: default_max_blocking_wait_secs(),
            allowed_commands: default_allowed_commands(),
            outerr_buffer_size: default_outerr_buffer_size(),
            outerr_chunk_size: default_outerr_chunk_size(),
        }
    }
}

impl UploadOptions {
    /// Check option combinations. Every problem found is reported.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let mut problems = Vec::new();
        let mut paths = HashSet::new();

        for (key, sink) in self.file_sinks() {
            if sink.path.as_os_str().is_empty() {
                problems.push(format!("{}.path cannot be empty", key));
            } else if !paths.insert(sink.path.clone()) {
                problems.push(format!(
                    "{}.path '{}' is already used by another build event file",
                    key,
                    sink.path.display()
                ));
            }
        }

        if let Some(backend) = &self.backend {
            let endpoint = backend.endpoint.trim();
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://"))
                || endpoint.ends_with("://")
            {
                problems.push(format!(
                    "backend.endpoint '{}' must be an http:// or https:// URL",
                    backend.endpoint
                ));
            }
            if backend.batch_size == 0 {
                problems.push("backend.batch_size must be at least 1".to_string());
            }
            if backend.ack_poll_interval_ms == 0 {
                problems.push("backend.ack_poll_interval_ms must be at least 1".to_string());
            }
        }

        if self.outerr_chunk_size == 0 {
            problems.push("outerr_chunk_size must be at least 1".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigurationError { problems })
        }
    }

    /// Configured file sinks as `(key, options)` in fixed encoding order.
    pub fn file_sinks(&self) -> Vec<(&'static str, &FileSinkOptions)> {
        [
            ("text_file", self.text_file.as_ref()),
            ("json_file", self.json_file.as_ref()),
            ("binary_file", self.binary_file.as_ref()),
        ]
        .into_iter()
        .filter_map(|(key, sink)| sink.map(|s| (key, s)))
        .collect()
    }

    pub fn has_sinks(&self) -> bool {
        self.backend.is_some() || !self.file_sinks().is_empty()
    }

    pub fn allows_command(&self, command: &str) -> bool {
        self.allowed_commands.iter().any(|c| c == command)
    }

    pub fn lifecycle_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            previous_invocation_grace: Duration::from_secs(self.previous_invocation_grace_secs),
            crash_grace: Duration::from_secs(self.crash_grace_secs),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            max_blocking_wait: Duration::from_secs(self.max_blocking_wait_secs),
        }
    }
}
