//! Concrete sinks: local files per encoding and the remote backend.

pub mod factory;
pub mod file;
pub mod remote;

pub use factory::{open_sinks, OpenedSinks};
pub use file::{open_file_sink, FileWriter};
pub use remote::{AckStatus, BackendClient, EventBatch, HttpBackendClient, RemoteWriter};

pub const TEXT_FILE_SINK: &str = "text_file";
pub const JSON_FILE_SINK: &str = "json_file";
pub const BINARY_FILE_SINK: &str = "binary_file";
pub const BACKEND_SINK: &str = "backend";
