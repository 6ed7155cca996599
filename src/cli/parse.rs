//! CLI parse: clap types for bepstream. No behavior; definitions only.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::lifecycle::UploadMode;

/// bepstream - stream build events to files and a remote backend
#[derive(Parser)]
#[command(name = "bepstream")]
#[command(about = "Replay build event streams through the upload lifecycle")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Workspace root directory
    #[arg(long, default_value = ".")]
    pub workspace: PathBuf,

    /// Configuration file path (replaces global and workspace files)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long, default_value = "false")]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Log output (stdout, stderr, file)
    #[arg(long)]
    pub log_output: Option<String>,

    /// Log file path (if output is "file")
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Replay a recorded JSON-lines event stream as one or more invocations
    Replay(ReplayArgs),
    /// Show the effective configuration
    Config {
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
}

#[derive(Args, Debug, Clone)]
pub struct ReplayArgs {
    /// JSON-lines file of recorded build events
    #[arg(long)]
    pub events: PathBuf,

    /// Command name each invocation runs as
    #[arg(long, default_value = "build")]
    pub command_name: String,

    /// Number of consecutive invocations sharing one server process
    #[arg(long, default_value_t = 1)]
    pub invocations: usize,

    /// Write a text build event file
    #[arg(long)]
    pub text_file: Option<PathBuf>,

    /// Write a JSON build event file
    #[arg(long)]
    pub json_file: Option<PathBuf>,

    /// Write a binary build event file
    #[arg(long)]
    pub binary_file: Option<PathBuf>,

    /// Remote backend endpoint (http:// or https://)
    #[arg(long)]
    pub backend: Option<String>,

    /// Close timeout for the remote backend, in seconds (0 = none)
    #[arg(long)]
    pub bes_timeout_secs: Option<u64>,

    /// blocking, non_blocking or fully_async
    #[arg(long)]
    pub upload_mode: Option<UploadMode>,

    /// Keep the backend client between invocations
    #[arg(long)]
    pub keep_backend_connections: bool,

    /// Output format (text or json)
    #[arg(long, default_value = "text")]
    pub format: String,
}
