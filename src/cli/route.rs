//! CLI route: loads configuration and dispatches subcommands.

use anyhow::Context;
use serde::Serialize;
use serde_json::json;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use super::output::{format_config, format_replay_summary, ConsoleReporter};
use super::parse::{Commands, ReplayArgs};
use crate::config::{BackendOptions, BepConfig, ConfigLoader, FileSinkOptions, UploadOptions};
use crate::error::ExitCode;
use crate::event::BuildEvent;
use crate::lifecycle::UploadReport;
use crate::module::{CommandEnvironment, UploadModule};
use crate::reporter::Reporter;

/// Result of one replayed invocation.
#[derive(Debug, Clone, Serialize)]
pub struct InvocationSummary {
    pub index: usize,
    pub invocation_id: String,
    pub report: UploadReport,
}

/// What the binary prints and how it exits.
#[derive(Debug)]
pub struct ReplayOutcome {
    pub rendered: String,
    pub exit_code: Option<ExitCode>,
}

pub struct RunContext {
    workspace: PathBuf,
    config_path: Option<PathBuf>,
}

impl RunContext {
    pub fn new(workspace: PathBuf, config_path: Option<PathBuf>) -> Self {
        Self {
            workspace,
            config_path,
        }
    }

    pub fn load_config(&self) -> anyhow::Result<BepConfig> {
        let config = match &self.config_path {
            Some(path) => ConfigLoader::load_from_file(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => ConfigLoader::load(&self.workspace)?,
        };
        Ok(config)
    }

    pub async fn execute(&self, command: &Commands) -> anyhow::Result<ReplayOutcome> {
        let config = self.load_config()?;
        match command {
            Commands::Replay(args) => self.replay(config.upload, args).await,
            Commands::Config { format } => Ok(ReplayOutcome {
                rendered: format_config(&config, format)?,
                exit_code: None,
            }),
        }
    }

    async fn replay(&self, options: UploadOptions, args: &ReplayArgs) -> anyhow::Result<ReplayOutcome> {
        let events = read_events(&args.events)?;
        let options = apply_overrides(options, args);
        let reporter: Arc<dyn Reporter> = Arc::new(ConsoleReporter::stderr());
        let module = UploadModule::new();

        let mut summaries = Vec::with_capacity(args.invocations);
        for index in 1..=args.invocations.max(1) {
            let env = CommandEnvironment::new(&args.command_name, options.clone(), reporter.clone());
            let invocation_id = env.invocation_id.clone();
            let bus = module.before_command(env).await?;
            if let Some(out_err) = module.output_listener() {
                writeln!(out_err.err(), "Replaying {} recorded build events", events.len())?;
            }
            for event in &events {
                bus.produce(event.clone());
            }
            if !bus.finished() {
                bus.produce(BuildEvent::last(
                    "build_finished",
                    json!({ "exit_code": 0, "replayed_events": events.len() }),
                ));
            }
            let report = module.after_command().await?;
            info!(index, invocation_id = %invocation_id, "replayed invocation");
            summaries.push(InvocationSummary {
                index,
                invocation_id,
                report,
            });
        }
        module.shutdown().await;

        let exit_code = summaries.iter().filter_map(|s| s.report.exit_code()).max();
        Ok(ReplayOutcome {
            rendered: format_replay_summary(&summaries, &args.format)?,
            exit_code,
        })
    }
}

/// Parse a JSON-lines recording. Blank lines are skipped.
pub(crate) fn read_events(path: &Path) -> anyhow::Result<Vec<BuildEvent>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read events from {}", path.display()))?;
    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str::<BuildEvent>(line)
                .with_context(|| format!("{}:{}: invalid build event", path.display(), n + 1))
        })
        .collect()
}

/// CLI flags take precedence over every config layer.
pub(crate) fn apply_overrides(mut options: UploadOptions, args: &ReplayArgs) -> UploadOptions {
    if let Some(path) = &args.text_file {
        options.text_file = Some(FileSinkOptions::new(path));
    }
    if let Some(path) = &args.json_file {
        options.json_file = Some(FileSinkOptions::new(path));
    }
    if let Some(path) = &args.binary_file {
        options.binary_file = Some(FileSinkOptions::new(path));
    }
    if let Some(endpoint) = &args.backend {
        let backend = options
            .backend
            .take()
            .map(|b| BackendOptions {
                endpoint: endpoint.clone(),
                ..b
            })
            .unwrap_or_else(|| BackendOptions::new(endpoint));
        options.backend = Some(backend);
    }
    if let (Some(secs), Some(backend)) = (args.bes_timeout_secs, options.backend.as_mut()) {
        backend.timeout_secs = secs;
    }
    if let Some(mode) = args.upload_mode {
        options.upload_mode = mode;
    }
    if args.keep_backend_connections {
        options.keep_backend_connections = true;
    }
    if !options.allows_command(&args.command_name) {
        options.allowed_commands.push(args.command_name.clone());
    }
    options
}
