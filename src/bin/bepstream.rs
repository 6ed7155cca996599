//! bepstream CLI Binary
//!
//! Host process for the build event upload lifecycle: replays recorded event
//! streams through the same hooks a build server calls.

use bepstream::cli::{map_error, Cli, RunContext};
use bepstream::config::ConfigLoader;
use bepstream::error::AbruptExit;
use bepstream::logging::{init_logging, LoggingConfig};
use clap::Parser;
use std::process;
use tracing::{error, info};

fn main() {
    let cli = Cli::parse();

    let logging_config = build_logging_config(&cli);
    if let Err(e) = init_logging(Some(&logging_config)) {
        eprintln!("Failed to initialize logging: {}", e);
        process::exit(1);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start async runtime: {}", e);
            process::exit(1);
        }
    };

    let context = RunContext::new(cli.workspace.clone(), cli.config.clone());
    match runtime.block_on(context.execute(&cli.command)) {
        Ok(outcome) => {
            println!("{}", outcome.rendered);
            if let Some(code) = outcome.exit_code {
                info!(%code, "uploads finished with failures");
                process::exit(code.as_i32());
            }
        }
        Err(e) => {
            error!("Command failed: {:#}", e);
            eprintln!("{}", map_error(&e));
            let code = e
                .downcast_ref::<AbruptExit>()
                .map(|exit| exit.code.as_i32())
                .unwrap_or(1);
            process::exit(code);
        }
    }
}

/// Build logging configuration from CLI args and config file.
/// Precedence: CLI flags override config file override defaults.
fn build_logging_config(cli: &Cli) -> LoggingConfig {
    let mut config = match &cli.config {
        Some(path) => ConfigLoader::load_from_file(path)
            .ok()
            .map(|c| c.logging)
            .unwrap_or_default(),
        None => ConfigLoader::load(&cli.workspace)
            .ok()
            .map(|c| c.logging)
            .unwrap_or_default(),
    };

    if cli.verbose {
        config.level = "debug".to_string();
    }
    if let Some(level) = &cli.log_level {
        config.level = level.clone();
    }
    if let Some(format) = &cli.log_format {
        config.format = format.clone();
    }
    if let Some(output) = &cli.log_output {
        config.output = output.clone();
    }
    if let Some(file) = &cli.log_file {
        config.file = file.clone();
    }
    config
}
