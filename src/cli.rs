//! CLI domain: parse, route and output for the `bepstream` host binary.

mod output;
mod parse;
mod route;

pub use output::{format_config, format_replay_summary, map_error, ConsoleReporter};
pub use parse::{Cli, Commands, ReplayArgs};
pub use route::{InvocationSummary, ReplayOutcome, RunContext};
