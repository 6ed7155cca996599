//! CLI output: console reporter, summary tables and error mapping.

use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;
use owo_colors::OwoColorize;
use std::io::Write;

use super::route::InvocationSummary;
use crate::config::BepConfig;
use crate::error::AbruptExit;
use crate::lifecycle::SinkStatus;
use crate::reporter::{Message, MessageKind, Notification, Reporter};

/// Reporter that prints user-facing messages to stderr.
pub struct ConsoleReporter {
    color: bool,
}

impl ConsoleReporter {
    pub fn stderr() -> Self {
        Self { color: true }
    }

    pub fn plain() -> Self {
        Self { color: false }
    }

    fn render(&self, message: &Message) -> String {
        let (label, text) = match message.kind {
            MessageKind::Info => ("INFO:", message.text.as_str()),
            MessageKind::Progress => ("", message.text.as_str()),
            MessageKind::Warning => ("WARNING:", message.text.as_str()),
            MessageKind::Error => ("ERROR:", message.text.as_str()),
        };
        if !self.color {
            return if label.is_empty() {
                text.to_string()
            } else {
                format!("{} {}", label, text)
            };
        }
        match message.kind {
            MessageKind::Info => format!("{} {}", label.green(), text),
            MessageKind::Progress => format!("{}", text.dimmed()),
            MessageKind::Warning => format!("{} {}", label.yellow().bold(), text),
            MessageKind::Error => format!("{} {}", label.red().bold(), text),
        }
    }
}

impl Reporter for ConsoleReporter {
    fn handle(&self, message: Message) {
        let line = self.render(&message);
        let _ = writeln!(std::io::stderr(), "{}", line);
    }

    fn post(&self, notification: Notification) {
        tracing::debug!(?notification, "transport notification");
    }
}

pub fn format_section_heading(title: &str) -> String {
    format!("{}", title.bold().underline())
}

fn status_cell(status: &SinkStatus) -> String {
    match status {
        SinkStatus::Succeeded => format!("{}", status.label().green()),
        SinkStatus::Pending => format!("{}", status.label().cyan()),
        SinkStatus::TimedOut | SinkStatus::Cancelled => format!("{}", status.label().yellow()),
        SinkStatus::Failed(_) => format!("{}", status.label().red()),
    }
}

/// Render per-invocation sink outcomes as a table or JSON.
pub fn format_replay_summary(
    summaries: &[InvocationSummary],
    format: &str,
) -> anyhow::Result<String> {
    if format == "json" {
        return Ok(serde_json::to_string_pretty(summaries)?);
    }

    let mut out = String::new();
    out.push_str(&format!("{}\n\n", format_section_heading("Build event uploads")));
    if summaries.iter().all(|s| s.report.outcomes.is_empty()) {
        out.push_str("No build event sinks configured.\n");
        return Ok(out);
    }
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["#", "Invocation", "Mode", "Sink", "Status", "Detail"]);
    for summary in summaries {
        for outcome in &summary.report.outcomes {
            let detail = match &outcome.status {
                SinkStatus::Failed(reason) => reason.clone(),
                _ => String::new(),
            };
            table.add_row(vec![
                summary.index.to_string(),
                summary.invocation_id.clone(),
                summary.report.mode.to_string(),
                outcome.name.clone(),
                status_cell(&outcome.status),
                detail,
            ]);
        }
    }
    out.push_str(&format!("{}\n", table));
    Ok(out)
}

pub fn format_config(config: &BepConfig, format: &str) -> anyhow::Result<String> {
    if format == "json" {
        return Ok(serde_json::to_string_pretty(config)?);
    }
    let upload = &config.upload;
    let mut out = String::new();
    out.push_str(&format!("{}\n\n", format_section_heading("Upload configuration")));
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Sink", "Destination", "Timeout"]);
    for (key, sink) in upload.file_sinks() {
        table.add_row(vec![
            key.to_string(),
            sink.path.display().to_string(),
            timeout_cell(sink.timeout_secs),
        ]);
    }
    if let Some(backend) = &upload.backend {
        table.add_row(vec![
            "backend".to_string(),
            backend.endpoint.clone(),
            timeout_cell(backend.timeout_secs),
        ]);
    }
    out.push_str(&format!("{}\n", table));
    out.push_str(&format!("  Upload mode: {}\n", upload.upload_mode));
    out.push_str(&format!(
        "  Previous invocation grace: {}s\n",
        upload.previous_invocation_grace_secs
    ));
    match upload.validate() {
        Ok(()) => out.push_str(&format!("  Valid: {}\n", "yes".green())),
        Err(err) => {
            out.push_str(&format!("  Valid: {}\n", "no".red()));
            for problem in &err.problems {
                out.push_str(&format!("    - {}\n", problem));
            }
        }
    }
    Ok(out)
}

fn timeout_cell(secs: u64) -> String {
    if secs == 0 {
        "none".to_string()
    } else {
        format!("{}s", secs)
    }
}

/// Map errors to a string for CLI output.
pub fn map_error(e: &anyhow::Error) -> String {
    match e.downcast_ref::<AbruptExit>() {
        Some(exit) => format!("{} (exit code {})", exit.message, exit.code.as_i32()),
        None => format!("{:#}", e),
    }
}
