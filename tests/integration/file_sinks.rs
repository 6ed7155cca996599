//! Integration tests for local build event files

use async_trait::async_trait;
use bepstream::config::{FileSinkOptions, UploadOptions};
use bepstream::encoding::{decode_binary, EventEncoding};
use bepstream::event::BuildEvent;
use bepstream::lifecycle::{InvocationContext, SinkStatus, UploadLifecycleManager, UploadMode};
use bepstream::module::{CommandEnvironment, UploadModule};
use bepstream::reporter::{CollectingReporter, Reporter};
use bepstream::sinks::{open_file_sink, FileWriter};
use bepstream::transport::{ChannelTransport, EventWriter, Transport};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn replay(bus: &bepstream::EventBus) {
    bus.produce(BuildEvent::new("started", json!({ "command": "build" })));
    bus.produce(BuildEvent::new("target_completed", json!({ "label": "//app:main" })));
    bus.produce(BuildEvent::last("finished", json!({ "exit_code": 0 })));
}

#[tokio::test]
async fn test_all_three_encodings_are_written() {
    let temp = TempDir::new().unwrap();
    let options = UploadOptions {
        text_file: Some(FileSinkOptions::new(temp.path().join("bep.txt"))),
        json_file: Some(FileSinkOptions::new(temp.path().join("bep.json"))),
        binary_file: Some(FileSinkOptions::new(temp.path().join("bep.bin"))),
        ..UploadOptions::default()
    };
    let reporter = Arc::new(CollectingReporter::new());
    let module = UploadModule::new();

    let bus = module
        .before_command(CommandEnvironment::new("build", options, reporter.clone()))
        .await
        .unwrap();
    assert_eq!(
        bus.sink_names(),
        vec!["text_file".to_string(), "json_file".to_string(), "binary_file".to_string()]
    );
    replay(&bus);
    let report = module.after_command().await.unwrap();

    assert!(report.all_succeeded(), "{:?}", report);
    assert!(reporter
        .messages()
        .iter()
        .any(|m| m.text == "Build Event Protocol files produced successfully."));

    let json_lines = std::fs::read_to_string(temp.path().join("bep.json")).unwrap();
    let parsed: Vec<BuildEvent> = json_lines
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(parsed.len(), 3);
    assert_eq!(parsed[1].payload["label"], "//app:main");
    assert!(parsed[2].last_message);

    let text = std::fs::read_to_string(temp.path().join("bep.txt")).unwrap();
    assert_eq!(text.matches("\n---\n").count(), 3);
    assert!(text.contains("type: target_completed"));

    let binary = std::fs::read(temp.path().join("bep.bin")).unwrap();
    let records = decode_binary(&binary).unwrap();
    assert_eq!(records.iter().map(|r| r.sequence).collect::<Vec<_>>(), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_unwritable_path_drops_only_that_sink() {
    let temp = TempDir::new().unwrap();
    let missing_dir = temp.path().join("does-not-exist").join("bep.txt");
    let options = UploadOptions {
        text_file: Some(FileSinkOptions::new(&missing_dir)),
        json_file: Some(FileSinkOptions::new(temp.path().join("bep.json"))),
        ..UploadOptions::default()
    };
    let reporter = Arc::new(CollectingReporter::new());
    let module = UploadModule::new();

    let bus = module
        .before_command(CommandEnvironment::new("build", options, reporter.clone()))
        .await
        .unwrap();
    assert_eq!(bus.sink_names(), vec!["json_file".to_string()]);
    replay(&bus);
    let report = module.after_command().await.unwrap();

    let warnings = reporter.warnings();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].starts_with("Unable to write to '"));
    assert!(warnings[0].contains("Omitting text_file"));
    assert_eq!(report.outcomes.len(), 1);
    assert!(report.all_succeeded());
    assert!(temp.path().join("bep.json").exists());
}

struct BrokenPipe;

#[async_trait]
impl EventWriter for BrokenPipe {
    async fn write(&mut self, event: &BuildEvent) -> anyhow::Result<()> {
        if event.sequence >= 2 {
            anyhow::bail!("connection reset by peer");
        }
        Ok(())
    }

    async fn flush(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn acknowledge(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_transmission_failure_degrades_only_the_failing_sink() {
    let temp = TempDir::new().unwrap();
    let reporter = Arc::new(CollectingReporter::new());
    let shared: Arc<dyn Reporter> = reporter.clone();
    let json = open_file_sink(
        "json_file",
        &FileSinkOptions::new(temp.path().join("bep.json")),
        EventEncoding::Json,
        shared.clone(),
    )
    .unwrap();
    let remote = ChannelTransport::spawn("backend", Duration::from_secs(30), BrokenPipe, shared.clone());
    let transports: Vec<Arc<dyn Transport>> = vec![Arc::new(json), Arc::new(remote)];

    let manager = UploadLifecycleManager::default();
    manager.before_invocation(reporter.as_ref()).await.unwrap();
    let bus = manager
        .start_invocation(InvocationContext::new("req-1", "inv-1", shared), transports)
        .unwrap();
    replay(&bus);
    let report = manager.end_invocation(UploadMode::Blocking).await.unwrap();

    assert_eq!(report.outcome("json_file"), Some(&SinkStatus::Succeeded));
    assert!(matches!(report.outcome("backend"), Some(SinkStatus::Failed(reason)) if reason.contains("connection reset")));
    assert_eq!(reporter.errors().len(), 1);
    assert!(reporter.warnings().is_empty());

    let lines = std::fs::read_to_string(temp.path().join("bep.json")).unwrap();
    assert_eq!(lines.lines().count(), 3);
}

#[tokio::test]
async fn test_file_writer_acknowledges_after_sync() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("bep.json");
    let mut writer = FileWriter::create(&path, EventEncoding::Json).unwrap();
    writer
        .write(&BuildEvent::new("started", json!({})).with_sequence(1))
        .await
        .unwrap();
    writer.flush().await.unwrap();
    writer.acknowledge().await.unwrap();
    assert!(std::fs::read_to_string(&path).unwrap().contains("\"started\""));
}

#[tokio::test]
async fn test_captured_output_lands_in_the_event_file() {
    use std::io::Write;

    let temp = TempDir::new().unwrap();
    let options = UploadOptions {
        json_file: Some(FileSinkOptions::new(temp.path().join("bep.json"))),
        outerr_buffer_size: 16,
        ..UploadOptions::default()
    };
    let reporter = Arc::new(CollectingReporter::new());
    let module = UploadModule::new();

    let bus = module
        .before_command(CommandEnvironment::new("build", options, reporter.clone()))
        .await
        .unwrap();
    let out_err = module.output_listener().unwrap();
    bus.produce(BuildEvent::new("started", json!({ "command": "build" })));
    writeln!(out_err.out(), "Compiling //app:main").unwrap();
    writeln!(out_err.err(), "warning: unused variable").unwrap();
    bus.produce(BuildEvent::last("finished", json!({ "exit_code": 0 })));
    module.after_command().await.unwrap();
    assert!(module.output_listener().is_none());

    let parsed: Vec<BuildEvent> = std::fs::read_to_string(temp.path().join("bep.json"))
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    let kinds: Vec<&str> = parsed.iter().map(|e| e.kind.as_str()).collect();
    // Each line passes the buffer size on its own and is posted as soon as it is written.
    assert_eq!(kinds, vec!["started", "progress", "progress", "finished"]);
    assert_eq!(parsed[1].payload["stdout"], "Compiling //app:main\n");
    assert_eq!(parsed[2].payload["stderr"], "warning: unused variable\n");
    assert_eq!(parsed[3].sequence, 4);
}
