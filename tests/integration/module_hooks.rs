//! Integration tests for the host lifecycle hooks

use bepstream::config::{BackendOptions, FileSinkOptions, UploadOptions};
use bepstream::error::ExitCode;
use bepstream::event::BuildEvent;
use bepstream::lifecycle::{LifecycleState, SinkStatus, UploadMode};
use bepstream::module::{CommandEnvironment, UploadModule};
use bepstream::reporter::{CollectingReporter, MessageKind};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

use super::test_utils::{counting_connector, FakeBackend};

fn backend_options() -> UploadOptions {
    UploadOptions {
        backend: Some(BackendOptions {
            results_url_prefix: Some("https://results.example.com/invocation/".into()),
            request_url_prefix: Some("https://results.example.com/request/".into()),
            batch_size: 2,
            ack_poll_interval_ms: 10,
            ..BackendOptions::new("https://bes.example.com")
        }),
        ..UploadOptions::default()
    }
}

fn finish(bus: &bepstream::EventBus) {
    bus.produce(BuildEvent::new("started", json!({})));
    bus.produce(BuildEvent::new("progress", json!({})));
    bus.produce(BuildEvent::last("finished", json!({})));
}

#[tokio::test]
async fn test_invalid_configuration_is_an_environmental_exit() {
    let module = UploadModule::new();
    let reporter = Arc::new(CollectingReporter::new());
    let options = UploadOptions {
        backend: Some(BackendOptions::new("bes.example.com:443")),
        ..UploadOptions::default()
    };

    let exit = module
        .before_command(CommandEnvironment::new("build", options, reporter.clone()))
        .await
        .err()
        .unwrap();

    assert_eq!(exit.code, ExitCode::EnvironmentalError);
    assert!(exit.message.contains("backend.endpoint"));
    assert_eq!(reporter.errors().len(), 1);
    assert_eq!(module.manager().state(), LifecycleState::Idle);
}

#[tokio::test]
async fn test_backend_stream_is_published_and_announced() {
    let backend = Arc::new(FakeBackend::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let module = UploadModule::new()
        .with_backend_connector(counting_connector(backend.clone(), calls.clone()));
    let reporter = Arc::new(CollectingReporter::new());
    let env = CommandEnvironment::new("build", backend_options(), reporter.clone())
        .with_build_request_id("req-42");
    let invocation_id = env.invocation_id.clone();

    let bus = module.before_command(env).await.unwrap();
    finish(&bus);
    let report = module.after_command().await.unwrap();

    assert_eq!(report.outcome("backend"), Some(&SinkStatus::Succeeded));
    assert_eq!(backend.published_sequences(), vec![1, 2, 3]);
    let batches = backend.batches.lock();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].build_request_id, "req-42");
    assert!(batches[1].last_batch);
    drop(batches);

    let info = reporter.of_kind(MessageKind::Info);
    assert!(info[0].starts_with("Streaming Build Event Protocol to 'https://bes.example.com'"));
    assert!(info[0].contains("build_request_id: 'req-42'"));
    assert!(info
        .iter()
        .any(|m| m == &format!("Streaming build results to: https://results.example.com/invocation/{}", invocation_id)));
    assert!(info
        .iter()
        .any(|m| m == "See https://results.example.com/request/req-42 for more information about your request."));
    assert!(!info.iter().any(|m| m.contains("files produced")));
    assert!(!module.has_cached_backend_client());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_backend_client_is_kept_between_commands_when_asked() {
    let backend = Arc::new(FakeBackend::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let module = UploadModule::new()
        .with_backend_connector(counting_connector(backend.clone(), calls.clone()));
    let reporter = Arc::new(CollectingReporter::new());
    let options = UploadOptions {
        keep_backend_connections: true,
        ..backend_options()
    };

    for _ in 0..3 {
        let bus = module
            .before_command(CommandEnvironment::new("test", options.clone(), reporter.clone()))
            .await
            .unwrap();
        finish(&bus);
        module.after_command().await.unwrap();
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(module.has_cached_backend_client());
    module.shutdown().await;
    assert!(!module.has_cached_backend_client());
}

#[tokio::test]
async fn test_commands_outside_allow_list_stream_nowhere() {
    let temp = TempDir::new().unwrap();
    let module = UploadModule::new();
    let reporter = Arc::new(CollectingReporter::new());
    let options = UploadOptions {
        json_file: Some(FileSinkOptions::new(temp.path().join("bep.json"))),
        ..UploadOptions::default()
    };

    let bus = module
        .before_command(CommandEnvironment::new("version", options, reporter.clone()))
        .await
        .unwrap();
    assert!(bus.sink_names().is_empty());
    finish(&bus);
    let report = module.after_command().await.unwrap();

    assert!(report.outcomes.is_empty());
    assert!(!temp.path().join("bep.json").exists());
    assert!(reporter.of_kind(MessageKind::Info).is_empty());
}

#[tokio::test]
async fn test_after_command_without_before_is_a_no_op() {
    let module = UploadModule::new();
    let report = module.after_command().await.unwrap();
    assert!(report.outcomes.is_empty());
    assert_eq!(module.manager().state(), LifecycleState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_crash_during_command_never_fails() {
    let backend = Arc::new(FakeBackend::default());
    backend.withhold_ack.store(true, Ordering::SeqCst);
    let module = UploadModule::new()
        .with_backend_connector(counting_connector(backend.clone(), Arc::new(AtomicUsize::new(0))));
    let reporter = Arc::new(CollectingReporter::new());

    let bus = module
        .before_command(CommandEnvironment::new("build", backend_options(), reporter.clone()))
        .await
        .unwrap();
    bus.produce(BuildEvent::new("started", json!({})));

    module.shutdown_on_crash().await;

    assert_eq!(module.manager().state(), LifecycleState::Crashed);
    assert!(bus.finished());
    assert!(module.manager().pending().is_empty());
    let published = backend.published_sequences();
    assert_eq!(published, vec![1, 2]);
    let batches = backend.batches.lock();
    assert_eq!(batches[0].events[1].kind, "aborted");
    assert!(batches.last().unwrap().last_batch);
}

#[tokio::test]
async fn test_non_blocking_upload_reports_pending_then_drains() {
    let backend = Arc::new(FakeBackend::default());
    let module = UploadModule::new()
        .with_backend_connector(counting_connector(backend.clone(), Arc::new(AtomicUsize::new(0))));
    let reporter = Arc::new(CollectingReporter::new());
    let options = UploadOptions {
        upload_mode: UploadMode::NonBlocking,
        ..backend_options()
    };

    let bus = module
        .before_command(CommandEnvironment::new("build", options.clone(), reporter.clone()))
        .await
        .unwrap();
    finish(&bus);
    let report = module.after_command().await.unwrap();
    assert_eq!(report.mode, UploadMode::NonBlocking);
    assert_eq!(reporter.closed_transports(), vec!["backend".to_string()]);

    // The next command reconciles the drained upload without warnings.
    module
        .before_command(CommandEnvironment::new("build", options, reporter.clone()))
        .await
        .unwrap();
    assert!(reporter.warnings().is_empty());
    assert_eq!(backend.published_sequences(), vec![1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_configuration_still_reconciles_previous_uploads() {
    let backend = Arc::new(FakeBackend::default());
    backend.withhold_ack.store(true, Ordering::SeqCst);
    let module = UploadModule::new()
        .with_backend_connector(counting_connector(backend.clone(), Arc::new(AtomicUsize::new(0))));
    let reporter = Arc::new(CollectingReporter::new());
    let options = UploadOptions {
        upload_mode: UploadMode::NonBlocking,
        ..backend_options()
    };

    let bus = module
        .before_command(CommandEnvironment::new("build", options.clone(), reporter.clone()))
        .await
        .unwrap();
    finish(&bus);
    module.after_command().await.unwrap();
    assert!(!module.manager().pending().is_empty());

    let invalid = UploadOptions {
        backend: Some(BackendOptions::new("bes.example.com:443")),
        ..UploadOptions::default()
    };
    let exit = module
        .before_command(CommandEnvironment::new("build", invalid, reporter.clone()))
        .await
        .err()
        .unwrap();

    assert_eq!(exit.code, ExitCode::EnvironmentalError);
    assert!(module.manager().pending().is_empty());
    let warnings = reporter.warnings();
    assert_eq!(warnings.len(), 1, "{:?}", warnings);
    assert!(warnings[0].contains("took more than 5s"));
    assert_eq!(module.manager().state(), LifecycleState::Idle);

    // The rejected command does not block the next one.
    backend.withhold_ack.store(false, Ordering::SeqCst);
    let bus = module
        .before_command(CommandEnvironment::new("build", options, reporter.clone()))
        .await
        .unwrap();
    finish(&bus);
    module.after_command().await.unwrap();
}
