//! Integration tests for layered configuration loading

use bepstream::config::{ConfigLoader, WORKSPACE_CONFIG_FILE};
use bepstream::lifecycle::UploadMode;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;

// Loading reads HOME and BEPSTREAM__* variables; tests touching them run one at a time.
static CONFIG_ENV_MUTEX: Mutex<()> = Mutex::new(());

struct IsolatedHome {
    _dir: TempDir,
    original_home: Option<String>,
    original_xdg: Option<String>,
}

impl IsolatedHome {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let original_home = std::env::var("HOME").ok();
        let original_xdg = std::env::var("XDG_CONFIG_HOME").ok();
        std::env::set_var("HOME", dir.path());
        std::env::set_var("XDG_CONFIG_HOME", dir.path().join(".config"));
        Self {
            _dir: dir,
            original_home,
            original_xdg,
        }
    }
}

impl Drop for IsolatedHome {
    fn drop(&mut self) {
        match &self.original_home {
            Some(orig) => std::env::set_var("HOME", orig),
            None => std::env::remove_var("HOME"),
        }
        match &self.original_xdg {
            Some(orig) => std::env::set_var("XDG_CONFIG_HOME", orig),
            None => std::env::remove_var("XDG_CONFIG_HOME"),
        }
    }
}

fn write_workspace_config(root: &Path, body: &str) {
    std::fs::write(root.join(WORKSPACE_CONFIG_FILE), body).unwrap();
}

#[test]
fn test_workspace_file_is_loaded() {
    let _guard = CONFIG_ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    let _home = IsolatedHome::new();
    let workspace = TempDir::new().unwrap();
    write_workspace_config(
        workspace.path(),
        r#"
[upload]
upload_mode = "non_blocking"
allowed_commands = ["build"]

[upload.text_file]
path = "out/bep.txt"

[upload.backend]
endpoint = "http://localhost:8080"
timeout_secs = 30
results_url_prefix = "http://localhost:8080/invocation/"

[logging]
level = "debug"
"#,
    );

    let config = ConfigLoader::load(workspace.path()).unwrap();
    assert!(config.validate().is_ok());
    assert_eq!(config.upload.upload_mode, UploadMode::NonBlocking);
    assert!(config.upload.allows_command("build"));
    assert!(!config.upload.allows_command("test"));
    assert_eq!(config.upload.file_sinks().len(), 1);
    let backend = config.upload.backend.as_ref().unwrap();
    assert_eq!(backend.timeout(), Duration::from_secs(30));
    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.upload.lifecycle_config().previous_invocation_grace, Duration::from_secs(5));
}

#[test]
fn test_missing_files_fall_back_to_defaults() {
    let _guard = CONFIG_ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    let _home = IsolatedHome::new();
    let workspace = TempDir::new().unwrap();

    let config = ConfigLoader::load(workspace.path()).unwrap();
    assert!(!config.upload.has_sinks());
    assert_eq!(config.upload.upload_mode, UploadMode::Blocking);
    assert_eq!(config.logging.level, "warn");
}

#[test]
fn test_environment_overrides_workspace_file() {
    let _guard = CONFIG_ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    let _home = IsolatedHome::new();
    let workspace = TempDir::new().unwrap();
    write_workspace_config(
        workspace.path(),
        r#"
[upload]
upload_mode = "blocking"
crash_grace_secs = 4
"#,
    );

    std::env::set_var("BEPSTREAM__UPLOAD__UPLOAD_MODE", "fully_async");
    std::env::set_var("BEPSTREAM__UPLOAD__CRASH_GRACE_SECS", "9");
    let result = ConfigLoader::load(workspace.path());
    std::env::remove_var("BEPSTREAM__UPLOAD__UPLOAD_MODE");
    std::env::remove_var("BEPSTREAM__UPLOAD__CRASH_GRACE_SECS");

    let config = result.unwrap();
    assert_eq!(config.upload.upload_mode, UploadMode::FullyAsync);
    assert_eq!(config.upload.crash_grace_secs, 9);
}

#[test]
fn test_invalid_values_are_rejected() {
    let _guard = CONFIG_ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    let _home = IsolatedHome::new();
    let workspace = TempDir::new().unwrap();
    write_workspace_config(
        workspace.path(),
        r#"
[upload]
upload_mode = "whenever"
"#,
    );
    assert!(ConfigLoader::load(workspace.path()).is_err());

    let missing = workspace.path().join("nope.toml");
    assert!(ConfigLoader::load_from_file(&missing).is_err());
}

#[test]
fn test_loaded_but_inconsistent_options_fail_validation() {
    let _guard = CONFIG_ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    let _home = IsolatedHome::new();
    let workspace = TempDir::new().unwrap();
    let file = workspace.path().join("custom.toml");
    std::fs::write(
        &file,
        r#"
[upload.json_file]
path = "bep.out"

[upload.binary_file]
path = "bep.out"
"#,
    )
    .unwrap();

    let config = ConfigLoader::load_from_file(&file).unwrap();
    let err = config.validate().unwrap_err();
    assert_eq!(err.problems.len(), 1);
    assert!(err.problems[0].starts_with("binary_file.path"));
}
