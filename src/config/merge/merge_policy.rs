//! Merge rules: built-in defaults sit below every file and environment source.

use config::builder::DefaultState;
use config::Config;
use config::ConfigBuilder;
use config::ConfigError;

/// Create a Config builder with merge policy defaults applied.
pub fn builder_with_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Config::builder()
        .set_default("upload.upload_mode", "blocking")?
        .set_default("upload.keep_backend_connections", false)?
        .set_default("upload.previous_invocation_grace_secs", 5)?
        .set_default("upload.crash_grace_secs", 2)?
        .set_default("upload.shutdown_grace_secs", 5)?
        .set_default("upload.max_blocking_wait_secs", 60 * 60)?
        .set_default("logging.level", "warn")
}
