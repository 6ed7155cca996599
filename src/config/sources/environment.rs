//! Environment source: BEPSTREAM__UPLOAD__UPLOAD_MODE=fully_async and friends.

use config::builder::DefaultState;
use config::ConfigBuilder;
use config::Environment;

pub const ENV_PREFIX: &str = "BEPSTREAM";

pub fn add_to_builder(builder: ConfigBuilder<DefaultState>) -> ConfigBuilder<DefaultState> {
    builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("upload.allowed_commands")
            .with_list_parse_key("upload.backend.keywords"),
    )
}
