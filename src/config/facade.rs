//! Loader facade over the layered sources.

use config::ConfigError;
use std::path::Path;

use super::merge::merge_policy::builder_with_defaults;
use super::sources::{environment, global_file, workspace_file};
use super::BepConfig;

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load defaults, the global file, `<workspace>/.bepstream.toml`, then the
    /// environment, each overriding the previous.
    pub fn load(workspace_root: &Path) -> Result<BepConfig, ConfigError> {
        let builder = builder_with_defaults()?;
        let builder = global_file::add_to_builder(builder)?;
        let builder = workspace_file::add_to_builder(builder, workspace_root)?;
        environment::add_to_builder(builder)
            .build()?
            .try_deserialize()
    }

    /// Load an explicit file in place of the global and workspace files.
    /// Environment overrides still apply.
    pub fn load_from_file(path: &Path) -> Result<BepConfig, ConfigError> {
        let builder = builder_with_defaults()?
            .add_source(config::File::from(path).required(true));
        environment::add_to_builder(builder)
            .build()?
            .try_deserialize()
    }
}
