//! Integration tests for the build event upload lifecycle

mod config_integration;
mod file_sinks;
mod module_hooks;
mod test_utils;
