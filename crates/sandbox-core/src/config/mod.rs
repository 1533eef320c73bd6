//! Service configuration: YAML file, environment overrides, validation.

pub mod loader;
pub mod types;

pub use loader::ConfigLoader;
pub use types::*;
