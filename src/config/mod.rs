//! Runner configuration: XML schema, loading, validation, and attribute
//! interpretation.

pub mod loader;
pub mod params;
pub mod schema;
pub mod validation;

pub use loader::{load_config, load_config_from_str};
pub use schema::{RunnerConfig, StreamConfig, TaskElement};
pub use validation::validate_config;
