//! Shared utilities

/// Environment variable loading
pub mod env_loader;

/// Dot-path lookups into JSON values
pub mod json_path;

pub use env_loader::{load_env_optional, EnvLoader, ENV_PREFIX};
pub use json_path::lookup_path;
