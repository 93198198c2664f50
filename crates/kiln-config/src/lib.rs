//! Kiln Config
//!
//! This crate contains the serializable configuration types for the kiln
//! engine. Configuration can be loaded from:
//! - JSON files (via CLI with `--config=kiln.json`)
//! - Defaults derived from a data directory
//!
//! The engine takes these types and builds its content store, process runners
//! and scheduler from them.

mod error;
mod remote;
mod types;

pub use error::ConfigError;
pub use remote::RemoteConfig;
pub use types::{DEFAULT_ENV_PASSTHROUGH, EngineConfig};
