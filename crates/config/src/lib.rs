//! Osprey Config - Configuration management
//!
//! Supports hot reload via ArcSwap; tuning knobs are re-read on every
//! decision point so reloads take effect without a restart.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod loader;
pub mod types;

pub use loader::{ConfigError, ConfigLoader};
pub use types::{
    BackendConfig, HttpConfig, OspreyConfig, PipeConfig, ServerConfig, WorkerConfig,
};
