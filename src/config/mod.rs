//! Public API for configuration

pub mod loader;
pub mod model;

// Re-export the main entrypoints:
pub use loader::{load, load_str};
pub use model::{ChannelConfig, ConfigError, Fallback, MasterConfig, StartPolicy};
