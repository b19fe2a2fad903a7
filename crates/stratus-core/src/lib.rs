//! stratus-core: shared identifiers, node roles and `stratus.toml` parsing.

pub mod config;
pub mod types;

pub use config::{ExecutorConfig, PlacementConfig, RegistryConfig, StateConfig, StratusConfig};
pub use types::*;
