//! Configuration module
//!
//! This module handles all configuration types and loading for the pooler.

mod defaults;
mod loading;
mod types;
mod validation;

pub use loading::{
    CONSOLE_NAME, create_default_config, load_config, parse_config, write_default_config,
};
pub use types::{
    Config, DEFAULT_MATCH, GeneralConfig, ListenConfig, PoolMode, RouteConfig,
    RouteConfigBuilder, StorageConfig, StorageKind,
};
