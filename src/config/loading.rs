//! Configuration loading from files and environment variables
//!
//! Environment variables take precedence over the file for the listen
//! address so container deployments can move the port without editing it.

use anyhow::{Context, Result};
use std::path::Path;

use super::types::{Config, PoolMode, RouteConfig, StorageConfig};

/// Name of the console database/storage in the generated default config
pub const CONSOLE_NAME: &str = "pgmux";

/// Apply `PGMUX_LISTEN_HOST` / `PGMUX_LISTEN_PORT` overrides
fn apply_env_overrides(config: &mut Config) {
    if let Ok(host) = std::env::var("PGMUX_LISTEN_HOST") {
        tracing::info!("Using listen host {} from environment", host);
        config.listen.host = host;
    }
    if let Some(port) = std::env::var("PGMUX_LISTEN_PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
    {
        tracing::info!("Using listen port {} from environment", port);
        config.listen.port = port;
    }
}

/// Parse and validate configuration text
pub fn parse_config(text: &str) -> Result<Config> {
    let config: Config = toml::from_str(text).context("invalid configuration")?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from a TOML file, with environment variable overrides
pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e))?;

    let mut config: Config = toml::from_str(&text)
        .map_err(|e| anyhow::anyhow!("Failed to parse config file '{}': {}", path.display(), e))?;

    apply_env_overrides(&mut config);
    config.validate()?;

    Ok(config)
}

/// Create a default configuration: one local backend plus the console
#[must_use]
pub fn create_default_config() -> Config {
    Config {
        storages: vec![
            StorageConfig::tcp("postgres", "127.0.0.1", super::defaults::backend_port()),
            StorageConfig::local(CONSOLE_NAME),
        ],
        routes: vec![
            RouteConfig::builder("*", "*", "postgres")
                .pool(PoolMode::Transaction)
                .pool_size(16)
                .pool_timeout(std::time::Duration::from_secs(4))
                .pool_ttl(std::time::Duration::from_secs(60))
                .build()
                .expect("static route is valid"),
            RouteConfig::builder(CONSOLE_NAME, "*", CONSOLE_NAME)
                .build()
                .expect("static route is valid"),
        ],
        ..Default::default()
    }
}

/// Write the default configuration to `path`
pub fn write_default_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let config = create_default_config();
    let text = toml::to_string_pretty(&config).context("failed to serialize default config")?;
    std::fs::write(path, text)
        .with_context(|| format!("Failed to write default config to '{}'", path.display()))?;
    Ok(config)
}
