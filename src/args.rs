//! Command-line arguments

use clap::Parser;
use std::path::PathBuf;

/// Connection pooler for the PostgreSQL wire protocol
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path (a default one is written if missing)
    #[arg(short, long, default_value = "pgmux.toml", env = "PGMUX_CONFIG")]
    pub config: PathBuf,

    /// Host to listen on (overrides config file)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on (overrides config file)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Number of worker threads (0 = one per CPU; overrides config file)
    #[arg(short, long, env = "PGMUX_THREADS")]
    pub threads: Option<usize>,

    /// Also write logs to this file
    #[arg(long, env = "PGMUX_LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

impl Args {
    /// Apply listen overrides to a loaded configuration
    pub fn apply(&self, config: &mut crate::config::Config) {
        if let Some(host) = &self.host {
            config.listen.host = host.clone();
        }
        if let Some(port) = self.port {
            config.listen.port = port;
        }
    }
}
