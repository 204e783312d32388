use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use pgmux::args::Args;
use pgmux::runtime::{RuntimeConfig, shutdown_signal};
use pgmux::{Config, Pooler, load_config, write_default_config};

fn main() -> Result<()> {
    let args = Args::parse();
    pgmux::logging::init_logging(args.log_file.as_deref());

    let mut config = load_or_create(&args)?;
    args.apply(&mut config);

    let runtime = RuntimeConfig::from_args(args.threads, config.listen.workers);
    let rt = runtime.build_runtime()?;
    rt.block_on(run(config, args))
}

fn load_or_create(args: &Args) -> Result<Config> {
    if args.config.exists() {
        return load_config(&args.config)
            .with_context(|| format!("failed to load {}", args.config.display()));
    }
    warn!(
        "Config file '{}' not found, creating default config",
        args.config.display()
    );
    let config = write_default_config(&args.config)?;
    info!("Created default config file: {}", args.config.display());
    Ok(config)
}

async fn run(config: Config, args: Args) -> Result<()> {
    info!(
        "Loaded {} storage(s) and {} route(s)",
        config.storages.len(),
        config.routes.len()
    );
    for storage in &config.storages {
        info!("  - storage {} ({})", storage.name, storage.target());
    }

    let pooler = Pooler::new(config).with_config_path(&args.config);
    let listener = pooler.bind().await?;
    pooler.serve(listener, shutdown_signal()).await?;
    info!("Graceful shutdown complete");
    Ok(())
}
