use anyhow::Result;
use clap::Parser;
use promo_ingest::cli::Cli;
use promo_ingest::config::{IngestConfig, LogFormat};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;
    init_tracing(&config);

    tracing::info!(config = %cli.config_path().display(), "promo-ingest starting");
    cli.run(config).await
}

/// `RUST_LOG` wins over the configured level.
fn init_tracing(config: &IngestConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Text => registry.with(fmt::layer()).init(),
    }
}
