//! Command-line interface for the `promo-ingest` binary.

use crate::config::IngestConfig;
use crate::pipeline::process_coupons;
use crate::source::collect_gzip_files;
use crate::store::{check_code, MemoryMembershipStore, RedisMembershipStore};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Top-level arguments.
#[derive(Parser)]
#[command(name = "promo-ingest")]
#[command(about = "Load corroborated promo codes into the coupon membership store", long_about = None)]
pub struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Decompress, validate and merge the feeds, then flush confirmed codes
    Run {
        /// Config file (toml, json or yaml)
        #[arg(short, long, env = "PROMO_INGEST_CONFIG", default_value = "/etc/promo-ingest/config.toml")]
        config: PathBuf,
        /// Ingest every `.gz` under this directory instead of the configured files
        #[arg(short, long)]
        dir: Option<PathBuf>,
        /// Use an in-memory store instead of Redis
        #[arg(long)]
        dry_run: bool,
    },
    /// Ask the store whether a code is usable
    Check {
        /// Config file (toml, json or yaml)
        #[arg(short, long, env = "PROMO_INGEST_CONFIG", default_value = "/etc/promo-ingest/config.toml")]
        config: PathBuf,
        /// Code to look up
        code: String,
        /// Confirm filter hits against the exact set
        #[arg(long)]
        strict: bool,
    },
}

impl Cli {
    /// Config file named on the command line.
    pub fn config_path(&self) -> &Path {
        match &self.command {
            Command::Run { config, .. } | Command::Check { config, .. } => config,
        }
    }

    /// Load and validate the config file.
    pub fn load_config(&self) -> Result<IngestConfig> {
        let path = self.config_path();
        IngestConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
    }

    /// Execute the subcommand with an already loaded config.
    pub async fn run(self, config: IngestConfig) -> Result<()> {
        match self.command {
            Command::Run {
                ref dir, dry_run, ..
            } => ingest(config, dir.as_deref(), dry_run).await,
            Command::Check { ref code, strict, .. } => check(&config, code, strict).await,
        }
    }
}

async fn ingest(mut config: IngestConfig, dir: Option<&Path>, dry_run: bool) -> Result<()> {
    if let Some(root) = dir {
        config.files = collect_gzip_files(root)?;
        config.validate()?;
    }

    let report = if dry_run {
        let store = Arc::new(MemoryMembershipStore::new());
        process_coupons(&config.files, &config, store).await?
    } else {
        let store = Arc::new(RedisMembershipStore::connect(&config.store).await?);
        process_coupons(&config.files, &config, store).await?
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn check(config: &IngestConfig, code: &str, strict: bool) -> Result<()> {
    let store = RedisMembershipStore::connect(&config.store).await?;
    let usable = check_code(&store, &config.filter_key, &config.set_key, code, strict).await?;
    println!("{}: {}", code, if usable { "valid" } else { "invalid" });
    Ok(())
}
