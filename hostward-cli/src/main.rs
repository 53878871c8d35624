//! Hostward - identity trust for TLS and SSH connections
//!
//! Command-line front end over the trust store: inspect, pin, rename and
//! forget remembered host identities, and run verifications by hand.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use hostward_core::config::{default_store_dir, TrustConfig};
use hostward_core::trust::{FileTrustStore, TrustVerifier};

mod trust_cli;

use trust_cli::TrustCommand;

/// Log levels
#[derive(Debug, Clone, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Parser, Debug)]
#[clap(
    name = "hostward",
    about = "Manage trusted TLS certificates and SSH host keys",
    version
)]
struct Cli {
    #[clap(subcommand)]
    command: TrustCommand,

    /// Set log level
    #[clap(long, default_value = "warn", global = true)]
    log_level: LogLevel,

    /// Emit logs as JSON
    #[clap(long, global = true)]
    json_logs: bool,

    /// Configuration file (default: $HOSTWARD_HOME/config.yml or the platform config dir)
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    /// Trust store directory (default: $HOSTWARD_HOME/trust or the platform data dir)
    #[clap(long, global = true)]
    store_dir: Option<PathBuf>,
}

fn initialize_tracing(log_level: &LogLevel, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_filter_directive()));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr) // stdout carries command output
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr) // stdout carries command output
            .init();
    }
}

fn open_verifier(config: &TrustConfig, store_dir: Option<PathBuf>) -> Result<TrustVerifier> {
    let store_dir = match store_dir {
        Some(dir) => dir,
        None => default_store_dir()?,
    };
    debug!("Using trust store at {}", store_dir.display());

    let store = FileTrustStore::open(&store_dir)
        .with_context(|| format!("Failed to open trust store at {}", store_dir.display()))?
        .with_write_retries(config.store.write_retries);
    Ok(TrustVerifier::new(Arc::new(store), config))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    initialize_tracing(&cli.log_level, cli.json_logs);

    let config = TrustConfig::discover(cli.config.as_deref())?;
    let verifier = open_verifier(&config, cli.store_dir)?;

    cli.command.execute(&verifier).await
}
