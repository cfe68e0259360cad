//! meshmon: mesh radio monitor

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use meshmon_cli::{cli::Cli, commands::CommandDispatcher, config::AppConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(&cli).context("loading configuration")?;
    setup_logging(cli.verbose, &config.mesh.logging.level);
    info!(data_dir = %config.data_dir.display(), "meshmon starting");

    CommandDispatcher::execute(cli.command, config)
        .await
        .context("command failed")?;
    Ok(())
}

/// `--verbose` forces debug; otherwise `RUST_LOG`, then the configured level
fn setup_logging(verbose: bool, configured: &str) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(configured))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
