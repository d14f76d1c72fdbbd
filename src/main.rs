//! lakegate CLI entry point.
//!
//! Sets up tracing and the metrics registry, then hands off to the CLI
//! module for command handling.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = lakegate::cli::parse_cli();

    // RUST_LOG wins over --log-level, which wins over the "info" default.
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| cli.log_level.clone());
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_filter)))
        .init();

    lakegate::metrics::init_metrics()?;

    lakegate::cli::run_with_cli(cli).await
}
