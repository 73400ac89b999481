//! Telemetry ingestion service.
//!
//! ```bash
//! LISTEN_PORT=5000 OTLP_ENDPOINT=http://localhost:4318/v1/traces proctrace
//! proctrace --worker-count 4 --batch-size 500 --debug-mode true
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use proctrace::logging::init_logging;
use proctrace::shutdown::shutdown_on_termination;
use proctrace::{Config, Pipeline, ShutdownSignal};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    init_logging(config.debug_mode).context("failed to install tracing subscriber")?;

    let pipeline = Pipeline::bind(config)
        .await
        .context("pipeline failed to start")?;

    let stop = ShutdownSignal::new();
    let _signals = shutdown_on_termination(stop.clone());

    pipeline.run(stop).await;
    tracing::info!("shutdown complete");
    Ok(())
}
