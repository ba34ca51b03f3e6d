//! Runs the example handlers on a local harness until Ctrl-C.
//!
//! Configuration comes from `lambda-harness.toml` and `LAMBDA_HARNESS_*`
//! environment variables. Log output is controlled with `RUST_LOG`.
//!
//! ```text
//! curl -X POST localhost:8080/orders -d '{"message":"two coffees"}'
//! ```

use lambda_harness::HarnessConfig;
use lambda_harness_example::{BoxError, ExampleHarness};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = HarnessConfig::load()?;
    let harness = ExampleHarness::new(&config).await?;
    let engine = harness.engine();
    engine.start().await?;

    for addr in engine.http_addrs().await {
        tracing::info!(%addr, "Example routes available");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!(processed = harness.processed.len(), "Shutting down");
    engine.stop().await;

    Ok(())
}
