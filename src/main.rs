//! Predictor - keeps per-subject predictions fresh and durably stored

use predictor::cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // INFO by default, RUST_LOG overrides
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
        )
        .init();

    cli::run().await
}
