use anyhow::Result;

use tooluniverse::cli;

#[tokio::main]
async fn main() -> Result<()> {
    // Logs always go to stderr: in stdio serve mode stdout carries only
    // JSON-RPC frames, and a single stray log line corrupts the framing.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".parse().unwrap());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    cli::run().await
}
