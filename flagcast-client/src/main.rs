use anyhow::Context;
use clap::Parser;
use flagcast_client::{FeatureClient, Options};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Subscribes to a flagcast server and logs every applied delta. Useful
/// for watching what a given service would receive.
#[derive(Parser)]
struct Cli {
    /// Streaming endpoint, e.g. ws://host:4242/v1
    #[clap(long, env = "FLAGCAST_ENDPOINT", default_value = "ws://127.0.0.1:4242/v1")]
    endpoint: String,

    /// Service identity to subscribe as.
    #[clap(long, env = "FLAGCAST_SERVICE")]
    service_name: String,

    /// Version to resume from.
    #[clap(long, default_value_t = 0)]
    last_version: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let client = FeatureClient::connect(
        &cli.endpoint,
        &cli.service_name,
        Options {
            initial_version: cli.last_version,
            on_update: Some(Arc::new(|event| {
                info!(
                    version = event.version,
                    features = event.features.len(),
                    "delta applied"
                );
                for config in &event.features {
                    info!(
                        feature = %config.name,
                        all_percent = config.all_percent,
                        keys = config.keys.len(),
                        "feature updated"
                    );
                }
            })),
            ..Options::default()
        },
    )
    .context("failed to start the client")?;

    info!(endpoint = %cli.endpoint, service_name = %cli.service_name, "subscribed, press ctrl-c to exit");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    client.close().await;
    Ok(())
}
