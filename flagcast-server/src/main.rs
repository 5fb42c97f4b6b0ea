use anyhow::Context;
use clap::Parser;
use flagcast_server::deltas::DeltaAssembler;
use flagcast_server::services::ServicesBuilder;
use flagcast_server::stats::StatsService;
use flagcast_storage::cache::InMemoryCache;
use flagcast_storage::postgres::{self, PostgresGateway};
use flagcast_storage::stats::StatsSink;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Feature-flag distribution server: versioned activation store, delta
/// streaming over WebSocket and JSON polling.
#[derive(Parser)]
struct Cli {
    /// Postgres connection string.
    #[clap(long, env = "DATABASE_URL")]
    database_url: String,

    /// Address to bind the service endpoints to.
    #[clap(long, env = "FLAGCAST_BIND", default_value = "0.0.0.0")]
    bind: String,

    /// Port for the service endpoints.
    #[clap(long, env = "FLAGCAST_PORT", default_value_t = 4242)]
    port: u16,

    /// URL prefix of the service endpoints.
    #[clap(long, env = "FLAGCAST_PREFIX", default_value = "v1")]
    prefix: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    PrometheusBuilder::new()
        .install()
        .context("failed to install metrics exporter")?;

    let pool = postgres::connect(&cli.database_url)
        .await
        .context("failed to connect to the database")?;
    let cache = Arc::new(InMemoryCache::new());
    let gateway = Arc::new(PostgresGateway::new(pool, cache.clone()));
    let assembler = Arc::new(DeltaAssembler::new(gateway));
    let stats = Arc::new(StatsService::new(Arc::new(StatsSink::new(cache))));

    let (handle, task) = ServicesBuilder::new(assembler, stats)
        .prefix(&cli.prefix)
        .bind(&cli.bind)
        .port(cli.port)
        .run()?;
    info!(bind = %cli.bind, port = cli.port, prefix = %cli.prefix, "flagcast server started");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received, stopping services");
            handle.stop(true).await;
        }
        res = task => {
            res.context("service task panicked")??;
        }
    }
    Ok(())
}
