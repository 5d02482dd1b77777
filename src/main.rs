mod config;
mod datastore;
mod goodreads;
mod refresh;
mod server;
mod stats_cache;
mod util;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = config::Config::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(3))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(&config.database_url)
        .await
        .context("Failed to connect to the datastore")?;

    let cache = stats_cache::build_cache(config.redis_url.as_deref(), config.cache_ttl).await?;
    let source = Arc::new(datastore::PostgresIsbnSource::new(pool));
    let client = goodreads::GoodreadsClient::new(config.goodreads_api_key.clone());
    let refresher =
        refresh::RefreshCoordinator::new(source, client, Arc::clone(&cache), config.refresh.clone());

    let app = server::router(server::AppState { cache, refresher });

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.port))?;
    info!(port = config.port, "Integrator server started");
    axum::serve(listener, app.into_make_service())
        .await
        .context("HTTP server terminated")?;

    Ok(())
}
