use std::net::SocketAddr;
use std::sync::Arc;

use prometheus::Registry;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use recsys_api::config::{Config, EngineConfig};
use recsys_api::db::{create_pool, PgRecStore};
use recsys_api::routes::{create_router, AppState};
use recsys_api::services::{Engine, PolicyMetrics};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("recsys_api=info,tower_http=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let engine_config = Arc::new(EngineConfig::from_env()?);

    let pool = create_pool(&config).await?;
    let store = Arc::new(PgRecStore::new(pool, config.store_options()));

    let registry = Registry::new();
    let metrics = PolicyMetrics::new(&registry)?;
    let engine = Engine::new(engine_config, store).with_observer(Arc::new(metrics));

    let shutdown = CancellationToken::new();
    let state = AppState::new(Arc::new(engine), registry)
        .with_shutdown(shutdown.clone())
        .with_request_timeout(config.request_timeout());
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(?err, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutting down");
            shutdown.cancel();
        })
        .await?;

    Ok(())
}
