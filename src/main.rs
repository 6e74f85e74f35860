//! Gateway entry point: wire up the store, cache, SIP server, and admin
//! API, then run until a shutdown signal arrives.

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use voicebridge::api::{self, ApiState};
use voicebridge::cache::Cache;
use voicebridge::config::Config;
use voicebridge::db::{CallStore, PgStore};
use voicebridge::registry::SessionRegistry;
use voicebridge::routing::Router;
use voicebridge::rtp::PortPool;
use voicebridge::sip::SipServer;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    config.validate().map_err(anyhow::Error::msg)?;
    info!("starting voicebridge");

    let store = PgStore::connect(&config.database_url, config.db_max_connections)
        .await
        .context("failed to connect to PostgreSQL")?;
    store.migrate().await.context("failed to run migrations")?;
    info!("PostgreSQL connected");

    let cache = match config.valkey_connection_url() {
        Some(url) => match Cache::connect(&url, config.cache_route_ttl).await {
            Ok(cache) => {
                info!("Valkey connected");
                Some(Arc::new(cache))
            }
            Err(e) => {
                warn!("failed to connect to Valkey: {e} (continuing without cache)");
                None
            }
        },
        None => None,
    };

    let call_store: Arc<dyn CallStore> = Arc::new(store.clone());
    let registry = SessionRegistry::new(
        Arc::clone(&call_store),
        cache.clone(),
        PortPool::new(config.rtp_port_min, config.rtp_port_max),
    );
    let router = Router::new(
        Arc::clone(&call_store),
        cache.clone(),
        config.default_websocket_url.clone(),
    );

    let sip_server = SipServer::bind(
        &config,
        router,
        Arc::clone(&registry),
        Arc::clone(&call_store),
    )
    .await
    .context("failed to bind SIP listeners")?;
    info!(
        "SIP server on {}:{} ({})",
        config.sip_host, config.sip_port, config.sip_transport
    );
    let sip_task = tokio::spawn(sip_server.run());

    let api_state = Arc::new(ApiState {
        store,
        cache,
        registry: Arc::clone(&registry),
        auth_enabled: config.api_auth_enabled,
    });
    let api_addr = format!("{}:{}", config.api_host, config.api_port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind admin API on {api_addr}"))?;
    info!("admin API on http://{api_addr}/api/v1");
    let api_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(api_listener, api::router(api_state)).await {
            error!("admin API error: {e}");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received, stopping services");

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, registry.close_all())
        .await
        .is_err()
    {
        warn!("session shutdown timed out");
    }

    sip_task.abort();
    api_task.abort();

    info!("voicebridge stopped");
    Ok(())
}
