use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kubefault::{
    api::AppState,
    config::Config,
    create_router,
    db::Database,
    k8s::{ClusterApi, K8sClient, SnapshotCache},
};

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    tracing::info!("Starting kubefault");

    // Load configuration
    let config = Arc::new(Config::load()?);
    tracing::info!(cluster = %config.cluster_name, "Configuration loaded");

    // Initialize database
    let db = Database::new(&config.database_url).await?;
    db.run_migrations().await?;
    tracing::info!("Database initialized");

    let api: Arc<dyn ClusterApi> = Arc::new(K8sClient::new().await?);
    match api.server_version().await {
        Ok(version) => tracing::info!(version = %version, "Connected to Kubernetes cluster"),
        Err(e) => tracing::warn!(error = %e, "Kubernetes API server not reachable yet"),
    }

    // Initial snapshot, then keep it fresh in the background
    let cache = Arc::new(SnapshotCache::new());
    let failures = cache.refresh(api.as_ref()).await;
    if !failures.is_empty() {
        tracing::warn!(failed_kinds = failures.len(), "Initial cache refresh incomplete");
    }
    let refresher = cache
        .clone()
        .spawn_refresh_loop(api.clone(), config.cache_refresh_interval());

    let state = AppState::new(config.clone(), api, cache).with_store(db);

    // Undo whatever a previous process left behind
    match state.engine.recover().await {
        Ok(0) => {}
        Ok(n) => tracing::info!(count = n, "Recovered actions reverted"),
        Err(e) => tracing::error!(error = %e, "Action recovery failed"),
    }

    let engine = state.engine.clone();
    let sweeper = engine
        .clone()
        .spawn_sweeper(config.action_sweep_interval(), config.action_retention());
    let app = create_router(state);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let stopped = engine.stop_all().await;
    tracing::info!(stopped, "Running actions reverted");
    sweeper.abort();
    refresher.abort();

    Ok(())
}
