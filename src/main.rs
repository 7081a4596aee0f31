use std::sync::Arc;

use anyhow::Context;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use gen_orchestrator::api::{AppState, api_routes};
use gen_orchestrator::backend::GenerationBackend;
use gen_orchestrator::backend::http::HttpGenerationBackend;
use gen_orchestrator::config::ServerConfig;
use gen_orchestrator::jobs::{BatchSessions, JobRegistry, PersistenceBridge};
use gen_orchestrator::store::{
    BatchStore, HttpResultStore, LibSqlBackend, ResultStore, SnapshotStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export GEN_ORCH_BACKEND_URL=https://...");
        eprintln!("  export GEN_ORCH_API_KEY=...");
        std::process::exit(1);
    });

    // Initialize tracing, with a daily file log when a log dir is configured
    let (file_layer, _log_guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "gen-orchestrator.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    eprintln!("🎞️  Gen Orchestrator v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Upstream: {}", config.backend_url);
    eprintln!("   Events WS: ws://{}/ws", config.bind);
    eprintln!("   Jobs API: http://{}/api/jobs", config.bind);
    eprintln!("   Batches API: http://{}/api/batches\n", config.bind);

    // ── Database ─────────────────────────────────────────────────────────
    let db = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );
    tracing::info!(path = %config.db_path.display(), "Database opened");

    let results: Arc<dyn ResultStore> = match &config.results_url {
        Some(url) => {
            tracing::info!(url = %url, "Using remote result store");
            Arc::new(HttpResultStore::new(url.clone(), Some(config.api_key.clone()))?)
        }
        None => db.clone() as Arc<dyn ResultStore>,
    };
    let batch_store: Arc<dyn BatchStore> = db.clone();
    let snapshots: Arc<dyn SnapshotStore> = db;

    // ── Orchestrator ─────────────────────────────────────────────────────
    let backend: Arc<dyn GenerationBackend> = Arc::new(HttpGenerationBackend::new(
        config.backend_url.clone(),
        config.api_key.clone(),
    )?);

    let bridge = PersistenceBridge::new(snapshots, results, config.orchestrator.reconcile);
    let registry = JobRegistry::with_persistence(&config.orchestrator, bridge);

    match registry.restore_all(Arc::clone(&backend)).await {
        Ok(count) => tracing::info!(count, "Restored jobs from snapshots"),
        Err(e) => tracing::error!(error = %e, "Failed to restore jobs"),
    }

    let batches = Arc::new(BatchSessions::with_store(
        registry.clone(),
        config.orchestrator.batch,
        batch_store,
    ));
    match batches.restore_all().await {
        Ok(count) => tracing::info!(count, "Restored batch sessions"),
        Err(e) => tracing::error!(error = %e, "Failed to restore batch sessions"),
    }

    // ── HTTP / WS server ─────────────────────────────────────────────────
    let app = api_routes(AppState {
        registry: registry.clone(),
        backend,
        batches,
    })
    .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    tracing::info!(addr = %config.bind, "Server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    registry.shutdown().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for ctrl-c");
    }
    tracing::info!("Shutdown signal received");
}
