//! Router, shared state and server lifecycle.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{DefaultBodyLimit, State},
    response::Json,
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::llm::ModelRouter;
use crate::pipeline::{PipelineOrchestrator, PromptSet, StageRunner};
use crate::service::TaskService;
use crate::store::{create_task_store, AssetStore, TaskLedger};
use crate::stream::StreamBroker;
use crate::tags::TagStore;

use super::tags;
use super::tasks;
use super::types::HealthResponse;

/// Uploaded images arrive inline as base64 or as multipart file parts.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Shared application state.
pub struct AppState {
    pub service: TaskService,
    /// Uploaded image files
    pub assets: AssetStore,
    pub tags: Arc<TagStore>,
}

/// Wire stores, model clients, pipeline and service from configuration.
pub async fn build_state(config: &Config) -> anyhow::Result<AppState> {
    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;

    let store = create_task_store(config.store_type, config.data_dir.clone())
        .await
        .map_err(anyhow::Error::msg)?;
    let assets = AssetStore::new(config.assets_dir())
        .await
        .map_err(anyhow::Error::msg)?;
    let tags = Arc::new(
        TagStore::open(config.tags_path())
            .await
            .map_err(anyhow::Error::msg)?,
    );

    let prompts = PromptSet::load(config.prompt_dir.as_deref()).context("loading prompt templates")?;
    let router = ModelRouter::from_configs(&config.provider, &config.stage_providers, config.call_timeout)?;
    tracing::info!(
        provider = ?config.provider.kind,
        model = %config.provider.model,
        store = ?config.store_type,
        "Pipeline configured"
    );

    let ledger = TaskLedger::new(Arc::clone(&store));
    let runner = StageRunner::new(
        Arc::new(router),
        Arc::new(prompts),
        config.retry.clone(),
        config.call_timeout,
        Arc::clone(&store),
    );
    let orchestrator = PipelineOrchestrator::new(runner, ledger.clone(), Arc::clone(&tags), config.pipeline.clone());
    let broker = StreamBroker::new(store, config.stream.clone());
    let service = TaskService::new(
        ledger,
        Arc::new(broker),
        Arc::new(orchestrator),
        config.replay_max_chars,
    );

    Ok(AppState { service, assets, tags })
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/upload", post(tasks::upload_task))
        .route("/api/problems", get(tasks::list_problems))
        .route("/api/tasks", get(tasks::list_tasks).post(tasks::create_task))
        .route("/api/tasks/:id", get(tasks::get_task).delete(tasks::delete_task))
        .route("/api/tasks/:id/process", post(tasks::process_task))
        .route("/api/tasks/:id/cancel", post(tasks::cancel_task))
        .route("/api/tasks/:id/retry", post(tasks::retry_task))
        .route("/api/tasks/:id/stream", get(tasks::read_stream))
        .route("/api/tasks/:id/events", get(tasks::task_events))
        .route("/api/tasks/:id/traces", get(tasks::list_traces))
        .route(
            "/api/tasks/:id/problems/:pid",
            delete(tasks::delete_problem).patch(tasks::override_problem),
        )
        .route("/api/tasks/:id/problems/:pid/rerun", post(tasks::rerun_problem))
        .route("/api/tags", get(tags::list_tags))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let state = Arc::new(build_state(&config).await?);

    let recovered = state.service.recover_orphans().await?;
    if recovered > 0 {
        tracing::warn!(count = recovered, "Marked interrupted tasks as failed");
    }

    let app = router(state);

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    // Running tasks are left as processing and recovered as failed on next start.
    tracing::info!("Shutdown signal received");
}

async fn health(State(_state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
