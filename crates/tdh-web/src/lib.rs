//! Axum surface over the sync service: trigger imports, inspect the retry
//! queue.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tdh_core::UpdateResult;
use tdh_sync::scheduler::maybe_build_scheduler;
use tdh_sync::{CancelFlag, DeletePolicy, SyncConfig, SyncService};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "tdh-web";

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SyncService>,
}

impl AppState {
    pub fn new(service: Arc<SyncService>) -> Self {
        Self { service }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceRow {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub record_type: String,
    pub delete_policy: DeletePolicy,
}

#[derive(Debug, Deserialize)]
pub struct DeleteRequest {
    pub ids: Vec<String>,
    #[serde(default)]
    pub policy: Option<DeletePolicy>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/sources", get(sources_handler))
        .route("/update/{source}", post(update_handler))
        .route("/update/{source}/delete", post(delete_handler))
        .route("/retry-queue", get(retry_queue_handler))
        .route("/retry-queue/run", post(retry_run_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("TDH_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let service = Arc::new(SyncService::from_config(SyncConfig::from_env()).await?);
    let scheduler = maybe_build_scheduler(service.clone()).await?;
    if let Some(scheduler) = &scheduler {
        scheduler.start().await?;
    }
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(AppState::new(service))).await?;
    Ok(())
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn sources_handler(State(state): State<Arc<AppState>>) -> Json<Vec<SourceRow>> {
    let config = state.service.config();
    Json(
        state
            .service
            .sources()
            .sources
            .iter()
            .map(|s| SourceRow {
                source_id: s.source_id.clone(),
                display_name: s.display_name.clone(),
                enabled: s.enabled,
                record_type: s.record_type.clone(),
                delete_policy: s.delete_policy(config),
            })
            .collect(),
    )
}

async fn update_handler(State(state): State<Arc<AppState>>, AxumPath(source): AxumPath<String>) -> Response {
    if let Some(response) = reject_unavailable(&state, &source) {
        return response;
    }
    // detached so a dropped connection cannot stop a record mid-write
    let service = state.service.clone();
    let run = tokio::spawn(async move { service.sync_source(&source, &CancelFlag::new()).await });
    match run.await {
        Ok(Ok(run)) => update_response(run.outcome.result),
        Ok(Err(err)) => server_error(err),
        Err(err) => server_error(anyhow::Error::new(err).context("sync task failed")),
    }
}

async fn delete_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(source): AxumPath<String>,
    Json(request): Json<DeleteRequest>,
) -> Response {
    if let Some(response) = reject_unavailable(&state, &source) {
        return response;
    }
    let Some(config) = state.service.sources().get(&source) else {
        return not_found(&source);
    };
    let policy = request
        .policy
        .unwrap_or_else(|| config.delete_policy(state.service.config()));
    let record_type = config.record_type.clone();
    let write = config.write.clone();
    let service = state.service.clone();
    let removal = tokio::spawn(async move {
        service
            .pipeline()
            .delete_records(&source, &record_type, request.ids, policy, &write, &CancelFlag::new())
            .await
    });
    match removal.await {
        Ok(outcome) => update_response(outcome.result),
        Err(err) => server_error(anyhow::Error::new(err).context("delete task failed")),
    }
}

async fn retry_queue_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.service.retry_queue().await {
        Ok(entries) => Json(entries).into_response(),
        Err(err) => server_error(err),
    }
}

async fn retry_run_handler(State(state): State<Arc<AppState>>) -> Response {
    let service = state.service.clone();
    match tokio::spawn(async move { service.retry_pass().await }).await {
        Ok(Ok(summary)) => Json(summary).into_response(),
        Ok(Err(err)) => server_error(err),
        Err(err) => server_error(anyhow::Error::new(err).context("retry task failed")),
    }
}

fn reject_unavailable(state: &AppState, source: &str) -> Option<Response> {
    match state.service.sources().get(source) {
        None => Some(not_found(source)),
        Some(config) if !config.enabled => Some(
            (
                StatusCode::CONFLICT,
                Json(ErrorBody {
                    error: format!("source `{source}` is disabled"),
                }),
            )
                .into_response(),
        ),
        Some(_) => None,
    }
}

/// Record failures still answer 200; the body carries `success`.
fn update_response(result: UpdateResult) -> Response {
    (StatusCode::OK, Json(result)).into_response()
}

fn not_found(source: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody {
            error: format!("unknown source `{source}`"),
        }),
    )
        .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %format!("{err:#}"), "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            error: format!("{err:#}"),
        }),
    )
        .into_response()
}
