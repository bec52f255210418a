//! CI server HTTP routes: webhook, build API, KPIs.

pub mod api;
pub mod webhook;

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;

use crate::config::CiConfig;
use crate::dashboard::kpi::{self, AvgBuildDuration, BuildSuccessRate, BuildsByStatus};
use crate::models::build::Build;
use crate::models::error::CiError;
use crate::services::build_service::BuildStore;
use crate::services::error_service::ErrorStore;
use crate::services::executor::BuildQueue;
use crate::services::github_service::StatusReporter;
use crate::workflow::Workflow;

/// Shared state for route handlers.
#[derive(Clone)]
pub struct CiRouterState {
    pub store: BuildStore,
    pub errors: ErrorStore,
    pub queue: BuildQueue,
    pub reporter: StatusReporter,
    pub workflow: Arc<Workflow>,
    pub config: CiConfig,
}

pub fn ci_router(state: CiRouterState) -> Router {
    Router::new()
        .route("/health", get(health))
        // Webhook
        .route("/webhook/github", post(webhook_handler))
        // Build API
        .route("/api/builds", get(list_builds_handler))
        .route("/api/builds/trigger", post(trigger_build_handler))
        .route("/api/builds/latest", get(get_latest_build))
        .route("/api/builds/{build_id}", get(get_build))
        // KPI API
        .route("/api/kpi/success_rate", get(kpi_success_rate))
        .route("/api/kpi/avg_duration", get(kpi_avg_duration))
        .route("/api/kpi/builds_by_status", get(kpi_builds_by_status))
        // Errors
        .route("/api/errors", get(list_errors))
        .with_state(state)
}

async fn health(State(state): State<CiRouterState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "workflow": state.workflow.name,
    }))
}

// ── Webhook ──

async fn webhook_handler(
    State(state): State<CiRouterState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, StatusCode> {
    crate::metrics::webhook_received(
        headers
            .get("x-github-event")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown"),
    );

    webhook::handle_webhook(&state, &headers, body).await
}

// ── Build API ──

/// Log a store failure and answer 500.
fn internal_error(e: anyhow::Error) -> StatusCode {
    tracing::error!("Build store error: {e:#}");
    StatusCode::INTERNAL_SERVER_ERROR
}

async fn trigger_build_handler(
    State(state): State<CiRouterState>,
    body: Bytes,
) -> Result<(StatusCode, Json<api::TriggerResponse>), StatusCode> {
    let req: api::TriggerRequest = if body.is_empty() {
        api::TriggerRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|_| StatusCode::BAD_REQUEST)?
    };
    let build = api::trigger_build(&state.store, &state.config.github_repo, req)
        .await
        .map_err(internal_error)?;
    let status = webhook::enqueue(&state, build.id).await?;

    Ok((
        status,
        Json(api::TriggerResponse {
            id: build.id,
            status: build.status,
        }),
    ))
}

#[derive(serde::Deserialize)]
pub struct ListBuildsQuery {
    pub limit: Option<usize>,
}

async fn list_builds_handler(
    State(state): State<CiRouterState>,
    Query(query): Query<ListBuildsQuery>,
) -> Result<Json<Vec<Build>>, StatusCode> {
    api::list_builds(&state.store, query.limit)
        .await
        .map(Json)
        .map_err(internal_error)
}

async fn get_build(
    State(state): State<CiRouterState>,
    Path(build_id): Path<i64>,
) -> Result<Json<Build>, StatusCode> {
    state
        .store
        .get_build(build_id)
        .await
        .map_err(internal_error)?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

#[derive(serde::Deserialize)]
pub struct LatestBuildQuery {
    pub branch: String,
}

async fn get_latest_build(
    State(state): State<CiRouterState>,
    Query(query): Query<LatestBuildQuery>,
) -> Result<Json<Build>, StatusCode> {
    state
        .store
        .get_latest(&query.branch)
        .await
        .map_err(internal_error)?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

// ── KPI API ──

#[derive(serde::Deserialize)]
pub struct KpiQuery {
    pub days: Option<i64>,
}

async fn kpi_success_rate(
    State(state): State<CiRouterState>,
    Query(query): Query<KpiQuery>,
) -> Result<Json<BuildSuccessRate>, StatusCode> {
    state
        .store
        .success_rate(kpi::window_days(query.days))
        .await
        .map(Json)
        .map_err(internal_error)
}

async fn kpi_avg_duration(
    State(state): State<CiRouterState>,
    Query(query): Query<KpiQuery>,
) -> Result<Json<AvgBuildDuration>, StatusCode> {
    state
        .store
        .avg_duration(kpi::window_days(query.days))
        .await
        .map(Json)
        .map_err(internal_error)
}

async fn kpi_builds_by_status(
    State(state): State<CiRouterState>,
    Query(query): Query<KpiQuery>,
) -> Result<Json<Vec<BuildsByStatus>>, StatusCode> {
    state
        .store
        .builds_by_status(kpi::window_days(query.days))
        .await
        .map(Json)
        .map_err(internal_error)
}

async fn list_errors(State(state): State<CiRouterState>) -> Result<Json<Vec<CiError>>, StatusCode> {
    state.errors.list().await.map(Json).map_err(internal_error)
}
