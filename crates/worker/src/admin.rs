//! Operator endpoints
//!
//! - `GET /health` liveness
//! - `GET /workers/status` health snapshot of every worker
//! - `POST /workers/restart` stop every worker, then start them again

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use time::OffsetDateTime;
use tower_http::trace::TraceLayer;

use crate::error::WorkerResult;
use crate::manager::WorkerManager;
use crate::scheduler::HealthSnapshot;

#[derive(Debug, Serialize)]
pub struct WorkerStatusResponse {
    pub success: bool,
    pub workers: BTreeMap<String, HealthSnapshot>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Serialize)]
pub struct RestartResponse {
    pub success: bool,
    pub message: &'static str,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub fn router(manager: Arc<WorkerManager>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/workers/status", get(worker_status))
        .route("/workers/restart", post(restart_workers))
        .layer(TraceLayer::new_for_http())
        .with_state(manager)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn worker_status(State(manager): State<Arc<WorkerManager>>) -> Json<WorkerStatusResponse> {
    Json(WorkerStatusResponse {
        success: true,
        workers: manager.health().await,
        timestamp: OffsetDateTime::now_utc(),
    })
}

async fn restart_workers(State(manager): State<Arc<WorkerManager>>) -> WorkerResult<Json<RestartResponse>> {
    tracing::info!("Restarting workers on operator request");
    manager.restart().await?;
    Ok(Json(RestartResponse {
        success: true,
        message: "Workers restarted successfully",
    }))
}
