//! Worker error types

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use cadence_billing::BillingError;
use serde_json::json;
use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Worker is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error("Config error: {0}")]
    Config(String),
}

impl IntoResponse for WorkerError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            WorkerError::AlreadyRunning => (StatusCode::CONFLICT, "Workers are already running"),
            WorkerError::Billing(_) | WorkerError::Config(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Failed to restart workers")
            }
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}
