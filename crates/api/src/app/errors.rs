//! Consistent JSON error responses: `{"error": <code>, "message": <text>}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use forgeledger_core::{ConcurrencyError, LedgerError, PolicyError};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("{0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Ledger(err) => ledger_error_to_response(err),
            ApiError::BadRequest(msg) => json_error(StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "request failed");
                json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg)
            }
        }
    }
}

pub fn ledger_error_to_response(err: LedgerError) -> Response {
    let message = err.to_string();
    match err {
        LedgerError::Validation(_) => json_error(StatusCode::BAD_REQUEST, "validation_error", message),
        LedgerError::InvalidId(_) => json_error(StatusCode::BAD_REQUEST, "invalid_id", message),
        LedgerError::State(_) => json_error(StatusCode::CONFLICT, "invalid_state", message),
        LedgerError::Policy(PolicyError::InsufficientRole(_)) => {
            json_error(StatusCode::FORBIDDEN, "forbidden", message)
        }
        LedgerError::Policy(PolicyError::CrossTenant) => {
            json_error(StatusCode::FORBIDDEN, "tenant_isolation", message)
        }
        LedgerError::Policy(_) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "policy_violation", message)
        }
        LedgerError::Concurrency(ConcurrencyError::LockTimeout { .. }) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "lock_timeout", message)
        }
        LedgerError::Concurrency(_) => json_error(StatusCode::CONFLICT, "conflict", message),
        LedgerError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", message),
        LedgerError::Cancelled => json_error(StatusCode::REQUEST_TIMEOUT, "cancelled", message),
        LedgerError::Timeout => json_error(StatusCode::GATEWAY_TIMEOUT, "query_timeout", message),
        LedgerError::Storage(_) => {
            tracing::error!(error = %message, "storage failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", message)
        }
    }
}

pub fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
