use axum::{
    Json, Router,
    extract::{Extension, Path},
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::json;

use forgeledger_infra::LedgerEngine;

use crate::app::dto;
use crate::app::errors::ApiError;
use crate::app::routes::common::blocking;
use crate::context::{PrincipalContext, TenantContext};

pub fn router() -> Router {
    Router::new()
        .route("/:period", get(period_status))
        .route("/:period/close", post(close_period))
        .route("/:period/reopen", post(reopen_period))
}

pub async fn period_status(
    Extension(engine): Extension<LedgerEngine>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(raw): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let period = dto::parse_period(&raw)?;
    let actor = principal.actor(&tenant);
    let open = blocking(move || Ok(engine.is_period_open(&actor, period))).await?;
    Ok(Json(json!({ "period": period.to_string(), "open": open })))
}

pub async fn close_period(
    Extension(engine): Extension<LedgerEngine>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(raw): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let period = dto::parse_period(&raw)?;
    let actor = principal.actor(&tenant);
    blocking(move || Ok(engine.close_period(&actor, period)?)).await?;
    Ok(Json(json!({ "period": period.to_string(), "open": false })))
}

pub async fn reopen_period(
    Extension(engine): Extension<LedgerEngine>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(raw): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let period = dto::parse_period(&raw)?;
    let actor = principal.actor(&tenant);
    blocking(move || Ok(engine.reopen_period(&actor, period)?)).await?;
    Ok(Json(json!({ "period": period.to_string(), "open": true })))
}
