use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};

use forgeledger_accounting::{Voucher, VoucherId};
use forgeledger_auth::Actor;
use forgeledger_core::LedgerResult;
use forgeledger_infra::{LedgerEngine, NewVoucher, VoucherEdit, VoucherFilter};

use crate::app::dto::{self, RejectVoucherRequest};
use crate::app::errors::ApiError;
use crate::app::routes::common::blocking;
use crate::context::{PrincipalContext, TenantContext};

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_vouchers).post(create_voucher))
        .route("/:id", get(get_voucher).patch(update_voucher))
        .route("/:id/history", get(voucher_history))
        .route("/:id/submit", post(submit_voucher))
        .route("/:id/approve", post(approve_voucher))
        .route("/:id/reject", post(reject_voucher))
        .route("/:id/reopen", post(reopen_voucher))
        .route("/:id/post", post(post_voucher))
}

pub async fn list_vouchers(
    Extension(engine): Extension<LedgerEngine>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Query(filter): Query<VoucherFilter>,
) -> Result<impl IntoResponse, ApiError> {
    let actor = principal.actor(&tenant);
    let vouchers = blocking(move || Ok(engine.list_vouchers(&actor, &filter)?)).await?;
    let items = vouchers.iter().map(dto::voucher_to_json).collect::<Vec<_>>();
    Ok(Json(serde_json::json!({ "items": items })))
}

pub async fn create_voucher(
    Extension(engine): Extension<LedgerEngine>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Json(body): Json<NewVoucher>,
) -> Result<impl IntoResponse, ApiError> {
    let actor = principal.actor(&tenant);
    let voucher = blocking(move || Ok(engine.create_voucher(&actor, body)?)).await?;
    Ok((StatusCode::CREATED, Json(dto::voucher_to_json(&voucher))))
}

pub async fn get_voucher(
    Extension(engine): Extension<LedgerEngine>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    transition(engine, principal.actor(&tenant), &id, |e, a, v| e.get_voucher(a, v)).await
}

pub async fn update_voucher(
    Extension(engine): Extension<LedgerEngine>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    Json(body): Json<VoucherEdit>,
) -> Result<impl IntoResponse, ApiError> {
    transition(engine, principal.actor(&tenant), &id, move |e, a, v| {
        e.update_voucher(a, v, body)
    })
    .await
}

pub async fn submit_voucher(
    Extension(engine): Extension<LedgerEngine>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    transition(engine, principal.actor(&tenant), &id, |e, a, v| e.submit_voucher(a, v)).await
}

pub async fn approve_voucher(
    Extension(engine): Extension<LedgerEngine>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    transition(engine, principal.actor(&tenant), &id, |e, a, v| e.approve_voucher(a, v)).await
}

pub async fn reject_voucher(
    Extension(engine): Extension<LedgerEngine>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    Json(body): Json<RejectVoucherRequest>,
) -> Result<impl IntoResponse, ApiError> {
    transition(engine, principal.actor(&tenant), &id, move |e, a, v| {
        e.reject_voucher(a, v, &body.reason)
    })
    .await
}

pub async fn reopen_voucher(
    Extension(engine): Extension<LedgerEngine>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    transition(engine, principal.actor(&tenant), &id, |e, a, v| e.reopen_voucher(a, v)).await
}

pub async fn post_voucher(
    Extension(engine): Extension<LedgerEngine>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let voucher_id = dto::parse_voucher_id(&id)?;
    let actor = principal.actor(&tenant);
    let outcome = blocking(move || Ok(engine.post_voucher(&actor, voucher_id)?)).await?;
    Ok(Json(serde_json::json!({
        "voucher": dto::voucher_to_json(&outcome.voucher),
        "balances": outcome.balances.iter().map(dto::ledger_balance_to_json).collect::<Vec<_>>(),
    })))
}

pub async fn voucher_history(
    Extension(engine): Extension<LedgerEngine>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let voucher_id = dto::parse_voucher_id(&id)?;
    let actor = principal.actor(&tenant);
    let history = blocking(move || Ok(engine.voucher_history(&actor, voucher_id)?)).await?;
    Ok(Json(serde_json::json!({ "items": history })))
}

/// Shared shape of the single-voucher operations: parse the id, run `op` on
/// the blocking pool, answer with the resulting voucher.
async fn transition<F>(
    engine: LedgerEngine,
    actor: Actor,
    id: &str,
    op: F,
) -> Result<Json<serde_json::Value>, ApiError>
where
    F: FnOnce(&LedgerEngine, &Actor, VoucherId) -> LedgerResult<Voucher> + Send + 'static,
{
    let voucher_id = dto::parse_voucher_id(id)?;
    let voucher = blocking(move || Ok(op(&engine, &actor, voucher_id)?)).await?;
    Ok(Json(dto::voucher_to_json(&voucher)))
}
