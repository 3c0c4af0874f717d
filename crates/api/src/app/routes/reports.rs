//! Report endpoints. Each query runs under the engine's query deadline and is
//! cancelled when the client disconnects.

use axum::{
    Json, Router,
    extract::{Extension, Query},
    response::IntoResponse,
    routing::get,
};

use forgeledger_infra::LedgerEngine;

use crate::app::dto::{self, DateRangeQuery, PeriodQuery, TrialBalanceQuery};
use crate::app::errors::ApiError;
use crate::app::routes::common::{CancelOnDrop, blocking};
use crate::context::{PrincipalContext, TenantContext};

pub fn router() -> Router {
    Router::new()
        .route("/trial-balance", get(trial_balance))
        .route("/income-statement", get(income_statement))
        .route("/balance-sheet", get(balance_sheet))
}

pub async fn trial_balance(
    Extension(engine): Extension<LedgerEngine>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Query(q): Query<TrialBalanceQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let period = dto::parse_period(&q.period)?;
    let actor = principal.actor(&tenant);
    let budget = engine.query_budget();
    let _cancel = CancelOnDrop(budget.token());
    let report = blocking(move || {
        Ok(engine.trial_balance(&actor, period, q.include_zero, &budget)?)
    })
    .await?;
    Ok(Json(report))
}

pub async fn income_statement(
    Extension(engine): Extension<LedgerEngine>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Query(q): Query<DateRangeQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let actor = principal.actor(&tenant);
    let budget = engine.query_budget();
    let _cancel = CancelOnDrop(budget.token());
    let report =
        blocking(move || Ok(engine.income_statement(&actor, q.from, q.to, &budget)?)).await?;
    Ok(Json(report))
}

pub async fn balance_sheet(
    Extension(engine): Extension<LedgerEngine>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Query(q): Query<PeriodQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let period = dto::parse_period(&q.period)?;
    let actor = principal.actor(&tenant);
    let budget = engine.query_budget();
    let _cancel = CancelOnDrop(budget.token());
    let report = blocking(move || Ok(engine.balance_sheet(&actor, period, &budget)?)).await?;
    Ok(Json(report))
}
