use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};

use forgeledger_accounting::NewAccount;
use forgeledger_infra::LedgerEngine;

use crate::app::dto::{self, AccountTreeQuery, DateRangeQuery, MoveAccountRequest, PeriodQuery, UpdateAccountRequest};
use crate::app::errors::ApiError;
use crate::app::routes::common::{CancelOnDrop, blocking};
use crate::context::{PrincipalContext, TenantContext};

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_accounts).post(create_account))
        .route(
            "/:id",
            get(get_account).patch(update_account).delete(delete_account),
        )
        .route("/:id/move", post(move_account))
        .route("/:id/deactivate", post(deactivate_account))
        .route("/:id/reactivate", post(reactivate_account))
        .route("/:id/ledger", get(account_ledger))
        .route("/:id/balance", get(account_balance))
}

pub async fn list_accounts(
    Extension(engine): Extension<LedgerEngine>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Query(q): Query<AccountTreeQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let actor = principal.actor(&tenant);
    let body = blocking(move || {
        let items = if q.flat {
            serde_json::to_value(engine.accounts_flat(&actor)?)
        } else {
            serde_json::to_value(engine.account_tree(&actor)?)
        };
        items.map_err(|e| ApiError::Internal(e.to_string()))
    })
    .await?;
    Ok(Json(serde_json::json!({ "items": body })))
}

pub async fn create_account(
    Extension(engine): Extension<LedgerEngine>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Json(body): Json<NewAccount>,
) -> Result<impl IntoResponse, ApiError> {
    let actor = principal.actor(&tenant);
    let account = blocking(move || Ok(engine.create_account(&actor, body)?)).await?;
    Ok((StatusCode::CREATED, Json(account)))
}

pub async fn get_account(
    Extension(engine): Extension<LedgerEngine>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let account_id = dto::parse_account_id(&id)?;
    let actor = principal.actor(&tenant);
    let account = blocking(move || Ok(engine.get_account(&actor, account_id)?)).await?;
    Ok(Json(account))
}

/// Rename and/or re-code; the code change is refused once the account is referenced.
pub async fn update_account(
    Extension(engine): Extension<LedgerEngine>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    Json(body): Json<UpdateAccountRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let account_id = dto::parse_account_id(&id)?;
    if body.name.is_none() && body.code.is_none() {
        return Err(ApiError::BadRequest("nothing to update".into()));
    }
    let actor = principal.actor(&tenant);
    let account = blocking(move || {
        let mut account = engine.get_account(&actor, account_id)?;
        if let Some(code) = &body.code {
            account = engine.change_account_code(&actor, account_id, code)?;
        }
        if let Some(name) = &body.name {
            account = engine.rename_account(&actor, account_id, name)?;
        }
        Ok(account)
    })
    .await?;
    Ok(Json(account))
}

pub async fn delete_account(
    Extension(engine): Extension<LedgerEngine>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let account_id = dto::parse_account_id(&id)?;
    let actor = principal.actor(&tenant);
    blocking(move || Ok(engine.delete_account(&actor, account_id)?)).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn move_account(
    Extension(engine): Extension<LedgerEngine>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    Json(body): Json<MoveAccountRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let account_id = dto::parse_account_id(&id)?;
    let actor = principal.actor(&tenant);
    let account =
        blocking(move || Ok(engine.move_account(&actor, account_id, body.parent_id)?)).await?;
    Ok(Json(account))
}

pub async fn deactivate_account(
    Extension(engine): Extension<LedgerEngine>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let account_id = dto::parse_account_id(&id)?;
    let actor = principal.actor(&tenant);
    let account = blocking(move || Ok(engine.deactivate_account(&actor, account_id)?)).await?;
    Ok(Json(account))
}

pub async fn reactivate_account(
    Extension(engine): Extension<LedgerEngine>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let account_id = dto::parse_account_id(&id)?;
    let actor = principal.actor(&tenant);
    let account = blocking(move || Ok(engine.reactivate_account(&actor, account_id)?)).await?;
    Ok(Json(account))
}

pub async fn account_ledger(
    Extension(engine): Extension<LedgerEngine>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    Query(q): Query<DateRangeQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let account_id = dto::parse_account_id(&id)?;
    let actor = principal.actor(&tenant);
    let budget = engine.query_budget();
    let _cancel = CancelOnDrop(budget.token());
    let ledger = blocking(move || {
        Ok(engine.account_ledger(&actor, account_id, q.from, q.to, &budget)?)
    })
    .await?;
    Ok(Json(ledger))
}

/// Balance as of a period; carried forward from earlier activity when the
/// account has no row for the period itself.
pub async fn account_balance(
    Extension(engine): Extension<LedgerEngine>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    Query(q): Query<PeriodQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let account_id = dto::parse_account_id(&id)?;
    let period = dto::parse_period(&q.period)?;
    let actor = principal.actor(&tenant);
    let balance = blocking(move || {
        let balance = engine.balance_as_of(&actor, account_id, period)?;
        engine.get_account(&actor, account_id)?;
        Ok(balance)
    })
    .await?;
    match balance {
        Some(b) => Ok(Json(dto::ledger_balance_to_json(&b))),
        None => Ok(Json(serde_json::json!({
            "account_id": account_id.to_string(),
            "period": period.to_string(),
            "balance": 0,
        }))),
    }
}
