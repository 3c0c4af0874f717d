use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::{Value, json};

use forgeledger_accounting::{LedgerBalance, Voucher, VoucherId};
use forgeledger_core::{AccountId, AggregateRoot, FiscalPeriod};

use crate::app::errors::ApiError;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct UpdateAccountRequest {
    pub name: Option<String>,
    pub code: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MoveAccountRequest {
    pub parent_id: Option<AccountId>,
}

#[derive(Debug, Deserialize)]
pub struct RejectVoucherRequest {
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct PeriodQuery {
    /// `YYYY-MM`.
    pub period: String,
}

#[derive(Debug, Deserialize)]
pub struct TrialBalanceQuery {
    pub period: String,
    #[serde(default)]
    pub include_zero: bool,
}

#[derive(Debug, Deserialize)]
pub struct DateRangeQuery {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

#[derive(Debug, Deserialize)]
pub struct AccountTreeQuery {
    #[serde(default)]
    pub flat: bool,
}

// -------------------------
// Parsing helpers
// -------------------------

pub fn parse_period(raw: &str) -> Result<FiscalPeriod, ApiError> {
    Ok(raw.parse::<FiscalPeriod>()?)
}

pub fn parse_account_id(raw: &str) -> Result<AccountId, ApiError> {
    Ok(raw.parse::<AccountId>()?)
}

pub fn parse_voucher_id(raw: &str) -> Result<VoucherId, ApiError> {
    Ok(raw.parse::<VoucherId>()?)
}

// -------------------------
// Response mapping
// -------------------------

pub fn voucher_to_json(v: &Voucher) -> Value {
    let totals = v.totals();
    json!({
        "id": v.id_typed().to_string(),
        "number": v.number().to_string(),
        "date": v.date(),
        "period": v.period().to_string(),
        "voucher_type": v.voucher_type(),
        "description": v.description(),
        "status": v.status().as_str(),
        "entries": v.entries(),
        "total_debit": totals.debit.to_string(),
        "total_credit": totals.credit.to_string(),
        "created_by": v.created_by(),
        "approved_by": v.approved_by(),
        "posted_by": v.posted_by(),
        "posted_at": v.posted_at(),
        "rejection_reason": v.rejection_reason(),
        "version": v.version(),
    })
}

pub fn ledger_balance_to_json(b: &LedgerBalance) -> Value {
    json!({
        "account_id": b.account_id.to_string(),
        "period": b.period.to_string(),
        "nature": b.nature.as_str(),
        "opening_debit": b.opening_debit,
        "opening_credit": b.opening_credit,
        "period_debit": b.period_debit,
        "period_credit": b.period_credit,
        "closing_debit": b.closing_debit,
        "closing_credit": b.closing_credit,
        "balance": b.balance,
    })
}
