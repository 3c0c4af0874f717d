//! Ledger error model.
//!
//! Errors are grouped by how the caller is expected to react:
//!
//! - [`ValidationError`]: the request itself is malformed; fix the input.
//! - [`StateError`]: the request is well-formed but illegal in the current
//!   workflow state.
//! - [`PolicyError`]: a business rule or authorization policy refuses it.
//! - [`ConcurrencyError`]: transient; the caller may retry (with its own
//!   idempotency key), the core never retries on its own.
//!
//! Validation and state errors are always raised before any mutation.

use thiserror::Error;

/// Result type used across the ledger.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Top-level ledger error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("invalid state: {0}")]
    State(#[from] StateError),

    #[error("policy violation: {0}")]
    Policy(#[from] PolicyError),

    #[error("concurrency conflict: {0}")]
    Concurrency(#[from] ConcurrencyError),

    #[error("not found: {0}")]
    NotFound(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A read query was cancelled through its token.
    #[error("query cancelled")]
    Cancelled,

    /// A read query ran past its deadline.
    #[error("query deadline exceeded")]
    Timeout,

    /// Backend failure (poisoned lock, database error, ...).
    #[error("storage failure: {0}")]
    Storage(String),
}

impl LedgerError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Whether a caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Concurrency(_))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Debits and credits differ; both totals are reported to aid correction.
    #[error("voucher unbalanced (debit total {debit_total}, credit total {credit_total})")]
    VoucherUnbalanced { debit_total: i128, credit_total: i128 },

    #[error("voucher has no entries")]
    EmptyVoucher,

    #[error("entry {line}: {reason}")]
    MalformedEntry { line: u32, reason: String },

    #[error("entry {line}: unknown account {account}")]
    UnknownAccount { line: u32, account: String },

    #[error("account code '{0}' already exists")]
    DuplicateCode(String),

    #[error("invalid parent account: {0}")]
    InvalidParent(String),

    #[error("{0} must not be empty")]
    EmptyField(&'static str),

    #[error("voucher numbered in {number_year} cannot be dated in {date_year}")]
    NumberYearMismatch { number_year: i32, date_year: i32 },

    #[error("invalid fiscal period {year}-{month:02}")]
    InvalidPeriod { year: i32, month: u32 },

    #[error("invalid date range: {0}")]
    InvalidRange(String),

    #[error("amount overflow")]
    AmountOverflow,

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("invalid transition from '{from}' to '{to}'")]
    InvalidTransition { from: &'static str, to: &'static str },

    #[error("voucher is not editable in status '{0}'")]
    NotEditable(&'static str),

    #[error("voucher already posted")]
    AlreadyPosted,

    #[error("voucher already exists")]
    AlreadyExists,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("fiscal period {year}-{month:02} is closed")]
    PeriodClosed { year: i32, month: u32 },

    #[error("account '{0}' is inactive")]
    AccountInactive(String),

    #[error("actor lacks role '{0}'")]
    InsufficientRole(String),

    #[error("account '{0}' has an open balance")]
    HasOpenBalance(String),

    #[error("account '{0}' is referenced by voucher entries")]
    AccountReferenced(String),

    #[error("account '{0}' has child accounts")]
    HasChildren(String),

    #[error("move would create a cycle in the account tree")]
    CycleDetected,

    #[error("cross-tenant reference")]
    CrossTenant,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConcurrencyError {
    #[error("busy: could not acquire ledger locks within {waited_ms}ms")]
    LockTimeout { waited_ms: u64 },

    #[error("stale version (expected {expected}, actual {actual})")]
    StaleVersion { expected: u64, actual: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_concurrency_errors_are_retryable() {
        let busy: LedgerError = ConcurrencyError::LockTimeout { waited_ms: 10 }.into();
        assert!(busy.is_retryable());

        let unbalanced: LedgerError = ValidationError::VoucherUnbalanced {
            debit_total: 1000,
            credit_total: 900,
        }
        .into();
        assert!(!unbalanced.is_retryable());
        assert_eq!(
            unbalanced.to_string(),
            "validation failed: voucher unbalanced (debit total 1000, credit total 900)"
        );
    }
}
