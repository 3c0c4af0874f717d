//! `forgeledger-core`: ledger foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the fiscal period value object, the error taxonomy shared by
//! every layer, and the query budget used to cancel long-running reads.

pub mod aggregate;
pub mod budget;
pub mod error;
pub mod id;
pub mod period;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use budget::{CancelToken, QueryBudget};
pub use error::{
    ConcurrencyError, LedgerError, LedgerResult, PolicyError, StateError, ValidationError,
};
pub use id::{AccountId, AggregateId, TenantId, UserId};
pub use period::FiscalPeriod;
