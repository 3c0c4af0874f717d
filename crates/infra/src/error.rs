//! Storage-level failures and their mapping into the domain taxonomy.

use thiserror::Error;

use forgeledger_core::{ConcurrencyError, LedgerError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("lock poisoned: {0}")]
    Poisoned(&'static str),

    #[error("lock wait exceeded {waited_ms}ms")]
    LockTimeout { waited_ms: u64 },

    #[error("database error in {operation}: {message}")]
    Database { operation: &'static str, message: String },

    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl From<StoreError> for LedgerError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::LockTimeout { waited_ms } => ConcurrencyError::LockTimeout { waited_ms }.into(),
            other => LedgerError::Storage(other.to_string()),
        }
    }
}

pub(crate) fn poisoned(what: &'static str) -> LedgerError {
    StoreError::Poisoned(what).into()
}
