//! Infrastructure layer: storage backends, the account directory, the fiscal
//! calendar, configuration, and the ledger engine that composes them.

pub mod config;
pub mod directory;
pub mod engine;
pub mod error;
pub mod fiscal;
pub mod store;

mod integration_tests;

pub use config::{ConfigError, LedgerConfig};
pub use directory::InMemoryAccountDirectory;
pub use engine::{EngineSettings, LedgerEngine, NewVoucher, PostingOutcome, VoucherEdit};
pub use error::StoreError;
pub use fiscal::{FiscalPeriods, InMemoryFiscalCalendar};
pub use store::{
    AccountStore, InMemoryLedgerStore, LedgerBalanceStore, PostedLineFilter, PostingStore,
    VoucherFilter, VoucherStore,
};
#[cfg(feature = "postgres")]
pub use store::PostgresLedgerStore;
