//! Ledger engine: application-level orchestration.
//!
//! The engine composes the account directory, a [`PostingStore`], the fiscal
//! calendar and the authorizer, and exposes every tenant-scoped operation of
//! the ledger:
//!
//! ```text
//! Actor + request
//!   ↓
//! 1. Role check (approver / poster / admin, per operation)
//!   ↓
//! 2. Load voucher (tenant-scoped) and decide events (pure aggregate)
//!   ↓
//! 3. Account checks under the tenant's chart read lock
//!   ↓
//! 4. Persist: optimistic save, or the locked all-or-nothing posting commit
//! ```
//!
//! Operations are synchronous and may block on store locks; async callers run
//! them on a blocking thread.

mod accounts;
mod reports;
mod vouchers;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use forgeledger_accounting::Account;
use forgeledger_auth::{Actor, Authorizer, ClaimedRoles, Role, require_role};
use forgeledger_core::{LedgerResult, QueryBudget};

use crate::config::LedgerConfig;
use crate::directory::InMemoryAccountDirectory;
use crate::fiscal::{FiscalPeriods, InMemoryFiscalCalendar};
use crate::store::{AccountStore, InMemoryLedgerStore, PostingStore};

pub use vouchers::{NewVoucher, PostingOutcome, VoucherEdit};

/// Tunables the engine reads on every operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub lock_timeout: Duration,
    pub query_timeout: Duration,
    pub approver_role: Role,
    pub poster_role: Role,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&LedgerConfig::default())
    }
}

impl From<&LedgerConfig> for EngineSettings {
    fn from(config: &LedgerConfig) -> Self {
        Self {
            lock_timeout: config.lock_timeout,
            query_timeout: config.query_timeout,
            approver_role: Role::new(config.approver_role.clone()),
            poster_role: Role::new(config.poster_role.clone()),
        }
    }
}

#[derive(Clone)]
pub struct LedgerEngine {
    directory: Arc<InMemoryAccountDirectory>,
    store: Arc<dyn PostingStore>,
    account_store: Option<Arc<dyn AccountStore>>,
    fiscal: Arc<dyn FiscalPeriods>,
    authorizer: Arc<dyn Authorizer>,
    settings: EngineSettings,
}

impl fmt::Debug for LedgerEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerEngine")
            .field("settings", &self.settings)
            .field("persistent_accounts", &self.account_store.is_some())
            .finish_non_exhaustive()
    }
}

impl LedgerEngine {
    pub fn new(
        store: Arc<dyn PostingStore>,
        fiscal: Arc<dyn FiscalPeriods>,
        authorizer: Arc<dyn Authorizer>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            directory: Arc::new(InMemoryAccountDirectory::new()),
            store,
            account_store: None,
            fiscal,
            authorizer,
            settings,
        }
    }

    /// Fully in-memory engine trusting the roles carried by each actor.
    pub fn in_memory(settings: EngineSettings) -> Self {
        Self::new(
            Arc::new(InMemoryLedgerStore::new()),
            Arc::new(InMemoryFiscalCalendar::new()),
            Arc::new(ClaimedRoles),
            settings,
        )
    }

    /// Load the directory from `accounts` and write every later change through to it.
    pub fn with_account_store(mut self, accounts: Arc<dyn AccountStore>) -> LedgerResult<Self> {
        let loaded = self.directory.restore(accounts.load_accounts()?)?;
        tracing::info!(accounts = loaded, "account directory restored");
        self.account_store = Some(accounts);
        Ok(self)
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn directory(&self) -> &InMemoryAccountDirectory {
        &self.directory
    }

    /// Budget bounded by the configured query timeout.
    pub fn query_budget(&self) -> QueryBudget {
        QueryBudget::with_timeout(self.settings.query_timeout)
    }

    fn require(&self, actor: &Actor, role: &Role) -> LedgerResult<()> {
        require_role(self.authorizer.as_ref(), actor, actor.tenant_id, role).map_err(|e| {
            warn!(
                tenant_id = %actor.tenant_id,
                user_id = %actor.user_id,
                role = role.as_str(),
                "authorization refused"
            );
            e.into()
        })
    }

    fn persist_account(&self, account: &Account) -> LedgerResult<()> {
        match &self.account_store {
            Some(store) => store.save_account(account),
            None => Ok(()),
        }
    }
}
