//! Voucher and ledger-balance storage.
//!
//! Traits are synchronous, like the rest of the domain layer; the in-memory
//! backend is the default and the Postgres backend (feature `postgres`)
//! mirrors the same operations with async methods.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use forgeledger_accounting::{
    Account, AccountNature, LedgerBalance, PostedLine, Voucher, VoucherEvent, VoucherId, VoucherNumber,
    VoucherStatus,
};
use forgeledger_core::{AccountId, ExpectedVersion, FiscalPeriod, LedgerResult, TenantId};
use forgeledger_events::EventEnvelope;

use crate::fiscal::FiscalPeriods;

pub mod in_memory;
pub mod locks;
mod staging;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use in_memory::InMemoryLedgerStore;
pub use locks::{KeyGuard, KeyLocks};
#[cfg(feature = "postgres")]
pub use postgres::PostgresLedgerStore;

/// Filter for listing vouchers; unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoucherFilter {
    pub status: Option<VoucherStatus>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl VoucherFilter {
    pub fn matches(&self, voucher: &Voucher) -> bool {
        self.status.is_none_or(|s| voucher.status() == s)
            && self.from.is_none_or(|from| voucher.date() >= from)
            && self.to.is_none_or(|to| voucher.date() <= to)
    }
}

/// Filter over posted entry lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostedLineFilter {
    pub account_id: Option<AccountId>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl PostedLineFilter {
    pub fn matches(&self, line: &PostedLine) -> bool {
        self.account_id.is_none_or(|a| line.account_id == a)
            && self.from.is_none_or(|from| line.date >= from)
            && self.to.is_none_or(|to| line.date <= to)
    }
}

/// Balance movement of one account, with the nature a new row should carry.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PostingDelta {
    pub account_id: AccountId,
    pub nature: AccountNature,
    pub debit: i64,
    pub credit: i64,
}

/// Everything one voucher posting writes, applied all-or-nothing.
#[derive(Debug, Clone)]
pub struct PostingCommit {
    /// Voucher state after the posted event was applied.
    pub voucher: Voucher,
    /// Version the voucher had when it was loaded.
    pub expected_version: u64,
    pub events: Vec<VoucherEvent>,
    pub period: FiscalPeriod,
    pub deltas: Vec<PostingDelta>,
}

impl PostingCommit {
    pub fn tenant_id(&self) -> Option<TenantId> {
        self.voucher.tenant_id()
    }
}

pub trait VoucherStore: Send + Sync {
    /// Next number in the tenant's sequence for `year` (starts at 1).
    fn next_voucher_number(&self, tenant_id: TenantId, year: i32) -> LedgerResult<VoucherNumber>;

    /// Store a freshly created voucher with its creation events.
    fn insert_voucher(&self, voucher: &Voucher, events: &[VoucherEvent]) -> LedgerResult<()>;

    fn load_voucher(&self, tenant_id: TenantId, voucher_id: VoucherId) -> LedgerResult<Voucher>;

    /// Replace a non-posted voucher, guarded by optimistic concurrency.
    fn save_voucher(
        &self,
        voucher: &Voucher,
        expected_version: ExpectedVersion,
        events: &[VoucherEvent],
    ) -> LedgerResult<()>;

    /// Audit trail in sequence order.
    fn voucher_history(
        &self,
        tenant_id: TenantId,
        voucher_id: VoucherId,
    ) -> LedgerResult<Vec<EventEnvelope<VoucherEvent>>>;

    /// Vouchers ordered by number.
    fn list_vouchers(&self, tenant_id: TenantId, filter: &VoucherFilter) -> LedgerResult<Vec<Voucher>>;

    fn posted_lines(
        &self,
        tenant_id: TenantId,
        filter: &PostedLineFilter,
    ) -> LedgerResult<Vec<PostedLine>>;

    /// Whether any voucher entry (any status) references the account.
    fn account_is_referenced(&self, tenant_id: TenantId, account_id: AccountId) -> LedgerResult<bool>;
}

pub trait LedgerBalanceStore: Send + Sync {
    /// Apply one delta to (tenant, account, period), creating the row lazily and
    /// rolling later periods of the account forward.
    #[allow(clippy::too_many_arguments)]
    fn upsert_period(
        &self,
        tenant_id: TenantId,
        account_id: AccountId,
        nature: AccountNature,
        period: FiscalPeriod,
        debit: i64,
        credit: i64,
        lock_timeout: Duration,
    ) -> LedgerResult<LedgerBalance>;

    /// The stored row for exactly this period.
    fn get_balance(
        &self,
        tenant_id: TenantId,
        account_id: AccountId,
        period: FiscalPeriod,
    ) -> LedgerResult<LedgerBalance>;

    /// Row for `period`, or the latest earlier row carried forward.
    fn balance_as_of(
        &self,
        tenant_id: TenantId,
        account_id: AccountId,
        period: FiscalPeriod,
    ) -> LedgerResult<Option<LedgerBalance>>;

    /// [`LedgerBalanceStore::balance_as_of`] for every account of the tenant that has one.
    fn balances_as_of(&self, tenant_id: TenantId, period: FiscalPeriod) -> LedgerResult<Vec<LedgerBalance>>;

    /// Most recent row of the account, whatever its period.
    fn latest_balance(
        &self,
        tenant_id: TenantId,
        account_id: AccountId,
    ) -> LedgerResult<Option<LedgerBalance>>;
}

/// Storage that can commit a voucher posting atomically.
pub trait PostingStore: VoucherStore + LedgerBalanceStore {
    /// Lock the voucher then its balance keys (bounded by `lock_timeout`),
    /// re-check the fiscal period and the voucher version under the locks,
    /// then persist the posted voucher and every delta, or nothing.
    fn commit_posting(
        &self,
        commit: PostingCommit,
        fiscal: &dyn FiscalPeriods,
        lock_timeout: Duration,
    ) -> LedgerResult<Vec<LedgerBalance>>;
}

/// Durable copy of the account directory, written through on every change.
pub trait AccountStore: Send + Sync {
    fn save_account(&self, account: &Account) -> LedgerResult<()>;

    fn delete_account(&self, tenant_id: TenantId, account_id: AccountId) -> LedgerResult<()>;

    /// Every tenant's accounts, for rebuilding the directory at startup.
    fn load_accounts(&self) -> LedgerResult<Vec<Account>>;
}

impl<S> VoucherStore for Arc<S>
where
    S: VoucherStore + ?Sized,
{
    fn next_voucher_number(&self, tenant_id: TenantId, year: i32) -> LedgerResult<VoucherNumber> {
        (**self).next_voucher_number(tenant_id, year)
    }

    fn insert_voucher(&self, voucher: &Voucher, events: &[VoucherEvent]) -> LedgerResult<()> {
        (**self).insert_voucher(voucher, events)
    }

    fn load_voucher(&self, tenant_id: TenantId, voucher_id: VoucherId) -> LedgerResult<Voucher> {
        (**self).load_voucher(tenant_id, voucher_id)
    }

    fn save_voucher(
        &self,
        voucher: &Voucher,
        expected_version: ExpectedVersion,
        events: &[VoucherEvent],
    ) -> LedgerResult<()> {
        (**self).save_voucher(voucher, expected_version, events)
    }

    fn voucher_history(
        &self,
        tenant_id: TenantId,
        voucher_id: VoucherId,
    ) -> LedgerResult<Vec<EventEnvelope<VoucherEvent>>> {
        (**self).voucher_history(tenant_id, voucher_id)
    }

    fn list_vouchers(&self, tenant_id: TenantId, filter: &VoucherFilter) -> LedgerResult<Vec<Voucher>> {
        (**self).list_vouchers(tenant_id, filter)
    }

    fn posted_lines(
        &self,
        tenant_id: TenantId,
        filter: &PostedLineFilter,
    ) -> LedgerResult<Vec<PostedLine>> {
        (**self).posted_lines(tenant_id, filter)
    }

    fn account_is_referenced(&self, tenant_id: TenantId, account_id: AccountId) -> LedgerResult<bool> {
        (**self).account_is_referenced(tenant_id, account_id)
    }
}
