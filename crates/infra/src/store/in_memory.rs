use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use forgeledger_accounting::{
    AccountNature, BalanceKey, LedgerBalance, PostedLine, VOUCHER_AGGREGATE_TYPE, Voucher,
    VoucherEvent, VoucherId, VoucherNumber, VoucherStatus,
};
use forgeledger_core::{
    AccountId, AggregateRoot, ExpectedVersion, FiscalPeriod, LedgerError, LedgerResult,
    PolicyError, StateError, TenantId,
};
use forgeledger_events::EventEnvelope;

use super::locks::KeyLocks;
use super::staging::{same_account, stage_delta};
use super::{
    LedgerBalanceStore, PostedLineFilter, PostingCommit, PostingStore, VoucherFilter, VoucherStore,
};
use crate::error::poisoned;
use crate::fiscal::FiscalPeriods;

/// Lock keys; the voucher variant sorts first so it is always taken first.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum LockKey {
    Voucher(TenantId, VoucherId),
    Balance(BalanceKey),
}

#[derive(Debug, Default)]
struct VoucherTables {
    vouchers: HashMap<VoucherId, Voucher>,
    history: HashMap<VoucherId, Vec<EventEnvelope<VoucherEvent>>>,
    sequences: HashMap<i32, u32>,
    posted: Vec<PostedLine>,
}

/// One tenant's books. Its two locks are always taken vouchers first.
#[derive(Debug, Default)]
struct Books {
    vouchers: RwLock<VoucherTables>,
    balances: RwLock<BTreeMap<BalanceKey, LedgerBalance>>,
}

/// In-memory voucher + ledger balance store.
///
/// Intended for tests/dev and single-process deployments. State is striped
/// per tenant: the outer map is only write-locked to register a tenant, so
/// postings for different tenants never wait on each other.
#[derive(Debug)]
pub struct InMemoryLedgerStore {
    tenants: RwLock<HashMap<TenantId, Arc<Books>>>,
    locks: KeyLocks<LockKey>,
}

impl Default for InMemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self {
            tenants: RwLock::new(HashMap::new()),
            locks: KeyLocks::new(),
        }
    }

    /// Books for reads; an unknown tenant has none and is not registered.
    fn existing(&self, tenant_id: TenantId) -> LedgerResult<Option<Arc<Books>>> {
        Ok(self
            .tenants
            .read()
            .map_err(|_| poisoned("tenants"))?
            .get(&tenant_id)
            .cloned())
    }

    fn books(&self, tenant_id: TenantId) -> LedgerResult<Arc<Books>> {
        if let Some(books) = self.existing(tenant_id)? {
            return Ok(books);
        }
        let mut tenants = self.tenants.write().map_err(|_| poisoned("tenants"))?;
        Ok(tenants.entry(tenant_id).or_default().clone())
    }

    fn envelopes(
        tenant_id: TenantId,
        voucher_id: VoucherId,
        base_version: u64,
        events: &[VoucherEvent],
    ) -> Vec<EventEnvelope<VoucherEvent>> {
        EventEnvelope::wrap_batch(tenant_id, voucher_id.0, VOUCHER_AGGREGATE_TYPE, base_version, events)
    }
}

fn tenant_of(voucher: &Voucher) -> LedgerResult<TenantId> {
    voucher
        .tenant_id()
        .ok_or_else(|| LedgerError::storage("voucher has no tenant"))
}

fn carried(row: &LedgerBalance, period: FiscalPeriod) -> LedgerBalance {
    if row.period == period {
        row.clone()
    } else {
        row.carried_forward(period)
    }
}

impl VoucherStore for InMemoryLedgerStore {
    fn next_voucher_number(&self, tenant_id: TenantId, year: i32) -> LedgerResult<VoucherNumber> {
        let books = self.books(tenant_id)?;
        let mut tables = books.vouchers.write().map_err(|_| poisoned("vouchers"))?;
        let seq = tables.sequences.entry(year).or_insert(0);
        *seq += 1;
        Ok(VoucherNumber::new(year, *seq))
    }

    fn insert_voucher(&self, voucher: &Voucher, events: &[VoucherEvent]) -> LedgerResult<()> {
        let tenant_id = tenant_of(voucher)?;
        let voucher_id = voucher.id_typed();

        let books = self.books(tenant_id)?;
        let mut tables = books.vouchers.write().map_err(|_| poisoned("vouchers"))?;
        if tables.vouchers.contains_key(&voucher_id) {
            return Err(StateError::AlreadyExists.into());
        }
        let base = voucher.version().saturating_sub(events.len() as u64);
        tables
            .history
            .insert(voucher_id, Self::envelopes(tenant_id, voucher_id, base, events));
        tables.vouchers.insert(voucher_id, voucher.clone());
        Ok(())
    }

    fn load_voucher(&self, tenant_id: TenantId, voucher_id: VoucherId) -> LedgerResult<Voucher> {
        let missing = || LedgerError::not_found(format!("voucher {voucher_id}"));
        let books = self.existing(tenant_id)?.ok_or_else(missing)?;
        let tables = books.vouchers.read().map_err(|_| poisoned("vouchers"))?;
        tables.vouchers.get(&voucher_id).cloned().ok_or_else(missing)
    }

    fn save_voucher(
        &self,
        voucher: &Voucher,
        expected_version: ExpectedVersion,
        events: &[VoucherEvent],
    ) -> LedgerResult<()> {
        if voucher.status() == VoucherStatus::Posted {
            return Err(LedgerError::storage(
                "posted vouchers are persisted through commit_posting",
            ));
        }
        let tenant_id = tenant_of(voucher)?;
        let voucher_id = voucher.id_typed();
        let missing = || LedgerError::not_found(format!("voucher {voucher_id}"));

        let books = self.existing(tenant_id)?.ok_or_else(missing)?;
        let mut tables = books.vouchers.write().map_err(|_| poisoned("vouchers"))?;
        let stored = tables.vouchers.get(&voucher_id).ok_or_else(missing)?;
        if stored.status() == VoucherStatus::Posted {
            return Err(StateError::AlreadyPosted.into());
        }
        let base = stored.version();
        expected_version.check(base)?;

        let envelopes = Self::envelopes(tenant_id, voucher_id, base, events);
        tables.history.entry(voucher_id).or_default().extend(envelopes);
        tables.vouchers.insert(voucher_id, voucher.clone());
        Ok(())
    }

    fn voucher_history(
        &self,
        tenant_id: TenantId,
        voucher_id: VoucherId,
    ) -> LedgerResult<Vec<EventEnvelope<VoucherEvent>>> {
        let missing = || LedgerError::not_found(format!("voucher {voucher_id}"));
        let books = self.existing(tenant_id)?.ok_or_else(missing)?;
        let tables = books.vouchers.read().map_err(|_| poisoned("vouchers"))?;
        tables.history.get(&voucher_id).cloned().ok_or_else(missing)
    }

    fn list_vouchers(&self, tenant_id: TenantId, filter: &VoucherFilter) -> LedgerResult<Vec<Voucher>> {
        let Some(books) = self.existing(tenant_id)? else {
            return Ok(Vec::new());
        };
        let tables = books.vouchers.read().map_err(|_| poisoned("vouchers"))?;
        let mut out: Vec<Voucher> = tables
            .vouchers
            .values()
            .filter(|v| filter.matches(v))
            .cloned()
            .collect();
        out.sort_by_key(|v| v.number());
        Ok(out)
    }

    fn posted_lines(
        &self,
        tenant_id: TenantId,
        filter: &PostedLineFilter,
    ) -> LedgerResult<Vec<PostedLine>> {
        let Some(books) = self.existing(tenant_id)? else {
            return Ok(Vec::new());
        };
        let tables = books.vouchers.read().map_err(|_| poisoned("vouchers"))?;
        Ok(tables.posted.iter().filter(|l| filter.matches(l)).cloned().collect())
    }

    fn account_is_referenced(&self, tenant_id: TenantId, account_id: AccountId) -> LedgerResult<bool> {
        let Some(books) = self.existing(tenant_id)? else {
            return Ok(false);
        };
        let tables = books.vouchers.read().map_err(|_| poisoned("vouchers"))?;
        Ok(tables
            .vouchers
            .values()
            .any(|v| v.entries().iter().any(|e| e.account_id == account_id)))
    }
}

impl LedgerBalanceStore for InMemoryLedgerStore {
    fn upsert_period(
        &self,
        tenant_id: TenantId,
        account_id: AccountId,
        nature: AccountNature,
        period: FiscalPeriod,
        debit: i64,
        credit: i64,
        lock_timeout: Duration,
    ) -> LedgerResult<LedgerBalance> {
        let key = BalanceKey {
            tenant_id,
            account_id,
            period,
        };
        let _guard = self.locks.acquire([LockKey::Balance(key)], lock_timeout)?;

        let books = self.books(tenant_id)?;
        let mut balances = books.balances.write().map_err(|_| poisoned("balances"))?;
        let mut staged = BTreeMap::new();
        let row = stage_delta(
            &balances,
            &mut staged,
            tenant_id,
            account_id,
            nature,
            period,
            debit,
            credit,
        )?;
        balances.extend(staged);
        Ok(row)
    }

    fn get_balance(
        &self,
        tenant_id: TenantId,
        account_id: AccountId,
        period: FiscalPeriod,
    ) -> LedgerResult<LedgerBalance> {
        let missing = || LedgerError::not_found(format!("ledger balance {account_id} {period}"));
        let key = BalanceKey {
            tenant_id,
            account_id,
            period,
        };
        let books = self.existing(tenant_id)?.ok_or_else(missing)?;
        let balances = books.balances.read().map_err(|_| poisoned("balances"))?;
        balances.get(&key).cloned().ok_or_else(missing)
    }

    fn balance_as_of(
        &self,
        tenant_id: TenantId,
        account_id: AccountId,
        period: FiscalPeriod,
    ) -> LedgerResult<Option<LedgerBalance>> {
        let Some(books) = self.existing(tenant_id)? else {
            return Ok(None);
        };
        let key = BalanceKey {
            tenant_id,
            account_id,
            period,
        };
        let balances = books.balances.read().map_err(|_| poisoned("balances"))?;
        Ok(balances
            .range(..=key)
            .next_back()
            .filter(|(k, _)| same_account(k, &key))
            .map(|(_, row)| carried(row, period)))
    }

    fn balances_as_of(&self, tenant_id: TenantId, period: FiscalPeriod) -> LedgerResult<Vec<LedgerBalance>> {
        let Some(books) = self.existing(tenant_id)? else {
            return Ok(Vec::new());
        };
        let balances = books.balances.read().map_err(|_| poisoned("balances"))?;
        // Ascending key order: the last row seen per account is its latest.
        let mut latest: BTreeMap<AccountId, &LedgerBalance> = BTreeMap::new();
        for (key, row) in balances.iter() {
            if key.period <= period {
                latest.insert(key.account_id, row);
            }
        }
        Ok(latest.into_values().map(|row| carried(row, period)).collect())
    }

    fn latest_balance(
        &self,
        tenant_id: TenantId,
        account_id: AccountId,
    ) -> LedgerResult<Option<LedgerBalance>> {
        let Some(books) = self.existing(tenant_id)? else {
            return Ok(None);
        };
        let key = BalanceKey {
            tenant_id,
            account_id,
            period: FiscalPeriod::new(9999, 12)?,
        };
        let balances = books.balances.read().map_err(|_| poisoned("balances"))?;
        Ok(balances
            .range(..=key)
            .next_back()
            .filter(|(k, _)| same_account(k, &key))
            .map(|(_, row)| row.clone()))
    }
}

impl PostingStore for InMemoryLedgerStore {
    fn commit_posting(
        &self,
        commit: PostingCommit,
        fiscal: &dyn FiscalPeriods,
        lock_timeout: Duration,
    ) -> LedgerResult<Vec<LedgerBalance>> {
        let tenant_id = commit
            .tenant_id()
            .ok_or_else(|| LedgerError::storage("voucher has no tenant"))?;
        let voucher_id = commit.voucher.id_typed();
        let period = commit.period;

        let keys = std::iter::once(LockKey::Voucher(tenant_id, voucher_id)).chain(
            commit.deltas.iter().map(|d| {
                LockKey::Balance(BalanceKey {
                    tenant_id,
                    account_id: d.account_id,
                    period,
                })
            }),
        );
        let _guard = self.locks.acquire(keys, lock_timeout)?;

        // Read under the locks: a period closed while we waited refuses the post.
        if !fiscal.is_period_open(tenant_id, period.year(), period.month()) {
            return Err(PolicyError::PeriodClosed {
                year: period.year(),
                month: period.month(),
            }
            .into());
        }

        let missing = || LedgerError::not_found(format!("voucher {voucher_id}"));
        let books = self.existing(tenant_id)?.ok_or_else(missing)?;
        let mut tables = books.vouchers.write().map_err(|_| poisoned("vouchers"))?;
        let (stored_status, stored_version) = tables
            .vouchers
            .get(&voucher_id)
            .map(|v| (v.status(), v.version()))
            .ok_or_else(missing)?;
        if stored_status == VoucherStatus::Posted {
            return Err(StateError::AlreadyPosted.into());
        }
        ExpectedVersion::Exact(commit.expected_version).check(stored_version)?;

        let mut balances = books.balances.write().map_err(|_| poisoned("balances"))?;
        let mut staged = BTreeMap::new();
        let mut touched = Vec::with_capacity(commit.deltas.len());
        for delta in &commit.deltas {
            touched.push(stage_delta(
                &balances,
                &mut staged,
                tenant_id,
                delta.account_id,
                delta.nature,
                period,
                delta.debit,
                delta.credit,
            )?);
        }

        // Nothing above mutated shared state; from here on nothing can fail.
        balances.extend(staged);
        let envelopes = Self::envelopes(tenant_id, voucher_id, stored_version, &commit.events);
        tables.history.entry(voucher_id).or_default().extend(envelopes);
        tables.posted.extend(PostedLine::from_voucher(&commit.voucher));
        tables.vouchers.insert(voucher_id, commit.voucher);

        Ok(touched)
    }
}
