//! Tenant-partitioned account directory.
//!
//! Each tenant owns one [`ChartOfAccounts`] behind its own `RwLock`: writes
//! serialize per tenant, reads run concurrently, and tenants never contend.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use forgeledger_accounting::{Account, ChartOfAccounts, NewAccount};
use forgeledger_core::{AccountId, LedgerError, LedgerResult, PolicyError, TenantId};

use crate::error::poisoned;

#[derive(Debug, Default)]
pub struct InMemoryAccountDirectory {
    charts: RwLock<HashMap<TenantId, Arc<RwLock<ChartOfAccounts>>>>,
    /// Global account-id ownership, used to tell foreign ids from unknown ones.
    owners: RwLock<HashMap<AccountId, TenantId>>,
}

impl InMemoryAccountDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn existing_chart(&self, tenant_id: TenantId) -> LedgerResult<Option<Arc<RwLock<ChartOfAccounts>>>> {
        Ok(self
            .charts
            .read()
            .map_err(|_| poisoned("directory"))?
            .get(&tenant_id)
            .cloned())
    }

    /// The tenant's chart, registered on first write.
    fn chart_for_write(&self, tenant_id: TenantId) -> LedgerResult<Arc<RwLock<ChartOfAccounts>>> {
        if let Some(chart) = self.existing_chart(tenant_id)? {
            return Ok(chart);
        }
        let mut charts = self.charts.write().map_err(|_| poisoned("directory"))?;
        Ok(charts
            .entry(tenant_id)
            .or_insert_with(|| Arc::new(RwLock::new(ChartOfAccounts::new(tenant_id))))
            .clone())
    }

    /// Replace the charts of every tenant present in `accounts`; returns the number loaded.
    pub fn restore(&self, accounts: Vec<Account>) -> LedgerResult<usize> {
        let mut by_tenant: HashMap<TenantId, Vec<Account>> = HashMap::new();
        for account in accounts {
            by_tenant.entry(account.tenant_id).or_default().push(account);
        }

        let mut loaded = 0;
        let mut charts = self.charts.write().map_err(|_| poisoned("directory"))?;
        let mut owners = self.owners.write().map_err(|_| poisoned("directory owners"))?;
        for (tenant_id, accounts) in by_tenant {
            let chart = ChartOfAccounts::restore(tenant_id, accounts)?;
            for account in chart.accounts() {
                owners.insert(account.id, tenant_id);
            }
            loaded += chart.len();
            charts.insert(tenant_id, Arc::new(RwLock::new(chart)));
        }
        Ok(loaded)
    }

    /// Tenant that owns `account_id`, if any.
    pub fn owner_of(&self, account_id: AccountId) -> LedgerResult<Option<TenantId>> {
        Ok(self
            .owners
            .read()
            .map_err(|_| poisoned("directory owners"))?
            .get(&account_id)
            .copied())
    }

    /// Fail with `CrossTenant` when `account_id` belongs to a different tenant.
    pub fn ensure_not_foreign(&self, tenant_id: TenantId, account_id: AccountId) -> LedgerResult<()> {
        match self.owner_of(account_id)? {
            Some(owner) if owner != tenant_id => Err(PolicyError::CrossTenant.into()),
            _ => Ok(()),
        }
    }

    /// Run `f` under the tenant's read lock. A tenant without accounts sees an
    /// empty chart and is not registered.
    pub fn with_chart<T>(
        &self,
        tenant_id: TenantId,
        f: impl FnOnce(&ChartOfAccounts) -> LedgerResult<T>,
    ) -> LedgerResult<T> {
        match self.existing_chart(tenant_id)? {
            Some(chart) => {
                let guard = chart.read().map_err(|_| poisoned("chart"))?;
                f(&guard)
            }
            None => f(&ChartOfAccounts::new(tenant_id)),
        }
    }

    /// Run `f` on a copy of the tenant's chart under its write lock. The copy
    /// replaces the chart only when `f` succeeds, so a failed write-through
    /// inside `f` leaves the directory unchanged.
    pub fn with_chart_mut<T>(
        &self,
        tenant_id: TenantId,
        f: impl FnOnce(&mut ChartOfAccounts) -> LedgerResult<T>,
    ) -> LedgerResult<T> {
        let chart = self.chart_for_write(tenant_id)?;
        let mut guard = chart.write().map_err(|_| poisoned("chart"))?;
        let mut staged = guard.clone();
        let out = f(&mut staged)?;
        *guard = staged;
        Ok(out)
    }

    /// Point-in-time copy of a tenant's chart, for lock-free reporting.
    pub fn snapshot(&self, tenant_id: TenantId) -> LedgerResult<ChartOfAccounts> {
        self.with_chart(tenant_id, |chart| Ok(chart.clone()))
    }

    pub fn get(&self, tenant_id: TenantId, account_id: AccountId) -> LedgerResult<Account> {
        self.with_chart(tenant_id, |chart| {
            chart
                .get(account_id)
                .cloned()
                .ok_or_else(|| LedgerError::not_found(format!("account {account_id}")))
        })
    }

    /// Create an account; `persist` sees the new account before the chart
    /// changes and its failure discards the creation.
    pub fn create(
        &self,
        tenant_id: TenantId,
        input: NewAccount,
        now: DateTime<Utc>,
        persist: impl FnOnce(&Account) -> LedgerResult<()>,
    ) -> LedgerResult<Account> {
        if let Some(parent_id) = input.parent_id {
            self.ensure_not_foreign(tenant_id, parent_id)?;
        }
        self.with_chart_mut(tenant_id, |chart| {
            let account = chart.create(input, now)?;
            persist(&account)?;
            self.owners
                .write()
                .map_err(|_| poisoned("directory owners"))?
                .insert(account.id, tenant_id);
            Ok(account)
        })
    }

    pub fn move_account(
        &self,
        tenant_id: TenantId,
        account_id: AccountId,
        new_parent: Option<AccountId>,
        persist: impl FnOnce(&Account) -> LedgerResult<()>,
    ) -> LedgerResult<Account> {
        if let Some(parent_id) = new_parent {
            self.ensure_not_foreign(tenant_id, parent_id)?;
        }
        self.with_chart_mut(tenant_id, |chart| {
            let account = chart.move_account(account_id, new_parent)?;
            persist(&account)?;
            Ok(account)
        })
    }

    /// Remove an account; `referenced` is evaluated under the tenant's write
    /// lock and `persist` must succeed before the account leaves the chart.
    pub fn remove(
        &self,
        tenant_id: TenantId,
        account_id: AccountId,
        referenced: impl FnOnce() -> LedgerResult<bool>,
        persist: impl FnOnce(&Account) -> LedgerResult<()>,
    ) -> LedgerResult<Account> {
        self.with_chart_mut(tenant_id, |chart| {
            let removed = chart.remove(account_id, referenced()?)?;
            persist(&removed)?;
            self.owners
                .write()
                .map_err(|_| poisoned("directory owners"))?
                .remove(&account_id);
            Ok(removed)
        })
    }
}
