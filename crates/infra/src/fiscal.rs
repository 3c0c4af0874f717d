//! Fiscal period open/closed collaborator.

use std::collections::BTreeSet;
use std::sync::RwLock;

use forgeledger_core::{FiscalPeriod, LedgerError, LedgerResult, TenantId};

use crate::error::poisoned;

/// Answers whether a tenant's fiscal period accepts postings.
///
/// Consulted by the posting transaction after its locks are held.
pub trait FiscalPeriods: Send + Sync {
    fn is_period_open(&self, tenant_id: TenantId, year: i32, month: u32) -> bool;

    /// True when the posting store itself keeps the period flags and reads
    /// them inside the posting transaction; the store then skips this call.
    fn read_by_posting_store(&self) -> bool {
        false
    }

    fn close_period(&self, _tenant_id: TenantId, _period: FiscalPeriod) -> LedgerResult<()> {
        Err(LedgerError::storage("fiscal calendar is read-only"))
    }

    fn reopen_period(&self, _tenant_id: TenantId, _period: FiscalPeriod) -> LedgerResult<()> {
        Err(LedgerError::storage("fiscal calendar is read-only"))
    }
}

impl<F: FiscalPeriods + ?Sized> FiscalPeriods for std::sync::Arc<F> {
    fn is_period_open(&self, tenant_id: TenantId, year: i32, month: u32) -> bool {
        (**self).is_period_open(tenant_id, year, month)
    }

    fn read_by_posting_store(&self) -> bool {
        (**self).read_by_posting_store()
    }

    fn close_period(&self, tenant_id: TenantId, period: FiscalPeriod) -> LedgerResult<()> {
        (**self).close_period(tenant_id, period)
    }

    fn reopen_period(&self, tenant_id: TenantId, period: FiscalPeriod) -> LedgerResult<()> {
        (**self).reopen_period(tenant_id, period)
    }
}

/// Periods are open unless explicitly closed.
#[derive(Debug, Default)]
pub struct InMemoryFiscalCalendar {
    closed: RwLock<BTreeSet<(TenantId, FiscalPeriod)>>,
}

impl InMemoryFiscalCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close(&self, tenant_id: TenantId, period: FiscalPeriod) -> LedgerResult<()> {
        self.closed
            .write()
            .map_err(|_| poisoned("fiscal calendar"))?
            .insert((tenant_id, period));
        Ok(())
    }

    pub fn reopen(&self, tenant_id: TenantId, period: FiscalPeriod) -> LedgerResult<()> {
        self.closed
            .write()
            .map_err(|_| poisoned("fiscal calendar"))?
            .remove(&(tenant_id, period));
        Ok(())
    }

    pub fn closed_periods(&self, tenant_id: TenantId) -> LedgerResult<Vec<FiscalPeriod>> {
        Ok(self
            .closed
            .read()
            .map_err(|_| poisoned("fiscal calendar"))?
            .iter()
            .filter(|(t, _)| *t == tenant_id)
            .map(|(_, p)| *p)
            .collect())
    }
}

impl FiscalPeriods for InMemoryFiscalCalendar {
    fn is_period_open(&self, tenant_id: TenantId, year: i32, month: u32) -> bool {
        let Ok(period) = FiscalPeriod::new(year, month) else {
            return false;
        };
        // A poisoned calendar refuses postings.
        self.closed
            .read()
            .map(|closed| !closed.contains(&(tenant_id, period)))
            .unwrap_or(false)
    }

    fn close_period(&self, tenant_id: TenantId, period: FiscalPeriod) -> LedgerResult<()> {
        self.close(tenant_id, period)
    }

    fn reopen_period(&self, tenant_id: TenantId, period: FiscalPeriod) -> LedgerResult<()> {
        self.reopen(tenant_id, period)
    }
}
