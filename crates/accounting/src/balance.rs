//! Per-(tenant, account, period) balance rows.
//!
//! A row keeps three pairs of running totals:
//!
//! - `opening_*`: the previous period's closing totals (zero for the first period)
//! - `period_*`: posted activity inside the period
//! - `closing_*`: `opening + period`
//!
//! `balance` is the closing net, signed by the account nature.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use forgeledger_core::{AccountId, FiscalPeriod, LedgerResult, TenantId, ValidationError};

use crate::account::AccountNature;
use crate::voucher::VoucherEntry;

/// Net debit/credit movement one voucher causes on one account.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceDelta {
    pub account_id: AccountId,
    pub debit: i64,
    pub credit: i64,
}

/// Group entry lines per account, ordered by account id.
pub fn compute_deltas(entries: &[VoucherEntry]) -> LedgerResult<Vec<BalanceDelta>> {
    let mut grouped: BTreeMap<AccountId, (i64, i64)> = BTreeMap::new();
    for entry in entries {
        let slot = grouped.entry(entry.account_id).or_insert((0, 0));
        slot.0 = checked_add(slot.0, entry.debit)?;
        slot.1 = checked_add(slot.1, entry.credit)?;
    }
    Ok(grouped
        .into_iter()
        .map(|(account_id, (debit, credit))| BalanceDelta {
            account_id,
            debit,
            credit,
        })
        .collect())
}

fn checked_add(a: i64, b: i64) -> LedgerResult<i64> {
    a.checked_add(b)
        .ok_or_else(|| ValidationError::AmountOverflow.into())
}

/// Unique key of a balance row.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BalanceKey {
    pub tenant_id: TenantId,
    pub account_id: AccountId,
    pub period: FiscalPeriod,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerBalance {
    pub tenant_id: TenantId,
    pub account_id: AccountId,
    pub period: FiscalPeriod,
    pub nature: AccountNature,
    pub opening_debit: i64,
    pub opening_credit: i64,
    pub period_debit: i64,
    pub period_credit: i64,
    pub closing_debit: i64,
    pub closing_credit: i64,
    pub balance: i64,
}

impl LedgerBalance {
    /// New row for `period`, opening from `previous`'s closing totals when present.
    pub fn open(
        tenant_id: TenantId,
        account_id: AccountId,
        nature: AccountNature,
        period: FiscalPeriod,
        previous: Option<&LedgerBalance>,
    ) -> LedgerResult<Self> {
        let (opening_debit, opening_credit) = previous
            .map(|p| (p.closing_debit, p.closing_credit))
            .unwrap_or((0, 0));
        let mut row = Self {
            tenant_id,
            account_id,
            period,
            nature,
            opening_debit,
            opening_credit,
            period_debit: 0,
            period_credit: 0,
            closing_debit: 0,
            closing_credit: 0,
            balance: 0,
        };
        row.recompute()?;
        Ok(row)
    }

    pub fn key(&self) -> BalanceKey {
        BalanceKey {
            tenant_id: self.tenant_id,
            account_id: self.account_id,
            period: self.period,
        }
    }

    /// Add posted activity; closing totals and balance follow.
    pub fn apply_delta(&mut self, debit: i64, credit: i64) -> LedgerResult<()> {
        if debit < 0 || credit < 0 {
            return Err(ValidationError::Other("balance deltas must not be negative".into()).into());
        }
        let mut next = self.clone();
        next.period_debit = checked_add(next.period_debit, debit)?;
        next.period_credit = checked_add(next.period_credit, credit)?;
        next.recompute()?;
        *self = next;
        Ok(())
    }

    /// Re-base this row on an earlier period's (possibly changed) closing totals.
    pub fn carry_from(&mut self, previous: &LedgerBalance) -> LedgerResult<()> {
        let mut next = self.clone();
        next.opening_debit = previous.closing_debit;
        next.opening_credit = previous.closing_credit;
        next.recompute()?;
        *self = next;
        Ok(())
    }

    /// View of this row as seen from a later `period` with no activity of its own.
    pub fn carried_forward(&self, period: FiscalPeriod) -> Self {
        Self {
            tenant_id: self.tenant_id,
            account_id: self.account_id,
            period,
            nature: self.nature,
            opening_debit: self.closing_debit,
            opening_credit: self.closing_credit,
            period_debit: 0,
            period_credit: 0,
            closing_debit: self.closing_debit,
            closing_credit: self.closing_credit,
            balance: self.balance,
        }
    }

    pub fn has_activity(&self) -> bool {
        self.period_debit != 0 || self.period_credit != 0
    }

    /// Net balance signed by nature, for an arbitrary totals pair.
    pub fn signed(&self, debit: i64, credit: i64) -> LedgerResult<i64> {
        self.nature
            .signed(debit, credit)
            .ok_or_else(|| ValidationError::AmountOverflow.into())
    }

    fn recompute(&mut self) -> LedgerResult<()> {
        self.closing_debit = checked_add(self.opening_debit, self.period_debit)?;
        self.closing_credit = checked_add(self.opening_credit, self.period_credit)?;
        self.balance = self.signed(self.closing_debit, self.closing_credit)?;
        Ok(())
    }
}
