//! Read-side queries. Every report works on a chart snapshot and checks the
//! caller's budget, so a cancelled or timed-out query stops early.

use chrono::NaiveDate;
use tracing::{debug, instrument};

use forgeledger_accounting::{
    AccountLedger, BalanceSheet, IncomeStatement, LedgerBalance, TrialBalance, account_ledger,
    balance_sheet, income_statement, trial_balance,
};
use forgeledger_auth::Actor;
use forgeledger_core::{AccountId, FiscalPeriod, LedgerResult, QueryBudget};

use super::LedgerEngine;
use crate::store::PostedLineFilter;

impl LedgerEngine {
    #[instrument(skip_all, fields(tenant_id = %actor.tenant_id, period = %period))]
    pub fn trial_balance(
        &self,
        actor: &Actor,
        period: FiscalPeriod,
        include_zero: bool,
        budget: &QueryBudget,
    ) -> LedgerResult<TrialBalance> {
        let chart = self.directory.snapshot(actor.tenant_id)?;
        budget.checkpoint()?;
        let balances = self.store.balances_as_of(actor.tenant_id, period)?;
        let report = trial_balance(&chart, period, &balances, include_zero, budget)?;
        debug!(rows = report.rows.len(), balanced = report.is_balanced, "trial balance built");
        Ok(report)
    }

    /// Entries of one account in `[from, to]` with a running balance; earlier
    /// postings form the opening balance.
    #[instrument(skip_all, fields(tenant_id = %actor.tenant_id, account_id = %account_id))]
    pub fn account_ledger(
        &self,
        actor: &Actor,
        account_id: AccountId,
        from: NaiveDate,
        to: NaiveDate,
        budget: &QueryBudget,
    ) -> LedgerResult<AccountLedger> {
        self.directory.ensure_not_foreign(actor.tenant_id, account_id)?;
        let account = self.directory.get(actor.tenant_id, account_id)?;
        budget.checkpoint()?;
        let lines = self.store.posted_lines(
            actor.tenant_id,
            &PostedLineFilter {
                account_id: Some(account_id),
                from: None,
                to: Some(to),
            },
        )?;
        account_ledger(&account, &lines, from, to, budget)
    }

    #[instrument(skip_all, fields(tenant_id = %actor.tenant_id, from = %from, to = %to))]
    pub fn income_statement(
        &self,
        actor: &Actor,
        from: NaiveDate,
        to: NaiveDate,
        budget: &QueryBudget,
    ) -> LedgerResult<IncomeStatement> {
        let chart = self.directory.snapshot(actor.tenant_id)?;
        budget.checkpoint()?;
        let lines = self.store.posted_lines(
            actor.tenant_id,
            &PostedLineFilter {
                account_id: None,
                from: Some(from),
                to: Some(to),
            },
        )?;
        income_statement(&chart, &lines, from, to, budget)
    }

    #[instrument(skip_all, fields(tenant_id = %actor.tenant_id, period = %period))]
    pub fn balance_sheet(
        &self,
        actor: &Actor,
        period: FiscalPeriod,
        budget: &QueryBudget,
    ) -> LedgerResult<BalanceSheet> {
        let chart = self.directory.snapshot(actor.tenant_id)?;
        budget.checkpoint()?;
        let balances = self.store.balances_as_of(actor.tenant_id, period)?;
        balance_sheet(&chart, period, &balances, budget)
    }

    /// The stored balance row for exactly `period`.
    pub fn get_balance(
        &self,
        actor: &Actor,
        account_id: AccountId,
        period: FiscalPeriod,
    ) -> LedgerResult<LedgerBalance> {
        self.directory.ensure_not_foreign(actor.tenant_id, account_id)?;
        self.store.get_balance(actor.tenant_id, account_id, period)
    }

    /// Balance as of `period`, carried forward when the account had no
    /// activity in it.
    pub fn balance_as_of(
        &self,
        actor: &Actor,
        account_id: AccountId,
        period: FiscalPeriod,
    ) -> LedgerResult<Option<LedgerBalance>> {
        self.directory.ensure_not_foreign(actor.tenant_id, account_id)?;
        self.store.balance_as_of(actor.tenant_id, account_id, period)
    }
}
