//! Read-only reporting queries.
//!
//! Every query here is a pure function over a chart snapshot plus posted data
//! handed in by the caller. They hold no locks and call
//! [`QueryBudget::checkpoint`] while scanning so callers can cancel them or
//! bound them with a deadline.

use std::collections::HashMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use forgeledger_core::{
    AccountId, FiscalPeriod, LedgerResult, QueryBudget, TenantId, ValidationError,
};

use crate::account::{Account, AccountNature, AccountType};
use crate::balance::LedgerBalance;
use crate::chart::ChartOfAccounts;
use crate::voucher::{Voucher, VoucherId, VoucherNumber};

/// One entry line of a posted voucher, denormalized with its header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostedLine {
    pub voucher_id: VoucherId,
    pub voucher_number: VoucherNumber,
    pub date: NaiveDate,
    pub line_no: u32,
    pub account_id: AccountId,
    pub debit: i64,
    pub credit: i64,
    pub description: Option<String>,
}

impl PostedLine {
    pub fn from_voucher(voucher: &Voucher) -> Vec<PostedLine> {
        voucher
            .entries()
            .iter()
            .map(|e| PostedLine {
                voucher_id: voucher.id_typed(),
                voucher_number: voucher.number(),
                date: voucher.date(),
                line_no: e.line_no,
                account_id: e.account_id,
                debit: e.debit,
                credit: e.credit,
                description: e
                    .description
                    .clone()
                    .or_else(|| voucher.description().map(str::to_string)),
            })
            .collect()
    }

    /// Ordering key of the account ledger.
    pub fn sort_key(&self) -> (NaiveDate, VoucherNumber, u32) {
        (self.date, self.voucher_number, self.line_no)
    }
}

fn add(a: i64, b: i64) -> LedgerResult<i64> {
    a.checked_add(b)
        .ok_or_else(|| ValidationError::AmountOverflow.into())
}

fn signed(nature: AccountNature, debit: i64, credit: i64) -> LedgerResult<i64> {
    nature
        .signed(debit, credit)
        .ok_or_else(|| ValidationError::AmountOverflow.into())
}

fn ensure_range(from: NaiveDate, to: NaiveDate) -> LedgerResult<()> {
    if from > to {
        return Err(ValidationError::InvalidRange(format!("{from} is after {to}")).into());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Trial balance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrialBalanceRow {
    pub account_id: AccountId,
    pub code: String,
    pub name: String,
    pub account_type: AccountType,
    pub nature: AccountNature,
    pub closing_debit: i64,
    pub closing_credit: i64,
    /// Net closing position on the debit side (zero when the net is a credit).
    pub debit: i64,
    /// Net closing position on the credit side (zero when the net is a debit).
    pub credit: i64,
    pub balance: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrialBalance {
    pub tenant_id: TenantId,
    pub period: FiscalPeriod,
    pub rows: Vec<TrialBalanceRow>,
    pub total_debit: i64,
    pub total_credit: i64,
    pub is_balanced: bool,
}

/// Closing debit/credit per active account for `period`, ordered by code.
///
/// `balances` holds the as-of rows for the period (carried forward from the
/// latest earlier period where the account had no activity). With
/// `include_zero = false`, accounts that have no such row are omitted.
pub fn trial_balance(
    chart: &ChartOfAccounts,
    period: FiscalPeriod,
    balances: &[LedgerBalance],
    include_zero: bool,
    budget: &QueryBudget,
) -> LedgerResult<TrialBalance> {
    let by_account: HashMap<AccountId, &LedgerBalance> =
        balances.iter().map(|b| (b.account_id, b)).collect();

    let mut rows = Vec::new();
    let mut total_debit = 0i64;
    let mut total_credit = 0i64;

    for account in chart.accounts().filter(|a| a.active) {
        budget.checkpoint()?;

        let row = by_account.get(&account.id);
        if row.is_none() && !include_zero {
            continue;
        }
        let (closing_debit, closing_credit) = row
            .map(|b| (b.closing_debit, b.closing_credit))
            .unwrap_or((0, 0));

        let net = signed(AccountNature::Debit, closing_debit, closing_credit)?;
        let (debit, credit) = if net >= 0 {
            (net, 0)
        } else {
            (0, net.checked_neg().ok_or(ValidationError::AmountOverflow)?)
        };
        total_debit = add(total_debit, debit)?;
        total_credit = add(total_credit, credit)?;

        rows.push(TrialBalanceRow {
            account_id: account.id,
            code: account.code.clone(),
            name: account.name.clone(),
            account_type: account.account_type,
            nature: account.nature,
            closing_debit,
            closing_credit,
            debit,
            credit,
            balance: signed(account.nature, closing_debit, closing_credit)?,
        });
    }

    Ok(TrialBalance {
        tenant_id: chart.tenant_id(),
        period,
        rows,
        total_debit,
        total_credit,
        is_balanced: total_debit == total_credit,
    })
}

// ---------------------------------------------------------------------------
// Account ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountLedgerLine {
    pub date: NaiveDate,
    pub voucher_id: VoucherId,
    pub voucher_number: String,
    pub line_no: u32,
    pub description: Option<String>,
    pub debit: i64,
    pub credit: i64,
    pub running_balance: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountLedger {
    pub account_id: AccountId,
    pub code: String,
    pub name: String,
    pub nature: AccountNature,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub opening_balance: i64,
    pub total_debit: i64,
    pub total_credit: i64,
    pub closing_balance: i64,
    pub lines: Vec<AccountLedgerLine>,
}

/// Posted lines of `account` dated within `[from, to]`, with a running balance.
///
/// Lines of other accounts or dated after `to` are ignored, so callers may pass
/// a superset. Lines dated before `from` form the opening balance.
pub fn account_ledger(
    account: &Account,
    lines: &[PostedLine],
    from: NaiveDate,
    to: NaiveDate,
    budget: &QueryBudget,
) -> LedgerResult<AccountLedger> {
    ensure_range(from, to)?;

    let mut opening_debit = 0i64;
    let mut opening_credit = 0i64;
    let mut in_range: Vec<&PostedLine> = Vec::new();

    for line in lines.iter().filter(|l| l.account_id == account.id) {
        budget.checkpoint()?;
        if line.date < from {
            opening_debit = add(opening_debit, line.debit)?;
            opening_credit = add(opening_credit, line.credit)?;
        } else if line.date <= to {
            in_range.push(line);
        }
    }

    in_range.sort_by_key(|l| l.sort_key());

    let opening_balance = signed(account.nature, opening_debit, opening_credit)?;
    let mut running = opening_balance;
    let mut total_debit = 0i64;
    let mut total_credit = 0i64;
    let mut out = Vec::with_capacity(in_range.len());

    for line in in_range {
        budget.checkpoint()?;
        running = add(running, signed(account.nature, line.debit, line.credit)?)?;
        total_debit = add(total_debit, line.debit)?;
        total_credit = add(total_credit, line.credit)?;
        out.push(AccountLedgerLine {
            date: line.date,
            voucher_id: line.voucher_id,
            voucher_number: line.voucher_number.to_string(),
            line_no: line.line_no,
            description: line.description.clone(),
            debit: line.debit,
            credit: line.credit,
            running_balance: running,
        });
    }

    Ok(AccountLedger {
        account_id: account.id,
        code: account.code.clone(),
        name: account.name.clone(),
        nature: account.nature,
        from,
        to,
        opening_balance,
        total_debit,
        total_credit,
        closing_balance: running,
        lines: out,
    })
}

// ---------------------------------------------------------------------------
// Income statement / balance sheet
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatementLine {
    pub account_id: AccountId,
    pub code: String,
    pub name: String,
    pub nature: AccountNature,
    /// Signed by the account's nature.
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IncomeStatement {
    pub tenant_id: TenantId,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub revenue: Vec<StatementLine>,
    pub expenses: Vec<StatementLine>,
    pub total_revenue: i64,
    pub total_expense: i64,
    pub net_income: i64,
}

/// Revenue and expense amounts over posted lines dated within `[from, to]`.
///
/// Accounts whose amount nets to zero are omitted. Totals are taken on the
/// natural side of each section (credit for revenue, debit for expense), so
/// contra accounts reduce their section.
pub fn income_statement(
    chart: &ChartOfAccounts,
    lines: &[PostedLine],
    from: NaiveDate,
    to: NaiveDate,
    budget: &QueryBudget,
) -> LedgerResult<IncomeStatement> {
    ensure_range(from, to)?;

    let mut sums: HashMap<AccountId, (i64, i64)> = HashMap::new();
    for line in lines.iter().filter(|l| l.date >= from && l.date <= to) {
        budget.checkpoint()?;
        let slot = sums.entry(line.account_id).or_insert((0, 0));
        slot.0 = add(slot.0, line.debit)?;
        slot.1 = add(slot.1, line.credit)?;
    }

    let mut revenue = Vec::new();
    let mut expenses = Vec::new();
    let mut total_revenue = 0i64;
    let mut total_expense = 0i64;

    for account in chart.accounts() {
        budget.checkpoint()?;
        let section = match account.account_type {
            AccountType::Revenue => &mut revenue,
            AccountType::Expense => &mut expenses,
            _ => continue,
        };
        let (debit, credit) = sums.get(&account.id).copied().unwrap_or((0, 0));
        let amount = signed(account.nature, debit, credit)?;
        if amount == 0 {
            continue;
        }
        match account.account_type {
            AccountType::Revenue => {
                total_revenue = add(total_revenue, signed(AccountNature::Credit, debit, credit)?)?
            }
            _ => total_expense = add(total_expense, signed(AccountNature::Debit, debit, credit)?)?,
        }
        section.push(StatementLine {
            account_id: account.id,
            code: account.code.clone(),
            name: account.name.clone(),
            nature: account.nature,
            amount,
        });
    }

    let net_income = total_revenue
        .checked_sub(total_expense)
        .ok_or(ValidationError::AmountOverflow)?;

    Ok(IncomeStatement {
        tenant_id: chart.tenant_id(),
        from,
        to,
        revenue,
        expenses,
        total_revenue,
        total_expense,
        net_income,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceSheet {
    pub tenant_id: TenantId,
    pub period: FiscalPeriod,
    pub assets: Vec<StatementLine>,
    pub liabilities: Vec<StatementLine>,
    pub equity: Vec<StatementLine>,
    pub total_assets: i64,
    pub total_liabilities: i64,
    pub total_equity: i64,
    /// Cumulative revenue minus expense not yet closed into equity.
    /// `total_assets == total_liabilities + total_equity + unclosed_earnings`.
    pub unclosed_earnings: i64,
}

/// Closing balances of balance-sheet accounts as of `period`; zero balances omitted.
pub fn balance_sheet(
    chart: &ChartOfAccounts,
    period: FiscalPeriod,
    balances: &[LedgerBalance],
    budget: &QueryBudget,
) -> LedgerResult<BalanceSheet> {
    let by_account: HashMap<AccountId, &LedgerBalance> =
        balances.iter().map(|b| (b.account_id, b)).collect();

    let mut sheet = BalanceSheet {
        tenant_id: chart.tenant_id(),
        period,
        assets: Vec::new(),
        liabilities: Vec::new(),
        equity: Vec::new(),
        total_assets: 0,
        total_liabilities: 0,
        total_equity: 0,
        unclosed_earnings: 0,
    };

    for account in chart.accounts() {
        budget.checkpoint()?;
        let Some(row) = by_account.get(&account.id) else {
            continue;
        };
        let (debit, credit) = (row.closing_debit, row.closing_credit);

        if !account.account_type.is_balance_sheet() {
            sheet.unclosed_earnings = add(
                sheet.unclosed_earnings,
                signed(AccountNature::Credit, debit, credit)?,
            )?;
            continue;
        }

        let amount = signed(account.nature, debit, credit)?;
        if amount == 0 {
            continue;
        }
        let line = StatementLine {
            account_id: account.id,
            code: account.code.clone(),
            name: account.name.clone(),
            nature: account.nature,
            amount,
        };
        match account.account_type {
            AccountType::Asset => {
                sheet.total_assets =
                    add(sheet.total_assets, signed(AccountNature::Debit, debit, credit)?)?;
                sheet.assets.push(line);
            }
            AccountType::Liability => {
                sheet.total_liabilities =
                    add(sheet.total_liabilities, signed(AccountNature::Credit, debit, credit)?)?;
                sheet.liabilities.push(line);
            }
            _ => {
                sheet.total_equity =
                    add(sheet.total_equity, signed(AccountNature::Credit, debit, credit)?)?;
                sheet.equity.push(line);
            }
        }
    }

    Ok(sheet)
}
