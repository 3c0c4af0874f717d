//! Accounting domain: chart of accounts, vouchers and their posting workflow,
//! ledger balance arithmetic and reporting queries.
//!
//! Pure domain logic only: no IO, no HTTP, no persistence concerns.

pub mod account;
pub mod balance;
pub mod chart;
pub mod report;
pub mod voucher;

pub use account::{Account, AccountNature, AccountType, NewAccount};
pub use balance::{BalanceDelta, BalanceKey, LedgerBalance, compute_deltas};
pub use chart::{AccountTreeNode, ChartOfAccounts, FlatAccount};
pub use report::{
    AccountLedger, AccountLedgerLine, BalanceSheet, IncomeStatement, PostedLine, StatementLine,
    TrialBalance, TrialBalanceRow, account_ledger, balance_sheet, income_statement, trial_balance,
};
pub use voucher::{
    CreateVoucher, EntryInput, EntryTotals, RejectVoucher, Transition, UpdateDraft,
    VOUCHER_AGGREGATE_TYPE, Voucher, VoucherCommand, VoucherCreated, VoucherEntry, VoucherEvent,
    VoucherId, VoucherNumber, VoucherPosted, VoucherRejected, VoucherStatus, VoucherTransitioned,
    VoucherType, VoucherUpdated, validate_entries,
};
