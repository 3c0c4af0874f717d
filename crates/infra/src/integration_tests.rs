//! Integration tests for the full posting pipeline.
//!
//! Tests: Engine → Directory / Aggregate → PostingStore → Reports
//!
//! Verifies:
//! - Approved vouchers post once and move balances by their totals
//! - Refusals (unbalanced, closed period, missing role) leave the ledger untouched
//! - Tenant isolation is preserved
//! - Concurrent postings serialize and lock waits are bounded

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    use chrono::{Datelike, NaiveDate};

    use forgeledger_accounting::{
        Account, AccountType, EntryInput, NewAccount, Voucher, VoucherId, VoucherNumber,
        VoucherStatus,
    };
    use forgeledger_auth::{Actor, ClaimedRoles, InMemoryRoleGrants, Role};
    use forgeledger_core::{
        ConcurrencyError, FiscalPeriod, LedgerError, PolicyError, QueryBudget, StateError,
        TenantId, UserId, ValidationError,
    };

    use crate::engine::{EngineSettings, LedgerEngine, NewVoucher};
    use crate::fiscal::{FiscalPeriods, InMemoryFiscalCalendar};
    use crate::store::{AccountStore, InMemoryLedgerStore, VoucherFilter};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn period(y: i32, m: u32) -> FiscalPeriod {
        FiscalPeriod::new(y, m).unwrap()
    }

    fn admin(tenant_id: TenantId) -> Actor {
        Actor::new(UserId::new(), tenant_id, vec![Role::admin()])
    }

    struct Books {
        engine: LedgerEngine,
        actor: Actor,
        cash: Account,
        sales: Account,
    }

    impl Books {
        fn new() -> Self {
            Self::with_engine(LedgerEngine::in_memory(EngineSettings::default()))
        }

        fn with_engine(engine: LedgerEngine) -> Self {
            let actor = admin(TenantId::new());
            let cash = engine
                .create_account(&actor, NewAccount::new("101", "Cash", AccountType::Asset))
                .unwrap();
            let sales = engine
                .create_account(&actor, NewAccount::new("401", "Sales", AccountType::Revenue))
                .unwrap();
            Self {
                engine,
                actor,
                cash,
                sales,
            }
        }

        fn cash_sale(&self, on: NaiveDate, amount: i64) -> Voucher {
            self.engine
                .create_voucher(
                    &self.actor,
                    NewVoucher {
                        date: on,
                        voucher_type: Default::default(),
                        description: Some("cash sale".into()),
                        entries: vec![
                            EntryInput::debit(self.cash.id, amount),
                            EntryInput::credit(self.sales.id, amount),
                        ],
                    },
                )
                .unwrap()
        }

        fn approved_sale(&self, on: NaiveDate, amount: i64) -> VoucherId {
            let id = self.cash_sale(on, amount).id_typed();
            self.engine.submit_voucher(&self.actor, id).unwrap();
            self.engine.approve_voucher(&self.actor, id).unwrap();
            id
        }

        fn posted_sale(&self, on: NaiveDate, amount: i64) -> VoucherId {
            let id = self.approved_sale(on, amount);
            self.engine.post_voucher(&self.actor, id).unwrap();
            id
        }
    }

    #[test]
    fn posting_a_cash_sale_moves_both_balances() {
        let books = Books::new();
        let id = books.approved_sale(date(2024, 3, 15), 1_000);

        let outcome = books.engine.post_voucher(&books.actor, id).unwrap();
        assert_eq!(outcome.voucher.status(), VoucherStatus::Posted);
        assert_eq!(outcome.balances.len(), 2);

        let cash = books
            .engine
            .get_balance(&books.actor, books.cash.id, period(2024, 3))
            .unwrap();
        assert_eq!(cash.period_debit, 1_000);
        assert_eq!(cash.balance, 1_000);

        let sales = books
            .engine
            .get_balance(&books.actor, books.sales.id, period(2024, 3))
            .unwrap();
        assert_eq!(sales.period_credit, 1_000);
        assert_eq!(sales.balance, 1_000);

        let tb = books
            .engine
            .trial_balance(&books.actor, period(2024, 3), false, &QueryBudget::unbounded())
            .unwrap();
        assert!(tb.is_balanced);
        assert_eq!(tb.total_debit, 1_000);
        assert_eq!(tb.total_credit, 1_000);
        assert_eq!(tb.rows.iter().map(|r| r.code.as_str()).collect::<Vec<_>>(), ["101", "401"]);
    }

    #[test]
    fn unbalanced_voucher_cannot_be_submitted() {
        let books = Books::new();
        let draft = books
            .engine
            .create_voucher(
                &books.actor,
                NewVoucher {
                    date: date(2024, 3, 15),
                    voucher_type: Default::default(),
                    description: None,
                    entries: vec![
                        EntryInput::debit(books.cash.id, 1_000),
                        EntryInput::credit(books.sales.id, 900),
                    ],
                },
            )
            .unwrap();

        let err = books
            .engine
            .submit_voucher(&books.actor, draft.id_typed())
            .unwrap_err();
        assert_eq!(
            err,
            LedgerError::Validation(ValidationError::VoucherUnbalanced {
                debit_total: 1_000,
                credit_total: 900,
            })
        );

        let stored = books.engine.get_voucher(&books.actor, draft.id_typed()).unwrap();
        assert_eq!(stored.status(), VoucherStatus::Draft);
    }

    #[test]
    fn closed_period_refuses_posting_and_leaves_voucher_approved() {
        let books = Books::new();
        let id = books.approved_sale(date(2024, 3, 15), 1_000);
        books.engine.close_period(&books.actor, period(2024, 3)).unwrap();

        let err = books.engine.post_voucher(&books.actor, id).unwrap_err();
        assert_eq!(
            err,
            LedgerError::Policy(PolicyError::PeriodClosed { year: 2024, month: 3 })
        );

        let voucher = books.engine.get_voucher(&books.actor, id).unwrap();
        assert_eq!(voucher.status(), VoucherStatus::Approved);
        assert!(matches!(
            books.engine.get_balance(&books.actor, books.cash.id, period(2024, 3)),
            Err(LedgerError::NotFound(_))
        ));

        books.engine.reopen_period(&books.actor, period(2024, 3)).unwrap();
        books.engine.post_voucher(&books.actor, id).unwrap();
    }

    #[test]
    fn posting_twice_is_refused_and_applies_once() {
        let books = Books::new();
        let id = books.posted_sale(date(2024, 3, 15), 1_000);

        let err = books.engine.post_voucher(&books.actor, id).unwrap_err();
        assert_eq!(err, LedgerError::State(StateError::AlreadyPosted));

        let cash = books
            .engine
            .get_balance(&books.actor, books.cash.id, period(2024, 3))
            .unwrap();
        assert_eq!(cash.balance, 1_000);

        let history = books.engine.voucher_history(&books.actor, id).unwrap();
        assert_eq!(history.len(), 4);
    }

    #[test]
    fn account_ledger_orders_by_date_with_running_balance() {
        let books = Books::new();
        books.posted_sale(date(2024, 2, 5), 200);
        books.posted_sale(date(2024, 3, 20), 500);
        books.posted_sale(date(2024, 3, 10), 300);

        let ledger = books
            .engine
            .account_ledger(
                &books.actor,
                books.cash.id,
                date(2024, 3, 1),
                date(2024, 3, 31),
                &QueryBudget::unbounded(),
            )
            .unwrap();

        assert_eq!(ledger.opening_balance, 200);
        let running: Vec<_> = ledger
            .lines
            .iter()
            .map(|l| (l.date, l.running_balance))
            .collect();
        assert_eq!(
            running,
            vec![(date(2024, 3, 10), 500), (date(2024, 3, 20), 1_000)]
        );
        assert_eq!(ledger.closing_balance, 1_000);
    }

    #[test]
    fn later_periods_carry_the_balance_forward() {
        let books = Books::new();
        books.posted_sale(date(2024, 1, 10), 400);
        books.posted_sale(date(2024, 3, 10), 100);

        let feb = books
            .engine
            .balance_as_of(&books.actor, books.cash.id, period(2024, 2))
            .unwrap()
            .unwrap();
        assert_eq!(feb.balance, 400);
        assert_eq!(feb.period_debit, 0);

        let mar = books
            .engine
            .get_balance(&books.actor, books.cash.id, period(2024, 3))
            .unwrap();
        assert_eq!(mar.opening_debit, 400);
        assert_eq!(mar.balance, 500);
    }

    #[test]
    fn statements_reflect_posted_activity() {
        let books = Books::new();
        books.posted_sale(date(2024, 3, 15), 1_000);

        let income = books
            .engine
            .income_statement(
                &books.actor,
                date(2024, 3, 1),
                date(2024, 3, 31),
                &QueryBudget::unbounded(),
            )
            .unwrap();
        assert_eq!(income.total_revenue, 1_000);
        assert_eq!(income.net_income, 1_000);

        let sheet = books
            .engine
            .balance_sheet(&books.actor, period(2024, 3), &QueryBudget::unbounded())
            .unwrap();
        assert_eq!(sheet.total_assets, 1_000);
        assert_eq!(sheet.unclosed_earnings, 1_000);
        assert_eq!(
            sheet.total_assets,
            sheet.total_liabilities + sheet.total_equity + sheet.unclosed_earnings
        );
    }

    #[test]
    fn concurrent_postings_all_land() {
        const THREADS: usize = 8;
        let books = Arc::new(Books::new());
        let ids: Vec<_> = (0..THREADS)
            .map(|_| books.approved_sale(date(2024, 3, 15), 100))
            .collect();

        let handles: Vec<_> = ids
            .into_iter()
            .map(|id| {
                let books = Arc::clone(&books);
                thread::spawn(move || books.engine.post_voucher(&books.actor, id))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        let cash = books
            .engine
            .get_balance(&books.actor, books.cash.id, period(2024, 3))
            .unwrap();
        assert_eq!(cash.balance, 100 * THREADS as i64);

        let mut numbers: Vec<_> = books
            .engine
            .list_vouchers(&books.actor, &VoucherFilter::default())
            .unwrap()
            .iter()
            .map(|v| v.number().seq)
            .collect();
        numbers.dedup();
        assert_eq!(numbers, (1..=THREADS as u32).collect::<Vec<_>>());
    }

    /// Calendar that stalls the first check it serves, while the posting
    /// holding it keeps its balance locks.
    struct StallingCalendar {
        entered: Mutex<Option<mpsc::Sender<()>>>,
        hold: Duration,
    }

    impl FiscalPeriods for StallingCalendar {
        fn is_period_open(&self, _tenant_id: TenantId, _year: i32, _month: u32) -> bool {
            let first = self.entered.lock().unwrap().take();
            if let Some(tx) = first {
                let _ = tx.send(());
                thread::sleep(self.hold);
            }
            true
        }
    }

    #[test]
    fn contended_posting_times_out_and_is_retryable() {
        let (tx, rx) = mpsc::channel();
        let settings = EngineSettings {
            lock_timeout: Duration::from_millis(50),
            ..EngineSettings::default()
        };
        let engine = LedgerEngine::new(
            Arc::new(InMemoryLedgerStore::new()),
            Arc::new(StallingCalendar {
                entered: Mutex::new(Some(tx)),
                hold: Duration::from_millis(500),
            }),
            Arc::new(ClaimedRoles),
            settings,
        );
        let books = Arc::new(Books::with_engine(engine));
        let first = books.approved_sale(date(2024, 3, 15), 100);
        let second = books.approved_sale(date(2024, 3, 16), 100);

        let holder = {
            let books = Arc::clone(&books);
            thread::spawn(move || books.engine.post_voucher(&books.actor, first))
        };
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let err = books.engine.post_voucher(&books.actor, second).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Concurrency(ConcurrencyError::LockTimeout { .. })
        ));
        assert!(err.is_retryable());

        holder.join().unwrap().unwrap();
        books.engine.post_voucher(&books.actor, second).unwrap();
        let cash = books
            .engine
            .get_balance(&books.actor, books.cash.id, period(2024, 3))
            .unwrap();
        assert_eq!(cash.balance, 200);
    }

    #[test]
    fn tenants_cannot_see_or_use_each_other() {
        let books = Books::new();
        let id = books.posted_sale(date(2024, 3, 15), 1_000);

        let other = admin(TenantId::new());
        assert!(matches!(
            books.engine.get_voucher(&other, id),
            Err(LedgerError::NotFound(_))
        ));

        let own_cash = books
            .engine
            .create_account(&other, NewAccount::new("101", "Cash", AccountType::Asset))
            .unwrap();
        let foreign = books
            .engine
            .create_voucher(
                &other,
                NewVoucher {
                    date: date(2024, 3, 15),
                    voucher_type: Default::default(),
                    description: None,
                    entries: vec![
                        EntryInput::debit(own_cash.id, 10),
                        EntryInput::credit(books.sales.id, 10),
                    ],
                },
            )
            .unwrap();
        assert_eq!(
            books.engine.submit_voucher(&other, foreign.id_typed()).unwrap_err(),
            LedgerError::Policy(PolicyError::CrossTenant)
        );

        let tb = books
            .engine
            .trial_balance(&other, period(2024, 3), false, &QueryBudget::unbounded())
            .unwrap();
        assert!(tb.rows.is_empty());
        assert_eq!(foreign.number().seq, 1);
    }

    #[test]
    fn missing_roles_are_refused_before_any_change() {
        let books = Books::new();
        let id = books.cash_sale(date(2024, 3, 15), 100).id_typed();
        books.engine.submit_voucher(&books.actor, id).unwrap();

        let clerk = Actor::new(UserId::new(), books.actor.tenant_id, vec![Role::new("clerk")]);
        assert_eq!(
            books.engine.approve_voucher(&clerk, id).unwrap_err(),
            LedgerError::Policy(PolicyError::InsufficientRole(Role::APPROVER.into()))
        );
        assert!(matches!(
            books
                .engine
                .create_account(&clerk, NewAccount::new("102", "Bank", AccountType::Asset)),
            Err(LedgerError::Policy(PolicyError::InsufficientRole(_)))
        ));

        let approver = Actor::new(
            UserId::new(),
            books.actor.tenant_id,
            vec![Role::new(Role::APPROVER)],
        );
        books.engine.approve_voucher(&approver, id).unwrap();
        assert!(matches!(
            books.engine.post_voucher(&approver, id),
            Err(LedgerError::Policy(PolicyError::InsufficientRole(_)))
        ));
        assert_eq!(
            books.engine.get_voucher(&books.actor, id).unwrap().status(),
            VoucherStatus::Approved
        );
    }

    #[test]
    fn account_with_open_balance_cannot_be_deactivated() {
        let books = Books::new();
        books.posted_sale(date(2024, 3, 15), 100);

        assert_eq!(
            books
                .engine
                .deactivate_account(&books.actor, books.cash.id)
                .unwrap_err(),
            LedgerError::Policy(PolicyError::HasOpenBalance("101".into()))
        );
        assert!(matches!(
            books.engine.delete_account(&books.actor, books.cash.id),
            Err(LedgerError::Policy(PolicyError::AccountReferenced(_)))
        ));
    }

    #[test]
    fn rejected_voucher_returns_to_draft_on_edit() {
        let books = Books::new();
        let id = books.cash_sale(date(2024, 3, 15), 100).id_typed();
        books.engine.submit_voucher(&books.actor, id).unwrap();
        let rejected = books
            .engine
            .reject_voucher(&books.actor, id, "wrong amount")
            .unwrap();
        assert_eq!(rejected.rejection_reason(), Some("wrong amount"));

        let edited = books
            .engine
            .update_voucher(
                &books.actor,
                id,
                crate::engine::VoucherEdit {
                    entries: Some(vec![
                        EntryInput::debit(books.cash.id, 120),
                        EntryInput::credit(books.sales.id, 120),
                    ]),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(edited.status(), VoucherStatus::Draft);
        assert_eq!(edited.totals().debit, 120);
    }

    #[test]
    fn redating_into_another_year_takes_that_years_number() {
        let books = Books::new();
        let id = books.cash_sale(date(2026, 1, 5), 100).id_typed();

        let edited = books
            .engine
            .update_voucher(
                &books.actor,
                id,
                crate::engine::VoucherEdit {
                    date: Some(date(2025, 12, 31)),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(edited.number(), VoucherNumber::new(2025, 1));
        assert_eq!(edited.number().year, edited.date().year());

        let next = books.cash_sale(date(2025, 12, 30), 50);
        assert_eq!(next.number(), VoucherNumber::new(2025, 2));

        let reloaded = books.engine.get_voucher(&books.actor, id).unwrap();
        assert_eq!(reloaded.number(), VoucherNumber::new(2025, 1));

        // A refused edit does not consume a number.
        books.engine.submit_voucher(&books.actor, id).unwrap();
        let err = books
            .engine
            .update_voucher(
                &books.actor,
                id,
                crate::engine::VoucherEdit {
                    date: Some(date(2024, 6, 1)),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert_eq!(err, StateError::NotEditable("pending").into());
        let first_2024 = books.cash_sale(date(2024, 6, 2), 10);
        assert_eq!(first_2024.number(), VoucherNumber::new(2024, 1));
    }

    #[test]
    fn server_side_grants_ignore_claimed_roles() {
        let grants = Arc::new(InMemoryRoleGrants::new());
        let engine = LedgerEngine::new(
            Arc::new(InMemoryLedgerStore::new()),
            Arc::new(InMemoryFiscalCalendar::new()),
            grants.clone(),
            EngineSettings::default(),
        );
        let tenant_id = TenantId::new();
        let granted = Actor::new(UserId::new(), tenant_id, Vec::new());
        let claiming = admin(tenant_id);
        grants.grant(tenant_id, granted.user_id, Role::admin());

        let err = engine
            .create_account(&claiming, NewAccount::new("101", "Cash", AccountType::Asset))
            .unwrap_err();
        assert_eq!(err, PolicyError::InsufficientRole(Role::ADMIN.into()).into());

        engine
            .create_account(&granted, NewAccount::new("101", "Cash", AccountType::Asset))
            .unwrap();
    }

    /// Account store that fails every write while `down` is set.
    #[derive(Default)]
    struct FlakyAccounts {
        down: AtomicBool,
        saved: Mutex<Vec<Account>>,
    }

    impl FlakyAccounts {
        fn check(&self) -> forgeledger_core::LedgerResult<()> {
            if self.down.load(Ordering::SeqCst) {
                return Err(LedgerError::storage("db down"));
            }
            Ok(())
        }
    }

    impl AccountStore for FlakyAccounts {
        fn save_account(&self, account: &Account) -> forgeledger_core::LedgerResult<()> {
            self.check()?;
            let mut saved = self.saved.lock().unwrap();
            saved.retain(|a| a.id != account.id);
            saved.push(account.clone());
            Ok(())
        }

        fn delete_account(
            &self,
            _tenant_id: TenantId,
            account_id: forgeledger_core::AccountId,
        ) -> forgeledger_core::LedgerResult<()> {
            self.check()?;
            self.saved.lock().unwrap().retain(|a| a.id != account_id);
            Ok(())
        }

        fn load_accounts(&self) -> forgeledger_core::LedgerResult<Vec<Account>> {
            Ok(self.saved.lock().unwrap().clone())
        }
    }

    #[test]
    fn failed_write_through_leaves_the_directory_unchanged() {
        let accounts = Arc::new(FlakyAccounts::default());
        let engine = LedgerEngine::in_memory(EngineSettings::default())
            .with_account_store(accounts.clone())
            .unwrap();
        let actor = admin(TenantId::new());
        let cash = || NewAccount::new("101", "Cash", AccountType::Asset);

        accounts.down.store(true, Ordering::SeqCst);
        assert!(matches!(
            engine.create_account(&actor, cash()),
            Err(LedgerError::Storage(_))
        ));
        assert!(engine.accounts_flat(&actor).unwrap().is_empty());

        accounts.down.store(false, Ordering::SeqCst);
        let created = engine.create_account(&actor, cash()).unwrap();

        accounts.down.store(true, Ordering::SeqCst);
        assert!(engine.rename_account(&actor, created.id, "Petty cash").is_err());
        assert!(engine.delete_account(&actor, created.id).is_err());
        assert_eq!(engine.get_account(&actor, created.id).unwrap().name, "Cash");

        // Memory and store agree, so a restart sees the same chart.
        accounts.down.store(false, Ordering::SeqCst);
        let restarted = LedgerEngine::in_memory(EngineSettings::default())
            .with_account_store(accounts.clone())
            .unwrap();
        assert_eq!(restarted.get_account(&actor, created.id).unwrap(), created);
    }
}
