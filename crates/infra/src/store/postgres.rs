//! Postgres-backed voucher and ledger-balance store.
//!
//! The domain traits are synchronous; the async methods here do the work and the
//! trait impls drive them through the ambient tokio runtime handle. Call the
//! trait methods from `spawn_blocking` (the API layer does).
//!
//! ## Error Mapping
//!
//! | PostgreSQL code | Meaning | LedgerError |
//! |-----------------|---------|-------------|
//! | `55P03` | lock_not_available (`lock_timeout` hit) | `Concurrency(LockTimeout)` |
//! | `40P01` | deadlock detected | `Concurrency(LockTimeout)` |
//! | `23505` on voucher insert | duplicate voucher id / number | `State(AlreadyExists)` |
//! | anything else | | `Storage` |
//!
//! ## Locking
//!
//! A posting locks the voucher row (`FOR UPDATE`), then one transaction-scoped
//! advisory lock per (tenant, account) in ascending account order, all under
//! `SET LOCAL lock_timeout`. Balance arithmetic reuses the in-process staging
//! code so both backends roll periods forward identically.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{instrument, warn};
use uuid::Uuid;

use forgeledger_accounting::{
    Account, AccountNature, BalanceKey, LedgerBalance, PostedLine, VOUCHER_AGGREGATE_TYPE, Voucher,
    VoucherEvent, VoucherId, VoucherNumber, VoucherStatus,
};
use forgeledger_core::{
    AccountId, AggregateRoot, ExpectedVersion, FiscalPeriod, LedgerError, LedgerResult,
    PolicyError, StateError, TenantId,
};
use forgeledger_events::EventEnvelope;

use super::staging::stage_delta;
use super::{
    AccountStore, LedgerBalanceStore, PostedLineFilter, PostingCommit, PostingStore, VoucherFilter, VoucherStore,
};
use crate::error::StoreError;
use crate::fiscal::FiscalPeriods;

const MIGRATION: &str = include_str!("../../migrations/0001_ledger.sql");

const BALANCE_COLUMNS: &str = "tenant_id, account_id, year, month, nature, opening_debit, \
     opening_credit, period_debit, period_credit, closing_debit, closing_credit, balance";

#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: Arc<PgPool>,
}

/// Open posting transaction holding the voucher row lock and account locks.
#[derive(Debug)]
pub struct PostingTx {
    tx: Transaction<'static, Postgres>,
    tenant_id: TenantId,
    status: VoucherStatus,
    version: u64,
    accounts: Vec<AccountId>,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn connect(database_url: &str) -> LedgerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the ledger tables if they do not exist.
    pub async fn migrate(&self) -> LedgerResult<()> {
        sqlx::raw_sql(MIGRATION)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    pub async fn set_period_closed(
        &self,
        tenant_id: TenantId,
        period: FiscalPeriod,
        closed: bool,
    ) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO fiscal_periods (tenant_id, year, month, closed)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (tenant_id, year, month) DO UPDATE SET closed = EXCLUDED.closed
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(period.year())
        .bind(period.month() as i32)
        .bind(closed)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_period_closed", e))?;
        Ok(())
    }

    /// Closed flag of a period, read outside any posting transaction.
    pub async fn period_is_closed(&self, tenant_id: TenantId, period: FiscalPeriod) -> LedgerResult<bool> {
        let row = sqlx::query("SELECT closed FROM fiscal_periods WHERE tenant_id = $1 AND year = $2 AND month = $3")
            .bind(tenant_id.as_uuid())
            .bind(period.year())
            .bind(period.month() as i32)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("period_is_closed", e))?;
        match row {
            Some(row) => row.try_get("closed").map_err(|e| map_sqlx_error("period_is_closed", e)),
            None => Ok(false),
        }
    }

    pub async fn upsert_account(&self, account: &Account) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO accounts (tenant_id, account_id, code, parent_id, active, document)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (tenant_id, account_id) DO UPDATE SET
                code = EXCLUDED.code,
                parent_id = EXCLUDED.parent_id,
                active = EXCLUDED.active,
                document = EXCLUDED.document
            "#,
        )
        .bind(account.tenant_id.as_uuid())
        .bind(account.id.as_uuid())
        .bind(&account.code)
        .bind(account.parent_id.map(|p| *p.as_uuid()))
        .bind(account.active)
        .bind(to_json(account)?)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_account", e))?;
        Ok(())
    }

    pub async fn remove_account(&self, tenant_id: TenantId, account_id: AccountId) -> LedgerResult<()> {
        sqlx::query("DELETE FROM accounts WHERE tenant_id = $1 AND account_id = $2")
            .bind(tenant_id.as_uuid())
            .bind(account_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("remove_account", e))?;
        Ok(())
    }

    pub async fn all_accounts(&self) -> LedgerResult<Vec<Account>> {
        let rows = sqlx::query("SELECT document FROM accounts ORDER BY tenant_id, code")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_accounts", e))?;
        rows.iter()
            .map(|row| {
                let document: serde_json::Value = row
                    .try_get("document")
                    .map_err(|e| map_sqlx_error("load_accounts", e))?;
                from_json(document)
            })
            .collect()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    pub async fn allocate_number(&self, tenant_id: TenantId, year: i32) -> LedgerResult<VoucherNumber> {
        let row = sqlx::query(
            r#"
            INSERT INTO voucher_sequences (tenant_id, year, last_seq)
            VALUES ($1, $2, 1)
            ON CONFLICT (tenant_id, year) DO UPDATE SET last_seq = voucher_sequences.last_seq + 1
            RETURNING last_seq
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(year)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("allocate_number", e))?;
        let seq: i32 = row
            .try_get("last_seq")
            .map_err(|e| map_sqlx_error("allocate_number", e))?;
        Ok(VoucherNumber::new(year, seq as u32))
    }

    #[instrument(skip(self, voucher, events), fields(voucher_id = %voucher.id_typed()), err)]
    pub async fn insert(&self, voucher: &Voucher, events: &[VoucherEvent]) -> LedgerResult<()> {
        let tenant_id = tenant_of(voucher)?;
        let mut tx = self.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO vouchers (tenant_id, voucher_id, number_year, number_seq, voucher_date, status, version, document)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(voucher.id_typed().0.as_uuid())
        .bind(voucher.number().year)
        .bind(voucher.number().seq as i32)
        .bind(voucher.date())
        .bind(voucher.status().as_str())
        .bind(voucher.version() as i64)
        .bind(to_json(voucher)?)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StateError::AlreadyExists.into()
            } else {
                map_sqlx_error("insert_voucher", e)
            }
        })?;

        replace_entries(&mut tx, tenant_id, voucher).await?;
        let base = voucher.version().saturating_sub(events.len() as u64);
        insert_events(&mut tx, tenant_id, voucher.id_typed(), base, events).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(())
    }

    pub async fn load(&self, tenant_id: TenantId, voucher_id: VoucherId) -> LedgerResult<Voucher> {
        let row = sqlx::query("SELECT document FROM vouchers WHERE tenant_id = $1 AND voucher_id = $2")
            .bind(tenant_id.as_uuid())
            .bind(voucher_id.0.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_voucher", e))?
            .ok_or_else(|| LedgerError::not_found(format!("voucher {voucher_id}")))?;
        voucher_from_row(&row)
    }

    #[instrument(skip(self, voucher, events), fields(voucher_id = %voucher.id_typed()), err)]
    pub async fn save(
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
        let mut tx = self.begin().await?;

        let (status, version) = lock_voucher(&mut tx, tenant_id, voucher_id).await?;
        if status == VoucherStatus::Posted {
            return Err(StateError::AlreadyPosted.into());
        }
        expected_version.check(version)?;

        update_voucher(&mut tx, tenant_id, voucher).await?;
        insert_events(&mut tx, tenant_id, voucher_id, version, events).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(())
    }

    pub async fn history(
        &self,
        tenant_id: TenantId,
        voucher_id: VoucherId,
    ) -> LedgerResult<Vec<EventEnvelope<VoucherEvent>>> {
        // Distinguish "no such voucher" from an empty history.
        self.load(tenant_id, voucher_id).await?;
        let rows = sqlx::query(
            r#"
            SELECT envelope FROM voucher_events
            WHERE tenant_id = $1 AND voucher_id = $2
            ORDER BY sequence_number ASC
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(voucher_id.0.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("voucher_history", e))?;

        rows.iter()
            .map(|row| {
                let value: serde_json::Value = row
                    .try_get("envelope")
                    .map_err(|e| map_sqlx_error("voucher_history", e))?;
                from_json(value)
            })
            .collect()
    }

    pub async fn list(&self, tenant_id: TenantId, filter: &VoucherFilter) -> LedgerResult<Vec<Voucher>> {
        let rows = sqlx::query(
            r#"
            SELECT document FROM vouchers
            WHERE tenant_id = $1
                AND ($2::text IS NULL OR status = $2)
                AND ($3::date IS NULL OR voucher_date >= $3)
                AND ($4::date IS NULL OR voucher_date <= $4)
            ORDER BY number_year ASC, number_seq ASC
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.from)
        .bind(filter.to)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_vouchers", e))?;
        rows.iter().map(voucher_from_row).collect()
    }

    pub async fn lines(&self, tenant_id: TenantId, filter: &PostedLineFilter) -> LedgerResult<Vec<PostedLine>> {
        let rows = sqlx::query(
            r#"
            SELECT voucher_id, line_no, number_year, number_seq, entry_date, account_id, debit, credit, description
            FROM posted_lines
            WHERE tenant_id = $1
                AND ($2::uuid IS NULL OR account_id = $2)
                AND ($3::date IS NULL OR entry_date >= $3)
                AND ($4::date IS NULL OR entry_date <= $4)
            ORDER BY entry_date ASC, number_year ASC, number_seq ASC, line_no ASC
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(filter.account_id.map(|a| *a.as_uuid()))
        .bind(filter.from)
        .bind(filter.to)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("posted_lines", e))?;

        rows.iter()
            .map(|row| posted_line_from_row(row).map_err(|e| map_sqlx_error("posted_lines", e)))
            .collect()
    }

    pub async fn is_referenced(&self, tenant_id: TenantId, account_id: AccountId) -> LedgerResult<bool> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM voucher_entries WHERE tenant_id = $1 AND account_id = $2
            ) AS referenced
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(account_id.as_uuid())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("account_is_referenced", e))?;
        row.try_get("referenced")
            .map_err(|e| map_sqlx_error("account_is_referenced", e))
    }

    #[allow(clippy::too_many_arguments)]
    #[instrument(skip(self), fields(tenant_id = %tenant_id, account_id = %account_id, period = %period), err)]
    pub async fn upsert(
        &self,
        tenant_id: TenantId,
        account_id: AccountId,
        nature: AccountNature,
        period: FiscalPeriod,
        debit: i64,
        credit: i64,
        lock_timeout: Duration,
    ) -> LedgerResult<LedgerBalance> {
        let mut tx = self.begin().await?;
        set_lock_timeout(&mut tx, lock_timeout).await?;
        lock_account(&mut tx, tenant_id, account_id, lock_timeout).await?;

        let base = load_account_rows(&mut tx, tenant_id, &[account_id]).await?;
        let mut staged = BTreeMap::new();
        let row = stage_delta(&base, &mut staged, tenant_id, account_id, nature, period, debit, credit)?;
        for staged_row in staged.values() {
            write_balance(&mut tx, staged_row).await?;
        }
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(row)
    }

    pub async fn balance(
        &self,
        tenant_id: TenantId,
        account_id: AccountId,
        period: FiscalPeriod,
    ) -> LedgerResult<Option<LedgerBalance>> {
        let sql = format!(
            "SELECT {BALANCE_COLUMNS} FROM ledger_balances \
             WHERE tenant_id = $1 AND account_id = $2 AND year = $3 AND month = $4"
        );
        let row = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .bind(account_id.as_uuid())
            .bind(period.year())
            .bind(period.month() as i32)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_balance", e))?;
        row.map(|r| balance_from_row(&r).map_err(|e| map_sqlx_error("get_balance", e)))
            .transpose()
    }

    /// Latest row per account at or before `period`; `account_id = None` means all accounts.
    pub async fn as_of(
        &self,
        tenant_id: TenantId,
        account_id: Option<AccountId>,
        period: FiscalPeriod,
    ) -> LedgerResult<Vec<LedgerBalance>> {
        let sql = format!(
            "SELECT DISTINCT ON (account_id) {BALANCE_COLUMNS} FROM ledger_balances \
             WHERE tenant_id = $1 AND ($2::uuid IS NULL OR account_id = $2) \
               AND (year, month) <= ($3, $4) \
             ORDER BY account_id, year DESC, month DESC"
        );
        let rows = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .bind(account_id.map(|a| *a.as_uuid()))
            .bind(period.year())
            .bind(period.month() as i32)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("balances_as_of", e))?;

        rows.iter()
            .map(|r| {
                let row = balance_from_row(r).map_err(|e| map_sqlx_error("balances_as_of", e))?;
                Ok(if row.period == period {
                    row
                } else {
                    row.carried_forward(period)
                })
            })
            .collect()
    }

    pub async fn latest(&self, tenant_id: TenantId, account_id: AccountId) -> LedgerResult<Option<LedgerBalance>> {
        let sql = format!(
            "SELECT {BALANCE_COLUMNS} FROM ledger_balances \
             WHERE tenant_id = $1 AND account_id = $2 \
             ORDER BY year DESC, month DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .bind(account_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("latest_balance", e))?;
        row.map(|r| balance_from_row(&r).map_err(|e| map_sqlx_error("latest_balance", e)))
            .transpose()
    }

    /// First half of a posting: open the transaction and take every lock.
    ///
    /// The caller consults its fiscal calendar between this and
    /// [`PostgresLedgerStore::finish_posting`], so the flag is read while the
    /// locks are held.
    #[instrument(
        skip(self, commit),
        fields(voucher_id = %commit.voucher.id_typed(), period = %commit.period),
        err
    )]
    pub async fn lock_posting(
        &self,
        commit: &PostingCommit,
        lock_timeout: Duration,
    ) -> LedgerResult<PostingTx> {
        let tenant_id = tenant_of(&commit.voucher)?;
        let mut tx = self.begin().await?;
        set_lock_timeout(&mut tx, lock_timeout).await?;

        let (status, version) = lock_voucher(&mut tx, tenant_id, commit.voucher.id_typed())
            .await
            .map_err(|e| with_lock_timeout(e, lock_timeout))?;
        let accounts: BTreeSet<AccountId> = commit.deltas.iter().map(|d| d.account_id).collect();
        for account_id in &accounts {
            lock_account(&mut tx, tenant_id, *account_id, lock_timeout).await?;
        }

        Ok(PostingTx {
            tx,
            tenant_id,
            status,
            version,
            accounts: accounts.into_iter().collect(),
        })
    }

    /// Second half of a posting: re-check, apply every delta, persist, commit.
    /// Dropping `locked` on any error rolls the transaction back.
    #[instrument(
        skip(self, locked, commit),
        fields(voucher_id = %commit.voucher.id_typed(), deltas = commit.deltas.len()),
        err
    )]
    pub async fn finish_posting(
        &self,
        locked: PostingTx,
        commit: PostingCommit,
        calendar_open: bool,
    ) -> LedgerResult<Vec<LedgerBalance>> {
        let PostingTx {
            mut tx,
            tenant_id,
            status,
            version,
            accounts,
        } = locked;
        let voucher_id = commit.voucher.id_typed();
        let period = commit.period;

        if !calendar_open || period_closed(&mut tx, tenant_id, period).await? {
            return Err(PolicyError::PeriodClosed {
                year: period.year(),
                month: period.month(),
            }
            .into());
        }
        if status == VoucherStatus::Posted {
            return Err(StateError::AlreadyPosted.into());
        }
        ExpectedVersion::Exact(commit.expected_version).check(version)?;

        let base = load_account_rows(&mut tx, tenant_id, &accounts).await?;
        let mut staged = BTreeMap::new();
        let mut touched = Vec::with_capacity(commit.deltas.len());
        for delta in &commit.deltas {
            touched.push(stage_delta(
                &base,
                &mut staged,
                tenant_id,
                delta.account_id,
                delta.nature,
                period,
                delta.debit,
                delta.credit,
            )?);
        }
        for row in staged.values() {
            write_balance(&mut tx, row).await?;
        }

        update_voucher(&mut tx, tenant_id, &commit.voucher).await?;
        insert_events(&mut tx, tenant_id, voucher_id, version, &commit.events).await?;
        for line in PostedLine::from_voucher(&commit.voucher) {
            insert_posted_line(&mut tx, tenant_id, &line).await?;
        }

        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(touched)
    }

    async fn begin(&self) -> LedgerResult<Transaction<'static, Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }
}

async fn set_lock_timeout(tx: &mut Transaction<'_, Postgres>, timeout: Duration) -> LedgerResult<()> {
    sqlx::query("SELECT set_config('lock_timeout', $1, true)")
        .bind(format!("{}ms", timeout.as_millis().max(1)))
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("set_lock_timeout", e))?;
    Ok(())
}

async fn lock_voucher(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: TenantId,
    voucher_id: VoucherId,
) -> LedgerResult<(VoucherStatus, u64)> {
    let row = sqlx::query(
        "SELECT status, version FROM vouchers WHERE tenant_id = $1 AND voucher_id = $2 FOR UPDATE",
    )
    .bind(tenant_id.as_uuid())
    .bind(voucher_id.0.as_uuid())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("lock_voucher", e))?
    .ok_or_else(|| LedgerError::not_found(format!("voucher {voucher_id}")))?;

    let status: String = row.try_get("status").map_err(|e| map_sqlx_error("lock_voucher", e))?;
    let version: i64 = row.try_get("version").map_err(|e| map_sqlx_error("lock_voucher", e))?;
    Ok((status.parse()?, version as u64))
}

async fn lock_account(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: TenantId,
    account_id: AccountId,
    lock_timeout: Duration,
) -> LedgerResult<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(format!("ledger_balance:{tenant_id}:{account_id}"))
        .execute(&mut **tx)
        .await
        .map_err(|e| with_lock_timeout(map_sqlx_error("lock_account", e), lock_timeout))?;
    Ok(())
}

async fn period_closed(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: TenantId,
    period: FiscalPeriod,
) -> LedgerResult<bool> {
    let row = sqlx::query(
        "SELECT closed FROM fiscal_periods WHERE tenant_id = $1 AND year = $2 AND month = $3 FOR SHARE",
    )
    .bind(tenant_id.as_uuid())
    .bind(period.year())
    .bind(period.month() as i32)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("period_closed", e))?;
    match row {
        Some(row) => row.try_get("closed").map_err(|e| map_sqlx_error("period_closed", e)),
        None => Ok(false),
    }
}

async fn load_account_rows(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: TenantId,
    accounts: &[AccountId],
) -> LedgerResult<BTreeMap<BalanceKey, LedgerBalance>> {
    let ids: Vec<Uuid> = accounts.iter().map(|a| *a.as_uuid()).collect();
    let sql = format!(
        "SELECT {BALANCE_COLUMNS} FROM ledger_balances WHERE tenant_id = $1 AND account_id = ANY($2)"
    );
    let rows = sqlx::query(&sql)
        .bind(tenant_id.as_uuid())
        .bind(&ids)
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("load_account_rows", e))?;

    let mut out = BTreeMap::new();
    for row in rows {
        let balance = balance_from_row(&row).map_err(|e| map_sqlx_error("load_account_rows", e))?;
        out.insert(balance.key(), balance);
    }
    Ok(out)
}

async fn write_balance(tx: &mut Transaction<'_, Postgres>, row: &LedgerBalance) -> LedgerResult<()> {
    sqlx::query(
        r#"
        INSERT INTO ledger_balances (
            tenant_id, account_id, year, month, nature,
            opening_debit, opening_credit, period_debit, period_credit,
            closing_debit, closing_credit, balance
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        ON CONFLICT (tenant_id, account_id, year, month) DO UPDATE SET
            opening_debit = EXCLUDED.opening_debit,
            opening_credit = EXCLUDED.opening_credit,
            period_debit = EXCLUDED.period_debit,
            period_credit = EXCLUDED.period_credit,
            closing_debit = EXCLUDED.closing_debit,
            closing_credit = EXCLUDED.closing_credit,
            balance = EXCLUDED.balance
        "#,
    )
    .bind(row.tenant_id.as_uuid())
    .bind(row.account_id.as_uuid())
    .bind(row.period.year())
    .bind(row.period.month() as i32)
    .bind(row.nature.as_str())
    .bind(row.opening_debit)
    .bind(row.opening_credit)
    .bind(row.period_debit)
    .bind(row.period_credit)
    .bind(row.closing_debit)
    .bind(row.closing_credit)
    .bind(row.balance)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("write_balance", e))?;
    Ok(())
}

async fn update_voucher(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: TenantId,
    voucher: &Voucher,
) -> LedgerResult<()> {
    sqlx::query(
        r#"
        UPDATE vouchers
        SET voucher_date = $3, status = $4, version = $5, document = $6,
            number_year = $7, number_seq = $8, updated_at = NOW()
        WHERE tenant_id = $1 AND voucher_id = $2
        "#,
    )
    .bind(tenant_id.as_uuid())
    .bind(voucher.id_typed().0.as_uuid())
    .bind(voucher.date())
    .bind(voucher.status().as_str())
    .bind(voucher.version() as i64)
    .bind(to_json(voucher)?)
    .bind(voucher.number().year)
    .bind(voucher.number().seq as i32)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("update_voucher", e))?;
    replace_entries(tx, tenant_id, voucher).await
}

async fn replace_entries(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: TenantId,
    voucher: &Voucher,
) -> LedgerResult<()> {
    let voucher_id = voucher.id_typed();
    sqlx::query("DELETE FROM voucher_entries WHERE tenant_id = $1 AND voucher_id = $2")
        .bind(tenant_id.as_uuid())
        .bind(voucher_id.0.as_uuid())
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("replace_entries", e))?;

    for entry in voucher.entries() {
        sqlx::query(
            r#"
            INSERT INTO voucher_entries (tenant_id, voucher_id, line_no, account_id, debit, credit, description)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(voucher_id.0.as_uuid())
        .bind(entry.line_no as i32)
        .bind(entry.account_id.as_uuid())
        .bind(entry.debit)
        .bind(entry.credit)
        .bind(entry.description.as_deref())
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("replace_entries", e))?;
    }
    Ok(())
}

async fn insert_events(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: TenantId,
    voucher_id: VoucherId,
    base_version: u64,
    events: &[VoucherEvent],
) -> LedgerResult<()> {
    let envelopes =
        EventEnvelope::wrap_batch(tenant_id, voucher_id.0, VOUCHER_AGGREGATE_TYPE, base_version, events);
    for envelope in envelopes {
        sqlx::query(
            r#"
            INSERT INTO voucher_events (tenant_id, voucher_id, sequence_number, event_id, event_type, occurred_at, envelope)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(voucher_id.0.as_uuid())
        .bind(envelope.sequence_number() as i64)
        .bind(envelope.event_id())
        .bind(envelope.event_type())
        .bind(envelope.occurred_at())
        .bind(to_json(&envelope)?)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_event", e))?;
    }
    Ok(())
}

async fn insert_posted_line(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: TenantId,
    line: &PostedLine,
) -> LedgerResult<()> {
    sqlx::query(
        r#"
        INSERT INTO posted_lines (tenant_id, voucher_id, line_no, number_year, number_seq, entry_date, account_id, debit, credit, description)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(tenant_id.as_uuid())
    .bind(line.voucher_id.0.as_uuid())
    .bind(line.line_no as i32)
    .bind(line.voucher_number.year)
    .bind(line.voucher_number.seq as i32)
    .bind(line.date)
    .bind(line.account_id.as_uuid())
    .bind(line.debit)
    .bind(line.credit)
    .bind(line.description.as_deref())
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_posted_line", e))?;
    Ok(())
}

fn tenant_of(voucher: &Voucher) -> LedgerResult<TenantId> {
    voucher
        .tenant_id()
        .ok_or_else(|| LedgerError::storage("voucher has no tenant"))
}

fn to_json<T: serde::Serialize>(value: &T) -> LedgerResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| StoreError::Serialization(e.to_string()).into())
}

fn from_json<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> LedgerResult<T> {
    serde_json::from_value(value).map_err(|e| StoreError::Serialization(e.to_string()).into())
}

fn voucher_from_row(row: &PgRow) -> LedgerResult<Voucher> {
    let document: serde_json::Value = row
        .try_get("document")
        .map_err(|e| map_sqlx_error("decode_voucher", e))?;
    from_json(document)
}

fn decode_error(err: LedgerError) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(err))
}

fn balance_from_row(row: &PgRow) -> Result<LedgerBalance, sqlx::Error> {
    let year: i32 = row.try_get("year")?;
    let month: i32 = row.try_get("month")?;
    let nature: String = row.try_get("nature")?;
    Ok(LedgerBalance {
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id")?),
        account_id: AccountId::from_uuid(row.try_get("account_id")?),
        period: FiscalPeriod::new(year, month as u32).map_err(decode_error)?,
        nature: nature.parse().map_err(decode_error)?,
        opening_debit: row.try_get("opening_debit")?,
        opening_credit: row.try_get("opening_credit")?,
        period_debit: row.try_get("period_debit")?,
        period_credit: row.try_get("period_credit")?,
        closing_debit: row.try_get("closing_debit")?,
        closing_credit: row.try_get("closing_credit")?,
        balance: row.try_get("balance")?,
    })
}

fn posted_line_from_row(row: &PgRow) -> Result<PostedLine, sqlx::Error> {
    let line_no: i32 = row.try_get("line_no")?;
    let year: i32 = row.try_get("number_year")?;
    let seq: i32 = row.try_get("number_seq")?;
    Ok(PostedLine {
        voucher_id: VoucherId::new(row.try_get::<Uuid, _>("voucher_id")?.into()),
        voucher_number: VoucherNumber::new(year, seq as u32),
        date: row.try_get("entry_date")?,
        line_no: line_no as u32,
        account_id: AccountId::from_uuid(row.try_get("account_id")?),
        debit: row.try_get("debit")?,
        credit: row.try_get("credit")?,
        description: row.try_get("description")?,
    })
}

fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> LedgerError {
    match err {
        sqlx::Error::Database(db_err) => {
            match db_err.code().as_deref() {
                // lock_not_available / deadlock_detected
                Some("55P03") | Some("40P01") => StoreError::LockTimeout { waited_ms: 0 }.into(),
                _ => StoreError::Database {
                    operation,
                    message: db_err.message().to_string(),
                }
                .into(),
            }
        }
        sqlx::Error::PoolClosed => StoreError::Database {
            operation,
            message: "connection pool closed".to_string(),
        }
        .into(),
        other => StoreError::Database {
            operation,
            message: other.to_string(),
        }
        .into(),
    }
}

/// Report the configured wait on lock timeouts, which Postgres does not echo back.
fn with_lock_timeout(err: LedgerError, lock_timeout: Duration) -> LedgerError {
    match err {
        LedgerError::Concurrency(forgeledger_core::ConcurrencyError::LockTimeout { .. }) => {
            StoreError::LockTimeout {
                waited_ms: lock_timeout.as_millis() as u64,
            }
            .into()
        }
        other => other,
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505"))
}

/// Verdict of an external calendar, consulted while the posting transaction
/// holds its connection. A calendar backed by the ledger tables is skipped:
/// `finish_posting` reads `fiscal_periods` on the same transaction, and a
/// second pooled connection per posting could starve the pool.
fn calendar_allows(fiscal: &dyn FiscalPeriods, tenant_id: TenantId, period: FiscalPeriod) -> bool {
    fiscal.read_by_posting_store() || fiscal.is_period_open(tenant_id, period.year(), period.month())
}

/// Drive an async store call to completion from synchronous code.
fn block_on<T>(fut: impl Future<Output = LedgerResult<T>>) -> LedgerResult<T> {
    let handle = tokio::runtime::Handle::try_current().map_err(|_| {
        LedgerError::storage("PostgresLedgerStore requires a tokio runtime; call it from spawn_blocking")
    })?;
    handle.block_on(fut)
}

impl AccountStore for PostgresLedgerStore {
    fn save_account(&self, account: &Account) -> LedgerResult<()> {
        block_on(self.upsert_account(account))
    }

    fn delete_account(&self, tenant_id: TenantId, account_id: AccountId) -> LedgerResult<()> {
        block_on(self.remove_account(tenant_id, account_id))
    }

    fn load_accounts(&self) -> LedgerResult<Vec<Account>> {
        block_on(self.all_accounts())
    }
}

impl FiscalPeriods for PostgresLedgerStore {
    fn is_period_open(&self, tenant_id: TenantId, year: i32, month: u32) -> bool {
        let Ok(period) = FiscalPeriod::new(year, month) else {
            return false;
        };
        match block_on(self.period_is_closed(tenant_id, period)) {
            Ok(closed) => !closed,
            Err(err) => {
                // Denies. Postings read the flag on their own transaction instead.
                warn!(error = %err, %period, "fiscal period lookup failed");
                false
            }
        }
    }

    fn read_by_posting_store(&self) -> bool {
        true
    }

    fn close_period(&self, tenant_id: TenantId, period: FiscalPeriod) -> LedgerResult<()> {
        block_on(self.set_period_closed(tenant_id, period, true))
    }

    fn reopen_period(&self, tenant_id: TenantId, period: FiscalPeriod) -> LedgerResult<()> {
        block_on(self.set_period_closed(tenant_id, period, false))
    }
}

impl VoucherStore for PostgresLedgerStore {
    fn next_voucher_number(&self, tenant_id: TenantId, year: i32) -> LedgerResult<VoucherNumber> {
        block_on(self.allocate_number(tenant_id, year))
    }

    fn insert_voucher(&self, voucher: &Voucher, events: &[VoucherEvent]) -> LedgerResult<()> {
        block_on(self.insert(voucher, events))
    }

    fn load_voucher(&self, tenant_id: TenantId, voucher_id: VoucherId) -> LedgerResult<Voucher> {
        block_on(self.load(tenant_id, voucher_id))
    }

    fn save_voucher(
        &self,
        voucher: &Voucher,
        expected_version: ExpectedVersion,
        events: &[VoucherEvent],
    ) -> LedgerResult<()> {
        block_on(self.save(voucher, expected_version, events))
    }

    fn voucher_history(
        &self,
        tenant_id: TenantId,
        voucher_id: VoucherId,
    ) -> LedgerResult<Vec<EventEnvelope<VoucherEvent>>> {
        block_on(self.history(tenant_id, voucher_id))
    }

    fn list_vouchers(&self, tenant_id: TenantId, filter: &VoucherFilter) -> LedgerResult<Vec<Voucher>> {
        block_on(self.list(tenant_id, filter))
    }

    fn posted_lines(
        &self,
        tenant_id: TenantId,
        filter: &PostedLineFilter,
    ) -> LedgerResult<Vec<PostedLine>> {
        block_on(self.lines(tenant_id, filter))
    }

    fn account_is_referenced(&self, tenant_id: TenantId, account_id: AccountId) -> LedgerResult<bool> {
        block_on(self.is_referenced(tenant_id, account_id))
    }
}

impl LedgerBalanceStore for PostgresLedgerStore {
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
        block_on(self.upsert(tenant_id, account_id, nature, period, debit, credit, lock_timeout))
    }

    fn get_balance(
        &self,
        tenant_id: TenantId,
        account_id: AccountId,
        period: FiscalPeriod,
    ) -> LedgerResult<LedgerBalance> {
        block_on(self.balance(tenant_id, account_id, period))?
            .ok_or_else(|| LedgerError::not_found(format!("ledger balance {account_id} {period}")))
    }

    fn balance_as_of(
        &self,
        tenant_id: TenantId,
        account_id: AccountId,
        period: FiscalPeriod,
    ) -> LedgerResult<Option<LedgerBalance>> {
        Ok(block_on(self.as_of(tenant_id, Some(account_id), period))?
            .into_iter()
            .next())
    }

    fn balances_as_of(&self, tenant_id: TenantId, period: FiscalPeriod) -> LedgerResult<Vec<LedgerBalance>> {
        block_on(self.as_of(tenant_id, None, period))
    }

    fn latest_balance(
        &self,
        tenant_id: TenantId,
        account_id: AccountId,
    ) -> LedgerResult<Option<LedgerBalance>> {
        block_on(self.latest(tenant_id, account_id))
    }
}

impl PostingStore for PostgresLedgerStore {
    fn commit_posting(
        &self,
        commit: PostingCommit,
        fiscal: &dyn FiscalPeriods,
        lock_timeout: Duration,
    ) -> LedgerResult<Vec<LedgerBalance>> {
        let locked = block_on(self.lock_posting(&commit, lock_timeout))?;
        let open = calendar_allows(fiscal, locked.tenant_id, commit.period);
        block_on(self.finish_posting(locked, commit, open))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiscal::InMemoryFiscalCalendar;

    async fn store() -> Option<PostgresLedgerStore> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let store = PostgresLedgerStore::connect(&url).await.ok()?;
        store.migrate().await.ok()?;
        Some(store)
    }

    #[test]
    fn lock_errors_map_to_retryable_timeouts() {
        let err = with_lock_timeout(
            StoreError::LockTimeout { waited_ms: 0 }.into(),
            Duration::from_millis(250),
        );
        assert_eq!(
            err,
            forgeledger_core::ConcurrencyError::LockTimeout { waited_ms: 250 }.into()
        );
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn upsert_rolls_forward_in_postgres() {
        let Some(store) = store().await else {
            eprintln!("DATABASE_URL not set; skipping");
            return;
        };
        let (t, a) = (TenantId::new(), AccountId::new());
        let jan = FiscalPeriod::new(2026, 1).unwrap();
        let feb = FiscalPeriod::new(2026, 2).unwrap();
        let wait = Duration::from_secs(2);

        store.upsert(t, a, AccountNature::Debit, feb, 100, 0, wait).await.unwrap();
        store.upsert(t, a, AccountNature::Debit, jan, 40, 0, wait).await.unwrap();

        let row = store.balance(t, a, feb).await.unwrap().unwrap();
        assert_eq!((row.opening_debit, row.closing_debit), (40, 140));

        let as_of = store.as_of(t, None, FiscalPeriod::new(2026, 6).unwrap()).await.unwrap();
        assert_eq!(as_of.len(), 1);
        assert_eq!(as_of[0].balance, 140);
    }

    #[tokio::test]
    async fn closed_period_in_table_refuses_posting() {
        let Some(store) = store().await else {
            eprintln!("DATABASE_URL not set; skipping");
            return;
        };
        let t = TenantId::new();
        let jan = FiscalPeriod::new(2026, 1).unwrap();
        store.set_period_closed(t, jan, true).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(period_closed(&mut tx, t, jan).await.unwrap());
        assert!(store.period_is_closed(t, jan).await.unwrap());
        assert!(InMemoryFiscalCalendar::new().is_period_open(t, 2026, 1));
    }

    /// Calendar that counts lookups and answers `open`.
    struct CountingCalendar {
        in_store: bool,
        open: bool,
        lookups: std::sync::atomic::AtomicUsize,
    }

    impl FiscalPeriods for CountingCalendar {
        fn is_period_open(&self, _tenant_id: TenantId, _year: i32, _month: u32) -> bool {
            self.lookups.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.open
        }

        fn read_by_posting_store(&self) -> bool {
            self.in_store
        }
    }

    #[test]
    fn store_backed_calendar_is_not_consulted_mid_posting() {
        let t = TenantId::new();
        let jan = FiscalPeriod::new(2026, 1).unwrap();

        let store_backed = CountingCalendar {
            in_store: true,
            open: false,
            lookups: Default::default(),
        };
        assert!(calendar_allows(&store_backed, t, jan));
        assert_eq!(store_backed.lookups.load(std::sync::atomic::Ordering::SeqCst), 0);

        let external = CountingCalendar {
            in_store: false,
            open: false,
            lookups: Default::default(),
        };
        assert!(!calendar_allows(&external, t, jan));
        assert_eq!(external.lookups.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn postgres_store_reads_periods_in_its_own_transaction() {
        let Some(store) = store().await else {
            eprintln!("DATABASE_URL not set; skipping");
            return;
        };
        assert!(store.read_by_posting_store());
        let shared: Arc<dyn FiscalPeriods> = Arc::new(store);
        assert!(shared.read_by_posting_store());
    }
}
