//! Voucher workflow operations and the posting transaction.

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use forgeledger_accounting::{
    ChartOfAccounts, CreateVoucher, EntryInput, LedgerBalance, RejectVoucher, Transition,
    UpdateDraft, Voucher, VoucherCommand, VoucherEvent, VoucherId, VoucherNumber, VoucherType,
};
use forgeledger_auth::{Actor, Role};
use forgeledger_core::{
    Aggregate, AggregateRoot, ExpectedVersion, FiscalPeriod, LedgerError, LedgerResult, PolicyError,
    ValidationError,
};
use forgeledger_events::EventEnvelope;

use super::LedgerEngine;
use crate::store::{PostingCommit, PostingDelta, VoucherFilter};

/// Request to open a draft voucher; the number is assigned by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewVoucher {
    pub date: NaiveDate,
    #[serde(default)]
    pub voucher_type: VoucherType,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub entries: Vec<EntryInput>,
}

/// Partial edit of a draft or rejected voucher; `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoucherEdit {
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub voucher_type: Option<VoucherType>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub entries: Option<Vec<EntryInput>>,
}

/// Result of a successful posting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PostingOutcome {
    pub voucher: Voucher,
    /// Balance rows of the posted period, one per touched account.
    pub balances: Vec<LedgerBalance>,
}

fn transition(actor: &Actor, voucher_id: VoucherId) -> Transition {
    Transition {
        tenant_id: actor.tenant_id,
        voucher_id,
        actor: actor.user_id,
        occurred_at: Utc::now(),
    }
}

impl LedgerEngine {
    #[instrument(skip_all, fields(tenant_id = %actor.tenant_id, user_id = %actor.user_id, date = %input.date))]
    pub fn create_voucher(&self, actor: &Actor, input: NewVoucher) -> LedgerResult<Voucher> {
        use chrono::Datelike;

        let tenant_id = actor.tenant_id;
        let voucher_id = VoucherId::generate();
        let mut create = CreateVoucher {
            tenant_id,
            voucher_id,
            number: VoucherNumber::default(),
            date: input.date,
            voucher_type: input.voucher_type,
            description: input.description,
            entries: input.entries,
            actor: actor.user_id,
            occurred_at: Utc::now(),
        };
        // Decide before allocating a number so rejected drafts leave no gaps.
        Voucher::empty(voucher_id).handle(&VoucherCommand::Create(create.clone()))?;

        create.number = self.store.next_voucher_number(tenant_id, input.date.year())?;
        let (voucher, events) = Voucher::empty(voucher_id).execute(&VoucherCommand::Create(create))?;
        self.store.insert_voucher(&voucher, &events)?;

        info!(voucher_id = %voucher_id, number = %voucher.number(), "voucher created");
        Ok(voucher)
    }

    #[instrument(skip_all, fields(tenant_id = %actor.tenant_id, voucher_id = %voucher_id))]
    pub fn update_voucher(
        &self,
        actor: &Actor,
        voucher_id: VoucherId,
        edit: VoucherEdit,
    ) -> LedgerResult<Voucher> {
        use chrono::Datelike;

        let mut update = UpdateDraft {
            tenant_id: actor.tenant_id,
            voucher_id,
            date: edit.date,
            voucher_type: edit.voucher_type,
            description: edit.description,
            entries: edit.entries,
            number: None,
            actor: actor.user_id,
            occurred_at: Utc::now(),
        };

        // A date in another fiscal year takes a number from that year's sequence.
        if let Some(date) = edit.date {
            let current = self.store.load_voucher(actor.tenant_id, voucher_id)?;
            if date.year() != current.number().year {
                update.number = Some(VoucherNumber::new(date.year(), 0));
                current.handle(&VoucherCommand::UpdateDraft(update.clone()))?;
                update.number = Some(self.store.next_voucher_number(actor.tenant_id, date.year())?);
            }
        }

        let command = VoucherCommand::UpdateDraft(update);
        let voucher = self.apply(actor, voucher_id, &command, |_, _| Ok(()))?;
        info!(number = %voucher.number(), "voucher updated");
        Ok(voucher)
    }

    /// Draft to pending: balanced, well-formed, every account known, active and
    /// owned by the tenant.
    #[instrument(skip_all, fields(tenant_id = %actor.tenant_id, voucher_id = %voucher_id))]
    pub fn submit_voucher(&self, actor: &Actor, voucher_id: VoucherId) -> LedgerResult<Voucher> {
        let command = VoucherCommand::Submit(transition(actor, voucher_id));
        let voucher = self.apply(actor, voucher_id, &command, |engine, voucher| {
            engine
                .directory
                .with_chart(actor.tenant_id, |chart| engine.check_accounts(chart, voucher))
        })?;
        info!("voucher submitted");
        Ok(voucher)
    }

    #[instrument(skip_all, fields(tenant_id = %actor.tenant_id, voucher_id = %voucher_id))]
    pub fn approve_voucher(&self, actor: &Actor, voucher_id: VoucherId) -> LedgerResult<Voucher> {
        self.require(actor, &self.settings.approver_role)?;
        let command = VoucherCommand::Approve(transition(actor, voucher_id));
        let voucher = self.apply(actor, voucher_id, &command, |_, _| Ok(()))?;
        info!("voucher approved");
        Ok(voucher)
    }

    #[instrument(skip_all, fields(tenant_id = %actor.tenant_id, voucher_id = %voucher_id))]
    pub fn reject_voucher(
        &self,
        actor: &Actor,
        voucher_id: VoucherId,
        reason: &str,
    ) -> LedgerResult<Voucher> {
        self.require(actor, &self.settings.approver_role)?;
        let command = VoucherCommand::Reject(RejectVoucher {
            tenant_id: actor.tenant_id,
            voucher_id,
            reason: reason.to_string(),
            actor: actor.user_id,
            occurred_at: Utc::now(),
        });
        let voucher = self.apply(actor, voucher_id, &command, |_, _| Ok(()))?;
        info!("voucher rejected");
        Ok(voucher)
    }

    #[instrument(skip_all, fields(tenant_id = %actor.tenant_id, voucher_id = %voucher_id))]
    pub fn reopen_voucher(&self, actor: &Actor, voucher_id: VoucherId) -> LedgerResult<Voucher> {
        let command = VoucherCommand::Reopen(transition(actor, voucher_id));
        let voucher = self.apply(actor, voucher_id, &command, |_, _| Ok(()))?;
        info!("voucher reopened");
        Ok(voucher)
    }

    /// Approved to posted, applying every balance delta atomically.
    ///
    /// The chart read lock is held from the account checks through the commit,
    /// so accounts cannot be deactivated or removed mid-posting. Store locks
    /// are bounded by the configured lock timeout.
    #[instrument(skip_all, fields(tenant_id = %actor.tenant_id, user_id = %actor.user_id, voucher_id = %voucher_id))]
    pub fn post_voucher(&self, actor: &Actor, voucher_id: VoucherId) -> LedgerResult<PostingOutcome> {
        self.require(actor, &self.settings.poster_role)?;
        let tenant_id = actor.tenant_id;

        let voucher = self.store.load_voucher(tenant_id, voucher_id)?;
        let (posted, events) = voucher.execute(&VoucherCommand::Post(transition(actor, voucher_id)))?;
        let deltas = voucher.deltas()?;

        let result = self.directory.with_chart(tenant_id, |chart| {
            self.check_accounts(chart, &voucher)?;
            let deltas = deltas
                .iter()
                .map(|d| {
                    let account = chart.ensure_postable(d.account_id)?;
                    Ok(PostingDelta {
                        account_id: d.account_id,
                        nature: account.nature,
                        debit: d.debit,
                        credit: d.credit,
                    })
                })
                .collect::<LedgerResult<Vec<_>>>()?;

            let commit = PostingCommit {
                voucher: posted.clone(),
                expected_version: voucher.version(),
                events,
                period: voucher.period(),
                deltas,
            };
            self.store
                .commit_posting(commit, self.fiscal.as_ref(), self.settings.lock_timeout)
        });

        match result {
            Ok(balances) => {
                info!(
                    number = %posted.number(),
                    period = %posted.period(),
                    accounts = balances.len(),
                    "voucher posted"
                );
                Ok(PostingOutcome {
                    voucher: posted,
                    balances,
                })
            }
            Err(err) => {
                match &err {
                    LedgerError::Concurrency(_) => warn!(error = %err, "posting busy, retryable"),
                    LedgerError::Policy(_) | LedgerError::State(_) => {
                        warn!(error = %err, "posting refused")
                    }
                    _ => {}
                }
                Err(err)
            }
        }
    }

    pub fn get_voucher(&self, actor: &Actor, voucher_id: VoucherId) -> LedgerResult<Voucher> {
        self.store.load_voucher(actor.tenant_id, voucher_id)
    }

    pub fn list_vouchers(&self, actor: &Actor, filter: &VoucherFilter) -> LedgerResult<Vec<Voucher>> {
        self.store.list_vouchers(actor.tenant_id, filter)
    }

    pub fn voucher_history(
        &self,
        actor: &Actor,
        voucher_id: VoucherId,
    ) -> LedgerResult<Vec<EventEnvelope<VoucherEvent>>> {
        self.store.voucher_history(actor.tenant_id, voucher_id)
    }

    /// Close a fiscal period to further postings. Admin only.
    #[instrument(skip_all, fields(tenant_id = %actor.tenant_id, period = %period))]
    pub fn close_period(&self, actor: &Actor, period: FiscalPeriod) -> LedgerResult<()> {
        self.require(actor, &Role::admin())?;
        self.fiscal.close_period(actor.tenant_id, period)?;
        info!("fiscal period closed");
        Ok(())
    }

    #[instrument(skip_all, fields(tenant_id = %actor.tenant_id, period = %period))]
    pub fn reopen_period(&self, actor: &Actor, period: FiscalPeriod) -> LedgerResult<()> {
        self.require(actor, &Role::admin())?;
        self.fiscal.reopen_period(actor.tenant_id, period)?;
        info!("fiscal period reopened");
        Ok(())
    }

    pub fn is_period_open(&self, actor: &Actor, period: FiscalPeriod) -> bool {
        self.fiscal
            .is_period_open(actor.tenant_id, period.year(), period.month())
    }

    /// Load, decide, run `check` on the new state, then save with an exact
    /// version expectation.
    fn apply(
        &self,
        actor: &Actor,
        voucher_id: VoucherId,
        command: &VoucherCommand,
        check: impl FnOnce(&Self, &Voucher) -> LedgerResult<()>,
    ) -> LedgerResult<Voucher> {
        let voucher = self.store.load_voucher(actor.tenant_id, voucher_id)?;
        let (next, events) = voucher.execute(command)?;
        check(self, &next)?;
        self.store
            .save_voucher(&next, ExpectedVersion::Exact(voucher.version()), &events)?;
        Ok(next)
    }

    fn check_accounts(&self, chart: &ChartOfAccounts, voucher: &Voucher) -> LedgerResult<()> {
        for entry in voucher.entries() {
            match chart.get(entry.account_id) {
                Some(account) if account.active => {}
                Some(account) => {
                    return Err(PolicyError::AccountInactive(account.code.clone()).into());
                }
                None => {
                    self.directory
                        .ensure_not_foreign(chart.tenant_id(), entry.account_id)?;
                    return Err(ValidationError::UnknownAccount {
                        line: entry.line_no,
                        account: entry.account_id.to_string(),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }
}
