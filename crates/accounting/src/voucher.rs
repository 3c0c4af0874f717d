use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use forgeledger_core::{
    AccountId, Aggregate, AggregateId, AggregateRoot, FiscalPeriod, LedgerError, LedgerResult,
    StateError, TenantId, UserId, ValidationError,
};
use forgeledger_events::Event;

use crate::balance::{BalanceDelta, compute_deltas};

/// Aggregate type tag used in event envelopes.
pub const VOUCHER_AGGREGATE_TYPE: &str = "accounting.voucher";

/// Voucher identifier (aggregate id).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VoucherId(pub AggregateId);

impl VoucherId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }

    pub fn generate() -> Self {
        Self(AggregateId::new())
    }
}

impl core::fmt::Display for VoucherId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl core::str::FromStr for VoucherId {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Voucher number: sequential per tenant and fiscal year, rendered `2026-000042`.
#[derive(
    Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct VoucherNumber {
    pub year: i32,
    pub seq: u32,
}

impl VoucherNumber {
    pub fn new(year: i32, seq: u32) -> Self {
        Self { year, seq }
    }
}

impl core::fmt::Display for VoucherNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}-{:06}", self.year, self.seq)
    }
}

/// Workflow status.
///
/// ```text
/// draft -> pending -> approved -> posted
///             \-> rejected -> draft
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoucherStatus {
    Draft,
    Pending,
    Approved,
    Rejected,
    Posted,
}

impl VoucherStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VoucherStatus::Draft => "draft",
            VoucherStatus::Pending => "pending",
            VoucherStatus::Approved => "approved",
            VoucherStatus::Rejected => "rejected",
            VoucherStatus::Posted => "posted",
        }
    }

    /// Transition table.
    pub fn can_transition_to(self, next: VoucherStatus) -> bool {
        use VoucherStatus::*;
        matches!(
            (self, next),
            (Draft, Pending)
                | (Pending, Approved)
                | (Pending, Rejected)
                | (Approved, Posted)
                | (Rejected, Draft)
        )
    }

    /// Only draft and rejected vouchers accept header/entry edits.
    pub fn is_editable(self) -> bool {
        matches!(self, VoucherStatus::Draft | VoucherStatus::Rejected)
    }

    /// Statuses in which the double-entry invariant must hold.
    pub fn requires_balance(self) -> bool {
        matches!(
            self,
            VoucherStatus::Pending | VoucherStatus::Approved | VoucherStatus::Posted
        )
    }
}

impl core::str::FromStr for VoucherStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "draft" => Ok(VoucherStatus::Draft),
            "pending" => Ok(VoucherStatus::Pending),
            "approved" => Ok(VoucherStatus::Approved),
            "rejected" => Ok(VoucherStatus::Rejected),
            "posted" => Ok(VoucherStatus::Posted),
            other => Err(ValidationError::Other(format!("unknown voucher status '{other}'")).into()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoucherType {
    #[default]
    General,
    Other(String),
}

/// One voucher line. Exactly one of `debit` / `credit` is non-zero once submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoucherEntry {
    pub line_no: u32,
    pub account_id: AccountId,
    /// Minor units (e.g. cents).
    pub debit: i64,
    pub credit: i64,
    pub description: Option<String>,
}

/// Entry as supplied by callers; line numbers are assigned in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryInput {
    pub account_id: AccountId,
    #[serde(default)]
    pub debit: i64,
    #[serde(default)]
    pub credit: i64,
    #[serde(default)]
    pub description: Option<String>,
}

impl EntryInput {
    pub fn debit(account_id: AccountId, amount: i64) -> Self {
        Self {
            account_id,
            debit: amount,
            credit: 0,
            description: None,
        }
    }

    pub fn credit(account_id: AccountId, amount: i64) -> Self {
        Self {
            account_id,
            debit: 0,
            credit: amount,
            description: None,
        }
    }

    pub fn described(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct EntryTotals {
    pub debit: i128,
    pub credit: i128,
}

/// Check the double-entry invariant over a voucher's lines.
///
/// Entries must be non-empty, each with exactly one positive side, and
/// debits must equal credits exactly.
pub fn validate_entries(entries: &[VoucherEntry]) -> LedgerResult<EntryTotals> {
    if entries.is_empty() {
        return Err(ValidationError::EmptyVoucher.into());
    }

    let mut debit: i128 = 0;
    let mut credit: i128 = 0;
    for entry in entries {
        if entry.debit < 0 || entry.credit < 0 {
            return Err(malformed(entry.line_no, "amounts must not be negative"));
        }
        match (entry.debit > 0, entry.credit > 0) {
            (true, false) | (false, true) => {}
            (true, true) => {
                return Err(malformed(entry.line_no, "entry has both debit and credit"));
            }
            (false, false) => {
                return Err(malformed(entry.line_no, "entry has neither debit nor credit"));
            }
        }
        debit += entry.debit as i128;
        credit += entry.credit as i128;
    }

    if debit != credit {
        return Err(ValidationError::VoucherUnbalanced {
            debit_total: debit,
            credit_total: credit,
        }
        .into());
    }

    Ok(EntryTotals { debit, credit })
}

fn malformed(line: u32, reason: &str) -> LedgerError {
    ValidationError::MalformedEntry {
        line,
        reason: reason.to_string(),
    }
    .into()
}

/// Number inputs 1..n. Drafts may be unbalanced, but never carry negative amounts.
fn number_entries(inputs: &[EntryInput]) -> LedgerResult<Vec<VoucherEntry>> {
    inputs
        .iter()
        .enumerate()
        .map(|(idx, input)| {
            let line_no = idx as u32 + 1;
            if input.debit < 0 || input.credit < 0 {
                return Err(malformed(line_no, "amounts must not be negative"));
            }
            Ok(VoucherEntry {
                line_no,
                account_id: input.account_id,
                debit: input.debit,
                credit: input.credit,
                description: input.description.clone(),
            })
        })
        .collect()
}

/// Aggregate root: Voucher (header + ordered entries + workflow status).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voucher {
    id: VoucherId,
    tenant_id: Option<TenantId>,
    number: VoucherNumber,
    date: NaiveDate,
    voucher_type: VoucherType,
    description: Option<String>,
    status: VoucherStatus,
    entries: Vec<VoucherEntry>,
    created_by: Option<UserId>,
    approved_by: Option<UserId>,
    posted_by: Option<UserId>,
    posted_at: Option<DateTime<Utc>>,
    rejection_reason: Option<String>,
    version: u64,
    created: bool,
}

impl Voucher {
    /// Empty aggregate, ready to receive `VoucherCreated`.
    pub fn empty(id: VoucherId) -> Self {
        Self {
            id,
            tenant_id: None,
            number: VoucherNumber::default(),
            date: NaiveDate::default(),
            voucher_type: VoucherType::General,
            description: None,
            status: VoucherStatus::Draft,
            entries: Vec::new(),
            created_by: None,
            approved_by: None,
            posted_by: None,
            posted_at: None,
            rejection_reason: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> VoucherId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn number(&self) -> VoucherNumber {
        self.number
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn period(&self) -> FiscalPeriod {
        FiscalPeriod::containing(self.date)
    }

    pub fn voucher_type(&self) -> &VoucherType {
        &self.voucher_type
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn status(&self) -> VoucherStatus {
        self.status
    }

    pub fn entries(&self) -> &[VoucherEntry] {
        &self.entries
    }

    pub fn created_by(&self) -> Option<UserId> {
        self.created_by
    }

    pub fn approved_by(&self) -> Option<UserId> {
        self.approved_by
    }

    pub fn posted_by(&self) -> Option<UserId> {
        self.posted_by
    }

    pub fn posted_at(&self) -> Option<DateTime<Utc>> {
        self.posted_at
    }

    pub fn rejection_reason(&self) -> Option<&str> {
        self.rejection_reason.as_deref()
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    /// Distinct accounts referenced by the entries, in id order.
    pub fn account_ids(&self) -> Vec<AccountId> {
        self.entries
            .iter()
            .map(|e| e.account_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Per-account debit/credit deltas this voucher contributes when posted.
    pub fn deltas(&self) -> LedgerResult<Vec<BalanceDelta>> {
        compute_deltas(&self.entries)
    }

    pub fn totals(&self) -> EntryTotals {
        EntryTotals {
            debit: self.entries.iter().map(|e| e.debit as i128).sum(),
            credit: self.entries.iter().map(|e| e.credit as i128).sum(),
        }
    }
}

impl AggregateRoot for Voucher {
    type Id = VoucherId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateVoucher (starts in draft).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateVoucher {
    pub tenant_id: TenantId,
    pub voucher_id: VoucherId,
    pub number: VoucherNumber,
    pub date: NaiveDate,
    pub voucher_type: VoucherType,
    pub description: Option<String>,
    pub entries: Vec<EntryInput>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: UpdateDraft. `None` fields are left unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateDraft {
    pub tenant_id: TenantId,
    pub voucher_id: VoucherId,
    pub date: Option<NaiveDate>,
    pub voucher_type: Option<VoucherType>,
    pub description: Option<String>,
    pub entries: Option<Vec<EntryInput>>,
    /// Replacement number, required when `date` moves into another fiscal year.
    #[serde(default)]
    pub number: Option<VoucherNumber>,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Payload shared by the header-less transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub tenant_id: TenantId,
    pub voucher_id: VoucherId,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: Reject (pending -> rejected) with a reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectVoucher {
    pub tenant_id: TenantId,
    pub voucher_id: VoucherId,
    pub reason: String,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoucherCommand {
    Create(CreateVoucher),
    UpdateDraft(UpdateDraft),
    Submit(Transition),
    Approve(Transition),
    Reject(RejectVoucher),
    Reopen(Transition),
    Post(Transition),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoucherCreated {
    pub tenant_id: TenantId,
    pub voucher_id: VoucherId,
    pub number: VoucherNumber,
    pub date: NaiveDate,
    pub voucher_type: VoucherType,
    pub description: Option<String>,
    pub entries: Vec<VoucherEntry>,
    pub created_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Full replacement of the editable header and entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoucherUpdated {
    pub tenant_id: TenantId,
    pub voucher_id: VoucherId,
    pub date: NaiveDate,
    pub voucher_type: VoucherType,
    pub description: Option<String>,
    pub entries: Vec<VoucherEntry>,
    /// Set when the edit renumbered the voucher into another fiscal year.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<VoucherNumber>,
    pub updated_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoucherTransitioned {
    pub tenant_id: TenantId,
    pub voucher_id: VoucherId,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoucherRejected {
    pub tenant_id: TenantId,
    pub voucher_id: VoucherId,
    pub reason: String,
    pub rejected_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoucherPosted {
    pub tenant_id: TenantId,
    pub voucher_id: VoucherId,
    pub period: FiscalPeriod,
    pub posted_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoucherEvent {
    VoucherCreated(VoucherCreated),
    VoucherUpdated(VoucherUpdated),
    VoucherSubmitted(VoucherTransitioned),
    VoucherApproved(VoucherTransitioned),
    VoucherRejected(VoucherRejected),
    VoucherReopened(VoucherTransitioned),
    VoucherPosted(VoucherPosted),
}

impl VoucherEvent {
    pub fn tenant_id(&self) -> TenantId {
        match self {
            VoucherEvent::VoucherCreated(e) => e.tenant_id,
            VoucherEvent::VoucherUpdated(e) => e.tenant_id,
            VoucherEvent::VoucherSubmitted(e)
            | VoucherEvent::VoucherApproved(e)
            | VoucherEvent::VoucherReopened(e) => e.tenant_id,
            VoucherEvent::VoucherRejected(e) => e.tenant_id,
            VoucherEvent::VoucherPosted(e) => e.tenant_id,
        }
    }
}

impl Event for VoucherEvent {
    fn event_type(&self) -> &'static str {
        match self {
            VoucherEvent::VoucherCreated(_) => "accounting.voucher.created",
            VoucherEvent::VoucherUpdated(_) => "accounting.voucher.updated",
            VoucherEvent::VoucherSubmitted(_) => "accounting.voucher.submitted",
            VoucherEvent::VoucherApproved(_) => "accounting.voucher.approved",
            VoucherEvent::VoucherRejected(_) => "accounting.voucher.rejected",
            VoucherEvent::VoucherReopened(_) => "accounting.voucher.reopened",
            VoucherEvent::VoucherPosted(_) => "accounting.voucher.posted",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            VoucherEvent::VoucherCreated(e) => e.occurred_at,
            VoucherEvent::VoucherUpdated(e) => e.occurred_at,
            VoucherEvent::VoucherSubmitted(e)
            | VoucherEvent::VoucherApproved(e)
            | VoucherEvent::VoucherReopened(e) => e.occurred_at,
            VoucherEvent::VoucherRejected(e) => e.occurred_at,
            VoucherEvent::VoucherPosted(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Voucher {
    type Command = VoucherCommand;
    type Event = VoucherEvent;
    type Error = LedgerError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            VoucherEvent::VoucherCreated(e) => {
                self.id = e.voucher_id;
                self.tenant_id = Some(e.tenant_id);
                self.number = e.number;
                self.date = e.date;
                self.voucher_type = e.voucher_type.clone();
                self.description = e.description.clone();
                self.entries = e.entries.clone();
                self.created_by = Some(e.created_by);
                self.status = VoucherStatus::Draft;
                self.created = true;
            }
            VoucherEvent::VoucherUpdated(e) => {
                if let Some(number) = e.number {
                    self.number = number;
                }
                self.date = e.date;
                self.voucher_type = e.voucher_type.clone();
                self.description = e.description.clone();
                self.entries = e.entries.clone();
            }
            VoucherEvent::VoucherSubmitted(_) => {
                self.status = VoucherStatus::Pending;
                self.rejection_reason = None;
            }
            VoucherEvent::VoucherApproved(e) => {
                self.status = VoucherStatus::Approved;
                self.approved_by = Some(e.actor);
            }
            VoucherEvent::VoucherRejected(e) => {
                self.status = VoucherStatus::Rejected;
                self.rejection_reason = Some(e.reason.clone());
            }
            VoucherEvent::VoucherReopened(_) => {
                self.status = VoucherStatus::Draft;
                self.approved_by = None;
            }
            VoucherEvent::VoucherPosted(e) => {
                self.status = VoucherStatus::Posted;
                self.posted_by = Some(e.posted_by);
                self.posted_at = Some(e.occurred_at);
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            VoucherCommand::Create(cmd) => self.handle_create(cmd),
            VoucherCommand::UpdateDraft(cmd) => self.handle_update(cmd),
            VoucherCommand::Submit(cmd) => self.handle_submit(cmd),
            VoucherCommand::Approve(cmd) => self.handle_approve(cmd),
            VoucherCommand::Reject(cmd) => self.handle_reject(cmd),
            VoucherCommand::Reopen(cmd) => self.handle_reopen(cmd),
            VoucherCommand::Post(cmd) => self.handle_post(cmd),
        }
    }
}

impl Voucher {
    fn ensure_target(&self, tenant_id: TenantId, voucher_id: VoucherId) -> LedgerResult<()> {
        // A voucher of another tenant is indistinguishable from a missing one.
        if !self.created || self.tenant_id != Some(tenant_id) || self.id != voucher_id {
            return Err(LedgerError::not_found(format!("voucher {voucher_id}")));
        }
        Ok(())
    }

    fn ensure_transition(&self, to: VoucherStatus) -> LedgerResult<()> {
        if self.status == VoucherStatus::Posted && to == VoucherStatus::Posted {
            return Err(StateError::AlreadyPosted.into());
        }
        if !self.status.can_transition_to(to) {
            return Err(StateError::InvalidTransition {
                from: self.status.as_str(),
                to: to.as_str(),
            }
            .into());
        }
        Ok(())
    }

    fn transitioned(cmd: &Transition) -> VoucherTransitioned {
        VoucherTransitioned {
            tenant_id: cmd.tenant_id,
            voucher_id: cmd.voucher_id,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        }
    }

    fn handle_create(&self, cmd: &CreateVoucher) -> LedgerResult<Vec<VoucherEvent>> {
        if self.created {
            return Err(StateError::AlreadyExists.into());
        }
        let entries = number_entries(&cmd.entries)?;

        Ok(vec![VoucherEvent::VoucherCreated(VoucherCreated {
            tenant_id: cmd.tenant_id,
            voucher_id: cmd.voucher_id,
            number: cmd.number,
            date: cmd.date,
            voucher_type: cmd.voucher_type.clone(),
            description: cmd.description.clone(),
            entries,
            created_by: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_update(&self, cmd: &UpdateDraft) -> LedgerResult<Vec<VoucherEvent>> {
        self.ensure_target(cmd.tenant_id, cmd.voucher_id)?;
        if !self.status.is_editable() {
            return Err(StateError::NotEditable(self.status.as_str()).into());
        }

        let entries = match &cmd.entries {
            Some(inputs) => number_entries(inputs)?,
            None => self.entries.clone(),
        };
        let date = cmd.date.unwrap_or(self.date);
        let number = if date.year() == self.number.year {
            None
        } else {
            match cmd.number {
                Some(number) if number.year == date.year() => Some(number),
                _ => {
                    return Err(ValidationError::NumberYearMismatch {
                        number_year: cmd.number.map_or(self.number.year, |n| n.year),
                        date_year: date.year(),
                    }
                    .into());
                }
            }
        };

        let mut events = Vec::with_capacity(2);
        // Editing a rejected voucher puts it back into draft.
        if self.status == VoucherStatus::Rejected {
            events.push(VoucherEvent::VoucherReopened(VoucherTransitioned {
                tenant_id: cmd.tenant_id,
                voucher_id: cmd.voucher_id,
                actor: cmd.actor,
                occurred_at: cmd.occurred_at,
            }));
        }
        events.push(VoucherEvent::VoucherUpdated(VoucherUpdated {
            tenant_id: cmd.tenant_id,
            voucher_id: cmd.voucher_id,
            date,
            voucher_type: cmd
                .voucher_type
                .clone()
                .unwrap_or_else(|| self.voucher_type.clone()),
            description: cmd.description.clone().or_else(|| self.description.clone()),
            entries,
            number,
            updated_by: cmd.actor,
            occurred_at: cmd.occurred_at,
        }));
        Ok(events)
    }

    fn handle_submit(&self, cmd: &Transition) -> LedgerResult<Vec<VoucherEvent>> {
        self.ensure_target(cmd.tenant_id, cmd.voucher_id)?;
        self.ensure_transition(VoucherStatus::Pending)?;
        validate_entries(&self.entries)?;
        Ok(vec![VoucherEvent::VoucherSubmitted(Self::transitioned(cmd))])
    }

    fn handle_approve(&self, cmd: &Transition) -> LedgerResult<Vec<VoucherEvent>> {
        self.ensure_target(cmd.tenant_id, cmd.voucher_id)?;
        self.ensure_transition(VoucherStatus::Approved)?;
        validate_entries(&self.entries)?;
        Ok(vec![VoucherEvent::VoucherApproved(Self::transitioned(cmd))])
    }

    fn handle_reject(&self, cmd: &RejectVoucher) -> LedgerResult<Vec<VoucherEvent>> {
        self.ensure_target(cmd.tenant_id, cmd.voucher_id)?;
        self.ensure_transition(VoucherStatus::Rejected)?;
        let reason = cmd.reason.trim();
        if reason.is_empty() {
            return Err(ValidationError::EmptyField("reason").into());
        }
        Ok(vec![VoucherEvent::VoucherRejected(VoucherRejected {
            tenant_id: cmd.tenant_id,
            voucher_id: cmd.voucher_id,
            reason: reason.to_string(),
            rejected_by: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_reopen(&self, cmd: &Transition) -> LedgerResult<Vec<VoucherEvent>> {
        self.ensure_target(cmd.tenant_id, cmd.voucher_id)?;
        self.ensure_transition(VoucherStatus::Draft)?;
        Ok(vec![VoucherEvent::VoucherReopened(Self::transitioned(cmd))])
    }

    fn handle_post(&self, cmd: &Transition) -> LedgerResult<Vec<VoucherEvent>> {
        self.ensure_target(cmd.tenant_id, cmd.voucher_id)?;
        self.ensure_transition(VoucherStatus::Posted)?;
        validate_entries(&self.entries)?;
        Ok(vec![VoucherEvent::VoucherPosted(VoucherPosted {
            tenant_id: cmd.tenant_id,
            voucher_id: cmd.voucher_id,
            period: self.period(),
            posted_by: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    struct Fixture {
        tenant_id: TenantId,
        voucher_id: VoucherId,
        actor: UserId,
        cash: AccountId,
        sales: AccountId,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                tenant_id: TenantId::new(),
                voucher_id: VoucherId::generate(),
                actor: UserId::new(),
                cash: AccountId::new(),
                sales: AccountId::new(),
            }
        }

        fn create(&self, entries: Vec<EntryInput>) -> Voucher {
            let cmd = VoucherCommand::Create(CreateVoucher {
                tenant_id: self.tenant_id,
                voucher_id: self.voucher_id,
                number: VoucherNumber::new(2026, 1),
                date: NaiveDate::from_ymd_opt(2026, 1, 5).unwrap(),
                voucher_type: VoucherType::General,
                description: Some("cash sale".into()),
                entries,
                actor: self.actor,
                occurred_at: Utc::now(),
            });
            Voucher::empty(self.voucher_id).execute(&cmd).unwrap().0
        }

        fn transition(&self) -> Transition {
            Transition {
                tenant_id: self.tenant_id,
                voucher_id: self.voucher_id,
                actor: self.actor,
                occurred_at: Utc::now(),
            }
        }

        fn balanced(&self, amount: i64) -> Vec<EntryInput> {
            vec![
                EntryInput::debit(self.cash, amount),
                EntryInput::credit(self.sales, amount),
            ]
        }
    }

    fn step(v: &Voucher, cmd: VoucherCommand) -> LedgerResult<Voucher> {
        v.execute(&cmd).map(|(next, _)| next)
    }

    #[test]
    fn full_lifecycle_reaches_posted() {
        let fx = Fixture::new();
        let v = fx.create(fx.balanced(1000));
        assert_eq!(v.status(), VoucherStatus::Draft);
        assert_eq!(v.entries()[1].line_no, 2);

        let v = step(&v, VoucherCommand::Submit(fx.transition())).unwrap();
        assert_eq!(v.status(), VoucherStatus::Pending);
        let v = step(&v, VoucherCommand::Approve(fx.transition())).unwrap();
        assert_eq!(v.approved_by(), Some(fx.actor));
        let (v, events) = v.execute(&VoucherCommand::Post(fx.transition())).unwrap();
        assert_eq!(v.status(), VoucherStatus::Posted);
        assert_eq!(v.version(), 4);
        match &events[0] {
            VoucherEvent::VoucherPosted(e) => {
                assert_eq!(e.period, FiscalPeriod::new(2026, 1).unwrap())
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn unbalanced_voucher_never_reaches_pending() {
        let fx = Fixture::new();
        let v = fx.create(vec![
            EntryInput::debit(fx.cash, 1000),
            EntryInput::credit(fx.sales, 900),
        ]);
        let err = step(&v, VoucherCommand::Submit(fx.transition())).unwrap_err();
        assert_eq!(
            err,
            ValidationError::VoucherUnbalanced {
                debit_total: 1000,
                credit_total: 900
            }
            .into()
        );
    }

    #[test]
    fn entry_with_both_sides_is_malformed() {
        let fx = Fixture::new();
        let mut entries = fx.balanced(500);
        entries[0].credit = 500;
        let v = fx.create(entries);
        let err = step(&v, VoucherCommand::Submit(fx.transition())).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Validation(ValidationError::MalformedEntry { line: 1, .. })
        ));
    }

    #[test]
    fn zero_line_and_empty_voucher_are_rejected() {
        let fx = Fixture::new();
        let v = fx.create(vec![]);
        assert_eq!(
            step(&v, VoucherCommand::Submit(fx.transition())).unwrap_err(),
            ValidationError::EmptyVoucher.into()
        );

        let fx = Fixture::new();
        let mut entries = fx.balanced(100);
        entries.push(EntryInput::debit(fx.cash, 0));
        let v = fx.create(entries);
        assert!(matches!(
            step(&v, VoucherCommand::Submit(fx.transition())).unwrap_err(),
            LedgerError::Validation(ValidationError::MalformedEntry { line: 3, .. })
        ));
    }

    #[test]
    fn negative_amounts_are_refused_even_in_draft() {
        let fx = Fixture::new();
        let cmd = VoucherCommand::Create(CreateVoucher {
            tenant_id: fx.tenant_id,
            voucher_id: fx.voucher_id,
            number: VoucherNumber::new(2026, 1),
            date: NaiveDate::from_ymd_opt(2026, 1, 5).unwrap(),
            voucher_type: VoucherType::General,
            description: None,
            entries: vec![EntryInput::debit(fx.cash, -5)],
            actor: fx.actor,
            occurred_at: Utc::now(),
        });
        assert!(Voucher::empty(fx.voucher_id).handle(&cmd).is_err());
    }

    #[test]
    fn non_adjacent_transitions_fail() {
        let fx = Fixture::new();
        let v = fx.create(fx.balanced(100));
        assert_eq!(
            step(&v, VoucherCommand::Post(fx.transition())).unwrap_err(),
            StateError::InvalidTransition {
                from: "draft",
                to: "posted"
            }
            .into()
        );
        assert_eq!(
            step(&v, VoucherCommand::Approve(fx.transition())).unwrap_err(),
            StateError::InvalidTransition {
                from: "draft",
                to: "approved"
            }
            .into()
        );
    }

    #[test]
    fn posting_twice_is_rejected() {
        let fx = Fixture::new();
        let mut v = fx.create(fx.balanced(100));
        for cmd in [
            VoucherCommand::Submit(fx.transition()),
            VoucherCommand::Approve(fx.transition()),
            VoucherCommand::Post(fx.transition()),
        ] {
            v = step(&v, cmd).unwrap();
        }
        assert_eq!(
            step(&v, VoucherCommand::Post(fx.transition())).unwrap_err(),
            StateError::AlreadyPosted.into()
        );
    }

    #[test]
    fn moving_the_date_across_years_needs_a_number_of_that_year() {
        let fx = Fixture::new();
        let v = fx.create(fx.balanced(100));
        let edit = |number: Option<VoucherNumber>| {
            VoucherCommand::UpdateDraft(UpdateDraft {
                tenant_id: fx.tenant_id,
                voucher_id: fx.voucher_id,
                date: Some(NaiveDate::from_ymd_opt(2025, 12, 31).unwrap()),
                voucher_type: None,
                description: None,
                entries: None,
                number,
                actor: fx.actor,
                occurred_at: Utc::now(),
            })
        };

        assert_eq!(
            step(&v, edit(None)).unwrap_err(),
            ValidationError::NumberYearMismatch {
                number_year: 2026,
                date_year: 2025
            }
            .into()
        );
        assert!(step(&v, edit(Some(VoucherNumber::new(2026, 7)))).is_err());

        let moved = step(&v, edit(Some(VoucherNumber::new(2025, 3)))).unwrap();
        assert_eq!(moved.number(), VoucherNumber::new(2025, 3));
        assert_eq!(moved.period(), FiscalPeriod::new(2025, 12).unwrap());

        // Same-year edits keep the number.
        let same_year = VoucherCommand::UpdateDraft(UpdateDraft {
            tenant_id: fx.tenant_id,
            voucher_id: fx.voucher_id,
            date: Some(NaiveDate::from_ymd_opt(2026, 3, 1).unwrap()),
            voucher_type: None,
            description: None,
            entries: None,
            number: None,
            actor: fx.actor,
            occurred_at: Utc::now(),
        });
        assert_eq!(step(&v, same_year).unwrap().number(), VoucherNumber::new(2026, 1));
    }

    #[test]
    fn rejected_voucher_is_editable_and_returns_to_draft() {
        let fx = Fixture::new();
        let v = fx.create(fx.balanced(100));
        let v = step(&v, VoucherCommand::Submit(fx.transition())).unwrap();

        let edit = VoucherCommand::UpdateDraft(UpdateDraft {
            tenant_id: fx.tenant_id,
            voucher_id: fx.voucher_id,
            date: None,
            voucher_type: None,
            description: None,
            entries: Some(fx.balanced(250)),
            number: None,
            actor: fx.actor,
            occurred_at: Utc::now(),
        });
        assert_eq!(
            step(&v, edit.clone()).unwrap_err(),
            StateError::NotEditable("pending").into()
        );

        let blank_reason = VoucherCommand::Reject(RejectVoucher {
            tenant_id: fx.tenant_id,
            voucher_id: fx.voucher_id,
            reason: "  ".into(),
            actor: fx.actor,
            occurred_at: Utc::now(),
        });
        assert!(step(&v, blank_reason).is_err());

        let v = step(
            &v,
            VoucherCommand::Reject(RejectVoucher {
                tenant_id: fx.tenant_id,
                voucher_id: fx.voucher_id,
                reason: "wrong amount".into(),
                actor: fx.actor,
                occurred_at: Utc::now(),
            }),
        )
        .unwrap();
        assert_eq!(v.rejection_reason(), Some("wrong amount"));

        let (v, events) = v.execute(&edit).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(v.status(), VoucherStatus::Draft);
        assert_eq!(v.totals().debit, 250);

        let v = step(&v, VoucherCommand::Submit(fx.transition())).unwrap();
        assert_eq!(v.status(), VoucherStatus::Pending);
        assert_eq!(v.rejection_reason(), None);
    }

    #[test]
    fn other_tenant_sees_not_found() {
        let fx = Fixture::new();
        let v = fx.create(fx.balanced(100));
        let mut t = fx.transition();
        t.tenant_id = TenantId::new();
        assert!(matches!(
            step(&v, VoucherCommand::Submit(t)).unwrap_err(),
            LedgerError::NotFound(_)
        ));
    }

    #[test]
    fn deltas_group_lines_by_account() {
        let fx = Fixture::new();
        let v = fx.create(vec![
            EntryInput::debit(fx.cash, 300),
            EntryInput::debit(fx.cash, 700),
            EntryInput::credit(fx.sales, 1000),
        ]);
        let deltas = v.deltas().unwrap();
        assert_eq!(deltas.len(), 2);
        let cash = deltas.iter().find(|d| d.account_id == fx.cash).unwrap();
        assert_eq!((cash.debit, cash.credit), (1000, 0));
        assert_eq!(v.account_ids().len(), 2);
    }

    #[test]
    fn voucher_number_renders_zero_padded() {
        assert_eq!(VoucherNumber::new(2026, 42).to_string(), "2026-000042");
        assert!(VoucherNumber::new(2026, 9) < VoucherNumber::new(2026, 10));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: whenever a voucher leaves draft, its debits equal its credits.
        #[test]
        fn submitted_vouchers_are_balanced(
            lines in prop::collection::vec((0i64..1_000_000i64, any::<bool>()), 1..12)
        ) {
            let fx = Fixture::new();
            let entries = lines
                .iter()
                .map(|(amount, is_debit)| {
                    if *is_debit {
                        EntryInput::debit(fx.cash, *amount)
                    } else {
                        EntryInput::credit(fx.sales, *amount)
                    }
                })
                .collect();
            let v = fx.create(entries);

            match step(&v, VoucherCommand::Submit(fx.transition())) {
                Ok(submitted) => {
                    prop_assert!(submitted.status().requires_balance());
                    let totals = submitted.totals();
                    prop_assert_eq!(totals.debit, totals.credit);
                }
                Err(LedgerError::Validation(_)) => {
                    prop_assert_eq!(v.status(), VoucherStatus::Draft);
                }
                Err(other) => prop_assert!(false, "unexpected error {:?}", other),
            }
        }
    }
}
