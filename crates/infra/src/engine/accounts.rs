//! Account directory operations. Writes require the admin role.
//!
//! Every write reaches the account store, when one is configured, before the
//! in-memory chart changes; a failed write-through leaves the chart as it was.

use chrono::Utc;
use tracing::{info, instrument};

use forgeledger_accounting::{Account, AccountTreeNode, FlatAccount, NewAccount};
use forgeledger_auth::{Actor, Role};
use forgeledger_core::{AccountId, LedgerResult};

use super::LedgerEngine;

impl LedgerEngine {
    #[instrument(skip_all, fields(tenant_id = %actor.tenant_id, user_id = %actor.user_id, code = %input.code))]
    pub fn create_account(&self, actor: &Actor, input: NewAccount) -> LedgerResult<Account> {
        self.require(actor, &Role::admin())?;
        let account = self.directory.create(actor.tenant_id, input, Utc::now(), |account| {
            self.persist_account(account)
        })?;
        info!(account_id = %account.id, "account created");
        Ok(account)
    }

    #[instrument(skip_all, fields(tenant_id = %actor.tenant_id, account_id = %account_id))]
    pub fn move_account(
        &self,
        actor: &Actor,
        account_id: AccountId,
        new_parent: Option<AccountId>,
    ) -> LedgerResult<Account> {
        self.require(actor, &Role::admin())?;
        let account = self
            .directory
            .move_account(actor.tenant_id, account_id, new_parent, |account| {
                self.persist_account(account)
            })?;
        info!(parent_id = ?new_parent, "account moved");
        Ok(account)
    }

    /// Refused while the account's latest balance row is non-zero.
    ///
    /// Runs under the chart write lock, so no posting to this account can
    /// interleave between the balance check and the flag change.
    #[instrument(skip_all, fields(tenant_id = %actor.tenant_id, account_id = %account_id))]
    pub fn deactivate_account(&self, actor: &Actor, account_id: AccountId) -> LedgerResult<Account> {
        self.require(actor, &Role::admin())?;
        let tenant_id = actor.tenant_id;
        let account = self.directory.with_chart_mut(tenant_id, |chart| {
            let open_balance = self
                .store
                .latest_balance(tenant_id, account_id)?
                .is_some_and(|row| row.balance != 0);
            let account = chart.deactivate(account_id, open_balance)?;
            self.persist_account(&account)?;
            Ok(account)
        })?;
        info!("account deactivated");
        Ok(account)
    }

    #[instrument(skip_all, fields(tenant_id = %actor.tenant_id, account_id = %account_id))]
    pub fn reactivate_account(&self, actor: &Actor, account_id: AccountId) -> LedgerResult<Account> {
        self.require(actor, &Role::admin())?;
        self.directory.with_chart_mut(actor.tenant_id, |chart| {
            let account = chart.reactivate(account_id)?;
            self.persist_account(&account)?;
            Ok(account)
        })
    }

    #[instrument(skip_all, fields(tenant_id = %actor.tenant_id, account_id = %account_id))]
    pub fn rename_account(
        &self,
        actor: &Actor,
        account_id: AccountId,
        name: &str,
    ) -> LedgerResult<Account> {
        self.require(actor, &Role::admin())?;
        self.directory.with_chart_mut(actor.tenant_id, |chart| {
            let account = chart.rename(account_id, name)?;
            self.persist_account(&account)?;
            Ok(account)
        })
    }

    #[instrument(skip_all, fields(tenant_id = %actor.tenant_id, account_id = %account_id))]
    pub fn change_account_code(
        &self,
        actor: &Actor,
        account_id: AccountId,
        code: &str,
    ) -> LedgerResult<Account> {
        self.require(actor, &Role::admin())?;
        let tenant_id = actor.tenant_id;
        let account = self.directory.with_chart_mut(tenant_id, |chart| {
            let referenced = self.store.account_is_referenced(tenant_id, account_id)?;
            let account = chart.change_code(account_id, code, referenced)?;
            self.persist_account(&account)?;
            Ok(account)
        })?;
        info!(code = %account.code, "account code changed");
        Ok(account)
    }

    #[instrument(skip_all, fields(tenant_id = %actor.tenant_id, account_id = %account_id))]
    pub fn delete_account(&self, actor: &Actor, account_id: AccountId) -> LedgerResult<Account> {
        self.require(actor, &Role::admin())?;
        let tenant_id = actor.tenant_id;
        let removed = self.directory.remove(
            tenant_id,
            account_id,
            || self.store.account_is_referenced(tenant_id, account_id),
            |_| match &self.account_store {
                Some(store) => store.delete_account(tenant_id, account_id),
                None => Ok(()),
            },
        )?;
        info!(code = %removed.code, "account deleted");
        Ok(removed)
    }

    pub fn get_account(&self, actor: &Actor, account_id: AccountId) -> LedgerResult<Account> {
        self.directory.get(actor.tenant_id, account_id)
    }

    pub fn account_tree(&self, actor: &Actor) -> LedgerResult<Vec<AccountTreeNode>> {
        self.directory.with_chart(actor.tenant_id, |chart| Ok(chart.tree()))
    }

    pub fn accounts_flat(&self, actor: &Actor) -> LedgerResult<Vec<FlatAccount>> {
        self.directory.with_chart(actor.tenant_id, |chart| Ok(chart.flatten()))
    }
}
