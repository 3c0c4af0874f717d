//! Chart of accounts for one tenant, stored as an arena of nodes.
//!
//! Parent links are `AccountId`s resolved through the arena index, never live
//! references, so re-parenting and cycle checks are plain id walks.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;

use forgeledger_core::{
    AccountId, LedgerError, LedgerResult, PolicyError, TenantId, ValidationError,
};

use crate::account::{Account, NewAccount};

/// Rooted tree view of the chart; children are ordered by code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountTreeNode {
    pub account: Account,
    pub children: Vec<AccountTreeNode>,
}

/// Flattened view entry: accounts ordered lexicographically by code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlatAccount {
    pub account: Account,
    pub depth: usize,
}

#[derive(Debug, Clone)]
pub struct ChartOfAccounts {
    tenant_id: TenantId,
    slots: Vec<Option<Account>>,
    index: HashMap<AccountId, usize>,
    codes: BTreeMap<String, usize>,
}

impl ChartOfAccounts {
    pub fn new(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            slots: Vec::new(),
            index: HashMap::new(),
            codes: BTreeMap::new(),
        }
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn get(&self, id: AccountId) -> Option<&Account> {
        self.index.get(&id).and_then(|&ix| self.slots[ix].as_ref())
    }

    pub fn by_code(&self, code: &str) -> Option<&Account> {
        self.codes.get(code).and_then(|&ix| self.slots[ix].as_ref())
    }

    /// All accounts ordered by code.
    pub fn accounts(&self) -> impl Iterator<Item = &Account> + '_ {
        self.codes.values().filter_map(|&ix| self.slots[ix].as_ref())
    }

    pub fn has_children(&self, id: AccountId) -> bool {
        self.accounts().any(|a| a.parent_id == Some(id))
    }

    /// Look up an account that vouchers may reference: must exist and be active.
    pub fn ensure_postable(&self, id: AccountId) -> LedgerResult<&Account> {
        let account = self
            .get(id)
            .ok_or_else(|| LedgerError::not_found(format!("account {id}")))?;
        if !account.active {
            return Err(PolicyError::AccountInactive(account.code.clone()).into());
        }
        Ok(account)
    }

    pub fn create(&mut self, input: NewAccount, now: DateTime<Utc>) -> LedgerResult<Account> {
        let code = input.code.trim().to_string();
        let name = input.name.trim().to_string();
        if code.is_empty() {
            return Err(ValidationError::EmptyField("code").into());
        }
        if name.is_empty() {
            return Err(ValidationError::EmptyField("name").into());
        }
        if self.codes.contains_key(&code) {
            return Err(ValidationError::DuplicateCode(code).into());
        }
        if let Some(parent_id) = input.parent_id {
            if self.get(parent_id).is_none() {
                return Err(ValidationError::InvalidParent(parent_id.to_string()).into());
            }
        }

        let account = Account {
            id: AccountId::new(),
            tenant_id: self.tenant_id,
            code: code.clone(),
            name,
            account_type: input.account_type,
            nature: input
                .nature
                .unwrap_or_else(|| input.account_type.default_nature()),
            parent_id: input.parent_id,
            active: true,
            created_at: now,
        };

        let ix = self.slots.len();
        self.slots.push(Some(account.clone()));
        self.index.insert(account.id, ix);
        self.codes.insert(code, ix);
        Ok(account)
    }

    /// Rebuild a chart from persisted accounts, in any order.
    pub fn restore(
        tenant_id: TenantId,
        accounts: impl IntoIterator<Item = Account>,
    ) -> LedgerResult<Self> {
        let mut chart = Self::new(tenant_id);
        for account in accounts {
            if account.tenant_id != tenant_id {
                return Err(PolicyError::CrossTenant.into());
            }
            if chart.codes.contains_key(&account.code) {
                return Err(ValidationError::DuplicateCode(account.code).into());
            }
            let ix = chart.slots.len();
            chart.index.insert(account.id, ix);
            chart.codes.insert(account.code.clone(), ix);
            chart.slots.push(Some(account));
        }
        if let Some(orphan) = chart
            .accounts()
            .find(|a| a.parent_id.is_some_and(|p| chart.get(p).is_none()))
        {
            return Err(ValidationError::InvalidParent(orphan.code.clone()).into());
        }
        Ok(chart)
    }

    /// Re-parent an account (`None` makes it a root).
    pub fn move_account(
        &mut self,
        id: AccountId,
        new_parent: Option<AccountId>,
    ) -> LedgerResult<Account> {
        self.require(id)?;

        if let Some(parent_id) = new_parent {
            if self.get(parent_id).is_none() {
                return Err(ValidationError::InvalidParent(parent_id.to_string()).into());
            }
            if self.is_ancestor_or_self(id, parent_id) {
                return Err(PolicyError::CycleDetected.into());
            }
        }

        self.update(id, |a| a.parent_id = new_parent)
    }

    /// Soft-deactivate. `has_open_balance` is supplied by the balance store.
    pub fn deactivate(&mut self, id: AccountId, has_open_balance: bool) -> LedgerResult<Account> {
        let account = self.require(id)?;
        if has_open_balance {
            return Err(PolicyError::HasOpenBalance(account.code.clone()).into());
        }
        self.update(id, |a| a.active = false)
    }

    pub fn reactivate(&mut self, id: AccountId) -> LedgerResult<Account> {
        self.require(id)?;
        self.update(id, |a| a.active = true)
    }

    pub fn rename(&mut self, id: AccountId, name: &str) -> LedgerResult<Account> {
        self.require(id)?;
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(ValidationError::EmptyField("name").into());
        }
        self.update(id, |a| a.name = name)
    }

    /// Change the code; refused once any voucher entry references the account.
    pub fn change_code(
        &mut self,
        id: AccountId,
        code: &str,
        referenced: bool,
    ) -> LedgerResult<Account> {
        let current = self.require(id)?.code.clone();
        if referenced {
            return Err(PolicyError::AccountReferenced(current).into());
        }
        let code = code.trim().to_string();
        if code.is_empty() {
            return Err(ValidationError::EmptyField("code").into());
        }
        if code == current {
            return self.require(id).cloned();
        }
        if self.codes.contains_key(&code) {
            return Err(ValidationError::DuplicateCode(code).into());
        }

        if let Some(ix) = self.codes.remove(&current) {
            self.codes.insert(code.clone(), ix);
        }
        self.update(id, |a| a.code = code)
    }

    /// Hard-delete an account that no entry references and no child hangs off.
    pub fn remove(&mut self, id: AccountId, referenced: bool) -> LedgerResult<Account> {
        let account = self.require(id)?.clone();
        if referenced {
            return Err(PolicyError::AccountReferenced(account.code).into());
        }
        if self.has_children(id) {
            return Err(PolicyError::HasChildren(account.code).into());
        }

        if let Some(ix) = self.index.remove(&id) {
            self.slots[ix] = None;
        }
        self.codes.remove(&account.code);
        Ok(account)
    }

    /// Full rooted forest; roots and children ordered by code.
    pub fn tree(&self) -> Vec<AccountTreeNode> {
        let mut children: HashMap<Option<AccountId>, Vec<&Account>> = HashMap::new();
        for account in self.accounts() {
            children.entry(account.parent_id).or_default().push(account);
        }

        fn build(
            account: &Account,
            children: &HashMap<Option<AccountId>, Vec<&Account>>,
        ) -> AccountTreeNode {
            let kids = children
                .get(&Some(account.id))
                .map(|list| list.iter().map(|c| build(c, children)).collect())
                .unwrap_or_default();
            AccountTreeNode {
                account: account.clone(),
                children: kids,
            }
        }

        children
            .get(&None)
            .map(|roots| roots.iter().map(|r| build(r, &children)).collect())
            .unwrap_or_default()
    }

    /// Accounts ordered lexicographically by code, each with its tree depth.
    pub fn flatten(&self) -> Vec<FlatAccount> {
        self.accounts()
            .map(|account| FlatAccount {
                account: account.clone(),
                depth: self.depth(account.id),
            })
            .collect()
    }

    fn depth(&self, id: AccountId) -> usize {
        let mut depth = 0;
        let mut cursor = self.get(id).and_then(|a| a.parent_id);
        while let Some(parent) = cursor {
            depth += 1;
            if depth > self.slots.len() {
                break;
            }
            cursor = self.get(parent).and_then(|a| a.parent_id);
        }
        depth
    }

    /// Whether `ancestor` is `node` itself or one of `node`'s ancestors.
    fn is_ancestor_or_self(&self, ancestor: AccountId, node: AccountId) -> bool {
        let mut cursor = Some(node);
        let mut steps = 0;
        while let Some(current) = cursor {
            if current == ancestor {
                return true;
            }
            steps += 1;
            if steps > self.slots.len() {
                return true;
            }
            cursor = self.get(current).and_then(|a| a.parent_id);
        }
        false
    }

    fn require(&self, id: AccountId) -> LedgerResult<&Account> {
        self.get(id)
            .ok_or_else(|| LedgerError::not_found(format!("account {id}")))
    }

    fn update(&mut self, id: AccountId, f: impl FnOnce(&mut Account)) -> LedgerResult<Account> {
        let ix = *self
            .index
            .get(&id)
            .ok_or_else(|| LedgerError::not_found(format!("account {id}")))?;
        let account = self.slots[ix]
            .as_mut()
            .ok_or_else(|| LedgerError::not_found(format!("account {id}")))?;
        f(account);
        Ok(account.clone())
    }
}
