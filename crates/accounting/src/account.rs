use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use forgeledger_core::{AccountId, LedgerError, TenantId, ValidationError};

/// High-level account type (determines the default normal balance side).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    Asset,
    Liability,
    Equity,
    Revenue,
    Expense,
}

impl AccountType {
    /// Nature implied by the type. Contra accounts override it explicitly.
    pub fn default_nature(self) -> AccountNature {
        match self {
            AccountType::Asset | AccountType::Expense => AccountNature::Debit,
            AccountType::Liability | AccountType::Equity | AccountType::Revenue => {
                AccountNature::Credit
            }
        }
    }

    /// Asset, liability and equity accounts appear on the balance sheet.
    pub fn is_balance_sheet(self) -> bool {
        matches!(
            self,
            AccountType::Asset | AccountType::Liability | AccountType::Equity
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AccountType::Asset => "asset",
            AccountType::Liability => "liability",
            AccountType::Equity => "equity",
            AccountType::Revenue => "revenue",
            AccountType::Expense => "expense",
        }
    }
}

impl core::str::FromStr for AccountType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asset" => Ok(AccountType::Asset),
            "liability" => Ok(AccountType::Liability),
            "equity" => Ok(AccountType::Equity),
            "revenue" => Ok(AccountType::Revenue),
            "expense" => Ok(AccountType::Expense),
            _ => Err(ValidationError::Other(
                "account type must be one of: asset, liability, equity, revenue, expense"
                    .to_string(),
            )
            .into()),
        }
    }
}

/// Normal balance side of an account; decides the sign of reported balances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountNature {
    Debit,
    Credit,
}

impl AccountNature {
    /// Signed balance for the given debit/credit totals.
    ///
    /// Debit-nature: `debit - credit`; credit-nature: `credit - debit`.
    pub fn signed(self, debit: i64, credit: i64) -> Option<i64> {
        match self {
            AccountNature::Debit => debit.checked_sub(credit),
            AccountNature::Credit => credit.checked_sub(debit),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AccountNature::Debit => "debit",
            AccountNature::Credit => "credit",
        }
    }
}

impl core::str::FromStr for AccountNature {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debit" => Ok(AccountNature::Debit),
            "credit" => Ok(AccountNature::Credit),
            _ => Err(ValidationError::Other("nature must be debit or credit".to_string()).into()),
        }
    }
}

/// Chart-of-accounts entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub tenant_id: TenantId,
    /// Unique per tenant, e.g. "1010".
    pub code: String,
    pub name: String,
    pub account_type: AccountType,
    pub nature: AccountNature,
    pub parent_id: Option<AccountId>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Input for creating an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAccount {
    pub code: String,
    pub name: String,
    pub account_type: AccountType,
    /// Overrides the type's default nature (contra accounts).
    #[serde(default)]
    pub nature: Option<AccountNature>,
    #[serde(default)]
    pub parent_id: Option<AccountId>,
}

impl NewAccount {
    pub fn new(code: impl Into<String>, name: impl Into<String>, account_type: AccountType) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
            account_type,
            nature: None,
            parent_id: None,
        }
    }

    pub fn under(mut self, parent_id: AccountId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn contra(mut self, nature: AccountNature) -> Self {
        self.nature = Some(nature);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_nature_follows_type() {
        assert_eq!(AccountType::Asset.default_nature(), AccountNature::Debit);
        assert_eq!(AccountType::Expense.default_nature(), AccountNature::Debit);
        assert_eq!(AccountType::Liability.default_nature(), AccountNature::Credit);
        assert_eq!(AccountType::Equity.default_nature(), AccountNature::Credit);
        assert_eq!(AccountType::Revenue.default_nature(), AccountNature::Credit);
    }

    #[test]
    fn signed_balance_follows_nature() {
        assert_eq!(AccountNature::Debit.signed(1000, 200), Some(800));
        assert_eq!(AccountNature::Credit.signed(200, 1000), Some(800));
        assert_eq!(AccountNature::Credit.signed(1000, 0), Some(-1000));
    }

    #[test]
    fn parses_type_case_insensitively() {
        assert_eq!("Revenue".parse::<AccountType>().unwrap(), AccountType::Revenue);
        assert!("income".parse::<AccountType>().is_err());
    }
}
