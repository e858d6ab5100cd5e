use super::money::{Amount, Balance, Delta};
use crate::error::LedgerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

const MAX_ID_LEN: usize = 64;

/// Opaque account identifier.
///
/// Restricted to `[A-Za-z0-9_.:-]` so it can travel through CSV files, task payloads and
/// storage keys without escaping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccountId(String);

impl AccountId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, LedgerError> {
        let raw = raw.into();
        if raw.is_empty() || raw.len() > MAX_ID_LEN {
            return Err(LedgerError::invalid(format!(
                "account id must be 1..={MAX_ID_LEN} characters"
            )));
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-'))
        {
            return Err(LedgerError::invalid(format!("malformed account id: {raw}")));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for AccountId {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<AccountId> for String {
    fn from(id: AccountId) -> Self {
        id.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The stored state of a wallet account.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Account {
    pub id: AccountId,
    pub balance: Balance,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn new(id: AccountId) -> Self {
        let now = Utc::now();
        Self {
            id,
            balance: Balance::ZERO,
            created_at: now,
            updated_at: now,
        }
    }

    /// Applies a signed change, refusing any debit the balance does not cover.
    ///
    /// Stores call this under their write lock; on error the account is untouched.
    pub fn apply(&mut self, delta: Delta) -> Result<BalanceChange, LedgerError> {
        let before = self.balance;
        let after = before
            .checked_add(delta)
            .ok_or_else(|| LedgerError::BalanceOverflow(self.id.clone()))?;
        if after.is_negative() {
            return Err(LedgerError::InsufficientFunds {
                account: self.id.clone(),
                balance: before.value(),
                requested: delta.magnitude(),
            });
        }
        self.balance = after;
        self.updated_at = Utc::now();
        Ok(BalanceChange {
            account_id: self.id.clone(),
            before,
            after,
            replayed: false,
        })
    }

    pub fn ensure_covers(&self, amount: Amount) -> Result<(), LedgerError> {
        if self.balance.covers(amount) {
            Ok(())
        } else {
            Err(LedgerError::InsufficientFunds {
                account: self.id.clone(),
                balance: self.balance.value(),
                requested: amount.value(),
            })
        }
    }
}

/// Identifies one balance mutation so a store can recognise a repeated application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MutationKey(String);

impl MutationKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MutationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of an atomic balance mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceChange {
    pub account_id: AccountId,
    pub before: Balance,
    pub after: Balance,
    /// Set when the mutation key had already been applied and nothing changed this time.
    #[serde(default)]
    pub replayed: bool,
}

impl BalanceChange {
    pub fn into_replayed(self) -> Self {
        Self {
            replayed: true,
            ..self
        }
    }
}
