use super::account::{AccountId, BalanceChange, MutationKey};
use super::money::{Amount, Balance, Delta};
use crate::error::LedgerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Reference type recorded on the credit side of a settled transfer.
pub const REFERENCE_TRANSFER: &str = "transfer";

/// Unique ledger entry identifier. UUIDv7, so ids sort by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub Uuid);

impl EntryId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Mutation key for the sender leg of a transfer settled from this entry.
    pub fn transfer_debit_key(&self) -> MutationKey {
        MutationKey::new(format!("{}:transfer:debit", self.0))
    }

    /// Mutation key for the recipient leg of a transfer settled from this entry.
    pub fn transfer_credit_key(&self) -> MutationKey {
        MutationKey::new(format!("{}:transfer:credit", self.0))
    }

    /// Mutation key for returning the sender leg of a transfer the recipient could not take.
    pub fn transfer_refund_key(&self) -> MutationKey {
        MutationKey::new(format!("{}:transfer:refund", self.0))
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntryType {
    Credit,
    Debit,
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryType::Credit => f.write_str("CREDIT"),
            EntryType::Debit => f.write_str("DEBIT"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Clone, Copy)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntryStatus {
    Pending,
    Success,
    Failed,
}

impl EntryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EntryStatus::Success | EntryStatus::Failed)
    }

    /// Only PENDING entries move, and only to a terminal status.
    pub fn can_transition_to(&self, next: EntryStatus) -> bool {
        *self == EntryStatus::Pending && next.is_terminal()
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryStatus::Pending => f.write_str("PENDING"),
            EntryStatus::Success => f.write_str("SUCCESS"),
            EntryStatus::Failed => f.write_str("FAILED"),
        }
    }
}

/// An immutable record of one balance-affecting event.
///
/// Only `status` and `updated_at` change after creation, and only through
/// [`LedgerEntry::transition`].
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub account_id: AccountId,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    pub status: EntryStatus,
    pub amount: Amount,
    pub remarks: String,
    pub balance_before: Balance,
    pub balance_after: Balance,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<EntryId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counterparty_account_id: Option<AccountId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LedgerEntry {
    fn base(
        id: EntryId,
        account_id: AccountId,
        entry_type: EntryType,
        status: EntryStatus,
        amount: Amount,
        remarks: String,
        (balance_before, balance_after): (Balance, Balance),
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            account_id,
            entry_type,
            status,
            amount,
            remarks,
            balance_before,
            balance_after,
            reference_id: None,
            reference_type: None,
            counterparty_account_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A settled entry recording a change that the account store has already applied.
    pub fn settled(
        id: EntryId,
        entry_type: EntryType,
        amount: Amount,
        remarks: impl Into<String>,
        change: &BalanceChange,
    ) -> Self {
        Self::base(
            id,
            change.account_id.clone(),
            entry_type,
            EntryStatus::Success,
            amount,
            remarks.into(),
            (change.before, change.after),
        )
    }

    /// The sender side of a transfer, recorded before anything moves.
    ///
    /// `balance_after` is the sender's balance once the debit settles.
    pub fn pending_transfer(
        from: AccountId,
        to: AccountId,
        amount: Amount,
        remarks: impl Into<String>,
        balance: Balance,
    ) -> Result<Self, LedgerError> {
        let after = balance
            .checked_add(Delta::debit(amount))
            .ok_or_else(|| LedgerError::BalanceOverflow(from.clone()))?;
        let mut entry = Self::base(
            EntryId::new(),
            from,
            EntryType::Debit,
            EntryStatus::Pending,
            amount,
            remarks.into(),
            (balance, after),
        );
        entry.counterparty_account_id = Some(to);
        Ok(entry)
    }

    /// The recipient side of a settled transfer, pointing back at the debit entry.
    pub fn transfer_credit(debit: &LedgerEntry, change: &BalanceChange) -> Self {
        let mut entry = Self::settled(
            EntryId::new(),
            EntryType::Credit,
            debit.amount,
            debit.remarks.clone(),
            change,
        );
        entry.reference_id = Some(debit.id);
        entry.reference_type = Some(REFERENCE_TRANSFER.to_string());
        entry
    }

    pub fn is_transfer_debit(&self) -> bool {
        self.entry_type == EntryType::Debit && self.counterparty_account_id.is_some()
    }

    /// Moves the entry to `next` if the status machine allows it.
    pub fn transition(&mut self, next: EntryStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.updated_at = Utc::now();
        true
    }
}

/// Result of a guarded status update.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The entry was in the expected status and now carries the new one.
    Applied(LedgerEntry),
    /// The entry was not in the expected status; nothing was written.
    Rejected { current: EntryStatus },
}

/// Newest first; ties broken by id, which is time ordered.
pub fn newest_first(entries: &mut [LedgerEntry]) {
    entries.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.id.cmp(&a.id))
    });
}
