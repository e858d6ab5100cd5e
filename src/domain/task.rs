use super::account::AccountId;
use super::ledger::{EntryId, LedgerEntry};
use super::money::Amount;
use crate::error::{LedgerError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Task kind under which transfer settlements travel through the queue.
pub const TASK_TRANSFER: &str = "task:transfer";

/// Payload of a transfer settlement task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferTask {
    pub transaction_id: EntryId,
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: Amount,
}

impl TransferTask {
    /// The settlement task for a pending transfer debit entry.
    pub fn for_entry(entry: &LedgerEntry) -> Result<Self> {
        let to_account_id = entry
            .counterparty_account_id
            .clone()
            .filter(|_| entry.is_transfer_debit())
            .ok_or_else(|| {
                LedgerError::invalid(format!("entry {} is not a transfer debit", entry.id))
            })?;
        Ok(Self {
            transaction_id: entry.id,
            from_account_id: entry.account_id.clone(),
            to_account_id,
            amount: entry.amount,
        })
    }

    /// Whether `entry` is the debit this task settles.
    pub fn matches(&self, entry: &LedgerEntry) -> bool {
        entry.id == self.transaction_id
            && entry.is_transfer_debit()
            && entry.account_id == self.from_account_id
            && entry.counterparty_account_id.as_ref() == Some(&self.to_account_id)
            && entry.amount == self.amount
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Envelope stored by a queue backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedTask {
    pub id: TaskId,
    pub kind: String,
    pub payload: serde_json::Value,
    /// Deliveries so far; a backend increments it on every reservation.
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedTask {
    pub fn transfer(task: &TransferTask) -> Result<Self> {
        Ok(Self {
            id: TaskId::new(),
            kind: TASK_TRANSFER.to_string(),
            payload: serde_json::to_value(task)?,
            attempt: 0,
            enqueued_at: Utc::now(),
        })
    }

    pub fn decode_transfer(&self) -> Result<TransferTask> {
        if self.kind != TASK_TRANSFER {
            return Err(LedgerError::invalid(format!(
                "unexpected task kind: {}",
                self.kind
            )));
        }
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// A task the queue gave up on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub task: QueuedTask,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(task: QueuedTask, reason: String) -> Self {
        Self {
            task,
            reason,
            dead_lettered_at: Utc::now(),
        }
    }
}
