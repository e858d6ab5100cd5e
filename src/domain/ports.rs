use super::account::{Account, AccountId, BalanceChange, MutationKey};
use super::ledger::{EntryId, EntryStatus, LedgerEntry, Transition};
use super::money::Delta;
use super::task::{DeadLetter, QueuedTask, TaskId};
use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Registers a new account. Fails with `AccountExists` if the id is taken.
    async fn insert(&self, account: Account) -> Result<()>;
    async fn get(&self, id: &AccountId) -> Result<Option<Account>>;
    async fn all(&self) -> Result<Vec<Account>>;

    /// Atomically applies `delta` to the balance, refusing to go below zero.
    ///
    /// With a key, the change is recorded under it; a key that was already applied returns
    /// the recorded change with `replayed` set and leaves the balance alone. Without a key
    /// nothing is recorded.
    async fn apply_delta(
        &self,
        id: &AccountId,
        delta: Delta,
        key: Option<&MutationKey>,
    ) -> Result<BalanceChange>;
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn create(&self, entry: LedgerEntry) -> Result<()>;
    async fn get(&self, id: EntryId) -> Result<Option<LedgerEntry>>;
    /// Entries of one account, newest first.
    async fn list_by_account(&self, account: &AccountId) -> Result<Vec<LedgerEntry>>;
    async fn list_by_status(&self, status: EntryStatus) -> Result<Vec<LedgerEntry>>;
    async fn find_by_reference(&self, reference: EntryId) -> Result<Option<LedgerEntry>>;

    /// Compare-and-swap on the status field. Fails with `TransactionNotFound` for unknown ids.
    async fn update_status(
        &self,
        id: EntryId,
        expected: EntryStatus,
        next: EntryStatus,
    ) -> Result<Transition>;
}

/// Storage side of the task queue.
///
/// Reserved tasks stay invisible until acked, released, dead-lettered, or until their
/// visibility window lapses, after which `reserve` hands them out again.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    async fn push(&self, task: QueuedTask) -> Result<()>;
    async fn reserve(&self, visibility: Duration) -> Result<Option<QueuedTask>>;
    async fn ack(&self, id: TaskId) -> Result<()>;
    /// Returns a reserved task to the queue, deliverable again after `delay`.
    async fn release(&self, id: TaskId, delay: Duration) -> Result<()>;
    async fn dead_letter(&self, id: TaskId, reason: String) -> Result<()>;
    async fn dead_letters(&self) -> Result<Vec<DeadLetter>>;
    /// Tasks not yet acked or dead-lettered.
    async fn depth(&self) -> Result<usize>;
}

pub type AccountStoreBox = Box<dyn AccountStore>;
pub type LedgerStoreBox = Box<dyn LedgerStore>;
pub type QueueBackendBox = Box<dyn QueueBackend>;
