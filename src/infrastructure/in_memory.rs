use crate::config::MAX_QUEUE_DELAY;
use crate::domain::account::{Account, AccountId, BalanceChange, MutationKey};
use crate::domain::ledger::{newest_first, EntryId, EntryStatus, LedgerEntry, Transition};
use crate::domain::money::Delta;
use crate::domain::ports::{AccountStore, LedgerStore, QueueBackend};
use crate::domain::task::{DeadLetter, QueuedTask, TaskId};
use crate::error::{LedgerError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

#[derive(Default)]
struct AccountState {
    accounts: HashMap<AccountId, Account>,
    applied: HashMap<MutationKey, BalanceChange>,
}

/// A thread-safe in-memory store for accounts.
///
/// Balances and the record of applied mutation keys share one lock, so a delta and its
/// key are committed together.
#[derive(Default, Clone)]
pub struct InMemoryAccountStore {
    state: Arc<RwLock<AccountState>>,
}

impl InMemoryAccountStore {
    /// Creates a new, empty in-memory account store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn insert(&self, account: Account) -> Result<()> {
        let mut state = self.state.write().await;
        if state.accounts.contains_key(&account.id) {
            return Err(LedgerError::AccountExists(account.id));
        }
        state.accounts.insert(account.id.clone(), account);
        Ok(())
    }

    async fn get(&self, id: &AccountId) -> Result<Option<Account>> {
        let state = self.state.read().await;
        Ok(state.accounts.get(id).cloned())
    }

    async fn all(&self) -> Result<Vec<Account>> {
        let state = self.state.read().await;
        let mut accounts: Vec<Account> = state.accounts.values().cloned().collect();
        accounts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(accounts)
    }

    async fn apply_delta(
        &self,
        id: &AccountId,
        delta: Delta,
        key: Option<&MutationKey>,
    ) -> Result<BalanceChange> {
        let mut state = self.state.write().await;
        if let Some(previous) = key.and_then(|key| state.applied.get(key)) {
            return Ok(previous.clone().into_replayed());
        }
        let account = state
            .accounts
            .get_mut(id)
            .ok_or_else(|| LedgerError::AccountNotFound(id.clone()))?;
        let change = account.apply(delta)?;
        if let Some(key) = key {
            state.applied.insert(key.clone(), change.clone());
        }
        Ok(change)
    }
}

/// A thread-safe in-memory ledger.
#[derive(Default, Clone)]
pub struct InMemoryLedgerStore {
    entries: Arc<RwLock<HashMap<EntryId, LedgerEntry>>>,
}

impl InMemoryLedgerStore {
    /// Creates a new, empty in-memory ledger.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn create(&self, entry: LedgerEntry) -> Result<()> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&entry.id) {
            return Err(LedgerError::persistence(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("ledger entry {} already exists", entry.id),
            )));
        }
        entries.insert(entry.id, entry);
        Ok(())
    }

    async fn get(&self, id: EntryId) -> Result<Option<LedgerEntry>> {
        let entries = self.entries.read().await;
        Ok(entries.get(&id).cloned())
    }

    async fn list_by_account(&self, account: &AccountId) -> Result<Vec<LedgerEntry>> {
        let entries = self.entries.read().await;
        let mut found: Vec<LedgerEntry> = entries
            .values()
            .filter(|e| &e.account_id == account)
            .cloned()
            .collect();
        newest_first(&mut found);
        Ok(found)
    }

    async fn list_by_status(&self, status: EntryStatus) -> Result<Vec<LedgerEntry>> {
        let entries = self.entries.read().await;
        let mut found: Vec<LedgerEntry> = entries
            .values()
            .filter(|e| e.status == status)
            .cloned()
            .collect();
        newest_first(&mut found);
        Ok(found)
    }

    async fn find_by_reference(&self, reference: EntryId) -> Result<Option<LedgerEntry>> {
        let entries = self.entries.read().await;
        Ok(entries
            .values()
            .find(|e| e.reference_id == Some(reference))
            .cloned())
    }

    async fn update_status(
        &self,
        id: EntryId,
        expected: EntryStatus,
        next: EntryStatus,
    ) -> Result<Transition> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(&id)
            .ok_or(LedgerError::TransactionNotFound(id))?;
        if entry.status != expected || !entry.transition(next) {
            return Ok(Transition::Rejected {
                current: entry.status,
            });
        }
        Ok(Transition::Applied(entry.clone()))
    }
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<QueuedTask>,
    delayed: Vec<(Instant, QueuedTask)>,
    in_flight: HashMap<TaskId, (Instant, QueuedTask)>,
    dead: Vec<DeadLetter>,
}

impl QueueState {
    /// Moves due delayed tasks and lapsed reservations back to the ready list.
    fn promote(&mut self, now: Instant) {
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.delayed)
            .into_iter()
            .partition(|(at, _)| *at <= now);
        self.delayed = waiting;
        self.ready.extend(due.into_iter().map(|(_, task)| task));

        let lapsed: Vec<TaskId> = self
            .in_flight
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in lapsed {
            if let Some((_, task)) = self.in_flight.remove(&id) {
                self.ready.push_back(task);
            }
        }
    }

    fn take_in_flight(&mut self, id: TaskId) -> Result<QueuedTask> {
        self.in_flight
            .remove(&id)
            .map(|(_, task)| task)
            .ok_or_else(|| LedgerError::QueueUnavailable(format!("task {id} is not reserved")))
    }
}

/// Volatile queue backend with visibility timeouts and delayed redelivery.
///
/// Tasks are lost when the process exits; use the RocksDB backend for durability.
#[derive(Default, Clone)]
pub struct InMemoryQueueBackend {
    state: Arc<Mutex<QueueState>>,
}

impl InMemoryQueueBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueueBackend {
    async fn push(&self, task: QueuedTask) -> Result<()> {
        self.state.lock().await.ready.push_back(task);
        Ok(())
    }

    async fn reserve(&self, visibility: Duration) -> Result<Option<QueuedTask>> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.promote(now);
        let Some(mut task) = state.ready.pop_front() else {
            return Ok(None);
        };
        task.attempt += 1;
        state
            .in_flight
            .insert(task.id, (now + visibility.min(MAX_QUEUE_DELAY), task.clone()));
        Ok(Some(task))
    }

    async fn ack(&self, id: TaskId) -> Result<()> {
        self.state.lock().await.take_in_flight(id).map(|_| ())
    }

    async fn release(&self, id: TaskId, delay: Duration) -> Result<()> {
        let mut state = self.state.lock().await;
        let task = state.take_in_flight(id)?;
        if delay.is_zero() {
            state.ready.push_back(task);
        } else {
            state
                .delayed
                .push((Instant::now() + delay.min(MAX_QUEUE_DELAY), task));
        }
        Ok(())
    }

    async fn dead_letter(&self, id: TaskId, reason: String) -> Result<()> {
        let mut state = self.state.lock().await;
        let task = state.take_in_flight(id)?;
        state.dead.push(DeadLetter::new(task, reason));
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        Ok(self.state.lock().await.dead.clone())
    }

    async fn depth(&self) -> Result<usize> {
        let state = self.state.lock().await;
        Ok(state.ready.len() + state.delayed.len() + state.in_flight.len())
    }
}
