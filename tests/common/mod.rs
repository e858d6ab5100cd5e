#![allow(dead_code)]

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wallet_ledger::application::ledger::LedgerService;
use wallet_ledger::application::queue::TaskQueue;
use wallet_ledger::config::QueueConfig;
use wallet_ledger::domain::account::{Account, AccountId, BalanceChange, MutationKey};
use wallet_ledger::domain::ledger::{EntryId, LedgerEntry};
use wallet_ledger::domain::money::Delta;
use wallet_ledger::domain::ports::{AccountStore, QueueBackend};
use wallet_ledger::domain::task::{DeadLetter, QueuedTask, TaskId};
use wallet_ledger::error::{LedgerError, Result};
use wallet_ledger::infrastructure::in_memory::{
    InMemoryAccountStore, InMemoryLedgerStore, InMemoryQueueBackend,
};

/// Switches shared between a test and the fault-injecting stores.
#[derive(Default)]
pub struct Faults {
    broken_accounts: Mutex<HashSet<AccountId>>,
    broken_push: AtomicBool,
}

impl Faults {
    /// Balance writes on `account` fail with a persistence error until healed.
    pub fn break_account(&self, account: &AccountId) {
        self.broken_accounts.lock().unwrap().insert(account.clone());
    }

    pub fn heal_account(&self, account: &AccountId) {
        self.broken_accounts.lock().unwrap().remove(account);
    }

    pub fn break_push(&self, broken: bool) {
        self.broken_push.store(broken, Ordering::SeqCst);
    }

    fn account_broken(&self, account: &AccountId) -> bool {
        self.broken_accounts.lock().unwrap().contains(account)
    }
}

fn injected(what: &str) -> LedgerError {
    LedgerError::persistence(std::io::Error::other(format!("injected {what} failure")))
}

pub struct FaultyAccountStore {
    inner: InMemoryAccountStore,
    faults: Arc<Faults>,
}

#[async_trait]
impl AccountStore for FaultyAccountStore {
    async fn insert(&self, account: Account) -> Result<()> {
        self.inner.insert(account).await
    }

    async fn get(&self, id: &AccountId) -> Result<Option<Account>> {
        self.inner.get(id).await
    }

    async fn all(&self) -> Result<Vec<Account>> {
        self.inner.all().await
    }

    async fn apply_delta(
        &self,
        id: &AccountId,
        delta: Delta,
        key: Option<&MutationKey>,
    ) -> Result<BalanceChange> {
        if self.faults.account_broken(id) {
            return Err(injected("balance write"));
        }
        self.inner.apply_delta(id, delta, key).await
    }
}

pub struct FaultyQueueBackend {
    inner: InMemoryQueueBackend,
    faults: Arc<Faults>,
}

#[async_trait]
impl QueueBackend for FaultyQueueBackend {
    async fn push(&self, task: QueuedTask) -> Result<()> {
        if self.faults.broken_push.load(Ordering::SeqCst) {
            return Err(injected("push"));
        }
        self.inner.push(task).await
    }

    async fn reserve(&self, visibility: Duration) -> Result<Option<QueuedTask>> {
        self.inner.reserve(visibility).await
    }

    async fn ack(&self, id: TaskId) -> Result<()> {
        self.inner.ack(id).await
    }

    async fn release(&self, id: TaskId, delay: Duration) -> Result<()> {
        self.inner.release(id, delay).await
    }

    async fn dead_letter(&self, id: TaskId, reason: String) -> Result<()> {
        self.inner.dead_letter(id, reason).await
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        self.inner.dead_letters().await
    }

    async fn depth(&self) -> Result<usize> {
        self.inner.depth().await
    }
}

pub struct Harness {
    pub ledger: Arc<LedgerService>,
    pub queue: Arc<TaskQueue>,
    pub faults: Arc<Faults>,
}

/// Short backoff and polling so redelivery happens within a test's patience.
pub fn fast_config() -> QueueConfig {
    QueueConfig::default()
        .with_retry_backoff(Duration::from_millis(2))
        .with_poll_interval(Duration::from_millis(5))
        .with_max_attempts(50)
}

pub fn harness(config: QueueConfig) -> Harness {
    let faults = Arc::new(Faults::default());
    let queue = Arc::new(TaskQueue::new(
        Box::new(FaultyQueueBackend {
            inner: InMemoryQueueBackend::new(),
            faults: faults.clone(),
        }),
        config,
    ));
    let ledger = Arc::new(LedgerService::new(
        Box::new(FaultyAccountStore {
            inner: InMemoryAccountStore::new(),
            faults: faults.clone(),
        }),
        Box::new(InMemoryLedgerStore::new()),
        queue.clone(),
    ));
    Harness {
        ledger,
        queue,
        faults,
    }
}

pub fn id(raw: &str) -> AccountId {
    AccountId::parse(raw).unwrap()
}

/// Opens `raw` and tops it up with `amount` when positive.
pub async fn funded(ledger: &LedgerService, raw: &str, amount: Decimal) -> AccountId {
    let account = id(raw);
    ledger.open_account(account.clone()).await.unwrap();
    if amount > Decimal::ZERO {
        ledger.top_up(&account, amount).await.unwrap();
    }
    account
}

pub async fn balance(ledger: &LedgerService, account: &AccountId) -> Decimal {
    ledger.account(account).await.unwrap().balance.value()
}

pub async fn entry(ledger: &LedgerService, account: &AccountId, id: EntryId) -> LedgerEntry {
    ledger
        .list_transactions(account)
        .await
        .unwrap()
        .into_iter()
        .find(|entry| entry.id == id)
        .unwrap()
}
