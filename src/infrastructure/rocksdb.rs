use crate::config::MAX_QUEUE_DELAY;
use crate::domain::account::{Account, AccountId, BalanceChange, MutationKey};
use crate::domain::ledger::{newest_first, EntryId, EntryStatus, LedgerEntry, Transition};
use crate::domain::money::Delta;
use crate::domain::ports::{AccountStore, LedgerStore, QueueBackend};
use crate::domain::task::{DeadLetter, QueuedTask, TaskId};
use crate::error::{LedgerError, Result};
use async_trait::async_trait;
use chrono::Utc;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, WriteBatch};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Column Family for account states.
pub const CF_ACCOUNTS: &str = "accounts";
/// Column Family for applied mutation keys and their recorded balance changes.
pub const CF_MUTATIONS: &str = "mutations";
/// Column Family for ledger entries keyed by entry id.
pub const CF_LEDGER: &str = "ledger";
/// Index: `account id ++ 0x00 ++ entry id` -> empty.
pub const CF_LEDGER_BY_ACCOUNT: &str = "ledger_by_account";
/// Index: referenced entry id -> referencing entry id.
pub const CF_LEDGER_REFS: &str = "ledger_refs";
/// Deliverable tasks keyed by `due millis ++ task id`, so iteration order is delivery order.
pub const CF_QUEUE_READY: &str = "queue_ready";
/// Reserved tasks keyed by task id.
pub const CF_QUEUE_INFLIGHT: &str = "queue_inflight";
/// Dead-lettered tasks keyed by task id.
pub const CF_QUEUE_DEAD: &str = "queue_dead";

const COLUMN_FAMILIES: [&str; 8] = [
    CF_ACCOUNTS,
    CF_MUTATIONS,
    CF_LEDGER,
    CF_LEDGER_BY_ACCOUNT,
    CF_LEDGER_REFS,
    CF_QUEUE_READY,
    CF_QUEUE_INFLIGHT,
    CF_QUEUE_DEAD,
];

#[derive(Serialize, Deserialize)]
struct Reservation {
    deadline_ms: u64,
    task: QueuedTask,
}

/// A persistent store implementation using RocksDB.
///
/// Implements all three ports over separate Column Families. Read-modify-write paths take
/// `write_lock` and commit through a single `WriteBatch`, so a balance and its mutation key
/// (or a task and its queue position) are never written apart.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    write_lock: Arc<Mutex<()>>,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path, creating any missing
    /// column families.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()));

        let db = DB::open_cf_descriptors(&opts, path, descriptors)?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db.cf_handle(name).ok_or_else(|| {
            LedgerError::persistence(std::io::Error::other(format!(
                "column family {name} not found"
            )))
        })
    }

    fn read<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        match self.db.get_cf(self.cf(cf)?, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, cf: &str) -> Result<Vec<T>> {
        let mut values = Vec::new();
        for item in self.db.iterator_cf(self.cf(cf)?, IteratorMode::Start) {
            let (_key, value) = item?;
            values.push(serde_json::from_slice(&value)?);
        }
        Ok(values)
    }

    fn count(&self, cf: &str) -> Result<usize> {
        let mut count = 0;
        for item in self.db.iterator_cf(self.cf(cf)?, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    fn now_ms() -> u64 {
        Utc::now().timestamp_millis().max(0) as u64
    }

    fn delay_ms(delay: Duration) -> u64 {
        u64::try_from(delay.min(MAX_QUEUE_DELAY).as_millis()).unwrap_or(u64::MAX)
    }

    fn ready_key(due_ms: u64, id: TaskId) -> Vec<u8> {
        let mut key = due_ms.to_be_bytes().to_vec();
        key.extend_from_slice(id.0.as_bytes());
        key
    }

    fn account_index_key(account: &AccountId, entry: EntryId) -> Vec<u8> {
        let mut key = Self::account_prefix(account);
        key.extend_from_slice(entry.0.as_bytes());
        key
    }

    fn account_prefix(account: &AccountId) -> Vec<u8> {
        let mut key = account.as_str().as_bytes().to_vec();
        key.push(0);
        key
    }

    /// Moves reservations whose visibility window lapsed back to the ready list.
    fn requeue_lapsed(&self, now_ms: u64) -> Result<()> {
        let inflight = self.cf(CF_QUEUE_INFLIGHT)?;
        let ready = self.cf(CF_QUEUE_READY)?;
        let mut batch = WriteBatch::default();
        let mut moved = 0;
        for item in self.db.iterator_cf(inflight, IteratorMode::Start) {
            let (key, value) = item?;
            let reservation: Reservation = serde_json::from_slice(&value)?;
            if reservation.deadline_ms <= now_ms {
                batch.delete_cf(inflight, key);
                batch.put_cf(
                    ready,
                    Self::ready_key(now_ms, reservation.task.id),
                    serde_json::to_vec(&reservation.task)?,
                );
                moved += 1;
            }
        }
        if moved > 0 {
            self.db.write(batch)?;
        }
        Ok(())
    }

    fn take_reservation(&self, id: TaskId) -> Result<Reservation> {
        self.read(CF_QUEUE_INFLIGHT, id.0.as_bytes())?
            .ok_or_else(|| LedgerError::QueueUnavailable(format!("task {id} is not reserved")))
    }
}

#[async_trait]
impl AccountStore for RocksDBStore {
    async fn insert(&self, account: Account) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let key = account.id.as_str().as_bytes().to_vec();
        if self.db.get_pinned_cf(self.cf(CF_ACCOUNTS)?, &key)?.is_some() {
            return Err(LedgerError::AccountExists(account.id));
        }
        self.db
            .put_cf(self.cf(CF_ACCOUNTS)?, key, serde_json::to_vec(&account)?)?;
        Ok(())
    }

    async fn get(&self, id: &AccountId) -> Result<Option<Account>> {
        self.read(CF_ACCOUNTS, id.as_str().as_bytes())
    }

    async fn all(&self) -> Result<Vec<Account>> {
        self.scan(CF_ACCOUNTS)
    }

    async fn apply_delta(
        &self,
        id: &AccountId,
        delta: Delta,
        key: Option<&MutationKey>,
    ) -> Result<BalanceChange> {
        let _guard = self.write_lock.lock().await;
        if let Some(key) = key
            && let Some(previous) =
                self.read::<BalanceChange>(CF_MUTATIONS, key.as_str().as_bytes())?
        {
            return Ok(previous.into_replayed());
        }
        let mut account: Account = self
            .read(CF_ACCOUNTS, id.as_str().as_bytes())?
            .ok_or_else(|| LedgerError::AccountNotFound(id.clone()))?;
        let change = account.apply(delta)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf(CF_ACCOUNTS)?,
            id.as_str().as_bytes(),
            serde_json::to_vec(&account)?,
        );
        if let Some(key) = key {
            batch.put_cf(
                self.cf(CF_MUTATIONS)?,
                key.as_str().as_bytes(),
                serde_json::to_vec(&change)?,
            );
        }
        self.db.write(batch)?;
        Ok(change)
    }
}

#[async_trait]
impl LedgerStore for RocksDBStore {
    async fn create(&self, entry: LedgerEntry) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let ledger = self.cf(CF_LEDGER)?;
        if self.db.get_pinned_cf(ledger, entry.id.0.as_bytes())?.is_some() {
            return Err(LedgerError::persistence(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("ledger entry {} already exists", entry.id),
            )));
        }

        let mut batch = WriteBatch::default();
        batch.put_cf(ledger, entry.id.0.as_bytes(), serde_json::to_vec(&entry)?);
        batch.put_cf(
            self.cf(CF_LEDGER_BY_ACCOUNT)?,
            Self::account_index_key(&entry.account_id, entry.id),
            b"",
        );
        if let Some(reference) = entry.reference_id {
            batch.put_cf(
                self.cf(CF_LEDGER_REFS)?,
                reference.0.as_bytes(),
                entry.id.0.as_bytes(),
            );
        }
        self.db.write(batch)?;
        Ok(())
    }

    async fn get(&self, id: EntryId) -> Result<Option<LedgerEntry>> {
        self.read(CF_LEDGER, id.0.as_bytes())
    }

    async fn list_by_account(&self, account: &AccountId) -> Result<Vec<LedgerEntry>> {
        let prefix = Self::account_prefix(account);
        let index = self.cf(CF_LEDGER_BY_ACCOUNT)?;
        let mut entries = Vec::new();
        for item in self
            .db
            .iterator_cf(index, IteratorMode::From(prefix.as_slice(), Direction::Forward))
        {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let raw = &key[prefix.len()..];
            let id = uuid::Uuid::from_slice(raw).map_err(LedgerError::persistence)?;
            if let Some(entry) = self.read::<LedgerEntry>(CF_LEDGER, id.as_bytes())? {
                entries.push(entry);
            }
        }
        newest_first(&mut entries);
        Ok(entries)
    }

    async fn list_by_status(&self, status: EntryStatus) -> Result<Vec<LedgerEntry>> {
        let mut entries: Vec<LedgerEntry> = self
            .scan::<LedgerEntry>(CF_LEDGER)?
            .into_iter()
            .filter(|e| e.status == status)
            .collect();
        newest_first(&mut entries);
        Ok(entries)
    }

    async fn find_by_reference(&self, reference: EntryId) -> Result<Option<LedgerEntry>> {
        let Some(raw) = self
            .db
            .get_cf(self.cf(CF_LEDGER_REFS)?, reference.0.as_bytes())?
        else {
            return Ok(None);
        };
        self.read(CF_LEDGER, &raw)
    }

    async fn update_status(
        &self,
        id: EntryId,
        expected: EntryStatus,
        next: EntryStatus,
    ) -> Result<Transition> {
        let _guard = self.write_lock.lock().await;
        let mut entry: LedgerEntry = self
            .read(CF_LEDGER, id.0.as_bytes())?
            .ok_or(LedgerError::TransactionNotFound(id))?;
        if entry.status != expected || !entry.transition(next) {
            return Ok(Transition::Rejected {
                current: entry.status,
            });
        }
        self.db
            .put_cf(self.cf(CF_LEDGER)?, id.0.as_bytes(), serde_json::to_vec(&entry)?)?;
        Ok(Transition::Applied(entry))
    }
}

#[async_trait]
impl QueueBackend for RocksDBStore {
    async fn push(&self, task: QueuedTask) -> Result<()> {
        let key = Self::ready_key(Self::now_ms(), task.id);
        self.db
            .put_cf(self.cf(CF_QUEUE_READY)?, key, serde_json::to_vec(&task)?)?;
        Ok(())
    }

    async fn reserve(&self, visibility: Duration) -> Result<Option<QueuedTask>> {
        let _guard = self.write_lock.lock().await;
        let now = Self::now_ms();
        self.requeue_lapsed(now)?;

        let ready = self.cf(CF_QUEUE_READY)?;
        let Some(item) = self.db.iterator_cf(ready, IteratorMode::Start).next() else {
            return Ok(None);
        };
        let (key, value) = item?;
        let due_ms = key
            .get(..8)
            .and_then(|raw| raw.try_into().ok())
            .map(u64::from_be_bytes)
            .unwrap_or(0);
        if due_ms > now {
            return Ok(None);
        }

        let mut task: QueuedTask = serde_json::from_slice(&value)?;
        task.attempt += 1;
        let reservation = Reservation {
            deadline_ms: now.saturating_add(Self::delay_ms(visibility)),
            task: task.clone(),
        };

        let mut batch = WriteBatch::default();
        batch.delete_cf(ready, key);
        batch.put_cf(
            self.cf(CF_QUEUE_INFLIGHT)?,
            task.id.0.as_bytes(),
            serde_json::to_vec(&reservation)?,
        );
        self.db.write(batch)?;
        Ok(Some(task))
    }

    async fn ack(&self, id: TaskId) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.take_reservation(id)?;
        self.db.delete_cf(self.cf(CF_QUEUE_INFLIGHT)?, id.0.as_bytes())?;
        Ok(())
    }

    async fn release(&self, id: TaskId, delay: Duration) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let reservation = self.take_reservation(id)?;
        let due = Self::now_ms().saturating_add(Self::delay_ms(delay));

        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_QUEUE_INFLIGHT)?, id.0.as_bytes());
        batch.put_cf(
            self.cf(CF_QUEUE_READY)?,
            Self::ready_key(due, id),
            serde_json::to_vec(&reservation.task)?,
        );
        self.db.write(batch)?;
        Ok(())
    }

    async fn dead_letter(&self, id: TaskId, reason: String) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let reservation = self.take_reservation(id)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_QUEUE_INFLIGHT)?, id.0.as_bytes());
        batch.put_cf(
            self.cf(CF_QUEUE_DEAD)?,
            id.0.as_bytes(),
            serde_json::to_vec(&DeadLetter::new(reservation.task, reason))?,
        );
        self.db.write(batch)?;
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        self.scan(CF_QUEUE_DEAD)
    }

    async fn depth(&self) -> Result<usize> {
        Ok(self.count(CF_QUEUE_READY)? + self.count(CF_QUEUE_INFLIGHT)?)
    }
}
