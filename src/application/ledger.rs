use crate::application::queue::TaskQueue;
use crate::domain::account::{Account, AccountId};
use crate::domain::ledger::{EntryId, EntryStatus, EntryType, LedgerEntry, Transition};
use crate::domain::money::{Amount, Delta};
use crate::domain::ports::{AccountStoreBox, LedgerStoreBox};
use crate::domain::task::TransferTask;
use crate::error::{LedgerError, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Wallet ledger operations.
///
/// Top-ups and payments settle synchronously. A transfer is recorded as a PENDING debit
/// and handed to the [`TaskQueue`]; the worker later calls
/// [`settle_transfer`](Self::settle_transfer), which is safe to run any number of times
/// for the same task.
pub struct LedgerService {
    accounts: AccountStoreBox,
    ledger: LedgerStoreBox,
    queue: Arc<TaskQueue>,
}

impl LedgerService {
    pub fn new(accounts: AccountStoreBox, ledger: LedgerStoreBox, queue: Arc<TaskQueue>) -> Self {
        Self {
            accounts,
            ledger,
            queue,
        }
    }

    /// Registers an account with a zero balance.
    #[instrument(skip(self), fields(account = %id))]
    pub async fn open_account(&self, id: AccountId) -> Result<Account> {
        let account = Account::new(id);
        self.accounts.insert(account.clone()).await?;
        info!("account opened");
        Ok(account)
    }

    pub async fn account(&self, id: &AccountId) -> Result<Account> {
        self.accounts
            .get(id)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(id.clone()))
    }

    /// All accounts, ordered by id.
    pub async fn accounts(&self) -> Result<Vec<Account>> {
        self.accounts.all().await
    }

    #[instrument(skip(self), fields(account = %account))]
    pub async fn top_up(&self, account: &AccountId, amount: Decimal) -> Result<LedgerEntry> {
        let amount = Amount::new(amount)?;
        self.account(account).await?;

        let id = EntryId::new();
        let change = self
            .accounts
            .apply_delta(account, Delta::credit(amount), None)
            .await?;
        let entry = LedgerEntry::settled(id, EntryType::Credit, amount, "", &change);
        self.ledger.create(entry.clone()).await?;

        info!(transaction_id = %entry.id, balance = %entry.balance_after, "top up settled");
        Ok(entry)
    }

    #[instrument(skip(self, remarks), fields(account = %account))]
    pub async fn payment(
        &self,
        account: &AccountId,
        amount: Decimal,
        remarks: &str,
    ) -> Result<LedgerEntry> {
        let amount = Amount::new(amount)?;
        self.account(account).await?.ensure_covers(amount)?;

        // The store re-checks coverage atomically; the read above only fails fast.
        let id = EntryId::new();
        let change = self
            .accounts
            .apply_delta(account, Delta::debit(amount), None)
            .await?;
        let entry = LedgerEntry::settled(id, EntryType::Debit, amount, remarks, &change);
        self.ledger.create(entry.clone()).await?;

        info!(transaction_id = %entry.id, balance = %entry.balance_after, "payment settled");
        Ok(entry)
    }

    /// Records a PENDING transfer debit and enqueues its settlement.
    ///
    /// The sender's balance is not touched here. If the enqueue fails the PENDING entry
    /// stays behind; [`requeue_stale_transfers`](Self::requeue_stale_transfers) picks it up.
    #[instrument(skip(self, remarks), fields(from = %from, to = %to))]
    pub async fn initiate_transfer(
        &self,
        from: &AccountId,
        to: &AccountId,
        amount: Decimal,
        remarks: &str,
    ) -> Result<LedgerEntry> {
        let amount = Amount::new(amount)?;
        if from == to {
            return Err(LedgerError::invalid(format!(
                "cannot transfer from {from} to itself"
            )));
        }
        let sender = self.account(from).await?;
        self.account(to).await?;
        sender.ensure_covers(amount)?;

        let entry = LedgerEntry::pending_transfer(
            from.clone(),
            to.clone(),
            amount,
            remarks,
            sender.balance,
        )?;
        self.ledger.create(entry.clone()).await?;

        let task = TransferTask::for_entry(&entry)?;
        if let Err(err) = self.queue.enqueue(&task).await {
            warn!(
                transaction_id = %entry.id,
                error = %err,
                "transfer recorded but not enqueued, entry left pending"
            );
            return Err(match err {
                LedgerError::QueueUnavailable(_) => err,
                other => LedgerError::QueueUnavailable(other.to_string()),
            });
        }

        info!(transaction_id = %entry.id, amount = %amount, "transfer initiated");
        Ok(entry)
    }

    /// Applies both legs of a pending transfer and marks it SUCCESS.
    ///
    /// A terminal entry is a no-op. Each leg is keyed by the entry id, so a redelivery after
    /// partial progress never moves money twice. When the recipient refuses the credit for
    /// good, the sender is refunded and the transfer is marked FAILED.
    #[instrument(skip(self, task), fields(transaction_id = %task.transaction_id))]
    pub async fn settle_transfer(&self, task: &TransferTask) -> Result<()> {
        let entry = self
            .ledger
            .get(task.transaction_id)
            .await?
            .ok_or(LedgerError::TransactionNotFound(task.transaction_id))?;
        if !task.matches(&entry) {
            return Err(LedgerError::invalid(format!(
                "task does not match transaction {}",
                entry.id
            )));
        }
        if entry.status.is_terminal() {
            debug!(status = %entry.status, "transfer already settled, skipping");
            return Ok(());
        }

        let debit = match self
            .accounts
            .apply_delta(
                &task.from_account_id,
                Delta::debit(task.amount),
                Some(&entry.id.transfer_debit_key()),
            )
            .await
        {
            Ok(change) => change,
            Err(err) => {
                self.fail_transfer(&entry, &err).await;
                return Err(err);
            }
        };
        if debit.replayed {
            debug!("sender debit already applied");
        }

        let credit = match self
            .accounts
            .apply_delta(
                &task.to_account_id,
                Delta::credit(task.amount),
                Some(&entry.id.transfer_credit_key()),
            )
            .await
        {
            Ok(change) => change,
            Err(err) if err.is_retriable() => return Err(err),
            Err(err) => {
                self.refund_sender(&entry, task).await?;
                self.fail_transfer(&entry, &err).await;
                return Err(err);
            }
        };
        if self.ledger.find_by_reference(entry.id).await?.is_none() {
            self.ledger
                .create(LedgerEntry::transfer_credit(&entry, &credit))
                .await?;
        }

        match self
            .ledger
            .update_status(entry.id, EntryStatus::Pending, EntryStatus::Success)
            .await?
        {
            Transition::Applied(_) => info!(
                from = %task.from_account_id,
                to = %task.to_account_id,
                amount = %task.amount,
                "transfer settled"
            ),
            Transition::Rejected { current } => {
                warn!(status = %current, "transfer finalized elsewhere")
            }
        }
        Ok(())
    }

    /// Returns the debited amount to the sender after the credit leg was refused.
    async fn refund_sender(&self, entry: &LedgerEntry, task: &TransferTask) -> Result<()> {
        let refund = self
            .accounts
            .apply_delta(
                &task.from_account_id,
                Delta::credit(task.amount),
                Some(&entry.id.transfer_refund_key()),
            )
            .await
            .inspect_err(|err| {
                warn!(error = %err, "sender refund failed, entry left pending");
            })?;
        info!(balance = %refund.after, replayed = refund.replayed, "sender refunded");
        Ok(())
    }

    async fn fail_transfer(&self, entry: &LedgerEntry, cause: &LedgerError) {
        match self
            .ledger
            .update_status(entry.id, EntryStatus::Pending, EntryStatus::Failed)
            .await
        {
            Ok(Transition::Applied(_)) => warn!(error = %cause, "transfer failed"),
            Ok(Transition::Rejected { current }) => {
                debug!(status = %current, "transfer already finalized")
            }
            Err(err) => warn!(
                error = %err,
                cause = %cause,
                "could not mark transfer failed, entry left pending"
            ),
        }
    }

    /// Entries of `account`, newest first.
    pub async fn list_transactions(&self, account: &AccountId) -> Result<Vec<LedgerEntry>> {
        self.ledger.list_by_account(account).await
    }

    /// Re-enqueues settlement for transfer debits still PENDING after `older_than`.
    ///
    /// Returns how many tasks were enqueued.
    #[instrument(skip(self))]
    pub async fn requeue_stale_transfers(&self, older_than: chrono::Duration) -> Result<usize> {
        let cutoff = Utc::now()
            .checked_sub_signed(older_than)
            .ok_or_else(|| LedgerError::invalid(format!("cutoff {older_than} is out of range")))?;
        let mut requeued = 0;
        for entry in self.ledger.list_by_status(EntryStatus::Pending).await? {
            if !entry.is_transfer_debit() || entry.created_at > cutoff {
                continue;
            }
            self.queue.enqueue(&TransferTask::for_entry(&entry)?).await?;
            requeued += 1;
        }
        info!(requeued, "stale transfers requeued");
        Ok(requeued)
    }
}
