use crate::config::QueueConfig;
use crate::domain::ports::QueueBackendBox;
use crate::domain::task::{DeadLetter, QueuedTask, TaskId, TransferTask};
use crate::error::{LedgerError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

/// Something that processes one delivered task.
///
/// Delivery is at-least-once, so implementations must tolerate seeing the same task again.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &QueuedTask) -> Result<()>;
}

/// At-least-once work queue in front of a [`QueueBackend`](crate::domain::ports::QueueBackend).
///
/// Producers call [`enqueue`](Self::enqueue); a single consumer runs
/// [`consume`](Self::consume) until [`stop`](Self::stop). Acknowledgement policy:
/// handler success acks the task, a retriable failure with attempts left releases it for
/// redelivery after backoff, and anything else is dead-lettered.
pub struct TaskQueue {
    backend: QueueBackendBox,
    config: QueueConfig,
    wake: Notify,
    stopped: watch::Sender<bool>,
}

impl TaskQueue {
    pub fn new(backend: QueueBackendBox, config: QueueConfig) -> Self {
        let (stopped, _) = watch::channel(false);
        Self {
            backend,
            config,
            wake: Notify::new(),
            stopped,
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }

    /// Records a transfer settlement task for later delivery.
    ///
    /// Fails with `QueueUnavailable` when the queue was stopped, the backend refused the
    /// task, or the push did not finish within the configured enqueue timeout.
    pub async fn enqueue(&self, task: &TransferTask) -> Result<TaskId> {
        if self.is_stopped() {
            return Err(LedgerError::QueueUnavailable("queue is stopped".to_string()));
        }
        let queued = QueuedTask::transfer(task)?;
        let id = queued.id;

        match tokio::time::timeout(self.config.enqueue_timeout, self.backend.push(queued)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(LedgerError::QueueUnavailable(err.to_string())),
            Err(_) => {
                return Err(LedgerError::QueueUnavailable(format!(
                    "enqueue timed out after {:?}",
                    self.config.enqueue_timeout
                )));
            }
        }

        debug!(task_id = %id, transaction_id = %task.transaction_id, "task enqueued");
        self.wake.notify_one();
        Ok(id)
    }

    /// Dispatches delivered tasks to `handler` until the queue is stopped.
    ///
    /// Handler and backend errors are logged; they never end the loop.
    pub async fn consume<H>(&self, handler: &H) -> Result<()>
    where
        H: TaskHandler + ?Sized,
    {
        let mut stop = self.stopped.subscribe();
        info!("task queue consumer started");

        loop {
            let stopped = *stop.borrow_and_update();
            if stopped {
                break;
            }

            let reserved = match self.backend.reserve(self.config.visibility_timeout).await {
                Ok(reserved) => reserved,
                Err(err) => {
                    warn!(error = %err, "failed to reserve task");
                    None
                }
            };

            match reserved {
                Some(task) => self.dispatch(handler, task).await,
                None => {
                    tokio::select! {
                        _ = stop.changed() => {}
                        _ = self.wake.notified() => {}
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }

        info!("task queue consumer stopped");
        Ok(())
    }

    async fn dispatch<H>(&self, handler: &H, task: QueuedTask)
    where
        H: TaskHandler + ?Sized,
    {
        let id = task.id;
        let attempt = task.attempt;

        let settled = match handler.handle(&task).await {
            Ok(()) => {
                debug!(task_id = %id, attempt, "task handled");
                self.backend.ack(id).await
            }
            Err(err) if err.is_retriable() && self.config.should_retry(attempt) => {
                let delay = self.config.backoff_for(attempt);
                warn!(
                    task_id = %id,
                    attempt,
                    error = %err,
                    retry_in_ms = delay.as_millis() as u64,
                    "task handler failed, scheduling redelivery"
                );
                self.backend.release(id, delay).await
            }
            Err(err) => {
                error!(task_id = %id, attempt, error = %err, "task handler failed, dead-lettering");
                self.backend.dead_letter(id, err.to_string()).await
            }
        };

        // The reservation lapses on its own if this fails, so the task is redelivered.
        if let Err(err) = settled {
            warn!(task_id = %id, error = %err, "failed to settle task reservation");
        }
    }

    /// Ends the consume loop; later enqueues fail. Undelivered tasks stay in the backend.
    pub fn stop(&self) {
        if !self.stopped.send_replace(true) {
            info!("task queue stopping");
        }
        self.wake.notify_waiters();
    }

    /// Tasks not yet acknowledged or dead-lettered.
    pub async fn depth(&self) -> Result<usize> {
        self.backend.depth().await
    }

    /// Waits until every enqueued task has been acknowledged or dead-lettered.
    pub async fn drain(&self, timeout: Duration) -> Result<()> {
        let tick = self.config.poll_interval.min(Duration::from_millis(10));
        let wait = async {
            loop {
                if self.depth().await? == 0 {
                    return Ok(());
                }
                tokio::time::sleep(tick).await;
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(LedgerError::QueueUnavailable(format!(
                "queue not drained within {timeout:?}, {} task(s) outstanding",
                self.depth().await?
            ))),
        }
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        self.backend.dead_letters().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::account::AccountId;
    use crate::domain::ledger::EntryId;
    use crate::domain::money::Amount;
    use crate::infrastructure::in_memory::InMemoryQueueBackend;
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transfer() -> TransferTask {
        TransferTask {
            transaction_id: EntryId::new(),
            from_account_id: AccountId::parse("alice").unwrap(),
            to_account_id: AccountId::parse("bob").unwrap(),
            amount: Amount::new(dec!(1)).unwrap(),
        }
    }

    fn fast_config() -> QueueConfig {
        QueueConfig::default()
            .with_retry_backoff(Duration::from_millis(1))
            .with_poll_interval(Duration::from_millis(5))
    }

    /// Fails the first `failures` deliveries with the given error, then succeeds.
    struct Flaky {
        calls: AtomicU32,
        failures: u32,
        retriable: bool,
    }

    #[async_trait]
    impl TaskHandler for Flaky {
        async fn handle(&self, _task: &QueuedTask) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call > self.failures {
                return Ok(());
            }
            if self.retriable {
                Err(LedgerError::persistence(std::io::Error::other("flaky")))
            } else {
                Err(LedgerError::invalid("bad task"))
            }
        }
    }

    #[tokio::test]
    async fn test_enqueue_after_stop_is_unavailable() {
        let queue = TaskQueue::new(Box::new(InMemoryQueueBackend::new()), fast_config());
        queue.stop();
        assert!(matches!(
            queue.enqueue(&transfer()).await,
            Err(LedgerError::QueueUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_retriable_failure_is_redelivered() {
        let queue = Arc::new(TaskQueue::new(
            Box::new(InMemoryQueueBackend::new()),
            fast_config(),
        ));
        let handler = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            failures: 2,
            retriable: true,
        });
        queue.enqueue(&transfer()).await.unwrap();

        let consumer = {
            let queue = queue.clone();
            let handler = handler.clone();
            tokio::spawn(async move { queue.consume(handler.as_ref()).await })
        };

        queue.drain(Duration::from_secs(5)).await.unwrap();
        queue.stop();
        consumer.await.unwrap().unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert!(queue.dead_letters().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_non_retriable_failure_is_dead_lettered() {
        let queue = Arc::new(TaskQueue::new(
            Box::new(InMemoryQueueBackend::new()),
            fast_config(),
        ));
        let handler = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            failures: u32::MAX,
            retriable: false,
        });
        queue.enqueue(&transfer()).await.unwrap();

        let consumer = {
            let queue = queue.clone();
            let handler = handler.clone();
            tokio::spawn(async move { queue.consume(handler.as_ref()).await })
        };

        queue.drain(Duration::from_secs(5)).await.unwrap();
        queue.stop();
        consumer.await.unwrap().unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        let dead = queue.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert!(dead[0].reason.contains("bad task"));
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let queue = Arc::new(TaskQueue::new(
            Box::new(InMemoryQueueBackend::new()),
            fast_config().with_max_attempts(3),
        ));
        let handler = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            failures: u32::MAX,
            retriable: true,
        });
        queue.enqueue(&transfer()).await.unwrap();

        let consumer = {
            let queue = queue.clone();
            let handler = handler.clone();
            tokio::spawn(async move { queue.consume(handler.as_ref()).await })
        };

        queue.drain(Duration::from_secs(5)).await.unwrap();
        queue.stop();
        consumer.await.unwrap().unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(queue.dead_letters().await.unwrap()[0].task.attempt, 3);
    }

    #[tokio::test]
    async fn test_drain_times_out_without_consumer() {
        let queue = TaskQueue::new(Box::new(InMemoryQueueBackend::new()), fast_config());
        queue.enqueue(&transfer()).await.unwrap();
        assert!(matches!(
            queue.drain(Duration::from_millis(30)).await,
            Err(LedgerError::QueueUnavailable(_))
        ));
        assert_eq!(queue.depth().await.unwrap(), 1);
    }
}
