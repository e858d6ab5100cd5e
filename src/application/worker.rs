use crate::application::ledger::LedgerService;
use crate::application::queue::{TaskHandler, TaskQueue};
use crate::domain::task::QueuedTask;
use crate::error::{LedgerError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Settles transfer tasks delivered by the queue.
pub struct SettlementHandler {
    ledger: Arc<LedgerService>,
}

impl SettlementHandler {
    pub fn new(ledger: Arc<LedgerService>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl TaskHandler for SettlementHandler {
    async fn handle(&self, task: &QueuedTask) -> Result<()> {
        let transfer = task.decode_transfer()?;
        if let Err(err) = self.ledger.settle_transfer(&transfer).await {
            warn!(
                task_id = %task.id,
                transaction_id = %transfer.transaction_id,
                attempt = task.attempt,
                error = %err,
                "transfer settlement failed"
            );
            return Err(err);
        }
        Ok(())
    }
}

/// Handle to stop and join the settlement worker.
pub struct WorkerHandle {
    queue: Arc<TaskQueue>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Stops the queue and waits for the in-flight task, if any, to finish.
    pub async fn shutdown(self) -> Result<()> {
        self.queue.stop();
        self.join
            .await
            .map_err(|err| LedgerError::QueueUnavailable(format!("worker task failed: {err}")))
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// The single long-lived consumer of the task queue.
#[derive(Debug)]
pub struct Worker;

impl Worker {
    /// Spawns the consume loop on the current tokio runtime.
    pub fn spawn(queue: Arc<TaskQueue>, ledger: Arc<LedgerService>) -> WorkerHandle {
        let handler = SettlementHandler::new(ledger);
        let consumer = queue.clone();
        let join = tokio::spawn(async move {
            info!("settlement worker started");
            if let Err(err) = consumer.consume(&handler).await {
                error!(error = %err, "settlement worker stopped on error");
            }
            info!("settlement worker stopped");
        });
        WorkerHandle { queue, join }
    }
}
