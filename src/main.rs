use clap::Parser;
use miette::{IntoDiagnostic, Result};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use wallet_ledger::application::ledger::LedgerService;
use wallet_ledger::application::queue::TaskQueue;
use wallet_ledger::application::worker::Worker;
use wallet_ledger::config::QueueConfig;
use wallet_ledger::domain::account::AccountId;
use wallet_ledger::domain::ports::{AccountStoreBox, LedgerStoreBox, QueueBackendBox};
use wallet_ledger::infrastructure::in_memory::{
    InMemoryAccountStore, InMemoryLedgerStore, InMemoryQueueBackend,
};
#[cfg(feature = "storage-rocksdb")]
use wallet_ledger::infrastructure::rocksdb::RocksDBStore;
use wallet_ledger::interfaces::csv::account_writer::AccountWriter;
use wallet_ledger::interfaces::csv::command_reader::{Command, CommandReader};
use wallet_ledger::observability::{self, LogFormat};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Ledger commands CSV file (`type, account, counterparty, amount, remarks`)
    input: PathBuf,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long, env = "WALLET_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Print the ledger history of this account after the balances
    #[arg(long)]
    history: Option<String>,

    #[arg(long, value_enum, env = "WALLET_LOG_FORMAT", default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    /// Deliveries allowed before a failing settlement is dead-lettered
    #[arg(long, env = "WALLET_QUEUE_MAX_ATTEMPTS", default_value_t = 5)]
    max_attempts: u32,

    #[arg(long, env = "WALLET_QUEUE_VISIBILITY_TIMEOUT_MS", default_value_t = 30_000)]
    visibility_timeout_ms: u64,

    /// How long to wait for outstanding settlements before exiting
    #[arg(long, env = "WALLET_DRAIN_TIMEOUT_SECS", default_value_t = 30)]
    drain_timeout_secs: u64,

    /// Re-enqueue transfers left PENDING for at least this many seconds before reading input
    #[arg(long)]
    requeue_stale_secs: Option<i64>,
}

type Stores = (AccountStoreBox, LedgerStoreBox, QueueBackendBox);

fn in_memory_stores() -> Stores {
    (
        Box::new(InMemoryAccountStore::new()),
        Box::new(InMemoryLedgerStore::new()),
        Box::new(InMemoryQueueBackend::new()),
    )
}

#[cfg(feature = "storage-rocksdb")]
fn open_stores(db_path: Option<&Path>) -> Result<Stores> {
    let Some(path) = db_path else {
        return Ok(in_memory_stores());
    };
    let store = RocksDBStore::open(path).into_diagnostic()?;
    info!(path = %path.display(), "using persistent storage");
    Ok((
        Box::new(store.clone()),
        Box::new(store.clone()),
        Box::new(store),
    ))
}

#[cfg(not(feature = "storage-rocksdb"))]
fn open_stores(db_path: Option<&Path>) -> Result<Stores> {
    if db_path.is_some() {
        warn!(
            "persistent storage requested via --db-path, but the storage-rocksdb feature is not enabled; falling back to in-memory storage"
        );
    }
    Ok(in_memory_stores())
}

async fn run_command(ledger: &LedgerService, command: Command) -> wallet_ledger::error::Result<()> {
    match command {
        Command::Open { account } => {
            ledger.open_account(account).await?;
        }
        Command::TopUp { account, amount } => {
            ledger.top_up(&account, amount).await?;
        }
        Command::Payment {
            account,
            amount,
            remarks,
        } => {
            ledger.payment(&account, amount, &remarks).await?;
        }
        Command::Transfer {
            from,
            to,
            amount,
            remarks,
        } => {
            ledger.initiate_transfer(&from, &to, amount, &remarks).await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    observability::init(cli.log_format);

    let history = cli
        .history
        .map(AccountId::parse)
        .transpose()
        .into_diagnostic()?;
    let requeue_stale = cli
        .requeue_stale_secs
        .map(|secs| {
            chrono::Duration::try_seconds(secs)
                .ok_or_else(|| miette::miette!("--requeue-stale-secs {secs} is out of range"))
        })
        .transpose()?;
    let config = QueueConfig::default()
        .with_max_attempts(cli.max_attempts)
        .with_visibility_timeout(Duration::from_millis(cli.visibility_timeout_ms));

    let (accounts, entries, backend) = open_stores(cli.db_path.as_deref())?;
    let queue = Arc::new(TaskQueue::new(backend, config));
    let ledger = Arc::new(LedgerService::new(accounts, entries, queue.clone()));
    let worker = Worker::spawn(queue.clone(), ledger.clone());

    if let Some(older_than) = requeue_stale {
        ledger
            .requeue_stale_transfers(older_than)
            .await
            .into_diagnostic()?;
    }

    let file = File::open(&cli.input).into_diagnostic()?;
    for (row, command) in CommandReader::new(file).commands().enumerate() {
        let outcome = match command {
            Ok(command) => run_command(&ledger, command).await,
            Err(err) => Err(err),
        };
        if let Err(err) = outcome {
            warn!(row = row + 1, error = %err, "command rejected");
        }
    }

    if let Err(err) = queue
        .drain(Duration::from_secs(cli.drain_timeout_secs))
        .await
    {
        warn!(error = %err, "exiting with settlements outstanding");
    }
    worker.shutdown().await.into_diagnostic()?;

    let dead = queue.dead_letters().await.into_diagnostic()?;
    if !dead.is_empty() {
        warn!(count = dead.len(), "settlement tasks were dead-lettered");
    }

    let stdout = io::stdout();
    let mut writer = AccountWriter::new(stdout.lock());
    writer
        .write_accounts(&ledger.accounts().await.into_diagnostic()?)
        .into_diagnostic()?;
    if let Some(account) = history {
        writer
            .write_history(&ledger.list_transactions(&account).await.into_diagnostic()?)
            .into_diagnostic()?;
    }

    info!("done");
    Ok(())
}
