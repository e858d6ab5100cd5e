use crate::domain::account::AccountId;
use crate::domain::ledger::EntryId;
use rust_decimal::Decimal;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("account not found: {0}")]
    AccountNotFound(AccountId),
    #[error("account already exists: {0}")]
    AccountExists(AccountId),
    #[error("insufficient funds on {account}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        account: AccountId,
        balance: Decimal,
        requested: Decimal,
    },
    #[error("balance of {0} would leave the representable range")]
    BalanceOverflow(AccountId),
    #[error("transaction not found: {0}")]
    TransactionNotFound(EntryId),
    #[error("task queue unavailable: {0}")]
    QueueUnavailable(String),
    #[error("persistence error: {0}")]
    Persistence(#[source] BoxError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("task payload error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl LedgerError {
    pub fn persistence(err: impl Into<BoxError>) -> Self {
        Self::Persistence(err.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Whether redelivering the task that produced this error can succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Persistence(_) | Self::QueueUnavailable(_))
    }
}

impl From<std::io::Error> for LedgerError {
    fn from(err: std::io::Error) -> Self {
        Self::Persistence(Box::new(err))
    }
}

impl From<csv::Error> for LedgerError {
    fn from(err: csv::Error) -> Self {
        Self::InvalidArgument(err.to_string())
    }
}

#[cfg(feature = "storage-rocksdb")]
impl From<rocksdb::Error> for LedgerError {
    fn from(err: rocksdb::Error) -> Self {
        Self::Persistence(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
