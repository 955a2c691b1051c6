use crate::domain::account::{AccountId, Currency};
use crate::domain::transfer::{TransferId, TransferStatus};
use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Account {0} not found")]
    AccountNotFound(AccountId),
    #[error("Account {0} already exists")]
    AccountExists(AccountId),
    #[error("Transfer {0} not found")]
    TransferNotFound(TransferId),
    #[error("Insufficient funds in account {account}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        account: AccountId,
        balance: Decimal,
        requested: Decimal,
    },
    #[error("Invalid transition for transfer {id}: {from} -> {to}")]
    InvalidTransition {
        id: TransferId,
        from: TransferStatus,
        to: TransferStatus,
    },
    #[error("Idempotency key {0} was reused with different transfer parameters")]
    IdempotencyConflict(String),
    #[error("Account {account} holds {held}, not {requested}")]
    CurrencyMismatch {
        account: AccountId,
        held: Currency,
        requested: Currency,
    },
    #[error("Timed out waiting for lock {0}")]
    LockTimeout(String),
    #[error("Crediting account {0} would overflow its balance")]
    BalanceOverflow(AccountId),
    #[cfg(feature = "storage-rocksdb")]
    #[error("RocksDB error: {0}")]
    RocksDbError(#[from] rocksdb::Error),
    #[error("Internal error: {0}")]
    InternalError(Box<dyn std::error::Error + Send + Sync>),
}

pub type Result<T> = std::result::Result<T, EngineError>;
