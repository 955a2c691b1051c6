use super::account::{Account, AccountId, Amount, Balance, LedgerEntry};
use super::transfer::{Transfer, TransferFilter, TransferId};
use crate::error::Result;
use async_trait::async_trait;

/// Exclusive owner of account balances and the append-only ledger history.
///
/// Implementations must make every mutating call atomic: either all of its
/// balance changes and history entries become visible, or none do.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Provisions a new account and records its opening balance.
    async fn open_account(&self, account: Account) -> Result<()>;
    async fn account(&self, id: &AccountId) -> Result<Option<Account>>;
    async fn accounts(&self) -> Result<Vec<Account>>;
    /// Fails with `InsufficientFunds` when the balance is below `amount`.
    async fn debit(&self, id: &AccountId, amount: Amount) -> Result<Balance>;
    async fn credit(&self, id: &AccountId, amount: Amount) -> Result<Balance>;
    /// Debits the sender and credits the receiver as one unit.
    ///
    /// If the credit fails after the debit succeeded, the debit is rolled back
    /// before the error is returned.
    ///
    /// Must be cancel safe: once the returned future is dropped the transfer
    /// is either fully committed or never will be. Committed entries carry
    /// the transfer id, which is how callers settle a commit they stopped
    /// waiting for.
    async fn commit_transfer(&self, transfer: &Transfer) -> Result<()>;
    /// History entries for `id`, in sequence order.
    async fn history(&self, id: &AccountId) -> Result<Vec<LedgerEntry>>;
}

/// Persistence for transfer records.
#[async_trait]
pub trait TransferStore: Send + Sync {
    /// Stores a new record and indexes its idempotency key, replacing any
    /// previous binding of that key.
    async fn insert(&self, transfer: Transfer) -> Result<()>;
    /// Replaces a stored record. Refuses to overwrite a terminal one.
    async fn update(&self, transfer: Transfer) -> Result<()>;
    async fn get(&self, id: TransferId) -> Result<Option<Transfer>>;
    async fn find_by_key(&self, key: &str) -> Result<Option<Transfer>>;
    /// Matching records, newest first.
    async fn list(&self, filter: &TransferFilter) -> Result<Vec<Transfer>>;
}

pub type LedgerStoreBox = Box<dyn LedgerStore>;
pub type TransferStoreBox = Box<dyn TransferStore>;
