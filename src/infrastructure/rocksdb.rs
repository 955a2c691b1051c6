use crate::domain::account::{Account, AccountId, Amount, Balance, EntryKind, LedgerEntry};
use crate::domain::ports::{LedgerStore, TransferStore};
use crate::domain::transfer::{Transfer, TransferFilter, TransferId};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use chrono::Utc;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, IteratorMode, Options, WriteBatch};
use rust_decimal::Decimal;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// Column Family for storing account states.
pub const CF_ACCOUNTS: &str = "accounts";
/// Column Family for the append-only ledger history, keyed by sequence number.
pub const CF_LEDGER: &str = "ledger";
/// Column Family for storing transfer records.
pub const CF_TRANSFERS: &str = "transfers";
/// Column Family mapping idempotency keys to transfer ids.
pub const CF_IDEMPOTENCY: &str = "idempotency";

/// A persistent store implementation using RocksDB.
///
/// Handles both the ledger (accounts + history) and transfer records using
/// separate Column Families. Every mutation is written as a single
/// `WriteBatch`, which makes debit, credit and history append one atomic unit.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    /// Serializes read-modify-write cycles on balances and records.
    write_lock: Arc<Mutex<()>>,
    last_seq: Arc<AtomicU64>,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path.
    ///
    /// Ensures the required column families exist and resumes the ledger
    /// sequence from the last stored entry.
    ///
    /// # Arguments
    ///
    /// * `path` - The filesystem path where the database will be stored.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = [CF_ACCOUNTS, CF_LEDGER, CF_TRANSFERS, CF_IDEMPOTENCY]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&opts, path, descriptors)?;
        let store = Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
            last_seq: Arc::new(AtomicU64::new(0)),
        };

        let last_seq = store.recover_last_seq()?;
        store.last_seq.store(last_seq, Ordering::SeqCst);
        info!(last_seq, "RocksDB store opened");
        Ok(store)
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db.cf_handle(name).ok_or_else(|| {
            EngineError::InternalError(Box::new(std::io::Error::other(format!(
                "Column family '{}' not found",
                name
            ))))
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>> {
        self.write_lock.lock().map_err(|_| {
            EngineError::InternalError(Box::new(std::io::Error::other(
                "RocksDB write lock poisoned",
            )))
        })
    }

    fn recover_last_seq(&self) -> Result<u64> {
        let cf = self.cf(CF_LEDGER)?;
        match self.db.iterator_cf(cf, IteratorMode::End).next() {
            Some(item) => {
                let (key, _) = item?;
                let bytes: [u8; 8] = key.as_ref().try_into().map_err(|_| {
                    EngineError::InternalError(Box::new(std::io::Error::other(
                        "Malformed ledger key",
                    )))
                })?;
                Ok(u64::from_be_bytes(bytes))
            }
            None => Ok(0),
        }
    }

    fn read<T: DeserializeOwned>(&self, cf_name: &str, key: impl AsRef<[u8]>) -> Result<Option<T>> {
        let cf = self.cf(cf_name)?;
        match self.db.get_cf(cf, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, cf_name: &str) -> Result<Vec<T>> {
        let cf = self.cf(cf_name)?;
        let mut values = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_key, value) = item?;
            values.push(serde_json::from_slice(&value)?);
        }
        Ok(values)
    }

    fn put<T: Serialize>(
        &self,
        batch: &mut WriteBatch,
        cf_name: &str,
        key: impl AsRef<[u8]>,
        value: &T,
    ) -> Result<()> {
        let cf = self.cf(cf_name)?;
        batch.put_cf(cf, key, serde_json::to_vec(value)?);
        Ok(())
    }

    /// Stages a history entry; the sequence is only consumed if the batch is
    /// written while the write lock is held.
    fn stage_entry(
        &self,
        batch: &mut WriteBatch,
        seq: u64,
        account: &Account,
        transfer_id: Option<TransferId>,
        kind: EntryKind,
        delta: Decimal,
    ) -> Result<()> {
        let entry = LedgerEntry {
            seq,
            account: account.id.clone(),
            transfer_id,
            kind,
            delta,
            balance_after: account.balance,
            recorded_at: Utc::now(),
        };
        self.put(batch, CF_LEDGER, seq.to_be_bytes(), &entry)
    }

    fn apply_single(&self, account: &Account, kind: EntryKind, delta: Decimal) -> Result<()> {
        let seq = self.last_seq.load(Ordering::SeqCst) + 1;
        let mut batch = WriteBatch::default();
        self.put(&mut batch, CF_ACCOUNTS, account.id.as_str(), account)?;
        self.stage_entry(&mut batch, seq, account, None, kind, delta)?;
        self.db.write(batch)?;
        self.last_seq.store(seq, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for RocksDBStore {
    async fn open_account(&self, account: Account) -> Result<()> {
        if account.balance.is_negative() {
            return Err(EngineError::ValidationError(format!(
                "Opening balance of account {} is negative",
                account.id
            )));
        }
        let _guard = self.lock()?;
        if self.read::<Account>(CF_ACCOUNTS, account.id.as_str())?.is_some() {
            return Err(EngineError::AccountExists(account.id));
        }
        self.apply_single(&account, EntryKind::Provision, account.balance.value())
    }

    async fn account(&self, id: &AccountId) -> Result<Option<Account>> {
        self.read(CF_ACCOUNTS, id.as_str())
    }

    async fn accounts(&self) -> Result<Vec<Account>> {
        // Keys are account ids, so the scan is already ordered by id.
        self.scan(CF_ACCOUNTS)
    }

    async fn debit(&self, id: &AccountId, amount: Amount) -> Result<Balance> {
        let _guard = self.lock()?;
        let mut account: Account = self
            .read(CF_ACCOUNTS, id.as_str())?
            .ok_or_else(|| EngineError::AccountNotFound(id.clone()))?;
        account.debit(amount)?;
        self.apply_single(&account, EntryKind::Debit, -amount.value())?;
        Ok(account.balance)
    }

    async fn credit(&self, id: &AccountId, amount: Amount) -> Result<Balance> {
        let _guard = self.lock()?;
        let mut account: Account = self
            .read(CF_ACCOUNTS, id.as_str())?
            .ok_or_else(|| EngineError::AccountNotFound(id.clone()))?;
        account.credit(amount)?;
        self.apply_single(&account, EntryKind::Credit, amount.value())?;
        Ok(account.balance)
    }

    async fn commit_transfer(&self, transfer: &Transfer) -> Result<()> {
        let amount = Amount::new(transfer.amount)?;
        let _guard = self.lock()?;

        let mut sender: Account = self
            .read(CF_ACCOUNTS, transfer.sender.as_str())?
            .ok_or_else(|| EngineError::AccountNotFound(transfer.sender.clone()))?;
        sender.debit(amount)?;

        // Nothing is written until the batch below, so bailing out here
        // discards the staged debit.
        let mut receiver: Account = self
            .read(CF_ACCOUNTS, transfer.receiver.as_str())?
            .ok_or_else(|| EngineError::AccountNotFound(transfer.receiver.clone()))?;
        if receiver.currency != transfer.currency {
            return Err(EngineError::CurrencyMismatch {
                account: receiver.id,
                held: receiver.currency,
                requested: transfer.currency.clone(),
            });
        }
        receiver.credit(amount)?;

        let seq = self.last_seq.load(Ordering::SeqCst);
        let mut batch = WriteBatch::default();
        self.put(&mut batch, CF_ACCOUNTS, sender.id.as_str(), &sender)?;
        self.put(&mut batch, CF_ACCOUNTS, receiver.id.as_str(), &receiver)?;
        self.stage_entry(
            &mut batch,
            seq + 1,
            &sender,
            Some(transfer.id),
            EntryKind::Debit,
            -amount.value(),
        )?;
        self.stage_entry(
            &mut batch,
            seq + 2,
            &receiver,
            Some(transfer.id),
            EntryKind::Credit,
            amount.value(),
        )?;
        self.db.write(batch)?;
        self.last_seq.store(seq + 2, Ordering::SeqCst);

        debug!(transfer_id = %transfer.id, "Transfer committed to RocksDB ledger");
        Ok(())
    }

    async fn history(&self, id: &AccountId) -> Result<Vec<LedgerEntry>> {
        let entries: Vec<LedgerEntry> = self.scan(CF_LEDGER)?;
        Ok(entries.into_iter().filter(|e| &e.account == id).collect())
    }
}

#[async_trait]
impl TransferStore for RocksDBStore {
    async fn insert(&self, transfer: Transfer) -> Result<()> {
        let _guard = self.lock()?;
        let id = transfer.id.to_string();
        let mut batch = WriteBatch::default();
        self.put(&mut batch, CF_TRANSFERS, &id, &transfer)?;
        if let Some(key) = &transfer.idempotency_key {
            batch.put_cf(self.cf(CF_IDEMPOTENCY)?, key, id.as_bytes());
        }
        self.db.write(batch)?;
        Ok(())
    }

    async fn update(&self, transfer: Transfer) -> Result<()> {
        let _guard = self.lock()?;
        let id = transfer.id.to_string();
        let stored: Transfer = self
            .read(CF_TRANSFERS, &id)?
            .ok_or(EngineError::TransferNotFound(transfer.id))?;
        if stored.is_terminal() {
            return Err(EngineError::InvalidTransition {
                id: transfer.id,
                from: stored.status,
                to: transfer.status,
            });
        }
        self.db
            .put_cf(self.cf(CF_TRANSFERS)?, id, serde_json::to_vec(&transfer)?)?;
        Ok(())
    }

    async fn get(&self, id: TransferId) -> Result<Option<Transfer>> {
        self.read(CF_TRANSFERS, id.to_string())
    }

    async fn find_by_key(&self, key: &str) -> Result<Option<Transfer>> {
        let cf = self.cf(CF_IDEMPOTENCY)?;
        match self.db.get_cf(cf, key)? {
            Some(bytes) => {
                let id = String::from_utf8_lossy(&bytes).into_owned();
                self.read(CF_TRANSFERS, id)
            }
            None => Ok(None),
        }
    }

    async fn list(&self, filter: &TransferFilter) -> Result<Vec<Transfer>> {
        let mut transfers: Vec<Transfer> = self
            .scan::<Transfer>(CF_TRANSFERS)?
            .into_iter()
            .filter(|t| filter.accepts(t))
            .collect();
        transfers.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(transfers)
    }
}
