use crate::domain::account::{Account, AccountId, Amount, Balance, Currency, EntryKind, LedgerEntry};
use crate::domain::ports::{LedgerStore, TransferStore};
use crate::domain::transfer::{Transfer, TransferFilter, TransferId};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Default)]
struct LedgerState {
    accounts: HashMap<AccountId, Account>,
    entries: Vec<LedgerEntry>,
    next_seq: u64,
}

impl LedgerState {
    fn account_mut(&mut self, id: &AccountId) -> Result<&mut Account> {
        self.accounts
            .get_mut(id)
            .ok_or_else(|| EngineError::AccountNotFound(id.clone()))
    }

    fn debit(&mut self, id: &AccountId, amount: Amount) -> Result<Balance> {
        let account = self.account_mut(id)?;
        account.debit(amount)?;
        Ok(account.balance)
    }

    /// Credits `id`, refusing accounts held in another currency.
    fn credit(&mut self, id: &AccountId, amount: Amount, currency: Option<&Currency>) -> Result<Balance> {
        let account = self.account_mut(id)?;
        if let Some(currency) = currency
            && &account.currency != currency
        {
            return Err(EngineError::CurrencyMismatch {
                account: id.clone(),
                held: account.currency.clone(),
                requested: currency.clone(),
            });
        }
        account.credit(amount)?;
        Ok(account.balance)
    }

    fn append(
        &mut self,
        account: &AccountId,
        transfer_id: Option<TransferId>,
        kind: EntryKind,
        delta: Decimal,
        balance_after: Balance,
    ) {
        self.next_seq += 1;
        self.entries.push(LedgerEntry {
            seq: self.next_seq,
            account: account.clone(),
            transfer_id,
            kind,
            delta,
            balance_after,
            recorded_at: Utc::now(),
        });
    }
}

/// A thread-safe in-memory ledger.
///
/// Balances and history live behind one `RwLock`, so every mutating call is
/// trivially atomic. Ideal for testing or deployments where persistence is
/// not required.
#[derive(Default, Clone)]
pub struct InMemoryLedgerStore {
    state: Arc<RwLock<LedgerState>>,
}

impl InMemoryLedgerStore {
    /// Creates a new, empty in-memory ledger.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn open_account(&self, account: Account) -> Result<()> {
        if account.balance.is_negative() {
            return Err(EngineError::ValidationError(format!(
                "Opening balance of account {} is negative",
                account.id
            )));
        }
        let mut state = self.state.write().await;
        if state.accounts.contains_key(&account.id) {
            return Err(EngineError::AccountExists(account.id));
        }
        let (id, balance) = (account.id.clone(), account.balance);
        state.accounts.insert(id.clone(), account);
        state.append(&id, None, EntryKind::Provision, balance.value(), balance);
        Ok(())
    }

    async fn account(&self, id: &AccountId) -> Result<Option<Account>> {
        let state = self.state.read().await;
        Ok(state.accounts.get(id).cloned())
    }

    async fn accounts(&self) -> Result<Vec<Account>> {
        let state = self.state.read().await;
        let mut accounts: Vec<Account> = state.accounts.values().cloned().collect();
        accounts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(accounts)
    }

    async fn debit(&self, id: &AccountId, amount: Amount) -> Result<Balance> {
        let mut state = self.state.write().await;
        let balance = state.debit(id, amount)?;
        state.append(id, None, EntryKind::Debit, -amount.value(), balance);
        Ok(balance)
    }

    async fn credit(&self, id: &AccountId, amount: Amount) -> Result<Balance> {
        let mut state = self.state.write().await;
        let balance = state.credit(id, amount, None)?;
        state.append(id, None, EntryKind::Credit, amount.value(), balance);
        Ok(balance)
    }

    async fn commit_transfer(&self, transfer: &Transfer) -> Result<()> {
        let amount = Amount::new(transfer.amount)?;
        let mut state = self.state.write().await;

        let sender_balance = state.debit(&transfer.sender, amount)?;
        let receiver_balance = match state.credit(&transfer.receiver, amount, Some(&transfer.currency)) {
            Ok(balance) => balance,
            Err(e) => {
                // The sender was debited a moment ago under the same lock.
                state.credit(&transfer.sender, amount, None)?;
                warn!(transfer_id = %transfer.id, error = %e, "Credit failed, debit rolled back");
                return Err(e);
            }
        };

        state.append(
            &transfer.sender,
            Some(transfer.id),
            EntryKind::Debit,
            -amount.value(),
            sender_balance,
        );
        state.append(
            &transfer.receiver,
            Some(transfer.id),
            EntryKind::Credit,
            amount.value(),
            receiver_balance,
        );
        debug!(transfer_id = %transfer.id, "Transfer committed to in-memory ledger");
        Ok(())
    }

    async fn history(&self, id: &AccountId) -> Result<Vec<LedgerEntry>> {
        let state = self.state.read().await;
        Ok(state
            .entries
            .iter()
            .filter(|e| &e.account == id)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
struct TransferIndex {
    transfers: HashMap<TransferId, Transfer>,
    keys: HashMap<String, TransferId>,
}

/// A thread-safe in-memory store for transfer records.
///
/// Keeps a secondary index from idempotency key to the transfer currently
/// bound to it.
#[derive(Default, Clone)]
pub struct InMemoryTransferStore {
    index: Arc<RwLock<TransferIndex>>,
}

impl InMemoryTransferStore {
    /// Creates a new, empty in-memory transfer store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransferStore for InMemoryTransferStore {
    async fn insert(&self, transfer: Transfer) -> Result<()> {
        let mut index = self.index.write().await;
        if let Some(key) = &transfer.idempotency_key {
            index.keys.insert(key.clone(), transfer.id);
        }
        index.transfers.insert(transfer.id, transfer);
        Ok(())
    }

    async fn update(&self, transfer: Transfer) -> Result<()> {
        let mut index = self.index.write().await;
        let stored = index
            .transfers
            .get_mut(&transfer.id)
            .ok_or(EngineError::TransferNotFound(transfer.id))?;
        if stored.is_terminal() {
            return Err(EngineError::InvalidTransition {
                id: transfer.id,
                from: stored.status,
                to: transfer.status,
            });
        }
        *stored = transfer;
        Ok(())
    }

    async fn get(&self, id: TransferId) -> Result<Option<Transfer>> {
        let index = self.index.read().await;
        Ok(index.transfers.get(&id).cloned())
    }

    async fn find_by_key(&self, key: &str) -> Result<Option<Transfer>> {
        let index = self.index.read().await;
        Ok(index
            .keys
            .get(key)
            .and_then(|id| index.transfers.get(id))
            .cloned())
    }

    async fn list(&self, filter: &TransferFilter) -> Result<Vec<Transfer>> {
        let index = self.index.read().await;
        let mut transfers: Vec<Transfer> = index
            .transfers
            .values()
            .filter(|t| filter.accepts(t))
            .cloned()
            .collect();
        transfers.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(transfers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::transfer::{Direction, FailureReason, TransferRequest, TransferStatus};
    use rust_decimal_macros::dec;

    fn currency(code: &str) -> Currency {
        Currency::new(code).unwrap()
    }

    fn amount(value: Decimal) -> Amount {
        Amount::new(value).unwrap()
    }

    async fn ledger_with(accounts: &[(&str, Decimal, &str)]) -> InMemoryLedgerStore {
        let store = InMemoryLedgerStore::new();
        for (id, balance, code) in accounts {
            let account = Account::new((*id).into(), currency(code)).with_balance(Balance::new(*balance));
            store.open_account(account).await.unwrap();
        }
        store
    }

    fn transfer(sender: &str, receiver: &str, value: Decimal, code: &str) -> Transfer {
        Transfer::new(&TransferRequest::new(
            sender.into(),
            receiver.into(),
            value,
            currency(code),
        ))
    }

    #[tokio::test]
    async fn test_open_account_records_provision() {
        let store = ledger_with(&[("a", dec!(100), "INR")]).await;

        let account = store.account(&"a".into()).await.unwrap().unwrap();
        assert_eq!(account.balance, Balance::new(dec!(100)));

        let history = store.history(&"a".into()).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, EntryKind::Provision);

        assert!(store.account(&"missing".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_open_account_rejects_duplicates_and_negative() {
        let store = ledger_with(&[("a", dec!(1), "INR")]).await;
        let dup = Account::new("a".into(), currency("INR"));
        assert!(matches!(
            store.open_account(dup).await,
            Err(EngineError::AccountExists(_))
        ));

        let negative = Account::new("b".into(), currency("INR")).with_balance(Balance::new(dec!(-1)));
        assert!(store.open_account(negative).await.is_err());
    }

    #[tokio::test]
    async fn test_debit_and_credit() {
        let store = ledger_with(&[("a", dec!(10), "INR")]).await;

        let after = store.debit(&"a".into(), amount(dec!(4))).await.unwrap();
        assert_eq!(after, Balance::new(dec!(6)));

        let err = store.debit(&"a".into(), amount(dec!(7))).await;
        assert!(matches!(err, Err(EngineError::InsufficientFunds { .. })));

        let after = store.credit(&"a".into(), amount(dec!(1))).await.unwrap();
        assert_eq!(after, Balance::new(dec!(7)));

        assert!(matches!(
            store.credit(&"nobody".into(), amount(dec!(1))).await,
            Err(EngineError::AccountNotFound(_))
        ));
        // provision, debit, credit; the rejected debit left no trace
        assert_eq!(store.history(&"a".into()).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_commit_transfer_moves_funds() {
        let store = ledger_with(&[("a", dec!(1000), "INR"), ("b", dec!(0), "INR")]).await;

        store
            .commit_transfer(&transfer("a", "b", dec!(400), "INR"))
            .await
            .unwrap();

        let a = store.account(&"a".into()).await.unwrap().unwrap();
        let b = store.account(&"b".into()).await.unwrap().unwrap();
        assert_eq!(a.balance, Balance::new(dec!(600)));
        assert_eq!(b.balance, Balance::new(dec!(400)));

        let history = store.history(&"b".into()).await.unwrap();
        assert_eq!(history.last().unwrap().kind, EntryKind::Credit);
        assert_eq!(history.last().unwrap().balance_after, Balance::new(dec!(400)));
    }

    #[tokio::test]
    async fn test_commit_transfer_rolls_back_when_credit_fails() {
        let store = ledger_with(&[("a", dec!(100), "INR"), ("usd", dec!(0), "USD")]).await;

        let missing = store
            .commit_transfer(&transfer("a", "ghost", dec!(50), "INR"))
            .await;
        assert!(matches!(missing, Err(EngineError::AccountNotFound(_))));

        let mismatch = store
            .commit_transfer(&transfer("a", "usd", dec!(50), "INR"))
            .await;
        assert!(matches!(mismatch, Err(EngineError::CurrencyMismatch { .. })));

        let a = store.account(&"a".into()).await.unwrap().unwrap();
        assert_eq!(a.balance, Balance::new(dec!(100)));
        assert_eq!(store.history(&"a".into()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_commit_transfer_rolls_back_on_receiver_overflow() {
        let store = ledger_with(&[("a", dec!(10), "INR"), ("full", Decimal::MAX, "INR")]).await;

        let result = store
            .commit_transfer(&transfer("a", "full", dec!(1), "INR"))
            .await;
        assert!(matches!(result, Err(EngineError::BalanceOverflow(_))));

        let a = store.account(&"a".into()).await.unwrap().unwrap();
        let full = store.account(&"full".into()).await.unwrap().unwrap();
        assert_eq!(a.balance, Balance::new(dec!(10)));
        assert_eq!(full.balance, Balance::new(Decimal::MAX));
        assert_eq!(store.history(&"a".into()).await.unwrap().len(), 1);
        assert!(matches!(
            store.credit(&"full".into(), amount(dec!(1))).await,
            Err(EngineError::BalanceOverflow(_))
        ));
    }

    #[tokio::test]
    async fn test_transfer_store_roundtrip_and_key_index() {
        let store = InMemoryTransferStore::new();
        let mut t = Transfer::new(
            &TransferRequest::new("a".into(), "b".into(), dec!(5), currency("INR"))
                .with_idempotency_key("key-1"),
        );

        store.insert(t.clone()).await.unwrap();
        assert_eq!(store.get(t.id).await.unwrap().unwrap(), t);
        assert_eq!(store.find_by_key("key-1").await.unwrap().unwrap().id, t.id);
        assert!(store.find_by_key("key-2").await.unwrap().is_none());

        t.begin_processing().unwrap();
        store.update(t.clone()).await.unwrap();
        assert_eq!(
            store.get(t.id).await.unwrap().unwrap().status,
            TransferStatus::Processing
        );
    }

    #[tokio::test]
    async fn test_transfer_store_refuses_to_touch_terminal_records() {
        let store = InMemoryTransferStore::new();
        let mut t = transfer("a", "b", dec!(5), "INR");
        t.begin_processing().unwrap();
        t.fail(FailureReason::InsufficientFunds).unwrap();
        store.insert(t.clone()).await.unwrap();

        let mut forged = t.clone();
        forged.status = TransferStatus::Success;
        forged.failure_reason = None;

        assert!(matches!(
            store.update(forged).await,
            Err(EngineError::InvalidTransition { .. })
        ));
        assert_eq!(store.get(t.id).await.unwrap().unwrap(), t);
    }

    #[tokio::test]
    async fn test_list_is_newest_first_and_filtered() {
        let store = InMemoryTransferStore::new();
        let first = transfer("a", "b", dec!(1), "INR");
        let mut second = transfer("b", "a", dec!(2), "INR");
        second.created_at = first.created_at + chrono::Duration::milliseconds(5);
        let third = transfer("c", "d", dec!(3), "INR");
        for t in [&first, &second, &third] {
            store.insert(t.clone()).await.unwrap();
        }

        let all_a = store
            .list(&TransferFilter::for_account("a".into()))
            .await
            .unwrap();
        assert_eq!(
            all_a.iter().map(|t| t.id).collect::<Vec<_>>(),
            vec![second.id, first.id]
        );

        let sent_a = store
            .list(&TransferFilter::for_account("a".into()).direction(Direction::Sent))
            .await
            .unwrap();
        assert_eq!(sent_a.len(), 1);
        assert_eq!(sent_a[0].id, first.id);
    }
}
