use crate::application::audit::{AuditReport, audit_ledger};
use crate::application::guard::ConcurrencyGuard;
use crate::application::notifier::{self, StatusNotifier};
use crate::config::EngineConfig;
use crate::domain::account::{Account, AccountBalance, AccountId, Amount, Balance, LedgerEntry, balance_at};
use crate::domain::ports::{LedgerStoreBox, TransferStoreBox};
use crate::domain::transfer::{
    Direction, FailureReason, StatusEvent, SubmitReceipt, Transfer, TransferFilter, TransferId,
    TransferRequest, TransferStatus, TransferSummary,
};
use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use tracing::{debug, error, info, warn};

/// The payment transfer engine.
///
/// `TransferEngine` owns the storage backends and drives each transfer through
/// `CREATED -> PROCESSING -> SUCCESS | FAILURE`. All methods take `&self`, so
/// one engine behind an `Arc` serves any number of concurrent tasks; ordering
/// between them comes from the concurrency guard, not from the caller.
pub struct TransferEngine {
    ledger: LedgerStoreBox,
    transfers: TransferStoreBox,
    guard: ConcurrencyGuard,
    notifier: StatusNotifier,
    config: EngineConfig,
}

impl TransferEngine {
    /// Creates a new `TransferEngine` with default configuration.
    ///
    /// # Arguments
    ///
    /// * `ledger` - The store owning account balances and history.
    /// * `transfers` - The store for transfer records.
    pub fn new(ledger: LedgerStoreBox, transfers: TransferStoreBox) -> Self {
        Self::with_config(ledger, transfers, EngineConfig::default())
    }

    pub fn with_config(
        ledger: LedgerStoreBox,
        transfers: TransferStoreBox,
        config: EngineConfig,
    ) -> Self {
        Self {
            ledger,
            transfers,
            guard: ConcurrencyGuard::new(config.lock_timeout()),
            notifier: StatusNotifier::new(),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Provisions an account with its opening balance.
    pub async fn open_account(&self, account: Account) -> Result<()> {
        let (id, balance) = (account.id.clone(), account.balance);
        self.ledger.open_account(account).await?;
        info!(account = %id, balance = %balance, "Account provisioned");
        Ok(())
    }

    /// Creates the transfer and drives it to a terminal state.
    pub async fn submit(&self, request: TransferRequest) -> Result<SubmitReceipt> {
        let created = self.create(request).await?;
        let transfer = self.execute(created.id).await?;
        Ok(SubmitReceipt::from(&transfer))
    }

    /// Persists a new transfer in `CREATED`, or returns the transfer already
    /// bound to the request's idempotency key.
    ///
    /// A key is re-bound to a new transfer only when the previous one failed
    /// for a retryable reason.
    pub async fn create(&self, request: TransferRequest) -> Result<Transfer> {
        let key = request.effective_key();
        let _key_lock = match &key {
            Some(key) => Some(self.guard.lock_key(key).await?),
            None => None,
        };

        if let Some(key) = &key
            && let Some(existing) = self.transfers.find_by_key(key).await?
        {
            if !existing.matches(&request) {
                warn!(key = %key, transfer_id = %existing.id, "Idempotency key reused with different parameters");
                return Err(EngineError::IdempotencyConflict(key.clone()));
            }
            match existing.failure_reason {
                Some(reason) if reason.is_retryable() => {
                    info!(key = %key, previous = %existing.id, reason = %reason.code(), "Retrying under existing key");
                }
                _ => {
                    info!(key = %key, transfer_id = %existing.id, "Duplicate submission, returning existing transfer");
                    return Ok(existing);
                }
            }
        }

        let transfer = Transfer::new(&request);
        self.notifier.register(StatusEvent::from(&transfer));
        if let Err(e) = self.transfers.insert(transfer.clone()).await {
            self.notifier.forget(transfer.id);
            return Err(e);
        }

        info!(
            transfer_id = %transfer.id,
            sender = %transfer.sender,
            receiver = %transfer.receiver,
            amount = %transfer.amount,
            currency = %transfer.currency,
            "Transfer created"
        );
        Ok(transfer)
    }

    /// Drives a `CREATED` transfer to its terminal state.
    ///
    /// Transfers already past `CREATED` are returned as they are, so calling
    /// this twice never moves funds twice.
    pub async fn execute(&self, id: TransferId) -> Result<Transfer> {
        let result = self.drive(id).await;
        if result.is_err() {
            // Nobody will publish a terminal event for it from here.
            self.notifier.forget(id);
        }
        result
    }

    async fn drive(&self, id: TransferId) -> Result<Transfer> {
        let _run = match self.guard.lock_transfer(id, self.execution_bound()).await {
            Ok(lock) => lock,
            // Someone else is driving it; report where it stands.
            Err(EngineError::LockTimeout(_)) => return self.transfer(id).await,
            Err(e) => return Err(e),
        };

        let mut transfer = self.transfer(id).await?;
        if transfer.status != TransferStatus::Created {
            debug!(transfer_id = %id, status = %transfer.status, "Transfer already executed");
            return Ok(transfer);
        }

        transfer.begin_processing()?;
        self.persist(&transfer).await?;

        match self.move_funds(&transfer).await {
            Ok(()) => transfer.succeed()?,
            Err(reason) => transfer.fail(reason)?,
        }
        self.persist(&transfer).await?;

        match transfer.failure_reason {
            None => info!(transfer_id = %id, "Transfer succeeded"),
            Some(reason) => info!(
                transfer_id = %id,
                reason = %reason.code(),
                retryable = reason.is_retryable(),
                "Transfer failed: {}",
                reason
            ),
        }
        Ok(transfer)
    }

    /// Withdraws a transfer that has not started processing.
    pub async fn cancel(&self, id: TransferId) -> Result<Transfer> {
        let _run = self.guard.lock_transfer(id, self.execution_bound()).await?;
        let mut transfer = self.transfer(id).await?;
        if let Err(e) = transfer.cancel() {
            warn!(transfer_id = %id, status = %transfer.status, "Cancellation refused");
            return Err(e);
        }
        self.persist(&transfer).await?;
        info!(transfer_id = %id, "Transfer cancelled");
        Ok(transfer)
    }

    /// Validates and commits the movement of funds.
    ///
    /// Checks run in a fixed order so the reported reason is deterministic.
    /// Funds are checked here and again by the ledger under the account locks.
    async fn move_funds(&self, transfer: &Transfer) -> std::result::Result<(), FailureReason> {
        let sender = self
            .lookup(&transfer.sender)
            .await?
            .ok_or(FailureReason::SenderNotFound)?;
        let receiver = self
            .lookup(&transfer.receiver)
            .await?
            .ok_or(FailureReason::ReceiverNotFound)?;
        if sender.id == receiver.id {
            return Err(FailureReason::SelfTransfer);
        }
        let amount = Amount::new(transfer.amount).map_err(|_| FailureReason::NonPositiveAmount)?;
        if sender.currency != transfer.currency || receiver.currency != transfer.currency {
            return Err(FailureReason::CurrencyMismatch);
        }
        if sender.balance < Balance::from(amount) {
            return Err(FailureReason::InsufficientFunds);
        }

        let _locks = self
            .guard
            .lock_accounts(&transfer.sender, &transfer.receiver)
            .await
            .map_err(|_| FailureReason::LockTimeout)?;

        match tokio::time::timeout(
            self.config.commit_timeout(),
            self.ledger.commit_transfer(transfer),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(self.classify(transfer, e)),
            Err(_) => {
                warn!(transfer_id = %transfer.id, "Ledger commit timed out");
                self.settle_after_timeout(transfer).await
            }
        }
    }

    /// Decides a timed-out commit from the ledger itself, so a commit that
    /// landed late is never reported as retryable.
    async fn settle_after_timeout(&self, transfer: &Transfer) -> std::result::Result<(), FailureReason> {
        match tokio::time::timeout(self.config.commit_timeout(), self.has_ledger_entries(transfer)).await {
            Ok(Ok(true)) => {
                warn!(transfer_id = %transfer.id, "Commit landed after the timeout");
                Ok(())
            }
            Ok(Ok(false)) => Err(FailureReason::StorageTimeout),
            Ok(Err(e)) => {
                error!(transfer_id = %transfer.id, error = %e, "Could not verify timed-out commit");
                Err(FailureReason::StorageTimeout)
            }
            Err(_) => {
                error!(transfer_id = %transfer.id, "Could not verify timed-out commit in time");
                Err(FailureReason::StorageTimeout)
            }
        }
    }

    async fn has_ledger_entries(&self, transfer: &Transfer) -> Result<bool> {
        Ok(self
            .ledger
            .history(&transfer.sender)
            .await?
            .iter()
            .any(|e| e.transfer_id == Some(transfer.id)))
    }

    /// Settles transfers an earlier run left in `PROCESSING`.
    ///
    /// A transfer whose id tags ledger entries committed and becomes
    /// `SUCCESS`; any other never reached the ledger and fails as
    /// `StorageUnavailable`, which callers may retry. Returns how many
    /// records were settled.
    pub async fn reconcile(&self) -> Result<usize> {
        let filter = TransferFilter::default().status(TransferStatus::Processing);
        let mut settled = 0;

        for stuck in self.transfers.list(&filter).await? {
            let _run = self.guard.lock_transfer(stuck.id, self.execution_bound()).await?;
            let mut transfer = self.transfer(stuck.id).await?;
            if transfer.status != TransferStatus::Processing {
                continue;
            }

            if self.has_ledger_entries(&transfer).await? {
                transfer.succeed()?;
            } else {
                transfer.fail(FailureReason::StorageUnavailable)?;
            }
            self.persist(&transfer).await?;
            warn!(transfer_id = %transfer.id, status = %transfer.status, "Settled interrupted transfer");
            settled += 1;
        }
        Ok(settled)
    }

    async fn lookup(&self, id: &AccountId) -> std::result::Result<Option<Account>, FailureReason> {
        self.ledger.account(id).await.map_err(|e| {
            error!(account = %id, error = %e, "Ledger read failed");
            FailureReason::StorageUnavailable
        })
    }

    fn classify(&self, transfer: &Transfer, e: EngineError) -> FailureReason {
        match e {
            EngineError::InsufficientFunds { .. } => FailureReason::InsufficientFunds,
            EngineError::AccountNotFound(id) if id == transfer.receiver => {
                FailureReason::ReceiverNotFound
            }
            EngineError::AccountNotFound(_) => FailureReason::SenderNotFound,
            EngineError::CurrencyMismatch { .. } => FailureReason::CurrencyMismatch,
            EngineError::BalanceOverflow(_) => FailureReason::BalanceOverflow,
            EngineError::ValidationError(_) => FailureReason::NonPositiveAmount,
            other => {
                error!(transfer_id = %transfer.id, error = %other, "Ledger commit failed");
                FailureReason::StorageUnavailable
            }
        }
    }

    /// Stores the record, then tells subscribers.
    async fn persist(&self, transfer: &Transfer) -> Result<()> {
        if let Err(e) = self.transfers.update(transfer.clone()).await {
            if matches!(e, EngineError::InvalidTransition { .. }) {
                error!(transfer_id = %transfer.id, error = %e, "Refusing to modify a terminal transfer");
            }
            return Err(e);
        }
        self.notifier.publish(StatusEvent::from(transfer));
        Ok(())
    }

    /// Upper bound for one full execution: both lock waits plus the commit.
    fn execution_bound(&self) -> std::time::Duration {
        self.config.lock_timeout() * 2 + self.config.commit_timeout()
    }

    /// Full record of a transfer.
    pub async fn transfer(&self, id: TransferId) -> Result<Transfer> {
        self.transfers
            .get(id)
            .await?
            .ok_or(EngineError::TransferNotFound(id))
    }

    /// Stream of status changes for `id`, ending after the terminal state.
    ///
    /// Transfers that already settled yield their final state once, read from
    /// the transfer store.
    pub async fn subscribe(&self, id: TransferId) -> Result<BoxStream<'static, StatusEvent>> {
        if let Some(stream) = self.notifier.subscribe(id) {
            return Ok(stream);
        }
        let transfer = self.transfer(id).await?;
        Ok(notifier::once(StatusEvent::from(&transfer)))
    }

    pub async fn balance(&self, account: &AccountId) -> Result<AccountBalance> {
        self.ledger
            .account(account)
            .await?
            .map(|a| AccountBalance::from(&a))
            .ok_or_else(|| EngineError::AccountNotFound(account.clone()))
    }

    /// Balance as it was at `at`, replayed from the ledger history.
    pub async fn balance_at(&self, account: &AccountId, at: DateTime<Utc>) -> Result<Balance> {
        let history = self.history(account).await?;
        Ok(balance_at(&history, at).unwrap_or(Balance::ZERO))
    }

    pub async fn history(&self, account: &AccountId) -> Result<Vec<LedgerEntry>> {
        if self.ledger.account(account).await?.is_none() {
            return Err(EngineError::AccountNotFound(account.clone()));
        }
        self.ledger.history(account).await
    }

    pub async fn accounts(&self) -> Result<Vec<Account>> {
        self.ledger.accounts().await
    }

    /// Transfers touching `account`, newest first.
    pub async fn list_transfers(
        &self,
        account: &AccountId,
        direction: Direction,
        status: Option<TransferStatus>,
    ) -> Result<Vec<Transfer>> {
        let filter = TransferFilter {
            account: Some(account.clone()),
            direction,
            status,
        };
        self.transfers.list(&filter).await
    }

    pub async fn summary(&self, account: &AccountId) -> Result<TransferSummary> {
        let transfers = self
            .list_transfers(account, Direction::All, None)
            .await?;
        Ok(TransferSummary::tally(&transfers))
    }

    pub async fn audit(&self) -> Result<AuditReport> {
        audit_ledger(self.ledger.as_ref()).await
    }
}
