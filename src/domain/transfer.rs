use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use super::account::{AccountId, Currency};

/// Transfer identifier.
///
/// ULID based, so ids sort by creation time without any coordination and
/// double as the idempotency and notification key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(ulid::Ulid);

impl TransferId {
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TransferId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(ulid::Ulid::from_string(s)?))
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
    Created,
    Processing,
    Success,
    Failure,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Success | TransferStatus::Failure)
    }

    /// Legal edges of the lifecycle. `Created -> Failure` is withdrawal only.
    pub fn can_transition_to(&self, to: TransferStatus) -> bool {
        matches!(
            (self, to),
            (TransferStatus::Created, TransferStatus::Processing)
                | (TransferStatus::Created, TransferStatus::Failure)
                | (TransferStatus::Processing, TransferStatus::Success)
                | (TransferStatus::Processing, TransferStatus::Failure)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Created => "CREATED",
            TransferStatus::Processing => "PROCESSING",
            TransferStatus::Success => "SUCCESS",
            TransferStatus::Failure => "FAILURE",
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CREATED" => Ok(TransferStatus::Created),
            "PROCESSING" => Ok(TransferStatus::Processing),
            "SUCCESS" => Ok(TransferStatus::Success),
            "FAILURE" | "FAILED" => Ok(TransferStatus::Failure),
            other => Err(EngineError::ValidationError(format!(
                "Unknown transfer status '{}'",
                other
            ))),
        }
    }
}

/// Why a transfer ended in `FAILURE`. Each guard has its own variant.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Hash)]
pub enum FailureReason {
    SenderNotFound,
    ReceiverNotFound,
    SelfTransfer,
    NonPositiveAmount,
    CurrencyMismatch,
    InsufficientFunds,
    BalanceOverflow,
    LockTimeout,
    StorageTimeout,
    StorageUnavailable,
    Cancelled,
}

impl FailureReason {
    /// Transient infrastructure failures. The engine never retries these
    /// itself; callers may resubmit under the same idempotency key.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureReason::LockTimeout
                | FailureReason::StorageTimeout
                | FailureReason::StorageUnavailable
        )
    }

    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::SenderNotFound => "SenderNotFound",
            FailureReason::ReceiverNotFound => "ReceiverNotFound",
            FailureReason::SelfTransfer => "SelfTransfer",
            FailureReason::NonPositiveAmount => "NonPositiveAmount",
            FailureReason::CurrencyMismatch => "CurrencyMismatch",
            FailureReason::InsufficientFunds => "InsufficientFunds",
            FailureReason::BalanceOverflow => "BalanceOverflow",
            FailureReason::LockTimeout => "LockTimeout",
            FailureReason::StorageTimeout => "StorageTimeout",
            FailureReason::StorageUnavailable => "StorageUnavailable",
            FailureReason::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            FailureReason::SenderNotFound => "sender account does not exist",
            FailureReason::ReceiverNotFound => "receiver account does not exist",
            FailureReason::SelfTransfer => "sender and receiver are the same account",
            FailureReason::NonPositiveAmount => "amount must be greater than zero",
            FailureReason::CurrencyMismatch => "sender and receiver currencies differ",
            FailureReason::InsufficientFunds => "sender balance is too low",
            FailureReason::BalanceOverflow => "receiver balance cannot hold that amount",
            FailureReason::LockTimeout => "account is busy, try again",
            FailureReason::StorageTimeout => "ledger did not respond in time, try again",
            FailureReason::StorageUnavailable => "ledger is unavailable, try again",
            FailureReason::Cancelled => "transfer was withdrawn before processing",
        };
        f.write_str(message)
    }
}

/// A caller's request to move funds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub sender: AccountId,
    pub receiver: AccountId,
    pub amount: Decimal,
    pub currency: Currency,
    pub idempotency_key: Option<String>,
    /// Client nonce used to derive a key when none is supplied.
    pub nonce: Option<String>,
}

impl TransferRequest {
    pub fn new(sender: AccountId, receiver: AccountId, amount: Decimal, currency: Currency) -> Self {
        Self {
            sender,
            receiver,
            amount,
            currency,
            idempotency_key: None,
            nonce: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_nonce(mut self, nonce: impl Into<String>) -> Self {
        self.nonce = Some(nonce.into());
        self
    }

    /// The key used for deduplication: the caller's key if given, otherwise
    /// one derived from the request and its nonce. Requests with neither are
    /// never deduplicated.
    pub fn effective_key(&self) -> Option<String> {
        match (&self.idempotency_key, &self.nonce) {
            (Some(key), _) if !key.trim().is_empty() => Some(key.trim().to_string()),
            (_, Some(nonce)) if !nonce.is_empty() => Some(derive_idempotency_key(
                &self.sender,
                &self.receiver,
                self.amount,
                &self.currency,
                nonce,
            )),
            _ => None,
        }
    }
}

/// Hex SHA-256 over the fields that make two submissions "the same".
pub fn derive_idempotency_key(
    sender: &AccountId,
    receiver: &AccountId,
    amount: Decimal,
    currency: &Currency,
    nonce: &str,
) -> String {
    let mut hasher = Sha256::new();
    for part in [
        sender.as_str(),
        receiver.as_str(),
        &amount.normalize().to_string(),
        currency.code(),
        nonce,
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// A transfer record and its lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: TransferId,
    pub sender: AccountId,
    pub receiver: AccountId,
    pub amount: Decimal,
    pub currency: Currency,
    pub status: TransferStatus,
    /// Present iff `status` is `Failure`.
    pub failure_reason: Option<FailureReason>,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set once the transfer reaches a terminal state.
    pub settled_at: Option<DateTime<Utc>>,
}

impl Transfer {
    pub fn new(request: &TransferRequest) -> Self {
        let now = Utc::now();
        Self {
            id: TransferId::new(),
            sender: request.sender.clone(),
            receiver: request.receiver.clone(),
            amount: request.amount,
            currency: request.currency.clone(),
            status: TransferStatus::Created,
            failure_reason: None,
            idempotency_key: request.effective_key(),
            created_at: now,
            updated_at: now,
            settled_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether `request` describes the same movement of funds as this transfer.
    pub fn matches(&self, request: &TransferRequest) -> bool {
        self.sender == request.sender
            && self.receiver == request.receiver
            && self.amount == request.amount
            && self.currency == request.currency
    }

    /// `CREATED -> PROCESSING`.
    pub fn begin_processing(&mut self) -> Result<()> {
        self.transition(TransferStatus::Processing, None)
    }

    /// `PROCESSING -> SUCCESS`.
    pub fn succeed(&mut self) -> Result<()> {
        self.expect_status(TransferStatus::Processing, TransferStatus::Success)?;
        self.transition(TransferStatus::Success, None)
    }

    /// `PROCESSING -> FAILURE`.
    pub fn fail(&mut self, reason: FailureReason) -> Result<()> {
        self.expect_status(TransferStatus::Processing, TransferStatus::Failure)?;
        self.transition(TransferStatus::Failure, Some(reason))
    }

    /// `CREATED -> FAILURE(Cancelled)`.
    pub fn cancel(&mut self) -> Result<()> {
        self.expect_status(TransferStatus::Created, TransferStatus::Failure)?;
        self.transition(TransferStatus::Failure, Some(FailureReason::Cancelled))
    }

    fn expect_status(&self, from: TransferStatus, to: TransferStatus) -> Result<()> {
        if self.status == from {
            Ok(())
        } else {
            Err(self.invalid(to))
        }
    }

    fn transition(&mut self, to: TransferStatus, reason: Option<FailureReason>) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(self.invalid(to));
        }
        let now = Utc::now();
        self.status = to;
        self.failure_reason = reason;
        self.updated_at = now;
        if to.is_terminal() {
            self.settled_at = Some(now);
        }
        Ok(())
    }

    fn invalid(&self, to: TransferStatus) -> EngineError {
        EngineError::InvalidTransition {
            id: self.id,
            from: self.status,
            to,
        }
    }
}

/// Returned to the submitter once the transfer has been driven as far as it goes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitReceipt {
    pub transfer_id: TransferId,
    pub status: TransferStatus,
    pub failure_reason: Option<FailureReason>,
}

impl From<&Transfer> for SubmitReceipt {
    fn from(transfer: &Transfer) -> Self {
        Self {
            transfer_id: transfer.id,
            status: transfer.status,
            failure_reason: transfer.failure_reason,
        }
    }
}

/// A status change pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusEvent {
    pub transfer_id: TransferId,
    pub status: TransferStatus,
    pub failure_reason: Option<FailureReason>,
    pub at: DateTime<Utc>,
}

impl From<&Transfer> for StatusEvent {
    fn from(transfer: &Transfer) -> Self {
        Self {
            transfer_id: transfer.id,
            status: transfer.status,
            failure_reason: transfer.failure_reason,
            at: transfer.updated_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    Sent,
    Received,
    #[default]
    All,
}

/// Selection for history listings.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TransferFilter {
    pub account: Option<AccountId>,
    pub direction: Direction,
    pub status: Option<TransferStatus>,
}

impl TransferFilter {
    pub fn for_account(account: AccountId) -> Self {
        Self {
            account: Some(account),
            ..Default::default()
        }
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn status(mut self, status: TransferStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn accepts(&self, transfer: &Transfer) -> bool {
        let party = match &self.account {
            None => true,
            Some(account) => match self.direction {
                Direction::Sent => &transfer.sender == account,
                Direction::Received => &transfer.receiver == account,
                Direction::All => &transfer.sender == account || &transfer.receiver == account,
            },
        };
        party && self.status.is_none_or(|s| s == transfer.status)
    }
}

/// Per-account counts, as shown on the dashboard summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TransferSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub pending: usize,
}

impl TransferSummary {
    pub fn tally<'a>(transfers: impl IntoIterator<Item = &'a Transfer>) -> Self {
        transfers
            .into_iter()
            .fold(Self::default(), |mut summary, transfer| {
                summary.total += 1;
                match transfer.status {
                    TransferStatus::Success => summary.succeeded += 1,
                    TransferStatus::Failure => summary.failed += 1,
                    TransferStatus::Created | TransferStatus::Processing => summary.pending += 1,
                }
                summary
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn request(amount: Decimal) -> TransferRequest {
        TransferRequest::new(
            "alice".into(),
            "bob".into(),
            amount,
            Currency::new("INR").unwrap(),
        )
    }

    #[test]
    fn test_lifecycle_success() {
        let mut transfer = Transfer::new(&request(dec!(10)));
        assert_eq!(transfer.status, TransferStatus::Created);
        assert!(transfer.settled_at.is_none());

        transfer.begin_processing().unwrap();
        transfer.succeed().unwrap();

        assert_eq!(transfer.status, TransferStatus::Success);
        assert!(transfer.failure_reason.is_none());
        assert!(transfer.settled_at.is_some());
    }

    #[test]
    fn test_failure_carries_reason() {
        let mut transfer = Transfer::new(&request(dec!(10)));
        transfer.begin_processing().unwrap();
        transfer.fail(FailureReason::InsufficientFunds).unwrap();

        assert_eq!(transfer.status, TransferStatus::Failure);
        assert_eq!(
            transfer.failure_reason,
            Some(FailureReason::InsufficientFunds)
        );
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut transfer = Transfer::new(&request(dec!(10)));
        transfer.begin_processing().unwrap();
        transfer.succeed().unwrap();
        let frozen = transfer.clone();

        assert!(matches!(
            transfer.fail(FailureReason::LockTimeout),
            Err(EngineError::InvalidTransition { .. })
        ));
        assert!(transfer.begin_processing().is_err());
        assert!(transfer.cancel().is_err());
        assert!(transfer.succeed().is_err());
        assert_eq!(transfer, frozen);
    }

    #[test]
    fn test_cannot_skip_processing() {
        let mut transfer = Transfer::new(&request(dec!(10)));
        assert!(transfer.succeed().is_err());
        assert!(transfer.fail(FailureReason::SelfTransfer).is_err());
        assert_eq!(transfer.status, TransferStatus::Created);
    }

    #[test]
    fn test_cancel_only_from_created() {
        let mut created = Transfer::new(&request(dec!(10)));
        created.cancel().unwrap();
        assert_eq!(created.failure_reason, Some(FailureReason::Cancelled));

        let mut processing = Transfer::new(&request(dec!(10)));
        processing.begin_processing().unwrap();
        assert!(processing.cancel().is_err());
        assert_eq!(processing.status, TransferStatus::Processing);
    }

    #[test]
    fn test_effective_key_prefers_caller_key() {
        let req = request(dec!(10)).with_idempotency_key("k-1").with_nonce("n");
        assert_eq!(req.effective_key().as_deref(), Some("k-1"));
        assert_eq!(request(dec!(10)).effective_key(), None);
    }

    #[test]
    fn test_derived_key_is_stable_and_sensitive() {
        let a = request(dec!(10)).with_nonce("n1").effective_key().unwrap();
        let b = request(dec!(10.00)).with_nonce("n1").effective_key().unwrap();
        let c = request(dec!(11)).with_nonce("n1").effective_key().unwrap();
        let d = request(dec!(10)).with_nonce("n2").effective_key().unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!(
            "success".parse::<TransferStatus>().unwrap(),
            TransferStatus::Success
        );
        assert_eq!(
            "FAILED".parse::<TransferStatus>().unwrap(),
            TransferStatus::Failure
        );
        assert!("done".parse::<TransferStatus>().is_err());
    }

    #[test]
    fn test_filter_and_summary() {
        let mut sent = Transfer::new(&request(dec!(1)));
        sent.begin_processing().unwrap();
        sent.succeed().unwrap();

        let mut received = Transfer::new(&TransferRequest::new(
            "bob".into(),
            "alice".into(),
            dec!(2),
            Currency::new("INR").unwrap(),
        ));
        received.begin_processing().unwrap();
        received.fail(FailureReason::InsufficientFunds).unwrap();

        let pending = Transfer::new(&request(dec!(3)));
        let all = [sent.clone(), received.clone(), pending];

        let alice_sent = TransferFilter::for_account("alice".into()).direction(Direction::Sent);
        assert_eq!(all.iter().filter(|t| alice_sent.accepts(t)).count(), 2);

        let alice_received =
            TransferFilter::for_account("alice".into()).direction(Direction::Received);
        assert!(alice_received.accepts(&received));
        assert!(!alice_received.accepts(&sent));

        let failed = TransferFilter::default().status(TransferStatus::Failure);
        assert_eq!(all.iter().filter(|t| failed.accepts(t)).count(), 1);

        let summary = TransferSummary::tally(&all);
        assert_eq!(
            summary,
            TransferSummary {
                total: 3,
                succeeded: 1,
                failed: 1,
                pending: 1
            }
        );
    }
}
