use crate::domain::account::{AccountId, Currency};
use crate::domain::transfer::TransferRequest;
use crate::error::{EngineError, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;

#[derive(Debug, Deserialize)]
struct TransferRow {
    sender: String,
    receiver: String,
    amount: Decimal,
    currency: Currency,
    #[serde(default)]
    idempotency_key: Option<String>,
    #[serde(default)]
    nonce: Option<String>,
}

impl From<TransferRow> for TransferRequest {
    fn from(row: TransferRow) -> Self {
        let mut request = TransferRequest::new(
            AccountId::new(row.sender),
            AccountId::new(row.receiver),
            row.amount,
            row.currency,
        );
        if let Some(key) = row.idempotency_key.filter(|k| !k.is_empty()) {
            request = request.with_idempotency_key(key);
        }
        if let Some(nonce) = row.nonce.filter(|n| !n.is_empty()) {
            request = request.with_nonce(nonce);
        }
        request
    }
}

/// Reads transfer requests from a CSV source.
///
/// Expected columns are `sender, receiver, amount, currency`, optionally
/// followed by `idempotency_key` and `nonce`. Amounts are parsed as-is; a zero
/// or negative amount still becomes a request and fails in the engine with a
/// recorded reason.
pub struct TransferReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> TransferReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily deserializes requests, one `Result` per row.
    pub fn requests(self) -> impl Iterator<Item = Result<TransferRequest>> {
        self.reader.into_deserialize().map(|result| {
            result
                .map(|row: TransferRow| TransferRequest::from(row))
                .map_err(EngineError::from)
        })
    }
}
