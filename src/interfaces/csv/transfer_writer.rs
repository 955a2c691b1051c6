use crate::domain::transfer::Transfer;
use crate::error::Result;
use serde::Serialize;
use std::io::Write;

const HEADER: [&str; 7] = [
    "transfer_id",
    "sender",
    "receiver",
    "amount",
    "currency",
    "status",
    "failure_reason",
];

#[derive(Serialize)]
struct TransferRow<'a> {
    transfer_id: String,
    sender: &'a str,
    receiver: &'a str,
    amount: String,
    currency: &'a str,
    status: &'static str,
    failure_reason: &'static str,
}

/// Writes one outcome row per transfer.
pub struct TransferWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> TransferWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(sink),
        }
    }

    pub fn write_transfers<'a, I>(&mut self, transfers: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a Transfer>,
    {
        self.writer.write_record(HEADER)?;
        for t in transfers {
            self.writer.serialize(TransferRow {
                transfer_id: t.id.to_string(),
                sender: t.sender.as_str(),
                receiver: t.receiver.as_str(),
                amount: t.amount.normalize().to_string(),
                currency: t.currency.code(),
                status: t.status.as_str(),
                failure_reason: t.failure_reason.map(|r| r.code()).unwrap_or(""),
            })?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::account::Currency;
    use crate::domain::transfer::{FailureReason, TransferRequest};
    use rust_decimal_macros::dec;

    #[test]
    fn test_writes_outcomes() {
        let request = TransferRequest::new(
            "a".into(),
            "b".into(),
            dec!(10.00),
            Currency::new("INR").unwrap(),
        );
        let mut ok = Transfer::new(&request);
        ok.begin_processing().unwrap();
        ok.succeed().unwrap();
        let mut failed = Transfer::new(&request);
        failed.begin_processing().unwrap();
        failed.fail(FailureReason::InsufficientFunds).unwrap();

        let mut out = Vec::new();
        TransferWriter::new(&mut out)
            .write_transfers([&ok, &failed])
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], HEADER.join(","));
        assert_eq!(lines[1], format!("{},a,b,10,INR,SUCCESS,", ok.id));
        assert_eq!(
            lines[2],
            format!("{},a,b,10,INR,FAILURE,InsufficientFunds", failed.id)
        );
    }
}
