use crate::domain::account::AccountBalance;
use crate::error::Result;
use serde::Serialize;
use std::io::Write;

#[derive(Serialize)]
struct AccountRow<'a> {
    account: &'a str,
    balance: String,
    currency: &'a str,
}

/// Writes final balances as `account,balance,currency`, one row per account.
///
/// Balances are normalized, so `400.00` prints as `400`.
pub struct AccountWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> AccountWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_accounts<I>(&mut self, accounts: I) -> Result<()>
    where
        I: IntoIterator<Item = AccountBalance>,
    {
        let mut wrote_any = false;
        for account in accounts {
            self.writer.serialize(AccountRow {
                account: account.account.as_str(),
                balance: account.balance.to_string(),
                currency: account.currency.code(),
            })?;
            wrote_any = true;
        }
        if !wrote_any {
            self.writer.write_record(["account", "balance", "currency"])?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::account::{Balance, Currency};
    use rust_decimal_macros::dec;

    fn row(id: &str, balance: rust_decimal::Decimal) -> AccountBalance {
        AccountBalance {
            account: id.into(),
            balance: Balance::new(balance),
            currency: Currency::new("INR").unwrap(),
        }
    }

    #[test]
    fn test_writes_header_and_normalized_balances() {
        let mut out = Vec::new();
        AccountWriter::new(&mut out)
            .write_accounts([row("a", dec!(600.00)), row("b", dec!(400.50))])
            .unwrap();

        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "account,balance,currency\na,600,INR\nb,400.5,INR\n");
    }

    #[test]
    fn test_empty_input_still_has_header() {
        let mut out = Vec::new();
        AccountWriter::new(&mut out).write_accounts(Vec::new()).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "account,balance,currency\n");
    }
}
