use crate::domain::account::{Account, AccountId, Balance, Currency};
use crate::error::{EngineError, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;

#[derive(Debug, Deserialize)]
struct AccountRow {
    account: String,
    balance: Decimal,
    currency: Currency,
    #[serde(default)]
    owner: Option<String>,
}

impl TryFrom<AccountRow> for Account {
    type Error = EngineError;

    fn try_from(row: AccountRow) -> Result<Self> {
        if row.account.is_empty() {
            return Err(EngineError::ValidationError(
                "Account id must not be empty".to_string(),
            ));
        }
        let mut account =
            Account::new(AccountId::new(row.account), row.currency).with_balance(Balance::new(row.balance));
        if let Some(owner) = row.owner.filter(|o| !o.is_empty()) {
            account = account.with_owner(owner);
        }
        Ok(account)
    }
}

/// Reads opening balances from a CSV source with the columns
/// `account, balance, currency[, owner]`.
pub struct AccountReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> AccountReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    pub fn accounts(self) -> impl Iterator<Item = Result<Account>> {
        self.reader.into_deserialize().map(|result| {
            result
                .map_err(EngineError::from)
                .and_then(|row: AccountRow| Account::try_from(row))
        })
    }
}
