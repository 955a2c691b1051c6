use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Sub, SubAssign};

use super::transfer::TransferId;

/// Opaque account identifier.
///
/// Distinct from whatever user id the identity provider hands out; transfers
/// resolve both parties purely by this id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccountId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// ISO-4217 style currency code: exactly three ASCII uppercase letters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency(String);

impl Currency {
    pub fn new(code: &str) -> Result<Self> {
        let code = code.trim();
        if code.len() == 3 && code.bytes().all(|b| b.is_ascii_uppercase()) {
            Ok(Self(code.to_string()))
        } else {
            Err(EngineError::ValidationError(format!(
                "Invalid currency code '{}'",
                code
            )))
        }
    }

    pub fn code(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Currency {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(&value)
    }
}

impl From<Currency> for String {
    fn from(currency: Currency) -> Self {
        currency.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Represents a monetary value held by an account.
///
/// This is a wrapper around `rust_decimal::Decimal` to enforce domain-specific rules
/// and provide type safety for financial calculations.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Balance(pub Decimal);

/// Represents a positive monetary amount moved by a ledger operation.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Amount(Decimal);

impl Amount {
    pub fn new(value: Decimal) -> Result<Self> {
        if value > Decimal::ZERO {
            Ok(Self(value))
        } else {
            Err(EngineError::ValidationError(
                "Amount must be positive".to_string(),
            ))
        }
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = EngineError;

    fn try_from(value: Decimal) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

impl From<Amount> for Balance {
    fn from(amount: Amount) -> Self {
        Self(amount.0)
    }
}

impl Balance {
    pub const ZERO: Self = Self(Decimal::ZERO);

    pub fn new(amount: Decimal) -> Self {
        Self(amount)
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    /// `None` when the sum leaves the range `Decimal` can represent.
    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        self.0.checked_add(rhs.0).map(Self)
    }

    pub fn is_negative(&self) -> bool {
        self.0.is_sign_negative() && !self.0.is_zero()
    }
}

impl fmt::Display for Balance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.normalize())
    }
}

impl Sub for Balance {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl SubAssign for Balance {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

/// A funds-holding account.
///
/// Provisioned once from outside the engine and afterwards mutated only
/// through the ledger store.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Account {
    pub id: AccountId,
    /// Opaque reference to the owning user, if the provisioner supplied one.
    pub owner: Option<String>,
    pub balance: Balance,
    pub currency: Currency,
}

impl Account {
    pub fn new(id: AccountId, currency: Currency) -> Self {
        Self {
            id,
            owner: None,
            balance: Balance::ZERO,
            currency,
        }
    }

    pub fn with_balance(mut self, balance: Balance) -> Self {
        self.balance = balance;
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Adds funds to the balance, leaving it untouched if the result would
    /// overflow.
    pub fn credit(&mut self, amount: Amount) -> Result<()> {
        self.balance = self
            .balance
            .checked_add(amount.into())
            .ok_or_else(|| EngineError::BalanceOverflow(self.id.clone()))?;
        Ok(())
    }

    /// Removes funds from the balance if sufficient.
    pub fn debit(&mut self, amount: Amount) -> Result<()> {
        let amount: Balance = amount.into();
        if self.balance >= amount {
            self.balance -= amount;
            Ok(())
        } else {
            Err(EngineError::InsufficientFunds {
                account: self.id.clone(),
                balance: self.balance.value(),
                requested: amount.value(),
            })
        }
    }
}

/// Current balance as reported to callers.
#[derive(Debug, Serialize, PartialEq, Clone)]
pub struct AccountBalance {
    pub account: AccountId,
    pub balance: Balance,
    pub currency: Currency,
}

impl From<&Account> for AccountBalance {
    fn from(account: &Account) -> Self {
        Self {
            account: account.id.clone(),
            balance: account.balance,
            currency: account.currency.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Provision,
    Debit,
    Credit,
}

/// One immutable line of the append-only ledger history.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct LedgerEntry {
    /// Global sequence number, strictly increasing in commit order.
    pub seq: u64,
    pub account: AccountId,
    pub transfer_id: Option<TransferId>,
    pub kind: EntryKind,
    /// Signed change applied to the balance.
    pub delta: Decimal,
    pub balance_after: Balance,
    pub recorded_at: DateTime<Utc>,
}

/// Balance after the last entry recorded up to and including `at`.
///
/// Entries are expected in sequence order; returns `None` when the account
/// had no history yet at that instant.
pub fn balance_at(entries: &[LedgerEntry], at: DateTime<Utc>) -> Option<Balance> {
    entries
        .iter()
        .take_while(|e| e.recorded_at <= at)
        .last()
        .map(|e| e.balance_after)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn inr() -> Currency {
        Currency::new("INR").unwrap()
    }

    #[test]
    fn test_balance_arithmetic() {
        let b1 = Balance::new(dec!(10.0));
        let b2 = Balance::new(dec!(5.0));
        assert_eq!(b1.checked_add(b2), Some(Balance::new(dec!(15.0))));
        assert_eq!(b1 - b2, Balance::new(dec!(5.0)));
        assert!((b2 - b1).is_negative());
        assert!(!Balance::ZERO.is_negative());
    }

    #[test]
    fn test_balance_display_is_normalized() {
        assert_eq!(Balance::new(dec!(600.00)).to_string(), "600");
        assert_eq!(Balance::new(dec!(0.50)).to_string(), "0.5");
    }

    #[test]
    fn test_amount_validation() {
        assert!(Amount::new(dec!(1.0)).is_ok());
        assert!(matches!(
            Amount::new(dec!(0.0)),
            Err(EngineError::ValidationError(_))
        ));
        assert!(matches!(
            Amount::new(dec!(-1.0)),
            Err(EngineError::ValidationError(_))
        ));
    }

    #[test]
    fn test_currency_validation() {
        assert_eq!(Currency::new("USD").unwrap().code(), "USD");
        assert_eq!(Currency::new(" EUR ").unwrap().code(), "EUR");
        assert!(Currency::new("usd").is_err());
        assert!(Currency::new("EURO").is_err());
        assert!(Currency::new("").is_err());
    }

    #[test]
    fn test_account_credit() {
        let mut account = Account::new("a".into(), inr());
        account.credit(Amount::new(dec!(10.0)).unwrap()).unwrap();
        assert_eq!(account.balance, Balance::new(dec!(10.0)));
    }

    #[test]
    fn test_account_credit_overflow_keeps_balance() {
        let mut account = Account::new("a".into(), inr()).with_balance(Balance::new(Decimal::MAX));

        let result = account.credit(Amount::new(dec!(1)).unwrap());
        assert!(matches!(result, Err(EngineError::BalanceOverflow(_))));
        assert_eq!(account.balance, Balance::new(Decimal::MAX));
        assert_eq!(
            Balance::new(Decimal::MAX).checked_add(Balance::new(dec!(0.5))),
            None
        );
    }

    #[test]
    fn test_account_debit_success() {
        let mut account = Account::new("a".into(), inr()).with_balance(Balance::new(dec!(10.0)));

        let result = account.debit(Amount::new(dec!(5.0)).unwrap());
        assert!(result.is_ok());
        assert_eq!(account.balance, Balance::new(dec!(5.0)));
    }

    #[test]
    fn test_account_debit_entire_balance() {
        let mut account = Account::new("a".into(), inr()).with_balance(Balance::new(dec!(10.0)));

        account.debit(Amount::new(dec!(10.0)).unwrap()).unwrap();
        assert_eq!(account.balance, Balance::ZERO);
    }

    #[test]
    fn test_account_debit_insufficient() {
        let mut account = Account::new("a".into(), inr()).with_balance(Balance::new(dec!(10.0)));

        let result = account.debit(Amount::new(dec!(20.0)).unwrap());
        assert!(matches!(
            result,
            Err(EngineError::InsufficientFunds { .. })
        ));
        assert_eq!(account.balance, Balance::new(dec!(10.0)));
    }

    #[test]
    fn test_balance_at_reads_history() {
        let t0 = Utc::now();
        let entry = |seq, delta, after, offset| LedgerEntry {
            seq,
            account: "a".into(),
            transfer_id: None,
            kind: EntryKind::Credit,
            delta,
            balance_after: Balance::new(after),
            recorded_at: t0 + Duration::seconds(offset),
        };
        let entries = vec![
            entry(1, dec!(100), dec!(100), 0),
            entry(2, dec!(-40), dec!(60), 10),
            entry(3, dec!(15), dec!(75), 20),
        ];

        assert_eq!(balance_at(&entries, t0 - Duration::seconds(1)), None);
        assert_eq!(balance_at(&entries, t0), Some(Balance::new(dec!(100))));
        assert_eq!(
            balance_at(&entries, t0 + Duration::seconds(15)),
            Some(Balance::new(dec!(60)))
        );
        assert_eq!(
            balance_at(&entries, t0 + Duration::seconds(60)),
            Some(Balance::new(dec!(75)))
        );
    }

    #[test]
    fn test_account_serde_roundtrip_rejects_bad_currency() {
        let json = r#"{"id":"a","owner":null,"balance":"1","currency":"inr"}"#;
        assert!(serde_json::from_str::<Account>(json).is_err());
    }
}
