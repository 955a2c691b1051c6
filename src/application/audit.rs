use crate::domain::account::{AccountId, Balance};
use crate::domain::ports::LedgerStore;
use crate::error::Result;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Violation {
    /// Stored balance disagrees with the sum of the account's history.
    BalanceMismatch { recorded: Balance, replayed: Balance },
    /// Summing the history leaves the range `Decimal` can represent.
    ReplayOverflow { recorded: Balance },
    NegativeBalance(Balance),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountViolation {
    pub account: AccountId,
    pub violation: Violation,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditReport {
    pub accounts_checked: usize,
    /// Sum of every balance; equals net external provisioning when clean.
    /// `None` once the sum no longer fits in a `Decimal`.
    pub total_balance: Option<Decimal>,
    pub violations: Vec<AccountViolation>,
}

impl Default for AuditReport {
    fn default() -> Self {
        Self {
            accounts_checked: 0,
            total_balance: Some(Decimal::ZERO),
            violations: Vec::new(),
        }
    }
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Replays every account's history against its stored balance.
///
/// Violations are reported, never repaired.
pub async fn audit_ledger(ledger: &dyn LedgerStore) -> Result<AuditReport> {
    let mut report = AuditReport::default();

    for account in ledger.accounts().await? {
        report.accounts_checked += 1;
        report.total_balance = report
            .total_balance
            .and_then(|total| total.checked_add(account.balance.value()));

        let replayed = ledger
            .history(&account.id)
            .await?
            .iter()
            .try_fold(Balance::ZERO, |acc, e| acc.checked_add(Balance::new(e.delta)));

        let mismatch = match replayed {
            None => Some(Violation::ReplayOverflow {
                recorded: account.balance,
            }),
            Some(replayed) if replayed != account.balance => Some(Violation::BalanceMismatch {
                recorded: account.balance,
                replayed,
            }),
            Some(_) => None,
        };
        if let Some(violation) = mismatch {
            report.violations.push(AccountViolation {
                account: account.id.clone(),
                violation,
            });
        }
        if account.balance.is_negative() {
            report.violations.push(AccountViolation {
                account: account.id.clone(),
                violation: Violation::NegativeBalance(account.balance),
            });
        }
    }

    for v in &report.violations {
        error!(account = %v.account, violation = ?v.violation, "Ledger invariant violated");
    }
    info!(
        accounts = report.accounts_checked,
        violations = report.violations.len(),
        "Ledger audit finished"
    );
    Ok(report)
}
