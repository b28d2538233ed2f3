//! Broker account snapshots.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Latest known balance state of one broker account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub account_id: String,
    /// Client process that manages this account.
    pub owner: String,
    pub balance: Decimal,
    pub equity: Decimal,
    #[serde(default)]
    pub margin: Decimal,
    #[serde(default)]
    pub free_margin: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl AccountSnapshot {
    pub fn new(account_id: impl Into<String>, owner: impl Into<String>, balance: Decimal) -> Self {
        Self {
            account_id: account_id.into(),
            owner: owner.into(),
            balance,
            equity: balance,
            margin: Decimal::ZERO,
            free_margin: balance,
            updated_at: Utc::now(),
        }
    }

    /// Equity over margin, as a percentage. `None` when no margin is used.
    pub fn margin_level(&self) -> Option<Decimal> {
        if self.margin.is_zero() {
            None
        } else {
            Some(self.equity / self.margin * Decimal::ONE_HUNDRED)
        }
    }
}
