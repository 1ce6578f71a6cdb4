//! Chain receipt log entries.
//!
//! Every chain action the coordinator sends is recorded once, whether it
//! succeeded or not.  Amounts are stored as decimal HBAR strings.

use serde::{Deserialize, Serialize};

use crate::staking::Compensation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptAction {
    Stake,
    CompleteTrip,
    Withdraw,
}

impl ReceiptAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stake => "stake",
            Self::CompleteTrip => "complete_trip",
            Self::Withdraw => "withdraw",
        }
    }
}

/// A receipt about to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReceipt {
    pub action: ReceiptAction,
    pub wallet: Option<String>,
    pub trip_id: Option<String>,
    pub amount: Option<String>,
    pub tx_hash: Option<String>,
    pub error: Option<String>,
    /// JSON-encoded [`Compensation`], withdrawals only.
    pub compensation: Option<String>,
}

impl NewReceipt {
    pub fn new(action: ReceiptAction) -> Self {
        NewReceipt {
            action,
            wallet: None,
            trip_id: None,
            amount: None,
            tx_hash: None,
            error: None,
            compensation: None,
        }
    }

    pub fn wallet(mut self, wallet: &str) -> Self {
        self.wallet = Some(wallet.to_string());
        self
    }

    pub fn trip(mut self, trip_id: u64) -> Self {
        self.trip_id = Some(trip_id.to_string());
        self
    }

    pub fn amount(mut self, amount: String) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn tx(mut self, tx_hash: &str) -> Self {
        self.tx_hash = Some(tx_hash.to_string());
        self
    }

    pub fn failed(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub fn compensation(mut self, compensation: &Compensation) -> Self {
        self.compensation = serde_json::to_string(compensation).ok();
        self
    }

    pub fn outcome(&self) -> &'static str {
        if self.error.is_some() {
            "failed"
        } else {
            "ok"
        }
    }
}

/// A receipt as stored in / read from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptRecord {
    pub id: i64,
    pub action: String,
    pub wallet: Option<String>,
    pub trip_id: Option<String>,
    pub amount: Option<String>,
    pub tx_hash: Option<String>,
    pub outcome: String,
    pub error: Option<String>,
    pub compensation: Option<String>,
    pub created_at: i64,
}
