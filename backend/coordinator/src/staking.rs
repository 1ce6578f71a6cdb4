//! Staking workflow over the `AgentStaking` contract.
//!
//! The contract owns the trip records; this module only consults and drives
//! it through the [`StakingLedger`] seam:
//!
//! ```text
//! active ──completeTrip(success=true)──►  completed (stakes stay withdrawable)
//!    └────completeTrip(success=false)──►  completed (stakes slashed)
//! ```
//!
//! ## Withdrawal
//!
//! Withdrawal is a two-phase action.  The release phase pauses the contract,
//! drains it to the operator with `emergencyWithdraw`, forwards the user's
//! balance and unpauses.  If any release step fails, the compensation phase
//! sends one `setPaused(false)` and reports how that went in a
//! [`Compensation`] record.  The original error always wins: a failed
//! compensation never replaces it.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::errors::{CoordinatorError, Result};
use crate::evm::{format_ether, Address};

/// Chain operations the coordinator needs.  Amounts are in wei; every write
/// returns the confirmed transaction hash.
#[async_trait]
pub trait StakingLedger: Send + Sync {
    async fn balance_of(&self, wallet: &str) -> Result<u128>;
    async fn trip_total(&self, trip_id: u64) -> Result<u128>;
    async fn trip_completed(&self, trip_id: u64) -> Result<bool>;
    async fn complete_trip(&self, trip_id: u64, success: bool) -> Result<String>;
    async fn stake_on_behalf(&self, wallet: &str, amount_wei: u128, trip_id: u64) -> Result<String>;
    async fn set_paused(&self, paused: bool) -> Result<String>;
    async fn emergency_withdraw(&self) -> Result<String>;
    async fn transfer(&self, to: &str, amount_wei: u128) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TripOutcome {
    /// Stakes stay in participant balances.
    Released,
    /// Stakes are removed from participant balances.
    Slashed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TripCompletion {
    pub trip_id: u64,
    pub outcome: TripOutcome,
    pub transaction_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TripState {
    pub trip_id: u64,
    pub completed: bool,
    pub total_staked_wei: String,
    pub total_staked: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawalReceipt {
    pub wallet: String,
    pub amount_wei: u128,
    /// Hash of the transfer that paid the user.
    pub transaction_id: String,
}

impl WithdrawalReceipt {
    pub fn amount(&self) -> String {
        format_ether(self.amount_wei)
    }
}

/// Result of the compensating `setPaused(false)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Compensation {
    pub attempted: bool,
    pub succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct WithdrawalFailure {
    pub error: CoordinatorError,
    /// `None` when the failure happened before any release step ran.
    pub compensation: Option<Compensation>,
    /// Balance that was about to be released, if it was read.
    pub amount_wei: Option<u128>,
}

impl From<CoordinatorError> for WithdrawalFailure {
    fn from(error: CoordinatorError) -> Self {
        WithdrawalFailure {
            error,
            compensation: None,
            amount_wei: None,
        }
    }
}

/// Transactions sent while staking on behalf of a group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StakeBatch {
    pub trip_id: u64,
    /// `(wallet, tx hash)` for every confirmed stake, in participant order.
    pub staked: Vec<(String, String)>,
    /// First failure; staking stops there.
    pub error: Option<String>,
    pub failed_wallet: Option<String>,
}

impl StakeBatch {
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }

    pub fn transactions(&self) -> Vec<String> {
        self.staked.iter().map(|(_, tx)| tx.clone()).collect()
    }
}

pub struct StakingWorkflow {
    ledger: Arc<dyn StakingLedger>,
}

impl StakingWorkflow {
    pub fn new(ledger: Arc<dyn StakingLedger>) -> Self {
        StakingWorkflow { ledger }
    }

    pub async fn balance(&self, wallet: &str) -> Result<u128> {
        wallet.parse::<Address>()?;
        self.ledger.balance_of(wallet).await
    }

    pub async fn trip_state(&self, trip_id: u64) -> Result<TripState> {
        let completed = self.ledger.trip_completed(trip_id).await?;
        let total = self.ledger.trip_total(trip_id).await?;
        Ok(TripState {
            trip_id,
            completed,
            total_staked_wei: total.to_string(),
            total_staked: format_ether(total),
        })
    }

    /// Finish a trip on-chain.  This transition is irreversible, so an already
    /// completed trip is rejected locally without sending anything.
    pub async fn complete_trip(&self, trip_id: u64, success: bool) -> Result<TripCompletion> {
        if self.ledger.trip_completed(trip_id).await? {
            return Err(CoordinatorError::TripAlreadyCompleted(trip_id));
        }

        let transaction_hash = self.ledger.complete_trip(trip_id, success).await?;
        let outcome = if success {
            TripOutcome::Released
        } else {
            TripOutcome::Slashed
        };
        info!("Trip {trip_id} completed ({outcome:?}) in tx {transaction_hash}");

        Ok(TripCompletion {
            trip_id,
            outcome,
            transaction_hash,
        })
    }

    /// Stake `amount_wei` for every wallet under `trip_id`, one transaction
    /// each, stopping at the first failure.  `on_staked` runs after every
    /// confirmed stake.
    pub async fn stake_for_group<F>(
        &self,
        wallets: &[String],
        amount_wei: u128,
        trip_id: u64,
        mut on_staked: F,
    ) -> StakeBatch
    where
        F: FnMut(&str, &str) + Send,
    {
        let mut batch = StakeBatch {
            trip_id,
            ..StakeBatch::default()
        };

        for wallet in wallets {
            let staked = match wallet.parse::<Address>() {
                Ok(_) => self.ledger.stake_on_behalf(wallet, amount_wei, trip_id).await,
                Err(e) => Err(e),
            };
            match staked {
                Ok(tx_hash) => {
                    info!("Staked {} for {wallet} in tx {tx_hash}", format_ether(amount_wei));
                    on_staked(wallet, &tx_hash);
                    batch.staked.push((wallet.clone(), tx_hash));
                }
                Err(e) => {
                    warn!("Staking for {wallet} failed: {e}");
                    batch.error = Some(e.to_string());
                    batch.failed_wallet = Some(wallet.clone());
                    break;
                }
            }
        }
        batch
    }

    /// Pay out a user's full contract balance.
    pub async fn withdraw(
        &self,
        wallet: &str,
    ) -> std::result::Result<WithdrawalReceipt, WithdrawalFailure> {
        wallet.parse::<Address>()?;

        let balance = self.ledger.balance_of(wallet).await?;
        info!("Withdrawal request for {wallet}: balance {}", format_ether(balance));
        if balance == 0 {
            return Err(CoordinatorError::NothingToWithdraw.into());
        }

        match self.release(wallet, balance).await {
            Ok(transaction_id) => {
                info!("Withdrawal for {wallet} complete in tx {transaction_id}");
                Ok(WithdrawalReceipt {
                    wallet: wallet.to_string(),
                    amount_wei: balance,
                    transaction_id,
                })
            }
            Err(error) => {
                error!("Withdrawal for {wallet} failed: {error}");
                let compensation = self.compensate().await;
                Err(WithdrawalFailure {
                    error,
                    compensation: Some(compensation),
                    amount_wei: Some(balance),
                })
            }
        }
    }

    async fn release(&self, wallet: &str, balance: u128) -> Result<String> {
        self.ledger.set_paused(true).await?;
        self.ledger.emergency_withdraw().await?;
        let transfer_tx = self.ledger.transfer(wallet, balance).await?;
        self.ledger.set_paused(false).await?;
        Ok(transfer_tx)
    }

    async fn compensate(&self) -> Compensation {
        match self.ledger.set_paused(false).await {
            Ok(tx_hash) => {
                info!("Compensating unpause succeeded in tx {tx_hash}");
                Compensation {
                    attempted: true,
                    succeeded: true,
                    transaction_hash: Some(tx_hash),
                    error: None,
                }
            }
            Err(e) => {
                error!("Could not unpause contract: {e}");
                Compensation {
                    attempted: true,
                    succeeded: false,
                    transaction_hash: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeLedger;
    use super::*;

    const ALICE: &str = "0xa01bfafbb205c64fcca21fbe0d6d70642b78dfa3";
    const BOB: &str = "0x3f61590c3285332dc63503d5a2d917d3a8014ebc";
    const ONE: u128 = 1_000_000_000_000_000_000;

    fn workflow(ledger: FakeLedger) -> (StakingWorkflow, Arc<FakeLedger>) {
        let ledger = Arc::new(ledger);
        (StakingWorkflow::new(ledger.clone()), ledger)
    }

    #[tokio::test]
    async fn zero_balance_sends_nothing() {
        let (flow, ledger) = workflow(FakeLedger::new());
        let failure = flow.withdraw(ALICE).await.unwrap_err();

        assert!(matches!(failure.error, CoordinatorError::NothingToWithdraw));
        assert!(failure.compensation.is_none());
        assert_eq!(ledger.calls(), vec!["balance_of"]);
    }

    #[tokio::test]
    async fn invalid_wallet_is_rejected_before_chain_access() {
        let (flow, ledger) = workflow(FakeLedger::new());
        let failure = flow.withdraw("not-an-address").await.unwrap_err();
        assert!(matches!(failure.error, CoordinatorError::InvalidAddress(_)));
        assert!(ledger.calls().is_empty());
    }

    #[tokio::test]
    async fn successful_withdrawal_runs_release_steps_in_order() {
        let (flow, ledger) = workflow(FakeLedger::new().with_balance(ALICE, 2 * ONE));
        let receipt = flow.withdraw(ALICE).await.unwrap();

        assert_eq!(receipt.amount_wei, 2 * ONE);
        assert_eq!(receipt.amount(), "2.0");
        assert_eq!(
            ledger.calls(),
            vec!["balance_of", "pause", "emergency_withdraw", "transfer", "unpause"]
        );
        // The transfer is the third transaction sent.
        assert_eq!(receipt.transaction_id, format!("0x{:064x}", 3));
    }

    #[tokio::test]
    async fn failed_release_is_compensated_once() {
        let (flow, ledger) = workflow(
            FakeLedger::new()
                .with_balance(ALICE, ONE)
                .failing("emergency_withdraw", 1),
        );
        let failure = flow.withdraw(ALICE).await.unwrap_err();

        assert_eq!(failure.error.to_string(), "RPC error: emergency_withdraw reverted");
        let compensation = failure.compensation.unwrap();
        assert!(compensation.attempted);
        assert!(compensation.succeeded);
        assert!(compensation.transaction_hash.is_some());
        assert_eq!(failure.amount_wei, Some(ONE));
        assert_eq!(
            ledger.calls(),
            vec!["balance_of", "pause", "emergency_withdraw", "unpause"]
        );
    }

    #[tokio::test]
    async fn failed_compensation_keeps_original_error() {
        let (flow, ledger) = workflow(
            FakeLedger::new()
                .with_balance(ALICE, ONE)
                .failing("transfer", 1)
                .failing("unpause", 1),
        );
        let failure = flow.withdraw(ALICE).await.unwrap_err();

        assert_eq!(failure.error.to_string(), "RPC error: transfer reverted");
        let compensation = failure.compensation.unwrap();
        assert!(compensation.attempted);
        assert!(!compensation.succeeded);
        assert_eq!(
            compensation.error.as_deref(),
            Some("RPC error: unpause reverted")
        );
        let unpauses = ledger.calls().iter().filter(|c| *c == "unpause").count();
        assert_eq!(unpauses, 1);
    }

    #[tokio::test]
    async fn failed_final_unpause_is_retried_by_compensation() {
        let (flow, ledger) = workflow(
            FakeLedger::new()
                .with_balance(ALICE, ONE)
                .failing("unpause", 1),
        );
        let failure = flow.withdraw(ALICE).await.unwrap_err();

        assert!(failure.compensation.unwrap().succeeded);
        assert_eq!(
            ledger.calls(),
            vec![
                "balance_of",
                "pause",
                "emergency_withdraw",
                "transfer",
                "unpause",
                "unpause"
            ]
        );
    }

    #[tokio::test]
    async fn balance_read_failure_is_not_compensated() {
        let (flow, ledger) = workflow(FakeLedger::new().failing("balance_of", 1));
        let failure = flow.withdraw(ALICE).await.unwrap_err();
        assert!(failure.compensation.is_none());
        assert_eq!(ledger.calls(), vec!["balance_of"]);
    }

    #[tokio::test]
    async fn completing_a_trip_reports_outcome() {
        let (flow, _) = workflow(FakeLedger::new());
        let released = flow.complete_trip(1, true).await.unwrap();
        assert_eq!(released.outcome, TripOutcome::Released);

        let slashed = flow.complete_trip(2, false).await.unwrap();
        assert_eq!(slashed.outcome, TripOutcome::Slashed);
    }

    #[tokio::test]
    async fn completed_trip_is_not_resent() {
        let (flow, ledger) = workflow(FakeLedger::new().with_completed_trip(9));
        let err = flow.complete_trip(9, true).await.unwrap_err();

        assert!(matches!(err, CoordinatorError::TripAlreadyCompleted(9)));
        assert_eq!(ledger.calls(), vec!["trip_completed"]);
    }

    #[tokio::test]
    async fn group_staking_stops_at_first_failure() {
        let (flow, _) = workflow(FakeLedger::new().failing("stake", 1));
        let mut seen = Vec::new();
        let batch = flow
            .stake_for_group(&[ALICE.to_string(), BOB.to_string()], ONE, 77, |w, _| {
                seen.push(w.to_string())
            })
            .await;

        assert!(!batch.is_complete());
        assert!(batch.staked.is_empty());
        assert_eq!(batch.failed_wallet.as_deref(), Some(ALICE));
        assert!(seen.is_empty());
    }

    #[tokio::test]
    async fn group_staking_updates_trip_total() {
        let (flow, _) = workflow(FakeLedger::new());
        let mut seen = Vec::new();
        let batch = flow
            .stake_for_group(&[ALICE.to_string(), BOB.to_string()], ONE, 77, |w, _| {
                seen.push(w.to_string())
            })
            .await;

        assert!(batch.is_complete());
        assert_eq!(batch.transactions().len(), 2);
        assert_eq!(seen, vec![ALICE.to_string(), BOB.to_string()]);

        let state = flow.trip_state(77).await.unwrap();
        assert!(!state.completed);
        assert_eq!(state.total_staked, "2.0");
    }
}
