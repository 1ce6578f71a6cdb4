//! Participant pool: the waiting room where travellers gather before a
//! group trip is negotiated and staked.
//!
//! One pool exists per [`ParticipantPoolStore`].  The whole pool sits behind a
//! single lock, so every operation below is atomic with respect to the others
//! (an upsert never interleaves with a `reset`, and `mark_staked` checks the
//! "everyone staked" condition under the same guard that set the flag).
//!
//! ```text
//! waiting ──► negotiating ──► ready_to_stake ──► completed
//!    ▲                                               │
//!    └──────────────────── reset ◄───────────────────┘
//! ```

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::errors::{CoordinatorError, Result};

/// Lifecycle status of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    Waiting,
    Negotiating,
    ReadyToStake,
    Completed,
}

impl PoolStatus {
    /// `true` once a negotiation result may be attached.
    pub fn is_negotiated(&self) -> bool {
        matches!(self, Self::ReadyToStake | Self::Completed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub wallet_address: String,
    pub name: String,
    pub budget: f64,
    pub location: String,
    /// Unix milliseconds of the first join.
    pub joined_at: i64,
    pub has_staked: bool,
}

/// Outcome of the coordinator/validator negotiation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiationResult {
    pub agreed_budget: u64,
    pub stake_percentage: u32,
    /// Per-participant stake in USD.
    pub stake_amount: u64,
    pub stake_amount_hbar: f64,
    pub total_pool: u64,
    pub coordinator_reasoning: String,
    pub validator_reasoning: String,
    pub final_reasoning: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantPool {
    /// Insertion order is preserved.
    pub participants: Vec<Participant>,
    pub status: PoolStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub negotiation_result: Option<NegotiationResult>,
    pub created_at: i64,
}

impl ParticipantPool {
    fn empty() -> Self {
        ParticipantPool {
            participants: Vec::new(),
            status: PoolStatus::Waiting,
            negotiation_result: None,
            created_at: Utc::now().timestamp_millis(),
        }
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    /// Readiness is a caller policy: the store never enforces the threshold.
    pub fn is_ready(&self, threshold: usize) -> bool {
        self.participants.len() >= threshold
    }

    pub fn find(&self, wallet_address: &str) -> Option<&Participant> {
        self.participants
            .iter()
            .find(|p| same_wallet(&p.wallet_address, wallet_address))
    }

    fn find_mut(&mut self, wallet_address: &str) -> Option<&mut Participant> {
        self.participants
            .iter_mut()
            .find(|p| same_wallet(&p.wallet_address, wallet_address))
    }
}

/// Wallet addresses are compared case-insensitively everywhere.
pub fn same_wallet(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Marks a negotiation started by [`ParticipantPoolStore::begin_negotiation`].
/// A `reset` in the meantime invalidates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiationTicket {
    epoch: u64,
}

struct PoolState {
    pool: ParticipantPool,
    /// Bumped by every `reset`.
    epoch: u64,
}

pub struct ParticipantPoolStore {
    state: RwLock<PoolState>,
}

impl Default for ParticipantPoolStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ParticipantPoolStore {
    pub fn new() -> Self {
        ParticipantPoolStore {
            state: RwLock::new(PoolState {
                pool: ParticipantPool::empty(),
                epoch: 0,
            }),
        }
    }

    /// Insert a participant, or update name/budget/location in place when the
    /// wallet is already present.  Returns a snapshot of the pool.
    pub fn add_participant(
        &self,
        wallet_address: &str,
        name: &str,
        budget: f64,
        location: &str,
    ) -> ParticipantPool {
        let mut state = self.state.write();
        let pool = &mut state.pool;
        match pool.find_mut(wallet_address) {
            Some(existing) => {
                existing.name = name.to_string();
                existing.budget = budget;
                existing.location = location.to_string();
            }
            None => pool.participants.push(Participant {
                wallet_address: wallet_address.to_string(),
                name: name.to_string(),
                budget,
                location: location.to_string(),
                joined_at: Utc::now().timestamp_millis(),
                has_staked: false,
            }),
        }
        pool.clone()
    }

    /// Snapshot copy; later mutations of the store are not visible through it.
    pub fn get_pool(&self) -> ParticipantPool {
        self.state.read().pool.clone()
    }

    pub fn get_participant(&self, wallet_address: &str) -> Option<Participant> {
        self.state.read().pool.find(wallet_address).cloned()
    }

    /// Moving back to `waiting`/`negotiating` drops a stale negotiation result.
    #[allow(dead_code)]
    pub fn set_status(&self, status: PoolStatus) {
        let mut state = self.state.write();
        let pool = &mut state.pool;
        pool.status = status;
        if !status.is_negotiated() {
            pool.negotiation_result = None;
        }
    }

    #[allow(dead_code)]
    pub fn set_negotiation_result(&self, result: NegotiationResult) {
        let mut state = self.state.write();
        let pool = &mut state.pool;
        pool.negotiation_result = Some(result);
        pool.status = PoolStatus::ReadyToStake;
    }

    /// Claim the pool for one negotiation.  Only a `waiting` pool with at
    /// least `threshold` participants can be claimed; it moves to
    /// `negotiating` under the same lock, so concurrent callers see it taken.
    pub fn begin_negotiation(&self, threshold: usize) -> Result<(ParticipantPool, NegotiationTicket)> {
        let mut state = self.state.write();
        let pool = &mut state.pool;
        match pool.status {
            PoolStatus::Waiting => {}
            PoolStatus::Negotiating => {
                return Err(CoordinatorError::Validation("Negotiation already in progress".into()))
            }
            PoolStatus::ReadyToStake | PoolStatus::Completed => {
                return Err(CoordinatorError::Validation("Negotiation already completed".into()))
            }
        }
        if !pool.is_ready(threshold) {
            return Err(CoordinatorError::Validation(format!(
                "Need at least {threshold} participants (currently {})",
                pool.participant_count()
            )));
        }

        pool.status = PoolStatus::Negotiating;
        let snapshot = pool.clone();
        Ok((snapshot, NegotiationTicket { epoch: state.epoch }))
    }

    /// Attach the result of a negotiation started with `ticket`.  Fails when
    /// the pool was reset since.
    pub fn finish_negotiation(&self, ticket: NegotiationTicket, result: NegotiationResult) -> Result<()> {
        let mut state = self.state.write();
        if state.epoch != ticket.epoch || state.pool.status != PoolStatus::Negotiating {
            return Err(CoordinatorError::NegotiationSuperseded);
        }
        state.pool.negotiation_result = Some(result);
        state.pool.status = PoolStatus::ReadyToStake;
        Ok(())
    }

    /// Release a failed negotiation back to `waiting`, unless the pool was
    /// reset since.
    pub fn abort_negotiation(&self, ticket: NegotiationTicket) {
        let mut state = self.state.write();
        if state.epoch == ticket.epoch && state.pool.status == PoolStatus::Negotiating {
            state.pool.status = PoolStatus::Waiting;
            state.pool.negotiation_result = None;
        }
    }

    /// Flag a participant as staked.  The pool completes once every
    /// participant has staked.  Unknown wallets are ignored.
    pub fn mark_staked(&self, wallet_address: &str) {
        let mut state = self.state.write();
        let pool = &mut state.pool;
        let Some(participant) = pool.find_mut(wallet_address) else {
            return;
        };
        participant.has_staked = true;

        if pool.participants.iter().all(|p| p.has_staked) {
            pool.status = PoolStatus::Completed;
        }
    }

    /// Start over with an empty pool.  Also the way out of a pool left in
    /// `negotiating`.
    pub fn reset(&self) {
        let mut state = self.state.write();
        state.pool = ParticipantPool::empty();
        state.epoch += 1;
    }

    pub fn is_participant(&self, wallet_address: &str) -> bool {
        self.state.read().pool.find(wallet_address).is_some()
    }
}
