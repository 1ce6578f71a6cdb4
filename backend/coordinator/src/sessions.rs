//! Named multi-participant trip sessions.
//!
//! Sessions are created by a founding participant and grow as others join.
//! They are never deleted; the store lives as long as the process.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::errors::{CoordinatorError, Result};
use crate::pool::{same_wallet, NegotiationResult, PoolStatus};

/// Participants a session needs before it can be negotiated.
pub const DEFAULT_MIN_PARTICIPANTS: usize = 3;

const SESSION_ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const SESSION_ID_SUFFIX_LEN: usize = 9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripParticipant {
    pub wallet_address: String,
    pub name: String,
    pub budget: f64,
    pub joined_at: i64,
    pub has_staked: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripSession {
    pub session_id: String,
    pub trip_name: String,
    pub trip_date: String,
    pub location: String,
    pub created_by: String,
    pub created_at: i64,
    pub participants: Vec<TripParticipant>,
    pub status: PoolStatus,
    pub min_participants: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub negotiation_result: Option<NegotiationResult>,
    /// On-chain trip id the session was staked under.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<String>,
}

impl TripSession {
    fn find_mut(&mut self, wallet_address: &str) -> Option<&mut TripParticipant> {
        self.participants
            .iter_mut()
            .find(|p| same_wallet(&p.wallet_address, wallet_address))
    }
}

#[derive(Default)]
struct Sessions {
    by_id: HashMap<String, TripSession>,
    /// Creation order, used by `get_all_sessions`.
    order: Vec<String>,
}

#[derive(Default)]
pub struct TripSessionStore {
    inner: RwLock<Sessions>,
}

impl TripSessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new session seeded with its founder.
    pub fn create_session(
        &self,
        trip_name: &str,
        trip_date: &str,
        location: &str,
        wallet_address: &str,
        name: &str,
        budget: f64,
    ) -> TripSession {
        let now = Utc::now().timestamp_millis();
        let mut inner = self.inner.write();

        let mut session_id = generate_session_id(now);
        while inner.by_id.contains_key(&session_id) {
            session_id = generate_session_id(now);
        }

        let session = TripSession {
            session_id: session_id.clone(),
            trip_name: trip_name.to_string(),
            trip_date: trip_date.to_string(),
            location: location.to_string(),
            created_by: wallet_address.to_string(),
            created_at: now,
            participants: vec![TripParticipant {
                wallet_address: wallet_address.to_string(),
                name: name.to_string(),
                budget,
                joined_at: now,
                has_staked: false,
            }],
            status: PoolStatus::Waiting,
            min_participants: DEFAULT_MIN_PARTICIPANTS,
            negotiation_result: None,
            pool_id: None,
            transaction_hash: None,
        };

        inner.by_id.insert(session_id.clone(), session.clone());
        inner.order.push(session_id);
        session
    }

    /// Add a participant to an existing session.  A wallet that already
    /// joined (any case) has its name and budget updated instead of being
    /// added twice.  Returns `None` for an unknown session.
    pub fn join_session(
        &self,
        session_id: &str,
        wallet_address: &str,
        name: &str,
        budget: f64,
    ) -> Option<TripSession> {
        let mut inner = self.inner.write();
        let session = inner.by_id.get_mut(session_id)?;

        match session.find_mut(wallet_address) {
            Some(existing) => {
                existing.name = name.to_string();
                existing.budget = budget;
            }
            None => session.participants.push(TripParticipant {
                wallet_address: wallet_address.to_string(),
                name: name.to_string(),
                budget,
                joined_at: Utc::now().timestamp_millis(),
                has_staked: false,
            }),
        }
        Some(session.clone())
    }

    pub fn get_session(&self, session_id: &str) -> Option<TripSession> {
        self.inner.read().by_id.get(session_id).cloned()
    }

    /// All sessions in creation order.
    pub fn get_all_sessions(&self) -> Vec<TripSession> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.by_id.get(id).cloned())
            .collect()
    }

    #[allow(dead_code)]
    pub fn update_session_status(&self, session_id: &str, status: PoolStatus) {
        if let Some(session) = self.inner.write().by_id.get_mut(session_id) {
            session.status = status;
            if !status.is_negotiated() {
                session.negotiation_result = None;
            }
        }
    }

    /// Claim a `waiting` session with enough participants for one
    /// negotiation, moving it to `negotiating` under the same lock.
    pub fn begin_negotiation(&self, session_id: &str) -> Result<TripSession> {
        let mut inner = self.inner.write();
        let session = inner
            .by_id
            .get_mut(session_id)
            .ok_or_else(|| CoordinatorError::NotFound("Session not found".into()))?;

        match session.status {
            PoolStatus::Waiting => {}
            PoolStatus::Negotiating => {
                return Err(CoordinatorError::Validation("Negotiation already in progress".into()))
            }
            PoolStatus::ReadyToStake | PoolStatus::Completed => {
                return Err(CoordinatorError::Validation("Negotiation already completed".into()))
            }
        }
        if session.participants.len() < session.min_participants {
            return Err(CoordinatorError::Validation(format!(
                "Need at least {} participants",
                session.min_participants
            )));
        }

        session.status = PoolStatus::Negotiating;
        Ok(session.clone())
    }

    /// Return a failed negotiation to `waiting`.
    pub fn abort_negotiation(&self, session_id: &str) {
        if let Some(session) = self.inner.write().by_id.get_mut(session_id) {
            if session.status == PoolStatus::Negotiating {
                session.status = PoolStatus::Waiting;
                session.negotiation_result = None;
            }
        }
    }

    pub fn set_negotiation_result(&self, session_id: &str, result: NegotiationResult) {
        if let Some(session) = self.inner.write().by_id.get_mut(session_id) {
            session.negotiation_result = Some(result);
            session.status = PoolStatus::ReadyToStake;
        }
    }

    pub fn mark_user_staked(&self, session_id: &str, wallet_address: &str) {
        let mut inner = self.inner.write();
        let Some(session) = inner.by_id.get_mut(session_id) else {
            return;
        };
        let Some(participant) = session.find_mut(wallet_address) else {
            return;
        };
        participant.has_staked = true;

        if session.participants.iter().all(|p| p.has_staked) {
            session.status = PoolStatus::Completed;
        }
    }

    pub fn set_pool_info(&self, session_id: &str, pool_id: &str, tx_hash: &str) {
        if let Some(session) = self.inner.write().by_id.get_mut(session_id) {
            session.pool_id = Some(pool_id.to_string());
            session.transaction_hash = Some(tx_hash.to_string());
        }
    }
}

/// `trip_<unix millis>_<9 base36 chars>`
fn generate_session_id(now_millis: i64) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..SESSION_ID_SUFFIX_LEN)
        .map(|_| SESSION_ID_ALPHABET[rng.gen_range(0..SESSION_ID_ALPHABET.len())] as char)
        .collect();
    format!("trip_{now_millis}_{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_session() -> (TripSessionStore, String) {
        let store = TripSessionStore::new();
        let session = store.create_session(
            "Alps weekend",
            "2026-12-01",
            "Chamonix",
            "0xFounder",
            "Founder",
            800.0,
        );
        (store, session.session_id)
    }

    #[test]
    fn create_seeds_founder() {
        let (store, id) = store_with_session();
        let session = store.get_session(&id).unwrap();

        assert!(id.starts_with("trip_"));
        assert_eq!(session.created_by, "0xFounder");
        assert_eq!(session.status, PoolStatus::Waiting);
        assert_eq!(session.min_participants, DEFAULT_MIN_PARTICIPANTS);
        assert_eq!(session.participants.len(), 1);
        assert_eq!(session.participants[0].name, "Founder");
        assert!(!session.participants[0].has_staked);
    }

    #[test]
    fn session_ids_are_unique() {
        let store = TripSessionStore::new();
        let ids: std::collections::HashSet<_> = (0..50)
            .map(|i| {
                store
                    .create_session("t", "d", "l", &format!("0x{i}"), "n", 1.0)
                    .session_id
            })
            .collect();
        assert_eq!(ids.len(), 50);
        assert_eq!(store.get_all_sessions().len(), 50);
    }

    #[test]
    fn generated_id_shape() {
        let id = generate_session_id(1_700_000_000_000);
        let suffix = id.strip_prefix("trip_1700000000000_").unwrap();
        assert_eq!(suffix.len(), SESSION_ID_SUFFIX_LEN);
        assert!(suffix
            .bytes()
            .all(|b| b.is_ascii_digit() || b.is_ascii_lowercase()));
    }

    #[test]
    fn join_appends_participant() {
        let (store, id) = store_with_session();
        let session = store.join_session(&id, "0xBob", "Bob", 600.0).unwrap();
        assert_eq!(session.participants.len(), 2);
        assert_eq!(session.participants[1].wallet_address, "0xBob");
    }

    #[test]
    fn rejoin_updates_instead_of_duplicating() {
        let (store, id) = store_with_session();
        store.join_session(&id, "0xBob", "Bob", 600.0);
        let session = store.join_session(&id, "0XBOB", "Robert", 750.0).unwrap();

        assert_eq!(session.participants.len(), 2);
        let bob = &session.participants[1];
        assert_eq!(bob.wallet_address, "0xBob");
        assert_eq!(bob.name, "Robert");
        assert_eq!(bob.budget, 750.0);
    }

    #[test]
    fn join_unknown_session_leaves_store_untouched() {
        let (store, id) = store_with_session();
        let before = store.get_all_sessions();

        assert!(store
            .join_session("trip_missing", "0xBob", "Bob", 600.0)
            .is_none());

        assert_eq!(store.get_all_sessions(), before);
        assert_eq!(store.get_session(&id).unwrap().participants.len(), 1);
        assert!(store.get_session("trip_missing").is_none());
    }

    #[test]
    fn list_keeps_creation_order() {
        let store = TripSessionStore::new();
        let names = ["first", "second", "third"];
        for name in names {
            store.create_session(name, "d", "l", "0x1", "n", 1.0);
        }
        let listed: Vec<_> = store
            .get_all_sessions()
            .into_iter()
            .map(|s| s.trip_name)
            .collect();
        assert_eq!(listed, names);
    }

    #[test]
    fn staking_everyone_completes_session() {
        let (store, id) = store_with_session();
        store.join_session(&id, "0xBob", "Bob", 600.0);
        store.set_negotiation_result(
            &id,
            NegotiationResult {
                agreed_budget: 700,
                stake_percentage: 5,
                stake_amount: 35,
                stake_amount_hbar: 700.0,
                total_pool: 70,
                coordinator_reasoning: String::new(),
                validator_reasoning: String::new(),
                final_reasoning: String::new(),
            },
        );
        assert_eq!(
            store.get_session(&id).unwrap().status,
            PoolStatus::ReadyToStake
        );

        store.mark_user_staked(&id, "0xfounder");
        assert_eq!(
            store.get_session(&id).unwrap().status,
            PoolStatus::ReadyToStake
        );
        store.mark_user_staked(&id, "0xbob");
        assert_eq!(store.get_session(&id).unwrap().status, PoolStatus::Completed);
    }

    #[test]
    fn negotiation_is_claimed_once() {
        let (store, id) = store_with_session();
        let err = store.begin_negotiation(&id).unwrap_err();
        assert_eq!(err.to_string(), "Need at least 3 participants");

        store.join_session(&id, "0xBob", "Bob", 600.0);
        store.join_session(&id, "0xCy", "Cy", 700.0);
        let claimed = store.begin_negotiation(&id).unwrap();
        assert_eq!(claimed.status, PoolStatus::Negotiating);

        let err = store.begin_negotiation(&id).unwrap_err();
        assert_eq!(err.to_string(), "Negotiation already in progress");

        store.abort_negotiation(&id);
        assert_eq!(store.get_session(&id).unwrap().status, PoolStatus::Waiting);
        assert!(store.begin_negotiation(&id).is_ok());

        assert!(matches!(
            store.begin_negotiation("trip_missing"),
            Err(CoordinatorError::NotFound(_))
        ));
    }

    #[test]
    fn pool_info_and_status_updates() {
        let (store, id) = store_with_session();
        store.update_session_status(&id, PoolStatus::Negotiating);
        store.set_pool_info(&id, "1761407377170", "0xhash");

        let session = store.get_session(&id).unwrap();
        assert_eq!(session.status, PoolStatus::Negotiating);
        assert_eq!(session.pool_id.as_deref(), Some("1761407377170"));
        assert_eq!(session.transaction_hash.as_deref(), Some("0xhash"));

        // Unknown ids are ignored.
        store.update_session_status("nope", PoolStatus::Completed);
        store.mark_user_staked("nope", "0xFounder");
    }
}
