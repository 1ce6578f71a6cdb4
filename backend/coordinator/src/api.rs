//! Axum REST API handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db;
use crate::errors::CoordinatorError;
use crate::evm::{format_ether, parse_ether};
use crate::location::LocationService;
use crate::negotiation::{validate_budget, Bid, Negotiator};
use crate::pool::{NegotiationResult, ParticipantPoolStore};
use crate::receipts::{NewReceipt, ReceiptAction};
use crate::sessions::TripSessionStore;
use crate::staking::{StakeBatch, StakingWorkflow};

pub struct AppState {
    pub config: Config,
    pub pool_store: ParticipantPoolStore,
    pub sessions: TripSessionStore,
    pub location: LocationService,
    pub negotiator: Negotiator,
    /// `None` when chain credentials are not configured.
    pub staking: Option<StakingWorkflow>,
    pub db: SqlitePool,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/pool/join", post(join_pool))
        .route("/pool/reset", post(reset_pool))
        .route("/pool/status", get(pool_status))
        .route("/pool/negotiate", post(negotiate_pool))
        .route("/trip-session/create", post(create_session))
        .route("/trip-session/get", get(get_session))
        .route("/trip-session/join", post(join_session))
        .route("/trip-session/list", get(list_sessions))
        .route("/trip-session/negotiate", post(negotiate_session))
        .route("/location/verify", post(verify_location))
        .route("/trip/complete", post(complete_trip))
        .route("/trip/:trip_id", get(trip_state))
        .route("/balance", get(balance))
        .route("/withdraw", post(withdraw))
        .route("/receipts", get(list_receipts))
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct JoinPoolRequest {
    pub wallet_address: Option<String>,
    pub name: Option<String>,
    pub budget: Option<f64>,
    pub location: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateSessionRequest {
    pub trip_name: Option<String>,
    pub trip_date: Option<String>,
    pub location: Option<String>,
    pub wallet_address: Option<String>,
    pub name: Option<String>,
    pub budget: Option<f64>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct JoinSessionRequest {
    pub session_id: Option<String>,
    pub wallet_address: Option<String>,
    pub name: Option<String>,
    pub budget: Option<f64>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionRequest {
    pub session_id: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct VerifyLocationRequest {
    pub required_location: Option<String>,
    pub provided_location: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CompleteTripRequest {
    pub trip_id: Option<u64>,
    pub success: Option<bool>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct WithdrawRequest {
    pub user_address: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
pub struct WalletQuery {
    pub wallet: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionQuery {
    pub session_id: Option<String>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NegotiationSummary<'a> {
    original_budgets: Vec<Value>,
    #[serde(flatten)]
    result: &'a NegotiationResult,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

fn failure(e: &CoordinatorError) -> Response {
    error_response(e.status_code(), e.to_string())
}

fn missing_fields() -> Response {
    error_response(StatusCode::BAD_REQUEST, "Missing required fields")
}

/// Present and non-empty.
fn required(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

/// A zero budget counts as missing.
fn required_budget(value: Option<f64>) -> Option<f64> {
    value.filter(|b| *b != 0.0)
}

fn budget_in_range(budget: f64) -> Result<f64, Response> {
    validate_budget(budget).map_err(|e| failure(&e))
}

fn staking(state: &AppState) -> Result<&StakingWorkflow, Response> {
    state
        .staking
        .as_ref()
        .ok_or_else(|| failure(&CoordinatorError::ChainNotConfigured))
}

// ─────────────────────────────────────────────────────────
// Health
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ─────────────────────────────────────────────────────────
// Participant pool
// ─────────────────────────────────────────────────────────

/// `POST /pool/join`
pub async fn join_pool(
    State(state): State<Arc<AppState>>,
    Json(req): Json<JoinPoolRequest>,
) -> Response {
    let (Some(wallet), Some(name), Some(budget), Some(location)) = (
        required(&req.wallet_address),
        required(&req.name),
        required_budget(req.budget),
        required(&req.location),
    ) else {
        return missing_fields();
    };
    let budget = match budget_in_range(budget) {
        Ok(budget) => budget,
        Err(response) => return response,
    };

    let pool = state.pool_store.add_participant(wallet, name, budget, location);
    info!("{name} joined the pool ({} participants)", pool.participant_count());

    Json(json!({
        "success": true,
        "pool": {
            "participantCount": pool.participant_count(),
            "status": pool.status,
            "isReady": pool.is_ready(state.config.ready_threshold),
            "yourInfo": pool.find(wallet),
        },
    }))
    .into_response()
}

/// `POST /pool/reset`
pub async fn reset_pool(State(state): State<Arc<AppState>>) -> Response {
    state.pool_store.reset();
    info!("Pool reset");
    Json(json!({ "success": true, "message": "Pool reset successfully" })).into_response()
}

/// `GET /pool/status?wallet=<addr>`
///
/// Callers naming a wallet that is not in the pool only see the counts.
pub async fn pool_status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WalletQuery>,
) -> Response {
    let pool = state.pool_store.get_pool();
    let threshold = state.config.ready_threshold;
    let wallet = required(&query.wallet);
    let is_participant = wallet.is_some_and(|w| state.pool_store.is_participant(w));

    if wallet.is_some() && !is_participant {
        return Json(json!({
            "success": true,
            "isParticipant": false,
            "participantCount": pool.participant_count(),
            "status": pool.status,
            "isReady": pool.is_ready(threshold),
        }))
        .into_response();
    }

    let participants: Vec<Value> = pool
        .participants
        .iter()
        .map(|p| {
            json!({
                "name": p.name,
                "budget": p.budget,
                "location": p.location,
                "walletAddress": p.wallet_address,
                "hasStaked": p.has_staked,
            })
        })
        .collect();

    Json(json!({
        "success": true,
        "isParticipant": is_participant,
        "pool": {
            "participants": participants,
            "participantCount": pool.participant_count(),
            "status": pool.status,
            "isReady": pool.is_ready(threshold),
            "negotiationResult": pool.negotiation_result,
        },
    }))
    .into_response()
}

/// `POST /pool/negotiate`
pub async fn negotiate_pool(State(state): State<Arc<AppState>>) -> Response {
    // Claims the pool; a second caller sees `negotiating` and is turned away.
    let (pool, ticket) = match state
        .pool_store
        .begin_negotiation(state.config.ready_threshold)
    {
        Ok(claim) => claim,
        Err(e) => return failure(&e),
    };

    let bids: Vec<Bid<'_>> = pool
        .participants
        .iter()
        .map(|p| Bid {
            name: &p.name,
            budget: p.budget,
            location: &p.location,
        })
        .collect();

    let result = match state.negotiator.negotiate(&bids).await {
        Ok(result) => result,
        Err(e) => {
            error!("Pool negotiation failed: {e}");
            state.pool_store.abort_negotiation(ticket);
            return failure(&e);
        }
    };
    // Nothing is staked for a pool that was reset meanwhile.
    if let Err(e) = state.pool_store.finish_negotiation(ticket, result.clone()) {
        warn!("Discarding pool negotiation: {e}");
        return failure(&e);
    }

    let wallets: Vec<String> = pool
        .participants
        .iter()
        .map(|p| p.wallet_address.clone())
        .collect();
    let staked = agent_stake(&state, &wallets, &result, |wallet, _| {
        state.pool_store.mark_staked(wallet)
    })
    .await;

    negotiation_response(&bids, &result, staked, None)
}

// ─────────────────────────────────────────────────────────
// Trip sessions
// ─────────────────────────────────────────────────────────

/// `POST /trip-session/create`
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSessionRequest>,
) -> Response {
    let (Some(trip_name), Some(trip_date), Some(location), Some(wallet), Some(name), Some(budget)) = (
        required(&req.trip_name),
        required(&req.trip_date),
        required(&req.location),
        required(&req.wallet_address),
        required(&req.name),
        required_budget(req.budget),
    ) else {
        return missing_fields();
    };
    let budget = match budget_in_range(budget) {
        Ok(budget) => budget,
        Err(response) => return response,
    };

    let session = state
        .sessions
        .create_session(trip_name, trip_date, location, wallet, name, budget);
    info!("Session {} created by {name}", session.session_id);

    Json(json!({ "success": true, "session": session })).into_response()
}

/// `GET /trip-session/get?sessionId=<id>`
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
) -> Response {
    let Some(session_id) = required(&query.session_id) else {
        return error_response(StatusCode::BAD_REQUEST, "Session ID required");
    };
    match state.sessions.get_session(session_id) {
        Some(session) => Json(json!({ "success": true, "session": session })).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "Session not found"),
    }
}

/// `POST /trip-session/join`
pub async fn join_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<JoinSessionRequest>,
) -> Response {
    let (Some(session_id), Some(wallet), Some(name), Some(budget)) = (
        required(&req.session_id),
        required(&req.wallet_address),
        required(&req.name),
        required_budget(req.budget),
    ) else {
        return missing_fields();
    };
    let budget = match budget_in_range(budget) {
        Ok(budget) => budget,
        Err(response) => return response,
    };

    match state.sessions.join_session(session_id, wallet, name, budget) {
        Some(session) => {
            info!(
                "{name} joined session {session_id} ({} participants)",
                session.participants.len()
            );
            Json(json!({ "success": true, "session": session })).into_response()
        }
        None => error_response(StatusCode::NOT_FOUND, "Session not found"),
    }
}

/// `GET /trip-session/list`
pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Response {
    let sessions: Vec<Value> = state
        .sessions
        .get_all_sessions()
        .into_iter()
        .map(|s| {
            json!({
                "sessionId": s.session_id,
                "tripName": s.trip_name,
                "tripDate": s.trip_date,
                "location": s.location,
                "participants": s.participants.len(),
                "status": s.status,
                "createdAt": iso_millis(s.created_at),
            })
        })
        .collect();

    Json(json!({
        "success": true,
        "count": sessions.len(),
        "sessions": sessions,
    }))
    .into_response()
}

/// `POST /trip-session/negotiate`
pub async fn negotiate_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SessionRequest>,
) -> Response {
    let Some(session_id) = required(&req.session_id) else {
        return error_response(StatusCode::BAD_REQUEST, "Session ID required");
    };
    let session = match state.sessions.begin_negotiation(session_id) {
        Ok(session) => session,
        Err(e) => return failure(&e),
    };

    let bids: Vec<Bid<'_>> = session
        .participants
        .iter()
        .map(|p| Bid {
            name: &p.name,
            budget: p.budget,
            location: &session.location,
        })
        .collect();

    let result = match state.negotiator.negotiate(&bids).await {
        Ok(result) => result,
        Err(e) => {
            error!("Negotiation for session {session_id} failed: {e}");
            state.sessions.abort_negotiation(session_id);
            return failure(&e);
        }
    };
    state
        .sessions
        .set_negotiation_result(session_id, result.clone());

    let wallets: Vec<String> = session
        .participants
        .iter()
        .map(|p| p.wallet_address.clone())
        .collect();
    let staked = agent_stake(&state, &wallets, &result, |wallet, _| {
        state.sessions.mark_user_staked(session_id, wallet)
    })
    .await;

    if let Some(Ok(batch)) = &staked {
        if let Some((_, first_tx)) = batch.staked.first() {
            state
                .sessions
                .set_pool_info(session_id, &batch.trip_id.to_string(), first_tx);
        }
    }

    negotiation_response(&bids, &result, staked, Some(session_id))
}

/// Stake the negotiated amount for every wallet under a fresh trip id.
/// `None` when the chain is not configured.
async fn agent_stake<F>(
    state: &AppState,
    wallets: &[String],
    result: &NegotiationResult,
    on_staked: F,
) -> Option<Result<StakeBatch, CoordinatorError>>
where
    F: FnMut(&str, &str) + Send,
{
    let Some(workflow) = state.staking.as_ref() else {
        info!("Chain not configured, skipping agent staking");
        return None;
    };

    let amount_wei = match parse_ether(result.stake_amount_hbar) {
        Ok(amount) => amount,
        Err(e) => return Some(Err(e)),
    };
    let trip_id = Utc::now().timestamp_millis().unsigned_abs();

    let batch = workflow
        .stake_for_group(wallets, amount_wei, trip_id, on_staked)
        .await;

    let amount = format_ether(amount_wei);
    for (wallet, tx_hash) in &batch.staked {
        info!("Stake for {wallet}: {}", state.config.explorer_url(tx_hash));
        db::record_receipt(
            &state.db,
            NewReceipt::new(ReceiptAction::Stake)
                .wallet(wallet)
                .trip(trip_id)
                .amount(amount.clone())
                .tx(tx_hash),
        )
        .await;
    }
    if let (Some(wallet), Some(err)) = (&batch.failed_wallet, &batch.error) {
        db::record_receipt(
            &state.db,
            NewReceipt::new(ReceiptAction::Stake)
                .wallet(wallet)
                .trip(trip_id)
                .amount(amount.clone())
                .failed(err),
        )
        .await;
    }

    Some(Ok(batch))
}

fn negotiation_response(
    bids: &[Bid<'_>],
    result: &NegotiationResult,
    staked: Option<Result<StakeBatch, CoordinatorError>>,
    session_id: Option<&str>,
) -> Response {
    let summary = NegotiationSummary {
        original_budgets: bids
            .iter()
            .map(|b| json!({ "name": b.name, "budget": b.budget }))
            .collect(),
        result,
    };

    let mut body = json!({
        "success": true,
        "agentStaked": false,
        "negotiation": summary,
    });
    if let Some(session_id) = session_id {
        body["sessionId"] = json!(session_id);
    }

    match staked {
        None => {}
        Some(Ok(batch)) => {
            body["agentStaked"] = json!(batch.is_complete());
            body["tripId"] = json!(batch.trip_id);
            body["transactions"] = json!(batch.transactions());
            if let Some(err) = batch.error {
                body["stakingError"] = json!(err);
            }
        }
        Some(Err(e)) => {
            warn!("Agent staking skipped: {e}");
            body["stakingError"] = json!(e.to_string());
        }
    }

    Json(body).into_response()
}

fn iso_millis(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
        .unwrap_or_default()
}

// ─────────────────────────────────────────────────────────
// Location
// ─────────────────────────────────────────────────────────

/// `POST /location/verify`
pub async fn verify_location(
    State(state): State<Arc<AppState>>,
    Json(req): Json<VerifyLocationRequest>,
) -> Response {
    let (Some(required_location), Some(provided_location)) = (
        required(&req.required_location),
        required(&req.provided_location),
    ) else {
        return missing_fields();
    };

    let check = state
        .location
        .verify_location(required_location, provided_location);
    Json(json!({
        "success": true,
        "isMatch": check.is_match,
        "confidence": check.confidence,
        "reason": check.reason,
    }))
    .into_response()
}

// ─────────────────────────────────────────────────────────
// Staking
// ─────────────────────────────────────────────────────────

/// `POST /trip/complete`
pub async fn complete_trip(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CompleteTripRequest>,
) -> Response {
    let (Some(trip_id), Some(success)) = (req.trip_id, req.success) else {
        return missing_fields();
    };
    let workflow = match staking(&state) {
        Ok(workflow) => workflow,
        Err(response) => return response,
    };

    match workflow.complete_trip(trip_id, success).await {
        Ok(done) => {
            db::record_receipt(
                &state.db,
                NewReceipt::new(ReceiptAction::CompleteTrip)
                    .trip(trip_id)
                    .tx(&done.transaction_hash),
            )
            .await;
            Json(json!({
                "success": true,
                "tripId": trip_id,
                "outcome": done.outcome,
                "transactionHash": done.transaction_hash,
                "hashscanUrl": state.config.explorer_url(&done.transaction_hash),
            }))
            .into_response()
        }
        Err(e) => {
            if !matches!(e, CoordinatorError::TripAlreadyCompleted(_)) {
                error!("Completing trip {trip_id} failed: {e}");
                db::record_receipt(
                    &state.db,
                    NewReceipt::new(ReceiptAction::CompleteTrip)
                        .trip(trip_id)
                        .failed(&e.to_string()),
                )
                .await;
            }
            failure(&e)
        }
    }
}

/// `GET /trip/:trip_id`
pub async fn trip_state(
    State(state): State<Arc<AppState>>,
    Path(trip_id): Path<u64>,
) -> Response {
    let workflow = match staking(&state) {
        Ok(workflow) => workflow,
        Err(response) => return response,
    };
    match workflow.trip_state(trip_id).await {
        Ok(trip) => Json(json!({
            "success": true,
            "tripId": trip.trip_id,
            "completed": trip.completed,
            "totalStaked": trip.total_staked,
            "totalStakedWei": trip.total_staked_wei,
        }))
        .into_response(),
        Err(e) => failure(&e),
    }
}

/// `GET /balance?wallet=<addr>`
pub async fn balance(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WalletQuery>,
) -> Response {
    let Some(wallet) = required(&query.wallet) else {
        return error_response(StatusCode::BAD_REQUEST, "Wallet address required");
    };
    let workflow = match staking(&state) {
        Ok(workflow) => workflow,
        Err(response) => return response,
    };
    match workflow.balance(wallet).await {
        Ok(wei) => Json(json!({
            "success": true,
            "wallet": wallet,
            "balanceWei": wei.to_string(),
            "balance": format_ether(wei),
        }))
        .into_response(),
        Err(e) => failure(&e),
    }
}

/// `POST /withdraw`
pub async fn withdraw(
    State(state): State<Arc<AppState>>,
    Json(req): Json<WithdrawRequest>,
) -> Response {
    let Some(wallet) = required(&req.user_address) else {
        return error_response(StatusCode::BAD_REQUEST, "User address required");
    };
    let workflow = match staking(&state) {
        Ok(workflow) => workflow,
        Err(response) => return response,
    };

    match workflow.withdraw(wallet).await {
        Ok(receipt) => {
            db::record_receipt(
                &state.db,
                NewReceipt::new(ReceiptAction::Withdraw)
                    .wallet(wallet)
                    .amount(receipt.amount())
                    .tx(&receipt.transaction_id),
            )
            .await;
            Json(json!({
                "success": true,
                "amount": receipt.amount(),
                "transactionId": receipt.transaction_id,
                "hashscanUrl": state.config.explorer_url(&receipt.transaction_id),
            }))
            .into_response()
        }
        Err(failed) => {
            let message = failed.error.to_string();
            let Some(compensation) = failed.compensation else {
                return failure(&failed.error);
            };

            let mut receipt = NewReceipt::new(ReceiptAction::Withdraw)
                .wallet(wallet)
                .failed(&message)
                .compensation(&compensation);
            if let Some(wei) = failed.amount_wei {
                receipt = receipt.amount(format_ether(wei));
            }
            db::record_receipt(&state.db, receipt).await;

            (
                failed.error.status_code(),
                Json(json!({ "error": message, "compensation": compensation })),
            )
                .into_response()
        }
    }
}

// ─────────────────────────────────────────────────────────
// Receipt log
// ─────────────────────────────────────────────────────────

/// `GET /receipts?wallet=<addr>`
pub async fn list_receipts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WalletQuery>,
) -> Response {
    match db::list_receipts(&state.db, required(&query.wallet)).await {
        Ok(receipts) => Json(json!({
            "success": true,
            "count": receipts.len(),
            "receipts": receipts,
        }))
        .into_response(),
        Err(e) => failure(&e),
    }
}
