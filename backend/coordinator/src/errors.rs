//! Application-wide error types.

use axum::http::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Invalid EVM address: {0}")]
    InvalidAddress(String),

    #[error("Agent service error: {0}")]
    Agent(String),

    #[error("No balance to withdraw")]
    NothingToWithdraw,

    #[error("Trip {0} is already completed")]
    TripAlreadyCompleted(u64),

    #[error("Pool was reset during negotiation")]
    NegotiationSuperseded,

    #[error("Missing chain configuration")]
    ChainNotConfigured,
}

impl CoordinatorError {
    /// HTTP status a route answers with when this error reaches it.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::InvalidAddress(_) | Self::NothingToWithdraw => {
                StatusCode::BAD_REQUEST
            }
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::TripAlreadyCompleted(_) | Self::NegotiationSuperseded => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;
