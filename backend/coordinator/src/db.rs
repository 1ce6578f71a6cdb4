//! Database layer: migrations and the chain receipt log.

use std::str::FromStr;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::errors::Result;
use crate::receipts::{NewReceipt, ReceiptRecord};

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };
    let options = SqliteConnectOptions::from_str(&url)?.create_if_missing(true);

    // Every connection to `sqlite::memory:` opens a separate database.
    let max_connections = if url.contains(":memory:") { 1 } else { 5 };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

pub async fn insert_receipt(pool: &SqlitePool, receipt: &NewReceipt) -> Result<i64> {
    let id = sqlx::query(
        r#"
        INSERT INTO chain_receipts
            (action, wallet, trip_id, amount, tx_hash, outcome, error, compensation, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
    )
    .bind(receipt.action.as_str())
    .bind(&receipt.wallet)
    .bind(&receipt.trip_id)
    .bind(&receipt.amount)
    .bind(&receipt.tx_hash)
    .bind(receipt.outcome())
    .bind(&receipt.error)
    .bind(&receipt.compensation)
    .bind(Utc::now().timestamp_millis())
    .execute(pool)
    .await?
    .last_insert_rowid();
    Ok(id)
}

/// Write a receipt, logging instead of failing.  The chain action it
/// describes has already happened.
pub async fn record_receipt(pool: &SqlitePool, receipt: NewReceipt) {
    if let Err(e) = insert_receipt(pool, &receipt).await {
        warn!("Could not record {} receipt: {e}", receipt.action.as_str());
    }
}

/// Receipts newest first, optionally for one wallet (any case).
pub async fn list_receipts(pool: &SqlitePool, wallet: Option<&str>) -> Result<Vec<ReceiptRecord>> {
    let rows = match wallet {
        Some(wallet) => {
            sqlx::query_as::<_, ReceiptRecord>(
                r#"
                SELECT id, action, wallet, trip_id, amount, tx_hash, outcome, error,
                       compensation, created_at
                FROM   chain_receipts
                WHERE  wallet = ?1 COLLATE NOCASE
                ORDER  BY id DESC
                "#,
            )
            .bind(wallet)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, ReceiptRecord>(
                r#"
                SELECT id, action, wallet, trip_id, amount, tx_hash, outcome, error,
                       compensation, created_at
                FROM   chain_receipts
                ORDER  BY id DESC
                "#,
            )
            .fetch_all(pool)
            .await?
        }
    };
    Ok(rows)
}
