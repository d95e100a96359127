//! PostgreSQL implementation of the besitos persistence boundary.
//!
//! This crate provides a production-ready PostgreSQL implementation of the
//! `LedgerStore` and `EventLog` traits from the besitos core.
//!
//! # Features
//!
//! - Balance rows locked with `SELECT ... FOR UPDATE` inside the ledger's
//!   transaction
//! - SQLSTATE-aware error mapping: serialization failures, deadlocks, and
//!   lock timeouts surface as the retryable `StoreError::Conflict`
//! - Append-only transaction log with JSONB multiplier and context payloads
//! - Size-bounded event retention with in-database pruning
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TABLE balances (
//!     user_id BIGINT PRIMARY KEY,
//!     total_points BIGINT NOT NULL DEFAULT 0,
//!     available_points BIGINT NOT NULL DEFAULT 0,
//!     signed_total BIGINT NOT NULL DEFAULT 0,
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!
//!     CHECK (total_points >= 0),
//!     CHECK (available_points >= 0),
//!     CHECK (available_points <= total_points)
//! );
//!
//! CREATE TABLE points_transactions (
//!     id UUID PRIMARY KEY,
//!     user_id BIGINT NOT NULL,
//!     action_type TEXT NOT NULL,
//!     points_change BIGINT NOT NULL,
//!     balance_after BIGINT NOT NULL,
//!     base_points BIGINT NOT NULL,
//!     multipliers_applied JSONB NOT NULL DEFAULT '{}',
//!     context JSONB NOT NULL DEFAULT '{}',
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     validation_passed BOOLEAN NOT NULL DEFAULT TRUE
//! );
//!
//! CREATE INDEX idx_transactions_user_time
//!     ON points_transactions (user_id, created_at DESC);
//!
//! CREATE TABLE bus_events (
//!     id UUID PRIMARY KEY,
//!     event_type TEXT NOT NULL,
//!     created_at TIMESTAMPTZ NOT NULL,
//!     data JSONB NOT NULL,
//!     correlation_id UUID,
//!     source TEXT
//! );
//!
//! CREATE INDEX idx_bus_events_time ON bus_events (created_at);
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use besitos_core::{EventBus, PointsLedger};
//! use besitos_store_postgres::{PgEventLog, PgLedgerStore};
//! use sqlx::PgPool;
//! use std::sync::Arc;
//!
//! let pool = PgPool::connect("postgres://localhost/besitos").await?;
//! let store = Arc::new(PgLedgerStore::new(pool.clone()));
//! let log = Arc::new(PgEventLog::new(pool, 4096));
//! let bus = Arc::new(EventBus::with_log(Default::default(), log));
//! let ledger = PointsLedger::new(store, bus);
//! ```

use anyhow::Result;
use async_trait::async_trait;
use besitos_core::{
    ActionType, Event, EventLog, EventType, MultiplierMap, PointsTransaction, StoreError,
    UserBalance, UserId,
};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};

/// PostgreSQL ledger store.
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Map database failures onto the ledger's retryable/terminal split.
///
/// `40001` serialization_failure, `40P01` deadlock_detected, and `55P03`
/// lock_not_available are the transient class the ledger retries.
fn map_sqlx(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if matches!(
            db.code().as_deref(),
            Some("40001") | Some("40P01") | Some("55P03")
        ) {
            return StoreError::Conflict(db.message().to_string());
        }
    }
    StoreError::backend(err)
}

fn decode_balance(row: &PgRow) -> Result<UserBalance, StoreError> {
    Ok(UserBalance {
        user_id: UserId(row.get::<i64, _>("user_id")),
        total_points: row.get::<i64, _>("total_points") as u64,
        available_points: row.get::<i64, _>("available_points") as u64,
        signed_total: row.get("signed_total"),
    })
}

fn decode_transaction(row: &PgRow) -> Result<PointsTransaction, StoreError> {
    let action_type: String = row.get("action_type");
    let action_type = action_type
        .parse::<ActionType>()
        .map_err(|e| StoreError::backend(anyhow::anyhow!(e)))?;
    let multipliers: serde_json::Value = row.get("multipliers_applied");
    let multipliers: MultiplierMap =
        serde_json::from_value(multipliers).map_err(StoreError::backend)?;
    let context: serde_json::Value = row.get("context");
    let context = serde_json::from_value(context).map_err(StoreError::backend)?;

    Ok(PointsTransaction {
        id: row.get("id"),
        user_id: UserId(row.get::<i64, _>("user_id")),
        action_type,
        points_change: row.get("points_change"),
        balance_after: row.get::<i64, _>("balance_after") as u64,
        base_points: row.get("base_points"),
        multipliers_applied: multipliers,
        context,
        created_at: row.get("created_at"),
        validation_passed: row.get("validation_passed"),
    })
}

#[async_trait]
impl besitos_core::LedgerStore for PgLedgerStore {
    async fn begin(&self) -> Result<Box<dyn besitos_core::LedgerTx>, StoreError> {
        let tx = self.pool.begin().await.map_err(map_sqlx)?;
        Ok(Box::new(PgLedgerTx { tx }))
    }

    async fn balance(&self, user_id: UserId) -> Result<Option<UserBalance>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT user_id, total_points, available_points, signed_total
            FROM balances
            WHERE user_id = $1
            "#,
        )
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        row.as_ref().map(decode_balance).transpose()
    }

    async fn transactions(
        &self,
        user_id: UserId,
        limit: usize,
        action_types: Option<&[ActionType]>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<PointsTransaction>, StoreError> {
        let types: Option<Vec<String>> =
            action_types.map(|ts| ts.iter().map(|t| t.as_str().to_string()).collect());

        let rows = sqlx::query(
            r#"
            SELECT id, user_id, action_type, points_change, balance_after,
                   base_points, multipliers_applied, context, created_at,
                   validation_passed
            FROM points_transactions
            WHERE user_id = $1
              AND ($2::text[] IS NULL OR action_type = ANY($2))
              AND ($3::timestamptz IS NULL OR created_at >= $3)
            ORDER BY created_at DESC
            LIMIT $4
            "#,
        )
        .bind(user_id.0)
        .bind(types)
        .bind(since)
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(decode_transaction).collect()
    }

    async fn full_history(&self, user_id: UserId) -> Result<Vec<PointsTransaction>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, action_type, points_change, balance_after,
                   base_points, multipliers_applied, context, created_at,
                   validation_passed
            FROM points_transactions
            WHERE user_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(decode_transaction).collect()
    }
}

struct PgLedgerTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl besitos_core::LedgerTx for PgLedgerTx {
    /// Lock the balance row for the remainder of the transaction. Under
    /// contention this is where Postgres reports lock timeouts, which map
    /// to the retryable conflict class.
    async fn fetch_balance(&mut self, user_id: UserId) -> Result<Option<UserBalance>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT user_id, total_points, available_points, signed_total
            FROM balances
            WHERE user_id = $1
            FOR UPDATE
            "#,
        )
        .bind(user_id.0)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;

        row.as_ref().map(decode_balance).transpose()
    }

    async fn insert_transaction(&mut self, record: &PointsTransaction) -> Result<(), StoreError> {
        let multipliers =
            serde_json::to_value(&record.multipliers_applied).map_err(StoreError::backend)?;
        let context = serde_json::to_value(&record.context).map_err(StoreError::backend)?;

        sqlx::query(
            r#"
            INSERT INTO points_transactions
                (id, user_id, action_type, points_change, balance_after,
                 base_points, multipliers_applied, context, created_at,
                 validation_passed)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(record.id)
        .bind(record.user_id.0)
        .bind(record.action_type.as_str())
        .bind(record.points_change)
        .bind(record.balance_after as i64)
        .bind(record.base_points)
        .bind(multipliers)
        .bind(context)
        .bind(record.created_at)
        .bind(record.validation_passed)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;

        Ok(())
    }

    async fn write_balance(&mut self, balance: &UserBalance) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO balances (user_id, total_points, available_points, signed_total, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (user_id) DO UPDATE
            SET total_points = EXCLUDED.total_points,
                available_points = EXCLUDED.available_points,
                signed_total = EXCLUDED.signed_total,
                updated_at = NOW()
            "#,
        )
        .bind(balance.user_id.0)
        .bind(balance.total_points as i64)
        .bind(balance.available_points as i64)
        .bind(balance.signed_total)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;

        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(map_sqlx)
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await.map_err(map_sqlx)
    }
}

/// Size-bounded, database-backed event retention window.
#[derive(Clone)]
pub struct PgEventLog {
    pool: PgPool,
    max_retained: i64,
}

impl PgEventLog {
    /// # Arguments
    ///
    /// * `pool` - PostgreSQL connection pool
    /// * `max_retained` - events kept before the oldest are pruned
    pub fn new(pool: PgPool, max_retained: i64) -> Self {
        Self { pool, max_retained }
    }
}

#[async_trait]
impl EventLog for PgEventLog {
    async fn append(&self, event: Event) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO bus_events (id, event_type, created_at, data, correlation_id, source)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(event.id)
        .bind(event.event_type.as_str())
        .bind(event.timestamp)
        .bind(&event.data)
        .bind(event.correlation_id)
        .bind(&event.source)
        .execute(&self.pool)
        .await?;

        // Prune anything beyond the retention bound, oldest first.
        sqlx::query(
            r#"
            DELETE FROM bus_events
            WHERE id IN (
                SELECT id FROM bus_events
                ORDER BY created_at DESC
                OFFSET $1
            )
            "#,
        )
        .bind(self.max_retained)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fetch(
        &self,
        types: Option<&[EventType]>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Event>> {
        let types: Option<Vec<String>> =
            types.map(|ts| ts.iter().map(|t| t.as_str().to_string()).collect());

        let rows = sqlx::query(
            r#"
            SELECT id, event_type, created_at, data, correlation_id, source
            FROM bus_events
            WHERE ($1::text[] IS NULL OR event_type = ANY($1))
              AND ($2::timestamptz IS NULL OR created_at >= $2)
            ORDER BY created_at ASC
            "#,
        )
        .bind(types)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<Event> {
                let event_type: String = row.get("event_type");
                Ok(Event {
                    id: row.get("id"),
                    event_type: event_type.parse()?,
                    timestamp: row.get("created_at"),
                    data: row.get("data"),
                    correlation_id: row.get("correlation_id"),
                    source: row.get("source"),
                })
            })
            .collect()
    }

    async fn retained(&self) -> Result<usize> {
        let row = sqlx::query("SELECT COUNT(*) AS retained FROM bus_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("retained") as usize)
    }
}
