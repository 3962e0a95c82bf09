//! Postgres implementation of the persistence sink.
//!
//! Three append-only tables: `order_book_snapshot`, `platform_health_log`,
//! and `audit_log` (ordered by insertion). Bids and asks are stored as
//! JSON exactly as normalized.

use crate::sink::{AuditRecord, PersistenceSink, SinkError, StoredAuditRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pm_arb_core::{HealthStatus, NormalizedOrderBook, Venue};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

/// Postgres-backed sink.
pub struct PostgresSink {
    pool: PgPool,
}

impl PostgresSink {
    /// Connects a pool and ensures the schema exists.
    ///
    /// # Errors
    ///
    /// `SinkError::Write` when the connection or schema setup fails.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, SinkError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| SinkError::Write(format!("connect failed: {e}")))?;
        let sink = Self { pool };
        sink.ensure_schema().await?;
        Ok(sink)
    }

    /// Wraps an existing pool (used by tests and migrations).
    #[must_use]
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn ensure_schema(&self) -> Result<(), SinkError> {
        for ddl in [
            r"
            CREATE TABLE IF NOT EXISTS order_book_snapshot (
                id BIGSERIAL PRIMARY KEY,
                platform TEXT NOT NULL,
                contract_id TEXT NOT NULL,
                bids JSONB NOT NULL,
                asks JSONB NOT NULL,
                sequence_number BIGINT,
                created_at TIMESTAMPTZ NOT NULL
            )
            ",
            r"
            CREATE TABLE IF NOT EXISTS platform_health_log (
                id BIGSERIAL PRIMARY KEY,
                platform TEXT NOT NULL,
                status TEXT NOT NULL,
                last_update TIMESTAMPTZ NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            ",
            r"
            CREATE TABLE IF NOT EXISTS audit_log (
                id BIGSERIAL PRIMARY KEY,
                event_type TEXT NOT NULL,
                module TEXT NOT NULL,
                correlation_id TEXT,
                details JSONB NOT NULL,
                previous_hash TEXT NOT NULL,
                current_hash TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            ",
        ] {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .map_err(|e| SinkError::Write(format!("schema setup failed: {e}")))?;
        }
        Ok(())
    }
}

fn status_str(status: HealthStatus) -> &'static str {
    match status {
        HealthStatus::Healthy => "healthy",
        HealthStatus::Degraded => "degraded",
        HealthStatus::Disconnected => "disconnected",
    }
}

fn row_to_stored(row: &sqlx::postgres::PgRow) -> StoredAuditRecord {
    StoredAuditRecord {
        id: row.get("id"),
        record: AuditRecord {
            event_type: row.get("event_type"),
            module: row.get("module"),
            correlation_id: row.get("correlation_id"),
            details: row.get::<JsonValue, _>("details"),
            previous_hash: row.get("previous_hash"),
            current_hash: row.get("current_hash"),
            created_at: row.get("created_at"),
        },
    }
}

#[async_trait]
impl PersistenceSink for PostgresSink {
    async fn append_snapshot(&self, book: &NormalizedOrderBook) -> Result<(), SinkError> {
        let bids = serde_json::to_value(&book.bids)
            .map_err(|e| SinkError::Write(format!("bid encode failed: {e}")))?;
        let asks = serde_json::to_value(&book.asks)
            .map_err(|e| SinkError::Write(format!("ask encode failed: {e}")))?;

        sqlx::query(
            r"
            INSERT INTO order_book_snapshot
                (platform, contract_id, bids, asks, sequence_number, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(book.venue.as_str())
        .bind(&book.contract_id)
        .bind(bids)
        .bind(asks)
        .bind(book.sequence.map(|s| s as i64))
        .bind(book.observed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| SinkError::Write(e.to_string()))?;
        Ok(())
    }

    async fn append_health(
        &self,
        venue: Venue,
        status: HealthStatus,
        last_update: DateTime<Utc>,
    ) -> Result<(), SinkError> {
        sqlx::query(
            r"
            INSERT INTO platform_health_log (platform, status, last_update, created_at)
            VALUES ($1, $2, $3, now())
            ",
        )
        .bind(venue.as_str())
        .bind(status_str(status))
        .bind(last_update)
        .execute(&self.pool)
        .await
        .map_err(|e| SinkError::Write(e.to_string()))?;
        Ok(())
    }

    async fn append_audit(&self, record: &AuditRecord) -> Result<i64, SinkError> {
        let row = sqlx::query(
            r"
            INSERT INTO audit_log
                (event_type, module, correlation_id, details,
                 previous_hash, current_hash, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            ",
        )
        .bind(&record.event_type)
        .bind(&record.module)
        .bind(&record.correlation_id)
        .bind(&record.details)
        .bind(&record.previous_hash)
        .bind(&record.current_hash)
        .bind(record.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| SinkError::Write(e.to_string()))?;
        Ok(row.get("id"))
    }

    async fn last_audit(&self) -> Result<Option<StoredAuditRecord>, SinkError> {
        let row = sqlx::query(
            r"
            SELECT id, event_type, module, correlation_id, details,
                   previous_hash, current_hash, created_at
            FROM audit_log
            ORDER BY id DESC
            LIMIT 1
            ",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SinkError::Read(e.to_string()))?;
        Ok(row.as_ref().map(row_to_stored))
    }

    async fn audit_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<StoredAuditRecord>, SinkError> {
        let rows = sqlx::query(
            r"
            SELECT id, event_type, module, correlation_id, details,
                   previous_hash, current_hash, created_at
            FROM audit_log
            WHERE created_at >= $1 AND created_at <= $2
            ORDER BY id ASC
            ",
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SinkError::Read(e.to_string()))?;
        Ok(rows.iter().map(row_to_stored).collect())
    }

    async fn audit_before(&self, id: i64) -> Result<Option<StoredAuditRecord>, SinkError> {
        let row = sqlx::query(
            r"
            SELECT id, event_type, module, correlation_id, details,
                   previous_hash, current_hash, created_at
            FROM audit_log
            WHERE id < $1
            ORDER BY id DESC
            LIMIT 1
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SinkError::Read(e.to_string()))?;
        Ok(row.as_ref().map(row_to_stored))
    }
}
