//! Persistence sink contract.
//!
//! The relational schema is an external concern; the engine writes through
//! this trait and never reads snapshots back. [`MemorySink`] is the test
//! double used across the workspace, with write-failure injection for the
//! consecutive-failure policy and audit tampering for chain verification
//! tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use pm_arb_core::{HealthStatus, NormalizedOrderBook, Venue};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Persistence failures.
#[derive(Debug, Clone, Error)]
pub enum SinkError {
    /// A write could not be persisted.
    #[error("sink write failed: {0}")]
    Write(String),

    /// A read could not be served.
    #[error("sink read failed: {0}")]
    Read(String),
}

/// One audit row as written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    /// Dot-notation event name.
    pub event_type: String,
    /// Emitting module.
    pub module: String,
    /// Correlation id of the originating operation.
    pub correlation_id: Option<String>,
    /// Structured details.
    pub details: JsonValue,
    /// Hash of the predecessor entry (hex).
    pub previous_hash: String,
    /// Hash of this entry (hex).
    pub current_hash: String,
    /// Append timestamp.
    pub created_at: DateTime<Utc>,
}

/// An audit row with its storage id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAuditRecord {
    /// Insertion-ordered id.
    pub id: i64,
    /// The row.
    pub record: AuditRecord,
}

/// Append-only persistence used by ingestion and the audit log.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    /// Appends one order-book snapshot.
    async fn append_snapshot(&self, book: &NormalizedOrderBook) -> Result<(), SinkError>;

    /// Appends one platform-health row.
    async fn append_health(
        &self,
        venue: Venue,
        status: HealthStatus,
        last_update: DateTime<Utc>,
    ) -> Result<(), SinkError>;

    /// Appends one audit row, returning its storage id.
    async fn append_audit(&self, record: &AuditRecord) -> Result<i64, SinkError>;

    /// The most recently appended audit row.
    async fn last_audit(&self) -> Result<Option<StoredAuditRecord>, SinkError>;

    /// Audit rows created inside `[from, to]`, in insertion order.
    async fn audit_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<StoredAuditRecord>, SinkError>;

    /// The row immediately preceding the given id, if any.
    async fn audit_before(&self, id: i64) -> Result<Option<StoredAuditRecord>, SinkError>;
}

// =============================================================================
// In-memory sink
// =============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    snapshots: Vec<NormalizedOrderBook>,
    health: Vec<(Venue, HealthStatus, DateTime<Utc>)>,
    audit: Vec<StoredAuditRecord>,
    fail_writes: bool,
    fail_next: u32,
}

impl MemoryState {
    fn write_gate(&mut self) -> Result<(), SinkError> {
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(SinkError::Write("injected failure".into()));
        }
        if self.fail_writes {
            return Err(SinkError::Write("injected failure".into()));
        }
        Ok(())
    }
}

/// In-memory sink for tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    state: Mutex<MemoryState>,
}

impl MemorySink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail until cleared.
    pub fn set_fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    /// Makes exactly the next `n` writes fail, then recover.
    pub fn set_fail_next(&self, n: u32) {
        self.state.lock().fail_next = n;
    }

    /// Number of persisted snapshots.
    #[must_use]
    pub fn snapshot_count(&self) -> usize {
        self.state.lock().snapshots.len()
    }

    /// Persisted snapshots (cloned).
    #[must_use]
    pub fn snapshots(&self) -> Vec<NormalizedOrderBook> {
        self.state.lock().snapshots.clone()
    }

    /// Persisted health rows (cloned).
    #[must_use]
    pub fn health_rows(&self) -> Vec<(Venue, HealthStatus, DateTime<Utc>)> {
        self.state.lock().health.clone()
    }

    /// Number of audit rows.
    #[must_use]
    pub fn audit_count(&self) -> usize {
        self.state.lock().audit.len()
    }

    /// Overwrites a stored audit row's details in place, simulating
    /// tampering in storage.
    pub fn tamper_audit_details(&self, id: i64, details: JsonValue) {
        let mut state = self.state.lock();
        if let Some(row) = state.audit.iter_mut().find(|r| r.id == id) {
            row.record.details = details;
        }
    }
}

#[async_trait]
impl PersistenceSink for MemorySink {
    async fn append_snapshot(&self, book: &NormalizedOrderBook) -> Result<(), SinkError> {
        let mut state = self.state.lock();
        state.write_gate()?;
        state.snapshots.push(book.clone());
        Ok(())
    }

    async fn append_health(
        &self,
        venue: Venue,
        status: HealthStatus,
        last_update: DateTime<Utc>,
    ) -> Result<(), SinkError> {
        let mut state = self.state.lock();
        state.write_gate()?;
        state.health.push((venue, status, last_update));
        Ok(())
    }

    async fn append_audit(&self, record: &AuditRecord) -> Result<i64, SinkError> {
        let mut state = self.state.lock();
        state.write_gate()?;
        let id = state.audit.len() as i64 + 1;
        state.audit.push(StoredAuditRecord {
            id,
            record: record.clone(),
        });
        Ok(id)
    }

    async fn last_audit(&self) -> Result<Option<StoredAuditRecord>, SinkError> {
        Ok(self.state.lock().audit.last().cloned())
    }

    async fn audit_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<StoredAuditRecord>, SinkError> {
        Ok(self
            .state
            .lock()
            .audit
            .iter()
            .filter(|r| r.record.created_at >= from && r.record.created_at <= to)
            .cloned()
            .collect())
    }

    async fn audit_before(&self, id: i64) -> Result<Option<StoredAuditRecord>, SinkError> {
        Ok(self
            .state
            .lock()
            .audit
            .iter()
            .filter(|r| r.id < id)
            .max_by_key(|r| r.id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pm_arb_core::PriceLevel;
    use rust_decimal::Decimal;

    fn book() -> NormalizedOrderBook {
        NormalizedOrderBook::new(
            Venue::Kalshi,
            "KXT",
            vec![PriceLevel::new(
                Decimal::new(40, 2),
                Decimal::from(100u32),
            )],
            vec![],
        )
    }

    fn audit(event_type: &str) -> AuditRecord {
        AuditRecord {
            event_type: event_type.into(),
            module: "test".into(),
            correlation_id: None,
            details: serde_json::json!({"k": 1}),
            previous_hash: "0".repeat(64),
            current_hash: "a".repeat(64),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_snapshot_append_and_count() {
        let sink = MemorySink::new();
        sink.append_snapshot(&book()).await.unwrap();
        sink.append_snapshot(&book()).await.unwrap();
        assert_eq!(sink.snapshot_count(), 2);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let sink = MemorySink::new();
        sink.set_fail_writes(true);
        assert!(sink.append_snapshot(&book()).await.is_err());
        sink.set_fail_writes(false);
        assert!(sink.append_snapshot(&book()).await.is_ok());
        assert_eq!(sink.snapshot_count(), 1);
    }

    #[tokio::test]
    async fn test_audit_ids_are_insertion_ordered() {
        let sink = MemorySink::new();
        let a = sink.append_audit(&audit("e.a")).await.unwrap();
        let b = sink.append_audit(&audit("e.b")).await.unwrap();
        assert!(b > a);

        let last = sink.last_audit().await.unwrap().unwrap();
        assert_eq!(last.record.event_type, "e.b");

        let before = sink.audit_before(b).await.unwrap().unwrap();
        assert_eq!(before.id, a);
        assert!(sink.audit_before(a).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_audit_range_filters_by_time() {
        let sink = MemorySink::new();
        let mut old = audit("e.old");
        old.created_at = Utc::now() - chrono::Duration::days(2);
        sink.append_audit(&old).await.unwrap();
        sink.append_audit(&audit("e.new")).await.unwrap();

        let rows = sink
            .audit_range(Utc::now() - chrono::Duration::hours(1), Utc::now())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].record.event_type, "e.new");
    }

    #[tokio::test]
    async fn test_tampering_changes_stored_details() {
        let sink = MemorySink::new();
        let id = sink.append_audit(&audit("e.a")).await.unwrap();
        sink.tamper_audit_details(id, serde_json::json!({"k": 999}));
        let stored = sink.last_audit().await.unwrap().unwrap();
        assert_eq!(stored.record.details, serde_json::json!({"k": 999}));
    }
}
