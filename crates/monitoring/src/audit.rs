//! Tamper-evident audit log.
//!
//! Every domain event appends a row whose hash covers the canonical JSON
//! serialization (keys sorted at every nesting depth) of the event,
//! chained to the predecessor's hash. Appends are linearized through a
//! single-writer task so the chain is total regardless of event origin.
//! A write failure publishes `monitoring.audit.write_failed` (never
//! itself audited), retries once, and surfaces the error.

use chrono::{DateTime, SecondsFormat, Utc};
use pm_arb_core::events::names;
use pm_arb_core::{CorrelationId, EventBus, EventEnvelope};
use pm_arb_data::{AuditRecord, PersistenceSink, SinkError};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

/// Hash of the chain's origin: the all-zero digest.
pub const GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Depth of the append queue.
const QUEUE_DEPTH: usize = 1024;

/// Serializes JSON with lexicographically sorted keys at every depth.
///
/// Field order is load-bearing for the chain: the same details must hash
/// identically on every run.
#[must_use]
pub fn canonical_json(value: &JsonValue) -> String {
    match value {
        JsonValue::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).expect("string serializes"),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        JsonValue::Array(items) => {
            let elements: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", elements.join(","))
        }
        other => serde_json::to_string(other).expect("scalar serializes"),
    }
}

/// Computes one entry's hash over
/// `event_type || module || canonical_json(details) || previous_hash || created_at`.
#[must_use]
pub fn compute_entry_hash(
    event_type: &str,
    module: &str,
    details: &JsonValue,
    previous_hash: &str,
    created_at: DateTime<Utc>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event_type.as_bytes());
    hasher.update(module.as_bytes());
    hasher.update(canonical_json(details).as_bytes());
    hasher.update(previous_hash.as_bytes());
    hasher.update(created_at.to_rfc3339_opts(SecondsFormat::Micros, true).as_bytes());
    hex::encode(hasher.finalize())
}

/// Result of verifying a chain segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainVerification {
    /// True when every link and hash checked out.
    pub valid: bool,
    /// Entries examined.
    pub entries_checked: u32,
    /// First broken entry, when invalid.
    pub broken_at_id: Option<i64>,
}

struct AppendRequest {
    event_type: String,
    module: String,
    details: JsonValue,
    correlation_id: Option<CorrelationId>,
    reply: oneshot::Sender<Result<i64, SinkError>>,
}

/// Handle to the single-writer audit log.
#[derive(Clone)]
pub struct AuditLog {
    tx: mpsc::Sender<AppendRequest>,
    sink: Arc<dyn PersistenceSink>,
}

impl AuditLog {
    /// Loads the chain head and spawns the writer task.
    ///
    /// # Errors
    ///
    /// `SinkError::Read` when the head cannot be loaded.
    pub async fn start(
        sink: Arc<dyn PersistenceSink>,
        bus: EventBus,
    ) -> Result<Self, SinkError> {
        let head = match sink.last_audit().await? {
            Some(stored) => stored.record.current_hash,
            None => GENESIS_HASH.to_string(),
        };
        info!(head = %head, "audit log started");

        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        tokio::spawn(run_writer(Arc::clone(&sink), bus, head, rx));
        Ok(Self { tx, sink })
    }

    /// Appends one entry, waiting for the write to land.
    ///
    /// # Errors
    ///
    /// Surfaces the sink error after the single retry fails, or a write
    /// error when the writer task is gone.
    pub async fn append(
        &self,
        event_type: impl Into<String>,
        module: impl Into<String>,
        details: JsonValue,
        correlation_id: Option<CorrelationId>,
    ) -> Result<i64, SinkError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(AppendRequest {
                event_type: event_type.into(),
                module: module.into(),
                details,
                correlation_id,
                reply,
            })
            .await
            .map_err(|_| SinkError::Write("audit writer stopped".into()))?;
        rx.await
            .map_err(|_| SinkError::Write("audit writer dropped request".into()))?
    }

    /// Feeds every bus event into the audit queue.
    ///
    /// `monitoring.audit.write_failed` is excluded, so a failing append
    /// cannot audit itself recursively.
    pub fn spawn_bus_feed(&self, bus: &EventBus) -> tokio::task::JoinHandle<()> {
        let mut rx = bus.subscribe("*");
        let log = self.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if event.event_type == names::AUDIT_WRITE_FAILED {
                            continue;
                        }
                        if let Err(e) = log
                            .append(
                                event.event_type.clone(),
                                event.module.clone(),
                                event.payload.clone(),
                                event.correlation_id,
                            )
                            .await
                        {
                            warn!(event_type = %event.event_type, error = %e, "audit append failed");
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "audit feed lagged, events missed");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Verifies the chain across a date range.
    ///
    /// The entry immediately preceding the range anchors the first link;
    /// with none, the first entry must chain from the genesis digest.
    ///
    /// # Errors
    ///
    /// `SinkError::Read` when rows cannot be loaded.
    pub async fn verify_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<ChainVerification, SinkError> {
        let rows = self.sink.audit_range(from, to).await?;
        let Some(first) = rows.first() else {
            return Ok(ChainVerification {
                valid: true,
                entries_checked: 0,
                broken_at_id: None,
            });
        };

        let mut expected_previous = match self.sink.audit_before(first.id).await? {
            Some(anchor) => anchor.record.current_hash,
            None => GENESIS_HASH.to_string(),
        };

        let mut checked = 0u32;
        for row in &rows {
            checked += 1;
            if row.record.previous_hash != expected_previous {
                return Ok(ChainVerification {
                    valid: false,
                    entries_checked: checked,
                    broken_at_id: Some(row.id),
                });
            }
            let recomputed = compute_entry_hash(
                &row.record.event_type,
                &row.record.module,
                &row.record.details,
                &row.record.previous_hash,
                row.record.created_at,
            );
            if recomputed != row.record.current_hash {
                return Ok(ChainVerification {
                    valid: false,
                    entries_checked: checked,
                    broken_at_id: Some(row.id),
                });
            }
            expected_previous = row.record.current_hash.clone();
        }

        Ok(ChainVerification {
            valid: true,
            entries_checked: checked,
            broken_at_id: None,
        })
    }
}

async fn run_writer(
    sink: Arc<dyn PersistenceSink>,
    bus: EventBus,
    mut head: String,
    mut rx: mpsc::Receiver<AppendRequest>,
) {
    while let Some(request) = rx.recv().await {
        let created_at = Utc::now();
        let current_hash = compute_entry_hash(
            &request.event_type,
            &request.module,
            &request.details,
            &head,
            created_at,
        );
        let record = AuditRecord {
            event_type: request.event_type.clone(),
            module: request.module.clone(),
            correlation_id: request.correlation_id.map(|c| c.to_string()),
            details: request.details.clone(),
            previous_hash: head.clone(),
            current_hash: current_hash.clone(),
            created_at,
        };

        let mut outcome = sink.append_audit(&record).await;
        if let Err(ref e) = outcome {
            error!(event_type = %record.event_type, error = %e, "audit write failed, retrying once");
            bus.publish(EventEnvelope::new(
                names::AUDIT_WRITE_FAILED,
                "audit",
                serde_json::json!({
                    "event_type": record.event_type,
                    "error": e.to_string(),
                }),
            ));
            outcome = sink.append_audit(&record).await;
        }

        match outcome {
            Ok(id) => {
                head = current_hash;
                let _ = request.reply.send(Ok(id));
            }
            Err(e) => {
                let _ = request.reply.send(Err(e));
            }
        }
    }
}
