//! Event catalog and envelope.
//!
//! Event names use lowercase dot notation. Every envelope carries a UTC
//! timestamp and an optional correlation id generated at the origin of the
//! logical operation (a detection cycle, a WS update, a polling sweep) and
//! inherited by everything the operation emits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Well-known event names.
pub mod names {
    /// A normalized book was persisted and broadcast.
    pub const ORDERBOOK_UPDATED: &str = "orderbook.updated";
    /// A book was discarded for exceeding the staleness bound.
    pub const DATA_STALE: &str = "data.stale";
    /// An enriched opportunity cleared the effective threshold.
    pub const OPPORTUNITY_IDENTIFIED: &str = "detection.opportunity.identified";
    /// A dislocation was rejected by the edge filter.
    pub const OPPORTUNITY_FILTERED: &str = "detection.opportunity.filtered";
    /// A venue entered degraded mode.
    pub const DEGRADATION_ACTIVATED: &str = "degradation.protocol.activated";
    /// A venue left degraded mode.
    pub const DEGRADATION_DEACTIVATED: &str = "degradation.protocol.deactivated";
    /// A venue's health status changed.
    pub const PLATFORM_HEALTH_CHANGED: &str = "platform.health.changed";
    /// An audit append could not be persisted. Never itself audited.
    pub const AUDIT_WRITE_FAILED: &str = "monitoring.audit.write_failed";
    /// Critical system-health condition (persistence failure streak).
    pub const SYSTEM_HEALTH_CRITICAL: &str = "system.health.critical";
    /// Clock drift beyond the halt threshold; detection stops.
    pub const TIME_DRIFT_HALT: &str = "time.drift.halt";
}

/// Correlation id for one logical operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    /// Generates a fresh id at the origin of an operation.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A typed event record flowing over the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Dot-notation lowercase event name.
    pub event_type: String,
    /// Emitting module (used for audit attribution).
    pub module: String,
    /// Structured payload.
    pub payload: serde_json::Value,
    /// Correlation id inherited from the originating operation.
    pub correlation_id: Option<CorrelationId>,
    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,
}

impl EventEnvelope {
    /// Creates an envelope stamped now.
    #[must_use]
    pub fn new(
        event_type: impl Into<String>,
        module: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            module: module.into(),
            payload,
            correlation_id: None,
            occurred_at: Utc::now(),
        }
    }

    /// Attaches the originating operation's correlation id.
    #[must_use]
    pub fn with_correlation(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_lowercase_dotted() {
        let all = [
            names::ORDERBOOK_UPDATED,
            names::DATA_STALE,
            names::OPPORTUNITY_IDENTIFIED,
            names::OPPORTUNITY_FILTERED,
            names::DEGRADATION_ACTIVATED,
            names::DEGRADATION_DEACTIVATED,
            names::PLATFORM_HEALTH_CHANGED,
            names::AUDIT_WRITE_FAILED,
            names::SYSTEM_HEALTH_CRITICAL,
            names::TIME_DRIFT_HALT,
        ];
        for name in all {
            assert!(name.contains('.'), "{name} should be dotted");
            assert_eq!(name, name.to_lowercase());
        }
    }

    #[test]
    fn test_correlation_ids_are_unique() {
        assert_ne!(CorrelationId::new(), CorrelationId::new());
    }

    #[test]
    fn test_envelope_carries_correlation() {
        let id = CorrelationId::new();
        let env = EventEnvelope::new(
            names::ORDERBOOK_UPDATED,
            "ingestion",
            serde_json::json!({"venue": "kalshi"}),
        )
        .with_correlation(id);
        assert_eq!(env.correlation_id, Some(id));
        assert_eq!(env.event_type, names::ORDERBOOK_UPDATED);
    }

    #[test]
    fn test_envelope_serde_round_trip() {
        let env = EventEnvelope::new("a.b", "m", serde_json::json!({"k": 1}))
            .with_correlation(CorrelationId::new());
        let json = serde_json::to_string(&env).unwrap();
        let back: EventEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_type, env.event_type);
        assert_eq!(back.correlation_id, env.correlation_id);
    }
}
