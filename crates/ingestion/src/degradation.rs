//! Degradation protocol.
//!
//! Process-wide state machine that turns health signals into the boolean
//! "degraded" switch per venue. While a venue is degraded its data plane
//! runs over REST polling, and detection widens its edge threshold on the
//! healthy venue. This multiplier rule is the only coupling between ops
//! state and detection math.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use pm_arb_core::events::names;
use pm_arb_core::{EventBus, EventEnvelope, Venue};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};

/// Why a venue was degraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationReason {
    /// Streaming transport lost and not recovered.
    WebsocketDisconnected,
    /// Credentials rejected.
    AuthFailure,
    /// Repeated sequence-gap resyncs.
    ProtocolResync,
    /// Repeated staleness discards.
    DataStale,
    /// Operator action.
    Manual,
}

impl DegradationReason {
    /// Canonical snake_case form used in events and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WebsocketDisconnected => "websocket_disconnected",
            Self::AuthFailure => "auth_failure",
            Self::ProtocolResync => "protocol_resync",
            Self::DataStale => "data_stale",
            Self::Manual => "manual",
        }
    }
}

impl std::fmt::Display for DegradationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State held while a venue is degraded. Absent means healthy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DegradationState {
    /// When the protocol activated.
    pub degraded_at: DateTime<Utc>,
    /// Activation reason.
    pub reason: DegradationReason,
    /// REST polling sweeps completed while degraded.
    pub polling_cycles: u64,
    /// Last data observed before activation, when known.
    pub last_data_at: Option<DateTime<Utc>>,
}

/// Process-wide degradation state machine.
pub struct DegradationProtocol {
    states: RwLock<HashMap<Venue, DegradationState>>,
    multiplier: Decimal,
    bus: EventBus,
}

impl DegradationProtocol {
    /// Creates the protocol with the configured widening multiplier.
    #[must_use]
    pub fn new(multiplier: Decimal, bus: EventBus) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            multiplier,
            bus,
        }
    }

    /// Activates degraded mode for a venue. Idempotent: a second call
    /// while already degraded is a no-op returning `false`.
    pub fn activate(
        &self,
        venue: Venue,
        reason: DegradationReason,
        last_data_at: Option<DateTime<Utc>>,
    ) -> bool {
        {
            let mut states = self.states.write();
            if states.contains_key(&venue) {
                return false;
            }
            states.insert(
                venue,
                DegradationState {
                    degraded_at: Utc::now(),
                    reason,
                    polling_cycles: 0,
                    last_data_at,
                },
            );
        }

        let healthy: Vec<&str> = Venue::ALL
            .iter()
            .filter(|v| !self.is_degraded(**v))
            .map(|v| v.as_str())
            .collect();
        warn!(venue = %venue, reason = %reason, "degradation protocol activated");
        self.bus.publish(EventEnvelope::new(
            names::DEGRADATION_ACTIVATED,
            "degradation",
            serde_json::json!({
                "platform": venue.as_str(),
                "reason": reason.as_str(),
                "healthy_platforms": healthy,
                "last_data_at": last_data_at,
            }),
        ));
        true
    }

    /// Deactivates degraded mode. No-op returning `None` when the venue is
    /// not degraded; otherwise returns the outage duration.
    pub fn deactivate(&self, venue: Venue) -> Option<chrono::Duration> {
        let state = self.states.write().remove(&venue)?;
        let outage = Utc::now() - state.degraded_at;

        info!(
            venue = %venue,
            outage_secs = outage.num_seconds(),
            polling_cycles = state.polling_cycles,
            "degradation protocol deactivated"
        );
        self.bus.publish(EventEnvelope::new(
            names::DEGRADATION_DEACTIVATED,
            "degradation",
            serde_json::json!({
                "platform": venue.as_str(),
                "reason": state.reason.as_str(),
                "outage_secs": outage.num_seconds(),
                "polling_cycles": state.polling_cycles,
            }),
        ));
        Some(outage)
    }

    /// Increments the polling-cycle counter; counts only while degraded.
    pub fn increment_polling_cycle(&self, venue: Venue) -> bool {
        let mut states = self.states.write();
        match states.get_mut(&venue) {
            Some(state) => {
                state.polling_cycles += 1;
                true
            }
            None => false,
        }
    }

    /// True while the venue is degraded.
    #[must_use]
    pub fn is_degraded(&self, venue: Venue) -> bool {
        self.states.read().contains_key(&venue)
    }

    /// Snapshot of the venue's degradation state.
    #[must_use]
    pub fn state(&self, venue: Venue) -> Option<DegradationState> {
        self.states.read().get(&venue).cloned()
    }

    /// Venues currently degraded.
    #[must_use]
    pub fn degraded_venues(&self) -> Vec<Venue> {
        let states = self.states.read();
        Venue::ALL
            .iter()
            .copied()
            .filter(|v| states.contains_key(v))
            .collect()
    }

    /// Threshold multiplier for trading the given venue's leg.
    ///
    /// - `1.0` when the venue itself is degraded: its data is unreliable,
    ///   and detection skips it anyway.
    /// - the configured multiplier when the venue is healthy but any other
    ///   venue is degraded.
    /// - `1.0` when all venues are healthy.
    #[must_use]
    pub fn edge_threshold_multiplier(&self, venue: Venue) -> Decimal {
        let states = self.states.read();
        if states.contains_key(&venue) {
            return Decimal::ONE;
        }
        if Venue::ALL
            .iter()
            .any(|v| *v != venue && states.contains_key(v))
        {
            return self.multiplier;
        }
        Decimal::ONE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn protocol() -> DegradationProtocol {
        DegradationProtocol::new(dec!(1.5), EventBus::default())
    }

    // ==================== Activation Tests ====================

    #[test]
    fn test_activate_then_state_visible() {
        let p = protocol();
        assert!(p.activate(Venue::Kalshi, DegradationReason::WebsocketDisconnected, None));
        assert!(p.is_degraded(Venue::Kalshi));
        assert!(!p.is_degraded(Venue::Polymarket));
        let state = p.state(Venue::Kalshi).unwrap();
        assert_eq!(state.reason, DegradationReason::WebsocketDisconnected);
        assert_eq!(state.polling_cycles, 0);
    }

    #[test]
    fn test_activate_is_idempotent() {
        let p = protocol();
        assert!(p.activate(Venue::Kalshi, DegradationReason::DataStale, None));
        let first = p.state(Venue::Kalshi).unwrap();
        // Second call with a different reason changes nothing.
        assert!(!p.activate(Venue::Kalshi, DegradationReason::Manual, None));
        assert_eq!(p.state(Venue::Kalshi).unwrap(), first);
    }

    #[test]
    fn test_deactivate_when_healthy_is_noop() {
        let p = protocol();
        assert!(p.deactivate(Venue::Kalshi).is_none());
    }

    #[test]
    fn test_deactivate_clears_state() {
        let p = protocol();
        p.activate(Venue::Kalshi, DegradationReason::ProtocolResync, None);
        let outage = p.deactivate(Venue::Kalshi).unwrap();
        assert!(outage.num_seconds() >= 0);
        assert!(!p.is_degraded(Venue::Kalshi));
        // Deactivating again stays a no-op.
        assert!(p.deactivate(Venue::Kalshi).is_none());
    }

    #[test]
    fn test_degraded_set_matches_state_and_flag() {
        let p = protocol();
        for venue in Venue::ALL {
            assert_eq!(p.is_degraded(venue), p.state(venue).is_some());
            assert!(!p.degraded_venues().contains(&venue));
        }
        p.activate(Venue::Polymarket, DegradationReason::DataStale, None);
        assert_eq!(p.degraded_venues(), vec![Venue::Polymarket]);
        assert!(p.state(Venue::Polymarket).is_some());
        assert!(p.is_degraded(Venue::Polymarket));
    }

    // ==================== Polling Cycle Tests ====================

    #[test]
    fn test_polling_cycle_counts_only_while_degraded() {
        let p = protocol();
        assert!(!p.increment_polling_cycle(Venue::Kalshi));

        p.activate(Venue::Kalshi, DegradationReason::WebsocketDisconnected, None);
        assert!(p.increment_polling_cycle(Venue::Kalshi));
        assert!(p.increment_polling_cycle(Venue::Kalshi));
        assert_eq!(p.state(Venue::Kalshi).unwrap().polling_cycles, 2);
    }

    // ==================== Multiplier Tests ====================

    #[test]
    fn test_multiplier_all_healthy_is_one() {
        let p = protocol();
        assert_eq!(p.edge_threshold_multiplier(Venue::Kalshi), dec!(1.0));
        assert_eq!(p.edge_threshold_multiplier(Venue::Polymarket), dec!(1.0));
    }

    #[test]
    fn test_multiplier_widens_on_healthy_leg() {
        let p = protocol();
        p.activate(Venue::Polymarket, DegradationReason::DataStale, None);
        // The healthy venue widens; the degraded one does not.
        assert_eq!(p.edge_threshold_multiplier(Venue::Kalshi), dec!(1.5));
        assert_eq!(p.edge_threshold_multiplier(Venue::Polymarket), dec!(1.0));
    }

    #[test]
    fn test_multiplier_restores_after_deactivation() {
        let p = protocol();
        p.activate(Venue::Polymarket, DegradationReason::DataStale, None);
        p.deactivate(Venue::Polymarket);
        assert_eq!(p.edge_threshold_multiplier(Venue::Kalshi), dec!(1.0));
    }

    // ==================== Event Tests ====================

    #[tokio::test]
    async fn test_activation_event_lists_healthy_platforms() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe("degradation.*");
        let p = DegradationProtocol::new(dec!(1.5), bus);

        p.activate(Venue::Kalshi, DegradationReason::AuthFailure, None);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, names::DEGRADATION_ACTIVATED);
        assert_eq!(event.payload["platform"], "kalshi");
        assert_eq!(event.payload["reason"], "auth_failure");
        assert_eq!(
            event.payload["healthy_platforms"],
            serde_json::json!(["polymarket"])
        );
    }

    #[tokio::test]
    async fn test_deactivation_event_carries_impact() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe(names::DEGRADATION_DEACTIVATED);
        let p = DegradationProtocol::new(dec!(1.5), bus);

        p.activate(Venue::Kalshi, DegradationReason::ProtocolResync, None);
        p.increment_polling_cycle(Venue::Kalshi);
        p.deactivate(Venue::Kalshi);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.payload["platform"], "kalshi");
        assert_eq!(event.payload["polling_cycles"], 1);
        assert!(event.payload["outage_secs"].is_number());
    }
}
