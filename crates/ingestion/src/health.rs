//! Per-venue health tracking.
//!
//! Updated on every successful ingestion (latency sample) and on every
//! reported transport failure (status downgrade). Status transitions are
//! published as `platform.health.changed`.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use pm_arb_core::events::names;
use pm_arb_core::{EventBus, EventEnvelope, HealthStatus, Venue, VenueHealthView};
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// Latency samples retained per venue.
const LATENCY_WINDOW: usize = 128;

#[derive(Debug)]
struct VenueHealth {
    status: HealthStatus,
    last_heartbeat: Option<DateTime<Utc>>,
    latencies_ms: VecDeque<u64>,
    mode: Option<&'static str>,
}

impl Default for VenueHealth {
    fn default() -> Self {
        Self {
            status: HealthStatus::Disconnected,
            last_heartbeat: None,
            latencies_ms: VecDeque::new(),
            mode: None,
        }
    }
}

/// Tracks liveness and latency for every venue.
pub struct HealthTracker {
    venues: RwLock<HashMap<Venue, VenueHealth>>,
    bus: EventBus,
}

impl HealthTracker {
    /// Creates a tracker publishing transitions on the given bus.
    #[must_use]
    pub fn new(bus: EventBus) -> Self {
        Self {
            venues: RwLock::new(HashMap::new()),
            bus,
        }
    }

    /// Records a successful I/O with its observed latency.
    pub fn record_success(&self, venue: Venue, latency_ms: u64) {
        self.transition(venue, HealthStatus::Healthy, None, Some(latency_ms));
    }

    /// Records a transport failure.
    pub fn record_failure(&self, venue: Venue) {
        self.transition(venue, HealthStatus::Disconnected, None, None);
    }

    /// Marks the venue as operating over the degraded polling path.
    pub fn mark_degraded(&self, venue: Venue) {
        self.transition(venue, HealthStatus::Degraded, Some("rest_polling"), None);
    }

    fn transition(
        &self,
        venue: Venue,
        status: HealthStatus,
        mode: Option<&'static str>,
        latency_ms: Option<u64>,
    ) {
        let previous = {
            let mut venues = self.venues.write();
            let entry = venues.entry(venue).or_default();
            let previous = entry.status;
            entry.status = status;
            entry.mode = mode;
            if let Some(ms) = latency_ms {
                entry.last_heartbeat = Some(Utc::now());
                if entry.latencies_ms.len() == LATENCY_WINDOW {
                    entry.latencies_ms.pop_front();
                }
                entry.latencies_ms.push_back(ms);
            }
            previous
        };

        if previous != status {
            debug!(venue = %venue, from = ?previous, to = ?status, "platform health changed");
            self.bus.publish(EventEnvelope::new(
                names::PLATFORM_HEALTH_CHANGED,
                "health",
                serde_json::json!({
                    "platform": venue.as_str(),
                    "from": format!("{previous:?}").to_lowercase(),
                    "to": format!("{status:?}").to_lowercase(),
                }),
            ));
        }
    }

    /// Point-in-time view of one venue.
    #[must_use]
    pub fn view(&self, venue: Venue) -> VenueHealthView {
        let venues = self.venues.read();
        match venues.get(&venue) {
            Some(health) => VenueHealthView {
                venue,
                status: health.status,
                last_heartbeat: health.last_heartbeat,
                latency_ms_p50: p50(&health.latencies_ms),
            },
            None => VenueHealthView {
                venue,
                status: HealthStatus::Disconnected,
                last_heartbeat: None,
                latency_ms_p50: None,
            },
        }
    }

    /// Current status of one venue.
    #[must_use]
    pub fn status(&self, venue: Venue) -> HealthStatus {
        self.view(venue).status
    }
}

fn p50(samples: &VecDeque<u64>) -> Option<u64> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted: Vec<u64> = samples.iter().copied().collect();
    sorted.sort_unstable();
    Some(sorted[sorted.len() / 2])
}
