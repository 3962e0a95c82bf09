//! Venue connector contract.
//!
//! Both venue implementations present this one interface to the rest of
//! the engine. Book updates flow out through an injected channel rather
//! than a direct call into the ingestion pipeline, which keeps the
//! connector crates free of a dependency cycle on ingestion.

use crate::book::NormalizedOrderBook;
use crate::error::PlatformResult;
use crate::venue::Venue;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Venue fee schedule used by the edge calculator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeSchedule {
    /// Maker fee, percent.
    pub maker_pct: Decimal,
    /// Taker fee, percent. Arbitrage legs cross the spread, so this is the
    /// rate the edge calculator charges.
    pub taker_pct: Decimal,
    /// Estimated gas per trade in USD, for on-chain venues.
    pub gas_estimate_usd: Option<Decimal>,
    /// Human description of the schedule.
    pub description: String,
}

/// Connector-reported liveness status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Live transport, fresh data.
    Healthy,
    /// Operating over the degraded (polling) path.
    Degraded,
    /// No transport available.
    Disconnected,
}

/// Point-in-time health view exposed by a connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueHealthView {
    /// Venue this view describes.
    pub venue: Venue,
    /// Current status.
    pub status: HealthStatus,
    /// Last successful I/O.
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Median observed update latency, milliseconds.
    pub latency_ms_p50: Option<u64>,
}

/// Transport-level signals a connector pushes alongside book updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportSignal {
    /// The streaming transport (re)connected.
    Connected,
    /// The streaming transport dropped.
    Disconnected {
        /// Human-readable cause.
        reason: String,
    },
    /// Authentication was rejected; the venue must be degraded immediately.
    AuthFailed {
        /// Rejection detail.
        reason: String,
    },
    /// Sequence-gap resyncs exceeded the configured budget inside the
    /// window.
    ResyncStorm {
        /// Resyncs observed inside the window.
        resyncs: u32,
    },
    /// Staleness discards exceeded the configured budget inside the window.
    StaleData {
        /// Discards observed inside the window.
        discards: u32,
    },
}

/// Messages a connector delivers to its subscriber channel.
#[derive(Debug, Clone)]
pub enum ConnectorEvent {
    /// A validated, normalized order book.
    Book(NormalizedOrderBook),
    /// A book was discarded for exceeding the staleness bound.
    Stale {
        /// Venue of the discarded book.
        venue: Venue,
        /// Contract the book belonged to.
        contract_id: String,
        /// Observed age in seconds.
        age_secs: i64,
    },
    /// Transport state change.
    Transport {
        /// Venue the signal concerns.
        venue: Venue,
        /// The signal.
        signal: TransportSignal,
    },
}

/// Side of an order, in YES-contract terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    /// Buy the YES contract.
    Yes,
    /// Buy the NO contract.
    No,
}

/// Order submission request. Execution is an external collaborator; this
/// is the contract detection emits into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Venue-native contract identifier.
    pub contract_id: String,
    /// Side to buy.
    pub side: OrderSide,
    /// Limit price as a probability.
    pub limit_price: Decimal,
    /// Contract units.
    pub size: Decimal,
    /// Idempotency key.
    pub client_order_id: String,
}

/// Acknowledgement returned by order submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    /// Venue-assigned order id.
    pub order_id: String,
    /// Accepted-at timestamp.
    pub accepted_at: DateTime<Utc>,
}

/// Lifecycle state of a submitted order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    /// Accepted, not yet resting or filled.
    Pending,
    /// Resting on the book.
    Resting,
    /// Partially filled.
    PartiallyFilled,
    /// Fully filled.
    Filled,
    /// Cancelled.
    Cancelled,
    /// Rejected by the venue.
    Rejected,
}

/// Uniform interface over the two venue transports.
///
/// The paper-trading wrapper decorates this trait: data methods delegate,
/// execution methods consult an in-memory fill simulator.
#[async_trait]
pub trait VenueConnector: Send + Sync {
    /// Venue this connector serves.
    fn venue(&self) -> Venue;

    /// Establishes transports and authenticates.
    async fn connect(&self) -> PlatformResult<()>;

    /// Closes transports with a normal close code.
    async fn disconnect(&self);

    /// Fetches one contract's book over REST and normalizes it.
    async fn fetch_order_book(&self, contract_id: &str) -> PlatformResult<NormalizedOrderBook>;

    /// Subscribes to streaming book updates for the given contracts.
    ///
    /// Updates and transport signals are delivered on `events`. Local book
    /// state for the contracts is owned by the connector and is destroyed
    /// on unsubscribe, sequence-gap resync, and disconnect.
    async fn subscribe_order_books(
        &self,
        contract_ids: &[String],
        events: mpsc::Sender<ConnectorEvent>,
    ) -> PlatformResult<()>;

    /// Current fee schedule.
    fn fee_schedule(&self) -> FeeSchedule;

    /// Current health view.
    fn health(&self) -> VenueHealthView;

    /// Submits an order. Detection never calls this path.
    async fn submit_order(&self, order: OrderRequest) -> PlatformResult<OrderAck>;

    /// Looks up the state of a previously submitted order.
    async fn order_state(&self, order_id: &str) -> PlatformResult<OrderState>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_fee_schedule_serde() {
        let fees = FeeSchedule {
            maker_pct: dec!(0),
            taker_pct: dec!(7),
            gas_estimate_usd: None,
            description: "taker 7%".into(),
        };
        let json = serde_json::to_string(&fees).unwrap();
        let back: FeeSchedule = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fees);
    }

    #[test]
    fn test_health_status_lowercase() {
        let json = serde_json::to_string(&HealthStatus::Disconnected).unwrap();
        assert_eq!(json, r#""disconnected""#);
    }

    #[test]
    fn test_order_state_snake_case() {
        let json = serde_json::to_string(&OrderState::PartiallyFilled).unwrap();
        assert_eq!(json, r#""partially_filled""#);
    }
}
