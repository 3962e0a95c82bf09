//! Core types, event bus, and venue connector contract shared by every
//! crate in the arbitrage engine.

pub mod book;
pub mod bus;
pub mod config;
pub mod connector;
pub mod decimal;
pub mod error;
pub mod events;
pub mod pairs;
pub mod retry;
pub mod venue;

pub use book::{BookHealth, BookValidationError, NormalizedOrderBook, PriceLevel};
pub use bus::EventBus;
pub use config::{ConfigError, EngineConfig};
pub use connector::{
    ConnectorEvent, FeeSchedule, HealthStatus, OrderAck, OrderRequest, OrderSide, OrderState,
    TransportSignal, VenueConnector, VenueHealthView,
};
pub use error::{ErrorCode, PlatformError, PlatformResult};
pub use events::{CorrelationId, EventEnvelope};
pub use pairs::{ContractPair, PairConfigError, PairRegistry};
pub use retry::RetryPolicy;
pub use venue::Venue;
