//! Polymarket CLOB venue connector.
//!
//! L2 credential derivation from an EOA key, unauthenticated book reads,
//! a market-channel WebSocket with snapshot-seeded L2 books, and a 30 s
//! staleness guard on everything emitted.

pub mod auth;
pub mod book;
pub mod client;
pub mod connector;
pub mod ws;

pub use auth::{derive_api_key, ApiCredentials, EoaSigner, L1Headers, L2Auth, L2Headers};
pub use book::{parse_decimal, BookSide, TokenBook};
pub use client::{ClobClient, ClobClientConfig};
pub use connector::{PolymarketConnector, PolymarketConnectorConfig};
pub use ws::{PolymarketWs, PolymarketWsConfig, StalePolicy};
