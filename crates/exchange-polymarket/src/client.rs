//! Polymarket CLOB REST client.
//!
//! Book reads are unauthenticated; order lookups use L2 HMAC headers.
//! Reads share a governor token bucket sized at 80% of the documented
//! 150 req/s limit.

use crate::auth::L2Auth;
use crate::book::parse_decimal;
use chrono::{TimeZone, Utc};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use pm_arb_core::{
    NormalizedOrderBook, OrderState, PlatformError, PlatformResult, PriceLevel, Venue,
};
use reqwest::Client;
use serde::Deserialize;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

type GovernorLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Configuration for the REST client.
#[derive(Debug, Clone)]
pub struct ClobClientConfig {
    /// CLOB base URL.
    pub base_url: String,
    /// Read quota, requests per second. 80% of the documented 150/s.
    pub read_rps: NonZeroU32,
    /// Per-call timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for ClobClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://clob.polymarket.com".to_string(),
            read_rps: nonzero!(120u32),
            timeout_secs: 10,
        }
    }
}

impl ClobClientConfig {
    /// Sets the base URL (used by tests against a mock server).
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Deserialize)]
struct RawBookResponse {
    #[serde(default)]
    bids: Vec<RawLevel>,
    #[serde(default)]
    asks: Vec<RawLevel>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawLevel {
    price: String,
    size: String,
}

#[derive(Debug, Deserialize)]
struct RawOrderStatus {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

// =============================================================================
// Client
// =============================================================================

/// Rate-limited CLOB REST client.
pub struct ClobClient {
    config: ClobClientConfig,
    http: Client,
    read_limiter: Arc<GovernorLimiter>,
}

impl std::fmt::Debug for ClobClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClobClient")
            .field("base_url", &self.config.base_url)
            .field("read_rps", &self.config.read_rps)
            .finish_non_exhaustive()
    }
}

impl ClobClient {
    /// Creates a client.
    ///
    /// # Errors
    ///
    /// `Network` when the HTTP client cannot be built.
    pub fn new(config: ClobClientConfig) -> PlatformResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PlatformError::Network(format!("failed to build HTTP client: {e}")))?;
        let read_limiter = Arc::new(RateLimiter::direct(Quota::per_second(config.read_rps)));
        Ok(Self {
            config,
            http,
            read_limiter,
        })
    }

    /// The underlying HTTP client, shared with credential derivation.
    #[must_use]
    pub fn http(&self) -> &Client {
        &self.http
    }

    /// The configured base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    /// Fetches and normalizes one token's book.
    ///
    /// # Errors
    ///
    /// Platform taxonomy; an error envelope in a 200 response maps to
    /// `InvalidRequest`, and a book failing validation to `Protocol`.
    pub async fn get_book(&self, token_id: &str) -> PlatformResult<NormalizedOrderBook> {
        self.read_limiter.until_ready().await;

        let url = format!("{}/book", self.config.base_url);
        debug!(%url, token_id, "GET");
        let response = self
            .http
            .get(&url)
            .query(&[("token_id", token_id)])
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Err(PlatformError::MarketNotFound {
                contract_id: token_id.to_string(),
            });
        }
        if status.as_u16() == 429 {
            let retry_after_secs = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(60);
            return Err(PlatformError::RateLimited { retry_after_secs });
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(PlatformError::Network(format!("HTTP {status}: {text}")));
        }

        let raw: RawBookResponse = response
            .json()
            .await
            .map_err(|e| PlatformError::Protocol(format!("malformed book: {e}")))?;
        if let Some(error) = raw.error {
            return Err(PlatformError::InvalidRequest(error));
        }

        let book = normalize_raw_book(token_id, &raw);
        book.validate()
            .map_err(|e| PlatformError::Protocol(format!("invalid book for {token_id}: {e}")))?;
        Ok(book)
    }

    /// Looks up an order's lifecycle state with L2 headers.
    ///
    /// # Errors
    ///
    /// Platform taxonomy; `NotConnected` when no credentials were derived.
    pub async fn order_state(
        &self,
        auth: Option<&L2Auth>,
        order_id: &str,
    ) -> PlatformResult<OrderState> {
        let auth = auth.ok_or(PlatformError::NotConnected)?;
        self.read_limiter.until_ready().await;

        let path = format!("/data/order/{order_id}");
        let headers = auth.headers("GET", &path, "")?;
        let url = format!("{}{}", self.config.base_url, path);

        let response = self
            .http
            .get(&url)
            .header("POLY_ADDRESS", &headers.address)
            .header("POLY_SIGNATURE", &headers.signature)
            .header("POLY_TIMESTAMP", &headers.timestamp)
            .header("POLY_API_KEY", &headers.api_key)
            .header("POLY_PASSPHRASE", &headers.passphrase)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            let text = response.text().await.unwrap_or_default();
            return Err(PlatformError::Unauthorized(text));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(PlatformError::Network(format!("HTTP {status}: {text}")));
        }

        let raw: RawOrderStatus = response
            .json()
            .await
            .map_err(|e| PlatformError::Protocol(format!("malformed order: {e}")))?;
        if let Some(error) = raw.error {
            return Err(PlatformError::InvalidRequest(error));
        }
        Ok(match raw.status.as_deref() {
            Some("LIVE") => OrderState::Resting,
            Some("MATCHED") => OrderState::Filled,
            Some("PARTIALLY_MATCHED") => OrderState::PartiallyFilled,
            Some("CANCELED" | "CANCELLED") => OrderState::Cancelled,
            _ => OrderState::Pending,
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> PlatformError {
    if err.is_timeout() {
        PlatformError::Timeout(err.to_string())
    } else {
        PlatformError::Network(err.to_string())
    }
}

fn normalize_raw_book(token_id: &str, raw: &RawBookResponse) -> NormalizedOrderBook {
    let mut bids: Vec<PriceLevel> = raw
        .bids
        .iter()
        .filter_map(|l| {
            let price = parse_decimal(&l.price)?;
            let size = parse_decimal(&l.size)?;
            (size > rust_decimal::Decimal::ZERO).then(|| PriceLevel::new(price, size))
        })
        .collect();
    bids.sort_by(|a, b| b.price.cmp(&a.price));

    let mut asks: Vec<PriceLevel> = raw
        .asks
        .iter()
        .filter_map(|l| {
            let price = parse_decimal(&l.price)?;
            let size = parse_decimal(&l.size)?;
            (size > rust_decimal::Decimal::ZERO).then(|| PriceLevel::new(price, size))
        })
        .collect();
    asks.sort_by(|a, b| a.price.cmp(&b.price));

    let observed_at = raw
        .timestamp
        .as_deref()
        .and_then(|t| t.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now);

    NormalizedOrderBook {
        venue: Venue::Polymarket,
        contract_id: token_id.to_string(),
        bids,
        asks,
        observed_at,
        sequence: None,
        health: pm_arb_core::BookHealth::Healthy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(base_url: &str) -> ClobClient {
        ClobClient::new(ClobClientConfig::default().with_base_url(base_url)).unwrap()
    }

    #[tokio::test]
    async fn test_get_book_normalizes_and_sorts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/book"))
            .and(query_param("token_id", "tok-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "bids": [
                    {"price": ".47", "size": "50"},
                    {"price": ".48", "size": "100"}
                ],
                "asks": [
                    {"price": ".53", "size": "20"},
                    {"price": ".52", "size": "80"}
                ],
                "timestamp": "1706745600000"
            })))
            .mount(&server)
            .await;

        let book = client_for(&server.uri()).get_book("tok-1").await.unwrap();
        assert_eq!(book.best_bid(), Some(dec!(0.48)));
        assert_eq!(book.best_ask(), Some(dec!(0.52)));
        assert!(book.validate().is_ok());
        assert_eq!(book.venue, Venue::Polymarket);
    }

    #[tokio::test]
    async fn test_zero_size_levels_dropped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/book"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "bids": [{"price": ".48", "size": "0"}],
                "asks": [{"price": ".52", "size": "80"}]
            })))
            .mount(&server)
            .await;

        let book = client_for(&server.uri()).get_book("tok-1").await.unwrap();
        assert!(book.bids.is_empty());
        assert_eq!(book.asks.len(), 1);
    }

    #[tokio::test]
    async fn test_error_envelope_maps_to_invalid_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/book"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "error": "invalid token id",
                "status": 400
            })))
            .mount(&server)
            .await;

        let err = client_for(&server.uri()).get_book("bad").await.unwrap_err();
        assert!(matches!(err, PlatformError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_not_found_maps() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = client_for(&server.uri())
            .get_book("missing")
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::MarketNotFound { .. }));
    }

    #[tokio::test]
    async fn test_rate_limit_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "12"))
            .mount(&server)
            .await;

        let err = client_for(&server.uri()).get_book("tok").await.unwrap_err();
        assert!(matches!(
            err,
            PlatformError::RateLimited {
                retry_after_secs: 12
            }
        ));
    }

    #[tokio::test]
    async fn test_order_state_requires_credentials() {
        let server = MockServer::start().await;
        let err = client_for(&server.uri())
            .order_state(None, "ord-1")
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::NotConnected));
    }
}
