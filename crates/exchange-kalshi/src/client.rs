//! Kalshi REST client.
//!
//! Typed access to the order-book and portfolio endpoints with RSA-PSS
//! signed headers and governor token buckets. Read and write quotas are
//! sized at 80% of the venue's documented limits; callers acquire a token
//! before every request.

use crate::auth::{KalshiAuth, KalshiAuthConfig};
use crate::ladder::normalize_levels;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use pm_arb_core::{
    NormalizedOrderBook, OrderAck, OrderRequest, OrderSide, OrderState, PlatformError,
    PlatformResult,
};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

type GovernorLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Configuration for the REST client.
#[derive(Debug, Clone)]
pub struct KalshiClientConfig {
    /// REST base URL including `/trade-api/v2`.
    pub base_url: String,
    /// Authentication environment configuration.
    pub auth_config: KalshiAuthConfig,
    /// Read quota, requests per second. 80% of the documented 20/s.
    pub read_rps: NonZeroU32,
    /// Write quota, requests per second. 80% of the documented 10/s.
    pub write_rps: NonZeroU32,
    /// Per-call timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for KalshiClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.elections.kalshi.com/trade-api/v2".to_string(),
            auth_config: KalshiAuthConfig::default(),
            read_rps: nonzero!(16u32),
            write_rps: nonzero!(8u32),
            timeout_secs: 10,
        }
    }
}

impl KalshiClientConfig {
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
struct RawOrderbookResponse {
    orderbook: RawOrderbook,
}

#[derive(Debug, Deserialize)]
struct RawOrderbook {
    #[serde(default)]
    yes: Vec<[i64; 2]>,
    #[serde(default)]
    no: Vec<[i64; 2]>,
}

#[derive(Debug, Serialize)]
struct RawOrderRequest<'a> {
    ticker: &'a str,
    side: &'static str,
    action: &'static str,
    #[serde(rename = "type")]
    order_type: &'static str,
    count: u64,
    yes_price: Option<u32>,
    no_price: Option<u32>,
    client_order_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct RawOrderResponse {
    order: RawOrder,
}

#[derive(Debug, Deserialize)]
struct RawOrder {
    order_id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    created_time: Option<String>,
}

// =============================================================================
// Client
// =============================================================================

/// Rate-limited, authenticated Kalshi REST client.
pub struct KalshiClient {
    config: KalshiClientConfig,
    http: Client,
    auth: Arc<KalshiAuth>,
    read_limiter: Arc<GovernorLimiter>,
    write_limiter: Arc<GovernorLimiter>,
}

impl std::fmt::Debug for KalshiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KalshiClient")
            .field("base_url", &self.config.base_url)
            .field("read_rps", &self.config.read_rps)
            .field("write_rps", &self.config.write_rps)
            .finish_non_exhaustive()
    }
}

impl KalshiClient {
    /// Creates a client, loading credentials from the environment.
    ///
    /// # Errors
    ///
    /// `Unauthorized` when credentials are missing or unparsable; `Network`
    /// when the HTTP client cannot be built.
    pub fn new(config: KalshiClientConfig) -> PlatformResult<Self> {
        let auth = Arc::new(KalshiAuth::from_env(&config.auth_config)?);
        Self::with_auth(config, auth)
    }

    /// Creates a client around an existing authenticator.
    ///
    /// # Errors
    ///
    /// `Network` when the HTTP client cannot be built.
    pub fn with_auth(config: KalshiClientConfig, auth: Arc<KalshiAuth>) -> PlatformResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PlatformError::Network(format!("failed to build HTTP client: {e}")))?;

        let read_limiter = Arc::new(RateLimiter::direct(Quota::per_second(config.read_rps)));
        let write_limiter = Arc::new(RateLimiter::direct(Quota::per_second(config.write_rps)));

        Ok(Self {
            config,
            http,
            auth,
            read_limiter,
            write_limiter,
        })
    }

    /// The authenticator shared with the WS transport.
    #[must_use]
    pub fn auth(&self) -> Arc<KalshiAuth> {
        Arc::clone(&self.auth)
    }

    /// The configured base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    /// Probes venue reachability via the exchange status endpoint.
    ///
    /// # Errors
    ///
    /// Platform taxonomy as for reads.
    pub async fn exchange_status(&self) -> PlatformResult<()> {
        let _: serde_json::Value = self.get("/exchange/status").await?;
        Ok(())
    }

    /// Fetches and normalizes one contract's order book.
    ///
    /// # Errors
    ///
    /// Maps transport and API failures into the platform taxonomy; a book
    /// failing canonical validation is a `Protocol` error.
    pub async fn get_orderbook(&self, ticker: &str) -> PlatformResult<NormalizedOrderBook> {
        let ticker = validate_ticker(ticker)?;
        let path = format!("/markets/{ticker}/orderbook");
        let raw: RawOrderbookResponse = self.get(&path).await?;

        let yes: Vec<(u32, Decimal)> = raw
            .orderbook
            .yes
            .iter()
            .map(|[p, q]| (*p as u32, Decimal::from(*q)))
            .collect();
        let no: Vec<(u32, Decimal)> = raw
            .orderbook
            .no
            .iter()
            .map(|[p, q]| (*p as u32, Decimal::from(*q)))
            .collect();

        let book = normalize_levels(ticker, &yes, &no);
        book.validate()
            .map_err(|e| PlatformError::Protocol(format!("invalid book for {ticker}: {e}")))?;
        Ok(book)
    }

    /// Submits a limit order.
    ///
    /// # Errors
    ///
    /// Platform taxonomy as for reads; write-limited.
    pub async fn submit_order(&self, order: &OrderRequest) -> PlatformResult<OrderAck> {
        let ticker = validate_ticker(&order.contract_id)?;
        let cents = pm_arb_core::decimal::to_cents(order.limit_price);
        let (side, yes_price, no_price) = match order.side {
            OrderSide::Yes => ("yes", Some(cents), None),
            OrderSide::No => ("no", None, Some(cents)),
        };
        let body = RawOrderRequest {
            ticker,
            side,
            action: "buy",
            order_type: "limit",
            count: rust_decimal::prelude::ToPrimitive::to_u64(&order.size.trunc())
                .ok_or_else(|| PlatformError::InvalidRequest("order size out of range".into()))?,
            yes_price,
            no_price,
            client_order_id: &order.client_order_id,
        };
        let raw: RawOrderResponse = self.post("/portfolio/orders", &body).await?;
        let accepted_at = raw
            .order
            .created_time
            .as_deref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&chrono::Utc))
            .unwrap_or_else(chrono::Utc::now);
        Ok(OrderAck {
            order_id: raw.order.order_id,
            accepted_at,
        })
    }

    /// Looks up the state of a previously submitted order.
    ///
    /// # Errors
    ///
    /// Platform taxonomy as for reads.
    pub async fn order_state(&self, order_id: &str) -> PlatformResult<OrderState> {
        let order_id = validate_identifier(order_id)?;
        let raw: RawOrderResponse = self.get(&format!("/portfolio/orders/{order_id}")).await?;
        Ok(match raw.order.status.as_deref() {
            Some("resting") => OrderState::Resting,
            Some("filled") => OrderState::Filled,
            Some("partial_filled") => OrderState::PartiallyFilled,
            Some("cancelled") => OrderState::Cancelled,
            Some("rejected") => OrderState::Rejected,
            _ => OrderState::Pending,
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> PlatformResult<T> {
        self.read_limiter.until_ready().await;

        let url = format!("{}{}", self.config.base_url, path);
        let signed_path = format!("/trade-api/v2{path}");
        let headers = self.auth.sign_request("GET", &signed_path)?;
        debug!(%url, "GET");

        let mut request = self.http.get(&url).header("Accept", "application/json");
        for (name, value) in headers.as_tuples() {
            request = request.header(name, value);
        }
        let response = request.send().await.map_err(map_reqwest_error)?;
        handle_response(response).await
    }

    async fn post<T: serde::de::DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> PlatformResult<T> {
        self.write_limiter.until_ready().await;

        let url = format!("{}{}", self.config.base_url, path);
        let signed_path = format!("/trade-api/v2{path}");
        let headers = self.auth.sign_request("POST", &signed_path)?;
        debug!(%url, "POST");

        let mut request = self
            .http
            .post(&url)
            .header("Accept", "application/json")
            .json(body);
        for (name, value) in headers.as_tuples() {
            request = request.header(name, value);
        }
        let response = request.send().await.map_err(map_reqwest_error)?;
        handle_response(response).await
    }
}

fn map_reqwest_error(err: reqwest::Error) -> PlatformError {
    if err.is_timeout() {
        PlatformError::Timeout(err.to_string())
    } else {
        PlatformError::Network(err.to_string())
    }
}

async fn handle_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> PlatformResult<T> {
    let status = response.status();
    match status.as_u16() {
        200..=299 => response
            .json()
            .await
            .map_err(|e| PlatformError::Protocol(format!("malformed response: {e}"))),
        401 | 403 => {
            let text = response.text().await.unwrap_or_default();
            Err(PlatformError::Unauthorized(text))
        }
        404 => Err(PlatformError::MarketNotFound {
            contract_id: response.url().path().to_string(),
        }),
        429 => {
            let retry_after_secs = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(60);
            Err(PlatformError::RateLimited { retry_after_secs })
        }
        400..=499 => {
            let text = response.text().await.unwrap_or_default();
            Err(PlatformError::InvalidRequest(text))
        }
        _ => {
            let text = response.text().await.unwrap_or_default();
            Err(PlatformError::Network(format!("HTTP {status}: {text}")))
        }
    }
}

/// Rejects tickers that could escape the URL path.
fn validate_ticker(ticker: &str) -> PlatformResult<&str> {
    if ticker.is_empty() || ticker.len() > 64 {
        return Err(PlatformError::InvalidRequest(format!(
            "invalid ticker length: {}",
            ticker.len()
        )));
    }
    if !ticker
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(PlatformError::InvalidRequest(format!(
            "invalid ticker characters: {ticker}"
        )));
    }
    Ok(ticker)
}

fn validate_identifier(id: &str) -> PlatformResult<&str> {
    if id.is_empty() || id.len() > 128 {
        return Err(PlatformError::InvalidRequest(format!(
            "invalid identifier length: {}",
            id.len()
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(PlatformError::InvalidRequest(format!(
            "invalid identifier characters: {id}"
        )));
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::RsaPrivateKey;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client(base_url: &str) -> KalshiClient {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let pem = rsa::pkcs8::EncodePrivateKey::to_pkcs8_pem(&key, rsa::pkcs8::LineEnding::LF)
            .unwrap()
            .to_string();
        let auth = Arc::new(KalshiAuth::new("test-key", &pem).unwrap());
        let config = KalshiClientConfig::default().with_base_url(base_url);
        KalshiClient::with_auth(config, auth).unwrap()
    }

    // ==================== Validation Tests ====================

    #[test]
    fn test_ticker_validation() {
        assert!(validate_ticker("KXBTC-26FEB02-B100000").is_ok());
        assert!(validate_ticker("").is_err());
        assert!(validate_ticker("../portfolio").is_err());
        assert!(validate_ticker("a/b").is_err());
        assert!(validate_ticker(&"X".repeat(65)).is_err());
    }

    // ==================== Orderbook Tests ====================

    #[tokio::test]
    async fn test_get_orderbook_normalizes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/markets/KXT/orderbook"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "orderbook": {
                    "yes": [[40, 100], [39, 50]],
                    "no": [[58, 80], [57, 20]]
                }
            })))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let book = client.get_orderbook("KXT").await.unwrap();

        assert_eq!(book.best_bid(), Some(dec!(0.40)));
        assert_eq!(book.best_ask(), Some(dec!(0.42)));
        assert_eq!(book.best_ask_size(), Some(dec!(80)));
        assert!(book.validate().is_ok());
    }

    #[tokio::test]
    async fn test_get_orderbook_empty_sides() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/markets/KXT/orderbook"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "orderbook": {}
            })))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let book = client.get_orderbook("KXT").await.unwrap();
        assert!(book.bids.is_empty());
        assert!(book.asks.is_empty());
    }

    #[tokio::test]
    async fn test_not_found_maps_to_market_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let err = client.get_orderbook("MISSING").await.unwrap_err();
        assert!(matches!(err, PlatformError::MarketNotFound { .. }));
    }

    #[tokio::test]
    async fn test_rate_limit_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7"))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let err = client.get_orderbook("KXT").await.unwrap_err();
        assert!(matches!(
            err,
            PlatformError::RateLimited {
                retry_after_secs: 7
            }
        ));
    }

    #[tokio::test]
    async fn test_unauthorized_maps() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid signature"))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let err = client.get_orderbook("KXT").await.unwrap_err();
        assert!(matches!(err, PlatformError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_signed_headers_present() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(wiremock::matchers::header_exists("KALSHI-ACCESS-KEY"))
            .and(wiremock::matchers::header_exists("KALSHI-ACCESS-SIGNATURE"))
            .and(wiremock::matchers::header_exists("KALSHI-ACCESS-TIMESTAMP"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "orderbook": {"yes": [], "no": []}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        client.get_orderbook("KXT").await.unwrap();
    }

    // ==================== Order Tests ====================

    #[tokio::test]
    async fn test_submit_order_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/portfolio/orders"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "order": {
                    "order_id": "ord-1",
                    "status": "resting",
                    "created_time": "2026-02-01T12:00:00Z"
                }
            })))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let ack = client
            .submit_order(&OrderRequest {
                contract_id: "KXT".into(),
                side: OrderSide::Yes,
                limit_price: dec!(0.42),
                size: dec!(10),
                client_order_id: "c-1".into(),
            })
            .await
            .unwrap();
        assert_eq!(ack.order_id, "ord-1");
    }

    #[tokio::test]
    async fn test_order_state_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/portfolio/orders/ord-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "order": {"order_id": "ord-1", "status": "filled"}
            })))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let state = client.order_state("ord-1").await.unwrap();
        assert_eq!(state, OrderState::Filled);
    }
}
