//! `VenueConnector` implementation for Kalshi.
//!
//! Owns the REST client, the WS transport, and the subscription set. Local
//! book state lives inside the WS task and is destroyed on resync and
//! disconnect; this facade only routes and observes.

use crate::client::{KalshiClient, KalshiClientConfig};
use crate::ws::{KalshiWs, KalshiWsConfig};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use pm_arb_core::{
    ConnectorEvent, FeeSchedule, HealthStatus, NormalizedOrderBook, OrderAck, OrderRequest,
    OrderState, PlatformResult, Venue, VenueConnector, VenueHealthView,
};
use rust_decimal_macros::dec;
use std::collections::VecDeque;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::info;

/// Latency samples retained for the health view.
const LATENCY_WINDOW: usize = 64;

/// Combined configuration for the connector.
#[derive(Debug, Clone, Default)]
pub struct KalshiConnectorConfig {
    /// REST client settings.
    pub client: KalshiClientConfig,
    /// WS transport settings.
    pub ws: KalshiWsConfig,
}

impl KalshiConnectorConfig {
    /// Builds connector settings from the engine-level Kalshi section.
    #[must_use]
    pub fn from_engine(config: &pm_arb_core::config::KalshiConfig) -> Self {
        let mut out = Self::default();
        out.client.base_url = config.base_url.clone();
        out.client.auth_config = crate::auth::KalshiAuthConfig::default()
            .with_env_vars(config.api_key_env.clone(), config.private_key_env.clone());
        out.ws.ws_url = config.ws_url.clone();
        out
    }
}

#[derive(Debug)]
struct HealthInner {
    status: HealthStatus,
    last_heartbeat: Option<DateTime<Utc>>,
    latencies_ms: VecDeque<u64>,
}

impl HealthInner {
    fn record_success(&mut self, latency_ms: u64) {
        self.status = HealthStatus::Healthy;
        self.last_heartbeat = Some(Utc::now());
        if self.latencies_ms.len() == LATENCY_WINDOW {
            self.latencies_ms.pop_front();
        }
        self.latencies_ms.push_back(latency_ms);
    }

    fn p50(&self) -> Option<u64> {
        if self.latencies_ms.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = self.latencies_ms.iter().copied().collect();
        sorted.sort_unstable();
        Some(sorted[sorted.len() / 2])
    }
}

/// Kalshi venue connector.
pub struct KalshiConnector {
    config: KalshiConnectorConfig,
    client: KalshiClient,
    ws: Mutex<Option<KalshiWs>>,
    health: Mutex<HealthInner>,
}

impl KalshiConnector {
    /// Creates a connector, loading credentials from the environment.
    ///
    /// # Errors
    ///
    /// `Unauthorized` when credentials are missing or unparsable.
    pub fn new(config: KalshiConnectorConfig) -> PlatformResult<Self> {
        let client = KalshiClient::new(config.client.clone())?;
        Ok(Self::with_client(config, client))
    }

    /// Creates a connector around an existing client (used by tests).
    #[must_use]
    pub fn with_client(config: KalshiConnectorConfig, client: KalshiClient) -> Self {
        Self {
            config,
            client,
            ws: Mutex::new(None),
            health: Mutex::new(HealthInner {
                status: HealthStatus::Disconnected,
                last_heartbeat: None,
                latencies_ms: VecDeque::new(),
            }),
        }
    }
}

#[async_trait]
impl VenueConnector for KalshiConnector {
    fn venue(&self) -> Venue {
        Venue::Kalshi
    }

    async fn connect(&self) -> PlatformResult<()> {
        // Prove reachability with a cheap read before declaring healthy.
        let started = Instant::now();
        self.client.exchange_status().await?;
        self.health
            .lock()
            .record_success(started.elapsed().as_millis() as u64);
        info!(venue = %Venue::Kalshi, "connected");
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(ws) = self.ws.lock().take() {
            ws.shutdown();
        }
        self.health.lock().status = HealthStatus::Disconnected;
        info!(venue = %Venue::Kalshi, "disconnected");
    }

    async fn fetch_order_book(&self, contract_id: &str) -> PlatformResult<NormalizedOrderBook> {
        let started = Instant::now();
        let book = self.client.get_orderbook(contract_id).await?;
        self.health
            .lock()
            .record_success(started.elapsed().as_millis() as u64);
        Ok(book)
    }

    async fn subscribe_order_books(
        &self,
        contract_ids: &[String],
        events: mpsc::Sender<ConnectorEvent>,
    ) -> PlatformResult<()> {
        let mut guard = self.ws.lock();
        if let Some(old) = guard.take() {
            old.shutdown();
        }
        *guard = Some(KalshiWs::spawn(
            self.config.ws.clone(),
            self.client.auth(),
            contract_ids.to_vec(),
            events,
        ));
        Ok(())
    }

    fn fee_schedule(&self) -> FeeSchedule {
        FeeSchedule {
            maker_pct: dec!(0),
            taker_pct: dec!(0.7),
            gas_estimate_usd: None,
            description: "Kalshi taker fee, 0.7% of notional".to_string(),
        }
    }

    fn health(&self) -> VenueHealthView {
        let inner = self.health.lock();
        VenueHealthView {
            venue: Venue::Kalshi,
            status: inner.status,
            last_heartbeat: inner.last_heartbeat,
            latency_ms_p50: inner.p50(),
        }
    }

    async fn submit_order(&self, order: OrderRequest) -> PlatformResult<OrderAck> {
        self.client.submit_order(&order).await
    }

    async fn order_state(&self, order_id: &str) -> PlatformResult<OrderState> {
        self.client.order_state(order_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::KalshiAuth;
    use rsa::RsaPrivateKey;
    use std::sync::Arc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn connector_for(base_url: &str) -> KalshiConnector {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let pem = rsa::pkcs8::EncodePrivateKey::to_pkcs8_pem(&key, rsa::pkcs8::LineEnding::LF)
            .unwrap()
            .to_string();
        let auth = Arc::new(KalshiAuth::new("k", &pem).unwrap());
        let client_config = KalshiClientConfig::default().with_base_url(base_url);
        let client = KalshiClient::with_auth(client_config.clone(), auth).unwrap();
        KalshiConnector::with_client(
            KalshiConnectorConfig {
                client: client_config,
                ws: KalshiWsConfig::default(),
            },
            client,
        )
    }

    #[tokio::test]
    async fn test_fetch_updates_health() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/markets/KXT/orderbook"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "orderbook": {"yes": [[40, 100]], "no": [[58, 80]]}
            })))
            .mount(&server)
            .await;

        let connector = connector_for(&server.uri());
        assert_eq!(connector.health().status, HealthStatus::Disconnected);

        connector.fetch_order_book("KXT").await.unwrap();
        let health = connector.health();
        assert_eq!(health.status, HealthStatus::Healthy);
        assert!(health.last_heartbeat.is_some());
        assert!(health.latency_ms_p50.is_some());
    }

    #[tokio::test]
    async fn test_fee_schedule() {
        let server = MockServer::start().await;
        let connector = connector_for(&server.uri());
        let fees = connector.fee_schedule();
        assert_eq!(fees.taker_pct, dec!(0.7));
        assert!(fees.gas_estimate_usd.is_none());
    }
}
