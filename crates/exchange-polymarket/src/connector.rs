//! `VenueConnector` implementation for Polymarket.
//!
//! `connect` derives L2 API credentials from the EOA key and rejects an
//! empty triple outright. Book reads stay unauthenticated; order lookups
//! use the derived credentials. Order submission is owned by the execution
//! service, which signs CLOB orders itself; this connector reports it as
//! not implemented.

use crate::auth::{derive_api_key, EoaSigner, L2Auth};
use crate::client::{ClobClient, ClobClientConfig};
use crate::ws::{PolymarketWs, PolymarketWsConfig};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use pm_arb_core::{
    ConnectorEvent, FeeSchedule, HealthStatus, NormalizedOrderBook, OrderAck, OrderRequest,
    OrderState, PlatformError, PlatformResult, Venue, VenueConnector, VenueHealthView,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::VecDeque;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::info;

/// Latency samples retained for the health view.
const LATENCY_WINDOW: usize = 64;

/// Combined configuration for the connector.
#[derive(Debug, Clone)]
pub struct PolymarketConnectorConfig {
    /// REST client settings.
    pub client: ClobClientConfig,
    /// WS transport settings.
    pub ws: PolymarketWsConfig,
    /// Environment variable holding the EOA private key.
    pub private_key_env: String,
    /// Estimated gas per trade, USD.
    pub gas_estimate_usd: Decimal,
}

impl Default for PolymarketConnectorConfig {
    fn default() -> Self {
        Self {
            client: ClobClientConfig::default(),
            ws: PolymarketWsConfig::default(),
            private_key_env: "POLYMARKET_PRIVATE_KEY".to_string(),
            gas_estimate_usd: dec!(0.01),
        }
    }
}

impl PolymarketConnectorConfig {
    /// Builds connector settings from the engine-level sections.
    #[must_use]
    pub fn from_engine(
        config: &pm_arb_core::config::PolymarketConfig,
        detection: &pm_arb_core::config::DetectionConfig,
    ) -> Self {
        let mut out = Self::default();
        out.client.base_url = config.base_url.clone();
        out.ws.ws_url = config.ws_url.clone();
        out.private_key_env = config.private_key_env.clone();
        out.gas_estimate_usd = detection.gas_estimate_usd;
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

/// Polymarket venue connector.
pub struct PolymarketConnector {
    config: PolymarketConnectorConfig,
    client: ClobClient,
    signer: EoaSigner,
    l2: Mutex<Option<L2Auth>>,
    ws: Mutex<Option<PolymarketWs>>,
    health: Mutex<HealthInner>,
}

impl PolymarketConnector {
    /// Creates a connector, loading the EOA key from the environment.
    ///
    /// # Errors
    ///
    /// `Unauthorized` on missing or malformed key material; `Network` when
    /// the HTTP client cannot be built.
    pub fn new(config: PolymarketConnectorConfig) -> PlatformResult<Self> {
        let signer = EoaSigner::from_env(&config.private_key_env)?;
        let client = ClobClient::new(config.client.clone())?;
        Ok(Self::with_parts(config, client, signer))
    }

    /// Creates a connector from pre-built parts (used by tests).
    #[must_use]
    pub fn with_parts(
        config: PolymarketConnectorConfig,
        client: ClobClient,
        signer: EoaSigner,
    ) -> Self {
        Self {
            config,
            client,
            signer,
            l2: Mutex::new(None),
            ws: Mutex::new(None),
            health: Mutex::new(HealthInner {
                status: HealthStatus::Disconnected,
                last_heartbeat: None,
                latencies_ms: VecDeque::new(),
            }),
        }
    }

    /// True once L2 credentials have been derived.
    #[must_use]
    pub fn has_credentials(&self) -> bool {
        self.l2.lock().is_some()
    }
}

#[async_trait]
impl VenueConnector for PolymarketConnector {
    fn venue(&self) -> Venue {
        Venue::Polymarket
    }

    async fn connect(&self) -> PlatformResult<()> {
        let started = Instant::now();
        let creds = derive_api_key(
            self.client.http(),
            self.client.base_url(),
            &self.signer,
        )
        .await?;
        let auth = L2Auth::new(creds, self.signer.address().to_string())?;
        *self.l2.lock() = Some(auth);
        self.health
            .lock()
            .record_success(started.elapsed().as_millis() as u64);
        info!(venue = %Venue::Polymarket, address = %self.signer.address(), "connected");
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(ws) = self.ws.lock().take() {
            ws.shutdown();
        }
        self.health.lock().status = HealthStatus::Disconnected;
        info!(venue = %Venue::Polymarket, "disconnected");
    }

    async fn fetch_order_book(&self, contract_id: &str) -> PlatformResult<NormalizedOrderBook> {
        let started = Instant::now();
        let book = self.client.get_book(contract_id).await?;
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
        *guard = Some(PolymarketWs::spawn(
            self.config.ws.clone(),
            contract_ids.to_vec(),
            events,
        ));
        Ok(())
    }

    fn fee_schedule(&self) -> FeeSchedule {
        FeeSchedule {
            maker_pct: dec!(0),
            taker_pct: dec!(2),
            gas_estimate_usd: Some(self.config.gas_estimate_usd),
            description: "Polymarket taker fee, 2% of notional, plus Polygon gas".to_string(),
        }
    }

    fn health(&self) -> VenueHealthView {
        let inner = self.health.lock();
        VenueHealthView {
            venue: Venue::Polymarket,
            status: inner.status,
            last_heartbeat: inner.last_heartbeat,
            latency_ms_p50: inner.p50(),
        }
    }

    async fn submit_order(&self, _order: OrderRequest) -> PlatformResult<OrderAck> {
        // CLOB orders carry their own EIP-712 signatures; the execution
        // service owns that path.
        Err(PlatformError::NotImplemented(
            "order submission is owned by the execution service",
        ))
    }

    async fn order_state(&self, order_id: &str) -> PlatformResult<OrderState> {
        let auth = self.l2.lock().clone();
        self.client.order_state(auth.as_ref(), order_id).await
    }
}
