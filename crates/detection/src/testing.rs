//! Shared test support for the detection crate.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use pm_arb_core::{
    ConnectorEvent, ContractPair, FeeSchedule, HealthStatus, NormalizedOrderBook, OrderAck,
    OrderRequest, OrderState, PairRegistry, PlatformError, PlatformResult, PriceLevel, Venue,
    VenueConnector, VenueHealthView,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Registry with the single pair used across detection tests.
pub fn registry_with_one_pair() -> PairRegistry {
    PairRegistry::new(vec![ContractPair {
        kalshi_ticker: "KXT".into(),
        polymarket_token_id: "tok-yes".into(),
        polymarket_no_token_id: "tok-no".into(),
        description: "test pair".into(),
        verified_at: Utc::now(),
        primary_leg: Venue::Kalshi,
    }])
    .unwrap()
}

/// Scriptable connector double.
pub struct MockConnector {
    venue: Venue,
    books: Mutex<HashMap<String, NormalizedOrderBook>>,
    fees: Mutex<FeeSchedule>,
    fail: AtomicBool,
    fetch_calls: AtomicU32,
}

impl MockConnector {
    pub fn new(venue: Venue) -> Arc<Self> {
        Arc::new(Self {
            venue,
            books: Mutex::new(HashMap::new()),
            fees: Mutex::new(FeeSchedule {
                maker_pct: dec!(0),
                taker_pct: dec!(0),
                gas_estimate_usd: None,
                description: "mock".into(),
            }),
            fail: AtomicBool::new(false),
            fetch_calls: AtomicU32::new(0),
        })
    }

    pub fn set_book(&self, contract_id: &str, bid: Decimal, ask: Decimal, size: Decimal) {
        self.books.lock().insert(
            contract_id.to_string(),
            NormalizedOrderBook::new(
                self.venue,
                contract_id,
                vec![PriceLevel::new(bid, size)],
                vec![PriceLevel::new(ask, size)],
            ),
        );
    }

    pub fn set_ask_only(&self, contract_id: &str, ask: Decimal, size: Decimal) {
        self.books.lock().insert(
            contract_id.to_string(),
            NormalizedOrderBook::new(
                self.venue,
                contract_id,
                vec![],
                vec![PriceLevel::new(ask, size)],
            ),
        );
    }

    pub fn set_fees(&self, taker_pct: Decimal, gas_estimate_usd: Option<Decimal>) {
        let mut fees = self.fees.lock();
        fees.taker_pct = taker_pct;
        fees.gas_estimate_usd = gas_estimate_usd;
    }

    pub fn fail_fetches(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VenueConnector for MockConnector {
    fn venue(&self) -> Venue {
        self.venue
    }

    async fn connect(&self) -> PlatformResult<()> {
        Ok(())
    }

    async fn disconnect(&self) {}

    async fn fetch_order_book(&self, contract_id: &str) -> PlatformResult<NormalizedOrderBook> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(PlatformError::Network("mock down".into()));
        }
        self.books
            .lock()
            .get(contract_id)
            .cloned()
            .ok_or_else(|| PlatformError::MarketNotFound {
                contract_id: contract_id.to_string(),
            })
    }

    async fn subscribe_order_books(
        &self,
        _contract_ids: &[String],
        _events: mpsc::Sender<ConnectorEvent>,
    ) -> PlatformResult<()> {
        Ok(())
    }

    fn fee_schedule(&self) -> FeeSchedule {
        self.fees.lock().clone()
    }

    fn health(&self) -> VenueHealthView {
        VenueHealthView {
            venue: self.venue,
            status: HealthStatus::Healthy,
            last_heartbeat: None,
            latency_ms_p50: None,
        }
    }

    async fn submit_order(&self, _order: OrderRequest) -> PlatformResult<OrderAck> {
        Err(PlatformError::NotImplemented("mock"))
    }

    async fn order_state(&self, _order_id: &str) -> PlatformResult<OrderState> {
        Err(PlatformError::NotImplemented("mock"))
    }
}
