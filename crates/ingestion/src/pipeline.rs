//! Ingestion pipeline.
//!
//! Routes streaming and polled order books through persistence and the
//! event bus, keeps per-venue health current, and drives the degradation
//! protocol from transport signals. Per-contract errors never kill a
//! venue sweep; per-venue errors never touch the other venue. Only the
//! ten-consecutive-persistence-failures rule escalates to a critical
//! system-health event (code 4005).

use crate::degradation::{DegradationProtocol, DegradationReason};
use crate::health::HealthTracker;
use chrono::Utc;
use parking_lot::Mutex;
use pm_arb_core::events::names;
use pm_arb_core::{
    BookHealth, ConnectorEvent, CorrelationId, ErrorCode, EventBus, EventEnvelope,
    NormalizedOrderBook, PairRegistry, TransportSignal, Venue, VenueConnector,
};
use pm_arb_data::PersistenceSink;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Pipeline policy knobs.
#[derive(Debug, Clone)]
pub struct IngestionConfig {
    /// Consecutive persistence failures before the critical escalation.
    pub failure_streak_limit: u32,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            failure_streak_limit: 10,
        }
    }
}

/// Routes venue data into persistence, events, and health.
pub struct IngestionPipeline {
    connectors: HashMap<Venue, Arc<dyn VenueConnector>>,
    sink: Arc<dyn PersistenceSink>,
    bus: EventBus,
    health: Arc<HealthTracker>,
    degradation: Arc<DegradationProtocol>,
    registry: Arc<PairRegistry>,
    config: IngestionConfig,
    write_failures: Mutex<u32>,
}

impl IngestionPipeline {
    /// Wires the pipeline to its collaborators.
    #[must_use]
    pub fn new(
        connectors: HashMap<Venue, Arc<dyn VenueConnector>>,
        sink: Arc<dyn PersistenceSink>,
        bus: EventBus,
        health: Arc<HealthTracker>,
        degradation: Arc<DegradationProtocol>,
        registry: Arc<PairRegistry>,
        config: IngestionConfig,
    ) -> Self {
        Self {
            connectors,
            sink,
            bus,
            health,
            degradation,
            registry,
            config,
            write_failures: Mutex::new(0),
        }
    }

    /// The connector serving a venue.
    #[must_use]
    pub fn connector(&self, venue: Venue) -> Option<Arc<dyn VenueConnector>> {
        self.connectors.get(&venue).cloned()
    }

    /// Spawns the task draining connector events from `rx`.
    ///
    /// Install the paired sender on each connector via
    /// `subscribe_order_books`.
    pub fn spawn_ws_intake(
        self: &Arc<Self>,
        mut rx: mpsc::Receiver<ConnectorEvent>,
    ) -> JoinHandle<()> {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                pipeline.handle_connector_event(event).await;
            }
            info!("connector event channel closed, ws intake stopping");
        })
    }

    /// Handles one connector event. Failures are logged with a correlation
    /// id and never stop the stream.
    pub async fn handle_connector_event(&self, event: ConnectorEvent) {
        let correlation = CorrelationId::new();
        match event {
            ConnectorEvent::Book(book) => {
                let latency_ms =
                    u64::try_from(book.age_at(Utc::now()).num_milliseconds().max(0)).unwrap_or(0);
                let venue = book.venue;
                if self.persist_and_publish(book, correlation).await {
                    self.health.record_success(venue, latency_ms);
                }
            }
            ConnectorEvent::Stale {
                venue,
                contract_id,
                age_secs,
            } => {
                warn!(
                    venue = %venue,
                    contract_id = %contract_id,
                    age_secs,
                    correlation_id = %correlation,
                    "stale data discarded"
                );
                self.bus.publish(
                    EventEnvelope::new(
                        names::DATA_STALE,
                        "ingestion",
                        serde_json::json!({
                            "platform": venue.as_str(),
                            "contract_id": contract_id,
                            "age_secs": age_secs,
                        }),
                    )
                    .with_correlation(correlation),
                );
            }
            ConnectorEvent::Transport { venue, signal } => {
                self.handle_transport_signal(venue, signal);
            }
        }
    }

    fn handle_transport_signal(&self, venue: Venue, signal: TransportSignal) {
        match signal {
            TransportSignal::Connected => {
                if self.degradation.deactivate(venue).is_some() {
                    info!(venue = %venue, "transport recovered, degradation lifted");
                }
            }
            TransportSignal::Disconnected { reason } => {
                warn!(venue = %venue, reason = %reason, "transport lost");
                self.health.record_failure(venue);
                self.degradation.activate(
                    venue,
                    DegradationReason::WebsocketDisconnected,
                    self.health.view(venue).last_heartbeat,
                );
            }
            TransportSignal::AuthFailed { reason } => {
                error!(venue = %venue, reason = %reason, "authentication failed");
                self.health.record_failure(venue);
                self.degradation
                    .activate(venue, DegradationReason::AuthFailure, None);
            }
            TransportSignal::ResyncStorm { resyncs } => {
                warn!(venue = %venue, resyncs, "protocol resync storm");
                self.degradation.activate(
                    venue,
                    DegradationReason::ProtocolResync,
                    self.health.view(venue).last_heartbeat,
                );
            }
            TransportSignal::StaleData { discards } => {
                warn!(venue = %venue, discards, "repeated stale data");
                self.degradation.activate(
                    venue,
                    DegradationReason::DataStale,
                    self.health.view(venue).last_heartbeat,
                );
            }
        }
    }

    /// Periodic REST sweep over every non-degraded venue.
    ///
    /// Driven by an external scheduler. Degraded venues are served by
    /// [`IngestionPipeline::poll_degraded_venues`] instead.
    pub async fn ingest_current_order_books(&self) {
        let correlation = CorrelationId::new();
        for venue in Venue::ALL {
            if self.degradation.is_degraded(venue) {
                debug!(venue = %venue, "skipping degraded venue in primary sweep");
                continue;
            }
            self.sweep_venue(venue, BookHealth::Healthy, correlation)
                .await;
        }
    }

    /// REST polling sweep for currently degraded venues.
    ///
    /// Books are tagged degraded and each swept venue's polling-cycle
    /// counter is incremented.
    pub async fn poll_degraded_venues(&self) {
        let correlation = CorrelationId::new();
        for venue in self.degradation.degraded_venues() {
            self.degradation.increment_polling_cycle(venue);
            self.health.mark_degraded(venue);
            self.sweep_venue(venue, BookHealth::Degraded, correlation)
                .await;
        }
    }

    async fn sweep_venue(&self, venue: Venue, health: BookHealth, correlation: CorrelationId) {
        let Some(connector) = self.connectors.get(&venue) else {
            warn!(venue = %venue, "no connector configured");
            return;
        };

        for contract_id in self.registry.contract_ids(venue) {
            let started = Instant::now();
            match connector.fetch_order_book(&contract_id).await {
                Ok(book) => {
                    let latency_ms = started.elapsed().as_millis() as u64;
                    let book = book.with_health(health);
                    if self.persist_and_publish(book, correlation).await
                        && health == BookHealth::Healthy
                    {
                        self.health.record_success(venue, latency_ms);
                    }
                }
                Err(e) => {
                    // Per-contract isolation: log and move to the next one.
                    warn!(
                        venue = %venue,
                        contract_id = %contract_id,
                        code = %e.code(venue),
                        correlation_id = %correlation,
                        error = %e,
                        "order book fetch failed"
                    );
                }
            }
        }

        let status = self.health.status(venue);
        if let Err(e) = self.sink.append_health(venue, status, Utc::now()).await {
            warn!(venue = %venue, error = %e, "health row append failed");
        }
    }

    /// Persists one snapshot and broadcasts `orderbook.updated`.
    ///
    /// Returns `true` when the snapshot was persisted. Applies the
    /// consecutive-failure policy on the sink.
    async fn persist_and_publish(
        &self,
        book: NormalizedOrderBook,
        correlation: CorrelationId,
    ) -> bool {
        match self.sink.append_snapshot(&book).await {
            Ok(()) => {
                *self.write_failures.lock() = 0;
                self.bus.publish(
                    EventEnvelope::new(
                        names::ORDERBOOK_UPDATED,
                        "ingestion",
                        serde_json::json!({
                            "platform": book.venue.as_str(),
                            "contract_id": book.contract_id,
                            "best_bid": book.best_bid(),
                            "best_ask": book.best_ask(),
                            "health": book.health,
                            "sequence": book.sequence,
                        }),
                    )
                    .with_correlation(correlation),
                );
                true
            }
            Err(e) => {
                let streak = {
                    let mut failures = self.write_failures.lock();
                    *failures += 1;
                    *failures
                };
                error!(
                    venue = %book.venue,
                    contract_id = %book.contract_id,
                    streak,
                    correlation_id = %correlation,
                    error = %e,
                    "snapshot persistence failed"
                );
                if streak == self.config.failure_streak_limit {
                    error!(
                        code = %ErrorCode::PERSISTENCE_FAILURE_STREAK,
                        streak,
                        "persistence failure streak reached critical threshold"
                    );
                    self.bus.publish(
                        EventEnvelope::new(
                            names::SYSTEM_HEALTH_CRITICAL,
                            "ingestion",
                            serde_json::json!({
                                "code": ErrorCode::PERSISTENCE_FAILURE_STREAK,
                                "consecutive_failures": streak,
                                "message": "order book persistence failing repeatedly",
                            }),
                        )
                        .with_correlation(correlation),
                    );
                }
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pm_arb_core::{
        ContractPair, FeeSchedule, HealthStatus, OrderAck, OrderRequest, OrderState,
        PlatformError, PlatformResult, PriceLevel, VenueHealthView,
    };
    use pm_arb_data::MemorySink;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct MockConnector {
        venue: Venue,
        fail: std::sync::atomic::AtomicBool,
        fetch_calls: AtomicU32,
    }

    impl MockConnector {
        fn new(venue: Venue) -> Arc<Self> {
            Arc::new(Self {
                venue,
                fail: std::sync::atomic::AtomicBool::new(false),
                fetch_calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.fetch_calls.load(Ordering::SeqCst)
        }

        fn book(&self, contract_id: &str) -> NormalizedOrderBook {
            NormalizedOrderBook::new(
                self.venue,
                contract_id,
                vec![PriceLevel::new(dec!(0.40), dec!(100))],
                vec![PriceLevel::new(dec!(0.42), dec!(100))],
            )
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
        async fn fetch_order_book(
            &self,
            contract_id: &str,
        ) -> PlatformResult<NormalizedOrderBook> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(PlatformError::Network("mock down".into()));
            }
            Ok(self.book(contract_id))
        }
        async fn subscribe_order_books(
            &self,
            _contract_ids: &[String],
            _events: mpsc::Sender<ConnectorEvent>,
        ) -> PlatformResult<()> {
            Ok(())
        }
        fn fee_schedule(&self) -> FeeSchedule {
            FeeSchedule {
                maker_pct: dec!(0),
                taker_pct: dec!(1),
                gas_estimate_usd: None,
                description: "mock".into(),
            }
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

    struct Fixture {
        pipeline: Arc<IngestionPipeline>,
        sink: Arc<MemorySink>,
        bus: EventBus,
        degradation: Arc<DegradationProtocol>,
        kalshi: Arc<MockConnector>,
        polymarket: Arc<MockConnector>,
    }

    fn fixture() -> Fixture {
        let bus = EventBus::default();
        let sink = Arc::new(MemorySink::new());
        let health = Arc::new(HealthTracker::new(bus.clone()));
        let degradation = Arc::new(DegradationProtocol::new(dec!(1.5), bus.clone()));
        let kalshi = MockConnector::new(Venue::Kalshi);
        let polymarket = MockConnector::new(Venue::Polymarket);

        let registry = Arc::new(
            PairRegistry::new(vec![ContractPair {
                kalshi_ticker: "KXT".into(),
                polymarket_token_id: "tok-yes".into(),
                polymarket_no_token_id: "tok-no".into(),
                description: "test pair".into(),
                verified_at: Utc::now(),
                primary_leg: Venue::Kalshi,
            }])
            .unwrap(),
        );

        let mut connectors: HashMap<Venue, Arc<dyn VenueConnector>> = HashMap::new();
        connectors.insert(Venue::Kalshi, kalshi.clone());
        connectors.insert(Venue::Polymarket, polymarket.clone());

        let pipeline = Arc::new(IngestionPipeline::new(
            connectors,
            sink.clone(),
            bus.clone(),
            health,
            degradation.clone(),
            registry,
            IngestionConfig::default(),
        ));

        Fixture {
            pipeline,
            sink,
            bus,
            degradation,
            kalshi,
            polymarket,
        }
    }

    // ==================== Periodic Sweep Tests ====================

    #[tokio::test]
    async fn test_sweep_persists_and_publishes_both_venues() {
        let f = fixture();
        let mut rx = f.bus.subscribe(names::ORDERBOOK_UPDATED);

        f.pipeline.ingest_current_order_books().await;

        assert_eq!(f.sink.snapshot_count(), 2);
        assert_eq!(f.kalshi.calls(), 1);
        assert_eq!(f.polymarket.calls(), 1);

        let event = rx.recv().await.unwrap();
        assert!(event.correlation_id.is_some());
        assert_eq!(event.payload["health"], "healthy");
    }

    #[tokio::test]
    async fn test_degraded_venue_skipped_in_primary_sweep() {
        let f = fixture();
        f.degradation
            .activate(Venue::Kalshi, DegradationReason::Manual, None);

        f.pipeline.ingest_current_order_books().await;

        assert_eq!(f.kalshi.calls(), 0);
        assert_eq!(f.polymarket.calls(), 1);
        assert_eq!(f.sink.snapshot_count(), 1);
    }

    #[tokio::test]
    async fn test_per_venue_error_isolation() {
        let f = fixture();
        f.kalshi.fail.store(true, Ordering::SeqCst);

        f.pipeline.ingest_current_order_books().await;

        // Kalshi failed, Polymarket still persisted.
        assert_eq!(f.sink.snapshot_count(), 1);
        assert_eq!(f.polymarket.calls(), 1);
    }

    // ==================== Degraded Polling Tests ====================

    #[tokio::test]
    async fn test_degraded_polling_tags_and_counts() {
        let f = fixture();
        f.degradation
            .activate(Venue::Kalshi, DegradationReason::WebsocketDisconnected, None);

        f.pipeline.poll_degraded_venues().await;
        f.pipeline.poll_degraded_venues().await;

        assert_eq!(f.kalshi.calls(), 2);
        assert_eq!(
            f.degradation.state(Venue::Kalshi).unwrap().polling_cycles,
            2
        );
        let snapshots = f.sink.snapshots();
        assert!(snapshots
            .iter()
            .all(|b| b.health == BookHealth::Degraded && b.venue == Venue::Kalshi));
    }

    #[tokio::test]
    async fn test_healthy_venues_not_polled_by_degraded_sweep() {
        let f = fixture();
        f.pipeline.poll_degraded_venues().await;
        assert_eq!(f.kalshi.calls(), 0);
        assert_eq!(f.polymarket.calls(), 0);
    }

    // ==================== Persistence Failure Policy Tests ====================

    #[tokio::test]
    async fn test_failure_streak_raises_critical_once() {
        let f = fixture();
        let mut rx = f.bus.subscribe(names::SYSTEM_HEALTH_CRITICAL);
        f.sink.set_fail_writes(true);

        let book = f.kalshi.book("KXT");
        for _ in 0..10 {
            f.pipeline
                .handle_connector_event(ConnectorEvent::Book(book.clone()))
                .await;
        }

        let event = rx.recv().await.unwrap();
        assert_eq!(event.payload["code"], 4005);
        assert_eq!(event.payload["consecutive_failures"], 10);
        // The eleventh failure does not re-raise.
        f.pipeline
            .handle_connector_event(ConnectorEvent::Book(book))
            .await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_success_resets_failure_streak() {
        let f = fixture();
        let mut rx = f.bus.subscribe(names::SYSTEM_HEALTH_CRITICAL);
        let book = f.kalshi.book("KXT");

        f.sink.set_fail_writes(true);
        for _ in 0..9 {
            f.pipeline
                .handle_connector_event(ConnectorEvent::Book(book.clone()))
                .await;
        }
        f.sink.set_fail_writes(false);
        f.pipeline
            .handle_connector_event(ConnectorEvent::Book(book.clone()))
            .await;

        // Streak reset; nine more failures stay below the limit.
        f.sink.set_fail_writes(true);
        for _ in 0..9 {
            f.pipeline
                .handle_connector_event(ConnectorEvent::Book(book.clone()))
                .await;
        }
        assert!(rx.try_recv().is_err());
    }

    // ==================== Transport Signal Tests ====================

    #[tokio::test]
    async fn test_disconnect_activates_degradation() {
        let f = fixture();
        f.pipeline
            .handle_connector_event(ConnectorEvent::Transport {
                venue: Venue::Kalshi,
                signal: TransportSignal::Disconnected {
                    reason: "socket dropped".into(),
                },
            })
            .await;
        assert!(f.degradation.is_degraded(Venue::Kalshi));
        assert_eq!(
            f.degradation.state(Venue::Kalshi).unwrap().reason,
            DegradationReason::WebsocketDisconnected
        );
    }

    #[tokio::test]
    async fn test_reconnect_deactivates_degradation() {
        let f = fixture();
        f.degradation
            .activate(Venue::Kalshi, DegradationReason::WebsocketDisconnected, None);

        f.pipeline
            .handle_connector_event(ConnectorEvent::Transport {
                venue: Venue::Kalshi,
                signal: TransportSignal::Connected,
            })
            .await;
        assert!(!f.degradation.is_degraded(Venue::Kalshi));
    }

    #[tokio::test]
    async fn test_stale_event_published() {
        let f = fixture();
        let mut rx = f.bus.subscribe(names::DATA_STALE);

        f.pipeline
            .handle_connector_event(ConnectorEvent::Stale {
                venue: Venue::Polymarket,
                contract_id: "tok-yes".into(),
                age_secs: 45,
            })
            .await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.payload["platform"], "polymarket");
        assert_eq!(event.payload["age_secs"], 45);
    }

    #[tokio::test]
    async fn test_resync_storm_activates_protocol_resync() {
        let f = fixture();
        f.pipeline
            .handle_connector_event(ConnectorEvent::Transport {
                venue: Venue::Kalshi,
                signal: TransportSignal::ResyncStorm { resyncs: 4 },
            })
            .await;
        assert_eq!(
            f.degradation.state(Venue::Kalshi).unwrap().reason,
            DegradationReason::ProtocolResync
        );
    }
}
