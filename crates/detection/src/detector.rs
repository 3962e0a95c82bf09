//! Dislocation detection.
//!
//! One cycle evaluates every tracked pair in both directions off fresh
//! REST snapshots. A pair is skipped outright while either venue is
//! degraded, on any fetch failure, and when either book is missing a
//! side. A direction produces a dislocation only when the buy-side ask
//! sits strictly below the implied sell derived from the sell-side ask;
//! equal prices produce nothing.

use chrono::{DateTime, Utc};
use pm_arb_core::events::names;
use pm_arb_core::{
    ContractPair, CorrelationId, EventBus, NormalizedOrderBook, PairRegistry, Venue,
    VenueConnector,
};
use pm_arb_ingestion::DegradationProtocol;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// A raw price dislocation before cost adjustment.
#[derive(Debug, Clone, Serialize)]
pub struct RawDislocation {
    /// The tracked pair.
    pub pair: ContractPair,
    /// Venue whose YES ask is bought.
    pub buy_venue: Venue,
    /// Venue supplying the implied sell.
    pub sell_venue: Venue,
    /// Best ask on the buy venue.
    pub buy_price: Decimal,
    /// Best ask on the sell venue; its complement is the implied YES sell.
    pub sell_price: Decimal,
    /// `(1 - sell_price) - buy_price`, strictly positive.
    pub gross_edge: Decimal,
    /// Buy-leg book at detection time.
    pub buy_book: NormalizedOrderBook,
    /// Sell-leg book at detection time.
    pub sell_book: NormalizedOrderBook,
    /// When the dislocation was observed.
    pub detected_at: DateTime<Utc>,
}

/// Result of one detection cycle.
#[derive(Debug, Default)]
pub struct DetectionCycle {
    /// Dislocations found this cycle.
    pub dislocations: Vec<RawDislocation>,
    /// Pairs that reached direction evaluation.
    pub pairs_evaluated: u32,
    /// Pairs skipped for degradation, fetch errors, or missing sides.
    pub pairs_skipped: u32,
    /// Wall-clock duration of the cycle.
    pub cycle_duration_ms: u64,
    /// Correlation id stamped on everything this cycle emitted.
    pub correlation_id: Option<CorrelationId>,
}

/// Per-cycle dislocation detector.
pub struct DetectionService {
    connectors: HashMap<Venue, Arc<dyn VenueConnector>>,
    degradation: Arc<DegradationProtocol>,
    registry: Arc<PairRegistry>,
    halted: AtomicBool,
}

impl DetectionService {
    /// Wires the detector to its collaborators.
    #[must_use]
    pub fn new(
        connectors: HashMap<Venue, Arc<dyn VenueConnector>>,
        degradation: Arc<DegradationProtocol>,
        registry: Arc<PairRegistry>,
    ) -> Self {
        Self {
            connectors,
            degradation,
            registry,
            halted: AtomicBool::new(false),
        }
    }

    /// Stops detection cycles until [`DetectionService::resume`].
    pub fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }

    /// Resumes detection cycles.
    pub fn resume(&self) {
        self.halted.store(false, Ordering::SeqCst);
    }

    /// True while halted.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Spawns a listener that halts detection on `time.drift.halt`.
    pub fn spawn_halt_listener(self: &Arc<Self>, bus: &EventBus) -> tokio::task::JoinHandle<()> {
        let mut rx = bus.subscribe(names::TIME_DRIFT_HALT);
        let service = Arc::clone(self);
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                warn!(occurred_at = %event.occurred_at, "time drift halt received, stopping detection");
                service.halt();
            }
        })
    }

    /// Runs one detection cycle over the full pair configuration.
    pub async fn detect_dislocations(&self) -> DetectionCycle {
        let started = Instant::now();
        let correlation = CorrelationId::new();
        let mut cycle = DetectionCycle {
            correlation_id: Some(correlation),
            ..DetectionCycle::default()
        };

        if self.is_halted() {
            cycle.pairs_skipped = self.registry.len() as u32;
            cycle.cycle_duration_ms = started.elapsed().as_millis() as u64;
            debug!(correlation_id = %correlation, "detection halted, cycle skipped");
            return cycle;
        }

        for pair in self.registry.pairs() {
            // A degraded leg is unreliable; the whole pair sits out.
            if Venue::ALL.iter().any(|v| self.degradation.is_degraded(*v)) {
                let degraded = self.degradation.degraded_venues();
                debug!(
                    kalshi_ticker = %pair.kalshi_ticker,
                    degraded = ?degraded,
                    correlation_id = %correlation,
                    "pair skipped: venue degraded"
                );
                cycle.pairs_skipped += 1;
                continue;
            }

            let kalshi_book = match self.fetch_leg(Venue::Kalshi, &pair.kalshi_ticker).await {
                Some(book) => book,
                None => {
                    cycle.pairs_skipped += 1;
                    continue;
                }
            };
            let poly_book = match self
                .fetch_leg(Venue::Polymarket, &pair.polymarket_token_id)
                .await
            {
                Some(book) => book,
                None => {
                    cycle.pairs_skipped += 1;
                    continue;
                }
            };

            // Both sides of both books must quote.
            let complete = kalshi_book.best_bid().is_some()
                && kalshi_book.best_ask().is_some()
                && poly_book.best_bid().is_some()
                && poly_book.best_ask().is_some();
            if !complete {
                debug!(
                    kalshi_ticker = %pair.kalshi_ticker,
                    correlation_id = %correlation,
                    "pair skipped: one-sided book"
                );
                cycle.pairs_skipped += 1;
                continue;
            }

            cycle.pairs_evaluated += 1;

            if let Some(d) =
                evaluate_direction(pair, Venue::Polymarket, &poly_book, Venue::Kalshi, &kalshi_book)
            {
                info!(
                    kalshi_ticker = %pair.kalshi_ticker,
                    buy_venue = %d.buy_venue,
                    gross_edge = %d.gross_edge,
                    correlation_id = %correlation,
                    "dislocation detected"
                );
                cycle.dislocations.push(d);
            }
            if let Some(d) =
                evaluate_direction(pair, Venue::Kalshi, &kalshi_book, Venue::Polymarket, &poly_book)
            {
                info!(
                    kalshi_ticker = %pair.kalshi_ticker,
                    buy_venue = %d.buy_venue,
                    gross_edge = %d.gross_edge,
                    correlation_id = %correlation,
                    "dislocation detected"
                );
                cycle.dislocations.push(d);
            }
        }

        cycle.cycle_duration_ms = started.elapsed().as_millis() as u64;
        cycle
    }

    async fn fetch_leg(&self, venue: Venue, contract_id: &str) -> Option<NormalizedOrderBook> {
        let connector = self.connectors.get(&venue)?;
        match connector.fetch_order_book(contract_id).await {
            Ok(book) => Some(book),
            Err(e) => {
                warn!(
                    venue = %venue,
                    contract_id = %contract_id,
                    code = %e.code(venue),
                    error = %e,
                    "leg fetch failed, pair skipped"
                );
                None
            }
        }
    }
}

/// Evaluates one direction, producing a dislocation only when a real
/// arbitrage direction exists (`buy_price < 1 - sell_price`).
fn evaluate_direction(
    pair: &ContractPair,
    buy_venue: Venue,
    buy_book: &NormalizedOrderBook,
    sell_venue: Venue,
    sell_book: &NormalizedOrderBook,
) -> Option<RawDislocation> {
    let buy_price = buy_book.best_ask()?;
    let sell_price = sell_book.best_ask()?;
    let implied_sell = Decimal::ONE - sell_price;

    if buy_price >= implied_sell {
        return None;
    }
    let gross_edge = implied_sell - buy_price;

    Some(RawDislocation {
        pair: pair.clone(),
        buy_venue,
        sell_venue,
        buy_price,
        sell_price,
        gross_edge,
        buy_book: buy_book.clone(),
        sell_book: sell_book.clone(),
        detected_at: Utc::now(),
    })
}
