//! Edge calculation and threshold filtering.
//!
//! Adjusts each raw dislocation for taker fees on both legs and pro-rated
//! gas, widens the threshold through the degradation protocol, and either
//! enriches it into an opportunity or files it with a reason. Every
//! computation is fixed-precision decimal; division rounds half to even.

use crate::detector::RawDislocation;
use chrono::{DateTime, Utc};
use pm_arb_core::decimal::{div_half_even, pct_to_fraction};
use pm_arb_core::events::names;
use pm_arb_core::{CorrelationId, EventBus, EventEnvelope, FeeSchedule, Venue, VenueConnector};
use pm_arb_ingestion::DegradationProtocol;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Thresholds and sizing used by the calculator.
#[derive(Debug, Clone)]
pub struct EdgeConfig {
    /// Minimum net edge before widening.
    pub base_min_edge: Decimal,
    /// Gas estimate per trade, USD.
    pub gas_estimate_usd: Decimal,
    /// Nominal position size used to pro-rate gas, USD.
    pub position_size_usd: Decimal,
}

impl EdgeConfig {
    /// Builds calculator settings from the engine-level detection section.
    #[must_use]
    pub fn from_engine(config: &pm_arb_core::config::DetectionConfig) -> Self {
        Self {
            base_min_edge: config.min_edge,
            gas_estimate_usd: config.gas_estimate_usd,
            position_size_usd: config.position_size_usd,
        }
    }
}

/// Cost decomposition of one dislocation.
#[derive(Debug, Clone, Serialize)]
pub struct FeeBreakdown {
    /// `buy_price x buy taker fee`.
    pub buy_fee_cost: Decimal,
    /// `sell_price x sell taker fee`.
    pub sell_fee_cost: Decimal,
    /// `gas_estimate_usd / position_size_usd`.
    pub gas_fraction: Decimal,
    /// Sum of the three.
    pub total_costs: Decimal,
    /// Buy-leg schedule at enrichment time.
    pub buy_schedule: FeeSchedule,
    /// Sell-leg schedule at enrichment time.
    pub sell_schedule: FeeSchedule,
}

/// Top-of-book sizes on both legs.
#[derive(Debug, Clone, Serialize)]
pub struct LiquidityDepth {
    /// Size at the buy leg's best bid.
    pub buy_best_bid_size: Option<Decimal>,
    /// Size at the buy leg's best ask.
    pub buy_best_ask_size: Option<Decimal>,
    /// Size at the sell leg's best bid.
    pub sell_best_bid_size: Option<Decimal>,
    /// Size at the sell leg's best ask.
    pub sell_best_ask_size: Option<Decimal>,
}

/// A dislocation whose net edge cleared the effective threshold.
#[derive(Debug, Clone, Serialize)]
pub struct EnrichedOpportunity {
    /// The underlying dislocation.
    pub raw: RawDislocation,
    /// Gross edge before costs.
    pub gross_edge: Decimal,
    /// Edge after fees and gas.
    pub net_edge: Decimal,
    /// Cost decomposition.
    pub fees: FeeBreakdown,
    /// Top-of-book depth snapshot.
    pub liquidity: LiquidityDepth,
    /// When enrichment ran.
    pub enriched_at: DateTime<Utc>,
}

/// Why a dislocation was filtered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterReason {
    /// Net edge was negative after costs.
    NegativeEdge,
    /// Net edge was positive but at or below the effective threshold.
    BelowThreshold,
}

impl FilterReason {
    /// Canonical snake_case form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NegativeEdge => "negative_edge",
            Self::BelowThreshold => "below_threshold",
        }
    }
}

/// A dislocation rejected by the filter.
#[derive(Debug, Clone, Serialize)]
pub struct FilteredDislocation {
    /// The underlying dislocation.
    pub raw: RawDislocation,
    /// Edge after fees and gas.
    pub net_edge: Decimal,
    /// Threshold after degradation widening.
    pub effective_threshold: Decimal,
    /// Rejection reason.
    pub reason: FilterReason,
}

/// Totals for one processing batch.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ProcessSummary {
    /// Dislocations processed.
    pub processed: u32,
    /// Opportunities identified.
    pub identified: u32,
    /// Dislocations filtered.
    pub filtered: u32,
}

/// Result of processing one batch of dislocations.
#[derive(Debug, Default)]
pub struct ProcessOutcome {
    /// Opportunities that cleared the threshold.
    pub opportunities: Vec<EnrichedOpportunity>,
    /// Rejected dislocations with reasons.
    pub filtered: Vec<FilteredDislocation>,
    /// Batch totals.
    pub summary: ProcessSummary,
}

/// Fee-, gas-, and degradation-aware opportunity filter.
pub struct EdgeCalculator {
    connectors: HashMap<Venue, Arc<dyn VenueConnector>>,
    degradation: Arc<DegradationProtocol>,
    config: EdgeConfig,
    bus: EventBus,
}

impl EdgeCalculator {
    /// Wires the calculator to its collaborators.
    #[must_use]
    pub fn new(
        connectors: HashMap<Venue, Arc<dyn VenueConnector>>,
        degradation: Arc<DegradationProtocol>,
        config: EdgeConfig,
        bus: EventBus,
    ) -> Self {
        Self {
            connectors,
            degradation,
            config,
            bus,
        }
    }

    /// Processes one batch of raw dislocations.
    ///
    /// Emits `detection.opportunity.identified` or
    /// `detection.opportunity.filtered` per item, stamped with the cycle's
    /// correlation id.
    pub fn process_dislocations(
        &self,
        raw: Vec<RawDislocation>,
        correlation: Option<CorrelationId>,
    ) -> ProcessOutcome {
        let mut outcome = ProcessOutcome::default();

        for dislocation in raw {
            outcome.summary.processed += 1;

            let Some(buy_connector) = self.connectors.get(&dislocation.buy_venue) else {
                continue;
            };
            let Some(sell_connector) = self.connectors.get(&dislocation.sell_venue) else {
                continue;
            };
            let buy_schedule = buy_connector.fee_schedule();
            let sell_schedule = sell_connector.fee_schedule();

            let buy_fee_cost = dislocation.buy_price * pct_to_fraction(buy_schedule.taker_pct);
            let sell_fee_cost = dislocation.sell_price * pct_to_fraction(sell_schedule.taker_pct);
            let gas_fraction =
                div_half_even(self.config.gas_estimate_usd, self.config.position_size_usd)
                    .unwrap_or(Decimal::ZERO);
            let total_costs = buy_fee_cost + sell_fee_cost + gas_fraction;
            let net_edge = dislocation.gross_edge - total_costs;

            let multiplier = self
                .degradation
                .edge_threshold_multiplier(dislocation.buy_venue);
            let effective_threshold = self.config.base_min_edge * multiplier;

            if net_edge <= effective_threshold {
                let reason = if net_edge < Decimal::ZERO {
                    FilterReason::NegativeEdge
                } else {
                    FilterReason::BelowThreshold
                };
                debug!(
                    kalshi_ticker = %dislocation.pair.kalshi_ticker,
                    buy_venue = %dislocation.buy_venue,
                    net_edge = %net_edge,
                    effective_threshold = %effective_threshold,
                    reason = reason.as_str(),
                    "dislocation filtered"
                );
                self.publish_filtered(&dislocation, net_edge, effective_threshold, reason, correlation);
                outcome.summary.filtered += 1;
                outcome.filtered.push(FilteredDislocation {
                    raw: dislocation,
                    net_edge,
                    effective_threshold,
                    reason,
                });
                continue;
            }

            let liquidity = LiquidityDepth {
                buy_best_bid_size: dislocation.buy_book.best_bid_size(),
                buy_best_ask_size: dislocation.buy_book.best_ask_size(),
                sell_best_bid_size: dislocation.sell_book.best_bid_size(),
                sell_best_ask_size: dislocation.sell_book.best_ask_size(),
            };
            let fees = FeeBreakdown {
                buy_fee_cost,
                sell_fee_cost,
                gas_fraction,
                total_costs,
                buy_schedule,
                sell_schedule,
            };

            info!(
                kalshi_ticker = %dislocation.pair.kalshi_ticker,
                buy_venue = %dislocation.buy_venue,
                sell_venue = %dislocation.sell_venue,
                gross_edge = %dislocation.gross_edge,
                net_edge = %net_edge,
                "opportunity identified"
            );
            self.publish_identified(&dislocation, net_edge, &fees, correlation);

            outcome.summary.identified += 1;
            outcome.opportunities.push(EnrichedOpportunity {
                gross_edge: dislocation.gross_edge,
                net_edge,
                fees,
                liquidity,
                enriched_at: Utc::now(),
                raw: dislocation,
            });
        }

        outcome
    }

    fn publish_filtered(
        &self,
        dislocation: &RawDislocation,
        net_edge: Decimal,
        effective_threshold: Decimal,
        reason: FilterReason,
        correlation: Option<CorrelationId>,
    ) {
        let mut event = EventEnvelope::new(
            names::OPPORTUNITY_FILTERED,
            "detection",
            serde_json::json!({
                "kalshi_ticker": dislocation.pair.kalshi_ticker,
                "buy_platform": dislocation.buy_venue.as_str(),
                "sell_platform": dislocation.sell_venue.as_str(),
                "gross_edge": dislocation.gross_edge,
                "net_edge": net_edge,
                "effective_threshold": effective_threshold,
                "reason": reason.as_str(),
            }),
        );
        if let Some(id) = correlation {
            event = event.with_correlation(id);
        }
        self.bus.publish(event);
    }

    fn publish_identified(
        &self,
        dislocation: &RawDislocation,
        net_edge: Decimal,
        fees: &FeeBreakdown,
        correlation: Option<CorrelationId>,
    ) {
        let mut event = EventEnvelope::new(
            names::OPPORTUNITY_IDENTIFIED,
            "detection",
            serde_json::json!({
                "kalshi_ticker": dislocation.pair.kalshi_ticker,
                "buy_platform": dislocation.buy_venue.as_str(),
                "sell_platform": dislocation.sell_venue.as_str(),
                "buy_price": dislocation.buy_price,
                "sell_price": dislocation.sell_price,
                "gross_edge": dislocation.gross_edge,
                "net_edge": net_edge,
                "total_costs": fees.total_costs,
            }),
        );
        if let Some(id) = correlation {
            event = event.with_correlation(id);
        }
        self.bus.publish(event);
    }
}
