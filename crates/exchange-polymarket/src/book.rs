//! L2 order book state for one Polymarket token.
//!
//! Prices arrive already in decimal (0, 1); there is no inversion. State
//! is seeded by a full `book` snapshot and mutated by `price_change`
//! level updates carrying absolute sizes. A book that has never seen a
//! snapshot drops updates, because emitting partial depth would mislead
//! detection.

use chrono::{DateTime, TimeZone, Utc};
use pm_arb_core::{NormalizedOrderBook, PriceLevel, Venue};
use rust_decimal::Decimal;
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::str::FromStr;

/// Side of a level update, in the CLOB's BUY/SELL terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookSide {
    /// Bid side.
    Buy,
    /// Ask side.
    Sell,
}

impl BookSide {
    /// Parses the CLOB's side strings.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" | "B" => Some(Self::Buy),
            "SELL" | "S" => Some(Self::Sell),
            _ => None,
        }
    }
}

/// In-memory depth for one token.
#[derive(Debug, Clone, Default)]
pub struct TokenBook {
    bids: BTreeMap<Reverse<Decimal>, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
    last_update_ms: Option<i64>,
    seeded: bool,
}

impl TokenBook {
    /// Creates an empty, unseeded book.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True once a snapshot has seeded the book.
    #[must_use]
    pub fn is_seeded(&self) -> bool {
        self.seeded
    }

    /// Millisecond timestamp of the last applied message.
    #[must_use]
    pub fn last_update_ms(&self) -> Option<i64> {
        self.last_update_ms
    }

    /// Replaces all depth from a snapshot. Non-positive sizes are dropped.
    pub fn apply_snapshot(
        &mut self,
        bids: Vec<(Decimal, Decimal)>,
        asks: Vec<(Decimal, Decimal)>,
        timestamp_ms: Option<i64>,
    ) {
        self.bids.clear();
        self.asks.clear();
        for (price, size) in bids {
            if size > Decimal::ZERO {
                self.bids.insert(Reverse(price), size);
            }
        }
        for (price, size) in asks {
            if size > Decimal::ZERO {
                self.asks.insert(price, size);
            }
        }
        self.last_update_ms = timestamp_ms;
        self.seeded = true;
    }

    /// Applies one level update with an absolute size.
    ///
    /// Returns `false` when the book is unseeded and the update was
    /// dropped. Size zero removes the level.
    pub fn apply_update(
        &mut self,
        side: BookSide,
        price: Decimal,
        size: Decimal,
        timestamp_ms: Option<i64>,
    ) -> bool {
        if !self.seeded {
            return false;
        }
        match side {
            BookSide::Buy => {
                if size <= Decimal::ZERO {
                    self.bids.remove(&Reverse(price));
                } else {
                    self.bids.insert(Reverse(price), size);
                }
            }
            BookSide::Sell => {
                if size <= Decimal::ZERO {
                    self.asks.remove(&price);
                } else {
                    self.asks.insert(price, size);
                }
            }
        }
        if timestamp_ms.is_some() {
            self.last_update_ms = timestamp_ms;
        }
        true
    }

    /// Best (highest) bid.
    #[must_use]
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.keys().next().map(|r| r.0)
    }

    /// Best (lowest) ask.
    #[must_use]
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.keys().next().copied()
    }

    /// True when either side has depth.
    #[must_use]
    pub fn has_liquidity(&self) -> bool {
        !self.bids.is_empty() || !self.asks.is_empty()
    }

    /// Converts to the canonical form.
    ///
    /// `observed_at` comes from the last message timestamp when present,
    /// otherwise from the wall clock.
    #[must_use]
    pub fn to_normalized(&self, token_id: &str) -> NormalizedOrderBook {
        let observed_at = self
            .last_update_ms
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now);

        NormalizedOrderBook {
            venue: Venue::Polymarket,
            contract_id: token_id.to_string(),
            bids: self
                .bids
                .iter()
                .map(|(r, size)| PriceLevel::new(r.0, *size))
                .collect(),
            asks: self
                .asks
                .iter()
                .map(|(price, size)| PriceLevel::new(*price, *size))
                .collect(),
            observed_at,
            sequence: None,
            health: pm_arb_core::BookHealth::Healthy,
        }
    }
}

/// Parses a CLOB decimal string, accepting the `.48` shorthand.
#[must_use]
pub fn parse_decimal(s: &str) -> Option<Decimal> {
    if s.starts_with('.') {
        Decimal::from_str(&format!("0{s}")).ok()
    } else {
        Decimal::from_str(s).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    // ==================== Parsing Tests ====================

    #[test]
    fn test_parse_decimal_standard() {
        assert_eq!(parse_decimal("0.48"), Some(dec!(0.48)));
        assert_eq!(parse_decimal("100"), Some(dec!(100)));
    }

    #[test]
    fn test_parse_decimal_shorthand() {
        assert_eq!(parse_decimal(".48"), Some(dec!(0.48)));
        assert_eq!(parse_decimal(".01"), Some(dec!(0.01)));
    }

    #[test]
    fn test_parse_decimal_garbage() {
        assert_eq!(parse_decimal("abc"), None);
        assert_eq!(parse_decimal(""), None);
    }

    #[test]
    fn test_parse_decimal_value_round_trip() {
        // String decimal -> Decimal -> string preserves value.
        let d = parse_decimal(".485").unwrap();
        assert_eq!(d.to_string(), "0.485");
    }

    #[test]
    fn test_side_parsing() {
        assert_eq!(BookSide::parse("BUY"), Some(BookSide::Buy));
        assert_eq!(BookSide::parse("sell"), Some(BookSide::Sell));
        assert_eq!(BookSide::parse("hold"), None);
    }

    // ==================== Book State Tests ====================

    #[test]
    fn test_update_before_snapshot_dropped() {
        let mut book = TokenBook::new();
        let applied = book.apply_update(BookSide::Buy, dec!(0.48), dec!(100), None);
        assert!(!applied);
        assert!(!book.has_liquidity());
    }

    #[test]
    fn test_snapshot_seeds_and_sorts() {
        let mut book = TokenBook::new();
        book.apply_snapshot(
            vec![(dec!(0.47), dec!(50)), (dec!(0.48), dec!(100))],
            vec![(dec!(0.53), dec!(20)), (dec!(0.52), dec!(80))],
            Some(1_706_745_600_000),
        );

        let normalized = book.to_normalized("tok");
        assert_eq!(normalized.best_bid(), Some(dec!(0.48)));
        assert_eq!(normalized.best_ask(), Some(dec!(0.52)));
        assert!(normalized.validate().is_ok());
        assert_eq!(
            normalized.observed_at,
            Utc.timestamp_millis_opt(1_706_745_600_000).single().unwrap()
        );
    }

    #[test]
    fn test_snapshot_drops_zero_sizes() {
        let mut book = TokenBook::new();
        book.apply_snapshot(
            vec![(dec!(0.48), dec!(0))],
            vec![(dec!(0.52), dec!(80))],
            None,
        );
        assert!(book.best_bid().is_none());
        assert_eq!(book.best_ask(), Some(dec!(0.52)));
    }

    #[test]
    fn test_update_replaces_level_size() {
        let mut book = TokenBook::new();
        book.apply_snapshot(vec![(dec!(0.48), dec!(100))], vec![], None);
        assert!(book.apply_update(BookSide::Buy, dec!(0.48), dec!(40), None));

        let normalized = book.to_normalized("tok");
        assert_eq!(normalized.best_bid_size(), Some(dec!(40)));
    }

    #[test]
    fn test_zero_size_update_removes_level() {
        let mut book = TokenBook::new();
        book.apply_snapshot(vec![(dec!(0.48), dec!(100))], vec![], None);
        book.apply_update(BookSide::Buy, dec!(0.48), Decimal::ZERO, None);
        assert!(book.best_bid().is_none());
    }

    #[test]
    fn test_snapshot_then_updates_equals_folded() {
        let mut streamed = TokenBook::new();
        streamed.apply_snapshot(
            vec![(dec!(0.48), dec!(100))],
            vec![(dec!(0.52), dec!(80))],
            None,
        );
        streamed.apply_update(BookSide::Buy, dec!(0.49), dec!(25), None);
        streamed.apply_update(BookSide::Sell, dec!(0.52), Decimal::ZERO, None);
        streamed.apply_update(BookSide::Sell, dec!(0.53), dec!(60), None);

        let mut folded = TokenBook::new();
        folded.apply_snapshot(
            vec![(dec!(0.48), dec!(100)), (dec!(0.49), dec!(25))],
            vec![(dec!(0.53), dec!(60))],
            None,
        );

        assert_eq!(
            streamed.to_normalized("tok").bids,
            folded.to_normalized("tok").bids
        );
        assert_eq!(
            streamed.to_normalized("tok").asks,
            folded.to_normalized("tok").asks
        );
    }
}
