//! Canonical order book representation.
//!
//! Every venue-native payload is converted into a [`NormalizedOrderBook`]
//! at the connector boundary: prices are probabilities in (0, 1), bids are
//! sorted descending, asks ascending. Downstream code (ingestion, detection)
//! never sees venue-native cents or string decimals.

use crate::venue::Venue;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single price level: probability price and positive size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    /// Price as a decimal probability, strictly inside (0, 1).
    pub price: Decimal,
    /// Contract units at this level. Integer on Kalshi, fractional on
    /// Polymarket; always carried as a decimal.
    pub size: Decimal,
}

impl PriceLevel {
    /// Creates a new price level.
    #[must_use]
    pub const fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }
}

/// Health tag attached to a book at emit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookHealth {
    /// Sourced from a live transport.
    #[default]
    Healthy,
    /// Sourced over REST polling while the venue is degraded.
    Degraded,
    /// Venue unreachable; book is the last known state.
    Offline,
}

/// Validation failures for a normalized book.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BookValidationError {
    /// A price fell outside the open interval (0, 1).
    #[error("{side} price {price} outside (0, 1) for {contract_id}")]
    PriceOutOfRange {
        /// "bid" or "ask".
        side: &'static str,
        /// Offending price.
        price: Decimal,
        /// Contract the book belongs to.
        contract_id: String,
    },

    /// A level carried a non-positive size.
    #[error("{side} level at {price} has non-positive size {size}")]
    NonPositiveSize {
        /// "bid" or "ask".
        side: &'static str,
        /// Price of the offending level.
        price: Decimal,
        /// Offending size.
        size: Decimal,
    },

    /// A side was not strictly sorted, or contained duplicate prices.
    #[error("{side} side not strictly sorted at index {index}")]
    NotSorted {
        /// "bid" or "ask".
        side: &'static str,
        /// First index violating the order.
        index: usize,
    },

    /// Best bid was at or above best ask.
    #[error("crossed book: best bid {best_bid} >= best ask {best_ask}")]
    Crossed {
        /// Best (highest) bid price.
        best_bid: Decimal,
        /// Best (lowest) ask price.
        best_ask: Decimal,
    },
}

/// Venue-independent view of one contract's order book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedOrderBook {
    /// Venue the book was observed on.
    pub venue: Venue,
    /// Venue-native contract identifier (ticker or token id).
    pub contract_id: String,
    /// Bid levels sorted descending by price.
    pub bids: Vec<PriceLevel>,
    /// Ask levels sorted ascending by price.
    pub asks: Vec<PriceLevel>,
    /// When the book was observed.
    pub observed_at: DateTime<Utc>,
    /// Venue sequence number, when the transport provides one.
    pub sequence: Option<u64>,
    /// Health tag at emit time.
    pub health: BookHealth,
}

impl NormalizedOrderBook {
    /// Creates a healthy book observed now.
    #[must_use]
    pub fn new(
        venue: Venue,
        contract_id: impl Into<String>,
        bids: Vec<PriceLevel>,
        asks: Vec<PriceLevel>,
    ) -> Self {
        Self {
            venue,
            contract_id: contract_id.into(),
            bids,
            asks,
            observed_at: Utc::now(),
            sequence: None,
            health: BookHealth::Healthy,
        }
    }

    /// Sets the sequence number.
    #[must_use]
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Sets the health tag.
    #[must_use]
    pub fn with_health(mut self, health: BookHealth) -> Self {
        self.health = health;
        self
    }

    /// Best (highest) bid price.
    #[must_use]
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    /// Best (lowest) ask price.
    #[must_use]
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }

    /// Size resting at the best bid.
    #[must_use]
    pub fn best_bid_size(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.size)
    }

    /// Size resting at the best ask.
    #[must_use]
    pub fn best_ask_size(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.size)
    }

    /// True when the best bid meets or crosses the best ask.
    #[must_use]
    pub fn is_crossed(&self) -> bool {
        matches!(
            (self.best_bid(), self.best_ask()),
            (Some(bid), Some(ask)) if bid >= ask
        )
    }

    /// Age of the observation relative to `now`.
    #[must_use]
    pub fn age_at(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.observed_at
    }

    /// Checks every invariant of the canonical form.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant: prices inside (0, 1), positive
    /// sizes, strict sort order with no duplicate prices per side, and
    /// best bid strictly below best ask when both sides are present.
    pub fn validate(&self) -> Result<(), BookValidationError> {
        Self::validate_side("bid", &self.bids, &self.contract_id, true)?;
        Self::validate_side("ask", &self.asks, &self.contract_id, false)?;

        if let (Some(bid), Some(ask)) = (self.best_bid(), self.best_ask()) {
            if bid >= ask {
                return Err(BookValidationError::Crossed {
                    best_bid: bid,
                    best_ask: ask,
                });
            }
        }
        Ok(())
    }

    fn validate_side(
        side: &'static str,
        levels: &[PriceLevel],
        contract_id: &str,
        descending: bool,
    ) -> Result<(), BookValidationError> {
        for level in levels {
            if level.price <= Decimal::ZERO || level.price >= Decimal::ONE {
                return Err(BookValidationError::PriceOutOfRange {
                    side,
                    price: level.price,
                    contract_id: contract_id.to_string(),
                });
            }
            if level.size <= Decimal::ZERO {
                return Err(BookValidationError::NonPositiveSize {
                    side,
                    price: level.price,
                    size: level.size,
                });
            }
        }
        for (index, pair) in levels.windows(2).enumerate() {
            let ordered = if descending {
                pair[0].price > pair[1].price
            } else {
                pair[0].price < pair[1].price
            };
            if !ordered {
                return Err(BookValidationError::NotSorted {
                    side,
                    index: index + 1,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn level(price: Decimal, size: Decimal) -> PriceLevel {
        PriceLevel::new(price, size)
    }

    fn valid_book() -> NormalizedOrderBook {
        NormalizedOrderBook::new(
            Venue::Polymarket,
            "token-1",
            vec![level(dec!(0.48), dec!(100)), level(dec!(0.47), dec!(50))],
            vec![level(dec!(0.52), dec!(80)), level(dec!(0.53), dec!(20))],
        )
    }

    // ==================== Validation Tests ====================

    #[test]
    fn test_valid_book_passes() {
        assert!(valid_book().validate().is_ok());
    }

    #[test]
    fn test_empty_sides_pass() {
        let book = NormalizedOrderBook::new(Venue::Kalshi, "T", vec![], vec![]);
        assert!(book.validate().is_ok());
        assert!(book.best_bid().is_none());
        assert!(book.best_ask().is_none());
    }

    #[test]
    fn test_price_at_zero_rejected() {
        let mut book = valid_book();
        book.bids.push(level(dec!(0), dec!(10)));
        assert!(matches!(
            book.validate(),
            Err(BookValidationError::PriceOutOfRange { side: "bid", .. })
        ));
    }

    #[test]
    fn test_price_at_one_rejected() {
        let mut book = valid_book();
        book.asks.push(level(dec!(1), dec!(10)));
        assert!(matches!(
            book.validate(),
            Err(BookValidationError::PriceOutOfRange { side: "ask", .. })
        ));
    }

    #[test]
    fn test_zero_size_rejected() {
        let mut book = valid_book();
        book.asks[0].size = Decimal::ZERO;
        assert!(matches!(
            book.validate(),
            Err(BookValidationError::NonPositiveSize { .. })
        ));
    }

    #[test]
    fn test_duplicate_bid_price_rejected() {
        let mut book = valid_book();
        book.bids = vec![level(dec!(0.48), dec!(10)), level(dec!(0.48), dec!(20))];
        assert!(matches!(
            book.validate(),
            Err(BookValidationError::NotSorted {
                side: "bid",
                index: 1
            })
        ));
    }

    #[test]
    fn test_ascending_bids_rejected() {
        let mut book = valid_book();
        book.bids = vec![level(dec!(0.40), dec!(10)), level(dec!(0.45), dec!(20))];
        assert!(matches!(
            book.validate(),
            Err(BookValidationError::NotSorted { side: "bid", .. })
        ));
    }

    #[test]
    fn test_crossed_book_rejected() {
        let book = NormalizedOrderBook::new(
            Venue::Kalshi,
            "T",
            vec![level(dec!(0.55), dec!(10))],
            vec![level(dec!(0.52), dec!(10))],
        );
        assert!(book.is_crossed());
        assert!(matches!(
            book.validate(),
            Err(BookValidationError::Crossed { .. })
        ));
        assert!(!valid_book().is_crossed());
    }

    #[test]
    fn test_touching_book_rejected() {
        // Equal best bid and ask also violates the invariant.
        let book = NormalizedOrderBook::new(
            Venue::Kalshi,
            "T",
            vec![level(dec!(0.50), dec!(10))],
            vec![level(dec!(0.50), dec!(10))],
        );
        assert!(book.validate().is_err());
    }

    // ==================== Accessor Tests ====================

    #[test]
    fn test_best_prices_and_sizes() {
        let book = valid_book();
        assert_eq!(book.best_bid(), Some(dec!(0.48)));
        assert_eq!(book.best_ask(), Some(dec!(0.52)));
        assert_eq!(book.best_bid_size(), Some(dec!(100)));
        assert_eq!(book.best_ask_size(), Some(dec!(80)));
    }

    #[test]
    fn test_health_defaults_to_healthy() {
        assert_eq!(valid_book().health, BookHealth::Healthy);
        let degraded = valid_book().with_health(BookHealth::Degraded);
        assert_eq!(degraded.health, BookHealth::Degraded);
    }

    #[test]
    fn test_age_at() {
        let book = valid_book();
        let later = book.observed_at + chrono::Duration::seconds(31);
        assert_eq!(book.age_at(later), chrono::Duration::seconds(31));
    }
}
