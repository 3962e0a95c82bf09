//! Local order book state and normalization for Kalshi.
//!
//! Kalshi quotes two bid ladders in integer cents: YES bids and NO bids.
//! The canonical form inverts the NO ladder: a NO bid at `q` cents is a
//! YES ask at `(100 - q) / 100`. Levels with non-positive quantity are
//! dropped during normalization.
//!
//! A [`ContractLadder`] is owned exclusively by the connector's WS task.
//! It is seeded by a snapshot, mutated by strictly sequenced deltas, and
//! destroyed on unsubscribe, sequence gap, and disconnect.

use chrono::Utc;
use pm_arb_core::{NormalizedOrderBook, PriceLevel, Venue};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::BTreeMap;
use thiserror::Error;

/// Which native ladder a delta addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LadderSide {
    /// YES bid ladder.
    Yes,
    /// NO bid ladder.
    No,
}

/// Sequencing failures while applying deltas.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LadderError {
    /// A delta arrived out of order; local state must be discarded and the
    /// subscription reissued.
    #[error("sequence gap: expected {expected}, got {got}")]
    SequenceGap {
        /// `last_seq + 1`.
        expected: u64,
        /// Sequence number on the offending delta.
        got: u64,
    },

    /// A delta arrived before any snapshot seeded the ladder.
    #[error("delta before snapshot")]
    NoSnapshot,
}

/// Venue-native book state for one contract.
#[derive(Debug, Clone, Default)]
pub struct ContractLadder {
    yes_bids: BTreeMap<u32, Decimal>,
    no_bids: BTreeMap<u32, Decimal>,
    last_seq: Option<u64>,
}

impl ContractLadder {
    /// Creates an empty, unseeded ladder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Last applied sequence number.
    #[must_use]
    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }

    /// True once a snapshot has seeded the ladder.
    #[must_use]
    pub fn is_seeded(&self) -> bool {
        self.last_seq.is_some()
    }

    /// Replaces all state from a snapshot.
    pub fn apply_snapshot(&mut self, seq: u64, yes: &[(u32, i64)], no: &[(u32, i64)]) {
        self.yes_bids.clear();
        self.no_bids.clear();
        for &(price, qty) in yes {
            if qty > 0 && (1..=99).contains(&price) {
                self.yes_bids.insert(price, Decimal::from(qty));
            }
        }
        for &(price, qty) in no {
            if qty > 0 && (1..=99).contains(&price) {
                self.no_bids.insert(price, Decimal::from(qty));
            }
        }
        self.last_seq = Some(seq);
    }

    /// Applies one signed-quantity delta in strict sequence order.
    ///
    /// # Errors
    ///
    /// [`LadderError::NoSnapshot`] before seeding;
    /// [`LadderError::SequenceGap`] when `seq != last_seq + 1`.
    pub fn apply_delta(
        &mut self,
        seq: u64,
        side: LadderSide,
        price: u32,
        qty_delta: i64,
    ) -> Result<(), LadderError> {
        let last = self.last_seq.ok_or(LadderError::NoSnapshot)?;
        let expected = last + 1;
        if seq != expected {
            return Err(LadderError::SequenceGap { expected, got: seq });
        }
        self.last_seq = Some(seq);

        let ladder = match side {
            LadderSide::Yes => &mut self.yes_bids,
            LadderSide::No => &mut self.no_bids,
        };
        let next = ladder
            .get(&price)
            .copied()
            .unwrap_or(Decimal::ZERO)
            + Decimal::from(qty_delta);
        if next <= Decimal::ZERO {
            ladder.remove(&price);
        } else {
            ladder.insert(price, next);
        }
        Ok(())
    }

    /// Converts the ladder into the canonical form.
    #[must_use]
    pub fn to_normalized(&self, ticker: &str) -> NormalizedOrderBook {
        let yes: Vec<(u32, Decimal)> = self.yes_bids.iter().map(|(p, q)| (*p, *q)).collect();
        let no: Vec<(u32, Decimal)> = self.no_bids.iter().map(|(p, q)| (*p, *q)).collect();
        let mut book = normalize_levels(ticker, &yes, &no);
        book.sequence = self.last_seq;
        book
    }
}

/// Pure normalizer from Kalshi bid ladders to the canonical form.
///
/// `yes` and `no` are (cents, quantity) pairs in any order. YES bids at
/// `p` become canonical bids at `p/100`; NO bids at `q` become canonical
/// asks at `(100 - q)/100`. Non-positive quantities and out-of-range
/// prices are dropped.
#[must_use]
pub fn normalize_levels(
    ticker: &str,
    yes: &[(u32, Decimal)],
    no: &[(u32, Decimal)],
) -> NormalizedOrderBook {
    let mut bids: Vec<PriceLevel> = yes
        .iter()
        .filter(|(p, q)| *q > Decimal::ZERO && (1..=99).contains(p))
        .map(|(p, q)| PriceLevel::new(Decimal::from(*p) / dec!(100), *q))
        .collect();
    bids.sort_by(|a, b| b.price.cmp(&a.price));

    let mut asks: Vec<PriceLevel> = no
        .iter()
        .filter(|(p, q)| *q > Decimal::ZERO && (1..=99).contains(p))
        .map(|(q, size)| PriceLevel::new(Decimal::from(100 - *q) / dec!(100), *size))
        .collect();
    asks.sort_by(|a, b| a.price.cmp(&b.price));

    NormalizedOrderBook {
        venue: Venue::Kalshi,
        contract_id: ticker.to_string(),
        bids,
        asks,
        observed_at: Utc::now(),
        sequence: None,
        health: pm_arb_core::BookHealth::Healthy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Normalization Tests ====================

    #[test]
    fn test_yes_bids_become_canonical_bids() {
        let book = normalize_levels(
            "KXT",
            &[(40, dec!(100)), (42, dec!(50))],
            &[],
        );
        assert_eq!(book.bids.len(), 2);
        assert_eq!(book.bids[0].price, dec!(0.42));
        assert_eq!(book.bids[1].price, dec!(0.40));
        assert!(book.asks.is_empty());
    }

    #[test]
    fn test_no_bids_invert_to_asks() {
        // NO bid at 58 cents implies a YES ask at 0.42.
        let book = normalize_levels("KXT", &[], &[(58, dec!(100)), (55, dec!(25))]);
        assert_eq!(book.asks.len(), 2);
        assert_eq!(book.asks[0].price, dec!(0.42));
        assert_eq!(book.asks[1].price, dec!(0.45));
        assert_eq!(book.asks[0].size, dec!(100));
    }

    #[test]
    fn test_non_positive_quantities_dropped() {
        let book = normalize_levels(
            "KXT",
            &[(40, dec!(0)), (41, dec!(-5)), (42, dec!(10))],
            &[(58, dec!(0))],
        );
        assert_eq!(book.bids.len(), 1);
        assert!(book.asks.is_empty());
    }

    #[test]
    fn test_out_of_range_cents_dropped() {
        let book = normalize_levels("KXT", &[(0, dec!(10)), (100, dec!(10))], &[]);
        assert!(book.bids.is_empty());
    }

    #[test]
    fn test_normalized_output_validates() {
        let book = normalize_levels(
            "KXT",
            &[(40, dec!(100)), (39, dec!(50))],
            &[(58, dec!(100)), (57, dec!(25))],
        );
        assert!(book.validate().is_ok());
        assert_eq!(book.best_bid(), Some(dec!(0.40)));
        assert_eq!(book.best_ask(), Some(dec!(0.42)));
    }

    // ==================== Ladder Tests ====================

    #[test]
    fn test_snapshot_seeds_state() {
        let mut ladder = ContractLadder::new();
        assert!(!ladder.is_seeded());
        ladder.apply_snapshot(10, &[(40, 100)], &[(58, 100)]);
        assert!(ladder.is_seeded());
        assert_eq!(ladder.last_seq(), Some(10));
    }

    #[test]
    fn test_delta_before_snapshot_rejected() {
        let mut ladder = ContractLadder::new();
        let err = ladder.apply_delta(1, LadderSide::Yes, 40, 10).unwrap_err();
        assert_eq!(err, LadderError::NoSnapshot);
    }

    #[test]
    fn test_in_sequence_deltas_apply() {
        let mut ladder = ContractLadder::new();
        ladder.apply_snapshot(10, &[(40, 100)], &[(58, 100)]);
        ladder.apply_delta(11, LadderSide::Yes, 40, 25).unwrap();
        ladder.apply_delta(12, LadderSide::No, 58, -40).unwrap();

        let book = ladder.to_normalized("KXT");
        assert_eq!(book.best_bid_size(), Some(dec!(125)));
        assert_eq!(book.best_ask_size(), Some(dec!(60)));
        assert_eq!(book.sequence, Some(12));
    }

    #[test]
    fn test_delta_to_zero_removes_level() {
        let mut ladder = ContractLadder::new();
        ladder.apply_snapshot(1, &[(40, 100)], &[]);
        ladder.apply_delta(2, LadderSide::Yes, 40, -100).unwrap();
        assert!(ladder.to_normalized("KXT").bids.is_empty());
    }

    #[test]
    fn test_delta_below_zero_removes_level() {
        let mut ladder = ContractLadder::new();
        ladder.apply_snapshot(1, &[(40, 100)], &[]);
        ladder.apply_delta(2, LadderSide::Yes, 40, -150).unwrap();
        assert!(ladder.to_normalized("KXT").bids.is_empty());
    }

    #[test]
    fn test_sequence_gap_detected() {
        let mut ladder = ContractLadder::new();
        ladder.apply_snapshot(10, &[(40, 100)], &[]);
        let err = ladder.apply_delta(12, LadderSide::Yes, 40, 10).unwrap_err();
        assert_eq!(
            err,
            LadderError::SequenceGap {
                expected: 11,
                got: 12
            }
        );
    }

    #[test]
    fn test_replayed_delta_detected_as_gap() {
        let mut ladder = ContractLadder::new();
        ladder.apply_snapshot(10, &[(40, 100)], &[]);
        ladder.apply_delta(11, LadderSide::Yes, 40, 10).unwrap();
        let err = ladder.apply_delta(11, LadderSide::Yes, 40, 10).unwrap_err();
        assert!(matches!(err, LadderError::SequenceGap { .. }));
    }

    #[test]
    fn test_deltas_equal_folded_snapshot() {
        // Applying deltas one by one must match a snapshot with the deltas
        // already folded in.
        let mut streamed = ContractLadder::new();
        streamed.apply_snapshot(1, &[(40, 100), (39, 50)], &[(58, 80)]);
        streamed.apply_delta(2, LadderSide::Yes, 40, -30).unwrap();
        streamed.apply_delta(3, LadderSide::Yes, 41, 20).unwrap();
        streamed.apply_delta(4, LadderSide::No, 58, -80).unwrap();
        streamed.apply_delta(5, LadderSide::No, 57, 60).unwrap();

        let mut folded = ContractLadder::new();
        folded.apply_snapshot(5, &[(40, 70), (39, 50), (41, 20)], &[(57, 60)]);

        assert_eq!(
            streamed.to_normalized("KXT").bids,
            folded.to_normalized("KXT").bids
        );
        assert_eq!(
            streamed.to_normalized("KXT").asks,
            folded.to_normalized("KXT").asks
        );
    }
}
