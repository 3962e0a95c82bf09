//! Fixed-precision helpers for prices, edges, and fees.
//!
//! All money and probability arithmetic in the engine uses `rust_decimal`;
//! venue-native integer cents and decimal strings are converted exactly at
//! the connector boundary. Division rounds half to even.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

/// Significant digits kept after a division.
const DIV_SCALE: u32 = 20;

/// Divides `numerator / denominator`, rounding half to even at 20 digits.
///
/// Returns `None` when the denominator is zero.
#[must_use]
pub fn div_half_even(numerator: Decimal, denominator: Decimal) -> Option<Decimal> {
    if denominator.is_zero() {
        return None;
    }
    Some(
        (numerator / denominator)
            .round_dp_with_strategy(DIV_SCALE, RoundingStrategy::MidpointNearestEven),
    )
}

/// Converts a percentage figure (e.g. `7` for 7%) to a fraction.
#[must_use]
pub fn pct_to_fraction(percent: Decimal) -> Decimal {
    percent / dec!(100)
}

/// Converts Kalshi integer cents (1..=99) to a probability price.
#[must_use]
pub fn from_cents(cents: u32) -> Decimal {
    Decimal::from(cents) / dec!(100)
}

/// Converts a probability price back to integer cents.
///
/// Exact for prices produced by [`from_cents`]; other values round half to
/// even.
#[must_use]
pub fn to_cents(price: Decimal) -> u32 {
    (price * dec!(100))
        .round_dp_with_strategy(0, RoundingStrategy::MidpointNearestEven)
        .to_u32()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cents_round_trip_identity() {
        for cents in 1..=99u32 {
            assert_eq!(to_cents(from_cents(cents)), cents, "cents {cents}");
        }
    }

    #[test]
    fn test_from_cents_exact() {
        assert_eq!(from_cents(42), dec!(0.42));
        assert_eq!(from_cents(1), dec!(0.01));
        assert_eq!(from_cents(99), dec!(0.99));
    }

    #[test]
    fn test_div_half_even_rounds_midpoint_to_even() {
        // 0.000...05 midpoints round to the even neighbor.
        let q = div_half_even(dec!(1), dec!(3)).unwrap();
        assert_eq!(q.scale(), 20);
        assert!(q > dec!(0.3333333) && q < dec!(0.3333334));
    }

    #[test]
    fn test_div_by_zero_is_none() {
        assert!(div_half_even(dec!(1), Decimal::ZERO).is_none());
    }

    #[test]
    fn test_pct_to_fraction() {
        assert_eq!(pct_to_fraction(dec!(7)), dec!(0.07));
        assert_eq!(pct_to_fraction(dec!(0.5)), dec!(0.005));
    }
}
