//! Tracked contract pairs.
//!
//! A pair binds one Kalshi market to the economically equivalent
//! Polymarket token pair. The registry is loaded once at startup and
//! shared immutable for the life of the process.

use crate::venue::Venue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One operator-verified cross-venue contract pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractPair {
    /// Kalshi market ticker.
    pub kalshi_ticker: String,
    /// Polymarket YES token id.
    pub polymarket_token_id: String,
    /// Polymarket NO token id.
    pub polymarket_no_token_id: String,
    /// Human description of the underlying event.
    pub description: String,
    /// When an operator last verified the pairing.
    pub verified_at: DateTime<Utc>,
    /// Leg treated as primary for sizing decisions downstream.
    pub primary_leg: Venue,
}

impl ContractPair {
    /// The contract id for the given leg's book fetch.
    #[must_use]
    pub fn contract_id(&self, venue: Venue) -> &str {
        match venue {
            Venue::Kalshi => &self.kalshi_ticker,
            Venue::Polymarket => &self.polymarket_token_id,
        }
    }
}

/// Validation failures for the pair configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PairConfigError {
    /// A contract id was empty.
    #[error("pair {index}: empty {field}")]
    EmptyField {
        /// Zero-based pair index.
        index: usize,
        /// Name of the empty field.
        field: &'static str,
    },

    /// Two pairs reference the same Kalshi ticker.
    #[error("duplicate kalshi ticker: {ticker}")]
    DuplicateTicker {
        /// The repeated ticker.
        ticker: String,
    },
}

/// Immutable registry of tracked pairs.
#[derive(Debug, Clone)]
pub struct PairRegistry {
    pairs: Vec<ContractPair>,
}

impl PairRegistry {
    /// Validates and seals the pair list.
    ///
    /// # Errors
    ///
    /// Any pair with an empty contract id, or a duplicated Kalshi ticker,
    /// fails startup.
    pub fn new(pairs: Vec<ContractPair>) -> Result<Self, PairConfigError> {
        let mut seen = std::collections::HashSet::new();
        for (index, pair) in pairs.iter().enumerate() {
            for (field, value) in [
                ("kalshi_ticker", &pair.kalshi_ticker),
                ("polymarket_token_id", &pair.polymarket_token_id),
                ("polymarket_no_token_id", &pair.polymarket_no_token_id),
            ] {
                if value.is_empty() {
                    return Err(PairConfigError::EmptyField { index, field });
                }
            }
            if !seen.insert(pair.kalshi_ticker.clone()) {
                return Err(PairConfigError::DuplicateTicker {
                    ticker: pair.kalshi_ticker.clone(),
                });
            }
        }
        Ok(Self { pairs })
    }

    /// All tracked pairs.
    #[must_use]
    pub fn pairs(&self) -> &[ContractPair] {
        &self.pairs
    }

    /// Number of tracked pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// True when no pairs are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Contract ids to track on the given venue, in pair order.
    #[must_use]
    pub fn contract_ids(&self, venue: Venue) -> Vec<String> {
        self.pairs
            .iter()
            .map(|p| p.contract_id(venue).to_string())
            .collect()
    }
}
