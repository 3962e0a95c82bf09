//! Venue identity.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// The two venues tracked by the engine.
///
/// The canonical lowercase form from [`Venue::as_str`] is used in logs,
/// persistence keys, and health lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Venue {
    /// Kalshi (integer-cent price space, RSA-PSS auth).
    Kalshi,
    /// Polymarket CLOB (decimal price space, L2 HMAC auth).
    Polymarket,
}

impl Venue {
    /// All tracked venues.
    pub const ALL: [Venue; 2] = [Venue::Kalshi, Venue::Polymarket];

    /// Canonical lowercase identifier.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Kalshi => "kalshi",
            Self::Polymarket => "polymarket",
        }
    }

    /// The opposite leg of a two-venue pair.
    #[must_use]
    pub const fn other(self) -> Venue {
        match self {
            Self::Kalshi => Self::Polymarket,
            Self::Polymarket => Self::Kalshi,
        }
    }
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown venue name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown venue: {0}")]
pub struct VenueParseError(pub String);

impl FromStr for Venue {
    type Err = VenueParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "kalshi" => Ok(Self::Kalshi),
            "polymarket" => Ok(Self::Polymarket),
            other => Err(VenueParseError(other.to_string())),
        }
    }
}
