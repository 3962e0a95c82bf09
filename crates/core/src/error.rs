//! Platform error taxonomy.
//!
//! Every connector call-site maps transport, auth, and protocol failures
//! into a [`PlatformError`]. Each variant carries a stable numeric code:
//! the 1000 range for platform/API errors (with a +100 offset for
//! Polymarket), and the 4000 range for system-health errors.

use crate::venue::Venue;
use std::fmt;
use thiserror::Error;

/// Stable numeric error code carried in structured logs and alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ErrorCode(pub u16);

impl ErrorCode {
    /// Ten consecutive persistence write failures.
    pub const PERSISTENCE_FAILURE_STREAK: ErrorCode = ErrorCode(4005);
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors surfaced from a venue connector.
#[derive(Debug, Error)]
pub enum PlatformError {
    /// Credentials rejected or signature invalid. Never retried; the owning
    /// venue is degraded immediately.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Venue rate limit hit.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited {
        /// Server-provided retry delay.
        retry_after_secs: u64,
    },

    /// Contract does not exist on the venue.
    #[error("market not found: {contract_id}")]
    MarketNotFound {
        /// The missing contract identifier.
        contract_id: String,
    },

    /// Request rejected as malformed by the venue.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Deriving API credentials returned empty or invalid material.
    #[error("credential derivation failed: {0}")]
    CredentialDerivation(String),

    /// Operation requires a live transport that is not connected.
    #[error("not connected")]
    NotConnected,

    /// Venue does not support the operation.
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    /// Transport-level network failure.
    #[error("network error: {0}")]
    Network(String),

    /// Per-call timeout elapsed.
    #[error("request timeout: {0}")]
    Timeout(String),

    /// Protocol violation: sequence gap, malformed frame, or a book that
    /// failed canonical validation.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Observed data older than the staleness bound at emit time.
    #[error("stale data: {age_secs}s old")]
    Stale {
        /// Observed age in seconds.
        age_secs: i64,
    },
}

impl PlatformError {
    /// Numeric code within the venue's offset of the 1000 range.
    #[must_use]
    pub fn code(&self, venue: Venue) -> ErrorCode {
        let base = match self {
            Self::Unauthorized(_) => 1001,
            Self::RateLimited { .. } => 1002,
            Self::MarketNotFound { .. } => 1003,
            Self::InvalidRequest(_) => 1004,
            Self::CredentialDerivation(_) => 1005,
            Self::NotConnected => 1006,
            Self::NotImplemented(_) => 1007,
            Self::Network(_) => 1008,
            Self::Timeout(_) => 1009,
            Self::Protocol(_) => 1010,
            Self::Stale { .. } => 1011,
        };
        let offset = match venue {
            Venue::Kalshi => 0,
            Venue::Polymarket => 100,
        };
        ErrorCode(base + offset)
    }

    /// True for errors the retry combinator may attempt again.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout(_) | Self::RateLimited { .. }
        )
    }

    /// True for failures expected to clear on their own.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_)
                | Self::Timeout(_)
                | Self::RateLimited { .. }
                | Self::NotConnected
                | Self::Stale { .. }
        )
    }

    /// Server-suggested retry delay, when one applies.
    #[must_use]
    pub fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            Self::Network(_) | Self::Timeout(_) => Some(1),
            _ => None,
        }
    }
}

/// Result alias for connector operations.
pub type PlatformResult<T> = Result<T, PlatformError>;
