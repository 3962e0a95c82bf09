//! Engine configuration.
//!
//! Environment-keyed and validated once at startup; shared immutable
//! afterwards. Invalid values are fatal.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Fatal configuration failures at startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A required environment variable is absent.
    #[error("missing environment variable: {0}")]
    MissingVar(String),

    /// A value failed to parse.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Environment key.
        key: String,
        /// Offending raw value.
        value: String,
    },

    /// A parsed value violated a domain constraint.
    #[error("constraint violated for {key}: {message}")]
    Constraint {
        /// Environment key.
        key: String,
        /// Violated constraint.
        message: String,
    },
}

/// Kalshi connectivity settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KalshiConfig {
    /// REST base URL (e.g. `https://api.elections.kalshi.com/trade-api/v2`).
    pub base_url: String,
    /// WS URL (e.g. `wss://api.elections.kalshi.com/trade-api/v2/ws`).
    pub ws_url: String,
    /// Environment variable holding the API key id.
    pub api_key_env: String,
    /// Environment variable holding the PEM private key.
    pub private_key_env: String,
}

/// Polymarket connectivity settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolymarketConfig {
    /// CLOB REST base URL.
    pub base_url: String,
    /// Market-channel WS URL.
    pub ws_url: String,
    /// Environment variable holding the EOA private key.
    pub private_key_env: String,
}

/// Detection and edge-calculation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Minimum net edge before degradation widening.
    pub min_edge: Decimal,
    /// Estimated gas per Polymarket trade, USD.
    pub gas_estimate_usd: Decimal,
    /// Nominal position size used to pro-rate gas, USD.
    pub position_size_usd: Decimal,
    /// Threshold widening multiplier applied while the other venue is
    /// degraded.
    pub degradation_multiplier: Decimal,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            min_edge: dec!(0.008),
            gas_estimate_usd: dec!(0.01),
            position_size_usd: dec!(100),
            degradation_multiplier: dec!(1.5),
        }
    }
}

/// Alert delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Single-recipient webhook URL.
    pub webhook_url: String,
    /// Priority buffer capacity.
    pub buffer_capacity: usize,
    /// Consecutive failures before the delivery breaker opens.
    pub break_after_failures: u32,
    /// Base open duration of the delivery breaker, seconds.
    pub circuit_break_secs: u64,
    /// Per-request delivery timeout, seconds.
    pub request_timeout_secs: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            webhook_url: String::new(),
            buffer_capacity: 100,
            break_after_failures: 5,
            circuit_break_secs: 60,
            request_timeout_secs: 2,
        }
    }
}

/// Persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Postgres connection URL.
    pub url: String,
    /// Pool size.
    pub max_connections: u32,
}

/// Top-level validated configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Kalshi connectivity.
    pub kalshi: KalshiConfig,
    /// Polymarket connectivity.
    pub polymarket: PolymarketConfig,
    /// Detection thresholds.
    pub detection: DetectionConfig,
    /// Alert delivery.
    pub alerts: AlertConfig,
    /// Persistence.
    pub database: DatabaseConfig,
}

fn var(key: &str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::MissingVar(key.to_string()))
}

fn var_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_decimal(key: &str, raw: &str) -> Result<Decimal, ConfigError> {
    Decimal::from_str(raw).map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: raw.to_string(),
    })
}

impl EngineConfig {
    /// Loads and validates configuration from the environment.
    ///
    /// # Errors
    ///
    /// Any missing, unparsable, or constraint-violating value is fatal.
    pub fn from_env() -> Result<Self, ConfigError> {
        let detection = DetectionConfig {
            min_edge: parse_decimal("ARB_MIN_EDGE", &var_or("ARB_MIN_EDGE", "0.008"))?,
            gas_estimate_usd: parse_decimal(
                "ARB_GAS_ESTIMATE_USD",
                &var_or("ARB_GAS_ESTIMATE_USD", "0.01"),
            )?,
            position_size_usd: parse_decimal(
                "ARB_POSITION_SIZE_USD",
                &var_or("ARB_POSITION_SIZE_USD", "100"),
            )?,
            degradation_multiplier: parse_decimal(
                "ARB_DEGRADATION_MULTIPLIER",
                &var_or("ARB_DEGRADATION_MULTIPLIER", "1.5"),
            )?,
        };

        let alerts = AlertConfig {
            webhook_url: var("ARB_ALERT_WEBHOOK_URL")?,
            buffer_capacity: var_or("ARB_ALERT_BUFFER_CAPACITY", "100")
                .parse()
                .map_err(|_| ConfigError::InvalidValue {
                    key: "ARB_ALERT_BUFFER_CAPACITY".into(),
                    value: var_or("ARB_ALERT_BUFFER_CAPACITY", "100"),
                })?,
            break_after_failures: var_or("ARB_ALERT_BREAK_AFTER", "5").parse().map_err(|_| {
                ConfigError::InvalidValue {
                    key: "ARB_ALERT_BREAK_AFTER".into(),
                    value: var_or("ARB_ALERT_BREAK_AFTER", "5"),
                }
            })?,
            circuit_break_secs: var_or("ARB_ALERT_BREAK_SECS", "60").parse().map_err(|_| {
                ConfigError::InvalidValue {
                    key: "ARB_ALERT_BREAK_SECS".into(),
                    value: var_or("ARB_ALERT_BREAK_SECS", "60"),
                }
            })?,
            request_timeout_secs: var_or("ARB_ALERT_TIMEOUT_SECS", "2").parse().map_err(
                |_| ConfigError::InvalidValue {
                    key: "ARB_ALERT_TIMEOUT_SECS".into(),
                    value: var_or("ARB_ALERT_TIMEOUT_SECS", "2"),
                },
            )?,
        };

        let config = Self {
            kalshi: KalshiConfig {
                base_url: var_or(
                    "KALSHI_BASE_URL",
                    "https://api.elections.kalshi.com/trade-api/v2",
                ),
                ws_url: var_or(
                    "KALSHI_WS_URL",
                    "wss://api.elections.kalshi.com/trade-api/v2/ws",
                ),
                api_key_env: var_or("KALSHI_API_KEY_ENV", "KALSHI_API_KEY"),
                private_key_env: var_or("KALSHI_PRIVATE_KEY_ENV", "KALSHI_PRIVATE_KEY"),
            },
            polymarket: PolymarketConfig {
                base_url: var_or("POLYMARKET_BASE_URL", "https://clob.polymarket.com"),
                ws_url: var_or(
                    "POLYMARKET_WS_URL",
                    "wss://ws-subscriptions-clob.polymarket.com/ws/market",
                ),
                private_key_env: var_or("POLYMARKET_PRIVATE_KEY_ENV", "POLYMARKET_PRIVATE_KEY"),
            },
            detection,
            alerts,
            database: DatabaseConfig {
                url: var("DATABASE_URL")?,
                max_connections: var_or("DATABASE_MAX_CONNECTIONS", "10").parse().map_err(
                    |_| ConfigError::InvalidValue {
                        key: "DATABASE_MAX_CONNECTIONS".into(),
                        value: var_or("DATABASE_MAX_CONNECTIONS", "10"),
                    },
                )?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Checks domain constraints on an assembled configuration.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.detection.min_edge <= Decimal::ZERO {
            return Err(ConfigError::Constraint {
                key: "ARB_MIN_EDGE".into(),
                message: "minimum edge must be positive".into(),
            });
        }
        if self.detection.position_size_usd <= Decimal::ZERO {
            return Err(ConfigError::Constraint {
                key: "ARB_POSITION_SIZE_USD".into(),
                message: "position size must be positive".into(),
            });
        }
        if self.detection.gas_estimate_usd < Decimal::ZERO {
            return Err(ConfigError::Constraint {
                key: "ARB_GAS_ESTIMATE_USD".into(),
                message: "gas estimate cannot be negative".into(),
            });
        }
        if self.detection.degradation_multiplier < Decimal::ONE {
            return Err(ConfigError::Constraint {
                key: "ARB_DEGRADATION_MULTIPLIER".into(),
                message: "multiplier below 1 would narrow the threshold".into(),
            });
        }
        if self.alerts.buffer_capacity == 0 {
            return Err(ConfigError::Constraint {
                key: "ARB_ALERT_BUFFER_CAPACITY".into(),
                message: "buffer capacity must be positive".into(),
            });
        }
        for (key, url) in [
            ("KALSHI_BASE_URL", &self.kalshi.base_url),
            ("KALSHI_WS_URL", &self.kalshi.ws_url),
            ("POLYMARKET_BASE_URL", &self.polymarket.base_url),
            ("POLYMARKET_WS_URL", &self.polymarket.ws_url),
        ] {
            if url.is_empty() {
                return Err(ConfigError::Constraint {
                    key: key.into(),
                    message: "URL cannot be empty".into(),
                });
            }
        }
        Ok(())
    }
}
