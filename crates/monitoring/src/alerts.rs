//! Alert fan-out.
//!
//! Classifies every event into a closed severity set, routes critical and
//! warning alerts to the external channel, and delivers info alerts only
//! from an explicit allow-list. Failed deliveries land in a bounded
//! priority buffer (severity first, oldest first within a severity, the
//! lowest-priority oldest evicted on overflow) behind a circuit breaker.
//! Auditing is not this module's job: the audit log's wildcard bus feed
//! records every event regardless of routing.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use pm_arb_core::events::names;
use pm_arb_core::EventEnvelope;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

// =============================================================================
// Severity classification
// =============================================================================

/// Alert severity, ordered lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Default tier.
    Info,
    /// Degraded but operating.
    Warning,
    /// Requires operator attention.
    Critical,
}

impl Severity {
    /// Canonical lowercase form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// Events classified critical.
const CRITICAL_EVENTS: &[&str] = &[
    "execution.single_leg.exposure",
    "risk.limit.breached",
    "trading.halted",
    names::SYSTEM_HEALTH_CRITICAL,
    "reconciliation.discrepancy",
    names::TIME_DRIFT_HALT,
];

/// Events classified warning.
const WARNING_EVENTS: &[&str] = &[
    "execution.failed",
    "risk.limit.approached",
    "platform.health.degraded",
    "time.drift.critical",
    "time.drift.warning",
    names::DEGRADATION_ACTIVATED,
];

/// Info events that still go to the external channel.
const INFO_DELIVERABLE: &[&str] = &[
    "execution.order.filled",
    "execution.exit.triggered",
    names::OPPORTUNITY_IDENTIFIED,
    "platform.recovered",
    "trading.resumed",
    "execution.single_leg.resolved",
];

/// Classifies an event name into the closed severity set.
#[must_use]
pub fn classify(event_type: &str) -> Severity {
    if CRITICAL_EVENTS.contains(&event_type) {
        Severity::Critical
    } else if WARNING_EVENTS.contains(&event_type) {
        Severity::Warning
    } else {
        Severity::Info
    }
}

/// True for info events on the delivery allow-list.
#[must_use]
pub fn info_deliverable(event_type: &str) -> bool {
    INFO_DELIVERABLE.contains(&event_type)
}

// =============================================================================
// Configuration
// =============================================================================

/// Delivery pipeline settings.
#[derive(Debug, Clone)]
pub struct AlertServiceConfig {
    /// Single-recipient webhook URL.
    pub webhook_url: String,
    /// Priority buffer capacity.
    pub buffer_capacity: usize,
    /// Consecutive failures before the breaker opens.
    pub break_after_failures: u32,
    /// Base open duration; a longer server retry-after wins.
    pub break_duration: Duration,
    /// Per-request delivery timeout.
    pub request_timeout: Duration,
    /// Delay between drained messages.
    pub drain_delay: Duration,
    /// Send attempts per message during a drain.
    pub drain_retries: u32,
}

impl AlertServiceConfig {
    /// Builds the pipeline config from the engine-level alert section.
    #[must_use]
    pub fn from_engine(config: &pm_arb_core::config::AlertConfig) -> Self {
        Self {
            webhook_url: config.webhook_url.clone(),
            buffer_capacity: config.buffer_capacity,
            break_after_failures: config.break_after_failures,
            break_duration: Duration::from_secs(config.circuit_break_secs),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            drain_delay: Duration::from_secs(1),
            drain_retries: 2,
        }
    }
}

// =============================================================================
// Circuit breaker
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerPhase {
    Closed,
    Open { until: Instant },
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    phase: BreakerPhase,
    consecutive_failures: u32,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            phase: BreakerPhase::Closed,
            consecutive_failures: 0,
        }
    }

    fn can_attempt(&mut self) -> bool {
        match self.phase {
            BreakerPhase::Closed | BreakerPhase::HalfOpen => true,
            BreakerPhase::Open { until } => {
                if Instant::now() >= until {
                    self.phase = BreakerPhase::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn on_success(&mut self) {
        self.phase = BreakerPhase::Closed;
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self, threshold: u32, base: Duration, retry_after: Option<Duration>) {
        self.consecutive_failures += 1;
        let reopen = matches!(self.phase, BreakerPhase::HalfOpen);
        if reopen || self.consecutive_failures >= threshold {
            let hold = retry_after.filter(|ra| *ra > base).unwrap_or(base);
            self.phase = BreakerPhase::Open {
                until: Instant::now() + hold,
            };
        }
    }
}

// =============================================================================
// Alert service
// =============================================================================

/// One queued or in-flight alert.
#[derive(Debug, Clone)]
pub struct AlertMessage {
    /// Classified severity.
    pub severity: Severity,
    /// Source event name.
    pub event_type: String,
    /// Rendered message body.
    pub body: String,
    /// When the alert entered the pipeline.
    pub queued_at: DateTime<Utc>,
}

struct SendFailure {
    retry_after: Option<Duration>,
    detail: String,
}

/// Buffered, circuit-broken delivery to a single external recipient.
pub struct AlertService {
    config: AlertServiceConfig,
    http: reqwest::Client,
    buffer: Mutex<Vec<AlertMessage>>,
    breaker: Mutex<BreakerState>,
    delivering: AtomicBool,
}

impl AlertService {
    /// Builds the service.
    ///
    /// # Panics
    ///
    /// Panics only if the TLS backend cannot initialize, which is a
    /// startup-fatal condition anyway.
    #[must_use]
    pub fn new(config: AlertServiceConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .expect("HTTP client construction");
        Self {
            config,
            http,
            buffer: Mutex::new(Vec::new()),
            breaker: Mutex::new(BreakerState::new()),
            delivering: AtomicBool::new(false),
        }
    }

    /// Messages currently buffered.
    #[must_use]
    pub fn buffer_len(&self) -> usize {
        self.buffer.lock().len()
    }

    /// True while the delivery breaker refuses attempts.
    #[must_use]
    pub fn breaker_open(&self) -> bool {
        matches!(self.breaker.lock().phase, BreakerPhase::Open { .. })
    }

    /// Routes one event through classification and delivery.
    ///
    /// Critical and warning alerts always attempt delivery; info alerts
    /// only when allow-listed. Everything else is dropped here (the audit
    /// feed has already recorded it).
    pub async fn notify(&self, event: &EventEnvelope) {
        let severity = classify(&event.event_type);
        if severity == Severity::Info && !info_deliverable(&event.event_type) {
            debug!(event_type = %event.event_type, "info event not on allow-list, not delivered");
            return;
        }

        let message = AlertMessage {
            severity,
            event_type: event.event_type.clone(),
            body: render_body(severity, event),
            queued_at: Utc::now(),
        };
        self.deliver(message).await;
    }

    async fn deliver(&self, message: AlertMessage) {
        // A failing delivery publishes error events of its own; the guard
        // keeps those from re-entering delivery recursively.
        if self.delivering.swap(true, Ordering::SeqCst) {
            self.enqueue(message);
            return;
        }

        if !self.breaker.lock().can_attempt() {
            self.enqueue(message);
            self.delivering.store(false, Ordering::SeqCst);
            return;
        }

        match self.send_once(&message).await {
            Ok(()) => {
                self.breaker.lock().on_success();
                self.drain().await;
            }
            Err(failure) => {
                warn!(
                    event_type = %message.event_type,
                    detail = %failure.detail,
                    "alert delivery failed, buffering"
                );
                self.breaker.lock().on_failure(
                    self.config.break_after_failures,
                    self.config.break_duration,
                    failure.retry_after,
                );
                self.enqueue(message);
            }
        }
        self.delivering.store(false, Ordering::SeqCst);
    }

    /// Buffers a message, evicting the lowest-priority oldest on overflow.
    fn enqueue(&self, message: AlertMessage) {
        let mut buffer = self.buffer.lock();
        if buffer.len() >= self.config.buffer_capacity {
            if let Some(evict) = buffer
                .iter()
                .enumerate()
                .min_by_key(|(_, m)| (m.severity, m.queued_at))
                .map(|(i, _)| i)
            {
                let dropped = buffer.remove(evict);
                warn!(
                    event_type = %dropped.event_type,
                    severity = dropped.severity.as_str(),
                    "alert buffer full, evicted lowest-priority oldest"
                );
            }
        }
        buffer.push(message);
    }

    /// Sends buffered messages, highest priority first, with bounded
    /// retries and an inter-message delay.
    async fn drain(&self) {
        loop {
            let next = {
                let mut buffer = self.buffer.lock();
                if buffer.is_empty() {
                    return;
                }
                // Highest severity first; FIFO within a severity.
                let index = buffer
                    .iter()
                    .enumerate()
                    .max_by(|(_, a), (_, b)| {
                        a.severity
                            .cmp(&b.severity)
                            .then(b.queued_at.cmp(&a.queued_at))
                    })
                    .map(|(i, _)| i)
                    .unwrap_or(0);
                buffer.remove(index)
            };

            let mut delivered = false;
            for _ in 0..self.config.drain_retries.max(1) {
                if !self.breaker.lock().can_attempt() {
                    break;
                }
                match self.send_once(&next).await {
                    Ok(()) => {
                        self.breaker.lock().on_success();
                        delivered = true;
                        break;
                    }
                    Err(failure) => {
                        self.breaker.lock().on_failure(
                            self.config.break_after_failures,
                            self.config.break_duration,
                            failure.retry_after,
                        );
                    }
                }
            }

            if !delivered {
                // Put it back and stop draining until the next success.
                self.enqueue(next);
                return;
            }
            info!("drained one buffered alert");
            tokio::time::sleep(self.config.drain_delay).await;
        }
    }

    async fn send_once(&self, message: &AlertMessage) -> Result<(), SendFailure> {
        let response = self
            .http
            .post(&self.config.webhook_url)
            .json(&serde_json::json!({ "text": message.body }))
            .send()
            .await
            .map_err(|e| SendFailure {
                retry_after: None,
                detail: e.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let retry_after = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs);
        Err(SendFailure {
            retry_after,
            detail: format!("HTTP {status}"),
        })
    }
}

fn render_body(severity: Severity, event: &EventEnvelope) -> String {
    format!(
        "[{}] {} ({}): {}",
        severity.as_str().to_uppercase(),
        event.event_type,
        event.module,
        event.payload
    )
}
