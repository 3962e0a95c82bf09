//! Kalshi WebSocket stream.
//!
//! Maintains per-contract ladders from `orderbook_snapshot` and
//! `orderbook_delta` frames, emitting a normalized book after every applied
//! message. Deltas apply in strict sequence order; a gap discards the
//! contract's local state and reissues the subscription to force a fresh
//! snapshot. Pings go out every 30 s; a missing pong within 10 s tears the
//! socket down for the reconnect loop, which backs off exponentially with
//! 0.5x-1.5x jitter and resubscribes everything on success.

use crate::auth::KalshiAuth;
use crate::ladder::{ContractLadder, LadderError, LadderSide};
use futures_util::{Sink, SinkExt, StreamExt};
use pm_arb_core::{ConnectorEvent, PlatformError, RetryPolicy, TransportSignal, Venue};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

/// Budget for sequence-gap resyncs before the stream reports a storm.
#[derive(Debug, Clone)]
pub struct ResyncPolicy {
    /// Resyncs tolerated inside the window.
    pub max_resyncs: u32,
    /// Sliding window length.
    pub window: Duration,
}

impl Default for ResyncPolicy {
    fn default() -> Self {
        Self {
            max_resyncs: 3,
            window: Duration::from_secs(60),
        }
    }
}

/// Configuration for the WS transport.
#[derive(Debug, Clone)]
pub struct KalshiWsConfig {
    /// WS URL including the `/trade-api/v2/ws` path.
    pub ws_url: String,
    /// Handshake deadline.
    pub connect_timeout: Duration,
    /// Keepalive ping cadence.
    pub ping_interval: Duration,
    /// Pong deadline after a ping.
    pub pong_timeout: Duration,
    /// Reconnect backoff bounds.
    pub reconnect: RetryPolicy,
    /// Maximum reconnect attempts (0 = unlimited).
    pub max_reconnect_attempts: u32,
    /// Resync storm budget.
    pub resync_policy: ResyncPolicy,
}

impl Default for KalshiWsConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://api.elections.kalshi.com/trade-api/v2/ws".to_string(),
            connect_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            reconnect: RetryPolicy::new(0, Duration::from_secs(1), Duration::from_secs(30)),
            max_reconnect_attempts: 0,
            resync_policy: ResyncPolicy::default(),
        }
    }
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Serialize)]
struct CommandFrame<'a> {
    id: u64,
    cmd: &'static str,
    params: CommandParams<'a>,
}

#[derive(Debug, Serialize)]
struct CommandParams<'a> {
    channels: [&'static str; 1],
    market_ticker: &'a str,
}

#[derive(Debug, Deserialize)]
struct WsFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    seq: Option<u64>,
    #[serde(default)]
    msg: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct SnapshotMsg {
    market_ticker: String,
    #[serde(default)]
    yes: Vec<[i64; 2]>,
    #[serde(default)]
    no: Vec<[i64; 2]>,
}

#[derive(Debug, Deserialize)]
struct DeltaMsg {
    market_ticker: String,
    price: u32,
    delta: i64,
    side: String,
}

// =============================================================================
// Handle
// =============================================================================

/// Handle to the spawned WS task.
pub struct KalshiWs {
    subscriptions: Arc<parking_lot::RwLock<HashSet<String>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl KalshiWs {
    /// Spawns the connection task for the given tickers.
    ///
    /// Book updates and transport signals are delivered on `events`.
    #[must_use]
    pub fn spawn(
        config: KalshiWsConfig,
        auth: Arc<KalshiAuth>,
        tickers: Vec<String>,
        events: mpsc::Sender<ConnectorEvent>,
    ) -> Self {
        let subscriptions = Arc::new(parking_lot::RwLock::new(
            tickers.into_iter().collect::<HashSet<_>>(),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(run_connection_loop(
            config,
            auth,
            Arc::clone(&subscriptions),
            events,
            shutdown_rx,
        ));

        Self {
            subscriptions,
            shutdown_tx,
        }
    }

    /// Tickers currently in the subscription set.
    #[must_use]
    pub fn subscribed(&self) -> Vec<String> {
        self.subscriptions.read().iter().cloned().collect()
    }

    /// Signals the connection task to close with a normal close frame.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

// =============================================================================
// Connection loop
// =============================================================================

async fn run_connection_loop(
    config: KalshiWsConfig,
    auth: Arc<KalshiAuth>,
    subscriptions: Arc<parking_lot::RwLock<HashSet<String>>>,
    events: mpsc::Sender<ConnectorEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let command_id = AtomicU64::new(1);
    let mut attempts: u32 = 0;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        info!(url = %config.ws_url, "connecting Kalshi WebSocket");
        match connect_and_run(
            &config,
            &auth,
            &subscriptions,
            &events,
            &command_id,
            &mut shutdown_rx,
        )
        .await
        {
            Ok(()) => {
                info!("Kalshi WebSocket closed cleanly");
                break;
            }
            Err(e) => {
                attempts += 1;
                error!(error = %e, attempt = attempts, "Kalshi WebSocket dropped");
                let _ = events
                    .send(ConnectorEvent::Transport {
                        venue: Venue::Kalshi,
                        signal: TransportSignal::Disconnected {
                            reason: e.to_string(),
                        },
                    })
                    .await;

                if matches!(e, PlatformError::Unauthorized(_)) {
                    let _ = events
                        .send(ConnectorEvent::Transport {
                            venue: Venue::Kalshi,
                            signal: TransportSignal::AuthFailed {
                                reason: e.to_string(),
                            },
                        })
                        .await;
                    break;
                }
                if config.max_reconnect_attempts > 0 && attempts >= config.max_reconnect_attempts {
                    error!("Kalshi WebSocket reconnect budget exhausted");
                    break;
                }

                let delay = config.reconnect.delay_for(attempts.saturating_sub(1));
                debug!(delay_ms = delay.as_millis() as u64, "waiting before reconnect");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    changed = shutdown_rx.changed() => {
                        // A closed channel means the handle is gone.
                        if changed.is_err() || *shutdown_rx.borrow() { break; }
                    }
                }
            }
        }
    }
}

async fn connect_and_run(
    config: &KalshiWsConfig,
    auth: &KalshiAuth,
    subscriptions: &parking_lot::RwLock<HashSet<String>>,
    events: &mpsc::Sender<ConnectorEvent>,
    command_id: &AtomicU64,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<(), PlatformError> {
    // Sign the handshake over the WS path.
    let mut request = config
        .ws_url
        .as_str()
        .into_client_request()
        .map_err(|e| PlatformError::InvalidRequest(format!("bad WS URL: {e}")))?;
    let path = request.uri().path().to_string();
    let headers = auth.sign_request("GET", &path)?;
    for (name, value) in headers.as_tuples() {
        request.headers_mut().insert(
            name,
            HeaderValue::from_str(value)
                .map_err(|e| PlatformError::InvalidRequest(format!("bad header value: {e}")))?,
        );
    }

    let (ws_stream, _response) =
        tokio::time::timeout(config.connect_timeout, connect_async(request))
            .await
            .map_err(|_| PlatformError::Timeout("WS connect".into()))?
            .map_err(|e| PlatformError::Network(format!("WS connect failed: {e}")))?;

    info!("Kalshi WebSocket connected");
    let (mut write, mut read) = ws_stream.split();

    // Fresh connection: local state is seeded by new snapshots only.
    let mut ladders: HashMap<String, ContractLadder> = HashMap::new();
    let mut resyncs: VecDeque<Instant> = VecDeque::new();

    let tickers = subscriptions.read().iter().cloned().collect::<Vec<_>>();
    for ticker in &tickers {
        send_command(&mut write, command_id, "subscribe", ticker).await?;
    }
    let _ = events
        .send(ConnectorEvent::Transport {
            venue: Venue::Kalshi,
            signal: TransportSignal::Connected,
        })
        .await;

    let mut ping_interval = tokio::time::interval(config.ping_interval);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ping_interval.tick().await; // completes immediately; first ping fires after one interval
    let mut pong_deadline: Option<Instant> = None;

    loop {
        let pong_sleep = pong_deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("shutdown requested, closing Kalshi WebSocket");
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
            }

            _ = ping_interval.tick() => {
                debug!("sending ping");
                write
                    .send(Message::Ping(Vec::new()))
                    .await
                    .map_err(|e| PlatformError::Network(format!("ping failed: {e}")))?;
                if pong_deadline.is_none() {
                    pong_deadline = Some(Instant::now() + config.pong_timeout);
                }
            }

            _ = tokio::time::sleep_until(pong_sleep), if pong_deadline.is_some() => {
                warn!("no pong within deadline, terminating socket");
                return Err(PlatformError::Network("pong timeout".into()));
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(
                            &text,
                            config,
                            &mut ladders,
                            &mut resyncs,
                            &mut write,
                            command_id,
                            events,
                        )
                        .await?;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        write
                            .send(Message::Pong(data))
                            .await
                            .map_err(|e| PlatformError::Network(format!("pong failed: {e}")))?;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        pong_deadline = None;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return Err(PlatformError::Network(
                            frame
                                .map(|f| f.reason.to_string())
                                .unwrap_or_else(|| "connection closed".to_string()),
                        ));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Err(PlatformError::Network(e.to_string()));
                    }
                    None => {
                        return Err(PlatformError::Network("stream ended".into()));
                    }
                }
            }
        }
    }
}

async fn send_command<S>(
    write: &mut S,
    command_id: &AtomicU64,
    cmd: &'static str,
    ticker: &str,
) -> Result<(), PlatformError>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let frame = CommandFrame {
        id: command_id.fetch_add(1, Ordering::Relaxed),
        cmd,
        params: CommandParams {
            channels: ["orderbook_delta"],
            market_ticker: ticker,
        },
    };
    let json = serde_json::to_string(&frame)
        .map_err(|e| PlatformError::Protocol(format!("command encode failed: {e}")))?;
    debug!(command = %json, "sending command");
    write
        .send(Message::Text(json))
        .await
        .map_err(|e| PlatformError::Network(format!("command send failed: {e}")))
}

async fn handle_frame<S>(
    text: &str,
    config: &KalshiWsConfig,
    ladders: &mut HashMap<String, ContractLadder>,
    resyncs: &mut VecDeque<Instant>,
    write: &mut S,
    command_id: &AtomicU64,
    events: &mpsc::Sender<ConnectorEvent>,
) -> Result<(), PlatformError>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let frame: WsFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "malformed frame, ignoring");
            return Ok(());
        }
    };

    match frame.kind.as_str() {
        "orderbook_snapshot" => {
            let Some(seq) = frame.seq else {
                warn!("snapshot without seq, ignoring");
                return Ok(());
            };
            let snapshot: SnapshotMsg = serde_json::from_value(frame.msg)
                .map_err(|e| PlatformError::Protocol(format!("bad snapshot: {e}")))?;
            let yes: Vec<(u32, i64)> =
                snapshot.yes.iter().map(|[p, q]| (*p as u32, *q)).collect();
            let no: Vec<(u32, i64)> = snapshot.no.iter().map(|[p, q]| (*p as u32, *q)).collect();

            let ladder = ladders
                .entry(snapshot.market_ticker.clone())
                .or_insert_with(ContractLadder::new);
            ladder.apply_snapshot(seq, &yes, &no);
            emit_book(ladder, &snapshot.market_ticker, events).await;
        }
        "orderbook_delta" => {
            let Some(seq) = frame.seq else {
                warn!("delta without seq, ignoring");
                return Ok(());
            };
            let delta: DeltaMsg = serde_json::from_value(frame.msg)
                .map_err(|e| PlatformError::Protocol(format!("bad delta: {e}")))?;
            let side = match delta.side.as_str() {
                "yes" => LadderSide::Yes,
                "no" => LadderSide::No,
                other => {
                    warn!(side = %other, "unknown delta side, ignoring");
                    return Ok(());
                }
            };

            let ticker = delta.market_ticker.clone();
            let outcome = ladders
                .get_mut(&ticker)
                .map(|l| l.apply_delta(seq, side, delta.price, delta.delta));
            match outcome {
                Some(Ok(())) => {
                    if let Some(ladder) = ladders.get(&ticker) {
                        emit_book(ladder, &ticker, events).await;
                    }
                }
                Some(Err(LadderError::SequenceGap { expected, got })) => {
                    warn!(
                        ticker = %ticker,
                        expected,
                        got,
                        "sequence gap, resubscribing for a fresh snapshot"
                    );
                    ladders.remove(&ticker);
                    send_command(write, command_id, "unsubscribe", &ticker).await?;
                    send_command(write, command_id, "subscribe", &ticker).await?;
                    record_resync(config, resyncs, events).await;
                }
                Some(Err(LadderError::NoSnapshot)) | None => {
                    // Late delta after a resync dropped the ladder.
                    debug!(ticker = %ticker, "delta without local state, dropped");
                }
            }
        }
        other => {
            debug!(kind = %other, "unhandled frame type");
        }
    }
    Ok(())
}

async fn emit_book(
    ladder: &ContractLadder,
    ticker: &str,
    events: &mpsc::Sender<ConnectorEvent>,
) {
    let book = ladder.to_normalized(ticker);
    if let Err(e) = book.validate() {
        warn!(ticker = %ticker, error = %e, "normalized book failed validation, dropped");
        return;
    }
    let _ = events.send(ConnectorEvent::Book(book)).await;
}

async fn record_resync(
    config: &KalshiWsConfig,
    resyncs: &mut VecDeque<Instant>,
    events: &mpsc::Sender<ConnectorEvent>,
) {
    let now = Instant::now();
    resyncs.push_back(now);
    while let Some(front) = resyncs.front() {
        if now.duration_since(*front) > config.resync_policy.window {
            resyncs.pop_front();
        } else {
            break;
        }
    }
    if resyncs.len() as u32 > config.resync_policy.max_resyncs {
        warn!(resyncs = resyncs.len(), "resync storm");
        let _ = events
            .send(ConnectorEvent::Transport {
                venue: Venue::Kalshi,
                signal: TransportSignal::ResyncStorm {
                    resyncs: resyncs.len() as u32,
                },
            })
            .await;
        resyncs.clear();
    }
}
