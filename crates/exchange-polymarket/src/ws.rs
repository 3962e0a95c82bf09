//! Polymarket market-channel WebSocket.
//!
//! Subscribes with an empty `auth` object, seeds per-token books from
//! `book` snapshots, and applies `price_change` level updates. Updates for
//! a token that has not seen a snapshot are dropped: partial depth would
//! mislead detection. Books older than the staleness bound at emit time
//! are discarded with a stale signal instead of being propagated.

use crate::book::{parse_decimal, BookSide, TokenBook};
use futures_util::{SinkExt, StreamExt};
use pm_arb_core::{ConnectorEvent, PlatformError, RetryPolicy, TransportSignal, Venue};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Budget for staleness discards before the stream reports bad data.
#[derive(Debug, Clone)]
pub struct StalePolicy {
    /// Discards tolerated inside the window.
    pub max_discards: u32,
    /// Sliding window length.
    pub window: Duration,
}

impl Default for StalePolicy {
    fn default() -> Self {
        Self {
            max_discards: 3,
            window: Duration::from_secs(60),
        }
    }
}

/// Configuration for the WS transport.
#[derive(Debug, Clone)]
pub struct PolymarketWsConfig {
    /// Market-channel WS URL.
    pub ws_url: String,
    /// Handshake deadline.
    pub connect_timeout: Duration,
    /// Keepalive ping cadence.
    pub ping_interval: Duration,
    /// Pong deadline after a ping.
    pub pong_timeout: Duration,
    /// Books older than this at emit time are discarded.
    pub staleness_bound: Duration,
    /// Reconnect backoff bounds.
    pub reconnect: RetryPolicy,
    /// Maximum reconnect attempts (0 = unlimited).
    pub max_reconnect_attempts: u32,
    /// Staleness storm budget.
    pub stale_policy: StalePolicy,
}

impl Default for PolymarketWsConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://ws-subscriptions-clob.polymarket.com/ws/market".to_string(),
            connect_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            staleness_bound: Duration::from_secs(30),
            reconnect: RetryPolicy::new(0, Duration::from_secs(1), Duration::from_secs(30)),
            max_reconnect_attempts: 0,
            stale_policy: StalePolicy::default(),
        }
    }
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Serialize)]
struct EmptyAuth {}

#[derive(Debug, Serialize)]
struct SubscribeFrame<'a> {
    auth: EmptyAuth,
    #[serde(rename = "type")]
    msg_type: &'static str,
    markets: [&'a str; 0],
    assets_ids: &'a [String],
}

#[derive(Debug, Deserialize)]
struct WsMessage {
    event_type: String,
    #[serde(flatten)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct BookMessage {
    asset_id: String,
    #[serde(default)]
    bids: Vec<RawLevel>,
    #[serde(default)]
    asks: Vec<RawLevel>,
    #[serde(default)]
    timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawLevel {
    price: String,
    size: String,
}

#[derive(Debug, Deserialize)]
struct PriceChangeMessage {
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    price_changes: Vec<PriceChange>,
}

#[derive(Debug, Deserialize)]
struct PriceChange {
    asset_id: String,
    price: String,
    size: String,
    side: String,
    #[serde(default)]
    #[allow(dead_code)]
    best_bid: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    best_ask: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    hash: Option<String>,
}

// =============================================================================
// Handle
// =============================================================================

/// Handle to the spawned WS task.
pub struct PolymarketWs {
    token_ids: Arc<parking_lot::RwLock<HashSet<String>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl PolymarketWs {
    /// Spawns the connection task for the given token ids.
    #[must_use]
    pub fn spawn(
        config: PolymarketWsConfig,
        token_ids: Vec<String>,
        events: mpsc::Sender<ConnectorEvent>,
    ) -> Self {
        let token_ids = Arc::new(parking_lot::RwLock::new(
            token_ids.into_iter().collect::<HashSet<_>>(),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(run_connection_loop(
            config,
            Arc::clone(&token_ids),
            events,
            shutdown_rx,
        ));

        Self {
            token_ids,
            shutdown_tx,
        }
    }

    /// Tokens currently in the subscription set.
    #[must_use]
    pub fn subscribed(&self) -> Vec<String> {
        self.token_ids.read().iter().cloned().collect()
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
    config: PolymarketWsConfig,
    token_ids: Arc<parking_lot::RwLock<HashSet<String>>>,
    events: mpsc::Sender<ConnectorEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut attempts: u32 = 0;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        info!(url = %config.ws_url, "connecting Polymarket WebSocket");
        match connect_and_run(&config, &token_ids, &events, &mut shutdown_rx).await {
            Ok(()) => {
                info!("Polymarket WebSocket closed cleanly");
                break;
            }
            Err(e) => {
                attempts += 1;
                error!(error = %e, attempt = attempts, "Polymarket WebSocket dropped");
                let _ = events
                    .send(ConnectorEvent::Transport {
                        venue: Venue::Polymarket,
                        signal: TransportSignal::Disconnected {
                            reason: e.to_string(),
                        },
                    })
                    .await;

                if config.max_reconnect_attempts > 0 && attempts >= config.max_reconnect_attempts {
                    error!("Polymarket WebSocket reconnect budget exhausted");
                    break;
                }

                let delay = config.reconnect.delay_for(attempts.saturating_sub(1));
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
    config: &PolymarketWsConfig,
    token_ids: &parking_lot::RwLock<HashSet<String>>,
    events: &mpsc::Sender<ConnectorEvent>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<(), PlatformError> {
    let (ws_stream, _response) =
        tokio::time::timeout(config.connect_timeout, connect_async(config.ws_url.as_str()))
            .await
            .map_err(|_| PlatformError::Timeout("WS connect".into()))?
            .map_err(|e| PlatformError::Network(format!("WS connect failed: {e}")))?;

    info!("Polymarket WebSocket connected");
    let (mut write, mut read) = ws_stream.split();

    // Handshake: empty auth object plus the asset subscription.
    let assets: Vec<String> = token_ids.read().iter().cloned().collect();
    let frame = SubscribeFrame {
        auth: EmptyAuth {},
        msg_type: "subscribe",
        markets: [],
        assets_ids: &assets,
    };
    let json = serde_json::to_string(&frame)
        .map_err(|e| PlatformError::Protocol(format!("subscribe encode failed: {e}")))?;
    debug!(message = %json, "sending subscription");
    write
        .send(Message::Text(json))
        .await
        .map_err(|e| PlatformError::Network(format!("subscribe send failed: {e}")))?;

    let _ = events
        .send(ConnectorEvent::Transport {
            venue: Venue::Polymarket,
            signal: TransportSignal::Connected,
        })
        .await;

    // Fresh connection: books reseed from new snapshots only.
    let mut books: HashMap<String, TokenBook> = HashMap::new();
    let mut discards: VecDeque<Instant> = VecDeque::new();

    let mut ping_interval = tokio::time::interval(config.ping_interval);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ping_interval.tick().await;
    let mut pong_deadline: Option<Instant> = None;

    loop {
        let pong_sleep =
            pong_deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("shutdown requested, closing Polymarket WebSocket");
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
            }

            _ = ping_interval.tick() => {
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
                        process_message(&text, config, &mut books, &mut discards, events).await;
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
                    Some(Err(e)) => return Err(PlatformError::Network(e.to_string())),
                    None => return Err(PlatformError::Network("stream ended".into())),
                }
            }
        }
    }
}

async fn process_message(
    text: &str,
    config: &PolymarketWsConfig,
    books: &mut HashMap<String, TokenBook>,
    discards: &mut VecDeque<Instant>,
    events: &mpsc::Sender<ConnectorEvent>,
) {
    // Messages arrive as a single object or an array of objects.
    let messages: Vec<WsMessage> = if text.trim_start().starts_with('[') {
        serde_json::from_str(text).unwrap_or_default()
    } else {
        match serde_json::from_str::<WsMessage>(text) {
            Ok(msg) => vec![msg],
            Err(e) => {
                warn!(error = %e, "malformed frame, ignoring");
                return;
            }
        }
    };

    for msg in messages {
        match msg.event_type.as_str() {
            "book" => {
                let Ok(book_msg) = serde_json::from_value::<BookMessage>(msg.data) else {
                    warn!("malformed book message, ignoring");
                    continue;
                };
                let timestamp_ms = book_msg.timestamp.as_deref().and_then(|t| t.parse().ok());
                let bids = parse_levels(&book_msg.bids);
                let asks = parse_levels(&book_msg.asks);

                let book = books.entry(book_msg.asset_id.clone()).or_default();
                book.apply_snapshot(bids, asks, timestamp_ms);
                emit_book(config, books, &book_msg.asset_id, discards, events).await;
            }
            "price_change" => {
                let Ok(change_msg) = serde_json::from_value::<PriceChangeMessage>(msg.data) else {
                    warn!("malformed price_change message, ignoring");
                    continue;
                };
                let timestamp_ms: Option<i64> =
                    change_msg.timestamp.as_deref().and_then(|t| t.parse().ok());
                for change in &change_msg.price_changes {
                    let (Some(price), Some(size), Some(side)) = (
                        parse_decimal(&change.price),
                        parse_decimal(&change.size),
                        BookSide::parse(&change.side),
                    ) else {
                        warn!(asset_id = %change.asset_id, "unparsable price change, ignoring");
                        continue;
                    };

                    let applied = books
                        .get_mut(&change.asset_id)
                        .map(|b| b.apply_update(side, price, size, timestamp_ms))
                        .unwrap_or(false);
                    if applied {
                        emit_book(config, books, &change.asset_id, discards, events).await;
                    } else {
                        // No snapshot seen for this asset yet.
                        debug!(asset_id = %change.asset_id, "price change before snapshot, dropped");
                    }
                }
            }
            other => {
                debug!(event_type = %other, "unhandled event type");
            }
        }
    }
}

fn parse_levels(levels: &[RawLevel]) -> Vec<(rust_decimal::Decimal, rust_decimal::Decimal)> {
    levels
        .iter()
        .filter_map(|l| Some((parse_decimal(&l.price)?, parse_decimal(&l.size)?)))
        .collect()
}

async fn emit_book(
    config: &PolymarketWsConfig,
    books: &HashMap<String, TokenBook>,
    asset_id: &str,
    discards: &mut VecDeque<Instant>,
    events: &mpsc::Sender<ConnectorEvent>,
) {
    let Some(book) = books.get(asset_id) else {
        return;
    };
    let normalized = book.to_normalized(asset_id);

    let age = normalized.age_at(chrono::Utc::now());
    if age > chrono::Duration::from_std(config.staleness_bound).unwrap_or(chrono::Duration::MAX) {
        warn!(asset_id = %asset_id, age_secs = age.num_seconds(), "stale book discarded");
        let _ = events
            .send(ConnectorEvent::Stale {
                venue: Venue::Polymarket,
                contract_id: asset_id.to_string(),
                age_secs: age.num_seconds(),
            })
            .await;
        record_discard(config, discards, events).await;
        return;
    }

    if let Err(e) = normalized.validate() {
        warn!(asset_id = %asset_id, error = %e, "normalized book failed validation, dropped");
        return;
    }
    let _ = events.send(ConnectorEvent::Book(normalized)).await;
}

async fn record_discard(
    config: &PolymarketWsConfig,
    discards: &mut VecDeque<Instant>,
    events: &mpsc::Sender<ConnectorEvent>,
) {
    let now = Instant::now();
    discards.push_back(now);
    while let Some(front) = discards.front() {
        if now.duration_since(*front) > config.stale_policy.window {
            discards.pop_front();
        } else {
            break;
        }
    }
    if discards.len() as u32 > config.stale_policy.max_discards {
        warn!(discards = discards.len(), "repeated staleness");
        let _ = events
            .send(ConnectorEvent::Transport {
                venue: Venue::Polymarket,
                signal: TransportSignal::StaleData {
                    discards: discards.len() as u32,
                },
            })
            .await;
        discards.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tokio::net::TcpListener;

    fn fast_config(url: String) -> PolymarketWsConfig {
        PolymarketWsConfig {
            ws_url: url,
            connect_timeout: Duration::from_secs(5),
            reconnect: RetryPolicy::new(0, Duration::from_millis(10), Duration::from_millis(50)),
            max_reconnect_attempts: 1,
            ..Default::default()
        }
    }

    fn book_frame(asset_id: &str, timestamp_ms: i64) -> String {
        serde_json::json!({
            "event_type": "book",
            "asset_id": asset_id,
            "market": "0xcond",
            "bids": [{"price": ".48", "size": "100"}, {"price": ".47", "size": "50"}],
            "asks": [{"price": ".52", "size": "80"}],
            "timestamp": timestamp_ms.to_string(),
            "hash": "0xabc"
        })
        .to_string()
    }

    fn price_change_frame(asset_id: &str, price: &str, size: &str, side: &str) -> String {
        serde_json::json!({
            "event_type": "price_change",
            "market": "0xcond",
            "price_changes": [
                {"asset_id": asset_id, "price": price, "size": size, "side": side,
                 "best_bid": ".48", "best_ask": ".52", "hash": "0xdef"}
            ]
        })
        .to_string()
    }

    async fn mock_server(frames: Vec<String>) -> (String, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let mut received = Vec::new();
            if let Ok((stream, _)) = listener.accept().await {
                let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                let (mut write, mut read) = ws.split();
                if let Some(Ok(Message::Text(sub))) = read.next().await {
                    received.push(sub);
                }
                for frame in frames {
                    write.send(Message::Text(frame)).await.unwrap();
                }
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
            received
        });
        (format!("ws://{addr}"), handle)
    }

    async fn collect_events(
        rx: &mut mpsc::Receiver<ConnectorEvent>,
        want: usize,
    ) -> Vec<ConnectorEvent> {
        let mut events = Vec::new();
        while events.len() < want {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Some(event)) => events.push(event),
                _ => break,
            }
        }
        events
    }

    // ==================== Wire Format Tests ====================

    #[test]
    fn test_subscribe_frame_shape() {
        let assets = vec!["tok-1".to_string(), "tok-2".to_string()];
        let frame = SubscribeFrame {
            auth: EmptyAuth {},
            msg_type: "subscribe",
            markets: [],
            assets_ids: &assets,
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""auth":{}"#));
        assert!(json.contains(r#""type":"subscribe""#));
        assert!(json.contains(r#""markets":[]"#));
        assert!(json.contains(r#""assets_ids":["tok-1","tok-2"]"#));
    }

    #[test]
    fn test_price_change_parses_best_prices() {
        let msg: WsMessage =
            serde_json::from_str(&price_change_frame("tok-1", ".49", "25", "BUY")).unwrap();
        let change: PriceChangeMessage = serde_json::from_value(msg.data).unwrap();
        assert_eq!(change.price_changes.len(), 1);
        assert_eq!(change.price_changes[0].best_bid.as_deref(), Some(".48"));
        assert_eq!(change.price_changes[0].best_ask.as_deref(), Some(".52"));
    }

    // ==================== Stream Tests ====================

    #[tokio::test]
    async fn test_snapshot_then_update_emits_books() {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let (url, server) = mock_server(vec![
            book_frame("tok-1", now_ms),
            price_change_frame("tok-1", ".49", "25", "BUY"),
        ])
        .await;

        let (tx, mut rx) = mpsc::channel(64);
        let ws = PolymarketWs::spawn(fast_config(url), vec!["tok-1".into()], tx);

        let events = collect_events(&mut rx, 3).await;
        let books: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ConnectorEvent::Book(b) => Some(b.clone()),
                _ => None,
            })
            .collect();
        assert!(books.len() >= 2, "events: {events:?}");
        assert_eq!(books[0].best_bid(), Some(dec!(0.48)));
        assert_eq!(books[1].best_bid(), Some(dec!(0.49)));

        ws.shutdown();
        let received = server.await.unwrap();
        assert!(received[0].contains(r#""type":"subscribe""#));
    }

    #[tokio::test]
    async fn test_update_before_snapshot_dropped() {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let (url, server) = mock_server(vec![
            price_change_frame("tok-1", ".49", "25", "BUY"),
            book_frame("tok-1", now_ms),
        ])
        .await;

        let (tx, mut rx) = mpsc::channel(64);
        let ws = PolymarketWs::spawn(fast_config(url), vec!["tok-1".into()], tx);

        let events = collect_events(&mut rx, 2).await;
        let books: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ConnectorEvent::Book(b) => Some(b),
                _ => None,
            })
            .collect();
        // Only the snapshot produced a book; the early update was dropped.
        assert_eq!(books.len(), 1);
        assert_eq!(books[0].best_bid(), Some(dec!(0.48)));

        ws.shutdown();
        let _ = server.await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_snapshot_discarded() {
        // Timestamp 60 s in the past exceeds the 30 s bound.
        let stale_ms = chrono::Utc::now().timestamp_millis() - 60_000;
        let (url, server) = mock_server(vec![book_frame("tok-1", stale_ms)]).await;

        let (tx, mut rx) = mpsc::channel(64);
        let ws = PolymarketWs::spawn(fast_config(url), vec!["tok-1".into()], tx);

        let events = collect_events(&mut rx, 2).await;
        let mut saw_stale = false;
        for event in &events {
            match event {
                ConnectorEvent::Book(_) => panic!("stale book must not propagate"),
                ConnectorEvent::Stale { age_secs, .. } => {
                    assert!(*age_secs >= 30);
                    saw_stale = true;
                }
                ConnectorEvent::Transport { .. } => {}
            }
        }
        assert!(saw_stale, "events: {events:?}");

        ws.shutdown();
        let _ = server.await.unwrap();
    }
}
