use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::feeds::buffer::PriceBuffer;
use crate::feeds::{ConnState, FeedHealth, TickListener};
use crate::net::pool::ConnectionPool;
use crate::types::{ExchangeMetrics, SpotTick, Venue};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RECV_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_BACKOFF_MS: u64 = 30_000;

/// Per-venue spot adapter. Pure producer: owns its WebSocket connection and
/// PriceBuffer, translates the venue protocol into SpotTicks, and publishes a
/// fresh ExchangeMetrics snapshot after every accepted tick. Other components
/// only ever see the snapshots.
pub struct SpotFeed {
    venue: Venue,
    ws_url: String,
    symbol: String,
    buffer: PriceBuffer,
    listeners: Vec<TickListener>,
    health: FeedHealth,
    health_tx: watch::Sender<FeedHealth>,
    metrics_tx: watch::Sender<Option<ExchangeMetrics>>,
    pool: Option<Arc<ConnectionPool>>,
}

impl SpotFeed {
    pub fn new(
        venue: Venue,
        ws_url: String,
        symbol: String,
    ) -> (
        Self,
        watch::Receiver<Option<ExchangeMetrics>>,
        watch::Receiver<FeedHealth>,
    ) {
        let (metrics_tx, metrics_rx) = watch::channel(None);
        let (health_tx, health_rx) = watch::channel(FeedHealth::new());
        let feed = Self {
            venue,
            ws_url,
            symbol,
            buffer: PriceBuffer::new(),
            listeners: Vec::new(),
            health: FeedHealth::new(),
            health_tx,
            metrics_tx,
            pool: None,
        };
        (feed, metrics_rx, health_rx)
    }

    /// Use a warm-connection pool instead of dialing directly.
    pub fn with_pool(mut self, pool: Arc<ConnectionPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Register a tick listener. Listeners run synchronously in registration
    /// order on every accepted tick; failures are counted, not propagated.
    pub fn add_callback(&mut self, listener: TickListener) {
        self.listeners.push(listener);
    }

    fn set_state(&mut self, state: ConnState) {
        self.health.state = state;
        self.health.connected =
            matches!(state, ConnState::Connected | ConnState::Receiving | ConnState::Idle);
        let _ = self.health_tx.send(self.health);
    }

    /// Continuous ingestion loop. Runs until shutdown flips; every failure is
    /// recovered locally with exponential backoff capped at 30 s. The
    /// reconnect counter never resets within a process lifetime.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff_ms: u64 = 1000;

        'outer: loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_state(ConnState::Connecting);

            let ws = match self.acquire().await {
                Some(ws) => ws,
                None => {
                    self.health.errors += 1;
                    self.health.reconnects += 1;
                    self.set_state(ConnState::Disconnected);
                    debug!(venue = %self.venue, backoff_ms, "connect failed, backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                        _ = shutdown.changed() => {}
                    }
                    backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
                    continue;
                }
            };

            let (mut write, mut read) = ws.split();

            if let Some(sub) = subscribe_message(self.venue, &self.symbol) {
                if let Err(e) = write.send(Message::Text(sub)).await {
                    warn!(venue = %self.venue, error = %e, "subscribe failed, reconnecting");
                    self.health.errors += 1;
                    self.health.reconnects += 1;
                    continue;
                }
            }
            info!(venue = %self.venue, symbol = %self.symbol, "connected");
            self.set_state(ConnState::Connected);
            backoff_ms = 1000;

            loop {
                let msg = tokio::select! {
                    m = tokio::time::timeout(RECV_TIMEOUT, read.next()) => m,
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            self.set_state(ConnState::Closing);
                            let _ = write.send(Message::Close(None)).await;
                            break 'outer;
                        }
                        continue;
                    }
                };

                match msg {
                    Ok(Some(Ok(Message::Text(text)))) => {
                        let local_ts_ms = chrono::Utc::now().timestamp_millis();
                        if self.health.state != ConnState::Receiving {
                            self.set_state(ConnState::Receiving);
                        }
                        self.on_message(&text, local_ts_ms);
                    }
                    Ok(Some(Ok(Message::Ping(payload)))) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Ok(Some(Ok(_))) => {}
                    Ok(Some(Err(e))) => {
                        warn!(venue = %self.venue, error = %e, "stream error, reconnecting");
                        self.health.errors += 1;
                        break;
                    }
                    Ok(None) => {
                        warn!(venue = %self.venue, "stream ended, reconnecting");
                        break;
                    }
                    Err(_) => {
                        // Quiet market or dead connection; a ping disambiguates.
                        self.set_state(ConnState::Idle);
                        if write.send(Message::Ping(vec![])).await.is_err() {
                            warn!(venue = %self.venue, "ping failed after idle, reconnecting");
                            self.health.errors += 1;
                            break;
                        }
                    }
                }
            }

            self.health.reconnects += 1;
            self.set_state(ConnState::Disconnected);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                _ = shutdown.changed() => {}
            }
            backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
        }

        self.set_state(ConnState::Disconnected);
        info!(venue = %self.venue, "spot feed stopped");
    }

    async fn acquire(&self) -> Option<crate::net::pool::WsStream> {
        if let Some(pool) = &self.pool {
            return pool.acquire().await;
        }
        match tokio::time::timeout(CONNECT_TIMEOUT, connect_async(&self.ws_url)).await {
            Ok(Ok((ws, _))) => Some(ws),
            Ok(Err(e)) => {
                warn!(venue = %self.venue, error = %e, "connect failed");
                None
            }
            Err(_) => {
                warn!(venue = %self.venue, "connect timed out");
                None
            }
        }
    }

    fn on_message(&mut self, text: &str, local_ts_ms: i64) {
        let ticks = parse_trades(self.venue, text, &self.symbol, local_ts_ms);
        if ticks.is_empty() {
            return;
        }
        for tick in &ticks {
            if tick.price <= 0.0 || tick.size < 0.0 {
                // Data validity failure: drop without corrupting the buffer
                self.health.errors += 1;
                continue;
            }
            self.buffer.add(tick.price, tick.venue_ts_ms, tick.quote_volume());
            self.health.last_msg_ms = local_ts_ms;
            self.health.latency_ms = (local_ts_ms - tick.venue_ts_ms) as f64;

            for listener in self.listeners.iter_mut() {
                if let Err(e) = listener(tick) {
                    self.health.errors += 1;
                    debug!(venue = %self.venue, error = %e, "tick listener failed");
                }
            }

            let metrics = materialize_metrics(self.venue, &self.buffer, local_ts_ms);
            let _ = self.metrics_tx.send(Some(metrics));
        }
        let _ = self.health_tx.send(self.health);
    }
}

/// Build an ExchangeMetrics snapshot from a venue's PriceBuffer.
pub fn materialize_metrics(venue: Venue, buffer: &PriceBuffer, now_ms: i64) -> ExchangeMetrics {
    ExchangeMetrics {
        venue,
        price: buffer.current_price().unwrap_or(0.0),
        venue_ts_ms: buffer.current_timestamp().unwrap_or(0),
        local_ts_ms: now_ms,
        move_30s: buffer.move_pct(30.0, now_ms),
        velocity_30s: buffer.velocity(30.0, now_ms),
        volatility_30s: buffer.volatility(30.0, now_ms),
        vol_1m: buffer.volume_sum(60.0, now_ms),
        vol_5m_avg: buffer.volume_per_minute(300.0, now_ms),
        atr_5m: buffer.atr(300.0, 60.0, now_ms),
        max_move_10s: buffer.max_move_in_subwindow(30.0, 10.0, now_ms),
    }
}

/// Post-connect subscription payload, where the venue needs one. Binance
/// subscribes through the stream URL path.
pub fn subscribe_message(venue: Venue, symbol: &str) -> Option<String> {
    match venue {
        Venue::Binance => None,
        Venue::Coinbase => Some(
            serde_json::json!({
                "type": "subscribe",
                "product_ids": [symbol],
                "channels": ["matches"],
            })
            .to_string(),
        ),
        Venue::Kraken => Some(
            serde_json::json!({
                "event": "subscribe",
                "pair": [symbol],
                "subscription": {"name": "trade"},
            })
            .to_string(),
        ),
    }
}

/// Translate one venue message into zero or more ticks. Parse failures drop
/// the message; callers count them.
pub fn parse_trades(venue: Venue, text: &str, symbol: &str, local_ts_ms: i64) -> Vec<SpotTick> {
    match venue {
        Venue::Binance => parse_binance(text, local_ts_ms).into_iter().collect(),
        Venue::Coinbase => parse_coinbase(text, local_ts_ms).into_iter().collect(),
        Venue::Kraken => parse_kraken(text, symbol, local_ts_ms),
    }
}

fn parse_binance(text: &str, local_ts_ms: i64) -> Option<SpotTick> {
    let v: serde_json::Value = serde_json::from_str(text).ok()?;
    if v.get("e").and_then(|e| e.as_str()) != Some("trade") {
        return None;
    }
    let price: f64 = v["p"].as_str()?.parse().ok()?;
    let size: f64 = v["q"].as_str()?.parse().ok()?;
    let ts_ms = v["T"].as_i64()?;
    let symbol = v["s"].as_str().unwrap_or_default().to_string();
    Some(SpotTick {
        venue: Venue::Binance,
        symbol,
        price,
        size,
        venue_ts_ms: ts_ms,
        local_ts_ms,
    })
}

fn parse_coinbase(text: &str, local_ts_ms: i64) -> Option<SpotTick> {
    let v: serde_json::Value = serde_json::from_str(text).ok()?;
    let msg_type = v.get("type").and_then(|t| t.as_str())?;
    if msg_type != "match" && msg_type != "last_match" {
        return None;
    }
    let price: f64 = v["price"].as_str()?.parse().ok()?;
    let size: f64 = v["size"].as_str()?.parse().ok()?;
    let ts_ms = v["time"]
        .as_str()
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.timestamp_millis())?;
    let symbol = v["product_id"].as_str().unwrap_or_default().to_string();
    Some(SpotTick {
        venue: Venue::Coinbase,
        symbol,
        price,
        size,
        venue_ts_ms: ts_ms,
        local_ts_ms,
    })
}

/// Kraken trades arrive as `[channel_id, [[price, volume, time, ...], ...],
/// "trade", pair]`; system/heartbeat messages are JSON objects.
fn parse_kraken(text: &str, symbol: &str, local_ts_ms: i64) -> Vec<SpotTick> {
    let v: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return vec![],
    };
    let arr = match v.as_array() {
        Some(arr) if arr.len() >= 4 => arr,
        _ => return vec![],
    };
    if arr[2].as_str() != Some("trade") {
        return vec![];
    }
    let trades = match arr[1].as_array() {
        Some(t) => t,
        None => return vec![],
    };
    let mut out = Vec::with_capacity(trades.len());
    for trade in trades {
        let fields = match trade.as_array() {
            Some(f) if f.len() >= 3 => f,
            _ => continue,
        };
        let price: f64 = match fields[0].as_str().and_then(|s| s.parse().ok()) {
            Some(p) => p,
            None => continue,
        };
        let size: f64 = match fields[1].as_str().and_then(|s| s.parse().ok()) {
            Some(s) => s,
            None => continue,
        };
        let ts_ms = fields[2]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .map(|t| (t * 1000.0) as i64)
            .unwrap_or(local_ts_ms);
        out.push(SpotTick {
            venue: Venue::Kraken,
            symbol: symbol.to_string(),
            price,
            size,
            venue_ts_ms: ts_ms,
            local_ts_ms,
        });
    }
    out
}
