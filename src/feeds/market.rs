use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::feeds::{ConnState, FeedHealth};
use crate::market::discovery::{MarketCache, MarketInfo};
use crate::types::{BookLevel, MarketSnapshot};

/// Quotes are "unchanged" while each of the four best prices moved less than
/// this much.
const PRICE_PRECISION: f64 = 0.001;
/// Static-price duration before the freeze window is considered.
const FREEZE_MIN_MS: i64 = 3000;
/// Depth change that, with static prices, flags a freeze.
const FREEZE_DEPTH_PCT: f64 = 0.10;
/// Collapse: below half the 30s-ago liquidity AND under this absolute floor.
const COLLAPSE_RATIO: f64 = 0.50;
const COLLAPSE_FLOOR: f64 = 25.0;
/// Depth levels used for imbalance and freeze totals.
const IMBALANCE_LEVELS: usize = 5;
const TOP_K: usize = 10;

// ─── Book sides ───

/// One side of a token's book. BIDS descending, ASKS ascending, top-10 kept.
#[derive(Clone, Debug, Default)]
pub struct BookSide {
    levels: Vec<BookLevel>,
}

impl BookSide {
    pub fn apply(&mut self, mut levels: Vec<BookLevel>, is_bid: bool) {
        levels.retain(|l| l.price > 0.0 && l.size >= 0.0);
        if is_bid {
            levels.sort_unstable_by(|a, b| b.price.partial_cmp(&a.price).unwrap_or(std::cmp::Ordering::Equal));
        } else {
            levels.sort_unstable_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal));
        }
        levels.truncate(TOP_K);
        self.levels = levels;
    }

    #[inline]
    pub fn best_price(&self) -> f64 {
        self.levels.first().map_or(0.0, |l| l.price)
    }

    #[inline]
    pub fn best_size(&self) -> f64 {
        self.levels.first().map_or(0.0, |l| l.size)
    }

    pub fn depth(&self, n: usize) -> f64 {
        self.levels.iter().take(n).map(|l| l.size).sum()
    }

    pub fn top(&self, n: usize) -> Vec<BookLevel> {
        self.levels.iter().take(n).copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

// ─── Liquidity history ───

/// Bounded history of best-bid liquidity for collapse detection. Lookback
/// answers "what was liquidity N seconds ago" with the nearest snapshot
/// inside ±10 s.
#[derive(Clone, Debug)]
pub struct LiquidityTracker {
    snapshots: VecDeque<(i64, f64, f64)>,
    max_age_ms: i64,
}

impl LiquidityTracker {
    const LOOKUP_SLACK_MS: i64 = 10_000;

    pub fn new(max_age_s: i64) -> Self {
        Self {
            snapshots: VecDeque::new(),
            max_age_ms: max_age_s * 1000,
        }
    }

    pub fn add(&mut self, now_ms: i64, yes_liq: f64, no_liq: f64) {
        self.snapshots.push_back((now_ms, yes_liq, no_liq));
        let cutoff = now_ms - self.max_age_ms;
        while self.snapshots.front().map_or(false, |(t, _, _)| *t < cutoff) {
            self.snapshots.pop_front();
        }
    }

    /// (yes, no) liquidity nearest to `seconds_ago`; (0, 0) when nothing is
    /// within the slack window.
    pub fn at(&self, now_ms: i64, seconds_ago: i64) -> (f64, f64) {
        let target = now_ms - seconds_ago * 1000;
        let mut best: Option<(i64, f64, f64)> = None;
        for &(ts, yes, no) in &self.snapshots {
            let diff = (ts - target).abs();
            match best {
                Some((best_diff, _, _)) if diff >= best_diff => {}
                _ => best = Some((diff, yes, no)),
            }
        }
        match best {
            Some((diff, yes, no)) if diff < Self::LOOKUP_SLACK_MS => (yes, no),
            _ => (0.0, 0.0),
        }
    }

    pub fn clear(&mut self) {
        self.snapshots.clear();
    }
}

// ─── Orderbook state machine ───

/// Owns the YES/NO books for one market and derives the MarketSnapshot:
/// staleness, freeze, imbalance, collapse. Exclusively owned by the market
/// feed task.
#[derive(Clone, Debug)]
pub struct BookTracker {
    market_id: String,
    pub yes_bids: BookSide,
    pub yes_asks: BookSide,
    pub no_bids: BookSide,
    pub no_asks: BookSide,
    liquidity: LiquidityTracker,
    last_yes_bid: f64,
    last_yes_ask: f64,
    last_no_bid: f64,
    last_no_ask: f64,
    last_price_change_ms: i64,
    freeze_window_start_ms: i64,
    depth_at_freeze_start: f64,
    yes_fee_bps: u32,
    no_fee_bps: u32,
}

impl BookTracker {
    pub fn new(market_id: String) -> Self {
        Self {
            market_id,
            yes_bids: BookSide::default(),
            yes_asks: BookSide::default(),
            no_bids: BookSide::default(),
            no_asks: BookSide::default(),
            liquidity: LiquidityTracker::new(120),
            last_yes_bid: 0.0,
            last_yes_ask: 0.0,
            last_no_bid: 0.0,
            last_no_ask: 0.0,
            last_price_change_ms: 0,
            freeze_window_start_ms: 0,
            depth_at_freeze_start: 0.0,
            yes_fee_bps: 0,
            no_fee_bps: 0,
        }
    }

    pub fn market_id(&self) -> &str {
        &self.market_id
    }

    /// Market rollover: fresh books, fresh staleness state, same fee cache
    /// until the next refresh.
    pub fn reset(&mut self, market_id: String) {
        let fees = (self.yes_fee_bps, self.no_fee_bps);
        *self = BookTracker::new(market_id);
        self.yes_fee_bps = fees.0;
        self.no_fee_bps = fees.1;
    }

    pub fn set_fees(&mut self, yes_bps: u32, no_bps: u32) {
        self.yes_fee_bps = yes_bps;
        self.no_fee_bps = no_bps;
    }

    pub fn apply_yes(&mut self, bids: Vec<BookLevel>, asks: Vec<BookLevel>) {
        self.yes_bids.apply(bids, true);
        self.yes_asks.apply(asks, false);
    }

    pub fn apply_no(&mut self, bids: Vec<BookLevel>, asks: Vec<BookLevel>) {
        self.no_bids.apply(bids, true);
        self.no_asks.apply(asks, false);
    }

    pub fn has_data(&self) -> bool {
        !self.yes_bids.is_empty() || !self.yes_asks.is_empty()
    }

    /// Materialise the full market state at `now_ms`, advancing the
    /// staleness / freeze trackers.
    pub fn snapshot(&mut self, now_ms: i64) -> MarketSnapshot {
        let yes_bid = self.yes_bids.best_price();
        let yes_ask = self.yes_asks.best_price();
        let no_bid = self.no_bids.best_price();
        let no_ask = self.no_asks.best_price();

        let yes_liq_best = self.yes_bids.best_size();
        let no_liq_best = self.no_bids.best_size();

        // History lookups precede the current sample
        let (liq_30s_ago, _) = self.liquidity.at(now_ms, 30);
        let (liq_60s_ago, _) = self.liquidity.at(now_ms, 60);
        self.liquidity.add(now_ms, yes_liq_best, no_liq_best);

        let spread = if yes_ask > 0.0 && yes_bid > 0.0 {
            yes_ask - yes_bid
        } else {
            0.0
        };

        let implied_prob = if yes_bid > 0.0 && yes_ask > 0.0 {
            (yes_bid + yes_ask) / 2.0
        } else if yes_bid > 0.0 {
            yes_bid
        } else if yes_ask > 0.0 {
            yes_ask
        } else {
            0.5
        };

        // Collapse requires both a major drop and a breach of the absolute
        // floor; thin books fluctuating above the floor are not a collapse.
        let liq_collapsing = liq_30s_ago > 0.0
            && yes_liq_best > 0.0
            && yes_liq_best / liq_30s_ago < COLLAPSE_RATIO
            && yes_liq_best < COLLAPSE_FLOOR;

        let yes_depth_total = self.yes_bids.depth(IMBALANCE_LEVELS);
        let no_depth_total = self.no_bids.depth(IMBALANCE_LEVELS);
        let depth_sum = yes_depth_total + no_depth_total;
        let imbalance = if depth_sum > 0.0 {
            (yes_depth_total - no_depth_total) / depth_sum
        } else {
            0.0
        };

        let price_changed = (yes_bid - self.last_yes_bid).abs() > PRICE_PRECISION
            || (yes_ask - self.last_yes_ask).abs() > PRICE_PRECISION
            || (no_bid - self.last_no_bid).abs() > PRICE_PRECISION
            || (no_ask - self.last_no_ask).abs() > PRICE_PRECISION;

        let mut freeze_detected = false;
        let mut depth_change_pct = 0.0;

        if price_changed || self.last_price_change_ms == 0 {
            self.last_price_change_ms = now_ms;
            self.last_yes_bid = yes_bid;
            self.last_yes_ask = yes_ask;
            self.last_no_bid = no_bid;
            self.last_no_ask = no_ask;
            self.freeze_window_start_ms = now_ms;
            self.depth_at_freeze_start = depth_sum;
        } else if now_ms - self.freeze_window_start_ms >= FREEZE_MIN_MS
            && self.depth_at_freeze_start > 0.0
        {
            depth_change_pct =
                (depth_sum - self.depth_at_freeze_start).abs() / self.depth_at_freeze_start;
            if depth_change_pct > FREEZE_DEPTH_PCT {
                freeze_detected = true;
            }
        }

        let orderbook_age_s = (now_ms - self.last_price_change_ms).max(0) as f64 / 1000.0;

        MarketSnapshot {
            market_id: self.market_id.clone(),
            ts_ms: now_ms,
            yes_bid,
            yes_ask,
            no_bid,
            no_ask,
            yes_liq_best,
            no_liq_best,
            yes_depth_3: self.yes_bids.top(3),
            no_depth_3: self.no_bids.top(3),
            spread,
            implied_prob,
            liq_30s_ago,
            liq_60s_ago,
            liq_collapsing,
            imbalance,
            yes_depth_total,
            no_depth_total,
            last_price_change_ms: self.last_price_change_ms,
            orderbook_age_s,
            freeze_detected,
            depth_change_pct,
            yes_fee_bps: self.yes_fee_bps,
            no_fee_bps: self.no_fee_bps,
        }
    }
}

// ─── Wire parsing ───

/// CLOB book payload: `{"bids": [{"price": "...", "size": "..."}], "asks": [...]}`.
/// Levels with unparseable fields are dropped.
pub fn parse_book(v: &serde_json::Value) -> (Vec<BookLevel>, Vec<BookLevel>) {
    let side = |key: &str| -> Vec<BookLevel> {
        v.get(key)
            .and_then(|s| s.as_array())
            .map(|levels| {
                levels
                    .iter()
                    .filter_map(|l| {
                        let price = field_f64(l, "price")?;
                        let size = field_f64(l, "size")?;
                        Some(BookLevel { price, size })
                    })
                    .collect()
            })
            .unwrap_or_default()
    };
    (side("bids"), side("asks"))
}

fn field_f64(v: &serde_json::Value, key: &str) -> Option<f64> {
    let field = v.get(key)?;
    if let Some(s) = field.as_str() {
        return s.parse().ok();
    }
    field.as_f64()
}

// ─── Feed task ───

/// Signal-path components request a burst of fast polling through this.
pub type FastPollTrigger = ();

/// Prediction-market feed: polls YES/NO books, maintains the BookTracker,
/// refreshes fee rates, handles market rollover at window boundaries and the
/// adaptive fast/slow cadence.
pub async fn run_market_feed(
    config: Config,
    http: reqwest::Client,
    snapshot_tx: watch::Sender<Option<MarketSnapshot>>,
    health_tx: watch::Sender<FeedHealth>,
    mut trigger_rx: mpsc::Receiver<FastPollTrigger>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut cache = MarketCache::new();
    let mut health = FeedHealth::new();
    let mut tracker: Option<BookTracker> = None;
    let mut market: Option<MarketInfo> = None;
    let mut fast_until_ms: i64 = 0;
    let mut last_fee_fetch_ms: i64 = 0;
    let mut last_prime_ms: i64 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }
        let now_ms = chrono::Utc::now().timestamp_millis();
        let now_s = now_ms / 1000;

        // Keep the discovery cache warm for the upcoming windows
        if now_ms - last_prime_ms >= 60_000 {
            last_prime_ms = now_ms;
            cache.prime(&http, &config, now_s).await;
        }

        // Rollover: window ended → clear the book state and resubscribe
        let rolled = market.as_ref().map_or(true, |m| !m.is_live(now_ms));
        if rolled {
            match cache.current_market(&http, &config, now_s).await {
                Ok(next) => {
                    info!(slug = %next.slug, "market window active");
                    match tracker.as_mut() {
                        Some(t) => t.reset(next.condition_id.clone()),
                        None => tracker = Some(BookTracker::new(next.condition_id.clone())),
                    }
                    market = Some(next);
                    let _ = snapshot_tx.send(None);
                    health.state = ConnState::Connected;
                    health.connected = true;
                    let _ = health_tx.send(health);
                }
                Err(e) => {
                    debug!(error = %e, "no active market, retrying");
                    health.state = ConnState::Connecting;
                    health.connected = false;
                    let _ = health_tx.send(health);
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                        _ = shutdown.changed() => {}
                    }
                    continue;
                }
            }
        }
        let (info, tracker_ref) = match (market.as_ref(), tracker.as_mut()) {
            (Some(i), Some(t)) => (i, t),
            _ => continue,
        };

        // Fee rates refresh on a 60 s TTL
        if (now_ms - last_fee_fetch_ms) as f64 / 1000.0 >= config.fee_refresh_s {
            last_fee_fetch_ms = now_ms;
            let yes_bps = fetch_fee_bps(&http, &config.clob_api_url, &info.yes_token_id).await;
            let no_bps = fetch_fee_bps(&http, &config.clob_api_url, &info.no_token_id).await;
            if let (Some(y), Some(n)) = (yes_bps, no_bps) {
                tracker_ref.set_fees(y, n);
            }
        }

        // Poll both books concurrently
        let (yes_book, no_book) = tokio::join!(
            fetch_book(&http, &config.clob_api_url, &info.yes_token_id),
            fetch_book(&http, &config.clob_api_url, &info.no_token_id),
        );

        let mut polled = false;
        match yes_book {
            Some((bids, asks)) => {
                tracker_ref.apply_yes(bids, asks);
                polled = true;
            }
            None => health.errors += 1,
        }
        match no_book {
            Some((bids, asks)) => {
                tracker_ref.apply_no(bids, asks);
                polled = true;
            }
            None => health.errors += 1,
        }

        if polled && tracker_ref.has_data() {
            health.last_msg_ms = now_ms;
            health.state = ConnState::Receiving;
            health.connected = true;
            let snap = tracker_ref.snapshot(now_ms);
            if snap.freeze_detected {
                debug!(
                    depth_change_pct = snap.depth_change_pct,
                    age_s = snap.orderbook_age_s,
                    "orderbook freeze detected, fast polling"
                );
                fast_until_ms = now_ms + (config.fast_poll_duration_s * 1000.0) as i64;
            }
            let _ = snapshot_tx.send(Some(snap));
        }
        let _ = health_tx.send(health);

        // External interest (divergence, emitted signal) also forces fast mode
        while trigger_rx.try_recv().is_ok() {
            fast_until_ms = now_ms + (config.fast_poll_duration_s * 1000.0) as i64;
        }

        let interval_ms = if now_ms < fast_until_ms {
            config.fast_poll_ms
        } else {
            config.slow_poll_ms
        };
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(interval_ms.max(50) as u64)) => {}
            _ = shutdown.changed() => {}
        }
    }
    info!("market feed stopped");
}

async fn fetch_book(
    http: &reqwest::Client,
    clob_api_url: &str,
    token_id: &str,
) -> Option<(Vec<BookLevel>, Vec<BookLevel>)> {
    let url = format!("{}/book", clob_api_url);
    let resp = http
        .get(&url)
        .query(&[("token_id", token_id)])
        .send()
        .await
        .ok()?;
    if !resp.status().is_success() {
        return None;
    }
    let v: serde_json::Value = resp.json().await.ok()?;
    Some(parse_book(&v))
}

async fn fetch_fee_bps(http: &reqwest::Client, clob_api_url: &str, token_id: &str) -> Option<u32> {
    let url = format!("{}/fee-rate", clob_api_url);
    let resp = http
        .get(&url)
        .query(&[("token_id", token_id)])
        .send()
        .await
        .ok()?;
    if !resp.status().is_success() {
        return None;
    }
    let v: serde_json::Value = resp.json().await.ok()?;
    v.get("fee_rate_bps")
        .and_then(|f| {
            f.as_u64()
                .or_else(|| f.as_str().and_then(|s| s.parse().ok()))
        })
        .map(|f| f as u32)
}
