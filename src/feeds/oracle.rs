use std::collections::VecDeque;
use std::str::FromStr;
use std::time::Duration;

use alloy::primitives::Address;
use alloy::providers::ProviderBuilder;
use alloy::sol;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::OracleSettings;
use crate::types::OracleState;

sol! {
    #[sol(rpc)]
    interface IAggregatorV3 {
        function decimals() external view returns (uint8);
        function description() external view returns (string);
        function latestRoundData() external view returns (
            uint80 roundId,
            int256 answer,
            uint256 startedAt,
            uint256 updatedAt,
            uint80 answeredInRound
        );
    }
}

const MAX_RETRY_INTERVAL_MS: u64 = 16_000;

/// Inter-arrival bookkeeping for oracle rounds.
#[derive(Clone, Debug)]
pub struct HeartbeatTracker {
    intervals: VecDeque<f64>,
    last_update_ms: Option<i64>,
    fast_threshold_s: f64,
}

impl HeartbeatTracker {
    pub const MAX_INTERVALS: usize = 20;
    pub const DEFAULT_INTERVAL_S: f64 = 60.0;

    pub fn new(fast_threshold_s: f64) -> Self {
        Self {
            intervals: VecDeque::with_capacity(Self::MAX_INTERVALS),
            last_update_ms: None,
            fast_threshold_s,
        }
    }

    /// Record a new round's updated_at timestamp.
    pub fn add_update(&mut self, updated_at_ms: i64) {
        if let Some(prev) = self.last_update_ms {
            let interval_s = (updated_at_ms - prev) as f64 / 1000.0;
            if interval_s > 0.0 {
                self.intervals.push_back(interval_s);
                while self.intervals.len() > Self::MAX_INTERVALS {
                    self.intervals.pop_front();
                }
            }
        }
        self.last_update_ms = Some(updated_at_ms);
    }

    /// Simple mean over the retained deque; 60 s before any data.
    pub fn avg_interval(&self) -> f64 {
        if self.intervals.is_empty() {
            return Self::DEFAULT_INTERVAL_S;
        }
        self.intervals.iter().sum::<f64>() / self.intervals.len() as f64
    }

    /// Most recent intervals (up to 5), oldest first.
    pub fn recent_intervals(&self) -> Vec<f64> {
        let skip = self.intervals.len().saturating_sub(5);
        self.intervals.iter().skip(skip).copied().collect()
    }

    /// True when the mean of the last ≥3 intervals is under the threshold;
    /// the oracle is repricing on deviation rather than heartbeat.
    pub fn is_fast_heartbeat(&self) -> bool {
        let recent = self.recent_intervals();
        if recent.len() < 3 {
            return false;
        }
        let avg = recent.iter().sum::<f64>() / recent.len() as f64;
        avg < self.fast_threshold_s
    }

    pub fn estimate_next_update_ms(&self, now_ms: i64) -> i64 {
        let base = self.last_update_ms.unwrap_or(now_ms);
        base + (self.avg_interval() * 1000.0) as i64
    }
}

/// Round-by-round state reducer: feeds round data in, yields OracleState
/// snapshots and flags genuinely new rounds. The network layer stays thin so
/// this logic is testable offline.
#[derive(Clone, Debug)]
pub struct OracleTracker {
    heartbeat: HeartbeatTracker,
    last_round_id: u64,
}

impl OracleTracker {
    pub fn new(fast_threshold_s: f64) -> Self {
        Self {
            heartbeat: HeartbeatTracker::new(fast_threshold_s),
            last_round_id: 0,
        }
    }

    /// Apply one poll result. Returns (state, is_new_round).
    pub fn on_round(
        &mut self,
        round_id: u64,
        value: f64,
        updated_at_ms: i64,
        now_ms: i64,
    ) -> (OracleState, bool) {
        let mut new_round = false;
        if round_id > self.last_round_id {
            if self.last_round_id > 0 {
                self.heartbeat.add_update(updated_at_ms);
                new_round = true;
            } else {
                // First observation seeds the tracker without an interval
                self.heartbeat.add_update(updated_at_ms);
            }
            self.last_round_id = round_id;
        }

        let state = OracleState {
            value,
            updated_at_ms,
            round_id,
            recent_intervals: self.heartbeat.recent_intervals(),
            avg_interval: self.heartbeat.avg_interval(),
            next_estimate_ms: self.heartbeat.estimate_next_update_ms(now_ms),
            fast_heartbeat: self.heartbeat.is_fast_heartbeat(),
        };
        (state, new_round)
    }
}

/// Poll-driven oracle feed against a Chainlink-style aggregator. Transient
/// errors double the retry interval (capped) and never stop the loop.
pub async fn run_oracle_feed(
    cfg: OracleSettings,
    state_tx: watch::Sender<Option<OracleState>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let address = match Address::from_str(&cfg.feed_address) {
        Ok(a) => a,
        Err(e) => {
            warn!(error = %e, address = %cfg.feed_address, "bad oracle feed address, oracle disabled");
            return;
        }
    };

    // Establish the provider; retry with backoff until shutdown
    let provider = loop {
        if *shutdown.borrow() {
            return;
        }
        match ProviderBuilder::new().connect(&cfg.rpc_url).await {
            Ok(p) => break p,
            Err(e) => {
                warn!(error = %e, "oracle RPC connect failed, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    };
    let aggregator = IAggregatorV3::new(address, provider);

    // Decimals are immutable per feed; fetch once, retrying transiently
    let decimals: u8 = loop {
        if *shutdown.borrow() {
            return;
        }
        match aggregator.decimals().call().await {
            Ok(d) => break d,
            Err(e) => {
                warn!(error = %e, "oracle decimals() failed, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(2)) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    };
    let scale = 10_f64.powi(decimals as i32);
    info!(address = %cfg.feed_address, decimals, "oracle feed connected");

    let mut tracker = OracleTracker::new(cfg.fast_heartbeat_threshold);
    let base_interval_ms = cfg.poll_interval_ms.max(100) as u64;
    let mut retry_interval_ms = base_interval_ms;
    let mut error_count: u64 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }
        match aggregator.latestRoundData().call().await {
            Ok(round) => {
                retry_interval_ms = base_interval_ms;
                let round_id = round.roundId.to::<u64>();
                let answer = i128::try_from(round.answer).unwrap_or(0);
                let updated_at_ms = round.updatedAt.to::<u64>() as i64 * 1000;
                let now_ms = chrono::Utc::now().timestamp_millis();
                let value = answer as f64 / scale;

                if value <= 0.0 {
                    error_count += 1;
                    debug!(round_id, "oracle returned non-positive answer, dropped");
                } else {
                    let (state, new_round) = tracker.on_round(round_id, value, updated_at_ms, now_ms);
                    if new_round {
                        info!(
                            round_id,
                            value,
                            age_s = state.age_s(now_ms),
                            avg_interval = state.avg_interval,
                            "oracle updated"
                        );
                    }
                    let _ = state_tx.send(Some(state));
                }
            }
            Err(e) => {
                error_count += 1;
                retry_interval_ms = (retry_interval_ms * 2).min(MAX_RETRY_INTERVAL_MS);
                warn!(error = %e, error_count, retry_ms = retry_interval_ms, "oracle poll failed");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(retry_interval_ms)) => {}
            _ = shutdown.changed() => {}
        }
    }
    info!("oracle feed stopped");
}
