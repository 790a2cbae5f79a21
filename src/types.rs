use serde::Serialize;

// ─── Spot venues ───

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Venue {
    Binance,
    Coinbase,
    Kraken,
}

impl Venue {
    pub const ALL: [Venue; 3] = [Venue::Binance, Venue::Coinbase, Venue::Kraken];

    pub fn label(&self) -> &'static str {
        match self {
            Venue::Binance => "binance",
            Venue::Coinbase => "coinbase",
            Venue::Kraken => "kraken",
        }
    }

    /// Slot index for per-venue arrays.
    #[inline]
    pub fn idx(&self) -> usize {
        match self {
            Venue::Binance => 0,
            Venue::Coinbase => 1,
            Venue::Kraken => 2,
        }
    }
}

impl std::fmt::Display for Venue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// One trade from a spot venue, normalized. Order across venues is not enforced.
#[derive(Clone, Debug)]
pub struct SpotTick {
    pub venue: Venue,
    pub symbol: String,
    pub price: f64,
    pub size: f64,
    pub venue_ts_ms: i64,
    pub local_ts_ms: i64,
}

impl SpotTick {
    /// Volume in quote-currency terms.
    #[inline]
    pub fn quote_volume(&self) -> f64 {
        self.price * self.size
    }
}

/// Snapshot materialised from one venue's PriceBuffer. Recomputed on each
/// tick; readers never mutate it.
#[derive(Clone, Debug, Serialize)]
pub struct ExchangeMetrics {
    pub venue: Venue,
    pub price: f64,
    pub venue_ts_ms: i64,
    pub local_ts_ms: i64,
    pub move_30s: f64,
    pub velocity_30s: f64,
    pub volatility_30s: f64,
    pub vol_1m: f64,
    pub vol_5m_avg: f64,
    pub atr_5m: f64,
    pub max_move_10s: f64,
}

/// A large taker print forwarded by a spot-feed listener into the order-flow
/// tracker. Direction is inferred from the tick-to-tick price change.
#[derive(Clone, Copy, Debug)]
pub struct FlowEvent {
    pub ts_ms: i64,
    pub is_buy: bool,
    pub notional: f64,
}

// ─── Consensus ───

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VolRegime {
    Low,
    Normal,
    High,
}

impl VolRegime {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolRegime::Low => "low",
            VolRegime::Normal => "normal",
            VolRegime::High => "high",
        }
    }
}

/// Cross-venue aggregate produced by the consensus engine.
#[derive(Clone, Debug, Serialize)]
pub struct ConsensusData {
    pub price: f64,
    pub ts_ms: i64,
    /// Fresh venues that contributed to this consensus.
    pub venues: Vec<ExchangeMetrics>,
    pub move_30s: f64,
    pub vol_30s: f64,
    pub atr_5m: f64,
    pub regime: VolRegime,
    pub max_10s_move: f64,
    pub spike_concentration: f64,
    pub total_vol_1m: f64,
    pub avg_vol_5m: f64,
    pub surge_ratio: f64,
    pub agree: bool,
    pub max_dev_pct: f64,
    pub agreement_score: f64,
    pub venue_count: usize,
}

// ─── Oracle ───

#[derive(Clone, Debug, Serialize)]
pub struct OracleState {
    pub value: f64,
    pub updated_at_ms: i64,
    pub round_id: u64,
    pub recent_intervals: Vec<f64>,
    pub avg_interval: f64,
    pub next_estimate_ms: i64,
    pub fast_heartbeat: bool,
}

impl OracleState {
    /// Age is recomputed at read time from the caller's clock.
    #[inline]
    pub fn age_s(&self, now_ms: i64) -> f64 {
        (now_ms - self.updated_at_ms).max(0) as f64 / 1000.0
    }
}

// ─── Prediction market ───

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TokenSide {
    Yes,
    No,
}

/// Point-in-time prediction-market orderbook state. One writer (the market
/// feed), many readers via snapshot.
#[derive(Clone, Debug, Serialize)]
pub struct MarketSnapshot {
    pub market_id: String,
    pub ts_ms: i64,
    pub yes_bid: f64,
    pub yes_ask: f64,
    pub no_bid: f64,
    pub no_ask: f64,
    pub yes_liq_best: f64,
    pub no_liq_best: f64,
    pub yes_depth_3: Vec<BookLevel>,
    pub no_depth_3: Vec<BookLevel>,
    pub spread: f64,
    pub implied_prob: f64,
    pub liq_30s_ago: f64,
    pub liq_60s_ago: f64,
    pub liq_collapsing: bool,
    /// (yes_depth − no_depth) / (yes_depth + no_depth) over the top 5 levels.
    pub imbalance: f64,
    pub yes_depth_total: f64,
    pub no_depth_total: f64,
    pub last_price_change_ms: i64,
    pub orderbook_age_s: f64,
    pub freeze_detected: bool,
    pub depth_change_pct: f64,
    pub yes_fee_bps: u32,
    pub no_fee_bps: u32,
}

impl MarketSnapshot {
    /// Effective taker fee for a trade of `side` at `price`. Makers pay zero;
    /// the caller handles that case.
    pub fn effective_taker_fee(&self, side: TokenSide, price: f64) -> f64 {
        let bps = match side {
            TokenSide::Yes => self.yes_fee_bps,
            TokenSide::No => self.no_fee_bps,
        };
        let base = bps as f64 / 10_000.0;
        match side {
            TokenSide::Yes => base * price,
            TokenSide::No => base * (1.0 - price),
        }
    }

    /// Multiplicative penalty when yes_bid + no_bid drifts away from 1.0.
    /// Penalises both under- and over-sum books; 1.0 inside the tolerance.
    pub fn prob_sum_penalty(&self, tolerance: f64) -> f64 {
        if self.yes_bid <= 0.0 || self.no_bid <= 0.0 {
            return 1.0;
        }
        let sum = self.yes_bid + self.no_bid;
        if (sum - 1.0).abs() <= tolerance {
            return 1.0;
        }
        sum.min(2.0 - sum).clamp(0.0, 1.0)
    }
}

// ─── Signals ───

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Up => write!(f, "UP"),
            Direction::Down => write!(f, "DOWN"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Standard,
    EscapeClause,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Standard => "standard",
            SignalKind::EscapeClause => "escape_clause",
        }
    }
}

/// First-class outcome recorded on every rejected candidate. Not failures of
/// the system.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    ConsensusFailure,
    InsufficientMove,
    SmoothDrift,
    VolumeLow,
    OracleTooFresh,
    OracleTooStale,
    FastHeartbeatMode,
    LiquidityLow,
    LiquidityCollapsing,
    SpreadConverging,
    DirectionReversed,
    HistoricalWinRateLow,
    SlippageTooHigh,
    GasTooHigh,
    FeeUnfavorable,
    VolatilityTooHigh,
    ConfidenceTooLow,
    FeedStale,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::ConsensusFailure => "consensus_failure",
            RejectReason::InsufficientMove => "insufficient_move",
            RejectReason::SmoothDrift => "smooth_drift",
            RejectReason::VolumeLow => "volume_low",
            RejectReason::OracleTooFresh => "oracle_too_fresh",
            RejectReason::OracleTooStale => "oracle_too_stale",
            RejectReason::FastHeartbeatMode => "fast_heartbeat_mode",
            RejectReason::LiquidityLow => "liquidity_low",
            RejectReason::LiquidityCollapsing => "liquidity_collapsing",
            RejectReason::SpreadConverging => "spread_converging",
            RejectReason::DirectionReversed => "direction_reversed",
            RejectReason::HistoricalWinRateLow => "historical_win_rate_low",
            RejectReason::SlippageTooHigh => "slippage_too_high",
            RejectReason::GasTooHigh => "gas_too_high",
            RejectReason::FeeUnfavorable => "fee_unfavorable",
            RejectReason::VolatilityTooHigh => "volatility_too_high",
            RejectReason::ConfidenceTooLow => "confidence_too_low",
            RejectReason::FeedStale => "feed_stale",
        }
    }
}

// ─── Scoring ───

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Tier {
    #[serde(rename = "EXCELLENT")]
    Excellent,
    #[serde(rename = "VERY_GOOD")]
    VeryGood,
    #[serde(rename = "GOOD")]
    Good,
    #[serde(rename = "MODERATE")]
    Moderate,
    #[serde(rename = "LOW")]
    Low,
}

impl Tier {
    pub fn from_confidence(c: f64) -> Tier {
        if c >= 0.85 {
            Tier::Excellent
        } else if c >= 0.75 {
            Tier::VeryGood
        } else if c >= 0.65 {
            Tier::Good
        } else if c >= 0.55 {
            Tier::Moderate
        } else {
            Tier::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Excellent => "EXCELLENT",
            Tier::VeryGood => "VERY_GOOD",
            Tier::Good => "GOOD",
            Tier::Moderate => "MODERATE",
            Tier::Low => "LOW",
        }
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ConfidenceBreakdown {
    pub divergence: f64,
    pub pm_staleness: f64,
    pub consensus_strength: f64,
    pub liquidity: f64,
    pub volume_surge: f64,
    pub spike_concentration: f64,
    pub maker_advantage: f64,
    // Retained in the log schema for older tooling; their weights stay zero.
    pub oracle_age: f64,
    pub misalignment: f64,
    pub spread_anomaly: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct ScoringData {
    pub confidence: f64,
    pub tier: Tier,
    pub breakdown: ConfidenceBreakdown,
    pub escape_penalty: f64,
    pub prob_sum_penalty: f64,
    pub time_multiplier: f64,
    pub ensemble_boost: f64,
}

// ─── Validation ───

#[derive(Clone, Debug, Serialize)]
pub struct ValidationResult {
    pub passed: bool,
    pub directional_persistence: bool,
    pub liquidity_sufficient: bool,
    pub liquidity_not_collapsing: bool,
    pub oracle_window_safe: bool,
    pub spread_not_converging: bool,
    pub volume_authenticated: bool,
    pub spike_not_smooth_drift: bool,
    pub historical_win_rate: f64,
    pub rejection: Option<RejectReason>,
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self {
            passed: true,
            directional_persistence: true,
            liquidity_sufficient: true,
            liquidity_not_collapsing: true,
            oracle_window_safe: true,
            spread_not_converging: true,
            volume_authenticated: true,
            spike_not_smooth_drift: true,
            historical_win_rate: 0.0,
            rejection: None,
        }
    }
}

impl ValidationResult {
    /// Record a failed check; the earliest rejection reason is surfaced.
    pub fn fail(&mut self, reason: RejectReason) {
        self.passed = false;
        if self.rejection.is_none() {
            self.rejection = Some(reason);
        }
    }
}

// ─── Candidate ───

/// Created by the detector, enriched by the validator and scorer, consumed by
/// the mode dispatcher. Never modified after the dispatcher accepts it.
#[derive(Clone, Debug, Serialize)]
pub struct SignalCandidate {
    pub signal_id: String,
    pub ts_ms: i64,
    pub market_id: String,
    pub direction: Direction,
    pub kind: SignalKind,
    pub consensus: ConsensusData,
    pub oracle: OracleState,
    pub market: MarketSnapshot,
    pub scoring: Option<ScoringData>,
    pub validation: Option<ValidationResult>,
}

/// Ring entry for historical win-rate estimation.
#[derive(Clone, Copy, Debug)]
pub struct HistoryRecord {
    pub ts_ms: i64,
    pub kind: SignalKind,
    pub direction: Direction,
    pub oracle_age: f64,
    pub regime: VolRegime,
    pub won: bool,
}

// ─── Positions ───

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    SpreadConverged,
    LiquidityCollapse,
    TimeLimit,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::TakeProfit => "take_profit",
            ExitReason::StopLoss => "stop_loss",
            ExitReason::SpreadConverged => "spread_converged",
            ExitReason::LiquidityCollapse => "liquidity_collapse",
            ExitReason::TimeLimit => "time_limit",
        }
    }
}

#[cfg(test)]
pub(crate) fn test_snapshot() -> MarketSnapshot {
    MarketSnapshot {
        market_id: "mkt-test".to_string(),
        ts_ms: 0,
        yes_bid: 0.50,
        yes_ask: 0.52,
        no_bid: 0.48,
        no_ask: 0.50,
        yes_liq_best: 100.0,
        no_liq_best: 100.0,
        yes_depth_3: vec![
            BookLevel { price: 0.50, size: 60.0 },
            BookLevel { price: 0.51, size: 40.0 },
            BookLevel { price: 0.52, size: 30.0 },
        ],
        no_depth_3: vec![
            BookLevel { price: 0.48, size: 50.0 },
            BookLevel { price: 0.49, size: 40.0 },
            BookLevel { price: 0.50, size: 30.0 },
        ],
        spread: 0.02,
        implied_prob: 0.51,
        liq_30s_ago: 100.0,
        liq_60s_ago: 100.0,
        liq_collapsing: false,
        imbalance: 0.0,
        yes_depth_total: 200.0,
        no_depth_total: 200.0,
        last_price_change_ms: 0,
        orderbook_age_s: 20.0,
        freeze_detected: false,
        depth_change_pct: 0.0,
        yes_fee_bps: 25,
        no_fee_bps: 25,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scenario: 100 bps base fee on both tokens, trade priced at 0.60.
    /// Expected: YES fee scales with price (0.01 * 0.60), NO fee with 1 - price.
    #[test]
    fn test_effective_taker_fee_by_side() {
        let mut snap = test_snapshot();
        snap.yes_fee_bps = 100;
        snap.no_fee_bps = 100;
        assert!((snap.effective_taker_fee(TokenSide::Yes, 0.60) - 0.006).abs() < 1e-12);
        assert!((snap.effective_taker_fee(TokenSide::No, 0.60) - 0.004).abs() < 1e-12);
    }

    /// Scenario: yes_bid + no_bid sums exactly to 1.0 (0.55 + 0.45).
    /// Expected: No penalty; the book is internally consistent.
    #[test]
    fn test_prob_sum_penalty_balanced() {
        let mut snap = test_snapshot();
        snap.yes_bid = 0.55;
        snap.no_bid = 0.45;
        assert_eq!(snap.prob_sum_penalty(0.05), 1.0);
    }

    /// Scenario: under-sum book (0.40 + 0.40 = 0.80) beyond the tolerance.
    /// Expected: Penalty is min(sum, 2 - sum) = 0.80.
    #[test]
    fn test_prob_sum_penalty_under() {
        let mut snap = test_snapshot();
        snap.yes_bid = 0.40;
        snap.no_bid = 0.40;
        assert!((snap.prob_sum_penalty(0.05) - 0.80).abs() < 1e-12);
    }

    /// Scenario: over-sum book (0.60 + 0.55 = 1.15).
    /// Expected: Penalty is 2 - 1.15 = 0.85, penalising over-round books too.
    #[test]
    fn test_prob_sum_penalty_over() {
        let mut snap = test_snapshot();
        snap.yes_bid = 0.60;
        snap.no_bid = 0.55;
        assert!((snap.prob_sum_penalty(0.05) - 0.85).abs() < 1e-12);
    }

    /// Scenario: one side of the book is empty (no_bid = 0).
    /// Expected: No penalty; the sum is meaningless on a one-sided book.
    #[test]
    fn test_prob_sum_penalty_one_sided() {
        let mut snap = test_snapshot();
        snap.no_bid = 0.0;
        assert_eq!(snap.prob_sum_penalty(0.05), 1.0);
    }

    /// Scenario: confidence values at each tier boundary.
    /// Expected: 0.85→EXCELLENT, 0.75→VERY_GOOD, 0.65→GOOD, 0.55→MODERATE, else LOW.
    #[test]
    fn test_tier_boundaries() {
        assert_eq!(Tier::from_confidence(0.85), Tier::Excellent);
        assert_eq!(Tier::from_confidence(0.849), Tier::VeryGood);
        assert_eq!(Tier::from_confidence(0.75), Tier::VeryGood);
        assert_eq!(Tier::from_confidence(0.65), Tier::Good);
        assert_eq!(Tier::from_confidence(0.55), Tier::Moderate);
        assert_eq!(Tier::from_confidence(0.30), Tier::Low);
    }

    /// Scenario: two checks fail in sequence on one ValidationResult.
    /// Expected: passed goes false and the FIRST reason is retained.
    #[test]
    fn test_validation_earliest_reason_wins() {
        let mut v = ValidationResult::default();
        v.fail(RejectReason::VolumeLow);
        v.fail(RejectReason::SmoothDrift);
        assert!(!v.passed);
        assert_eq!(v.rejection, Some(RejectReason::VolumeLow));
    }

    /// Scenario: oracle updated 12.5 seconds before the read clock.
    /// Expected: age_s computed from the caller-supplied now; a clock behind
    /// the update clamps to zero.
    #[test]
    fn test_oracle_age_recomputed_at_read() {
        let oracle = OracleState {
            value: 50_000.0,
            updated_at_ms: 100_000,
            round_id: 7,
            recent_intervals: vec![],
            avg_interval: 60.0,
            next_estimate_ms: 160_000,
            fast_heartbeat: false,
        };
        assert!((oracle.age_s(112_500) - 12.5).abs() < 1e-12);
        assert_eq!(oracle.age_s(50_000), 0.0);
    }
}
