use std::collections::VecDeque;

use chrono::Timelike;
use tracing::debug;

use crate::types::{Direction, FlowEvent, SignalCandidate};

fn hour_of_day(ts_ms: i64) -> u32 {
    chrono::DateTime::from_timestamp_millis(ts_ms)
        .map(|dt| dt.hour())
        .unwrap_or(0)
}

fn median_f64(values: &mut Vec<f64>) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    }
}

// ─── Market-maker lag ───

#[derive(Clone, Copy, Debug)]
struct MmResponse {
    lag_ms: i64,
    hour_of_day: u32,
}

/// Tracks how long market makers take to reprice after an oracle update.
/// Queries answer with the median lag in a ±2-hour time-of-day window.
pub struct MmLagTracker {
    responses: VecDeque<MmResponse>,
    max_records: usize,
}

impl MmLagTracker {
    pub const DEFAULT_LAG_MS: f64 = 8000.0;
    const MAX_LAG_MS: i64 = 120_000;
    const MIN_SAMPLES: usize = 10;

    pub fn new(max_records: usize) -> Self {
        Self {
            responses: VecDeque::with_capacity(max_records.min(256)),
            max_records,
        }
    }

    /// Record an (oracle update, PM reprice) pair. Lags outside [0, 120 s]
    /// are discarded as clock noise.
    pub fn record(&mut self, oracle_update_ms: i64, pm_change_ms: i64) {
        let lag_ms = pm_change_ms - oracle_update_ms;
        if !(0..=Self::MAX_LAG_MS).contains(&lag_ms) {
            return;
        }
        self.responses.push_back(MmResponse {
            lag_ms,
            hour_of_day: hour_of_day(pm_change_ms),
        });
        while self.responses.len() > self.max_records {
            self.responses.pop_front();
        }
        debug!(lag_ms, "mm response recorded");
    }

    pub fn len(&self) -> usize {
        self.responses.len()
    }

    /// Expected lag for the given hour, from records within ±2 hours
    /// (wrapping midnight). Defaults to 8 s with thin data.
    pub fn expected_lag_ms(&self, hour: u32) -> f64 {
        let mut lags: Vec<f64> = self
            .responses
            .iter()
            .filter(|r| {
                let diff = (r.hour_of_day as i32 - hour as i32).abs();
                diff <= 2 || diff >= 22
            })
            .map(|r| r.lag_ms as f64)
            .collect();
        if lags.len() < Self::MIN_SAMPLES {
            return Self::DEFAULT_LAG_MS;
        }
        median_f64(&mut lags)
    }

    /// How early we are relative to the expected MM response.
    pub fn lag_score(&self, oracle_age_s: f64, hour: u32) -> f64 {
        let expected = self.expected_lag_ms(hour);
        let age_ms = oracle_age_s * 1000.0;
        if age_ms < 0.5 * expected {
            1.0
        } else if age_ms < expected {
            0.7
        } else if age_ms < 1.5 * expected {
            0.4
        } else {
            0.0
        }
    }
}

// ─── Oracle update prediction ───

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateTrigger {
    Deviation,
    Heartbeat,
}

#[derive(Clone, Copy, Debug)]
pub struct UpdatePrediction {
    pub seconds_until: f64,
    pub confidence: f64,
    pub trigger: UpdateTrigger,
    pub typical_heartbeat_s: f64,
}

/// Predicts the next oracle update from recorded update times. Oracles fire
/// on a heartbeat interval or when spot deviates past a threshold.
pub struct OracleUpdatePredictor {
    update_times_ms: VecDeque<i64>,
    max_records: usize,
}

impl OracleUpdatePredictor {
    pub const DEFAULT_HEARTBEAT_S: f64 = 60.0;
    pub const DEVIATION_THRESHOLD: f64 = 0.005;
    const MIN_RECORDS: usize = 5;

    pub fn new(max_records: usize) -> Self {
        Self {
            update_times_ms: VecDeque::with_capacity(max_records.min(128)),
            max_records,
        }
    }

    pub fn record_update(&mut self, ts_ms: i64) {
        self.update_times_ms.push_back(ts_ms);
        while self.update_times_ms.len() > self.max_records {
            self.update_times_ms.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.update_times_ms.len()
    }

    /// Median inter-arrival interval, sanity-bounded to [10 s, 300 s].
    pub fn typical_heartbeat_s(&self) -> f64 {
        if self.update_times_ms.len() < Self::MIN_RECORDS {
            return Self::DEFAULT_HEARTBEAT_S;
        }
        let mut intervals: Vec<f64> = self
            .update_times_ms
            .iter()
            .zip(self.update_times_ms.iter().skip(1))
            .map(|(a, b)| (b - a) as f64 / 1000.0)
            .filter(|i| *i > 10.0 && *i < 300.0)
            .collect();
        if intervals.is_empty() {
            return Self::DEFAULT_HEARTBEAT_S;
        }
        median_f64(&mut intervals)
    }

    /// Predict the next update given the current oracle age and the absolute
    /// spot-oracle deviation.
    pub fn predict(&self, oracle_age_s: f64, deviation_pct: f64) -> UpdatePrediction {
        let typical = self.typical_heartbeat_s();
        if deviation_pct >= Self::DEVIATION_THRESHOLD {
            UpdatePrediction {
                seconds_until: (10.0 - oracle_age_s).max(5.0),
                confidence: 0.9,
                trigger: UpdateTrigger::Deviation,
                typical_heartbeat_s: typical,
            }
        } else {
            UpdatePrediction {
                seconds_until: (typical - oracle_age_s).max(5.0),
                confidence: 0.7,
                trigger: UpdateTrigger::Heartbeat,
                typical_heartbeat_s: typical,
            }
        }
    }

    pub fn is_update_imminent(
        &self,
        oracle_age_s: f64,
        deviation_pct: f64,
        threshold_s: f64,
    ) -> bool {
        let prediction = self.predict(oracle_age_s, deviation_pct);
        prediction.seconds_until < threshold_s && prediction.confidence > 0.6
    }
}

// ─── Time-of-day ───

#[derive(Clone, Copy, Debug, Default)]
pub struct HourStats {
    pub wins: u32,
    pub losses: u32,
    pub profit: f64,
}

impl HourStats {
    pub fn total(&self) -> u32 {
        self.wins + self.losses
    }

    pub fn win_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.wins as f64 / total as f64
    }
}

/// Per-hour win-rate ledger feeding a confidence multiplier. MM competition
/// varies strongly by hour.
pub struct TimeOfDayAnalyzer {
    hours: [HourStats; 24],
}

impl TimeOfDayAnalyzer {
    const MIN_SAMPLES: u32 = 5;

    pub fn new() -> Self {
        Self {
            hours: [HourStats::default(); 24],
        }
    }

    pub fn record_outcome(&mut self, ts_ms: i64, won: bool, profit: f64) {
        let stats = &mut self.hours[hour_of_day(ts_ms) as usize];
        if won {
            stats.wins += 1;
        } else {
            stats.losses += 1;
        }
        stats.profit += profit;
    }

    pub fn stats(&self, hour: u32) -> HourStats {
        self.hours[(hour % 24) as usize]
    }

    /// 1.0 above a 70% hourly win rate, 0.85 above 55%, else 0.70; a neutral
    /// 0.90 with fewer than 5 samples.
    pub fn confidence_multiplier(&self, hour: u32) -> f64 {
        let stats = self.hours[(hour % 24) as usize];
        if stats.total() < Self::MIN_SAMPLES {
            return 0.90;
        }
        let wr = stats.win_rate();
        if wr >= 0.70 {
            1.0
        } else if wr >= 0.55 {
            0.85
        } else {
            0.70
        }
    }

    pub fn favorable_hours(&self, min_win_rate: f64, min_samples: u32) -> Vec<u32> {
        (0..24)
            .filter(|&h| {
                let s = self.hours[h as usize];
                s.total() >= min_samples && s.win_rate() >= min_win_rate
            })
            .collect()
    }
}

impl Default for TimeOfDayAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Order flow ───

/// Bounded record of large prints; answers what fraction of recent large
/// volume agrees with a proposed direction.
pub struct OrderFlowTracker {
    orders: VecDeque<FlowEvent>,
    max_records: usize,
    large_order_threshold: f64,
}

impl OrderFlowTracker {
    const LOOKBACK_MS: i64 = 30_000;

    pub fn new(max_records: usize, large_order_threshold: f64) -> Self {
        Self {
            orders: VecDeque::with_capacity(max_records.min(64)),
            max_records,
            large_order_threshold,
        }
    }

    pub fn record(&mut self, event: FlowEvent) {
        if event.notional < self.large_order_threshold {
            return;
        }
        self.orders.push_back(event);
        while self.orders.len() > self.max_records {
            self.orders.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    /// Fraction of large-order volume in the last 30 s agreeing with the
    /// direction. 0.5 (neutral) with no recent records.
    pub fn flow_score(&self, direction: Direction, now_ms: i64) -> f64 {
        let cutoff = now_ms - Self::LOOKBACK_MS;
        let recent: Vec<&FlowEvent> = self.orders.iter().filter(|o| o.ts_ms > cutoff).collect();
        if recent.is_empty() {
            return 0.5;
        }
        let total: f64 = recent.iter().map(|o| o.notional).sum();
        if total <= 0.0 {
            return 0.5;
        }
        let favorable: f64 = recent
            .iter()
            .filter(|o| match direction {
                Direction::Up => o.is_buy,
                Direction::Down => !o.is_buy,
            })
            .map(|o| o.notional)
            .sum();
        favorable / total
    }
}

// ─── Ensemble ───

#[derive(Clone, Copy, Debug)]
pub struct EnsembleResult {
    pub volume_momentum: bool,
    pub orderbook_pressure: bool,
    pub price_velocity: bool,
    pub oracle_timing: bool,
    pub confirmations: u32,
    pub boost: f64,
}

/// Counts independent confirmation models. Signals confirmed by several
/// models win more often; the boost rewards 4/4 and taxes weak agreement.
pub struct EnsembleFilter;

impl EnsembleFilter {
    pub fn evaluate(candidate: &SignalCandidate, now_ms: i64) -> EnsembleResult {
        let consensus = &candidate.consensus;
        let market = &candidate.market;
        let oracle_age = candidate.oracle.age_s(now_ms);

        let volume_momentum =
            consensus.surge_ratio >= 2.5 && consensus.move_30s.abs() >= 0.008;
        // Betting with the thin side: less resting competition ahead of us
        let orderbook_pressure = match candidate.direction {
            Direction::Up => market.imbalance < -0.15,
            Direction::Down => market.imbalance > 0.15,
        };
        let price_velocity = consensus.spike_concentration > 0.65;
        let oracle_timing = (20.0..=60.0).contains(&oracle_age);

        let confirmations = [volume_momentum, orderbook_pressure, price_velocity, oracle_timing]
            .iter()
            .filter(|c| **c)
            .count() as u32;
        let boost = match confirmations {
            4 => 1.10,
            3 => 1.00,
            2 => 0.90,
            _ => 0.80,
        };
        EnsembleResult {
            volume_momentum,
            orderbook_pressure,
            price_velocity,
            oracle_timing,
            confirmations,
            boost,
        }
    }
}

// ─── Combined overlay ───

#[derive(Clone, Copy, Debug)]
pub struct IntelScore {
    pub mm_lag_score: f64,
    pub time_multiplier: f64,
    pub order_flow_score: f64,
    pub ensemble_boost: f64,
    pub combined_multiplier: f64,
    pub oracle_update_imminent: bool,
}

/// Aggregate of the four sub-trackers plus the ensemble filter.
pub struct MarketIntelligence {
    pub mm_lag: MmLagTracker,
    pub oracle_predictor: OracleUpdatePredictor,
    pub time_analyzer: TimeOfDayAnalyzer,
    pub order_flow: OrderFlowTracker,
}

impl MarketIntelligence {
    pub fn new() -> Self {
        Self {
            mm_lag: MmLagTracker::new(200),
            oracle_predictor: OracleUpdatePredictor::new(100),
            time_analyzer: TimeOfDayAnalyzer::new(),
            order_flow: OrderFlowTracker::new(50, 1000.0),
        }
    }

    pub fn evaluate(&self, candidate: &SignalCandidate, now_ms: i64) -> IntelScore {
        let hour = hour_of_day(now_ms);
        let oracle_age = candidate.oracle.age_s(now_ms);

        let mm_lag_score = self.mm_lag.lag_score(oracle_age, hour);
        let time_multiplier = self.time_analyzer.confidence_multiplier(hour);
        let order_flow_score = self.order_flow.flow_score(candidate.direction, now_ms);
        let ensemble = EnsembleFilter::evaluate(candidate, now_ms);

        let deviation_pct = if candidate.oracle.value > 0.0 {
            ((candidate.consensus.price - candidate.oracle.value) / candidate.oracle.value).abs()
        } else {
            0.0
        };
        let oracle_update_imminent =
            self.oracle_predictor
                .is_update_imminent(oracle_age, deviation_pct, 15.0);

        let combined_multiplier = 0.30 * (0.8 + 0.4 * mm_lag_score)
            + 0.20 * time_multiplier
            + 0.10 * (0.9 + 0.2 * order_flow_score)
            + 0.40 * ensemble.boost;

        IntelScore {
            mm_lag_score,
            time_multiplier,
            order_flow_score,
            ensemble_boost: ensemble.boost,
            combined_multiplier,
            oracle_update_imminent,
        }
    }

    pub fn record_outcome(&mut self, ts_ms: i64, won: bool, profit: f64) {
        self.time_analyzer.record_outcome(ts_ms, won, profit);
    }
}

impl Default for MarketIntelligence {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::detector::test_fixtures::*;
    use crate::types::SignalKind;

    const NOW: i64 = 1_768_473_000_000; // 2026-01-15T10:30 UTC

    /// Scenario: fewer than 10 lag records near the queried hour.
    /// Expected: The 8-second default lag.
    #[test]
    fn test_mm_lag_default() {
        let tracker = MmLagTracker::new(200);
        assert_eq!(tracker.expected_lag_ms(10), MmLagTracker::DEFAULT_LAG_MS);
    }

    /// Scenario: twelve ~6s lags recorded at the same hour, one extreme 110s.
    /// Expected: Median lands on 6s territory, robust to the outlier.
    #[test]
    fn test_mm_lag_median() {
        let mut tracker = MmLagTracker::new(200);
        for i in 0..12 {
            let oracle_ms = NOW + i * 60_000;
            tracker.record(oracle_ms, oracle_ms + 6_000);
        }
        tracker.record(NOW, NOW + 110_000);
        let hour = hour_of_day(NOW);
        let expected = tracker.expected_lag_ms(hour);
        assert!((expected - 6_000.0).abs() < 1e-9, "median = {}", expected);
    }

    /// Scenario: lags of −5 s and 130 s offered to the tracker.
    /// Expected: Both clamped away (discarded).
    #[test]
    fn test_mm_lag_rejects_out_of_range() {
        let mut tracker = MmLagTracker::new(200);
        tracker.record(NOW, NOW - 5_000);
        tracker.record(NOW, NOW + 130_000);
        assert_eq!(tracker.len(), 0);
    }

    /// Scenario: lag scores across the early→late spectrum vs an 8s default.
    /// Expected: 1.0 when very early, 0.0 when late.
    #[test]
    fn test_mm_lag_score_tiers() {
        let tracker = MmLagTracker::new(200);
        assert_eq!(tracker.lag_score(2.0, 10), 1.0); // 2s < 4s
        assert_eq!(tracker.lag_score(6.0, 10), 0.7); // < 8s
        assert_eq!(tracker.lag_score(10.0, 10), 0.4); // < 12s
        assert_eq!(tracker.lag_score(20.0, 10), 0.0);
    }

    /// Scenario: updates at a clean 60-second cadence.
    /// Expected: Typical heartbeat = 60 s.
    #[test]
    fn test_predictor_typical_heartbeat() {
        let mut predictor = OracleUpdatePredictor::new(100);
        for i in 0..10 {
            predictor.record_update(NOW + i * 60_000);
        }
        assert!((predictor.typical_heartbeat_s() - 60.0).abs() < 1e-9);
    }

    /// Scenario: 0.7% spot deviation with a 3-second-old oracle.
    /// Expected: Deviation-triggered prediction within ~10 s, high
    /// confidence, flagged imminent.
    #[test]
    fn test_predictor_deviation_trigger() {
        let predictor = OracleUpdatePredictor::new(100);
        let p = predictor.predict(3.0, 0.007);
        assert_eq!(p.trigger, UpdateTrigger::Deviation);
        assert!((p.seconds_until - 7.0).abs() < 1e-9);
        assert!(p.confidence > 0.6);
        assert!(predictor.is_update_imminent(3.0, 0.007, 15.0));
    }

    /// Scenario: no deviation, oracle 55 s into a 60 s heartbeat.
    /// Expected: Heartbeat prediction of ~5 s, imminent.
    #[test]
    fn test_predictor_heartbeat_trigger() {
        let mut predictor = OracleUpdatePredictor::new(100);
        for i in 0..10 {
            predictor.record_update(NOW + i * 60_000);
        }
        let p = predictor.predict(55.0, 0.001);
        assert_eq!(p.trigger, UpdateTrigger::Heartbeat);
        assert!((p.seconds_until - 5.0).abs() < 1e-9);
        assert!(predictor.is_update_imminent(55.0, 0.001, 15.0));
        // Mid-heartbeat: far from imminent
        assert!(!predictor.is_update_imminent(10.0, 0.001, 15.0));
    }

    /// Scenario: an hour with 8 wins / 2 losses, one with 2/8, one empty.
    /// Expected: Multipliers 1.0, 0.70 and the neutral 0.90.
    #[test]
    fn test_time_of_day_multipliers() {
        let mut analyzer = TimeOfDayAnalyzer::new();
        let hour10 = NOW; // 10:30 UTC
        let hour11 = NOW + 3_600_000;
        for i in 0..10 {
            analyzer.record_outcome(hour10, i < 8, 1.0);
            analyzer.record_outcome(hour11, i < 2, -1.0);
        }
        assert_eq!(analyzer.confidence_multiplier(10), 1.0);
        assert_eq!(analyzer.confidence_multiplier(11), 0.70);
        assert_eq!(analyzer.confidence_multiplier(23), 0.90);
        assert_eq!(analyzer.favorable_hours(0.70, 5), vec![10]);
    }

    /// Scenario: 60% hourly win rate.
    /// Expected: The middle multiplier 0.85.
    #[test]
    fn test_time_of_day_middle_tier() {
        let mut analyzer = TimeOfDayAnalyzer::new();
        for i in 0..10 {
            analyzer.record_outcome(NOW, i < 6, 0.5);
        }
        assert_eq!(analyzer.confidence_multiplier(10), 0.85);
    }

    /// Scenario: no large orders in the lookback window.
    /// Expected: Neutral 0.5.
    #[test]
    fn test_order_flow_neutral_when_empty() {
        let tracker = OrderFlowTracker::new(50, 1000.0);
        assert_eq!(tracker.flow_score(Direction::Up, NOW), 0.5);
    }

    /// Scenario: €3000 of buys and €1000 of sells in the last 30 s, plus a
    /// €500 print under the large-order threshold.
    /// Expected: UP flow = 0.75; the small print is ignored.
    #[test]
    fn test_order_flow_fraction() {
        let mut tracker = OrderFlowTracker::new(50, 1000.0);
        tracker.record(FlowEvent { ts_ms: NOW - 10_000, is_buy: true, notional: 3000.0 });
        tracker.record(FlowEvent { ts_ms: NOW - 5_000, is_buy: false, notional: 1000.0 });
        tracker.record(FlowEvent { ts_ms: NOW - 1_000, is_buy: true, notional: 500.0 });
        assert_eq!(tracker.len(), 2);
        assert!((tracker.flow_score(Direction::Up, NOW) - 0.75).abs() < 1e-12);
        assert!((tracker.flow_score(Direction::Down, NOW) - 0.25).abs() < 1e-12);
    }

    /// Scenario: a large order 40 s old.
    /// Expected: Outside the 30 s lookback → neutral again.
    #[test]
    fn test_order_flow_lookback() {
        let mut tracker = OrderFlowTracker::new(50, 1000.0);
        tracker.record(FlowEvent { ts_ms: NOW - 40_000, is_buy: true, notional: 2000.0 });
        assert_eq!(tracker.flow_score(Direction::Up, NOW), 0.5);
    }

    fn intel_candidate(now_ms: i64) -> SignalCandidate {
        SignalCandidate {
            signal_id: "sig".to_string(),
            ts_ms: now_ms,
            market_id: "mkt".to_string(),
            direction: Direction::Up,
            kind: SignalKind::Standard,
            consensus: passing_consensus(now_ms),
            oracle: passing_oracle(now_ms),
            market: passing_market(),
            scoring: None,
            validation: None,
        }
    }

    /// Scenario: all four ensemble models confirmed (surge 2.5+, 1.2% move,
    /// NO-heavy book for an UP bet, 75% concentration, 20 s oracle age).
    /// Expected: 4/4 confirmations → 1.10 boost.
    #[test]
    fn test_ensemble_full_agreement() {
        let mut c = intel_candidate(NOW);
        c.consensus.surge_ratio = 2.6;
        c.market.imbalance = -0.20;
        let result = EnsembleFilter::evaluate(&c, NOW);
        assert_eq!(result.confirmations, 4);
        assert!((result.boost - 1.10).abs() < 1e-12);
    }

    /// Scenario: progressively weaker ensemble agreement.
    /// Expected: Boost ladder 1.10 / 1.00 / 0.90 / 0.80.
    #[test]
    fn test_ensemble_boost_ladder() {
        // 3/4: pressure not confirmed (imbalance 0.05 on an UP bet)
        let mut c = intel_candidate(NOW);
        c.consensus.surge_ratio = 2.6;
        let r3 = EnsembleFilter::evaluate(&c, NOW);
        assert_eq!(r3.confirmations, 3);
        assert!((r3.boost - 1.00).abs() < 1e-12);

        // 2/4: volume momentum also gone
        c.consensus.surge_ratio = 1.5;
        let r2 = EnsembleFilter::evaluate(&c, NOW);
        assert_eq!(r2.confirmations, 2);
        assert!((r2.boost - 0.90).abs() < 1e-12);

        // 1/4: concentration collapses too
        c.consensus.spike_concentration = 0.3;
        let r1 = EnsembleFilter::evaluate(&c, NOW);
        assert_eq!(r1.confirmations, 1);
        assert!((r1.boost - 0.80).abs() < 1e-12);
    }

    /// Scenario: combined overlay on a fresh intelligence stack.
    /// Expected: Multiplier composed of the documented weights; with default
    /// trackers it stays near 1 and within the sane [0.7, 1.2] envelope.
    #[test]
    fn test_combined_multiplier() {
        let intel = MarketIntelligence::new();
        let mut c = intel_candidate(NOW);
        c.consensus.surge_ratio = 2.6;
        let score = intel.evaluate(&c, NOW);
        let expected = 0.30 * (0.8 + 0.4 * score.mm_lag_score)
            + 0.20 * score.time_multiplier
            + 0.10 * (0.9 + 0.2 * score.order_flow_score)
            + 0.40 * score.ensemble_boost;
        assert!((score.combined_multiplier - expected).abs() < 1e-12);
        assert!(score.combined_multiplier > 0.7 && score.combined_multiplier < 1.2);
    }
}
