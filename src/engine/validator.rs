use std::collections::VecDeque;

use tracing::{debug, info};

use crate::config::{OracleSettings, SignalThresholds};
use crate::engine::confidence::spot_implied_prob;
use crate::types::{
    Direction, HistoryRecord, RejectReason, SignalCandidate, SignalKind, ValidationResult,
    VolRegime,
};

/// Position size, in units, assumed by the fill simulation.
const PROBE_SIZE: f64 = 25.0;
/// Minimum depth across the top three levels to even attempt the walk.
const MIN_DEPTH: f64 = 25.0;
/// Required win rate over similar past signals.
const MIN_WIN_RATE: f64 = 0.60;
/// Assumed target when history is too thin to judge.
const DEFAULT_WIN_RATE: f64 = 0.65;
/// Matched records needed before history is trusted.
const MIN_HISTORY_ENTRIES: usize = 10;
/// Spreads tighter than this are stale-data artifacts, not real books.
const IMPOSSIBLE_SPREAD: f64 = 0.001;

/// Bounded ring of signal outcomes for win-rate estimation.
#[derive(Clone, Debug)]
pub struct SignalHistory {
    entries: VecDeque<HistoryRecord>,
    max_entries: usize,
}

impl SignalHistory {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_entries.min(256)),
            max_entries,
        }
    }

    pub fn add(&mut self, record: HistoryRecord) {
        self.entries.push_back(record);
        while self.entries.len() > self.max_entries {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Win rate over records matching {kind, direction, regime}. Falls back
    /// to the default target with fewer than `MIN_HISTORY_ENTRIES` matches.
    pub fn win_rate(&self, kind: SignalKind, direction: Direction, regime: VolRegime) -> f64 {
        let matched: Vec<&HistoryRecord> = self
            .entries
            .iter()
            .filter(|r| r.kind == kind && r.direction == direction && r.regime == regime)
            .collect();
        if matched.len() < MIN_HISTORY_ENTRIES {
            return DEFAULT_WIN_RATE;
        }
        let wins = matched.iter().filter(|r| r.won).count();
        wins as f64 / matched.len() as f64
    }
}

/// Secondary checks on a detector candidate: can the position actually fill,
/// is the oracle window still safe, has this signal shape worked before.
/// Every check runs so the result carries all flags; the earliest failure is
/// the surfaced reason.
pub struct Validator {
    signals: SignalThresholds,
    oracle: OracleSettings,
    history: SignalHistory,
}

impl Validator {
    pub fn new(signals: SignalThresholds, oracle: OracleSettings) -> Self {
        Self {
            signals,
            oracle,
            history: SignalHistory::new(200),
        }
    }

    pub fn history(&self) -> &SignalHistory {
        &self.history
    }

    /// Divergence magnitude is the signal; momentum is the fallback. Only
    /// when both are tiny has the thesis reversed.
    fn check_directional_persistence(&self, candidate: &SignalCandidate) -> bool {
        let spot_implied = spot_implied_prob(
            candidate.consensus.move_30s,
            self.signals.spot_implied_scale,
        );
        let divergence = (spot_implied - candidate.market.yes_bid).abs();
        if divergence >= self.signals.min_divergence_pct {
            return true;
        }
        candidate.consensus.move_30s.abs() >= self.signals.escape_clause_min_move * 0.5
    }

    /// Simulate a 25-unit walk through the top three YES levels and bound
    /// the average fill against the best bid.
    fn check_liquidity_reality(
        &self,
        candidate: &SignalCandidate,
    ) -> (bool, Option<RejectReason>) {
        let market = &candidate.market;
        if market.yes_liq_best < self.signals.min_liquidity_eur {
            return (false, Some(RejectReason::LiquidityLow));
        }
        let total_depth: f64 = market.yes_depth_3.iter().map(|l| l.size).sum();
        if total_depth < MIN_DEPTH {
            debug!(total_depth, required = MIN_DEPTH, "insufficient depth");
            return (false, Some(RejectReason::LiquidityLow));
        }

        let mut remaining = PROBE_SIZE;
        let mut cost = 0.0;
        for level in &market.yes_depth_3 {
            let take = remaining.min(level.size);
            cost += take * level.price;
            remaining -= take;
            if remaining <= 0.0 {
                break;
            }
        }
        if remaining > 0.0 {
            return (false, Some(RejectReason::SlippageTooHigh));
        }
        let avg_price = cost / PROBE_SIZE;
        let slippage = if market.yes_bid > 0.0 {
            (avg_price - market.yes_bid) / market.yes_bid
        } else {
            1.0
        };
        if slippage > self.signals.max_slippage_pct {
            debug!(slippage, max = self.signals.max_slippage_pct, "slippage too high");
            return (false, Some(RejectReason::SlippageTooHigh));
        }
        (true, None)
    }

    fn check_oracle_window(
        &self,
        candidate: &SignalCandidate,
        now_ms: i64,
    ) -> (bool, Option<RejectReason>) {
        let age = candidate.oracle.age_s(now_ms);
        let min_age = if candidate.consensus.regime == VolRegime::Low {
            self.oracle.min_age_low_vol
        } else {
            self.oracle.min_age_normal_vol
        };
        if age < min_age {
            return (false, Some(RejectReason::OracleTooFresh));
        }
        // Stricter than the detector: updates cluster past this point
        if age > self.oracle.validator_max_age {
            return (false, Some(RejectReason::OracleTooStale));
        }
        if candidate.oracle.fast_heartbeat {
            return (false, Some(RejectReason::FastHeartbeatMode));
        }
        (true, None)
    }

    /// Run every check and collect the earliest rejection.
    pub fn validate(&self, candidate: &SignalCandidate, now_ms: i64) -> ValidationResult {
        let mut result = ValidationResult::default();

        result.directional_persistence = self.check_directional_persistence(candidate);
        if !result.directional_persistence {
            result.fail(RejectReason::DirectionReversed);
        }

        let (liq_ok, liq_reason) = self.check_liquidity_reality(candidate);
        result.liquidity_sufficient = liq_ok;
        if let Some(reason) = liq_reason {
            result.fail(reason);
        }

        result.liquidity_not_collapsing = !candidate.market.liq_collapsing;
        if !result.liquidity_not_collapsing {
            result.fail(RejectReason::LiquidityCollapsing);
        }

        let (oracle_ok, oracle_reason) = self.check_oracle_window(candidate, now_ms);
        result.oracle_window_safe = oracle_ok;
        if let Some(reason) = oracle_reason {
            result.fail(reason);
        }

        // Tight-but-realistic spreads are good for execution; only an
        // impossibly tight one is rejected as stale data.
        result.spread_not_converging = candidate.market.spread >= IMPOSSIBLE_SPREAD;
        if !result.spread_not_converging {
            result.fail(RejectReason::SpreadConverging);
        }

        result.volume_authenticated =
            candidate.consensus.surge_ratio >= self.signals.volume_surge_threshold;
        if !result.volume_authenticated {
            result.fail(RejectReason::VolumeLow);
        }

        result.spike_not_smooth_drift = candidate.consensus.spike_concentration
            >= self.signals.spike_concentration_threshold;
        if !result.spike_not_smooth_drift {
            result.fail(RejectReason::SmoothDrift);
        }

        let win_rate = self.history.win_rate(
            candidate.kind,
            candidate.direction,
            candidate.consensus.regime,
        );
        result.historical_win_rate = win_rate;
        if win_rate < MIN_WIN_RATE {
            result.fail(RejectReason::HistoricalWinRateLow);
        }

        if result.passed {
            info!(
                signal_id = %candidate.signal_id,
                historical_win_rate = win_rate,
                "validation passed"
            );
        } else {
            info!(
                signal_id = %candidate.signal_id,
                reason = result.rejection.map(|r| r.as_str()).unwrap_or("unknown"),
                "validation failed"
            );
        }
        result
    }

    /// Record a resolved signal outcome for future win-rate estimation.
    pub fn record_outcome(&mut self, candidate: &SignalCandidate, won: bool, now_ms: i64) {
        self.history.add(HistoryRecord {
            ts_ms: now_ms,
            kind: candidate.kind,
            direction: candidate.direction,
            oracle_age: candidate.oracle.age_s(candidate.ts_ms),
            regime: candidate.consensus.regime,
            won,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::detector::test_fixtures::*;
    use crate::types::{BookLevel, SignalCandidate};

    const NOW: i64 = 10_000_000;

    fn validator() -> Validator {
        Validator::new(SignalThresholds::from_env(), OracleSettings::from_env())
    }

    fn candidate() -> SignalCandidate {
        SignalCandidate {
            signal_id: "sig-1".to_string(),
            ts_ms: NOW,
            market_id: "mkt-1".to_string(),
            direction: Direction::Up,
            kind: SignalKind::Standard,
            consensus: passing_consensus(NOW),
            oracle: passing_oracle(NOW),
            market: passing_market(),
            scoring: None,
            validation: None,
        }
    }

    /// Scenario: the detector's passing fixture.
    /// Expected: All checks pass; win rate defaults to 0.65 with no history.
    #[test]
    fn test_validate_passes() {
        let v = validator();
        let result = v.validate(&candidate(), NOW);
        assert!(result.passed, "rejection = {:?}", result.rejection);
        assert!((result.historical_win_rate - 0.65).abs() < 1e-12);
    }

    /// Scenario: tiny move (0.1%) AND PM bid already tracking the implied
    /// probability, so neither divergence nor momentum supports the trade.
    /// Expected: DIRECTION_REVERSED.
    #[test]
    fn test_direction_reversed() {
        let v = validator();
        let mut c = candidate();
        c.consensus.move_30s = 0.001; // implied ≈ 0.525
        c.market.yes_bid = 0.52;
        let result = v.validate(&c, NOW);
        assert!(!result.passed);
        assert!(!result.directional_persistence);
        assert_eq!(result.rejection, Some(RejectReason::DirectionReversed));
    }

    /// Scenario: large divergence but a sub-floor move.
    /// Expected: Divergence alone carries the persistence check.
    #[test]
    fn test_divergence_carries_persistence() {
        let v = validator();
        let mut c = candidate();
        c.consensus.move_30s = 0.002; // implied ≈ 0.55, under the 0.5×floor momentum test
        c.market.yes_bid = 0.30; // divergence ≈ 0.25 ≥ 0.08
        assert!(v.check_directional_persistence(&c));
    }

    /// Scenario: best-bid liquidity below €50.
    /// Expected: LIQUIDITY_LOW with the liquidity flag cleared.
    #[test]
    fn test_liquidity_low() {
        let v = validator();
        let mut c = candidate();
        c.market.yes_liq_best = 30.0;
        let result = v.validate(&c, NOW);
        assert!(!result.liquidity_sufficient);
        assert_eq!(result.rejection, Some(RejectReason::LiquidityLow));
    }

    /// Scenario: a 25-unit walk across steep levels; 10 @ 0.50, then 15 @
    /// 0.58; averaging ~0.548 against a 0.50 bid (9.6% slippage).
    /// Expected: SLIPPAGE_TOO_HIGH at the 2% bound.
    #[test]
    fn test_slippage_too_high() {
        let v = validator();
        let mut c = candidate();
        c.market.yes_depth_3 = vec![
            BookLevel { price: 0.50, size: 10.0 },
            BookLevel { price: 0.58, size: 15.0 },
        ];
        c.market.yes_bid = 0.50;
        let result = v.validate(&c, NOW);
        assert!(!result.liquidity_sufficient);
        assert_eq!(result.rejection, Some(RejectReason::SlippageTooHigh));
    }

    /// Scenario: top-3 depth of 20 units for a 25-unit probe.
    /// Expected: LIQUIDITY_LOW (depth check precedes the walk).
    #[test]
    fn test_depth_floor() {
        let v = validator();
        let mut c = candidate();
        c.market.yes_depth_3 = vec![BookLevel { price: 0.52, size: 20.0 }];
        let result = v.validate(&c, NOW);
        assert_eq!(result.rejection, Some(RejectReason::LiquidityLow));
    }

    /// Scenario: oracle 72 s old; inside the detector's 75 s window but past
    /// the validator's stricter 70 s maximum.
    /// Expected: ORACLE_TOO_STALE.
    #[test]
    fn test_validator_strict_oracle_max() {
        let v = validator();
        let mut c = candidate();
        c.oracle.updated_at_ms = NOW - 72_000;
        let result = v.validate(&c, NOW);
        assert!(!result.oracle_window_safe);
        assert_eq!(result.rejection, Some(RejectReason::OracleTooStale));
    }

    /// Scenario: spreads of 0.0005 (impossible) and 0.015 (tight but real).
    /// Expected: Only the impossible spread rejects.
    #[test]
    fn test_spread_sanity() {
        let v = validator();
        let mut impossible = candidate();
        impossible.market.spread = 0.0005;
        let result = v.validate(&impossible, NOW);
        assert!(!result.spread_not_converging);
        assert_eq!(result.rejection, Some(RejectReason::SpreadConverging));

        let mut tight = candidate();
        tight.market.spread = 0.015;
        assert!(v.validate(&tight, NOW).passed, "tight-but-realistic spreads pass");
    }

    /// Scenario: two failures in one candidate; collapsing liquidity
    /// (checked third) and a smooth drift (checked seventh).
    /// Expected: All flags recorded; the earliest reason surfaces.
    #[test]
    fn test_all_checks_run_earliest_reason() {
        let v = validator();
        let mut c = candidate();
        c.market.liq_collapsing = true;
        c.consensus.spike_concentration = 0.1;
        let result = v.validate(&c, NOW);
        assert!(!result.liquidity_not_collapsing);
        assert!(!result.spike_not_smooth_drift);
        assert_eq!(result.rejection, Some(RejectReason::LiquidityCollapsing));
    }

    /// Scenario: 12 matched records at a 50% win rate, then 12 at 75%.
    /// Expected: Default 0.65 only below 10 records; the matched rate rules
    /// once enough history exists; failing at 50%, passing at 75%.
    #[test]
    fn test_historical_win_rate() {
        let mut v = validator();
        let c = candidate();

        // 6 wins / 6 losses
        for i in 0..12 {
            v.record_outcome(&c, i % 2 == 0, NOW + i);
        }
        let result = v.validate(&c, NOW);
        assert!((result.historical_win_rate - 0.5).abs() < 1e-12);
        assert!(!result.passed);
        assert_eq!(result.rejection, Some(RejectReason::HistoricalWinRateLow));

        // Flood with wins: 9 of every 12 now win
        for i in 0..24 {
            v.record_outcome(&c, i % 4 != 0, NOW + 100 + i);
        }
        let result = v.validate(&c, NOW);
        assert!(result.historical_win_rate > 0.60);
        assert!(result.passed);
    }

    /// Scenario: records for a different {kind, direction, regime} shape.
    /// Expected: They do not count toward this candidate's win rate.
    #[test]
    fn test_history_matching() {
        let mut v = validator();
        let mut other = candidate();
        other.direction = Direction::Down;
        for i in 0..20 {
            v.record_outcome(&other, false, NOW + i);
        }
        let result = v.validate(&candidate(), NOW);
        // No matched UP records → default target
        assert!((result.historical_win_rate - 0.65).abs() < 1e-12);
        assert!(result.passed);
    }

    /// Scenario: 250 records pushed into the 200-entry ring.
    /// Expected: Bounded at 200.
    #[test]
    fn test_history_ring_bound() {
        let mut history = SignalHistory::new(200);
        let c = candidate();
        for i in 0..250 {
            history.add(HistoryRecord {
                ts_ms: i,
                kind: c.kind,
                direction: c.direction,
                oracle_age: 20.0,
                regime: c.consensus.regime,
                won: true,
            });
        }
        assert_eq!(history.len(), 200);
    }
}
