use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{OracleSettings, SignalThresholds};
use crate::types::{
    ConsensusData, Direction, MarketSnapshot, OracleState, RejectReason, SignalCandidate,
    SignalKind, VolRegime,
};

/// Why a candidate was not emitted this cycle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Rejection {
    /// Same-direction candidate inside the cooldown window.
    Duplicate,
    /// A primary condition failed; the earliest reason is recorded.
    Gate(RejectReason),
    /// Primary conditions held but the legacy mispricing gate did not.
    Mispriced { mispricing: f64 },
}

/// Detects oracle-lag candidates from (consensus, oracle, market) triples.
/// Primary conditions run in a fixed order; an escape clause admits
/// sub-threshold moves that are strongly supported by the book and volume.
pub struct SignalDetector {
    signals: SignalThresholds,
    oracle: OracleSettings,
    recent: Vec<(i64, Direction)>,
}

impl SignalDetector {
    pub fn new(signals: SignalThresholds, oracle: OracleSettings) -> Self {
        Self {
            signals,
            oracle,
            recent: Vec::new(),
        }
    }

    /// Dynamic move threshold: the configured floor or an ATR multiple,
    /// whichever is larger.
    fn move_threshold(&self, consensus: &ConsensusData) -> f64 {
        self.signals
            .min_spot_move_pct
            .max(self.signals.atr_multiplier * consensus.atr_5m)
    }

    /// Regime-dependent oracle age window.
    pub fn oracle_age_window(&self, regime: VolRegime) -> (f64, f64) {
        let min_age = if regime == VolRegime::Low {
            self.oracle.min_age_low_vol
        } else {
            self.oracle.min_age_normal_vol
        };
        (min_age, self.oracle.max_age)
    }

    fn is_duplicate(&mut self, direction: Direction, now_ms: i64) -> bool {
        let cooldown = self.signals.signal_cooldown_ms;
        self.recent.retain(|(ts, _)| now_ms - ts < cooldown);
        self.recent.iter().any(|(_, d)| *d == direction)
    }

    /// Primary condition gate. Returns the signal kind on success.
    fn check_primary(
        &self,
        consensus: &ConsensusData,
        oracle: &OracleState,
        market: &MarketSnapshot,
        now_ms: i64,
    ) -> Result<SignalKind, RejectReason> {
        let move_abs = consensus.move_30s.abs();
        let oracle_age = oracle.age_s(now_ms);

        // Hard floor: below this no amount of support rescues the move
        if move_abs < self.signals.escape_clause_min_move {
            return Err(RejectReason::InsufficientMove);
        }

        let mut kind = SignalKind::Standard;
        if move_abs < self.move_threshold(consensus) {
            let escape = oracle_age >= self.signals.escape_min_oracle_age
                && market.imbalance.abs() >= self.signals.escape_min_imbalance
                && market.yes_liq_best >= self.signals.escape_min_liquidity
                && consensus.surge_ratio >= self.signals.escape_min_volume_surge;
            if !escape {
                return Err(RejectReason::InsufficientMove);
            }
            kind = SignalKind::EscapeClause;
            info!(
                move_pct = move_abs,
                threshold = self.move_threshold(consensus),
                "escape clause triggered"
            );
        }

        if consensus.surge_ratio < self.signals.volume_surge_threshold {
            return Err(RejectReason::VolumeLow);
        }
        if consensus.spike_concentration < self.signals.spike_concentration_threshold {
            return Err(RejectReason::SmoothDrift);
        }
        if !consensus.agree {
            return Err(RejectReason::ConsensusFailure);
        }

        let (min_age, max_age) = self.oracle_age_window(consensus.regime);
        if oracle_age < min_age {
            return Err(RejectReason::OracleTooFresh);
        }
        if oracle_age > max_age {
            return Err(RejectReason::OracleTooStale);
        }
        if oracle.fast_heartbeat {
            return Err(RejectReason::FastHeartbeatMode);
        }

        if consensus.vol_30s > self.signals.max_volatility_30s {
            return Err(RejectReason::VolatilityTooHigh);
        }
        if market.yes_liq_best < self.signals.min_liquidity_eur {
            return Err(RejectReason::LiquidityLow);
        }
        if market.liq_collapsing {
            return Err(RejectReason::LiquidityCollapsing);
        }

        Ok(kind)
    }

    /// Legacy mispricing gate: a crude spot-implied probability from the
    /// consensus-oracle divergence scaled by 5, clamped to [0, 1]. Retained
    /// alongside the validator's divergence check.
    fn mispricing(
        &self,
        consensus: &ConsensusData,
        oracle: &OracleState,
        market: &MarketSnapshot,
        direction: Direction,
    ) -> f64 {
        let divergence = if oracle.value > 0.0 {
            (consensus.price - oracle.value) / oracle.value
        } else {
            0.0
        };
        let spot_implied = (0.5 + divergence * 5.0).clamp(0.0, 1.0);
        let pm_implied = market.implied_prob;
        match direction {
            Direction::Up => spot_implied - pm_implied,
            Direction::Down => pm_implied - (1.0 - spot_implied),
        }
    }

    /// Evaluate one cycle. Ok is a fresh candidate (recorded for dedup);
    /// Err carries the first failed reason.
    pub fn detect(
        &mut self,
        consensus: &ConsensusData,
        oracle: &OracleState,
        market: &MarketSnapshot,
        now_ms: i64,
    ) -> Result<SignalCandidate, Rejection> {
        let direction = if consensus.move_30s > 0.0 {
            Direction::Up
        } else {
            Direction::Down
        };

        if self.is_duplicate(direction, now_ms) {
            debug!(%direction, "duplicate signal suppressed");
            return Err(Rejection::Duplicate);
        }

        let kind = self
            .check_primary(consensus, oracle, market, now_ms)
            .map_err(Rejection::Gate)?;

        let mispricing = self.mispricing(consensus, oracle, market, direction);
        if mispricing < self.signals.min_mispricing_pct {
            debug!(
                mispricing,
                threshold = self.signals.min_mispricing_pct,
                "insufficient mispricing"
            );
            return Err(Rejection::Mispriced { mispricing });
        }

        let candidate = SignalCandidate {
            signal_id: Uuid::new_v4().to_string(),
            ts_ms: now_ms,
            market_id: market.market_id.clone(),
            direction,
            kind,
            consensus: consensus.clone(),
            oracle: oracle.clone(),
            market: market.clone(),
            scoring: None,
            validation: None,
        };

        self.recent.push((now_ms, direction));
        info!(
            signal_id = %candidate.signal_id,
            %direction,
            kind = kind.as_str(),
            move_pct = consensus.move_30s,
            oracle_age = oracle.age_s(now_ms),
            mispricing,
            "signal candidate detected"
        );

        Ok(candidate)
    }
}


#[cfg(test)]
mod tests {
    use super::test_fixtures::*;
    use super::*;

    fn detector() -> SignalDetector {
        SignalDetector::new(SignalThresholds::from_env(), OracleSettings::from_env())
    }

    const NOW: i64 = 10_000_000;

    /// Scenario: every primary condition and the mispricing gate pass.
    /// Expected: A STANDARD candidate in the UP direction.
    #[test]
    fn test_detect_standard_up() {
        let mut det = detector();
        let candidate = det
            .detect(&passing_consensus(NOW), &passing_oracle(NOW), &passing_market(), NOW)
            .unwrap();
        assert_eq!(candidate.direction, Direction::Up);
        assert_eq!(candidate.kind, SignalKind::Standard);
        assert!(!candidate.signal_id.is_empty());
    }

    /// Scenario: same conditions with a negative 30s move.
    /// Expected: DOWN direction; the mispricing check flips accordingly.
    #[test]
    fn test_detect_down_direction() {
        let mut det = detector();
        let mut consensus = passing_consensus(NOW);
        consensus.move_30s = -0.012;
        consensus.price = 49_500.0;
        let mut market = passing_market();
        market.implied_prob = 0.60; // PM still pricing UP too rich
        let candidate = det
            .detect(&consensus, &passing_oracle(NOW), &market, NOW)
            .unwrap();
        assert_eq!(candidate.direction, Direction::Down);
    }

    /// Scenario: a second same-direction candidate 5 s after the first, then
    /// a third after the 10 s cooldown expires.
    /// Expected: The second is a Duplicate; the third goes through.
    #[test]
    fn test_dedup_cooldown() {
        let mut det = detector();
        det.detect(&passing_consensus(NOW), &passing_oracle(NOW), &passing_market(), NOW)
            .unwrap();
        let second = det.detect(
            &passing_consensus(NOW + 5000),
            &passing_oracle(NOW + 5000),
            &passing_market(),
            NOW + 5000,
        );
        assert_eq!(second.unwrap_err(), Rejection::Duplicate);

        let third = det.detect(
            &passing_consensus(NOW + 11_000),
            &passing_oracle(NOW + 11_000),
            &passing_market(),
            NOW + 11_000,
        );
        assert!(third.is_ok(), "cooldown expired, signal allowed again");
    }

    /// Scenario: move below the 0.8% hard floor.
    /// Expected: INSUFFICIENT_MOVE regardless of other support.
    #[test]
    fn test_hard_floor() {
        let mut det = detector();
        let mut consensus = passing_consensus(NOW);
        consensus.move_30s = 0.005;
        let result = det.detect(&consensus, &passing_oracle(NOW), &passing_market(), NOW);
        assert_eq!(
            result.unwrap_err(),
            Rejection::Gate(RejectReason::InsufficientMove)
        );
    }

    /// Scenario: move 0.85%; above the floor but under the ATR-dynamic
    /// threshold (1.5 × 0.007 = 1.05%); with strong escape support: oracle
    /// age 20 s, imbalance 0.25, liquidity 100, surge 3×.
    /// Expected: An ESCAPE_CLAUSE candidate.
    #[test]
    fn test_escape_clause_path() {
        let mut det = detector();
        let mut consensus = passing_consensus(NOW);
        consensus.move_30s = 0.0085;
        consensus.atr_5m = 0.007;
        consensus.surge_ratio = 3.0;
        consensus.max_10s_move = 0.0070;
        consensus.spike_concentration = consensus.max_10s_move / consensus.move_30s;
        let mut market = passing_market();
        market.imbalance = 0.25;
        market.yes_liq_best = 100.0;

        let candidate = det
            .detect(&consensus, &passing_oracle(NOW), &market, NOW)
            .unwrap();
        assert_eq!(candidate.kind, SignalKind::EscapeClause);
    }

    /// Scenario: the same sub-threshold move with weak escape support
    /// (imbalance only 0.05).
    /// Expected: INSUFFICIENT_MOVE.
    #[test]
    fn test_escape_clause_denied_without_support() {
        let mut det = detector();
        let mut consensus = passing_consensus(NOW);
        consensus.move_30s = 0.0085;
        consensus.atr_5m = 0.007;
        consensus.surge_ratio = 3.0;
        let market = passing_market(); // imbalance 0.05 < 0.20
        let result = det.detect(&consensus, &passing_oracle(NOW), &market, NOW);
        assert_eq!(
            result.unwrap_err(),
            Rejection::Gate(RejectReason::InsufficientMove)
        );
    }

    /// Scenario: 1% move with max 10s move of 0.2% (concentration 0.2) vs
    /// 0.7% (concentration 0.7).
    /// Expected: The drift is rejected SMOOTH_DRIFT; the spike passes.
    #[test]
    fn test_spike_vs_drift() {
        let mut det = detector();
        let mut drift = passing_consensus(NOW);
        drift.move_30s = 0.01;
        drift.max_10s_move = 0.002;
        drift.spike_concentration = 0.2;
        let result = det.detect(&drift, &passing_oracle(NOW), &passing_market(), NOW);
        assert_eq!(result.unwrap_err(), Rejection::Gate(RejectReason::SmoothDrift));

        let mut spike = passing_consensus(NOW);
        spike.move_30s = 0.01;
        spike.max_10s_move = 0.007;
        spike.spike_concentration = 0.7;
        assert!(det.detect(&spike, &passing_oracle(NOW), &passing_market(), NOW).is_ok());
    }

    /// Scenario: volume surge below the 1.2× threshold.
    /// Expected: VOLUME_LOW.
    #[test]
    fn test_volume_gate() {
        let mut det = detector();
        let mut consensus = passing_consensus(NOW);
        consensus.surge_ratio = 1.0;
        let result = det.detect(&consensus, &passing_oracle(NOW), &passing_market(), NOW);
        assert_eq!(result.unwrap_err(), Rejection::Gate(RejectReason::VolumeLow));
    }

    /// Scenario: oracle 2 s old (too fresh) and 80 s old (too stale).
    /// Expected: ORACLE_TOO_FRESH / ORACLE_TOO_STALE respectively.
    #[test]
    fn test_oracle_age_window() {
        let mut det = detector();
        let mut fresh = passing_oracle(NOW);
        fresh.updated_at_ms = NOW - 2_000;
        let result = det.detect(&passing_consensus(NOW), &fresh, &passing_market(), NOW);
        assert_eq!(result.unwrap_err(), Rejection::Gate(RejectReason::OracleTooFresh));

        let mut det2 = detector();
        let mut stale = passing_oracle(NOW);
        stale.updated_at_ms = NOW - 80_000;
        let result = det2.detect(&passing_consensus(NOW), &stale, &passing_market(), NOW);
        assert_eq!(result.unwrap_err(), Rejection::Gate(RejectReason::OracleTooStale));
    }

    /// Scenario: LOW volatility regime raises the minimum oracle age to 12 s;
    /// the oracle is 8 s old.
    /// Expected: ORACLE_TOO_FRESH under LOW, passes under NORMAL.
    #[test]
    fn test_regime_adaptive_oracle_window() {
        let mut det = detector();
        let mut consensus = passing_consensus(NOW);
        consensus.regime = VolRegime::Low;
        let mut oracle = passing_oracle(NOW);
        oracle.updated_at_ms = NOW - 8_000;
        let result = det.detect(&consensus, &oracle, &passing_market(), NOW);
        assert_eq!(result.unwrap_err(), Rejection::Gate(RejectReason::OracleTooFresh));

        let mut det2 = detector();
        let normal = passing_consensus(NOW);
        assert!(det2.detect(&normal, &oracle, &passing_market(), NOW).is_ok());
    }

    /// Scenario: oracle in fast-heartbeat mode.
    /// Expected: FAST_HEARTBEAT_MODE.
    #[test]
    fn test_fast_heartbeat_gate() {
        let mut det = detector();
        let mut oracle = passing_oracle(NOW);
        oracle.fast_heartbeat = true;
        let result = det.detect(&passing_consensus(NOW), &oracle, &passing_market(), NOW);
        assert_eq!(
            result.unwrap_err(),
            Rejection::Gate(RejectReason::FastHeartbeatMode)
        );
    }

    /// Scenario: 30s volatility above the 0.8% cap.
    /// Expected: VOLATILITY_TOO_HIGH.
    #[test]
    fn test_volatility_gate() {
        let mut det = detector();
        let mut consensus = passing_consensus(NOW);
        consensus.vol_30s = 0.02;
        let result = det.detect(&consensus, &passing_oracle(NOW), &passing_market(), NOW);
        assert_eq!(
            result.unwrap_err(),
            Rejection::Gate(RejectReason::VolatilityTooHigh)
        );
    }

    /// Scenario: liquidity at 50 with 100 thirty seconds ago (50% drop, above
    /// the €25 floor) vs a snapshot flagged as collapsing.
    /// Expected: The 50% drop alone passes; the collapsing flag rejects.
    #[test]
    fn test_liquidity_collapse_gate() {
        let mut det = detector();
        let mut market = passing_market();
        market.yes_liq_best = 50.0;
        market.liq_30s_ago = 100.0;
        market.liq_collapsing = false; // feed applies the absolute floor rule
        assert!(det
            .detect(&passing_consensus(NOW), &passing_oracle(NOW), &market, NOW)
            .is_ok());

        let mut det2 = detector();
        let mut collapsed = passing_market();
        collapsed.liq_collapsing = true;
        let result = det2.detect(&passing_consensus(NOW), &passing_oracle(NOW), &collapsed, NOW);
        assert_eq!(
            result.unwrap_err(),
            Rejection::Gate(RejectReason::LiquidityCollapsing)
        );
    }

    /// Scenario: consensus barely above the oracle (0.1% divergence) so the
    /// crude spot-implied probability stays near the PM's.
    /// Expected: Rejected by the legacy mispricing gate with the magnitude
    /// reported.
    #[test]
    fn test_mispricing_gate() {
        let mut det = detector();
        let mut consensus = passing_consensus(NOW);
        consensus.price = 50_050.0; // 0.1% above oracle → spot_implied 0.505
        let result = det.detect(&consensus, &passing_oracle(NOW), &passing_market(), NOW);
        match result.unwrap_err() {
            Rejection::Mispriced { mispricing } => {
                assert!(mispricing < 0.03, "mispricing = {}", mispricing)
            }
            other => panic!("expected mispricing rejection, got {:?}", other),
        }
    }
}
