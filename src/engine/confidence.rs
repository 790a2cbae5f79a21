use tracing::debug;

use crate::config::{ConfidenceWeights, SignalThresholds};
use crate::types::{
    ConfidenceBreakdown, Direction, MarketSnapshot, ScoringData, SignalCandidate, SignalKind,
    Tier, TokenSide,
};

/// Logistic map from 30-second momentum to an implied probability.
/// scale=100: a 1% move implies ~73%, a 2% move ~88%.
pub fn spot_implied_prob(momentum: f64, scale: f64) -> f64 {
    1.0 / (1.0 + (-momentum * scale).exp())
}

/// Tolerance on yes_bid + no_bid before the probability-sum penalty kicks in.
const PROB_SUM_TOLERANCE: f64 = 0.05;
/// Divergence at which the divergence component saturates.
const MAX_DIVERGENCE: f64 = 0.15;
/// Fixed move-consistency term blended into consensus strength.
const MOVE_CONSISTENCY: f64 = 0.8;

/// Weighted component scorer. Primary signals are the spot-PM divergence and
/// the PM book staleness; supporting factors authenticate the move and the
/// fill. Legacy weight fields parse but stay at zero.
pub struct ConfidenceScorer {
    weights: ConfidenceWeights,
    signals: SignalThresholds,
}

impl ConfidenceScorer {
    pub fn new(weights: ConfidenceWeights, signals: SignalThresholds) -> Self {
        Self { weights, signals }
    }

    /// Divergence between the momentum-implied probability and the PM YES
    /// bid, normalised so `min_divergence` scores 0 and 15% scores 1.
    fn score_divergence(&self, move_30s: f64, pm_yes_bid: f64) -> f64 {
        let spot_implied = spot_implied_prob(move_30s, self.signals.spot_implied_scale);
        let divergence = (spot_implied - pm_yes_bid).abs();
        let min_div = self.signals.min_divergence_pct;
        if divergence < min_div {
            return 0.0;
        }
        ((divergence - min_div) / (MAX_DIVERGENCE - min_div)).clamp(0.0, 1.0)
    }

    /// Triangular staleness window: 0 below min, 1 at optimal, back to 0 at
    /// max. A fresh book means the lag has not opened yet; a dead one means
    /// the opportunity already passed.
    fn score_pm_staleness(&self, orderbook_age_s: f64) -> f64 {
        let min_age = self.signals.min_pm_staleness_s;
        let optimal = self.signals.optimal_pm_staleness_s;
        let max_age = self.signals.max_pm_staleness_s;
        if orderbook_age_s < min_age {
            0.0
        } else if orderbook_age_s <= optimal {
            (orderbook_age_s - min_age) / (optimal - min_age)
        } else if orderbook_age_s <= max_age {
            1.0 - (orderbook_age_s - optimal) / (max_age - optimal)
        } else {
            0.0
        }
    }

    fn score_consensus_strength(&self, agreement_score: f64) -> f64 {
        (agreement_score + MOVE_CONSISTENCY) / 2.0
    }

    fn score_liquidity(&self, available: f64, liq_30s_ago: f64) -> f64 {
        let base = (available / 100.0).min(1.0);
        let stability = if liq_30s_ago > 0.0 {
            (available / liq_30s_ago).min(1.0)
        } else {
            1.0
        };
        base * stability
    }

    fn score_volume_surge(&self, surge_ratio: f64) -> f64 {
        if surge_ratio <= 1.0 {
            return 0.0;
        }
        ((surge_ratio - 1.0) / 1.5).min(1.0)
    }

    fn score_spike_concentration(&self, concentration: f64) -> f64 {
        if concentration <= 0.4 {
            return 0.0;
        }
        ((concentration - 0.4) / 0.3).min(1.0)
    }

    /// Maker-order viability: price zone (fee curve), spread tightness, and
    /// the value of avoiding the taker fee.
    fn score_maker_advantage(&self, market: &MarketSnapshot, direction: Direction) -> f64 {
        let side = match direction {
            Direction::Up => TokenSide::Yes,
            Direction::Down => TokenSide::No,
        };
        let current_price = match side {
            TokenSide::Yes => market.yes_bid,
            TokenSide::No => market.no_bid,
        };
        let spread = (market.yes_ask - market.yes_bid).abs();
        let taker_fee = market.effective_taker_fee(side, current_price);

        let zone = if (0.20..=0.80).contains(&current_price) {
            1.0
        } else if (0.15..=0.85).contains(&current_price) {
            0.7
        } else if (0.45..=0.55).contains(&current_price) {
            0.2
        } else {
            0.5
        };
        let spread_score = if spread < 0.02 {
            1.0
        } else if spread < 0.05 {
            0.7
        } else {
            0.3
        };
        let fee_score = if taker_fee > 0.015 {
            1.0
        } else if taker_fee > 0.010 {
            0.7
        } else {
            0.5
        };
        (zone + spread_score + fee_score) / 3.0
    }

    /// Score a candidate. `time_multiplier` comes from the time-of-day
    /// analyser and `ensemble_boost` from the ensemble filter; both default
    /// to 1.0 when unknown.
    pub fn score(
        &self,
        candidate: &SignalCandidate,
        time_multiplier: f64,
        ensemble_boost: f64,
    ) -> ScoringData {
        let consensus = &candidate.consensus;
        let market = &candidate.market;

        let breakdown = ConfidenceBreakdown {
            divergence: self.score_divergence(consensus.move_30s, market.yes_bid),
            pm_staleness: self.score_pm_staleness(market.orderbook_age_s),
            consensus_strength: self.score_consensus_strength(consensus.agreement_score),
            liquidity: self.score_liquidity(market.yes_liq_best, market.liq_30s_ago),
            volume_surge: self.score_volume_surge(consensus.surge_ratio),
            spike_concentration: self.score_spike_concentration(consensus.spike_concentration),
            maker_advantage: self.score_maker_advantage(market, candidate.direction),
            oracle_age: 0.0,
            misalignment: 0.0,
            spread_anomaly: 0.0,
        };

        let mut confidence = self.weights.divergence * breakdown.divergence
            + self.weights.pm_staleness * breakdown.pm_staleness
            + self.weights.consensus_strength * breakdown.consensus_strength
            + self.weights.liquidity * breakdown.liquidity
            + self.weights.volume_surge * breakdown.volume_surge
            + self.weights.spike_concentration * breakdown.spike_concentration
            + self.weights.maker_advantage * breakdown.maker_advantage;

        let prob_sum_penalty = market.prob_sum_penalty(PROB_SUM_TOLERANCE);
        if prob_sum_penalty < 1.0 {
            debug!(
                yes_bid = market.yes_bid,
                no_bid = market.no_bid,
                penalty = prob_sum_penalty,
                "probability-sum penalty applied"
            );
            confidence *= prob_sum_penalty;
        }

        let escape_penalty = if candidate.kind == SignalKind::EscapeClause {
            self.signals.escape_confidence_penalty
        } else {
            0.0
        };
        confidence *= 1.0 - escape_penalty;

        confidence *= time_multiplier;
        confidence *= ensemble_boost;

        let confidence = confidence.clamp(0.0, 1.0);
        ScoringData {
            confidence,
            tier: Tier::from_confidence(confidence),
            breakdown,
            escape_penalty,
            prob_sum_penalty,
            time_multiplier,
            ensemble_boost,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfidenceWeights, SignalThresholds};
    use crate::engine::detector::test_fixtures::*;
    use crate::types::SignalKind;

    fn scorer() -> ConfidenceScorer {
        // Env-free test processes resolve to the documented defaults
        let weights = ConfidenceWeights::from_env();
        let signals = SignalThresholds::from_env();
        ConfidenceScorer::new(weights, signals)
    }

    fn candidate(now_ms: i64) -> SignalCandidate {
        SignalCandidate {
            signal_id: "sig-1".to_string(),
            ts_ms: now_ms,
            market_id: "mkt-1".to_string(),
            direction: crate::types::Direction::Up,
            kind: SignalKind::Standard,
            consensus: passing_consensus(now_ms),
            oracle: passing_oracle(now_ms),
            market: passing_market(),
            scoring: None,
            validation: None,
        }
    }

    /// Scenario: logistic mapping of momentum at scale 100.
    /// Expected: 0 move → 0.5; +1% → ~0.73; −1% mirrors below 0.5.
    #[test]
    fn test_spot_implied_prob() {
        assert!((spot_implied_prob(0.0, 100.0) - 0.5).abs() < 1e-12);
        let up = spot_implied_prob(0.01, 100.0);
        assert!((up - 0.731).abs() < 0.001, "up = {}", up);
        let down = spot_implied_prob(-0.01, 100.0);
        assert!((up + down - 1.0).abs() < 1e-9, "logistic is symmetric");
    }

    /// Scenario: a wide sweep of candidate shapes (varied staleness,
    /// liquidity, surge, direction, escape kinds) with extreme multipliers.
    /// Expected: Confidence stays inside [0, 1] for every emitted score.
    #[test]
    fn test_confidence_always_in_unit_interval() {
        let scorer = scorer();
        let now = 10_000_000;
        for i in 0..50 {
            let mut c = candidate(now);
            c.market.orderbook_age_s = i as f64 * 15.0;
            c.market.yes_liq_best = i as f64 * 10.0;
            c.consensus.surge_ratio = i as f64 * 0.3;
            c.consensus.move_30s = (i as f64 - 25.0) * 0.002;
            if i % 2 == 0 {
                c.kind = SignalKind::EscapeClause;
            }
            let scoring = scorer.score(&c, 1.5, 1.5);
            assert!(
                (0.0..=1.0).contains(&scoring.confidence),
                "confidence {} out of range",
                scoring.confidence
            );
        }
    }

    /// Scenario: divergence below the 8% threshold vs well above it.
    /// Expected: 0 below threshold; saturates at 1.0 by 15% divergence;
    /// monotone in between.
    #[test]
    fn test_divergence_component() {
        let scorer = scorer();
        // move 0 → implied 0.5, bid 0.47 → divergence 0.03 < 0.08
        assert_eq!(scorer.score_divergence(0.0, 0.47), 0.0);
        // move 1% → implied 0.731, bid 0.50 → divergence 0.231 > 0.15 → saturated
        assert_eq!(scorer.score_divergence(0.01, 0.50), 1.0);
        // middle of the ramp stays ordered
        let low = scorer.score_divergence(0.0, 0.40);
        let high = scorer.score_divergence(0.0, 0.36);
        assert!(high > low, "larger divergence must score higher");
    }

    /// Scenario: book ages across the triangular staleness window
    /// (min 3 s, optimal 25 s, max 600 s).
    /// Expected: 0 below min, 1 at optimal, decaying beyond, 0 past max.
    #[test]
    fn test_staleness_triangle() {
        let scorer = scorer();
        assert_eq!(scorer.score_pm_staleness(1.0), 0.0);
        assert!((scorer.score_pm_staleness(14.0) - 0.5).abs() < 1e-9);
        assert!((scorer.score_pm_staleness(25.0) - 1.0).abs() < 1e-9);
        let decayed = scorer.score_pm_staleness(300.0);
        assert!(decayed > 0.0 && decayed < 1.0);
        assert_eq!(scorer.score_pm_staleness(700.0), 0.0);
    }

    /// Scenario: identical candidates, one STANDARD and one ESCAPE_CLAUSE.
    /// Expected: The escape candidate scores exactly 10% lower.
    #[test]
    fn test_escape_clause_penalty() {
        let scorer = scorer();
        let now = 10_000_000;
        let standard = scorer.score(&candidate(now), 1.0, 1.0);
        let mut escape_candidate = candidate(now);
        escape_candidate.kind = SignalKind::EscapeClause;
        let escape = scorer.score(&escape_candidate, 1.0, 1.0);
        assert!((escape.confidence - standard.confidence * 0.9).abs() < 1e-9);
        assert!((escape.escape_penalty - 0.10).abs() < 1e-12);
    }

    /// Scenario: a book summing to 0.80 (yes 0.50 + no 0.30).
    /// Expected: Confidence multiplied by 0.80 relative to a balanced book.
    #[test]
    fn test_prob_sum_penalty_applied() {
        let scorer = scorer();
        let now = 10_000_000;
        let balanced = scorer.score(&candidate(now), 1.0, 1.0);
        let mut skewed = candidate(now);
        skewed.market.no_bid = 0.30;
        let penalised = scorer.score(&skewed, 1.0, 1.0);
        assert!((penalised.confidence - balanced.confidence * 0.80).abs() < 1e-9);
        assert!((penalised.prob_sum_penalty - 0.80).abs() < 1e-12);
    }

    /// Scenario: time-of-day multiplier 0.7 against a 1.0 baseline.
    /// Expected: Confidence scales by the multiplier and the value is
    /// recorded on the scoring data.
    #[test]
    fn test_time_multiplier() {
        let scorer = scorer();
        let now = 10_000_000;
        let base = scorer.score(&candidate(now), 1.0, 1.0);
        let off_hours = scorer.score(&candidate(now), 0.7, 1.0);
        assert!((off_hours.confidence - base.confidence * 0.7).abs() < 1e-9);
        assert_eq!(off_hours.time_multiplier, 0.7);
    }

    /// Scenario: maker-advantage sub-scores at a mid-zone price with a tight
    /// spread and negligible fees.
    /// Expected: zone 1.0, spread 1.0, fee 0.5 → mean 0.833.
    #[test]
    fn test_maker_advantage() {
        let scorer = scorer();
        let market = passing_market(); // yes_bid 0.50, spread 0.02→just under? ask−bid = 0.02
        let score = scorer.score_maker_advantage(&market, crate::types::Direction::Up);
        // spread exactly 0.02 is not < 0.02 → 0.7; fee 25bps*0.5=0.00125 → 0.5
        let expected = (1.0 + 0.7 + 0.5) / 3.0;
        assert!((score - expected).abs() < 1e-9, "score = {}", score);
    }

    /// Scenario: legacy components in the breakdown.
    /// Expected: Present in the serialised breakdown and exactly zero.
    #[test]
    fn test_legacy_breakdown_fields_zero() {
        let scorer = scorer();
        let scoring = scorer.score(&candidate(10_000_000), 1.0, 1.0);
        assert_eq!(scoring.breakdown.oracle_age, 0.0);
        assert_eq!(scoring.breakdown.misalignment, 0.0);
        assert_eq!(scoring.breakdown.spread_anomaly, 0.0);
        let json = serde_json::to_value(&scoring.breakdown).unwrap();
        assert!(json.get("oracle_age").is_some());
        assert!(json.get("spread_anomaly").is_some());
    }
}
