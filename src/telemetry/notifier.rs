use serde_json::json;
use tracing::{debug, warn};

use crate::types::SignalCandidate;

/// The structured notification payload for an emitted signal.
pub fn alert_payload(candidate: &SignalCandidate, now_ms: i64) -> serde_json::Value {
    let confidence = candidate.scoring.as_ref().map_or(0.0, |s| s.confidence);
    let tier = candidate
        .scoring
        .as_ref()
        .map_or("LOW", |s| s.tier.as_str());
    let breakdown = candidate
        .scoring
        .as_ref()
        .map(|s| serde_json::to_value(&s.breakdown).unwrap_or_default())
        .unwrap_or_default();
    json!({
        "signal_id": candidate.signal_id,
        "ts_ms": candidate.ts_ms,
        "market_id": candidate.market_id,
        "direction": candidate.direction.as_str(),
        "kind": candidate.kind.as_str(),
        "confidence": confidence,
        "tier": tier,
        "breakdown": breakdown,
        "entry_price": candidate.market.yes_bid,
        "oracle_age_s": candidate.oracle.age_s(now_ms),
        "move_30s": candidate.consensus.move_30s,
        "surge_ratio": candidate.consensus.surge_ratio,
        "liquidity": candidate.market.yes_liq_best,
    })
}

const MAX_BACKOFF_MS: i64 = 60_000;

/// Best-effort webhook delivery with rate-limit back-off. Failures never
/// propagate past this struct.
pub struct Notifier {
    client: reqwest::Client,
    url: String,
    backoff_until_ms: i64,
    consecutive_failures: u32,
    sent: u64,
    dropped: u64,
}

impl Notifier {
    pub fn new(client: reqwest::Client, url: String) -> Self {
        Self {
            client,
            url,
            backoff_until_ms: 0,
            consecutive_failures: 0,
            sent: 0,
            dropped: 0,
        }
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn enter_backoff(&mut self, now_ms: i64) {
        self.consecutive_failures += 1;
        let delay_ms =
            (1000_i64 << self.consecutive_failures.min(16)).min(MAX_BACKOFF_MS);
        self.backoff_until_ms = now_ms + delay_ms;
    }

    pub async fn send(&mut self, payload: &serde_json::Value, now_ms: i64) {
        if now_ms < self.backoff_until_ms {
            self.dropped += 1;
            debug!(until_ms = self.backoff_until_ms, "notification dropped during back-off");
            return;
        }
        match self.client.post(&self.url).json(payload).send().await {
            Ok(resp) if resp.status().is_success() => {
                self.sent += 1;
                self.consecutive_failures = 0;
            }
            Ok(resp) if resp.status().as_u16() == 429 => {
                self.enter_backoff(now_ms);
                warn!(status = 429, "notification rate limited, backing off");
            }
            Ok(resp) => {
                self.enter_backoff(now_ms);
                warn!(status = %resp.status(), "notification rejected");
            }
            Err(e) => {
                self.enter_backoff(now_ms);
                warn!(error = %e, "notification send failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::detector::test_fixtures::*;
    use crate::types::{
        ConfidenceBreakdown, Direction, ScoringData, SignalCandidate, SignalKind, Tier,
    };

    fn scored_candidate(now_ms: i64) -> SignalCandidate {
        SignalCandidate {
            signal_id: "sig-42".to_string(),
            ts_ms: now_ms,
            market_id: "mkt-1".to_string(),
            direction: Direction::Up,
            kind: SignalKind::EscapeClause,
            consensus: passing_consensus(now_ms),
            oracle: passing_oracle(now_ms),
            market: passing_market(),
            scoring: Some(ScoringData {
                confidence: 0.82,
                tier: Tier::from_confidence(0.82),
                breakdown: ConfidenceBreakdown::default(),
                escape_penalty: 0.10,
                prob_sum_penalty: 1.0,
                time_multiplier: 1.0,
                ensemble_boost: 1.0,
            }),
            validation: None,
        }
    }

    /// Scenario: payload built from a scored escape-clause candidate.
    /// Expected: All schema fields present with the candidate's values.
    #[test]
    fn test_alert_payload_schema() {
        let now = 10_000_000;
        let payload = alert_payload(&scored_candidate(now), now);
        assert_eq!(payload["signal_id"], "sig-42");
        assert_eq!(payload["direction"], "up");
        assert_eq!(payload["kind"], "escape_clause");
        assert_eq!(payload["tier"], "VERY_GOOD");
        assert!((payload["confidence"].as_f64().unwrap() - 0.82).abs() < 1e-12);
        assert!((payload["entry_price"].as_f64().unwrap() - 0.50).abs() < 1e-12);
        assert!((payload["oracle_age_s"].as_f64().unwrap() - 20.0).abs() < 1e-9);
        assert!(payload["breakdown"].is_object());
        assert!(payload["liquidity"].as_f64().unwrap() > 0.0);
    }

    /// Scenario: payload from an unscored candidate.
    /// Expected: Confidence 0 and tier LOW rather than a missing field.
    #[test]
    fn test_alert_payload_unscored() {
        let now = 10_000_000;
        let mut candidate = scored_candidate(now);
        candidate.scoring = None;
        let payload = alert_payload(&candidate, now);
        assert_eq!(payload["confidence"], 0.0);
        assert_eq!(payload["tier"], "LOW");
    }

    /// Scenario: a send attempted while inside the back-off window.
    /// Expected: It is dropped and counted, with no network attempt.
    #[tokio::test]
    async fn test_backoff_drops() {
        let mut notifier = Notifier::new(
            reqwest::Client::new(),
            "http://127.0.0.1:1/hook".to_string(),
        );
        notifier.backoff_until_ms = 2_000_000;
        notifier.send(&serde_json::json!({}), 1_000_000).await;
        assert_eq!(notifier.dropped(), 1);
        assert_eq!(notifier.sent(), 0);
    }

    /// Scenario: send against an unreachable endpoint.
    /// Expected: Failure is swallowed and back-off engages.
    #[tokio::test]
    async fn test_failure_enters_backoff() {
        let mut notifier = Notifier::new(
            reqwest::Client::new(),
            "http://127.0.0.1:1/hook".to_string(),
        );
        notifier.send(&serde_json::json!({"x": 1}), 1_000_000).await;
        assert_eq!(notifier.sent(), 0);
        assert!(notifier.backoff_until_ms > 1_000_000);
    }
}
