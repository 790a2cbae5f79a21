use tracing::{debug, info};

use crate::modes::{ClosedTrade, Mode, ModeAction};
use crate::types::{MarketSnapshot, SignalCandidate};

/// Alert mode: no positions, just one structured notification per cooldown
/// for candidates above the confidence threshold. Delivery itself happens in
/// the telemetry task.
pub struct AlertMode {
    confidence_threshold: f64,
    cooldown_ms: i64,
    last_alert_ms: i64,
    alerts_sent: u64,
    suppressed: u64,
}

impl AlertMode {
    pub fn new(confidence_threshold: f64, cooldown_s: f64) -> Self {
        Self {
            confidence_threshold,
            cooldown_ms: (cooldown_s * 1000.0) as i64,
            last_alert_ms: 0,
            alerts_sent: 0,
            suppressed: 0,
        }
    }

    pub fn alerts_sent(&self) -> u64 {
        self.alerts_sent
    }
}

impl Mode for AlertMode {
    fn name(&self) -> &'static str {
        "alert"
    }

    fn should_process(&mut self, signal: &SignalCandidate, now_ms: i64) -> bool {
        let confidence = signal.scoring.as_ref().map_or(0.0, |s| s.confidence);
        if confidence < self.confidence_threshold {
            debug!(
                confidence,
                threshold = self.confidence_threshold,
                "below alert threshold"
            );
            return false;
        }
        if self.last_alert_ms > 0 && now_ms - self.last_alert_ms < self.cooldown_ms {
            self.suppressed += 1;
            debug!(
                since_ms = now_ms - self.last_alert_ms,
                "alert suppressed by cooldown"
            );
            return false;
        }
        true
    }

    fn process(&mut self, signal: &SignalCandidate, now_ms: i64) -> ModeAction {
        self.last_alert_ms = now_ms;
        self.alerts_sent += 1;
        info!(
            signal_id = %signal.signal_id,
            direction = %signal.direction,
            confidence = signal.scoring.as_ref().map_or(0.0, |s| s.confidence),
            "alert dispatched"
        );
        ModeAction::Alerted
    }

    fn on_tick(&mut self, _market: Option<&MarketSnapshot>, _now_ms: i64) -> Vec<ClosedTrade> {
        Vec::new()
    }

    fn summary(&self) -> String {
        format!(
            "alert: sent={} suppressed={}",
            self.alerts_sent, self.suppressed
        )
    }
}
