use std::collections::HashMap;

use crate::telemetry::TelemetryEvent;

/// Write-only sink aggregating connection, signal and trade events for the
/// end-of-run report. Created at process start, reported at stop.
#[derive(Debug, Default)]
pub struct SessionTracker {
    started_at_ms: i64,
    connections: u64,
    reconnects: u64,
    signals_emitted: u64,
    signals_rejected: u64,
    rejection_counts: HashMap<&'static str, u64>,
    alerts: u64,
    trades_opened: u64,
    trades_closed: u64,
    wins: u64,
    losses: u64,
    net_profit_eur: f64,
}

impl SessionTracker {
    pub fn new(started_at_ms: i64) -> Self {
        Self {
            started_at_ms,
            ..Default::default()
        }
    }

    pub fn observe(&mut self, event: &TelemetryEvent) {
        match event {
            TelemetryEvent::Signal { candidate, action, .. } => {
                self.signals_emitted += 1;
                if action.starts_with("opened") {
                    self.trades_opened += 1;
                }
                if candidate
                    .scoring
                    .as_ref()
                    .map_or(false, |s| s.confidence >= 0.70)
                {
                    self.alerts += 1;
                }
            }
            TelemetryEvent::Rejection(record) => {
                self.signals_rejected += 1;
                *self
                    .rejection_counts
                    .entry(record.reason.as_str())
                    .or_insert(0) += 1;
            }
            TelemetryEvent::Alert(_) => {}
            TelemetryEvent::TradeClosed(trade) => {
                self.trades_closed += 1;
                if trade.won {
                    self.wins += 1;
                } else {
                    self.losses += 1;
                }
                self.net_profit_eur += trade.net_profit_eur;
            }
            TelemetryEvent::Connection { event, .. } => match *event {
                "connected" => self.connections += 1,
                "reconnected" | "reconnecting" => self.reconnects += 1,
                _ => {}
            },
        }
    }

    pub fn win_rate(&self) -> f64 {
        let total = self.wins + self.losses;
        if total == 0 {
            return 0.0;
        }
        self.wins as f64 / total as f64
    }

    /// Multi-line end-of-run summary.
    pub fn report(&self, now_ms: i64, mode_summary: &str) -> String {
        let uptime_s = (now_ms - self.started_at_ms).max(0) / 1000;
        let mut rejections: Vec<(&str, u64)> = self
            .rejection_counts
            .iter()
            .map(|(k, v)| (*k, *v))
            .collect();
        rejections.sort_by(|a, b| b.1.cmp(&a.1));
        let rejection_lines = rejections
            .iter()
            .map(|(reason, count)| format!("    {} = {}", reason, count))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "session report\n\
             uptime: {}s | connections: {} | reconnects: {}\n\
             signals: {} emitted, {} rejected\n\
             trades: {} opened, {} closed | win rate {:.1}% | net €{:.2}\n\
             {}\n\
             rejections:\n{}",
            uptime_s,
            self.connections,
            self.reconnects,
            self.signals_emitted,
            self.signals_rejected,
            self.trades_opened,
            self.trades_closed,
            self.win_rate() * 100.0,
            self.net_profit_eur,
            mode_summary,
            if rejection_lines.is_empty() {
                "    (none)".to_string()
            } else {
                rejection_lines
            },
        )
    }
}
