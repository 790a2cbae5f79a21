pub mod notifier;
pub mod session;
pub mod writer;

use serde::Serialize;

use crate::types::{Direction, ExitReason, RejectReason, SignalCandidate};

/// Events flowing into the single telemetry task. All file and webhook I/O
/// happens there, never on the signal path.
pub enum TelemetryEvent {
    /// A fully processed candidate (validated + scored) and what the mode
    /// dispatcher did with it.
    Signal {
        candidate: Box<SignalCandidate>,
        mode: &'static str,
        action: String,
    },
    /// A candidate that failed a gate; first-class outcome, one line each.
    Rejection(RejectionRecord),
    /// Outbound notification payload, subject to notifier back-off.
    Alert(serde_json::Value),
    /// A simulated position resolved.
    TradeClosed(TradeRecord),
    /// Feed connectivity transitions for the session report.
    Connection {
        feed: &'static str,
        event: &'static str,
        ts_ms: i64,
    },
}

#[derive(Clone, Debug, Serialize)]
pub struct RejectionRecord {
    pub ts_ms: i64,
    pub reason: RejectReason,
    pub direction: Option<Direction>,
    pub move_30s: f64,
    pub oracle_age_s: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct TradeRecord {
    pub ts_ms: i64,
    pub signal_id: String,
    pub market_id: String,
    pub direction: Direction,
    pub mode: &'static str,
    pub entry_price: f64,
    pub exit_price: f64,
    pub exit_reason: ExitReason,
    pub size_eur: f64,
    pub gross_profit_eur: f64,
    pub net_profit_eur: f64,
    pub duration_s: f64,
    pub won: bool,
}
