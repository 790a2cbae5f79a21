use chrono::Timelike;
use tracing::{debug, info, warn};

use crate::config::RiskSettings;
use crate::modes::{
    ClosedTrade, ExactFill, ExitPolicy, FillModel, Mode, ModeAction, PositionBook,
};
use crate::types::{MarketSnapshot, SignalCandidate};

/// Estimated on-chain cost per round trip, charged against the gas budget.
const GAS_PER_TRADE_EUR: f64 = 0.60;

/// Automated mode: the only path that would act on its own. Gated by an
/// hour-of-day window, a high confidence bar, per-session trade and loss
/// caps, and circuit breakers that flip it to PAUSED. Resume is manual only.
pub struct AutoMode {
    risk: RiskSettings,
    book: PositionBook,
    fill: Box<dyn FillModel>,
    size_eur: f64,

    session_date: Option<String>,
    trades_this_session: u32,
    loss_this_session_eur: f64,
    gas_this_session_eur: f64,
    consecutive_losses: u32,
    total_profit_eur: f64,
    wins: u64,
    losses: u64,

    paused: bool,
    pause_reason: Option<String>,
}

impl AutoMode {
    pub fn new(risk: RiskSettings, policy: ExitPolicy, size_eur: f64) -> Self {
        Self {
            risk,
            book: PositionBook::new(policy),
            fill: Box::new(ExactFill),
            size_eur,
            session_date: None,
            trades_this_session: 0,
            loss_this_session_eur: 0.0,
            gas_this_session_eur: 0.0,
            consecutive_losses: 0,
            total_profit_eur: 0.0,
            wins: 0,
            losses: 0,
            paused: false,
            pause_reason: None,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn pause_reason(&self) -> Option<&str> {
        self.pause_reason.as_deref()
    }

    /// Manual operator action; nothing in the core calls this on its own.
    pub fn resume(&mut self) {
        self.paused = false;
        self.pause_reason = None;
        self.consecutive_losses = 0;
        info!("automated mode resumed");
    }

    fn pause(&mut self, reason: String) {
        warn!(reason = %reason, "automated mode paused, manual resume required");
        self.paused = true;
        self.pause_reason = Some(reason);
    }

    fn in_trading_window(&self, now_ms: i64) -> bool {
        let hour = chrono::DateTime::from_timestamp_millis(now_ms)
            .map(|dt| dt.hour())
            .unwrap_or(0);
        self.risk.auto_start_hour <= hour && hour < self.risk.auto_end_hour
    }

    /// A new UTC date starts a fresh session: caps and counters reset, a
    /// pause does not survive the night.
    fn roll_session(&mut self, now_ms: i64) {
        let today = chrono::DateTime::from_timestamp_millis(now_ms)
            .map(|dt| dt.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        if self.session_date.as_deref() != Some(today.as_str()) {
            self.session_date = Some(today);
            self.trades_this_session = 0;
            self.loss_this_session_eur = 0.0;
            self.gas_this_session_eur = 0.0;
            self.consecutive_losses = 0;
            self.paused = false;
            self.pause_reason = None;
            info!("automated session reset");
        }
    }
}

impl Mode for AutoMode {
    fn name(&self) -> &'static str {
        "automated"
    }

    fn should_process(&mut self, signal: &SignalCandidate, now_ms: i64) -> bool {
        if !self.in_trading_window(now_ms) {
            return false;
        }
        self.roll_session(now_ms);

        if self.paused {
            debug!(reason = ?self.pause_reason, "automated mode paused");
            return false;
        }
        if self.trades_this_session >= self.risk.auto_max_trades {
            debug!("session trade cap reached");
            return false;
        }
        if self.loss_this_session_eur >= self.risk.auto_max_loss_eur {
            debug!("session loss cap reached");
            return false;
        }
        if self.book.len() >= self.risk.max_concurrent_positions as usize {
            debug!("max concurrent positions held");
            return false;
        }
        let confidence = signal.scoring.as_ref().map_or(0.0, |s| s.confidence);
        confidence >= self.risk.auto_min_confidence
    }

    fn process(&mut self, signal: &SignalCandidate, now_ms: i64) -> ModeAction {
        if self.gas_this_session_eur + GAS_PER_TRADE_EUR > self.risk.max_daily_gas_eur {
            self.pause("daily gas cap hit".to_string());
            return ModeAction::Rejected("gas cap");
        }
        match self.book.open(signal, self.size_eur, self.fill.as_mut(), now_ms) {
            Some(position) => {
                self.trades_this_session += 1;
                self.gas_this_session_eur += GAS_PER_TRADE_EUR;
                info!(
                    position_id = %position.position_id,
                    direction = %signal.direction,
                    entry_price = position.entry_price,
                    trades = self.trades_this_session,
                    "automated position opened"
                );
                ModeAction::Opened {
                    position_id: position.position_id.clone(),
                    entry_price: position.entry_price,
                    size_eur: position.size_eur,
                }
            }
            None => ModeAction::Rejected("unusable entry quote"),
        }
    }

    fn on_tick(&mut self, market: Option<&MarketSnapshot>, now_ms: i64) -> Vec<ClosedTrade> {
        let market = match market {
            Some(m) => m,
            None => return Vec::new(),
        };
        let closed = self.book.on_tick(market, now_ms);
        for trade in &closed {
            self.total_profit_eur += trade.net_profit_eur;
            if trade.won {
                self.wins += 1;
                self.consecutive_losses = 0;
            } else {
                self.losses += 1;
                self.loss_this_session_eur += trade.net_profit_eur.abs();
                self.consecutive_losses += 1;

                if self.consecutive_losses >= self.risk.max_consecutive_losses {
                    self.pause(format!(
                        "{} consecutive losses",
                        self.consecutive_losses
                    ));
                } else if self.loss_this_session_eur >= self.risk.auto_max_loss_eur {
                    self.pause("session loss cap hit".to_string());
                }
            }
            info!(
                position_id = %trade.position.position_id,
                exit_reason = trade.exit_reason.as_str(),
                net_profit = trade.net_profit_eur,
                "automated position closed"
            );
        }
        closed
    }

    fn summary(&self) -> String {
        format!(
            "automated: trades={} wins={} losses={} net=€{:.2} paused={}{}",
            self.trades_this_session,
            self.wins,
            self.losses,
            self.total_profit_eur,
            self.paused,
            self.pause_reason
                .as_deref()
                .map(|r| format!(" ({})", r))
                .unwrap_or_default(),
        )
    }
}
