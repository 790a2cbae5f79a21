use tracing::info;

use crate::modes::{
    ClosedTrade, ExactFill, ExitPolicy, FillModel, Mode, ModeAction, PositionBook,
};
use crate::types::{MarketSnapshot, SignalCandidate};

/// Shadow trading: every accepted signal opens a virtual position at the
/// quoted bid with a fixed size, and P&L is tracked with no external side
/// effects. Run this for weeks before trusting the thresholds with money.
pub struct ShadowMode {
    book: PositionBook,
    fill: Box<dyn FillModel>,
    size_eur: f64,
    signals_processed: u64,
    wins: u64,
    losses: u64,
    total_profit_eur: f64,
}

impl ShadowMode {
    pub fn new(policy: ExitPolicy, size_eur: f64) -> Self {
        Self::with_fill(policy, size_eur, Box::new(ExactFill))
    }

    /// Swap the fill model (simulated slippage lives behind this seam).
    pub fn with_fill(policy: ExitPolicy, size_eur: f64, fill: Box<dyn FillModel>) -> Self {
        Self {
            book: PositionBook::new(policy),
            fill,
            size_eur,
            signals_processed: 0,
            wins: 0,
            losses: 0,
            total_profit_eur: 0.0,
        }
    }

    pub fn win_rate(&self) -> f64 {
        let total = self.wins + self.losses;
        if total == 0 {
            return 0.0;
        }
        self.wins as f64 / total as f64
    }

    pub fn avg_profit_eur(&self) -> f64 {
        let total = self.wins + self.losses;
        if total == 0 {
            return 0.0;
        }
        self.total_profit_eur / total as f64
    }

    pub fn open_positions(&self) -> usize {
        self.book.len()
    }
}

impl Mode for ShadowMode {
    fn name(&self) -> &'static str {
        "shadow"
    }

    fn should_process(&mut self, _signal: &SignalCandidate, _now_ms: i64) -> bool {
        // Shadow collects everything the pipeline accepts
        true
    }

    fn process(&mut self, signal: &SignalCandidate, now_ms: i64) -> ModeAction {
        self.signals_processed += 1;
        match self.book.open(signal, self.size_eur, self.fill.as_mut(), now_ms) {
            Some(position) => {
                info!(
                    position_id = %position.position_id,
                    direction = %signal.direction,
                    entry_price = position.entry_price,
                    maker = position.is_maker_entry,
                    "shadow position opened"
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
            if trade.won {
                self.wins += 1;
            } else {
                self.losses += 1;
            }
            self.total_profit_eur += trade.net_profit_eur;
            info!(
                position_id = %trade.position.position_id,
                exit_reason = trade.exit_reason.as_str(),
                net_profit = trade.net_profit_eur,
                duration_s = trade.duration_s,
                "shadow position closed"
            );
        }
        closed
    }

    fn summary(&self) -> String {
        format!(
            "shadow: signals={} open={} wins={} losses={} win_rate={:.1}% net=€{:.2} avg=€{:.2}",
            self.signals_processed,
            self.book.len(),
            self.wins,
            self.losses,
            self.win_rate() * 100.0,
            self.total_profit_eur,
            self.avg_profit_eur(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::detector::test_fixtures::passing_market;
    use crate::modes::tests::{candidate, policy};
    use crate::types::ExitReason;

    /// Scenario: an accepted candidate processed in shadow mode.
    /// Expected: A virtual position opens at the YES bid with the fixed size
    /// and no external effect beyond the action record.
    #[test]
    fn test_shadow_opens_at_bid() {
        let mut mode = ShadowMode::new(policy(), 20.0);
        let now = 1_000_000;
        assert!(mode.should_process(&candidate(now), now));
        match mode.process(&candidate(now), now) {
            ModeAction::Opened { entry_price, size_eur, .. } => {
                assert!((entry_price - 0.50).abs() < 1e-12);
                assert!((size_eur - 20.0).abs() < 1e-12);
            }
            other => panic!("expected open, got {:?}", other),
        }
        assert_eq!(mode.open_positions(), 1);
    }

    /// Scenario: position rides to take-profit, then a second one stops out.
    /// Expected: Win/loss tallies and net P&L update accordingly.
    #[test]
    fn test_shadow_records_outcomes() {
        let mut mode = ShadowMode::new(policy(), 20.0);
        let now = 1_000_000;
        mode.process(&candidate(now), now);

        let mut market = passing_market();
        market.yes_bid = 0.54;
        let closed = mode.on_tick(Some(&market), now + 5_000);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].exit_reason, ExitReason::TakeProfit);
        assert_eq!(mode.wins, 1);

        mode.process(&candidate(now + 20_000), now + 20_000);
        let mut down = passing_market();
        down.yes_bid = 0.46;
        let closed = mode.on_tick(Some(&down), now + 25_000);
        assert_eq!(closed[0].exit_reason, ExitReason::StopLoss);
        assert_eq!(mode.losses, 1);
        assert!((mode.win_rate() - 0.5).abs() < 1e-12);
    }

    /// Scenario: tick with no market snapshot available.
    /// Expected: No closes, no panic.
    #[test]
    fn test_shadow_tick_without_market() {
        let mut mode = ShadowMode::new(policy(), 20.0);
        mode.process(&candidate(1_000_000), 1_000_000);
        assert!(mode.on_tick(None, 2_000_000).is_empty());
        assert_eq!(mode.open_positions(), 1);
    }
}
