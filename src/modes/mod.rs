pub mod alert;
pub mod auto;
pub mod shadow;

use crate::config::ExecutionSettings;
use crate::types::{
    Direction, ExitReason, MarketSnapshot, SignalCandidate, TokenSide,
};

/// Exit policy applied to every monitored position. The core only decides
/// WHEN to exit; acting on it belongs to the execution boundary.
#[derive(Clone, Copy, Debug)]
pub struct ExitPolicy {
    pub take_profit_pct: f64,
    pub stop_move_abs: f64,
    pub spread_exit_threshold: f64,
    pub time_limit_s: f64,
}

impl ExitPolicy {
    pub fn from_execution(execution: &ExecutionSettings) -> Self {
        Self {
            take_profit_pct: execution.take_profit_pct,
            stop_move_abs: execution.stop_move_abs,
            spread_exit_threshold: execution.spread_exit_threshold,
            time_limit_s: execution.time_limit_s,
        }
    }
}

/// A simulated position opened against the prediction market.
#[derive(Clone, Debug)]
pub struct VirtualPosition {
    pub position_id: String,
    pub signal_id: String,
    pub market_id: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub entry_ts_ms: i64,
    pub size_eur: f64,
    pub entry_fee_eur: f64,
    pub is_maker_entry: bool,
    pub current_price: f64,
    pub max_profit_pct: f64,
    pub max_drawdown_pct: f64,
}

impl VirtualPosition {
    #[inline]
    pub fn pnl_pct(&self) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        (self.current_price - self.entry_price) / self.entry_price
    }

    #[inline]
    pub fn duration_s(&self, now_ms: i64) -> f64 {
        (now_ms - self.entry_ts_ms).max(0) as f64 / 1000.0
    }
}

/// A closed simulated position with its realised result.
#[derive(Clone, Debug)]
pub struct ClosedTrade {
    pub position: VirtualPosition,
    pub exit_price: f64,
    pub exit_reason: ExitReason,
    pub gross_profit_eur: f64,
    pub net_profit_eur: f64,
    pub duration_s: f64,
    pub closed_at_ms: i64,
    pub won: bool,
}

/// The stop is an absolute adverse price move translated into a percentage at
/// the entry price, clamped to [−15%, −5%] so cheap entries are not stopped
/// out by one tick and expensive ones are not allowed to bleed.
pub fn dynamic_stop_pct(entry_price: f64, stop_move_abs: f64) -> f64 {
    if entry_price <= 0.0 {
        return -0.05;
    }
    (-stop_move_abs / entry_price).clamp(-0.15, -0.05)
}

/// The exit predicate: take-profit, stop-loss, spread convergence, liquidity
/// collapse, or the time limit. First hit wins.
pub fn exit_reason(
    position: &VirtualPosition,
    market: &MarketSnapshot,
    policy: &ExitPolicy,
    now_ms: i64,
) -> Option<ExitReason> {
    let pnl_pct = position.pnl_pct();
    if pnl_pct >= policy.take_profit_pct {
        return Some(ExitReason::TakeProfit);
    }
    if pnl_pct <= dynamic_stop_pct(position.entry_price, policy.stop_move_abs) {
        return Some(ExitReason::StopLoss);
    }
    if market.spread > 0.0 && market.spread < policy.spread_exit_threshold {
        return Some(ExitReason::SpreadConverged);
    }
    if market.liq_collapsing {
        return Some(ExitReason::LiquidityCollapse);
    }
    if position.duration_s(now_ms) > policy.time_limit_s {
        return Some(ExitReason::TimeLimit);
    }
    None
}

/// Fill adjustment applied to simulated entries. The production path is the
/// exact quoted price; test harnesses may plug noisier models.
pub trait FillModel: Send {
    fn entry_price(&mut self, quoted: f64) -> f64;
}

/// Deterministic pass-through fill.
pub struct ExactFill;

impl FillModel for ExactFill {
    fn entry_price(&mut self, quoted: f64) -> f64 {
        quoted
    }
}

/// Book of open simulated positions with exit monitoring. Owned by a mode;
/// no sharing.
pub struct PositionBook {
    positions: Vec<VirtualPosition>,
    policy: ExitPolicy,
    next_seq: u64,
}

impl PositionBook {
    pub fn new(policy: ExitPolicy) -> Self {
        Self {
            positions: Vec::new(),
            policy,
            next_seq: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Open a position from a validated, scored candidate. Entry is at the
    /// quoted bid for the chosen side, adjusted by the fill model. Returns
    /// None when the quote is unusable.
    pub fn open(
        &mut self,
        signal: &SignalCandidate,
        size_eur: f64,
        fill: &mut dyn FillModel,
        now_ms: i64,
    ) -> Option<&VirtualPosition> {
        let side = match signal.direction {
            Direction::Up => TokenSide::Yes,
            Direction::Down => TokenSide::No,
        };
        let quoted = match side {
            TokenSide::Yes => signal.market.yes_bid,
            TokenSide::No => signal.market.no_bid,
        };
        if quoted <= 0.0 || quoted >= 1.0 {
            return None;
        }
        let entry_price = fill.entry_price(quoted);

        // Post a maker order when the spread leaves room and the book has
        // been quiet long enough for it to rest
        let is_maker_entry =
            signal.market.spread < 0.03 && signal.market.orderbook_age_s > 8.0;
        let entry_fee_eur = if is_maker_entry {
            0.0
        } else {
            size_eur * signal.market.effective_taker_fee(side, entry_price)
        };

        let position = VirtualPosition {
            position_id: format!("pos-{}-{}", &signal.signal_id[..8.min(signal.signal_id.len())], self.next_seq),
            signal_id: signal.signal_id.clone(),
            market_id: signal.market_id.clone(),
            direction: signal.direction,
            entry_price,
            entry_ts_ms: now_ms,
            size_eur,
            entry_fee_eur,
            is_maker_entry,
            current_price: entry_price,
            max_profit_pct: 0.0,
            max_drawdown_pct: 0.0,
        };
        self.next_seq += 1;
        self.positions.push(position);
        self.positions.last()
    }

    /// Re-mark every open position against the latest book and close those
    /// whose exit predicate fires.
    pub fn on_tick(&mut self, market: &MarketSnapshot, now_ms: i64) -> Vec<ClosedTrade> {
        let mut closed = Vec::new();
        let policy = self.policy;
        self.positions.retain_mut(|position| {
            // Exits sell at the bid of the held side
            let mark = match position.direction {
                Direction::Up => market.yes_bid,
                Direction::Down => market.no_bid,
            };
            if mark > 0.0 {
                position.current_price = mark;
            }
            let pnl = position.pnl_pct();
            position.max_profit_pct = position.max_profit_pct.max(pnl);
            position.max_drawdown_pct = position.max_drawdown_pct.min(pnl);

            match exit_reason(position, market, &policy, now_ms) {
                Some(reason) => {
                    let gross = position.pnl_pct() * position.size_eur;
                    let net = gross - position.entry_fee_eur;
                    closed.push(ClosedTrade {
                        exit_price: position.current_price,
                        exit_reason: reason,
                        gross_profit_eur: gross,
                        net_profit_eur: net,
                        duration_s: position.duration_s(now_ms),
                        closed_at_ms: now_ms,
                        won: net > 0.0,
                        position: position.clone(),
                    });
                    false
                }
                None => true,
            }
        });
        closed
    }
}

/// What the dispatcher did with an accepted signal.
#[derive(Clone, Debug, PartialEq)]
pub enum ModeAction {
    Opened {
        position_id: String,
        entry_price: f64,
        size_eur: f64,
    },
    Alerted,
    Rejected(&'static str),
}

/// An operating mode consuming final signals. The runner feeds accepted
/// candidates through `should_process` / `process`, and drives position
/// upkeep through `on_tick`.
pub trait Mode: Send {
    fn name(&self) -> &'static str;

    /// Gate an already validated, scored candidate.
    fn should_process(&mut self, signal: &SignalCandidate, now_ms: i64) -> bool;

    /// Consume the candidate.
    fn process(&mut self, signal: &SignalCandidate, now_ms: i64) -> ModeAction;

    /// Periodic upkeep: re-mark positions, evaluate exits, drive breakers.
    fn on_tick(&mut self, market: Option<&MarketSnapshot>, now_ms: i64) -> Vec<ClosedTrade>;

    /// End-of-run summary for the session report.
    fn summary(&self) -> String;
}
