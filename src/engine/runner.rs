use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::{Config, Mode as ModeKind};
use crate::engine::confidence::ConfidenceScorer;
use crate::engine::consensus::ConsensusEngine;
use crate::engine::detector::{Rejection, SignalDetector};
use crate::engine::intel::MarketIntelligence;
use crate::engine::validator::Validator;
use crate::feeds::FeedHealth;
use crate::modes::alert::AlertMode;
use crate::modes::auto::AutoMode;
use crate::modes::shadow::ShadowMode;
use crate::modes::{ExitPolicy, Mode, ModeAction};
use crate::telemetry::notifier::alert_payload;
use crate::telemetry::{RejectionRecord, TelemetryEvent, TradeRecord};
use crate::types::{
    ExchangeMetrics, FlowEvent, MarketSnapshot, OracleState, RejectReason, SignalCandidate,
};

/// Market snapshots older than this are unusable for the signal path.
const MARKET_STALE_MS: i64 = 10_000;

/// What one signal-loop cycle concluded. Exposed for tests; the loop itself
/// only cares about the side effects.
#[derive(Clone, Debug, PartialEq)]
pub enum CycleOutcome {
    NoData,
    NoConsensus,
    FeedStale,
    Duplicate,
    GateRejected(RejectReason),
    Mispriced,
    ValidationRejected(RejectReason),
    Dispatched(ModeAction),
    ModeDeclined,
}

pub struct CycleResult {
    pub outcome: CycleOutcome,
    pub events: Vec<TelemetryEvent>,
    pub fast_poll: bool,
}

/// The decision pipeline, owned by the signal-loop task: consensus →
/// detector → validator → scorer → intelligence → mode dispatch. All inputs
/// arrive as point-in-time snapshots; this struct holds every piece of
/// mutable signal-path state.
pub struct Engine {
    config: Config,
    consensus: ConsensusEngine,
    detector: SignalDetector,
    validator: Validator,
    scorer: ConfidenceScorer,
    pub intel: MarketIntelligence,
    mode: Box<dyn Mode>,
    /// Open simulated positions by signal id, for outcome attribution.
    open_signals: HashMap<String, SignalCandidate>,
    last_oracle_round: u64,
    last_oracle_update_ms: i64,
    awaiting_mm_response: bool,
    last_pm_change_ms: i64,
}

impl Engine {
    pub fn new(config: Config) -> Self {
        let policy = ExitPolicy::from_execution(&config.execution);
        let mode: Box<dyn Mode> = match config.mode {
            ModeKind::Shadow => Box::new(ShadowMode::new(policy, config.execution.position_size_eur)),
            ModeKind::Alert => Box::new(AlertMode::new(
                config.alerts.confidence_threshold,
                config.alerts.cooldown_s,
            )),
            ModeKind::Automated => Box::new(AutoMode::new(
                config.risk.clone(),
                policy,
                config.execution.position_size_eur,
            )),
        };
        Self {
            consensus: ConsensusEngine::new(config.signals.consensus_price_tolerance),
            detector: SignalDetector::new(config.signals.clone(), config.oracle.clone()),
            validator: Validator::new(config.signals.clone(), config.oracle.clone()),
            scorer: ConfidenceScorer::new(config.weights.clone(), config.signals.clone()),
            intel: MarketIntelligence::new(),
            mode,
            open_signals: HashMap::new(),
            last_oracle_round: 0,
            last_oracle_update_ms: 0,
            awaiting_mm_response: false,
            last_pm_change_ms: 0,
            config,
        }
    }

    pub fn mode_summary(&self) -> String {
        self.mode.summary()
    }

    /// Feed oracle / PM timing into the intelligence trackers.
    fn observe_timing(&mut self, oracle: Option<&OracleState>, market: Option<&MarketSnapshot>) {
        if let Some(oracle) = oracle {
            if oracle.round_id > self.last_oracle_round {
                if self.last_oracle_round > 0 {
                    self.intel.oracle_predictor.record_update(oracle.updated_at_ms);
                    self.awaiting_mm_response = true;
                }
                self.last_oracle_round = oracle.round_id;
                self.last_oracle_update_ms = oracle.updated_at_ms;
            }
        }
        if let Some(market) = market {
            if market.last_price_change_ms > self.last_pm_change_ms {
                if self.awaiting_mm_response {
                    self.intel
                        .mm_lag
                        .record(self.last_oracle_update_ms, market.last_price_change_ms);
                    self.awaiting_mm_response = false;
                }
                self.last_pm_change_ms = market.last_price_change_ms;
            }
        }
    }

    /// Close out finished positions: history, intelligence, telemetry.
    fn settle_positions(
        &mut self,
        market: Option<&MarketSnapshot>,
        now_ms: i64,
        events: &mut Vec<TelemetryEvent>,
    ) {
        let closed = self.mode.on_tick(market, now_ms);
        for trade in closed {
            if let Some(candidate) = self.open_signals.remove(&trade.position.signal_id) {
                self.validator.record_outcome(&candidate, trade.won, now_ms);
            }
            self.intel
                .record_outcome(trade.closed_at_ms, trade.won, trade.net_profit_eur);
            events.push(TelemetryEvent::TradeClosed(TradeRecord {
                ts_ms: trade.closed_at_ms,
                signal_id: trade.position.signal_id.clone(),
                market_id: trade.position.market_id.clone(),
                direction: trade.position.direction,
                mode: self.mode.name(),
                entry_price: trade.position.entry_price,
                exit_price: trade.exit_price,
                exit_reason: trade.exit_reason,
                size_eur: trade.position.size_eur,
                gross_profit_eur: trade.gross_profit_eur,
                net_profit_eur: trade.net_profit_eur,
                duration_s: trade.duration_s,
                won: trade.won,
            }));
        }
    }

    fn rejection_event(
        reason: RejectReason,
        candidate_direction: Option<crate::types::Direction>,
        move_30s: f64,
        oracle_age_s: f64,
        now_ms: i64,
    ) -> TelemetryEvent {
        TelemetryEvent::Rejection(RejectionRecord {
            ts_ms: now_ms,
            reason,
            direction: candidate_direction,
            move_30s,
            oracle_age_s,
        })
    }

    /// One pass over the latest snapshots. Never raises: every outcome is a
    /// value, every error below was already recovered at its feed.
    pub fn cycle(
        &mut self,
        venue_metrics: &[Option<ExchangeMetrics>],
        oracle: Option<&OracleState>,
        market: Option<&MarketSnapshot>,
        now_ms: i64,
    ) -> CycleResult {
        let mut events = Vec::new();
        let mut fast_poll = false;

        for metrics in venue_metrics.iter().flatten() {
            self.consensus.update_venue(metrics.clone());
        }
        self.observe_timing(oracle, market);
        self.settle_positions(market, now_ms, &mut events);

        let consensus = match self.consensus.compute(now_ms) {
            Some(c) => c,
            None => {
                return CycleResult {
                    outcome: CycleOutcome::NoConsensus,
                    events,
                    fast_poll,
                }
            }
        };
        let (oracle, market) = match (oracle, market) {
            (Some(o), Some(m)) => (o, m),
            _ => {
                return CycleResult {
                    outcome: CycleOutcome::NoData,
                    events,
                    fast_poll,
                }
            }
        };
        if now_ms - market.ts_ms > MARKET_STALE_MS {
            events.push(Self::rejection_event(
                RejectReason::FeedStale,
                None,
                consensus.move_30s,
                oracle.age_s(now_ms),
                now_ms,
            ));
            return CycleResult {
                outcome: CycleOutcome::FeedStale,
                events,
                fast_poll,
            };
        }

        let mut candidate = match self.detector.detect(&consensus, oracle, market, now_ms) {
            Ok(candidate) => candidate,
            Err(Rejection::Duplicate) => {
                return CycleResult {
                    outcome: CycleOutcome::Duplicate,
                    events,
                    fast_poll,
                }
            }
            Err(Rejection::Gate(reason)) => {
                events.push(Self::rejection_event(
                    reason,
                    None,
                    consensus.move_30s,
                    oracle.age_s(now_ms),
                    now_ms,
                ));
                return CycleResult {
                    outcome: CycleOutcome::GateRejected(reason),
                    events,
                    fast_poll,
                };
            }
            Err(Rejection::Mispriced { mispricing }) => {
                debug!(mispricing, "legacy mispricing gate rejected candidate");
                return CycleResult {
                    outcome: CycleOutcome::Mispriced,
                    events,
                    fast_poll,
                };
            }
        };

        let validation = self.validator.validate(&candidate, now_ms);
        if !validation.passed {
            let reason = validation
                .rejection
                .unwrap_or(RejectReason::ConsensusFailure);
            events.push(Self::rejection_event(
                reason,
                Some(candidate.direction),
                consensus.move_30s,
                oracle.age_s(now_ms),
                now_ms,
            ));
            candidate.validation = Some(validation);
            return CycleResult {
                outcome: CycleOutcome::ValidationRejected(reason),
                events,
                fast_poll,
            };
        }
        candidate.validation = Some(validation);

        let intel_score = self.intel.evaluate(&candidate, now_ms);
        let scoring = self.scorer.score(
            &candidate,
            intel_score.time_multiplier,
            intel_score.ensemble_boost,
        );
        candidate.scoring = Some(scoring);

        // A live divergence is exactly when the book must be watched closely
        fast_poll = true;

        if !self.mode.should_process(&candidate, now_ms) {
            events.push(TelemetryEvent::Signal {
                candidate: Box::new(candidate),
                mode: self.mode.name(),
                action: "declined".to_string(),
            });
            return CycleResult {
                outcome: CycleOutcome::ModeDeclined,
                events,
                fast_poll,
            };
        }

        let action = self.mode.process(&candidate, now_ms);
        match &action {
            ModeAction::Opened { position_id, .. } => {
                self.open_signals
                    .insert(candidate.signal_id.clone(), candidate.clone());
                events.push(TelemetryEvent::Signal {
                    candidate: Box::new(candidate.clone()),
                    mode: self.mode.name(),
                    action: format!("opened:{}", position_id),
                });
            }
            ModeAction::Alerted => {
                events.push(TelemetryEvent::Alert(alert_payload(&candidate, now_ms)));
                events.push(TelemetryEvent::Signal {
                    candidate: Box::new(candidate.clone()),
                    mode: self.mode.name(),
                    action: "alerted".to_string(),
                });
            }
            ModeAction::Rejected(reason) => {
                events.push(TelemetryEvent::Signal {
                    candidate: Box::new(candidate.clone()),
                    mode: self.mode.name(),
                    action: format!("rejected:{}", reason),
                });
            }
        }

        CycleResult {
            outcome: CycleOutcome::Dispatched(action),
            events,
            fast_poll,
        }
    }
}

/// The signal loop task: a fixed cadence over the latest snapshots. Readers
/// never block writers; each cycle reads whatever the feeds last published,
/// so a slow cycle coalesces ticks instead of queueing them.
pub async fn run_signal_loop(
    mut engine: Engine,
    venue_rx: Vec<watch::Receiver<Option<ExchangeMetrics>>>,
    oracle_rx: watch::Receiver<Option<OracleState>>,
    market_rx: watch::Receiver<Option<MarketSnapshot>>,
    mut flow_rx: mpsc::Receiver<FlowEvent>,
    telemetry_tx: mpsc::Sender<TelemetryEvent>,
    trigger_tx: mpsc::Sender<()>,
    mut shutdown: watch::Receiver<bool>,
) -> String {
    let mut tick = tokio::time::interval(Duration::from_millis(
        engine.config.signal_loop_ms.max(50) as u64,
    ));
    info!(
        cadence_ms = engine.config.signal_loop_ms,
        mode = engine.mode.name(),
        "signal loop started"
    );

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        while let Ok(flow) = flow_rx.try_recv() {
            engine.intel.order_flow.record(flow);
        }

        let now_ms = chrono::Utc::now().timestamp_millis();
        let venue_metrics: Vec<Option<ExchangeMetrics>> =
            venue_rx.iter().map(|rx| rx.borrow().clone()).collect();
        let oracle = oracle_rx.borrow().clone();
        let market = market_rx.borrow().clone();

        let result = engine.cycle(&venue_metrics, oracle.as_ref(), market.as_ref(), now_ms);
        for event in result.events {
            if telemetry_tx.try_send(event).is_err() {
                debug!("telemetry channel full, event dropped");
            }
        }
        if result.fast_poll {
            let _ = trigger_tx.try_send(());
        }
    }

    info!("signal loop stopped");
    engine.mode_summary()
}

/// Health monitor: every few seconds, surface stale feeds and forward
/// connectivity transitions to the session tracker.
pub async fn run_health_monitor(
    feeds: Vec<(&'static str, watch::Receiver<FeedHealth>)>,
    interval_s: u64,
    stale_ms: i64,
    telemetry_tx: mpsc::Sender<TelemetryEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(Duration::from_secs(interval_s.max(1)));
    let mut was_connected: Vec<bool> = feeds.iter().map(|_| false).collect();

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }
        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut stale: Vec<&str> = Vec::new();
        for (i, (name, rx)) in feeds.iter().enumerate() {
            let health = *rx.borrow();
            if health.connected && !was_connected[i] {
                let event = if health.reconnects == 0 { "connected" } else { "reconnected" };
                let _ = telemetry_tx.try_send(TelemetryEvent::Connection {
                    feed: name,
                    event,
                    ts_ms: now_ms,
                });
            } else if !health.connected && was_connected[i] {
                let _ = telemetry_tx.try_send(TelemetryEvent::Connection {
                    feed: name,
                    event: "disconnected",
                    ts_ms: now_ms,
                });
            }
            was_connected[i] = health.connected;
            if health.is_stale(now_ms, stale_ms) {
                stale.push(name);
            }
        }
        if !stale.is_empty() {
            warn!(feeds = ?stale, "stale feeds detected");
        }
    }
}
