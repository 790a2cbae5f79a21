use std::collections::VecDeque;

use tracing::{debug, info, warn};

use crate::types::{ConsensusData, ExchangeMetrics, Venue, VolRegime};

/// Venues older than this (by local receipt time) are dropped from consensus.
const STALENESS_MS: i64 = 10_000;

/// Bounded ATR history for percentile-based regime classification.
#[derive(Clone, Debug)]
pub struct AtrHistory {
    values: VecDeque<f64>,
    max_size: usize,
}

impl AtrHistory {
    pub fn new(max_size: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    pub fn add(&mut self, atr: f64) {
        self.values.push_back(atr);
        while self.values.len() > self.max_size {
            self.values.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Percentile in [0, 100]; 0 when empty.
    pub fn percentile(&self, p: f64) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.values.iter().copied().collect();
        sorted.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let idx = ((sorted.len() as f64 * p / 100.0) as usize).min(sorted.len() - 1);
        sorted[idx]
    }
}

fn median(values: &mut Vec<f64>) -> f64 {
    values.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = values.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    }
}

/// Aggregates per-venue metrics into one consensus price with outlier
/// rejection:
///   - all prices within tolerance → volume-weighted average;
///   - one outlier within 2× tolerance (≥3 venues) → median;
///   - otherwise no consensus.
pub struct ConsensusEngine {
    tolerance: f64,
    slots: [Option<ExchangeMetrics>; 3],
    atr_history: AtrHistory,
}

impl ConsensusEngine {
    pub fn new(tolerance: f64) -> Self {
        Self {
            tolerance,
            slots: [None, None, None],
            atr_history: AtrHistory::new(1000),
        }
    }

    /// Latest metrics for one venue. One writer per venue slot.
    pub fn update_venue(&mut self, metrics: ExchangeMetrics) {
        let idx = metrics.venue.idx();
        self.slots[idx] = Some(metrics);
    }

    pub fn venue_connected(&self, venue: Venue) -> bool {
        self.slots[venue.idx()].is_some()
    }

    fn fresh_venues(&self, now_ms: i64) -> Vec<ExchangeMetrics> {
        self.slots
            .iter()
            .flatten()
            .filter(|m| now_ms - m.local_ts_ms < STALENESS_MS)
            .cloned()
            .collect()
    }

    /// The venue whose deviation exceeds both 1.5× tolerance and twice the
    /// next largest deviation, if any.
    fn identify_outlier(&self, metrics: &[ExchangeMetrics]) -> Option<Venue> {
        if metrics.len() < 3 {
            return None;
        }
        let mean = metrics.iter().map(|m| m.price).sum::<f64>() / metrics.len() as f64;
        if mean <= 0.0 {
            return None;
        }
        let mut deviations: Vec<(Venue, f64)> = metrics
            .iter()
            .map(|m| (m.venue, (m.price - mean).abs() / mean))
            .collect();
        deviations.sort_unstable_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        if deviations[0].1 > 1.5 * self.tolerance && deviations[0].1 > 2.0 * deviations[1].1 {
            return Some(deviations[0].0);
        }
        None
    }

    pub fn atr_percentile(&self, p: f64) -> f64 {
        self.atr_history.percentile(p)
    }

    fn classify_regime(&self, atr: f64) -> VolRegime {
        if self.atr_history.is_empty() {
            return VolRegime::Normal;
        }
        let p25 = self.atr_history.percentile(25.0);
        let p75 = self.atr_history.percentile(75.0);
        if atr < p25 {
            VolRegime::Low
        } else if atr > p75 {
            VolRegime::High
        } else {
            VolRegime::Normal
        }
    }

    /// Compute consensus over the fresh venue set. None when fewer than two
    /// venues are fresh or prices disagree beyond 2× tolerance.
    pub fn compute(&mut self, now_ms: i64) -> Option<ConsensusData> {
        let fresh = self.fresh_venues(now_ms);
        if fresh.len() < 2 {
            debug!(fresh = fresh.len(), "insufficient venues for consensus");
            return None;
        }

        let prices: Vec<f64> = fresh.iter().map(|m| m.price).collect();
        let mean = prices.iter().sum::<f64>() / prices.len() as f64;
        if mean <= 0.0 {
            return None;
        }
        let max_dev = prices
            .iter()
            .map(|p| (p - mean).abs() / mean)
            .fold(0.0_f64, f64::max);

        let agreement_score = if max_dev > 0.0 {
            (1.0 - max_dev / (2.0 * self.tolerance)).clamp(0.0, 1.0)
        } else {
            1.0
        };

        let price = if max_dev <= self.tolerance {
            let total_volume: f64 = fresh.iter().map(|m| m.vol_1m).sum();
            if total_volume > 0.0 {
                fresh.iter().map(|m| m.price * m.vol_1m).sum::<f64>() / total_volume
            } else {
                mean
            }
        } else if max_dev <= 2.0 * self.tolerance && fresh.len() >= 3 {
            if let Some(outlier) = self.identify_outlier(&fresh) {
                info!(outlier = %outlier, max_dev, "using median due to outlier");
            }
            let mut prices = prices.clone();
            median(&mut prices)
        } else {
            warn!(max_dev, agreement_score, "consensus failure, high deviation");
            return None;
        };

        let n = fresh.len() as f64;
        let move_30s = fresh.iter().map(|m| m.move_30s).sum::<f64>() / n;
        let vol_30s = fresh.iter().map(|m| m.volatility_30s).sum::<f64>() / n;
        let atr_5m = fresh.iter().map(|m| m.atr_5m).sum::<f64>() / n;
        let max_10s_move = fresh.iter().map(|m| m.max_move_10s).fold(0.0_f64, f64::max);

        if atr_5m > 0.0 {
            self.atr_history.add(atr_5m);
        }

        let spike_concentration = if move_30s.abs() > f64::EPSILON {
            max_10s_move / move_30s.abs()
        } else {
            0.0
        };

        let total_vol_1m: f64 = fresh.iter().map(|m| m.vol_1m).sum();
        let avg_vol_5m: f64 = fresh.iter().filter(|m| m.vol_5m_avg > 0.0).map(|m| m.vol_5m_avg).sum();
        let surge_ratio = if avg_vol_5m > 0.0 {
            total_vol_1m / avg_vol_5m
        } else {
            1.0
        };

        let regime = self.classify_regime(atr_5m);

        Some(ConsensusData {
            price,
            ts_ms: now_ms,
            venue_count: fresh.len(),
            venues: fresh,
            move_30s,
            vol_30s,
            atr_5m,
            regime,
            max_10s_move,
            spike_concentration,
            total_vol_1m,
            avg_vol_5m,
            surge_ratio,
            agree: true,
            max_dev_pct: max_dev,
            agreement_score,
        })
    }
}
