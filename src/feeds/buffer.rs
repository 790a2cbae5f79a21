use std::collections::VecDeque;

#[derive(Clone, Copy, Debug)]
struct Entry {
    price: f64,
    ts_ms: i64,
    volume: f64,
}

/// Time-keyed rolling buffer of (price, timestamp, quote volume) per feed.
/// Timestamps are monotone non-decreasing within a feed; retention is a hard
/// horizon enforced on append. All derived queries return 0 on degenerate
/// windows instead of failing.
#[derive(Clone, Debug)]
pub struct PriceBuffer {
    entries: VecDeque<Entry>,
    retention_ms: i64,
    adds: u64,
}

impl PriceBuffer {
    pub const DEFAULT_RETENTION_S: i64 = 300;

    pub fn new() -> Self {
        Self::with_retention(Self::DEFAULT_RETENTION_S)
    }

    pub fn with_retention(retention_s: i64) -> Self {
        Self {
            entries: VecDeque::with_capacity(4096),
            retention_ms: retention_s * 1000,
            adds: 0,
        }
    }

    /// Append a price point and evict entries past the retention horizon.
    /// Non-positive prices are rejected. O(amortised 1).
    pub fn add(&mut self, price: f64, ts_ms: i64, q_volume: f64) {
        if price <= 0.0 {
            return;
        }
        self.entries.push_back(Entry {
            price,
            ts_ms,
            volume: q_volume.max(0.0),
        });
        self.adds += 1;

        let cutoff = ts_ms - self.retention_ms;
        while self.entries.front().map_or(false, |e| e.ts_ms < cutoff) {
            self.entries.pop_front();
        }
    }

    /// Index of the first entry with ts_ms >= now − w_s·1000.
    fn window_start(&self, window_s: f64, now_ms: i64) -> usize {
        let cutoff = now_ms - (window_s * 1000.0) as i64;
        self.entries.partition_point(|e| e.ts_ms < cutoff)
    }

    fn window(&self, window_s: f64, now_ms: i64) -> impl Iterator<Item = &Entry> {
        let start = self.window_start(window_s, now_ms);
        self.entries.range(start..)
    }

    /// (p_last − p_first) / p_first over the last `window_s` seconds.
    pub fn move_pct(&self, window_s: f64, now_ms: i64) -> f64 {
        let start = self.window_start(window_s, now_ms);
        let n = self.entries.len() - start;
        if n < 2 {
            return 0.0;
        }
        let first = self.entries[start].price;
        let last = self.entries[self.entries.len() - 1].price;
        if first <= 0.0 {
            return 0.0;
        }
        (last - first) / first
    }

    /// Sample standard deviation of per-step returns over the window.
    pub fn volatility(&self, window_s: f64, now_ms: i64) -> f64 {
        let prices: Vec<f64> = self.window(window_s, now_ms).map(|e| e.price).collect();
        if prices.len() < 3 {
            return 0.0;
        }
        let returns: Vec<f64> = prices
            .windows(2)
            .filter(|w| w[0] > 0.0)
            .map(|w| (w[1] - w[0]) / w[0])
            .collect();
        if returns.len() < 2 {
            return 0.0;
        }
        let n = returns.len() as f64;
        let mean = returns.iter().sum::<f64>() / n;
        let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
        var.sqrt()
    }

    /// move_pct / Δt, in fraction per second.
    pub fn velocity(&self, window_s: f64, now_ms: i64) -> f64 {
        let start = self.window_start(window_s, now_ms);
        let n = self.entries.len() - start;
        if n < 2 {
            return 0.0;
        }
        let first = &self.entries[start];
        let last = &self.entries[self.entries.len() - 1];
        let dt_s = (last.ts_ms - first.ts_ms) as f64 / 1000.0;
        if dt_s <= 0.0 || first.price <= 0.0 {
            return 0.0;
        }
        ((last.price - first.price) / first.price) / dt_s
    }

    /// Mean of (high − low) / mid across non-overlapping sub-windows of
    /// `period_s`. Returns 0 with fewer than 10 samples in the window.
    pub fn atr(&self, window_s: f64, period_s: f64, now_ms: i64) -> f64 {
        let entries: Vec<&Entry> = self.window(window_s, now_ms).collect();
        if entries.len() < 10 {
            return 0.0;
        }
        let period_ms = (period_s * 1000.0) as i64;
        let mut ranges: Vec<f64> = Vec::new();
        let mut period_start = entries[0].ts_ms;
        let mut high = f64::MIN;
        let mut low = f64::MAX;
        let mut in_period = false;

        for e in &entries {
            if in_period && e.ts_ms - period_start >= period_ms {
                let mid = (high + low) / 2.0;
                if mid > 0.0 {
                    ranges.push((high - low) / mid);
                }
                period_start = e.ts_ms;
                high = e.price;
                low = e.price;
            } else {
                high = high.max(e.price);
                low = low.min(e.price);
                in_period = true;
            }
        }
        if in_period && high >= low {
            let mid = (high + low) / 2.0;
            if mid > 0.0 {
                ranges.push((high - low) / mid);
            }
        }
        if ranges.is_empty() {
            return 0.0;
        }
        ranges.iter().sum::<f64>() / ranges.len() as f64
    }

    /// Maximum absolute return achievable within any contiguous `sub_s`
    /// interval inside the last `window_s` seconds. Spike concentration input.
    pub fn max_move_in_subwindow(&self, window_s: f64, sub_s: f64, now_ms: i64) -> f64 {
        let entries: Vec<&Entry> = self.window(window_s, now_ms).collect();
        if entries.len() < 2 {
            return 0.0;
        }
        let sub_ms = (sub_s * 1000.0) as i64;
        let mut max_move = 0.0_f64;
        for i in 0..entries.len() - 1 {
            let start = entries[i];
            if start.price <= 0.0 {
                continue;
            }
            for end in &entries[i + 1..] {
                if end.ts_ms - start.ts_ms > sub_ms {
                    break;
                }
                let mv = (end.price - start.price).abs() / start.price;
                max_move = max_move.max(mv);
            }
        }
        max_move
    }

    /// Total quote volume over the window.
    pub fn volume_sum(&self, window_s: f64, now_ms: i64) -> f64 {
        self.window(window_s, now_ms).map(|e| e.volume).sum()
    }

    /// Quote volume per minute across the window span.
    pub fn volume_per_minute(&self, window_s: f64, now_ms: i64) -> f64 {
        let start = self.window_start(window_s, now_ms);
        let n = self.entries.len() - start;
        if n < 2 {
            return 0.0;
        }
        let first_ts = self.entries[start].ts_ms;
        let last_ts = self.entries[self.entries.len() - 1].ts_ms;
        let span_min = (last_ts - first_ts) as f64 / 60_000.0;
        if span_min <= 0.0 {
            return 0.0;
        }
        let total: f64 = self.entries.range(start..).map(|e| e.volume).sum();
        total / span_min
    }

    #[inline]
    pub fn current_price(&self) -> Option<f64> {
        self.entries.back().map(|e| e.price)
    }

    #[inline]
    pub fn current_timestamp(&self) -> Option<i64> {
        self.entries.back().map(|e| e.ts_ms)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of accepted add() calls since construction.
    #[inline]
    pub fn add_count(&self) -> u64 {
        self.adds
    }
}

impl Default for PriceBuffer {
    fn default() -> Self {
        Self::new()
    }
}
