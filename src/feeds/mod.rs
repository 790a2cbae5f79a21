pub mod buffer;
pub mod market;
pub mod oracle;
pub mod spot;

use serde::Serialize;

use crate::types::SpotTick;

/// Connection lifecycle of a streaming feed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Receiving,
    Idle,
    Closing,
}

/// Health status of a data feed, published on a watch channel so readers
/// always observe the latest value without blocking the feed.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct FeedHealth {
    pub state: ConnState,
    pub connected: bool,
    pub last_msg_ms: i64,
    pub latency_ms: f64,
    pub reconnects: u32,
    pub errors: u32,
}

impl FeedHealth {
    pub fn new() -> Self {
        Self {
            state: ConnState::Disconnected,
            connected: false,
            last_msg_ms: 0,
            latency_ms: 0.0,
            reconnects: 0,
            errors: 0,
        }
    }

    /// Stale when no message has arrived within `threshold_ms`.
    pub fn is_stale(&self, now_ms: i64, threshold_ms: i64) -> bool {
        if self.last_msg_ms == 0 {
            return true;
        }
        now_ms - self.last_msg_ms > threshold_ms
    }

    pub fn age_ms(&self, now_ms: i64) -> i64 {
        if self.last_msg_ms == 0 {
            return -1;
        }
        now_ms - self.last_msg_ms
    }
}

impl Default for FeedHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Tick listener registered on a spot feed. Invoked synchronously in
/// registration order; an Err is counted and logged, never propagated.
pub type TickListener = Box<dyn FnMut(&SpotTick) -> anyhow::Result<()> + Send>;
