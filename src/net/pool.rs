use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

struct PooledConn {
    stream: WsStream,
    created_at: Instant,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PoolStats {
    pub created: u64,
    pub handed_out: u64,
    pub instant_switchovers: u64,
    pub refreshed: u64,
    pub ping_failures: u64,
}

/// Warm-connection pool for one WebSocket URL. A background task keeps
/// `target_size` connections open, pings them periodically, and replaces any
/// past the age limit. A consumer whose active connection died takes a warm
/// one without paying the handshake.
pub struct ConnectionPool {
    url: String,
    target_size: usize,
    ping_interval: Duration,
    max_age: Duration,
    conns: Mutex<VecDeque<PooledConn>>,
    created: AtomicU64,
    handed_out: AtomicU64,
    instant_switchovers: AtomicU64,
    refreshed: AtomicU64,
    ping_failures: AtomicU64,
}

impl ConnectionPool {
    pub fn new(url: String, target_size: usize, ping_interval_s: u64, max_age_s: u64) -> Arc<Self> {
        Arc::new(Self {
            url,
            target_size,
            ping_interval: Duration::from_secs(ping_interval_s),
            max_age: Duration::from_secs(max_age_s),
            conns: Mutex::new(VecDeque::new()),
            created: AtomicU64::new(0),
            handed_out: AtomicU64::new(0),
            instant_switchovers: AtomicU64::new(0),
            refreshed: AtomicU64::new(0),
            ping_failures: AtomicU64::new(0),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.created.load(Ordering::Relaxed),
            handed_out: self.handed_out.load(Ordering::Relaxed),
            instant_switchovers: self.instant_switchovers.load(Ordering::Relaxed),
            refreshed: self.refreshed.load(Ordering::Relaxed),
            ping_failures: self.ping_failures.load(Ordering::Relaxed),
        }
    }

    /// Take a warm connection if one is available, otherwise dial directly.
    /// Warm handouts count as instant switchovers.
    pub async fn acquire(&self) -> Option<WsStream> {
        if let Some(pooled) = self.conns.lock().await.pop_front() {
            self.handed_out.fetch_add(1, Ordering::Relaxed);
            self.instant_switchovers.fetch_add(1, Ordering::Relaxed);
            debug!(url = %self.url, "pool: instant switchover");
            return Some(pooled.stream);
        }
        match self.dial().await {
            Some(stream) => {
                self.handed_out.fetch_add(1, Ordering::Relaxed);
                Some(stream)
            }
            None => None,
        }
    }

    async fn dial(&self) -> Option<WsStream> {
        match tokio::time::timeout(CONNECT_TIMEOUT, connect_async(&self.url)).await {
            Ok(Ok((stream, _))) => {
                self.created.fetch_add(1, Ordering::Relaxed);
                Some(stream)
            }
            Ok(Err(e)) => {
                warn!(url = %self.url, error = %e, "pool: dial failed");
                None
            }
            Err(_) => {
                warn!(url = %self.url, "pool: dial timed out");
                None
            }
        }
    }

    /// Background maintenance: refill, ping, age-based refresh. Closes every
    /// pooled connection when shutdown flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.ping_interval);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.maintain().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.close_all().await;
    }

    async fn maintain(&self) {
        // Refill outside the lock, then ping/refresh under it
        let deficit = {
            let conns = self.conns.lock().await;
            self.target_size.saturating_sub(conns.len())
        };
        for _ in 0..deficit {
            if let Some(stream) = self.dial().await {
                self.conns.lock().await.push_back(PooledConn {
                    stream,
                    created_at: Instant::now(),
                });
            }
        }

        let mut conns = self.conns.lock().await;
        let mut kept: VecDeque<PooledConn> = VecDeque::with_capacity(conns.len());
        while let Some(mut pooled) = conns.pop_front() {
            if pooled.created_at.elapsed() > self.max_age {
                self.refreshed.fetch_add(1, Ordering::Relaxed);
                let _ = pooled.stream.close(None).await;
                continue;
            }
            match pooled.stream.send(Message::Ping(vec![])).await {
                Ok(()) => kept.push_back(pooled),
                Err(e) => {
                    self.ping_failures.fetch_add(1, Ordering::Relaxed);
                    debug!(url = %self.url, error = %e, "pool: ping failed, dropping");
                }
            }
        }
        *conns = kept;
    }

    async fn close_all(&self) {
        let mut conns = self.conns.lock().await;
        while let Some(mut pooled) = conns.pop_front() {
            let _ = pooled.stream.close(None).await;
        }
        debug!(url = %self.url, "pool: closed");
    }
}
