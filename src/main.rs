use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use oracle_arb::config::Config;
use oracle_arb::engine::runner::{run_health_monitor, run_signal_loop, Engine};
use oracle_arb::feeds::market::run_market_feed;
use oracle_arb::feeds::oracle::run_oracle_feed;
use oracle_arb::feeds::spot::SpotFeed;
use oracle_arb::feeds::FeedHealth;
use oracle_arb::net::pool::ConnectionPool;
use oracle_arb::telemetry::writer::run_telemetry;
use oracle_arb::types::{ExchangeMetrics, FlowEvent, Venue};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    if config.oracle.rpc_url.is_empty() {
        error!("POLYGON_RPC_URL is required (oracle feed cannot start)");
        std::process::exit(1);
    }

    info!(
        asset = %config.asset_label(),
        mode = config.mode.label(),
        window = config.interval_label(),
        loop_ms = config.signal_loop_ms,
        "oracle-lag signal engine starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (telemetry_tx, telemetry_rx) = mpsc::channel(4096);
    let (flow_tx, flow_rx) = mpsc::channel::<FlowEvent>(1024);
    let (trigger_tx, trigger_rx) = mpsc::channel::<()>(64);
    let (oracle_tx, oracle_rx) = watch::channel(None);
    let (market_tx, market_rx) = watch::channel(None);
    let (market_health_tx, market_health_rx) = watch::channel(FeedHealth::new());

    let http = reqwest::Client::new();
    let mut handles = Vec::new();

    // ── Spot feeds, one task per venue ──
    let mut venue_rx: Vec<watch::Receiver<Option<ExchangeMetrics>>> = Vec::new();
    let mut health_feeds: Vec<(&'static str, watch::Receiver<FeedHealth>)> = Vec::new();
    for venue in Venue::ALL {
        let symbol = config.venue_symbol(venue);
        let ws_url = config.venue_ws_url(venue).to_string();
        let (mut feed, metrics_rx, health_rx) = SpotFeed::new(venue, ws_url.clone(), symbol);

        if config.pool.enabled {
            let pool = ConnectionPool::new(
                ws_url,
                config.pool.size,
                config.pool.ping_interval_s,
                config.pool.max_age_s,
            );
            handles.push(tokio::spawn(pool.clone().run(shutdown_rx.clone())));
            feed = feed.with_pool(pool);
        }

        // Large prints feed the order-flow tracker; direction from upticks
        let flow_tx = flow_tx.clone();
        let mut last_price = 0.0_f64;
        feed.add_callback(Box::new(move |tick| {
            let notional = tick.quote_volume();
            if last_price > 0.0 && notional >= 1000.0 && tick.price != last_price {
                let _ = flow_tx.try_send(FlowEvent {
                    ts_ms: tick.local_ts_ms,
                    is_buy: tick.price > last_price,
                    notional,
                });
            }
            last_price = tick.price;
            Ok(())
        }));

        venue_rx.push(metrics_rx);
        health_feeds.push((venue.label(), health_rx));
        handles.push(tokio::spawn(feed.run(shutdown_rx.clone())));
    }

    // ── Oracle + prediction market ──
    handles.push(tokio::spawn(run_oracle_feed(
        config.oracle.clone(),
        oracle_tx,
        shutdown_rx.clone(),
    )));
    handles.push(tokio::spawn(run_market_feed(
        config.clone(),
        http.clone(),
        market_tx,
        market_health_tx,
        trigger_rx,
        shutdown_rx.clone(),
    )));
    health_feeds.push(("market", market_health_rx));

    // ── Health monitor + telemetry ──
    handles.push(tokio::spawn(run_health_monitor(
        health_feeds,
        config.health_interval_s,
        config.feed_stale_ms,
        telemetry_tx.clone(),
        shutdown_rx.clone(),
    )));
    let telemetry_handle = tokio::spawn(run_telemetry(
        telemetry_rx,
        config.log_dir.clone(),
        config.alerts.webhook_url.clone(),
    ));

    // ── Startup grace: at least one spot feed must come up ──
    if !wait_for_spot(&venue_rx, Duration::from_secs(config.startup_grace_s)).await {
        error!(
            grace_s = config.startup_grace_s,
            "no spot feed established within the startup grace, exiting"
        );
        let _ = shutdown_tx.send(true);
        std::process::exit(1);
    }
    info!("spot data flowing, starting signal loop");

    // ── Signal loop ──
    let engine = Engine::new(config.clone());
    let loop_handle = tokio::spawn(run_signal_loop(
        engine,
        venue_rx,
        oracle_rx,
        market_rx,
        flow_rx,
        telemetry_tx.clone(),
        trigger_tx,
        shutdown_rx.clone(),
    ));

    // ── Run until interrupted ──
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "signal handler failed");
    }
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    // Bounded join: the loop returns the mode summary for the final report
    let mode_summary = match tokio::time::timeout(Duration::from_secs(5), loop_handle).await {
        Ok(Ok(summary)) => summary,
        _ => String::from("(signal loop did not report)"),
    };
    let joined = futures_util::future::join_all(handles);
    if tokio::time::timeout(Duration::from_secs(3), joined).await.is_err() {
        info!("some tasks did not stop in time, proceeding with shutdown");
    }

    drop(telemetry_tx);
    match tokio::time::timeout(Duration::from_secs(3), telemetry_handle).await {
        Ok(Ok(tracker)) => {
            let now_ms = chrono::Utc::now().timestamp_millis();
            for line in tracker.report(now_ms, &mode_summary).lines() {
                info!("{}", line);
            }
        }
        _ => info!("telemetry did not flush in time"),
    }
    info!("stopped");
}

async fn wait_for_spot(
    venue_rx: &[watch::Receiver<Option<ExchangeMetrics>>],
    grace: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + grace;
    loop {
        if venue_rx.iter().any(|rx| rx.borrow().is_some()) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}
