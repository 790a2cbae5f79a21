use crate::types::Venue;

/// Operating mode for the dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Shadow,
    Alert,
    Automated,
}

impl Mode {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "alert" => Mode::Alert,
            "automated" | "auto" => Mode::Automated,
            _ => Mode::Shadow,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Mode::Shadow => "shadow",
            Mode::Alert => "alert",
            Mode::Automated => "automated",
        }
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(default)
}

/// Signal detection thresholds. Defaults follow the production tuning.
#[derive(Clone, Debug)]
pub struct SignalThresholds {
    pub min_spot_move_pct: f64,
    pub atr_multiplier: f64,
    pub escape_clause_min_move: f64,
    pub escape_min_oracle_age: f64,
    pub escape_min_imbalance: f64,
    pub escape_min_liquidity: f64,
    pub escape_min_volume_surge: f64,
    pub escape_confidence_penalty: f64,
    pub volume_surge_threshold: f64,
    pub spike_concentration_threshold: f64,
    pub max_volatility_30s: f64,
    pub consensus_price_tolerance: f64,
    pub min_mispricing_pct: f64,
    pub min_liquidity_eur: f64,
    pub min_divergence_pct: f64,
    pub spot_implied_scale: f64,
    pub min_pm_staleness_s: f64,
    pub optimal_pm_staleness_s: f64,
    pub max_pm_staleness_s: f64,
    pub signal_cooldown_ms: i64,
}

impl SignalThresholds {
    fn from_env() -> Self {
        Self {
            min_spot_move_pct: env_f64("MIN_SPOT_MOVE_PCT", 0.003),
            atr_multiplier: env_f64("ATR_MULTIPLIER", 1.5),
            escape_clause_min_move: env_f64("ESCAPE_CLAUSE_MIN_MOVE", 0.008),
            escape_min_oracle_age: env_f64("ESCAPE_MIN_ORACLE_AGE", 15.0),
            escape_min_imbalance: env_f64("ESCAPE_MIN_IMBALANCE", 0.20),
            escape_min_liquidity: env_f64("ESCAPE_MIN_LIQUIDITY", 75.0),
            escape_min_volume_surge: env_f64("ESCAPE_MIN_VOLUME_SURGE", 2.5),
            escape_confidence_penalty: env_f64("ESCAPE_CONFIDENCE_PENALTY", 0.10),
            volume_surge_threshold: env_f64("VOLUME_SURGE_THRESHOLD", 1.2),
            spike_concentration_threshold: env_f64("SPIKE_CONCENTRATION_THRESHOLD", 0.30),
            max_volatility_30s: env_f64("MAX_VOLATILITY_30S", 0.008),
            consensus_price_tolerance: env_f64("CONSENSUS_PRICE_TOLERANCE", 0.0015),
            min_mispricing_pct: env_f64("MIN_MISPRICING_PCT", 0.03),
            min_liquidity_eur: env_f64("MIN_LIQUIDITY_EUR", 50.0),
            min_divergence_pct: env_f64("MIN_DIVERGENCE_PCT", 0.08),
            spot_implied_scale: env_f64("SPOT_IMPLIED_SCALE", 100.0),
            min_pm_staleness_s: env_f64("MIN_PM_STALENESS_S", 3.0),
            optimal_pm_staleness_s: env_f64("OPTIMAL_PM_STALENESS_S", 25.0),
            max_pm_staleness_s: env_f64("MAX_PM_STALENESS_S", 600.0),
            signal_cooldown_ms: env_i64("SIGNAL_COOLDOWN_MS", 10_000),
        }
    }
}

/// Oracle timing thresholds, in seconds.
#[derive(Clone, Debug)]
pub struct OracleSettings {
    pub feed_address: String,
    pub rpc_url: String,
    pub poll_interval_ms: i64,
    pub min_age_low_vol: f64,
    pub min_age_normal_vol: f64,
    pub max_age: f64,
    pub validator_max_age: f64,
    pub fast_heartbeat_threshold: f64,
}

impl OracleSettings {
    fn from_env() -> Self {
        Self {
            // BTC/USD aggregator on Polygon mainnet
            feed_address: env_str(
                "CHAINLINK_FEED_ADDRESS",
                "0xc907E116054Ad103354f2D350FD2514433D57F6f",
            ),
            rpc_url: env_str("POLYGON_RPC_URL", ""),
            poll_interval_ms: env_i64("ORACLE_POLL_MS", 1000),
            min_age_low_vol: env_f64("ORACLE_MIN_AGE_LOW_VOL", 12.0),
            min_age_normal_vol: env_f64("ORACLE_MIN_AGE_NORMAL_VOL", 6.0),
            max_age: env_f64("ORACLE_MAX_AGE", 75.0),
            validator_max_age: env_f64("ORACLE_VALIDATOR_MAX_AGE", 70.0),
            fast_heartbeat_threshold: env_f64("FAST_HEARTBEAT_THRESHOLD", 35.0),
        }
    }
}

/// Confidence component weights. The three legacy fields must keep parsing
/// for older deployments but stay at 0 and do not affect scoring.
#[derive(Clone, Debug)]
pub struct ConfidenceWeights {
    pub divergence: f64,
    pub pm_staleness: f64,
    pub consensus_strength: f64,
    pub liquidity: f64,
    pub volume_surge: f64,
    pub spike_concentration: f64,
    pub maker_advantage: f64,
    pub oracle_age: f64,
    pub misalignment: f64,
    pub spread_anomaly: f64,
}

impl ConfidenceWeights {
    fn from_env() -> Self {
        Self {
            divergence: env_f64("WEIGHT_DIVERGENCE", 0.40),
            pm_staleness: env_f64("WEIGHT_PM_STALENESS", 0.20),
            consensus_strength: env_f64("WEIGHT_CONSENSUS_STRENGTH", 0.15),
            liquidity: env_f64("WEIGHT_LIQUIDITY", 0.10),
            volume_surge: env_f64("WEIGHT_VOLUME_SURGE", 0.08),
            spike_concentration: env_f64("WEIGHT_SPIKE_CONCENTRATION", 0.07),
            maker_advantage: env_f64("WEIGHT_MAKER_ADVANTAGE", 0.05),
            oracle_age: env_f64("WEIGHT_ORACLE_AGE", 0.0),
            misalignment: env_f64("WEIGHT_MISALIGNMENT", 0.0),
            spread_anomaly: env_f64("WEIGHT_SPREAD_ANOMALY", 0.0),
        }
    }
}

/// Simulated-execution policy: fixed sizing and the position exit predicate.
#[derive(Clone, Debug)]
pub struct ExecutionSettings {
    pub position_size_eur: f64,
    pub max_slippage_pct: f64,
    pub take_profit_pct: f64,
    pub stop_move_abs: f64,
    pub spread_exit_threshold: f64,
    pub time_limit_s: f64,
}

impl ExecutionSettings {
    fn from_env() -> Self {
        Self {
            position_size_eur: env_f64("POSITION_SIZE_EUR", 20.0),
            max_slippage_pct: env_f64("MAX_SLIPPAGE_PCT", 0.02),
            take_profit_pct: env_f64("TAKE_PROFIT_PCT", 0.08),
            stop_move_abs: env_f64("STOP_MOVE_ABS", 0.03),
            spread_exit_threshold: env_f64("SPREAD_EXIT_THRESHOLD", 0.005),
            time_limit_s: env_f64("POSITION_TIME_LIMIT_S", 90.0),
        }
    }
}

/// Automated-mode gates and circuit breakers.
#[derive(Clone, Debug)]
pub struct RiskSettings {
    pub auto_min_confidence: f64,
    pub auto_max_trades: u32,
    pub auto_max_loss_eur: f64,
    pub auto_start_hour: u32,
    pub auto_end_hour: u32,
    pub max_concurrent_positions: u32,
    pub max_consecutive_losses: u32,
    pub max_daily_gas_eur: f64,
}

impl RiskSettings {
    fn from_env() -> Self {
        Self {
            auto_min_confidence: env_f64("AUTO_MIN_CONFIDENCE", 0.85),
            auto_max_trades: env_u32("AUTO_MAX_TRADES", 2),
            auto_max_loss_eur: env_f64("AUTO_MAX_LOSS_EUR", 40.0),
            auto_start_hour: env_u32("AUTO_START_HOUR", 2),
            auto_end_hour: env_u32("AUTO_END_HOUR", 6),
            max_concurrent_positions: env_u32("MAX_CONCURRENT_POSITIONS", 1),
            max_consecutive_losses: env_u32("MAX_CONSECUTIVE_LOSSES", 2),
            max_daily_gas_eur: env_f64("MAX_DAILY_GAS_EUR", 10.0),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AlertSettings {
    pub webhook_url: Option<String>,
    pub confidence_threshold: f64,
    pub cooldown_s: f64,
}

impl AlertSettings {
    fn from_env() -> Self {
        Self {
            webhook_url: std::env::var("ALERT_WEBHOOK_URL").ok().filter(|s| !s.is_empty()),
            confidence_threshold: env_f64("ALERT_CONFIDENCE_THRESHOLD", 0.70),
            cooldown_s: env_f64("ALERT_COOLDOWN_S", 30.0),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PoolSettings {
    pub enabled: bool,
    pub size: usize,
    pub ping_interval_s: u64,
    pub max_age_s: u64,
}

impl PoolSettings {
    fn from_env() -> Self {
        Self {
            enabled: env_bool("POOL_ENABLED", true),
            size: env_u32("POOL_SIZE", 2) as usize,
            ping_interval_s: env_u32("POOL_PING_INTERVAL_S", 15) as u64,
            max_age_s: env_u32("POOL_MAX_AGE_S", 300) as u64,
        }
    }
}

/// Configuration loaded from environment variables (.env supported).
#[derive(Clone, Debug)]
pub struct Config {
    pub mode: Mode,
    pub asset: String,

    // Spot feeds
    pub binance_ws: String,
    pub coinbase_ws: String,
    pub kraken_ws: String,

    // Prediction market
    pub clob_api_url: String,
    pub gamma_api_url: String,
    pub market_window_secs: i64,
    pub fee_refresh_s: f64,
    pub fast_poll_ms: i64,
    pub slow_poll_ms: i64,
    pub fast_poll_duration_s: f64,

    // Engine cadence
    pub signal_loop_ms: i64,
    pub health_interval_s: u64,
    pub feed_stale_ms: i64,
    pub startup_grace_s: u64,

    pub log_dir: String,

    pub signals: SignalThresholds,
    pub oracle: OracleSettings,
    pub weights: ConfidenceWeights,
    pub execution: ExecutionSettings,
    pub risk: RiskSettings,
    pub alerts: AlertSettings,
    pub pool: PoolSettings,
}

impl Config {
    pub fn from_env() -> Self {
        let asset = env_str("ASSET", "btc").to_lowercase();

        // Venue streams are derived from the asset unless overridden
        let binance_ws = std::env::var("BINANCE_WS").unwrap_or_else(|_| {
            format!("wss://stream.binance.com:9443/ws/{}usdt@trade", asset)
        });
        let coinbase_ws = env_str("COINBASE_WS", "wss://ws-feed.exchange.coinbase.com");
        let kraken_ws = env_str("KRAKEN_WS", "wss://ws.kraken.com");

        Self {
            mode: Mode::from_str(&env_str("MODE", "shadow")),
            asset,
            binance_ws,
            coinbase_ws,
            kraken_ws,
            clob_api_url: env_str("CLOB_API_URL", "https://clob.polymarket.com"),
            gamma_api_url: env_str("GAMMA_API_URL", "https://gamma-api.polymarket.com"),
            market_window_secs: env_i64("MARKET_WINDOW_SECS", 900),
            fee_refresh_s: env_f64("FEE_REFRESH_S", 60.0),
            fast_poll_ms: env_i64("FAST_POLL_MS", 200),
            slow_poll_ms: env_i64("SLOW_POLL_MS", 1000),
            fast_poll_duration_s: env_f64("FAST_POLL_DURATION_S", 15.0),
            signal_loop_ms: env_i64("SIGNAL_LOOP_MS", 250),
            health_interval_s: env_u32("HEALTH_INTERVAL_S", 5) as u64,
            feed_stale_ms: env_i64("FEED_STALE_MS", 60_000),
            startup_grace_s: env_u32("STARTUP_GRACE_S", 30) as u64,
            log_dir: env_str("LOG_DIR", "logs"),
            signals: SignalThresholds::from_env(),
            oracle: OracleSettings::from_env(),
            weights: ConfidenceWeights::from_env(),
            execution: ExecutionSettings::from_env(),
            risk: RiskSettings::from_env(),
            alerts: AlertSettings::from_env(),
            pool: PoolSettings::from_env(),
        }
    }

    /// Uppercase asset label for display: "BTC", "ETH", "SOL".
    pub fn asset_label(&self) -> String {
        self.asset.to_uppercase()
    }

    /// Venue-native product symbol for subscriptions.
    pub fn venue_symbol(&self, venue: Venue) -> String {
        match venue {
            Venue::Binance => format!("{}USDT", self.asset_label()),
            Venue::Coinbase => format!("{}-USD", self.asset_label()),
            Venue::Kraken => match self.asset.as_str() {
                "btc" => "XBT/USD".to_string(),
                other => format!("{}/USD", other.to_uppercase()),
            },
        }
    }

    pub fn venue_ws_url(&self, venue: Venue) -> &str {
        match venue {
            Venue::Binance => &self.binance_ws,
            Venue::Coinbase => &self.coinbase_ws,
            Venue::Kraken => &self.kraken_ws,
        }
    }

    /// Slug prefix for market discovery: "{asset}-updown-{interval}-".
    pub fn slug_prefix(&self) -> String {
        format!("{}-updown-{}-", self.asset, self.interval_label())
    }

    pub fn interval_label(&self) -> &'static str {
        match self.market_window_secs {
            300 => "5m",
            900 => "15m",
            3600 => "1h",
            14400 => "4h",
            _ => "15m",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scenario: mode strings as they appear in env files.
    /// Expected: "alert"/"automated" map to their modes, anything else to shadow.
    #[test]
    fn test_mode_parsing() {
        assert_eq!(Mode::from_str("alert"), Mode::Alert);
        assert_eq!(Mode::from_str("AUTOMATED"), Mode::Automated);
        assert_eq!(Mode::from_str("auto"), Mode::Automated);
        assert_eq!(Mode::from_str("shadow"), Mode::Shadow);
        assert_eq!(Mode::from_str("garbage"), Mode::Shadow);
    }

    /// Scenario: default config for BTC.
    /// Expected: Venue symbols follow each venue's native convention,
    /// including Kraken's XBT alias for bitcoin.
    #[test]
    fn test_venue_symbols() {
        let config = Config::from_env();
        assert_eq!(config.venue_symbol(Venue::Binance), "BTCUSDT");
        assert_eq!(config.venue_symbol(Venue::Coinbase), "BTC-USD");
        assert_eq!(config.venue_symbol(Venue::Kraken), "XBT/USD");
    }

    /// Scenario: default 15-minute market window.
    /// Expected: Slug prefix encodes asset and interval label.
    #[test]
    fn test_slug_prefix() {
        let config = Config::from_env();
        assert_eq!(config.interval_label(), "15m");
        assert_eq!(config.slug_prefix(), "btc-updown-15m-");
    }

    /// Scenario: legacy confidence weights with no env overrides.
    /// Expected: They deserialise (fields exist) and stay at zero.
    #[test]
    fn test_legacy_weights_zero() {
        let w = ConfidenceWeights::from_env();
        assert_eq!(w.oracle_age, 0.0);
        assert_eq!(w.misalignment, 0.0);
        assert_eq!(w.spread_anomaly, 0.0);
        // active weights sum to 1.05 (maker advantage rides on top of the 1.0 core)
        let active = w.divergence
            + w.pm_staleness
            + w.consensus_strength
            + w.liquidity
            + w.volume_surge
            + w.spike_concentration
            + w.maker_advantage;
        assert!((active - 1.05).abs() < 1e-9);
    }
}
