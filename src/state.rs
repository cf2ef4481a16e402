use chrono::Utc;

/// Runtime configuration. Every risk limit and cooldown duration is a named
/// field here; the engines never hard-code policy numbers.
#[derive(Debug, Clone)]
pub struct Config {
    pub sqlite_path: String,
    pub starting_cash: f64,

    // Policy gate limits
    pub min_confidence: f64,
    pub max_trades_per_day: u32,
    pub max_daily_loss_pct: f64,
    pub max_drawdown_pct: f64,
    pub max_exposure_pct: f64,
    pub max_spread_pct: f64,

    // Cooldowns, longest to shortest by outcome severity
    pub cooldown_stop_loss_secs: u64,
    pub cooldown_loss_secs: u64,
    pub cooldown_win_secs: u64,
    pub global_cooldown_secs: u64,

    // Paper fill model
    pub slippage_bps: f64,
    pub fee_bps: f64,

    // Equity curve persistence bucket
    pub snapshot_secs: u64,

    // Event bus
    pub bus_maxlen: u64,
    pub block_timeout_ms: u64,
    pub batch_size: usize,

    // Orchestrator dispatch loop idle wait (keeps shutdown observable)
    pub dispatch_idle_ms: u64,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or_else(|_| "./tickflow.sqlite".to_string()),
            starting_cash: std::env::var("STARTING_CASH").ok().and_then(|v| v.parse().ok()).unwrap_or(10_000.0),
            min_confidence: std::env::var("MIN_CONFIDENCE").ok().and_then(|v| v.parse().ok()).unwrap_or(0.55),
            max_trades_per_day: std::env::var("MAX_TRADES_DAY").ok().and_then(|v| v.parse().ok()).unwrap_or(20),
            max_daily_loss_pct: std::env::var("MAX_DAILY_LOSS_PCT").ok().and_then(|v| v.parse().ok()).unwrap_or(0.02),
            max_drawdown_pct: std::env::var("MAX_DRAWDOWN_PCT").ok().and_then(|v| v.parse().ok()).unwrap_or(0.05),
            max_exposure_pct: std::env::var("MAX_EXPOSURE_PCT").ok().and_then(|v| v.parse().ok()).unwrap_or(0.25),
            max_spread_pct: std::env::var("MAX_SPREAD_PCT").ok().and_then(|v| v.parse().ok()).unwrap_or(0.005),
            cooldown_stop_loss_secs: std::env::var("COOLDOWN_STOP_LOSS_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(1800),
            cooldown_loss_secs: std::env::var("COOLDOWN_LOSS_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(900),
            cooldown_win_secs: std::env::var("COOLDOWN_WIN_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(120),
            global_cooldown_secs: std::env::var("GLOBAL_COOLDOWN_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(30),
            slippage_bps: std::env::var("SLIPPAGE_BPS").ok().and_then(|v| v.parse().ok()).unwrap_or(5.0),
            fee_bps: std::env::var("FEE_BPS").ok().and_then(|v| v.parse().ok()).unwrap_or(10.0),
            snapshot_secs: std::env::var("SNAPSHOT_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(60),
            bus_maxlen: std::env::var("BUS_MAXLEN").ok().and_then(|v| v.parse().ok()).unwrap_or(10_000),
            block_timeout_ms: std::env::var("BLOCK_TIMEOUT_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(1000),
            batch_size: std::env::var("BATCH_SIZE").ok().and_then(|v| v.parse().ok()).unwrap_or(32),
            dispatch_idle_ms: std::env::var("DISPATCH_IDLE_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(250),
        }
    }

    /// In-memory store, zero-friction fill model. Base config for tests.
    pub fn for_tests() -> Self {
        let mut cfg = Self::from_env();
        cfg.sqlite_path = ":memory:".to_string();
        cfg.starting_cash = 10_000.0;
        cfg.min_confidence = 0.55;
        cfg.max_trades_per_day = 20;
        cfg.max_daily_loss_pct = 0.02;
        cfg.max_drawdown_pct = 0.05;
        cfg.max_exposure_pct = 0.25;
        cfg.max_spread_pct = 0.005;
        cfg.cooldown_stop_loss_secs = 1800;
        cfg.cooldown_loss_secs = 900;
        cfg.cooldown_win_secs = 120;
        cfg.global_cooldown_secs = 30;
        cfg.slippage_bps = 0.0;
        cfg.fee_bps = 0.0;
        cfg.snapshot_secs = 60;
        cfg.dispatch_idle_ms = 20;
        cfg
    }
}

pub fn now_ts() -> u64 {
    Utc::now().timestamp() as u64
}

pub fn now_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}
