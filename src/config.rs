use crate::error::BotError;
use crate::models::{MarketMode, Pair};
use crate::Result;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Length of the default `1h` period candle in milliseconds
pub const PERIOD_MS: i64 = 3_600_000;
/// Length of one minute tick in milliseconds
pub const MINUTE_MS: i64 = 60_000;

/// Length in milliseconds of a Binance kline interval such as "4h"
///
/// `None` for anything the exchange does not serve with a fixed length.
pub fn interval_ms(interval: &str) -> Option<i64> {
    let minutes = match interval {
        "1m" => 1,
        "3m" => 3,
        "5m" => 5,
        "15m" => 15,
        "30m" => 30,
        "1h" => 60,
        "2h" => 2 * 60,
        "4h" => 4 * 60,
        "6h" => 6 * 60,
        "8h" => 8 * 60,
        "12h" => 12 * 60,
        "1d" => 24 * 60,
        "3d" => 3 * 24 * 60,
        "1w" => 7 * 24 * 60,
        _ => return None,
    };
    Some(minutes * MINUTE_MS)
}

/// Top-level settings
///
/// Layered as `config/default.toml`, then `config/{BOT_ENV}.toml`, then
/// `BOT__*` environment variables (e.g. `BOT__STRATEGY__SMA_PERIOD=24`).
/// Every field has a default so an empty environment is a valid backtest setup.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub binance: BinanceSettings,
    pub redis_url: String,
    /// Flush the bot's redis keys on startup
    pub clear_db: bool,
    pub market: MarketSelection,
    pub spot_pair: PairSettings,
    pub margin_pair: PairSettings,
    pub strategy: StrategySettings,
    pub execution: ExecutionSettings,
    pub control: ControlSettings,
    pub backtest: BacktestSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            binance: BinanceSettings::default(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            clear_db: false,
            market: MarketSelection::Spot,
            spot_pair: PairSettings::default(),
            margin_pair: PairSettings::default(),
            strategy: StrategySettings::default(),
            execution: ExecutionSettings::default(),
            control: ControlSettings::default(),
            backtest: BacktestSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from files and the environment, then validate them
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let env = std::env::var("BOT_ENV").unwrap_or_else(|_| "development".to_string());
        let settings: Settings = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{}", env)).required(false))
            .add_source(
                config::Environment::with_prefix("BOT")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.strategy.steps.is_empty() {
            return Err(BotError::Config("strategy.steps must not be empty".into()));
        }
        if self.strategy.sma_period == 0 {
            return Err(BotError::Config("strategy.sma_period must be positive".into()));
        }
        self.strategy.period_ms()?;
        if self.strategy.spot_stop_loss <= Decimal::ZERO
            || self.strategy.margin_stop_loss <= Decimal::ZERO
        {
            return Err(BotError::Config("stop-loss factors must be positive".into()));
        }
        if self.execution.sell_all_max_rounds == 0 {
            return Err(BotError::Config(
                "execution.sell_all_max_rounds must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Pairs traded for the configured market selection
    pub fn markets(&self) -> Vec<(MarketMode, Pair)> {
        self.market
            .modes()
            .into_iter()
            .map(|mode| (mode, self.pair_for(mode)))
            .collect()
    }

    pub fn pair_for(&self, mode: MarketMode) -> Pair {
        let pair = match mode {
            MarketMode::Spot => &self.spot_pair,
            MarketMode::Margin => &self.margin_pair,
        };
        Pair::new(&pair.bridge, &pair.target)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BinanceSettings {
    pub api_key: String,
    pub secret_key: String,
    pub rest_base_url: String,
    pub ws_base_url: String,
    pub requests_per_second: u32,
}

impl Default for BinanceSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            secret_key: String::new(),
            rest_base_url: "https://api.binance.com".to_string(),
            ws_base_url: "wss://stream.binance.com:9443".to_string(),
            requests_per_second: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MarketSelection {
    Spot,
    Margin,
    SpotMargin,
}

impl MarketSelection {
    pub fn modes(&self) -> Vec<MarketMode> {
        match self {
            MarketSelection::Spot => vec![MarketMode::Spot],
            MarketSelection::Margin => vec![MarketMode::Margin],
            MarketSelection::SpotMargin => vec![MarketMode::Spot, MarketMode::Margin],
        }
    }
}

impl std::fmt::Display for MarketSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MarketSelection::Spot => write!(f, "SPOT"),
            MarketSelection::Margin => write!(f, "MARGIN"),
            MarketSelection::SpotMargin => write!(f, "SPOT-MARGIN"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PairSettings {
    pub bridge: String,
    pub target: String,
}

impl Default for PairSettings {
    fn default() -> Self {
        Self {
            bridge: "USDT".to_string(),
            target: "BTC".to_string(),
        }
    }
}

/// How the spot entry signal is evaluated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryRule {
    /// Price breaks out above the period max
    Breakout,
    /// Price rising inside the channel between the moving average and the period max
    Channel,
}

/// Which candle fields feed the period max/min
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtremaSource {
    Close,
    HighLow,
}

/// One strategy key with its (target price fraction, sell fraction) parameters
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StrategyStep {
    pub key: String,
    pub target_fraction: Decimal,
    pub sell_fraction: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StrategySettings {
    pub sma_period: usize,
    pub period_interval: String,
    /// Spot stop-loss as a fraction of the entry price (below 1)
    pub spot_stop_loss: Decimal,
    /// Margin stop-loss as a fraction of the entry price (above 1)
    pub margin_stop_loss: Decimal,
    pub min_portfolio_price: Decimal,
    /// Fraction of the free bridge balance used per cycle
    pub working_balance: Decimal,
    pub entry_rule: EntryRule,
    pub extrema: ExtremaSource,
    pub steps: Vec<StrategyStep>,
}

impl StrategySettings {
    /// Length of one period candle, from `period_interval`
    pub fn period_ms(&self) -> Result<i64> {
        interval_ms(&self.period_interval).ok_or_else(|| {
            BotError::Config(format!(
                "strategy.period_interval {:?} is not a supported kline interval",
                self.period_interval
            ))
        })
    }

    /// Minute ticks covered by the first `sma_period` period candles
    pub fn warmup_minutes(&self) -> Result<usize> {
        Ok(self.sma_period * (self.period_ms()? / MINUTE_MS) as usize)
    }
}

impl Default for StrategySettings {
    fn default() -> Self {
        Self {
            sma_period: 24,
            period_interval: "1h".to_string(),
            spot_stop_loss: dec!(0.98),
            margin_stop_loss: dec!(1.02),
            min_portfolio_price: dec!(10),
            working_balance: dec!(0.2),
            entry_rule: EntryRule::Breakout,
            extrema: ExtremaSource::Close,
            steps: vec![StrategyStep {
                key: "FIRST_STEP".to_string(),
                target_fraction: Decimal::ZERO,
                sell_fraction: Decimal::ZERO,
            }],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub cancel_delay_ms: u64,
    pub repay_delay_ms: u64,
    pub sell_all_max_rounds: u32,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            max_retries: 10,
            retry_delay_ms: 1_000,
            cancel_delay_ms: 2_000,
            repay_delay_ms: 10_000,
            sell_all_max_rounds: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlSettings {
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    pub max_reconnect_attempts: u32,
    pub idle_timeout_secs: u64,
    pub insufficient_funds_cooldown_secs: u64,
    pub command_poll_ms: u64,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            backoff_base_secs: 60,
            backoff_max_secs: 900, // 15 minutes
            max_reconnect_attempts: 15,
            idle_timeout_secs: 100,
            insufficient_funds_cooldown_secs: 600,
            command_poll_ms: 1_000,
        }
    }
}

impl ControlSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BacktestSettings {
    pub bridge_balance: Decimal,
    pub target_balance: Decimal,
    pub lot_size: Decimal,
    pub min_notional: Decimal,
    pub data_dir: PathBuf,
    pub history_months: u32,
}

impl Default for BacktestSettings {
    fn default() -> Self {
        Self {
            bridge_balance: dec!(50),
            target_balance: Decimal::ZERO,
            lot_size: dec!(0.00001),
            min_notional: dec!(10),
            data_dir: PathBuf::from("backtest_data"),
            history_months: 1,
        }
    }
}

impl BacktestSettings {
    pub fn minute_csv(&self, pair: &Pair) -> PathBuf {
        self.data_dir.join(format!(
            "{}-{}_month-minute-data.csv",
            pair.symbol(),
            self.history_months
        ))
    }

    pub fn period_csv(&self, pair: &Pair, interval: &str) -> PathBuf {
        self.data_dir.join(format!(
            "{}-{}_month-{}-data.csv",
            pair.symbol(),
            self.history_months,
            interval
        ))
    }

    pub fn report_csv(&self, pair: &Pair, mode: MarketMode) -> PathBuf {
        self.data_dir
            .join(format!("{}-{}_report.csv", pair.symbol(), mode))
    }
}
