use crate::config::MINUTE_MS;
use crate::models::Candle;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use std::fmt;
use std::str::FromStr;

/// 2024-01-01T00:00:00Z, hour aligned
const DEFAULT_START_MS: i64 = 1_704_067_200_000;

/// Price path shapes the generator can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketScenario {
    /// Steady uptrend with noise (+2% daily average)
    Uptrend,
    /// Steady downtrend with noise (-2% daily average)
    Downtrend,
    /// Mean-reverting chop around the base price
    Sideways,
    /// Large swings in both directions
    Volatile,
    /// Flat range, a sharp move above it, then a slide back through the range
    Breakout,
}

impl MarketScenario {
    pub const ALL: [MarketScenario; 5] = [
        MarketScenario::Uptrend,
        MarketScenario::Downtrend,
        MarketScenario::Sideways,
        MarketScenario::Volatile,
        MarketScenario::Breakout,
    ];
}

impl FromStr for MarketScenario {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "uptrend" => Ok(MarketScenario::Uptrend),
            "downtrend" => Ok(MarketScenario::Downtrend),
            "sideways" => Ok(MarketScenario::Sideways),
            "volatile" => Ok(MarketScenario::Volatile),
            "breakout" => Ok(MarketScenario::Breakout),
            other => Err(format!("unknown scenario: {}", other)),
        }
    }
}

impl fmt::Display for MarketScenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MarketScenario::Uptrend => "uptrend",
            MarketScenario::Downtrend => "downtrend",
            MarketScenario::Sideways => "sideways",
            MarketScenario::Volatile => "volatile",
            MarketScenario::Breakout => "breakout",
        };
        write!(f, "{}", name)
    }
}

/// Generates synthetic minute candles for backtesting
pub struct SyntheticDataGenerator {
    rng: StdRng,
    base_price: f64,
    base_volume: f64,
    start_ms: i64,
}

impl SyntheticDataGenerator {
    /// Same seed, same series
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            base_price: 20_000.0,
            base_volume: 5.0,
            start_ms: DEFAULT_START_MS,
        }
    }

    /// Generate one minute candle per step
    ///
    /// Open times start at the generator's start and advance by one minute.
    /// Each candle opens at the previous close.
    pub fn generate(&mut self, scenario: MarketScenario, num_minutes: usize) -> Vec<Candle> {
        let mut candles = Vec::with_capacity(num_minutes);
        let mut price = self.base_price;

        for i in 0..num_minutes {
            let open = price;
            price = self.step(scenario, price, i, num_minutes).max(self.base_price * 0.1);
            let open_time = self.start_ms + i as i64 * MINUTE_MS;
            candles.push(self.create_candle(open, price, open_time));
        }

        candles
    }

    fn step(&mut self, scenario: MarketScenario, price: f64, i: usize, total: usize) -> f64 {
        // +2% per day spread over minutes
        let daily_drift = 0.02 / (24.0 * 60.0);

        match scenario {
            MarketScenario::Uptrend => {
                price + price * daily_drift + price * self.rng.gen_range(-0.0002..0.0002)
            }
            MarketScenario::Downtrend => {
                price - price * daily_drift + price * self.rng.gen_range(-0.0002..0.0002)
            }
            MarketScenario::Sideways => {
                let reversion = (self.base_price - price) * 0.05;
                price + reversion + price * self.rng.gen_range(-0.002..0.002)
            }
            MarketScenario::Volatile => price + price * self.rng.gen_range(-0.01..0.01),
            MarketScenario::Breakout => {
                let noise = price * self.rng.gen_range(-0.0003..0.0003);
                let phase = i as f64 / total.max(1) as f64;
                if phase < 0.5 {
                    // Hold the range
                    price + (self.base_price - price) * 0.1 + noise
                } else if phase < 0.65 {
                    price * 1.0008 + noise
                } else {
                    price * 0.9993 + noise
                }
            }
        }
    }

    /// Build OHLC around an open/close pair
    fn create_candle(&mut self, open: f64, close: f64, open_time: i64) -> Candle {
        // ±0.05% intrabar movement
        let noise_pct = 0.0005;
        let high = open.max(close) * (1.0 + self.rng.gen_range(0.0..noise_pct));
        let low = open.min(close) * (1.0 - self.rng.gen_range(0.0..noise_pct));
        let volume = self.base_volume * self.rng.gen_range(0.7..1.3);

        Candle {
            open_time,
            open: to_decimal(open, 2),
            high: to_decimal(high, 2),
            low: to_decimal(low, 2),
            close: to_decimal(close, 2),
            volume: to_decimal(volume, 4),
        }
    }
}

fn to_decimal(value: f64, dp: u32) -> Decimal {
    Decimal::from_f64_retain(value)
        .unwrap_or_default()
        .round_dp(dp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::sources::aggregate_candles;
    use crate::config::PERIOD_MS;

    #[test]
    fn test_trends_drift_in_their_direction() {
        let up = SyntheticDataGenerator::new(42).generate(MarketScenario::Uptrend, 3000);
        let down = SyntheticDataGenerator::new(42).generate(MarketScenario::Downtrend, 3000);
        assert_eq!(up.len(), 3000);

        let (up_start, up_end) = (up[0].close, up[2999].close);
        let (down_start, down_end) = (down[0].close, down[2999].close);
        assert!(up_end > up_start, "uptrend went {} -> {}", up_start, up_end);
        assert!(down_end < down_start, "downtrend went {} -> {}", down_start, down_end);
    }

    #[test]
    fn test_breakout_peaks_above_its_range() {
        let mut gen = SyntheticDataGenerator::new(7);
        let candles = gen.generate(MarketScenario::Breakout, 2000);

        let range_max = candles[..1000].iter().map(|c| c.high).max().unwrap();
        let peak = candles[1000..1300].iter().map(|c| c.close).max().unwrap();
        let last = candles.last().unwrap().close;

        assert!(peak > range_max, "peak {} should clear range {}", peak, range_max);
        assert!(last < peak);
    }

    #[test]
    fn test_same_seed_same_series() {
        let a = SyntheticDataGenerator::new(9).generate(MarketScenario::Volatile, 200);
        let b = SyntheticDataGenerator::new(9).generate(MarketScenario::Volatile, 200);
        assert_eq!(a, b);
    }

    #[test]
    fn test_minutes_are_contiguous_and_aggregate_to_hours() {
        let mut gen = SyntheticDataGenerator::new(42);
        let candles = gen.generate(MarketScenario::Sideways, 180);

        for pair in candles.windows(2) {
            assert_eq!(pair[1].open_time - pair[0].open_time, MINUTE_MS);
        }
        assert_eq!(aggregate_candles(&candles, PERIOD_MS).len(), 3);
    }

    #[test]
    fn test_candles_contain_open_and_close() {
        let candles = SyntheticDataGenerator::new(42).generate(MarketScenario::Volatile, 500);

        for c in &candles {
            assert!(c.low <= c.open.min(c.close), "low above body at {}", c.open_time);
            assert!(c.high >= c.open.max(c.close), "high below body at {}", c.open_time);
        }
    }

    #[test]
    fn test_scenario_names_parse() {
        assert_eq!("Breakout".parse::<MarketScenario>(), Ok(MarketScenario::Breakout));
        assert!("moon".parse::<MarketScenario>().is_err());
    }
}
