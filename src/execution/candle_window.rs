use crate::config::{ExtremaSource, PERIOD_MS};
use crate::error::BotError;
use crate::execution::TradingBackend;
use crate::indicators::{calculate_sma, price_range, PriceRange};
use crate::models::{Candle, Pair};
use crate::Result;
use rust_decimal::Decimal;
use std::collections::VecDeque;

/// Rolling window of the last N period candles with derived indicators
///
/// Length stays at N once initialized: a new candle only replaces the oldest
/// one after it has been fetched successfully.
#[derive(Debug, Clone)]
pub struct CandleWindow {
    candles: VecDeque<Candle>,
    size: usize,
    interval: String,
    period_ms: i64,
    extrema: ExtremaSource,
    moving_average: Decimal,
    range: PriceRange,
}

impl CandleWindow {
    /// Create an empty window
    ///
    /// # Arguments
    /// * `size` - Number of period candles kept (the SMA period)
    /// * `interval` - Exchange interval string for period candles, e.g. "1h"
    pub fn new(size: usize, interval: impl Into<String>, extrema: ExtremaSource) -> Self {
        Self {
            candles: VecDeque::with_capacity(size),
            size,
            interval: interval.into(),
            period_ms: PERIOD_MS,
            extrema,
            moving_average: Decimal::ZERO,
            range: PriceRange::default(),
        }
    }

    /// Fill the window with the last N historical candles
    ///
    /// Fails when the backend has fewer than N candles.
    pub async fn initialize<B: TradingBackend>(&mut self, backend: &B, pair: &Pair) -> Result<()> {
        let history = backend
            .historical_period_candles(pair, self.size, &self.interval)
            .await?;

        if history.len() < self.size {
            return Err(BotError::InsufficientHistory {
                needed: self.size,
                got: history.len(),
            });
        }

        let skip = history.len() - self.size;
        self.candles = history.into_iter().skip(skip).collect();
        self.recompute();

        tracing::info!(
            "{} window ready: MA {} | min {} | max {}",
            pair,
            self.moving_average,
            self.range.min,
            self.range.max
        );

        Ok(())
    }

    /// Append the latest period candle when the tick is two periods past the newest one
    ///
    /// Returns whether the window changed. A failed or stale fetch leaves it untouched.
    pub async fn refresh_if_due<B: TradingBackend>(
        &mut self,
        backend: &B,
        pair: &Pair,
        tick_time: i64,
    ) -> bool {
        let Some(last) = self.candles.back() else {
            return false;
        };
        if tick_time - last.open_time < 2 * self.period_ms {
            return false;
        }
        let last_open = last.open_time;

        let candle = match backend.last_period_candle(pair, &self.interval).await {
            Ok(Some(candle)) => candle,
            Ok(None) => {
                tracing::debug!("{}: no new period candle available", pair);
                return false;
            }
            Err(e) => {
                tracing::warn!("{}: failed to fetch period candle: {}", pair, e);
                return false;
            }
        };

        if candle.open_time <= last_open {
            tracing::debug!("{}: period candle {} already in window", pair, candle.open_time);
            return false;
        }

        self.candles.push_back(candle);
        while self.candles.len() > self.size {
            self.candles.pop_front();
        }
        self.recompute();

        tracing::debug!(
            "{} window refreshed: MA {} | min {} | max {}",
            pair,
            self.moving_average,
            self.range.min,
            self.range.max
        );

        true
    }

    fn recompute(&mut self) {
        let closes: Vec<Decimal> = self.candles.iter().map(|c| c.close).collect();
        self.moving_average = calculate_sma(&closes, self.size).unwrap_or(Decimal::ZERO);
        self.range = price_range(&self.candles, self.extrema).unwrap_or_default();
    }

    pub fn moving_average(&self) -> Decimal {
        self.moving_average
    }

    pub fn period_max(&self) -> Decimal {
        self.range.max
    }

    pub fn period_min(&self) -> Decimal {
        self.range.min
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn candles(&self) -> impl Iterator<Item = &Candle> {
        self.candles.iter()
    }

    /// Period length matching `interval`; hourly when not set
    pub fn with_period_ms(mut self, period_ms: i64) -> Self {
        self.period_ms = period_ms;
        self
    }
}
