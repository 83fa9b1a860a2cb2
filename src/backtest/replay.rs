use crate::config::{BacktestSettings, StrategySettings};
use crate::error::BotError;
use crate::execution::TradingBackend;
use crate::models::{Balances, Candle, MarketMode, Order, OrderStatus, Pair, Side, SymbolFilters};
use crate::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Forward-only cursor over recorded candles
#[derive(Debug, Clone, Default)]
pub struct CandleCursor {
    candles: Vec<Candle>,
    position: usize,
}

impl CandleCursor {
    pub fn new(candles: Vec<Candle>) -> Self {
        Self {
            candles,
            position: 0,
        }
    }

    pub fn next_candle(&mut self) -> Option<Candle> {
        let candle = self.candles.get(self.position).cloned();
        if candle.is_some() {
            self.position += 1;
        }
        candle
    }

    pub fn remaining(&self) -> usize {
        self.candles.len() - self.position
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }
}

/// Next step of the minute feed
#[derive(Debug, Clone, PartialEq)]
pub enum FeedState {
    Tick(Candle),
    Exhausted,
}

/// Simulated account balances
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Ledger {
    pub bridge: Decimal,
    pub target: Decimal,
    pub borrowed: Decimal,
    pub price: Decimal,
}

impl Ledger {
    /// Value in bridge units, loan netted out
    pub fn value(&self) -> Decimal {
        self.bridge + self.target * self.price - self.borrowed * self.price
    }
}

#[derive(Debug)]
struct ReplayState {
    pair: Pair,
    filters: SymbolFilters,
    ledger: Ledger,
    minutes: CandleCursor,
    periods: CandleCursor,
    warmup: usize,
    warmed_up: bool,
    fills: Vec<Order>,
}

/// Backtest backend: fills every order at the open of the latest minute candle
///
/// Cloning hands out another handle to the same ledger and feeds, so the
/// runner can advance the feed while the strategy trades through its executor.
#[derive(Debug, Clone)]
pub struct ReplayBackend {
    state: Arc<Mutex<ReplayState>>,
}

impl ReplayBackend {
    /// # Arguments
    /// * `minutes` - Minute candles, oldest first
    /// * `periods` - Period candles covering the same span, oldest first
    /// * `warmup` - Minute candles skipped before the first tick
    pub fn new(
        pair: Pair,
        filters: SymbolFilters,
        ledger: Ledger,
        minutes: Vec<Candle>,
        periods: Vec<Candle>,
        warmup: usize,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(ReplayState {
                pair,
                filters,
                ledger,
                minutes: CandleCursor::new(minutes),
                periods: CandleCursor::new(periods),
                warmup,
                warmed_up: false,
                fills: Vec::new(),
            })),
        }
    }

    /// Build from backtest settings; the warm-up covers the first `sma_period` periods
    pub fn from_settings(
        pair: Pair,
        settings: &BacktestSettings,
        strategy: &StrategySettings,
        minutes: Vec<Candle>,
        periods: Vec<Candle>,
    ) -> Result<Self> {
        let filters = SymbolFilters {
            lot_size: settings.lot_size,
            min_notional: settings.min_notional,
        };
        let ledger = Ledger {
            bridge: settings.bridge_balance,
            target: settings.target_balance,
            borrowed: Decimal::ZERO,
            price: Decimal::ZERO,
        };
        let warmup = strategy.warmup_minutes()?;
        Ok(Self::new(pair, filters, ledger, minutes, periods, warmup))
    }

    fn lock(&self) -> MutexGuard<'_, ReplayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Advance the minute feed
    ///
    /// Skips the warm-up window on the first call. The tick's open becomes the fill price.
    pub fn next_tick(&self) -> FeedState {
        let mut state = self.lock();

        if !state.warmed_up {
            for _ in 0..state.warmup {
                if state.minutes.next_candle().is_none() {
                    return FeedState::Exhausted;
                }
            }
            state.warmed_up = true;
        }

        match state.minutes.next_candle() {
            Some(candle) => {
                state.ledger.price = candle.open;
                FeedState::Tick(candle)
            }
            None => FeedState::Exhausted,
        }
    }

    pub fn ledger(&self) -> Ledger {
        self.lock().ledger
    }

    /// Every order filled so far
    pub fn fills(&self) -> Vec<Order> {
        self.lock().fills.clone()
    }

    pub fn remaining_ticks(&self) -> usize {
        self.lock().minutes.remaining()
    }
}

#[async_trait]
impl TradingBackend for ReplayBackend {
    async fn account_balances(&self, mode: MarketMode, pair: &Pair) -> Result<Balances> {
        let state = self.lock();
        let borrowed = match mode {
            MarketMode::Spot => Decimal::ZERO,
            MarketMode::Margin => state.ledger.borrowed,
        };
        let mut balances = Balances::default();
        balances.set(&pair.bridge, state.ledger.bridge, Decimal::ZERO);
        balances.set(&pair.target, state.ledger.target, borrowed);
        Ok(balances)
    }

    async fn symbol_filters(&self, _pair: &Pair) -> Result<SymbolFilters> {
        Ok(self.lock().filters)
    }

    async fn last_period_candle(&self, _pair: &Pair, _interval: &str) -> Result<Option<Candle>> {
        Ok(self.lock().periods.next_candle())
    }

    async fn historical_period_candles(
        &self,
        _pair: &Pair,
        count: usize,
        _interval: &str,
    ) -> Result<Vec<Candle>> {
        let mut state = self.lock();
        Ok(std::iter::from_fn(|| state.periods.next_candle())
            .take(count)
            .collect())
    }

    async fn submit_order(
        &self,
        pair: &Pair,
        side: Side,
        quantity: Decimal,
        _mode: MarketMode,
    ) -> Result<Order> {
        let mut state = self.lock();
        let quantity = state.filters.round_quantity(quantity);
        if quantity <= Decimal::ZERO {
            return Err(BotError::Backend(format!(
                "{} quantity below lot size {}",
                pair, state.filters.lot_size
            )));
        }

        let price = state.ledger.price;
        let notional = quantity * price;
        let ledger = &mut state.ledger;
        match side {
            Side::Buy => {
                if notional > ledger.bridge {
                    return Err(BotError::Backend(format!(
                        "insufficient {}: need {}, have {}",
                        pair.bridge, notional, ledger.bridge
                    )));
                }
                ledger.bridge -= notional;
                ledger.target += quantity;
            }
            Side::Sell => {
                if quantity > ledger.target {
                    return Err(BotError::Backend(format!(
                        "insufficient {}: need {}, have {}",
                        pair.target, quantity, ledger.target
                    )));
                }
                ledger.bridge += notional;
                ledger.target -= quantity;
            }
        }

        let order = Order {
            id: format!("replay-{}", state.fills.len() + 1),
            side,
            requested_qty: quantity,
            filled_qty: quantity,
            fill_price: price,
            status: OrderStatus::Filled,
            order_price: notional,
        };
        state.fills.push(order.clone());
        Ok(order)
    }

    async fn cancel_order(&self, _pair: &Pair, _order_id: &str, _mode: MarketMode) -> Result<()> {
        Ok(())
    }

    async fn borrow(&self, _asset: &str, quantity: Decimal) -> Result<()> {
        let mut state = self.lock();
        let quantity = state.filters.round_quantity(quantity);
        state.ledger.target += quantity;
        state.ledger.borrowed += quantity;
        Ok(())
    }

    async fn repay(&self, asset: &str, quantity: Decimal) -> Result<()> {
        let mut state = self.lock();
        let ledger = &mut state.ledger;
        let quantity = quantity.min(ledger.borrowed);
        if quantity > ledger.target {
            return Err(BotError::Backend(format!(
                "cannot repay {} {}: only {} free",
                quantity, asset, ledger.target
            )));
        }
        ledger.target -= quantity;
        ledger.borrowed -= quantity;
        Ok(())
    }
}
