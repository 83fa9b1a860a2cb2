use crate::config::StrategySettings;
use crate::execution::{CandleWindow, OrderExecutor, Portfolio, Sizing, TargetOrder, TradingBackend};
use crate::models::{Candle, Order, Pair};
use crate::report::Report;
use crate::strategy::cycle::{StrategyCycle, StrategyState};
use crate::strategy::market::{AccountCheck, Market, Reconciled, Signals};
use crate::Result;
use rust_decimal::Decimal;

/// What happened on one tick
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Hold,
    Opened,
    Closed,
    /// Forced back to INITIAL without an order
    Reset,
    /// Entry signal, but the working balance is under the min notional
    InsufficientFunds,
    /// Portfolio value is at or below the configured minimum
    PortfolioTooSmall,
    /// A backend call failed; the tick was a no-op
    Failed(String),
}

/// Result of feeding one tick to the machine
#[derive(Debug, Clone)]
pub struct TickOutcome {
    pub order: Option<Order>,
    pub candle_updated: bool,
    pub initial: bool,
    pub decision: Decision,
}

impl TickOutcome {
    /// A report goes out when an order was placed, the window moved, or on the first tick
    pub fn is_reportable(&self) -> bool {
        self.order.is_some() || self.candle_updated || self.initial
    }
}

/// Per-pair strategy: owns the candle window, portfolio and strategy cycle
///
/// Feed it one tick at a time with [`StrategyMachine::on_tick`]; it places at
/// most one order per tick through its executor.
pub struct StrategyMachine<B, M> {
    market: M,
    executor: OrderExecutor<B>,
    settings: StrategySettings,
    window: CandleWindow,
    portfolio: Portfolio,
    cycle: StrategyCycle,
    /// `None` until the first tick derives it from balances
    state: Option<StrategyState>,
    price: Decimal,
    previous_price: Decimal,
    event_time: i64,
}

impl<B: TradingBackend, M: Market> StrategyMachine<B, M> {
    pub fn new(market: M, executor: OrderExecutor<B>, settings: StrategySettings) -> Result<Self> {
        let cycle = StrategyCycle::new(settings.steps.clone())?;
        let window = CandleWindow::new(
            settings.sma_period,
            settings.period_interval.clone(),
            settings.extrema,
        )
        .with_period_ms(settings.period_ms()?);
        let portfolio = Portfolio::new(market.mode(), executor.pair().clone());

        Ok(Self {
            market,
            executor,
            settings,
            window,
            portfolio,
            cycle,
            state: None,
            price: Decimal::ZERO,
            previous_price: Decimal::ZERO,
            event_time: 0,
        })
    }

    /// Load filters and balances, check the account and fill the candle window
    ///
    /// Any failure here is fatal for this pair.
    pub async fn initialize(&mut self) -> Result<()> {
        let filters = self.executor.load_filters().await?;
        self.portfolio.balances = self.executor.balances().await?;

        let pair = self.pair().clone();
        let mode = self.market.mode();
        match self.market.check_account(&self.portfolio, &filters) {
            AccountCheck::Empty => {
                tracing::warn!("No cash on {} balance for {}. Deposit funds to trade.", mode, pair);
            }
            AccountCheck::Flat => {
                self.portfolio.set_working_balance(self.settings.working_balance);
            }
            AccountCheck::AlreadyInPosition => {
                tracing::warn!("{} {} already holds a position", mode, pair);
            }
            AccountCheck::Unusual => {
                tracing::warn!("{} {} balances look unusual, check the account", mode, pair);
                self.portfolio.set_working_balance(self.settings.working_balance);
            }
        }

        self.window.initialize(self.executor.backend(), &pair).await?;

        tracing::info!(
            "📊 {} {} ready | working balance {} {}",
            mode,
            pair,
            self.portfolio.working_balance,
            pair.bridge
        );
        Ok(())
    }

    /// Process one minute tick
    ///
    /// `tick.open` is the current price; `event_time` stamps the report.
    pub async fn on_tick(&mut self, tick: &Candle, event_time: i64) -> TickOutcome {
        let pair = self.pair().clone();
        let candle_updated = self
            .window
            .refresh_if_due(self.executor.backend(), &pair, tick.open_time)
            .await;

        self.previous_price = if self.price.is_zero() { tick.open } else { self.price };
        self.price = tick.open;
        self.event_time = event_time;
        self.portfolio.profit = Decimal::ZERO;
        self.portfolio.recompute_value(self.price);

        let initial = self.state.is_none();
        if initial {
            if let Err(e) = self.derive_initial_state().await {
                tracing::warn!("{}: could not derive initial state: {}", pair, e);
                return TickOutcome {
                    order: None,
                    candle_updated,
                    initial: false,
                    decision: Decision::Failed(e.to_string()),
                };
            }
        }

        let (order, decision) = match self.state.clone() {
            Some(StrategyState::Holding(_)) => self.evaluate_exit().await,
            _ => self.evaluate_entry().await,
        };

        TickOutcome {
            order,
            candle_updated,
            initial,
            decision,
        }
    }

    /// Close any open position, e.g. on an operator command
    pub async fn close_position(&mut self) -> Option<Order> {
        self.refresh_balances().await;
        let filters = self.executor.filters();
        if !self
            .market
            .has_open_position(&self.portfolio, &filters, self.price)
        {
            tracing::info!("{} {}: nothing to close", self.market.mode(), self.pair());
            return None;
        }

        tracing::info!("Closing open {} position on {}", self.market.mode(), self.pair());
        match self
            .market
            .close_position(&self.executor, &self.portfolio, self.price)
            .await
        {
            Ok(order) => {
                self.settle_close(order.as_ref()).await;
                order
            }
            Err(e) => {
                tracing::warn!("Failed to close {} position: {}", self.pair(), e);
                None
            }
        }
    }

    async fn derive_initial_state(&mut self) -> Result<()> {
        self.portfolio.balances = self.executor.balances().await?;
        self.portfolio.start_balance = self.portfolio.value_at(self.price);

        let reconciled = self
            .market
            .reconcile_balance(&self.executor, &self.portfolio, self.price)
            .await?;

        match reconciled {
            Reconciled::Flat => {
                self.reset().await;
            }
            Reconciled::Holding { entry_notional } => {
                self.portfolio.last_price = entry_notional;
                self.enter_next_step();
                tracing::info!(
                    "{} {} resumes open position worth {}",
                    self.market.mode(),
                    self.pair(),
                    entry_notional
                );
            }
        }
        Ok(())
    }

    async fn evaluate_entry(&mut self) -> (Option<Order>, Decision) {
        let mode = self.market.mode();
        if self.portfolio.current_value <= self.settings.min_portfolio_price {
            tracing::debug!(
                "Not enough money for {} trade: portfolio worth {}",
                mode,
                self.portfolio.current_value
            );
            return (None, Decision::PortfolioTooSmall);
        }

        if !self.market.entry_signal(&self.signals()) {
            return (None, Decision::Hold);
        }

        let filters = self.executor.filters();
        if self.portfolio.working_balance < filters.min_notional {
            tracing::warn!(
                "Not enough {} working balance: {} < min notional {}",
                mode,
                self.portfolio.working_balance,
                filters.min_notional
            );
            return (None, Decision::InsufficientFunds);
        }

        let sizing = Sizing {
            price: self.price,
            working_balance: self.portfolio.working_balance,
        };
        match self.market.open_position(&self.executor, sizing).await {
            Ok(order) => {
                self.refresh_balances().await;
                self.portfolio.last_price = order.order_price;
                self.enter_next_step();
                (Some(order), Decision::Opened)
            }
            Err(e) => {
                tracing::warn!("{} {}: failed to open position: {}", mode, self.pair(), e);
                self.refresh_balances().await;
                (None, Decision::Failed(e.to_string()))
            }
        }
    }

    async fn evaluate_exit(&mut self) -> (Option<Order>, Decision) {
        let mode = self.market.mode();
        let filters = self.executor.filters();

        if self.market.position_size(&self.portfolio) < filters.lot_size {
            tracing::info!(
                "{} {} has a strategy but no position. Resetting.",
                mode,
                self.pair()
            );
            self.reset().await;
            return (None, Decision::Reset);
        }

        if !self.market.exit_signal(&self.signals()) {
            return (None, Decision::Hold);
        }

        match self
            .market
            .close_position(&self.executor, &self.portfolio, self.price)
            .await
        {
            Ok(order) => {
                self.settle_close(order.as_ref()).await;
                (order, Decision::Closed)
            }
            Err(e) => {
                tracing::warn!("{} {}: failed to close position: {}", mode, self.pair(), e);
                self.refresh_balances().await;
                (None, Decision::Failed(e.to_string()))
            }
        }
    }

    async fn settle_close(&mut self, order: Option<&Order>) {
        self.refresh_balances().await;
        self.portfolio.profit = self
            .market
            .realized_profit(self.portfolio.last_price, order);
        self.portfolio.update_total_profit(self.price);
        tracing::info!(
            "💰 {} {} closed | profit {} | total {}",
            self.market.mode(),
            self.pair(),
            self.portfolio.profit,
            self.portfolio.total_profit
        );
        self.reset().await;
    }

    /// Move to the next strategy key and set the stop-loss and target order
    fn enter_next_step(&mut self) {
        let step = self.cycle.advance().clone();
        self.portfolio.stop_loss = self.market.stop_loss(self.price);
        self.portfolio.target_order = TargetOrder {
            price: self.price * step.target_fraction,
            amount: self.portfolio.target_free() * step.sell_fraction,
        };
        self.state = Some(StrategyState::Holding(step.key));
    }

    async fn reset(&mut self) {
        self.cycle.rewind();
        self.state = Some(StrategyState::Initial);
        self.portfolio.last_price = Decimal::ZERO;
        self.refresh_balances().await;
        self.portfolio.set_working_balance(self.settings.working_balance);
    }

    async fn refresh_balances(&mut self) {
        match self.executor.balances().await {
            Ok(balances) => {
                self.portfolio.balances = balances;
                self.portfolio.recompute_value(self.price);
            }
            Err(e) => tracing::warn!("{}: balance refresh failed: {}", self.pair(), e),
        }
    }

    fn signals(&self) -> Signals {
        Signals {
            price: self.price,
            previous_price: self.previous_price,
            moving_average: self.window.moving_average(),
            period_max: self.window.period_max(),
            period_min: self.window.period_min(),
            stop_loss: self.portfolio.stop_loss,
            borrowed: self.portfolio.target_borrowed(),
        }
    }

    /// Snapshot for report sinks
    pub fn report(&self, outcome: &TickOutcome) -> Report {
        let pair = self.pair();
        let order = outcome.order.as_ref();
        Report {
            event_time: self.event_time,
            market: self.market.mode(),
            target_asset: pair.target.clone(),
            bridge_asset: pair.bridge.clone(),
            moving_average: self.window.moving_average(),
            period_min: self.window.period_min(),
            period_max: self.window.period_max(),
            stop_loss: self.portfolio.stop_loss,
            bridge_balance: self.portfolio.bridge_free(),
            target_balance: self.portfolio.target_free(),
            target_borrowed: self.portfolio.target_borrowed(),
            strategy: self.state_label(),
            order_side: order.map(|o| o.side),
            order_quantity: order.map(|o| o.filled_qty),
            order_price: order.map(|o| o.order_price),
            fill_price: order.map(|o| o.fill_price),
            profit: (outcome.decision == Decision::Closed).then_some(self.portfolio.profit),
            total_profit: self.portfolio.total_profit,
        }
    }

    pub fn state_label(&self) -> String {
        self.state
            .as_ref()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string())
    }

    pub fn state(&self) -> Option<&StrategyState> {
        self.state.as_ref()
    }

    pub fn pair(&self) -> &Pair {
        self.executor.pair()
    }

    pub fn portfolio(&self) -> &Portfolio {
        &self.portfolio
    }

    pub fn window(&self) -> &CandleWindow {
        &self.window
    }

    pub fn executor(&self) -> &OrderExecutor<B> {
        &self.executor
    }

    pub fn market(&self) -> &M {
        &self.market
    }

    pub fn price(&self) -> Decimal {
        self.price
    }
}
