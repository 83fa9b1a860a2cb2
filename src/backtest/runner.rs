use crate::backtest::metrics::{BacktestSummary, TradeRecord};
use crate::backtest::replay::{FeedState, Ledger, ReplayBackend};
use crate::config::{BacktestSettings, StrategySettings};
use crate::execution::{OrderExecutor, RetryPolicy};
use crate::models::{Candle, MarketMode, Order, Pair, Side};
use crate::report::{MemorySink, ReportSink};
use crate::strategy::{self, Decision, Market, StrategyMachine};
use crate::Result;
use chrono::DateTime;
use rust_decimal::Decimal;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// One line of the backtest report CSV
#[derive(Debug, Clone, Serialize)]
pub struct ReplayRow {
    pub date: String,
    pub symbol: String,
    pub minute_price: Decimal,
    pub period_max_price: Decimal,
    pub period_min_price: Decimal,
    pub moving_average: Decimal,
    pub target_price: Decimal,
    pub target_amount: Decimal,
    pub stop_loss: Decimal,
    pub strategy: String,
    pub side: Option<Side>,
    pub quantity: Option<Decimal>,
    pub order_price: Option<Decimal>,
    pub fill_price: Option<Decimal>,
    pub bridge_coin: Decimal,
    pub target_coin: Decimal,
    pub target_borrowed: Decimal,
    pub portfolio_balance: Decimal,
}

/// Open leg waiting for its close
struct OpenLeg {
    time: i64,
    side: Side,
    price: Decimal,
    quantity: Decimal,
    notional: Decimal,
}

/// Replays recorded candles through a strategy machine
pub struct BacktestRunner {
    pair: Pair,
    mode: MarketMode,
    strategy: StrategySettings,
    backtest: BacktestSettings,
    policy: RetryPolicy,
    report_path: Option<PathBuf>,
}

impl BacktestRunner {
    /// Create a runner; retries are immediate since the ledger never fails transiently
    pub fn new(
        mode: MarketMode,
        pair: Pair,
        strategy: StrategySettings,
        backtest: BacktestSettings,
    ) -> Self {
        Self {
            pair,
            mode,
            strategy,
            backtest,
            policy: RetryPolicy::default().immediate(),
            report_path: None,
        }
    }

    /// Also write one CSV row per tick to `path`
    pub fn with_report_csv(mut self, path: impl Into<PathBuf>) -> Self {
        self.report_path = Some(path.into());
        self
    }

    /// Run the replay until the minute feed is exhausted
    ///
    /// # Arguments
    /// * `minutes` - Minute candles; the first `sma_period` periods are warm-up
    /// * `periods` - Period candles from the start of the same span
    /// * `sink` - Receives every reportable tick
    pub async fn run(
        &self,
        minutes: Vec<Candle>,
        periods: Vec<Candle>,
        sink: &mut dyn ReportSink,
    ) -> Result<BacktestSummary> {
        let backend = ReplayBackend::from_settings(
            self.pair.clone(),
            &self.backtest,
            &self.strategy,
            minutes,
            periods,
        )?;
        let executor =
            OrderExecutor::new(backend.clone(), self.pair.clone(), self.mode, self.policy);

        match self.mode {
            MarketMode::Spot => {
                let machine = strategy::spot_machine(executor, &self.strategy)?;
                self.drive(machine, backend, sink).await
            }
            MarketMode::Margin => {
                let machine = strategy::margin_machine(executor, &self.strategy)?;
                self.drive(machine, backend, sink).await
            }
        }
    }

    async fn drive<M: Market>(
        &self,
        mut machine: StrategyMachine<ReplayBackend, M>,
        backend: ReplayBackend,
        sink: &mut dyn ReportSink,
    ) -> Result<BacktestSummary> {
        machine.initialize().await?;

        let mut writer = match &self.report_path {
            Some(path) => Some(open_report(path)?),
            None => None,
        };

        tracing::info!(
            "Starting {} backtest on {}: {} minute candles",
            self.mode,
            self.pair,
            backend.remaining_ticks()
        );

        let mut equity = Vec::new();
        let mut trades = Vec::new();
        let mut open_leg: Option<OpenLeg> = None;
        let mut initial_value = None;

        while let FeedState::Tick(candle) = backend.next_tick() {
            initial_value.get_or_insert_with(|| backend.ledger().value());
            let outcome = machine.on_tick(&candle, candle.open_time).await;

            match (&outcome.decision, &outcome.order) {
                (Decision::Opened, Some(order)) => {
                    open_leg = Some(OpenLeg {
                        time: candle.open_time,
                        side: order.side,
                        price: order.fill_price,
                        quantity: order.filled_qty,
                        notional: order.order_price,
                    });
                }
                (Decision::Closed, order) => {
                    if let Some(leg) = open_leg.take() {
                        trades.push(TradeRecord {
                            entry_time: leg.time,
                            exit_time: candle.open_time,
                            side: leg.side,
                            entry_price: leg.price,
                            exit_price: order.as_ref().map(|o| o.fill_price).unwrap_or(candle.open),
                            quantity: leg.quantity,
                            entry_notional: leg.notional,
                            profit: machine.portfolio().profit,
                        });
                    }
                }
                (Decision::Reset, _) => open_leg = None,
                _ => {}
            }

            let ledger = backend.ledger();
            equity.push(ledger.value());

            if let Some(writer) = writer.as_mut() {
                writer.serialize(self.row(&machine, &candle, &outcome.order, ledger))?;
            }

            if outcome.is_reportable() {
                if let Err(e) = sink.emit(&machine.report(&outcome)).await {
                    tracing::warn!("Failed to emit report: {}", e);
                }
            }
        }

        if let Some(mut writer) = writer {
            writer.flush()?;
        }

        tracing::info!(
            "Feed exhausted after {} ticks, {} fills",
            equity.len(),
            backend.fills().len()
        );

        let summary = BacktestSummary::from_run(
            self.pair.symbol(),
            self.mode,
            initial_value.unwrap_or(self.backtest.bridge_balance),
            &equity,
            trades,
            open_leg.is_some(),
        );

        tracing::info!(
            "Backtest complete: {} trades, P&L: {:.2} ({:.2}%)",
            summary.total_trades,
            summary.total_profit,
            summary.return_pct
        );

        Ok(summary)
    }

    fn row<M: Market>(
        &self,
        machine: &StrategyMachine<ReplayBackend, M>,
        candle: &Candle,
        order: &Option<Order>,
        ledger: Ledger,
    ) -> ReplayRow {
        let window = machine.window();
        let portfolio = machine.portfolio();
        ReplayRow {
            date: format_time(candle.open_time),
            symbol: self.pair.symbol(),
            minute_price: candle.open,
            period_max_price: window.period_max(),
            period_min_price: window.period_min(),
            moving_average: window.moving_average(),
            target_price: portfolio.target_order.price,
            target_amount: portfolio.target_order.amount,
            stop_loss: portfolio.stop_loss,
            strategy: machine.state_label(),
            side: order.as_ref().map(|o| o.side),
            quantity: order.as_ref().map(|o| o.filled_qty),
            order_price: order.as_ref().map(|o| o.order_price),
            fill_price: order.as_ref().map(|o| o.fill_price),
            bridge_coin: ledger.bridge,
            target_coin: ledger.target,
            target_borrowed: ledger.borrowed,
            portfolio_balance: ledger.value(),
        }
    }

    /// Run backtest and print report
    pub async fn run_and_report(
        &self,
        minutes: Vec<Candle>,
        periods: Vec<Candle>,
        scenario_name: &str,
    ) -> Result<BacktestSummary> {
        println!("\n🔬 Running backtest: {}", scenario_name);
        println!("   Market: {}", self.mode);
        println!("   Pair: {}", self.pair);
        println!("   Minute candles: {}", minutes.len());
        println!("   Period candles: {}", periods.len());
        println!(
            "   Initial balance: {} {}",
            self.backtest.bridge_balance, self.pair.bridge
        );

        let mut sink = MemorySink::default();
        let summary = self.run(minutes, periods, &mut sink).await?;
        println!("   Reports emitted: {}", sink.reports.len());
        summary.print_report();

        Ok(summary)
    }
}

fn open_report(path: &Path) -> Result<csv::Writer<std::fs::File>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(csv::Writer::from_path(path)?)
}

fn format_time(millis: i64) -> String {
    DateTime::from_timestamp_millis(millis)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}
