use crate::models::{MarketMode, Side};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// One completed open/close cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub entry_time: i64,
    pub exit_time: i64,
    /// Side of the opening order
    pub side: Side,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub quantity: Decimal,
    /// Quote notional of the opening order
    pub entry_notional: Decimal,
    pub profit: Decimal,
}

impl TradeRecord {
    pub fn holding_minutes(&self) -> i64 {
        (self.exit_time - self.entry_time) / 60_000
    }

    /// Profit relative to the entry notional, in percent
    pub fn return_pct(&self) -> Decimal {
        if self.entry_notional.is_zero() {
            return Decimal::ZERO;
        }
        self.profit / self.entry_notional * dec!(100)
    }
}

/// Outcome of one replay run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestSummary {
    pub symbol: String,
    pub market: MarketMode,
    pub ticks: usize,

    pub initial_value: Decimal,
    pub final_value: Decimal,
    pub total_profit: Decimal,
    pub return_pct: Decimal,

    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: Decimal,
    pub largest_win: Decimal,
    pub largest_loss: Decimal,

    pub max_drawdown: Decimal,
    pub max_drawdown_pct: Decimal,

    /// Position still open when the feed ran out
    pub open_at_end: bool,
    pub trades: Vec<TradeRecord>,
}

impl BacktestSummary {
    /// Build the summary from closed trades and the per-tick portfolio values
    pub fn from_run(
        symbol: String,
        market: MarketMode,
        initial_value: Decimal,
        equity: &[Decimal],
        trades: Vec<TradeRecord>,
        open_at_end: bool,
    ) -> Self {
        let final_value = equity.last().copied().unwrap_or(initial_value);
        let total_profit = final_value - initial_value;
        let return_pct = if initial_value.is_zero() {
            Decimal::ZERO
        } else {
            total_profit / initial_value * dec!(100)
        };

        let winning_trades = trades.iter().filter(|t| t.profit > Decimal::ZERO).count();
        let losing_trades = trades.len() - winning_trades;
        let win_rate = if trades.is_empty() {
            Decimal::ZERO
        } else {
            Decimal::from(winning_trades) / Decimal::from(trades.len()) * dec!(100)
        };

        let largest_win = trades
            .iter()
            .map(|t| t.profit)
            .filter(|p| *p > Decimal::ZERO)
            .max()
            .unwrap_or_default();
        let largest_loss = trades
            .iter()
            .map(|t| t.profit)
            .filter(|p| *p <= Decimal::ZERO)
            .min()
            .unwrap_or_default();

        let (max_drawdown, max_drawdown_pct) = Self::calculate_drawdown(initial_value, equity);

        Self {
            symbol,
            market,
            ticks: equity.len(),
            initial_value,
            final_value,
            total_profit,
            return_pct,
            total_trades: trades.len(),
            winning_trades,
            losing_trades,
            win_rate,
            largest_win,
            largest_loss,
            max_drawdown,
            max_drawdown_pct,
            open_at_end,
            trades,
        }
    }

    /// Largest peak-to-trough fall of the equity curve
    fn calculate_drawdown(initial_value: Decimal, equity: &[Decimal]) -> (Decimal, Decimal) {
        let mut peak = initial_value;
        let mut max_dd = Decimal::ZERO;
        let mut max_dd_pct = Decimal::ZERO;

        for value in equity {
            if *value > peak {
                peak = *value;
            }
            let drawdown = peak - *value;
            if drawdown > max_dd {
                max_dd = drawdown;
                if peak > Decimal::ZERO {
                    max_dd_pct = drawdown / peak * dec!(100);
                }
            }
        }

        (max_dd, max_dd_pct)
    }

    pub fn realized_profit(&self) -> Decimal {
        self.trades.iter().map(|t| t.profit).sum()
    }

    pub fn avg_holding_minutes(&self) -> i64 {
        if self.trades.is_empty() {
            return 0;
        }
        self.trades.iter().map(|t| t.holding_minutes()).sum::<i64>() / self.trades.len() as i64
    }

    /// Print a formatted report to stdout
    pub fn print_report(&self) {
        println!("\n╔═══════════════════════════════════════════════════════╗");
        println!("║              BACKTEST PERFORMANCE REPORT              ║");
        println!("╚═══════════════════════════════════════════════════════╝\n");

        println!("   {} | {} | {} ticks", self.market, self.symbol, self.ticks);

        println!("\n📊 P&L SUMMARY");
        println!("  Initial Portfolio:     {:.2}", self.initial_value);
        println!("  Final Portfolio:       {:.2}", self.final_value);
        println!(
            "  Total P&L:             {:.2} ({:+.2}%)",
            self.total_profit, self.return_pct
        );
        println!("  Realized P&L:          {:.2}", self.realized_profit());

        println!("\n📈 TRADE STATISTICS");
        println!("  Total Trades:          {}", self.total_trades);
        println!(
            "  Winning Trades:        {} ({:.1}%)",
            self.winning_trades, self.win_rate
        );
        println!("  Losing Trades:         {}", self.losing_trades);

        if self.total_trades > 0 {
            println!("\n💰 WIN/LOSS ANALYSIS");
            println!("  Largest Win:           {:.2}", self.largest_win);
            println!("  Largest Loss:          {:.2}", self.largest_loss);
            println!(
                "  Avg Holding:           {} minutes",
                self.avg_holding_minutes()
            );
        }

        println!("\n⚠️  RISK METRICS");
        println!(
            "  Max Drawdown:          {:.2} ({:.2}%)",
            self.max_drawdown, self.max_drawdown_pct
        );
        if self.open_at_end {
            println!("  Position still open at end of data");
        }

        println!("\n═══════════════════════════════════════════════════════\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_trade(profit: Decimal, holding_minutes: i64) -> TradeRecord {
        TradeRecord {
            entry_time: 0,
            exit_time: holding_minutes * 60_000,
            side: Side::Buy,
            entry_price: dec!(20000),
            exit_price: dec!(20000) + profit * dec!(2000),
            quantity: dec!(0.0005),
            entry_notional: dec!(10),
            profit,
        }
    }

    #[test]
    fn test_summary_with_winning_trades() {
        let trades = vec![
            create_test_trade(dec!(1), 60),
            create_test_trade(dec!(0.5), 120),
            create_test_trade(dec!(-0.3), 90),
        ];
        let equity = vec![dec!(51), dec!(51.5), dec!(51.2)];

        let summary =
            BacktestSummary::from_run("BTCUSDT".into(), MarketMode::Spot, dec!(50), &equity, trades, false);

        assert_eq!(summary.total_trades, 3);
        assert_eq!(summary.winning_trades, 2);
        assert_eq!(summary.losing_trades, 1);
        assert_eq!(summary.realized_profit(), dec!(1.2));
        assert_eq!(summary.total_profit, dec!(1.2));
        assert_eq!(summary.largest_win, dec!(1));
        assert_eq!(summary.largest_loss, dec!(-0.3));
        assert_eq!(summary.avg_holding_minutes(), 90);
        assert!((summary.win_rate - dec!(66.67)).abs() < dec!(0.01));
    }

    #[test]
    fn test_summary_with_no_trades() {
        let summary =
            BacktestSummary::from_run("BTCUSDT".into(), MarketMode::Spot, dec!(50), &[], vec![], false);

        assert_eq!(summary.total_trades, 0);
        assert_eq!(summary.win_rate, dec!(0));
        assert_eq!(summary.final_value, dec!(50));
        assert_eq!(summary.return_pct, dec!(0));
    }

    #[test]
    fn test_drawdown_calculation() {
        let equity = vec![dec!(55), dec!(44), dec!(50)];
        let summary =
            BacktestSummary::from_run("BTCUSDT".into(), MarketMode::Margin, dec!(50), &equity, vec![], false);

        assert_eq!(summary.max_drawdown, dec!(11));
        assert_eq!(summary.max_drawdown_pct, dec!(20));
    }

    #[test]
    fn test_trade_return_pct() {
        let trade = create_test_trade(dec!(0.5), 10);
        assert_eq!(trade.return_pct(), dec!(5));
        assert_eq!(trade.holding_minutes(), 10);
    }
}
