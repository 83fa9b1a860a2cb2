use crate::config::EntryRule;
use crate::error::BotError;
use crate::execution::{OrderExecutor, Portfolio, Sizing, TradingBackend};
use crate::models::{Balances, MarketMode, Order, Pair, SymbolFilters};
use crate::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;

/// Prices the entry and exit rules look at on a tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Signals {
    pub price: Decimal,
    pub previous_price: Decimal,
    pub moving_average: Decimal,
    pub period_max: Decimal,
    pub period_min: Decimal,
    pub stop_loss: Decimal,
    /// Target units still owed on margin
    pub borrowed: Decimal,
}

/// What the balances say about the account before the first tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountCheck {
    Empty,
    Flat,
    AlreadyInPosition,
    Unusual,
}

/// Position found in the balances on the first tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reconciled {
    Flat,
    /// Open position worth `entry_notional` in bridge units
    Holding { entry_notional: Decimal },
}

/// Spot or margin specific behaviour plugged into the strategy machine
#[async_trait]
pub trait Market: Send + Sync {
    fn mode(&self) -> MarketMode;

    fn compute_value(&self, balances: &Balances, pair: &Pair, price: Decimal) -> Decimal {
        self.mode().portfolio_value(balances, pair, price)
    }

    /// Size of the open position, compared against the lot size
    fn position_size(&self, portfolio: &Portfolio) -> Decimal;

    fn has_open_position(&self, portfolio: &Portfolio, filters: &SymbolFilters, price: Decimal) -> bool;

    fn check_account(&self, portfolio: &Portfolio, filters: &SymbolFilters) -> AccountCheck;

    fn entry_signal(&self, signals: &Signals) -> bool;

    fn exit_signal(&self, signals: &Signals) -> bool;

    fn stop_loss(&self, entry_price: Decimal) -> Decimal;

    /// Profit of a closed position opened for `entry_notional`
    fn realized_profit(&self, entry_notional: Decimal, exit: Option<&Order>) -> Decimal;

    async fn open_position<B: TradingBackend>(
        &self,
        executor: &OrderExecutor<B>,
        sizing: Sizing,
    ) -> Result<Order>;

    async fn close_position<B: TradingBackend>(
        &self,
        executor: &OrderExecutor<B>,
        portfolio: &Portfolio,
        price: Decimal,
    ) -> Result<Option<Order>>;

    /// Work out the starting position from balances, repairing leftovers
    async fn reconcile_balance<B: TradingBackend>(
        &self,
        executor: &OrderExecutor<B>,
        portfolio: &Portfolio,
        price: Decimal,
    ) -> Result<Reconciled>;
}

/// Long-only spot trading
#[derive(Debug, Clone, Copy)]
pub struct SpotMarket {
    pub entry_rule: EntryRule,
    pub stop_loss_factor: Decimal,
}

#[async_trait]
impl Market for SpotMarket {
    fn mode(&self) -> MarketMode {
        MarketMode::Spot
    }

    fn position_size(&self, portfolio: &Portfolio) -> Decimal {
        portfolio.target_free()
    }

    fn has_open_position(&self, portfolio: &Portfolio, filters: &SymbolFilters, _price: Decimal) -> bool {
        portfolio.target_free() > filters.lot_size
    }

    fn check_account(&self, portfolio: &Portfolio, filters: &SymbolFilters) -> AccountCheck {
        let target = portfolio.target_free();
        if portfolio.bridge_free().is_zero() && target.is_zero() {
            AccountCheck::Empty
        } else if target < filters.lot_size {
            AccountCheck::Flat
        } else if target > filters.lot_size {
            AccountCheck::AlreadyInPosition
        } else {
            AccountCheck::Unusual
        }
    }

    fn entry_signal(&self, s: &Signals) -> bool {
        match self.entry_rule {
            EntryRule::Breakout => s.price > s.period_max,
            EntryRule::Channel => {
                s.period_max > s.previous_price
                    && s.previous_price > s.moving_average
                    && s.period_max > s.price
                    && s.price > s.previous_price
            }
        }
    }

    fn exit_signal(&self, s: &Signals) -> bool {
        s.price >= s.period_max || s.price <= s.stop_loss
    }

    fn stop_loss(&self, entry_price: Decimal) -> Decimal {
        entry_price * self.stop_loss_factor
    }

    fn realized_profit(&self, entry_notional: Decimal, exit: Option<&Order>) -> Decimal {
        exit.map(|order| order.order_price - entry_notional)
            .unwrap_or(Decimal::ZERO)
    }

    async fn open_position<B: TradingBackend>(
        &self,
        executor: &OrderExecutor<B>,
        sizing: Sizing,
    ) -> Result<Order> {
        executor.buy(None, sizing).await
    }

    async fn close_position<B: TradingBackend>(
        &self,
        executor: &OrderExecutor<B>,
        _portfolio: &Portfolio,
        _price: Decimal,
    ) -> Result<Option<Order>> {
        executor.sell_all().await.map(Some)
    }

    async fn reconcile_balance<B: TradingBackend>(
        &self,
        executor: &OrderExecutor<B>,
        portfolio: &Portfolio,
        price: Decimal,
    ) -> Result<Reconciled> {
        let target = portfolio.target_free();
        if target < executor.filters().lot_size {
            return Ok(Reconciled::Flat);
        }
        Ok(Reconciled::Holding {
            entry_notional: target * price,
        })
    }
}

/// Short selling on margin: borrow the target, sell it, buy it back later
#[derive(Debug, Clone, Copy)]
pub struct MarginMarket {
    pub stop_loss_factor: Decimal,
}

#[async_trait]
impl Market for MarginMarket {
    fn mode(&self) -> MarketMode {
        MarketMode::Margin
    }

    fn position_size(&self, portfolio: &Portfolio) -> Decimal {
        portfolio.target_borrowed()
    }

    fn has_open_position(&self, portfolio: &Portfolio, filters: &SymbolFilters, price: Decimal) -> bool {
        portfolio.target_borrowed() * price >= filters.min_notional
    }

    fn check_account(&self, portfolio: &Portfolio, filters: &SymbolFilters) -> AccountCheck {
        let borrowed = portfolio.target_borrowed();
        if portfolio.bridge_free().is_zero() && borrowed.is_zero() {
            AccountCheck::Empty
        } else if portfolio.target_free() < filters.lot_size && borrowed < filters.min_notional {
            AccountCheck::Flat
        } else if borrowed >= filters.min_notional {
            AccountCheck::AlreadyInPosition
        } else {
            AccountCheck::Unusual
        }
    }

    /// Breakout, but never while an earlier loan is still open
    fn entry_signal(&self, s: &Signals) -> bool {
        if s.price <= s.period_max {
            return false;
        }
        if !s.borrowed.is_zero() {
            tracing::warn!("Breakout at {} ignored: {} still borrowed", s.price, s.borrowed);
            return false;
        }
        true
    }

    fn exit_signal(&self, s: &Signals) -> bool {
        s.price >= s.stop_loss || s.price <= s.moving_average
    }

    fn stop_loss(&self, entry_price: Decimal) -> Decimal {
        entry_price * self.stop_loss_factor
    }

    fn realized_profit(&self, entry_notional: Decimal, exit: Option<&Order>) -> Decimal {
        exit.map(|order| entry_notional - order.order_price)
            .unwrap_or(Decimal::ZERO)
    }

    async fn open_position<B: TradingBackend>(
        &self,
        executor: &OrderExecutor<B>,
        sizing: Sizing,
    ) -> Result<Order> {
        let filters = executor.filters();
        let target = executor.pair().target.clone();

        executor.borrow(sizing.quantity()).await?;

        let order = match self.sell_borrowed(executor).await {
            Ok(order) => order,
            Err(e) => {
                // Return whatever is left of the loan
                tracing::warn!("Short on {} failed after borrowing: {}", executor.pair(), e);
                if let Err(repay) = executor.repay_outstanding(sizing.price).await {
                    tracing::warn!("Could not repay {} after failed short: {}", target, repay);
                }
                return Err(e);
            }
        };

        // Sell whatever is left if it is still worth trading
        let leftover = executor.balances().await?.free(&target);
        if leftover * sizing.price > filters.min_notional {
            if let Err(e) = executor.sell_all().await {
                tracing::warn!("Leftover {} {} could not be sold: {}", leftover, target, e);
            }
        }

        Ok(order)
    }

    async fn close_position<B: TradingBackend>(
        &self,
        executor: &OrderExecutor<B>,
        portfolio: &Portfolio,
        price: Decimal,
    ) -> Result<Option<Order>> {
        let lot_size = executor.filters().lot_size;

        // Only buy back when the loan is not already covered by free balance
        let order = if portfolio.target_free() < lot_size {
            let sizing = Sizing {
                price,
                working_balance: portfolio.working_balance,
            };
            Some(executor.buy(Some(portfolio.target_borrowed()), sizing).await?)
        } else {
            None
        };

        executor.repay_outstanding(price).await?;
        Ok(order)
    }

    async fn reconcile_balance<B: TradingBackend>(
        &self,
        executor: &OrderExecutor<B>,
        portfolio: &Portfolio,
        price: Decimal,
    ) -> Result<Reconciled> {
        let filters = executor.filters();
        let free = portfolio.target_free();
        let borrowed = portfolio.target_borrowed();
        let borrowed_notional = borrowed * price;

        if free < filters.lot_size && borrowed.is_zero() {
            Ok(Reconciled::Flat)
        } else if free < filters.lot_size && borrowed_notional > filters.min_notional {
            Ok(Reconciled::Holding {
                entry_notional: borrowed_notional,
            })
        } else if free > Decimal::ZERO && borrowed > Decimal::ZERO {
            tracing::info!(
                "Found {} free and {} borrowed {}; repaying before trading",
                free,
                borrowed,
                portfolio.pair().target
            );
            executor.repay_outstanding(price).await?;
            Ok(Reconciled::Flat)
        } else {
            Ok(Reconciled::Flat)
        }
    }
}

impl MarginMarket {
    async fn sell_borrowed<B: TradingBackend>(&self, executor: &OrderExecutor<B>) -> Result<Order> {
        let lot_size = executor.filters().lot_size;
        let free = executor.balances().await?.free(&executor.pair().target);
        if free <= lot_size {
            return Err(BotError::BelowLotSize {
                quantity: free,
                lot_size,
            });
        }
        executor.sell_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::executor::tests::{Scripted, ScriptedBackend};
    use crate::execution::RetryPolicy;
    use rust_decimal_macros::dec;

    fn signals(price: Decimal, previous_price: Decimal) -> Signals {
        Signals {
            price,
            previous_price,
            moving_average: dec!(100),
            period_max: dec!(110),
            period_min: dec!(90),
            stop_loss: dec!(98),
            borrowed: Decimal::ZERO,
        }
    }

    fn spot(entry_rule: EntryRule) -> SpotMarket {
        SpotMarket {
            entry_rule,
            stop_loss_factor: dec!(0.98),
        }
    }

    #[test]
    fn test_spot_breakout_entry() {
        let market = spot(EntryRule::Breakout);
        assert!(market.entry_signal(&signals(dec!(111), dec!(105))));
        assert!(!market.entry_signal(&signals(dec!(110), dec!(105))));
    }

    #[test]
    fn test_spot_channel_entry_needs_rising_price_inside_channel() {
        let market = spot(EntryRule::Channel);
        assert!(market.entry_signal(&signals(dec!(106), dec!(105))));
        // Falling price
        assert!(!market.entry_signal(&signals(dec!(104), dec!(105))));
        // Previous price below the moving average
        assert!(!market.entry_signal(&signals(dec!(101), dec!(99))));
        // Already above the period max
        assert!(!market.entry_signal(&signals(dec!(112), dec!(105))));
    }

    #[test]
    fn test_spot_exit_on_max_or_stop_loss() {
        let market = spot(EntryRule::Breakout);
        assert!(market.exit_signal(&signals(dec!(110), dec!(105))));
        assert!(market.exit_signal(&signals(dec!(98), dec!(105))));
        assert!(!market.exit_signal(&signals(dec!(105), dec!(104))));
    }

    #[test]
    fn test_margin_exit_on_stop_loss_or_moving_average() {
        let market = MarginMarket {
            stop_loss_factor: dec!(1.02),
        };
        let mut s = signals(dec!(105), dec!(104));
        s.stop_loss = dec!(112);
        assert!(!market.exit_signal(&s));

        s.price = dec!(112);
        assert!(market.exit_signal(&s));

        s.price = dec!(100);
        assert!(market.exit_signal(&s));
    }

    #[test]
    fn test_margin_entry_waits_for_loan_repaid() {
        let market = MarginMarket {
            stop_loss_factor: dec!(1.02),
        };
        let mut s = signals(dec!(111), dec!(105));
        assert!(market.entry_signal(&s));

        s.borrowed = dec!(0.00005);
        assert!(!market.entry_signal(&s));

        s.borrowed = Decimal::ZERO;
        s.price = dec!(110);
        assert!(!market.entry_signal(&s));
    }

    #[tokio::test]
    async fn test_failed_short_repays_the_loan() {
        let backend = ScriptedBackend::new(dec!(50), dec!(0), dec!(0)).with_script(&[Scripted::Fail; 20]);
        let mut executor = OrderExecutor::new(
            backend,
            Pair::new("USDT", "BTC"),
            MarketMode::Margin,
            RetryPolicy::default().immediate(),
        );
        executor.load_filters().await.unwrap();
        let market = MarginMarket {
            stop_loss_factor: dec!(1.02),
        };
        let sizing = Sizing {
            price: dec!(20000),
            working_balance: dec!(10),
        };

        let result = market.open_position(&executor, sizing).await;

        assert!(matches!(result, Err(BotError::RetriesExhausted { .. })));
        assert_eq!(executor.backend().borrowed("BTC"), Decimal::ZERO);
        assert_eq!(executor.backend().free("BTC"), Decimal::ZERO);
        assert_eq!(executor.backend().free("USDT"), dec!(50));
    }

    #[test]
    fn test_stop_loss_sides() {
        assert_eq!(spot(EntryRule::Breakout).stop_loss(dec!(100)), dec!(98));
        let margin = MarginMarket {
            stop_loss_factor: dec!(1.02),
        };
        assert_eq!(margin.stop_loss(dec!(100)), dec!(102));
    }
}
