use crate::models::{Balances, MarketMode, Pair};
use rust_decimal::Decimal;
use serde::Serialize;

/// Price target and amount for the active strategy step
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TargetOrder {
    pub price: Decimal,
    pub amount: Decimal,
}

/// Balances and derived trading figures for one pair
#[derive(Debug, Clone, Serialize)]
pub struct Portfolio {
    mode: MarketMode,
    pair: Pair,
    pub balances: Balances,
    /// Bridge amount allocated to the current cycle
    pub working_balance: Decimal,
    pub stop_loss: Decimal,
    /// Quote notional of the order that opened the position
    pub last_price: Decimal,
    /// Realized profit of the most recent close
    pub profit: Decimal,
    pub total_profit: Decimal,
    pub start_balance: Decimal,
    pub current_value: Decimal,
    pub target_order: TargetOrder,
}

impl Portfolio {
    pub fn new(mode: MarketMode, pair: Pair) -> Self {
        Self {
            mode,
            pair,
            balances: Balances::default(),
            working_balance: Decimal::ZERO,
            stop_loss: Decimal::ZERO,
            last_price: Decimal::ZERO,
            profit: Decimal::ZERO,
            total_profit: Decimal::ZERO,
            start_balance: Decimal::ZERO,
            current_value: Decimal::ZERO,
            target_order: TargetOrder::default(),
        }
    }

    /// Portfolio value at `price`; depends only on balances
    pub fn value_at(&self, price: Decimal) -> Decimal {
        self.mode.portfolio_value(&self.balances, &self.pair, price)
    }

    /// Store the value at `price` as the current value
    pub fn recompute_value(&mut self, price: Decimal) -> Decimal {
        self.current_value = self.value_at(price);
        self.current_value
    }

    /// Allocate a fraction of the free bridge balance to the next cycle
    pub fn set_working_balance(&mut self, fraction: Decimal) {
        if fraction > Decimal::ONE {
            tracing::warn!(
                "Working balance fraction {} is above 100% of the {} balance; check your config",
                fraction,
                self.pair.bridge
            );
        }
        self.working_balance = self.bridge_free() * fraction;
    }

    /// Difference between the value at `price` and the starting value
    pub fn update_total_profit(&mut self, price: Decimal) -> Decimal {
        self.total_profit = self.value_at(price) - self.start_balance;
        self.total_profit
    }

    pub fn bridge_free(&self) -> Decimal {
        self.balances.free(&self.pair.bridge)
    }

    pub fn target_free(&self) -> Decimal {
        self.balances.free(&self.pair.target)
    }

    pub fn target_borrowed(&self) -> Decimal {
        self.balances.borrowed(&self.pair.target)
    }

    pub fn mode(&self) -> MarketMode {
        self.mode
    }

    pub fn pair(&self) -> &Pair {
        &self.pair
    }
}
