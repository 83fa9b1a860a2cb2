use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// A bridge/target asset pair, e.g. USDT/BTC traded as `BTCUSDT`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pair {
    pub bridge: String,
    pub target: String,
}

impl Pair {
    pub fn new(bridge: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            bridge: bridge.into().to_uppercase(),
            target: target.into().to_uppercase(),
        }
    }

    /// Exchange symbol: target followed by bridge
    pub fn symbol(&self) -> String {
        format!("{}{}", self.target, self.bridge)
    }
}

impl fmt::Display for Pair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketMode {
    Spot,
    Margin,
}

impl MarketMode {
    /// Portfolio value in bridge units
    ///
    /// Margin accounts owe the borrowed target back, so it counts against the value
    pub fn portfolio_value(&self, balances: &Balances, pair: &Pair, price: Decimal) -> Decimal {
        let bridge = balances.free(&pair.bridge);
        let target = balances.free(&pair.target);
        match self {
            MarketMode::Spot => target * price + bridge,
            MarketMode::Margin => bridge + target * price - balances.borrowed(&pair.target) * price,
        }
    }
}

impl fmt::Display for MarketMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketMode::Spot => write!(f, "SPOT"),
            MarketMode::Margin => write!(f, "MARGIN"),
        }
    }
}

/// OHLC candle; used both for period candles and minute ticks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Open time in unix milliseconds
    pub open_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// One kline message from the live stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KlineEvent {
    pub symbol: String,
    pub event_time: i64,
    pub is_closed: bool,
    pub candle: Candle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Filled,
    Partial,
    Canceled,
    /// Accepted but nothing executed yet, or no order at all
    NoOrder,
}

impl OrderStatus {
    /// Map an exchange status string
    pub fn from_exchange(status: &str) -> Self {
        match status {
            "FILLED" => OrderStatus::Filled,
            "PARTIALLY_FILLED" => OrderStatus::Partial,
            "CANCELED" | "EXPIRED" | "REJECTED" | "PENDING_CANCEL" => OrderStatus::Canceled,
            _ => OrderStatus::NoOrder,
        }
    }
}

/// Result of a submitted order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub side: Side,
    pub requested_qty: Decimal,
    pub filled_qty: Decimal,
    pub fill_price: Decimal,
    pub status: OrderStatus,
    /// Quote notional: filled quantity times fill price
    pub order_price: Decimal,
}

impl Order {
    pub fn is_complete(&self) -> bool {
        self.status == OrderStatus::Filled && self.filled_qty == self.requested_qty
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetBalance {
    pub free: Decimal,
    pub borrowed: Decimal,
}

/// Balances keyed by asset; missing assets read as zero
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Balances(pub HashMap<String, AssetBalance>);

impl Balances {
    pub fn free(&self, asset: &str) -> Decimal {
        self.0.get(asset).map(|b| b.free).unwrap_or(Decimal::ZERO)
    }

    pub fn borrowed(&self, asset: &str) -> Decimal {
        self.0.get(asset).map(|b| b.borrowed).unwrap_or(Decimal::ZERO)
    }

    pub fn set(&mut self, asset: &str, free: Decimal, borrowed: Decimal) {
        self.0.insert(asset.to_string(), AssetBalance { free, borrowed });
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|b| b.free.is_zero() && b.borrowed.is_zero())
    }
}

/// Exchange trading rules for a symbol
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SymbolFilters {
    pub lot_size: Decimal,
    pub min_notional: Decimal,
}

impl SymbolFilters {
    /// Floor a quantity to a whole multiple of the lot size
    pub fn round_quantity(&self, quantity: Decimal) -> Decimal {
        if self.lot_size <= Decimal::ZERO {
            return quantity;
        }
        ((quantity / self.lot_size).floor() * self.lot_size).normalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_pair_symbol() {
        let pair = Pair::new("usdt", "btc");
        assert_eq!(pair.symbol(), "BTCUSDT");
        assert_eq!(pair.to_string(), "BTCUSDT");
    }

    #[test]
    fn test_round_quantity_floors_to_lot() {
        let filters = SymbolFilters {
            lot_size: dec!(0.0001),
            min_notional: dec!(10),
        };
        assert_eq!(filters.round_quantity(dec!(0.00057)), dec!(0.0005));
        assert_eq!(filters.round_quantity(dec!(0.00009)), dec!(0));
    }

    #[test]
    fn test_round_quantity_is_idempotent() {
        let filters = SymbolFilters {
            lot_size: dec!(0.001),
            min_notional: dec!(10),
        };
        for q in [dec!(1.23456), dec!(0.0019), dec!(42), dec!(0.001)] {
            let once = filters.round_quantity(q);
            assert_eq!(filters.round_quantity(once), once);
        }
        // Already aligned quantities are untouched
        assert_eq!(filters.round_quantity(dec!(0.005)), dec!(0.005));
    }

    #[test]
    fn test_margin_value_subtracts_borrowed() {
        let pair = Pair::new("USDT", "BTC");
        let mut balances = Balances::default();
        balances.set("USDT", dec!(100), dec!(0));
        balances.set("BTC", dec!(0), dec!(0.001));

        let spot = MarketMode::Spot.portfolio_value(&balances, &pair, dec!(20000));
        let margin = MarketMode::Margin.portfolio_value(&balances, &pair, dec!(20000));
        assert_eq!(spot, dec!(100));
        assert_eq!(margin, dec!(80));
    }

    #[test]
    fn test_order_status_mapping() {
        assert_eq!(OrderStatus::from_exchange("FILLED"), OrderStatus::Filled);
        assert_eq!(OrderStatus::from_exchange("PARTIALLY_FILLED"), OrderStatus::Partial);
        assert_eq!(OrderStatus::from_exchange("EXPIRED"), OrderStatus::Canceled);
        assert_eq!(OrderStatus::from_exchange("NEW"), OrderStatus::NoOrder);
    }
}
