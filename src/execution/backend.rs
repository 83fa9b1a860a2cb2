use crate::models::{Balances, Candle, MarketMode, Order, Pair, Side, SymbolFilters};
use crate::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;

/// Everything the strategy needs from an exchange
///
/// Implemented by the live Binance client and by the backtest replay ledger.
/// An `Err` from any call is treated by callers as a transient "no answer".
#[async_trait]
pub trait TradingBackend: Send + Sync {
    async fn account_balances(&self, mode: MarketMode, pair: &Pair) -> Result<Balances>;

    async fn symbol_filters(&self, pair: &Pair) -> Result<SymbolFilters>;

    /// Most recent closed period candle, if one is available
    async fn last_period_candle(&self, pair: &Pair, interval: &str) -> Result<Option<Candle>>;

    /// Up to `count` closed period candles, oldest first
    async fn historical_period_candles(
        &self,
        pair: &Pair,
        count: usize,
        interval: &str,
    ) -> Result<Vec<Candle>>;

    async fn submit_order(
        &self,
        pair: &Pair,
        side: Side,
        quantity: Decimal,
        mode: MarketMode,
    ) -> Result<Order>;

    async fn cancel_order(&self, pair: &Pair, order_id: &str, mode: MarketMode) -> Result<()>;

    async fn borrow(&self, asset: &str, quantity: Decimal) -> Result<()>;

    async fn repay(&self, asset: &str, quantity: Decimal) -> Result<()>;
}
