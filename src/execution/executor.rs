use crate::config::ExecutionSettings;
use crate::error::BotError;
use crate::execution::TradingBackend;
use crate::models::{Balances, MarketMode, Order, OrderStatus, Pair, Side, SymbolFilters};
use crate::Result;
use rust_decimal::Decimal;
use std::future::Future;
use std::time::Duration;

/// Retry counts and pauses used while talking to the backend
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub cancel_delay: Duration,
    pub repay_delay: Duration,
    pub sell_all_max_rounds: u32,
}

impl RetryPolicy {
    /// Same counts with no pauses, for replay and tests
    pub fn immediate(&self) -> Self {
        Self {
            retry_delay: Duration::ZERO,
            cancel_delay: Duration::ZERO,
            repay_delay: Duration::ZERO,
            ..*self
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from(&ExecutionSettings::default())
    }
}

impl From<&ExecutionSettings> for RetryPolicy {
    fn from(settings: &ExecutionSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            retry_delay: Duration::from_millis(settings.retry_delay_ms),
            cancel_delay: Duration::from_millis(settings.cancel_delay_ms),
            repay_delay: Duration::from_millis(settings.repay_delay_ms),
            sell_all_max_rounds: settings.sell_all_max_rounds,
        }
    }
}

/// Price and budget used to size an order when no quantity is given
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sizing {
    pub price: Decimal,
    pub working_balance: Decimal,
}

impl Sizing {
    pub fn quantity(&self) -> Decimal {
        if self.price.is_zero() {
            return Decimal::ZERO;
        }
        self.working_balance / self.price
    }
}

/// Places orders for one pair and repairs whatever the exchange gets wrong
pub struct OrderExecutor<B> {
    backend: B,
    pair: Pair,
    mode: MarketMode,
    filters: SymbolFilters,
    policy: RetryPolicy,
}

impl<B: TradingBackend> OrderExecutor<B> {
    pub fn new(backend: B, pair: Pair, mode: MarketMode, policy: RetryPolicy) -> Self {
        Self {
            backend,
            pair,
            mode,
            filters: SymbolFilters {
                lot_size: Decimal::ZERO,
                min_notional: Decimal::ZERO,
            },
            policy,
        }
    }

    /// Fetch lot size and min notional for the pair
    pub async fn load_filters(&mut self) -> Result<SymbolFilters> {
        self.filters = self.backend.symbol_filters(&self.pair).await?;
        tracing::info!(
            "{} filters: lot size {} | min notional {}",
            self.pair,
            self.filters.lot_size,
            self.filters.min_notional
        );
        Ok(self.filters)
    }

    pub async fn balances(&self) -> Result<Balances> {
        self.backend.account_balances(self.mode, &self.pair).await
    }

    /// Buy `quantity`, or the working balance worth at the current price
    pub async fn buy(&self, quantity: Option<Decimal>, sizing: Sizing) -> Result<Order> {
        let quantity = quantity.unwrap_or_else(|| sizing.quantity());
        self.place(Side::Buy, quantity).await
    }

    /// Sell `quantity`, or the working balance worth at the current price
    pub async fn sell(&self, quantity: Option<Decimal>, sizing: Sizing) -> Result<Order> {
        let quantity = quantity.unwrap_or_else(|| sizing.quantity());
        self.place(Side::Sell, quantity).await
    }

    /// Sell the whole free target balance
    ///
    /// An incomplete fill is cancelled if still open and the sale is retried
    /// against the refreshed balance, for at most `sell_all_max_rounds` rounds.
    pub async fn sell_all(&self) -> Result<Order> {
        let rounds = self.policy.sell_all_max_rounds;

        for round in 1..=rounds {
            let balances = self.balances().await?;
            let quantity = self
                .filters
                .round_quantity(balances.free(&self.pair.target));
            if quantity.is_zero() {
                return Err(BotError::BelowLotSize {
                    quantity: balances.free(&self.pair.target),
                    lot_size: self.filters.lot_size,
                });
            }

            let order = self.submit_with_retry(Side::Sell, quantity).await?;
            if order.is_complete() {
                return Ok(order);
            }

            tracing::warn!(
                "{} sell-all round {}/{}: {:?} filled {} of {}",
                self.pair,
                round,
                rounds,
                order.status,
                order.filled_qty,
                order.requested_qty
            );
            if is_open(&order) {
                self.cancel_until_acknowledged(&order).await;
            }
        }

        Err(BotError::SellAllExhausted { rounds })
    }

    /// Borrow target units on margin, returning the lot-rounded amount
    ///
    /// A failed call counts as done when the loan shows up in the balances anyway.
    pub async fn borrow(&self, quantity: Decimal) -> Result<Decimal> {
        let quantity = self.filters.round_quantity(quantity);
        if quantity.is_zero() {
            return Err(BotError::BelowLotSize {
                quantity,
                lot_size: self.filters.lot_size,
            });
        }

        let asset = self.pair.target.as_str();
        let before = self.balances().await?.borrowed(asset);
        self.with_retries("borrow", self.policy.retry_delay, move || async move {
            match self.backend.borrow(asset, quantity).await {
                Ok(()) => Ok(()),
                Err(e) => match self.balances().await {
                    Ok(balances) if balances.borrowed(asset) > before => {
                        tracing::warn!("Borrow reported {} but the loan went through", e);
                        Ok(())
                    }
                    _ => Err(e),
                },
            }
        })
        .await?;

        tracing::info!("Borrowed {} {}", quantity, asset);
        Ok(quantity)
    }

    /// Repay the margin loan from the free target balance
    ///
    /// Repays `min(free, borrowed)`. A failed repay is retried while the
    /// outstanding loan is worth more than the min notional at `price`.
    /// Whatever is still borrowed afterwards is repaid when the free balance covers it.
    pub async fn repay_outstanding(&self, price: Decimal) -> Result<()> {
        let asset = self.pair.target.as_str();
        let balances = self.balances().await?;
        let borrowed = balances.borrowed(asset);
        let quantity = balances.free(asset).min(borrowed);

        if quantity <= Decimal::ZERO || borrowed <= Decimal::ZERO {
            return Ok(());
        }

        let mut attempt = 0;
        while let Err(e) = self.backend.repay(asset, quantity).await {
            let outstanding = self.balances().await?.borrowed(asset);
            if outstanding * price <= self.filters.min_notional {
                tracing::info!(
                    "Repay failed ({}), but only {} {} is still borrowed",
                    e,
                    outstanding,
                    asset
                );
                break;
            }
            if attempt >= self.policy.max_retries {
                return Err(BotError::RepayFailed {
                    asset: asset.to_string(),
                    borrowed: outstanding,
                });
            }
            attempt += 1;
            tracing::warn!(
                "Repay of {} {} failed: {}. Retrying (attempt {}/{})",
                quantity,
                asset,
                e,
                attempt,
                self.policy.max_retries
            );
            tokio::time::sleep(self.policy.repay_delay).await;
        }

        let balances = self.balances().await?;
        let borrowed = balances.borrowed(asset);
        if borrowed > Decimal::ZERO && balances.free(asset) >= borrowed {
            if let Err(e) = self.backend.repay(asset, borrowed).await {
                tracing::warn!("Could not repay remaining {} {}: {}", borrowed, asset, e);
            }
        }

        Ok(())
    }

    /// Submit a lot-rounded order that must fill completely
    async fn place(&self, side: Side, quantity: Decimal) -> Result<Order> {
        let rounded = self.filters.round_quantity(quantity);
        if rounded <= Decimal::ZERO {
            return Err(BotError::BelowLotSize {
                quantity,
                lot_size: self.filters.lot_size,
            });
        }

        let order = self.submit_with_retry(side, rounded).await?;
        if !order.is_complete() {
            if is_open(&order) {
                self.cancel_until_acknowledged(&order).await;
            }
            return Err(BotError::IncompleteFill {
                order_id: order.id,
                requested: order.requested_qty,
                filled: order.filled_qty,
            });
        }

        tracing::info!(
            "{} {} {} @ {} ({} {})",
            side,
            order.filled_qty,
            self.pair.target,
            order.fill_price,
            order.order_price,
            self.pair.bridge
        );
        Ok(order)
    }

    async fn submit_with_retry(&self, side: Side, quantity: Decimal) -> Result<Order> {
        let (pair, mode) = (&self.pair, self.mode);
        self.with_retries("submit order", self.policy.retry_delay, move || {
            self.backend.submit_order(pair, side, quantity, mode)
        })
        .await
    }

    /// Cancel an open order, retrying until the backend acknowledges it
    async fn cancel_until_acknowledged(&self, order: &Order) {
        let mut attempt: u32 = 0;
        loop {
            tokio::time::sleep(self.policy.cancel_delay).await;
            attempt += 1;
            match self
                .backend
                .cancel_order(&self.pair, &order.id, self.mode)
                .await
            {
                Ok(()) => {
                    tracing::info!("Cancelled order {} on {}", order.id, self.pair);
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        "Cancel of order {} failed (attempt {}): {}",
                        order.id,
                        attempt,
                        e
                    );
                }
            }
        }
    }

    /// Run `call` once, then up to `max_retries` more times while it fails
    async fn with_retries<T, F, Fut>(
        &self,
        operation: &'static str,
        delay: Duration,
        mut call: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max = self.policy.max_retries;
        let mut last_error = match call().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        for attempt in 1..=max {
            tracing::info!(
                "{} failed: {}. Retrying (attempt {}/{})",
                operation,
                last_error,
                attempt,
                max
            );
            tokio::time::sleep(delay).await;
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) => last_error = e,
            }
        }

        tracing::warn!("{} failed for good: {}", operation, last_error);
        Err(BotError::RetriesExhausted {
            operation,
            attempts: max + 1,
        })
    }

    pub fn filters(&self) -> SymbolFilters {
        self.filters
    }

    pub fn pair(&self) -> &Pair {
        &self.pair
    }

    pub fn mode(&self) -> MarketMode {
        self.mode
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}

fn is_open(order: &Order) -> bool {
    matches!(order.status, OrderStatus::Partial | OrderStatus::NoOrder)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::Candle;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// What the scripted backend answers to the next order
    #[derive(Debug, Clone, Copy)]
    pub enum Scripted {
        Fail,
        Fill,
        Partial,
    }

    /// In-memory backend that answers orders from a script
    pub struct ScriptedBackend {
        pub balances: Mutex<Balances>,
        pub script: Mutex<VecDeque<Scripted>>,
        pub submitted: Mutex<Vec<(Side, Decimal)>>,
        pub cancels: Mutex<u32>,
        pub repay_failures: Mutex<u32>,
        /// Borrows that succeed but answer with an error
        pub lost_borrow_replies: Mutex<u32>,
        pub price: Decimal,
    }

    impl ScriptedBackend {
        pub fn new(bridge: Decimal, target: Decimal, borrowed: Decimal) -> Self {
            let mut balances = Balances::default();
            balances.set("USDT", bridge, Decimal::ZERO);
            balances.set("BTC", target, borrowed);
            Self {
                balances: Mutex::new(balances),
                script: Mutex::new(VecDeque::new()),
                submitted: Mutex::new(Vec::new()),
                cancels: Mutex::new(0),
                repay_failures: Mutex::new(0),
                lost_borrow_replies: Mutex::new(0),
                price: dec!(20000),
            }
        }

        pub fn with_script(self, script: &[Scripted]) -> Self {
            *self.script.lock().unwrap() = script.iter().copied().collect();
            self
        }

        pub fn free(&self, asset: &str) -> Decimal {
            self.balances.lock().unwrap().free(asset)
        }

        pub fn borrowed(&self, asset: &str) -> Decimal {
            self.balances.lock().unwrap().borrowed(asset)
        }

        fn apply_fill(&self, side: Side, quantity: Decimal) {
            let mut balances = self.balances.lock().unwrap();
            let (bridge, target) = (balances.free("USDT"), balances.free("BTC"));
            let borrowed = balances.borrowed("BTC");
            let notional = quantity * self.price;
            match side {
                Side::Buy => {
                    balances.set("USDT", bridge - notional, Decimal::ZERO);
                    balances.set("BTC", target + quantity, borrowed);
                }
                Side::Sell => {
                    balances.set("USDT", bridge + notional, Decimal::ZERO);
                    balances.set("BTC", target - quantity, borrowed);
                }
            }
        }
    }

    #[async_trait]
    impl TradingBackend for ScriptedBackend {
        async fn account_balances(&self, _: MarketMode, _: &Pair) -> Result<Balances> {
            Ok(self.balances.lock().unwrap().clone())
        }

        async fn symbol_filters(&self, _: &Pair) -> Result<SymbolFilters> {
            Ok(SymbolFilters {
                lot_size: dec!(0.0001),
                min_notional: dec!(10),
            })
        }

        async fn last_period_candle(&self, _: &Pair, _: &str) -> Result<Option<Candle>> {
            Ok(None)
        }

        async fn historical_period_candles(
            &self,
            _: &Pair,
            _: usize,
            _: &str,
        ) -> Result<Vec<Candle>> {
            Ok(Vec::new())
        }

        async fn submit_order(
            &self,
            _: &Pair,
            side: Side,
            quantity: Decimal,
            _: MarketMode,
        ) -> Result<Order> {
            self.submitted.lock().unwrap().push((side, quantity));
            let step = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Scripted::Fill);

            let (status, filled) = match step {
                Scripted::Fail => return Err(BotError::Backend("request timed out".into())),
                Scripted::Fill => (OrderStatus::Filled, quantity),
                Scripted::Partial => (OrderStatus::Partial, quantity / dec!(2)),
            };
            self.apply_fill(side, filled);

            Ok(Order {
                id: format!("order-{}", self.submitted.lock().unwrap().len()),
                side,
                requested_qty: quantity,
                filled_qty: filled,
                fill_price: self.price,
                status,
                order_price: filled * self.price,
            })
        }

        async fn cancel_order(&self, _: &Pair, _: &str, _: MarketMode) -> Result<()> {
            *self.cancels.lock().unwrap() += 1;
            Ok(())
        }

        async fn borrow(&self, asset: &str, quantity: Decimal) -> Result<()> {
            {
                let mut balances = self.balances.lock().unwrap();
                let (free, borrowed) = (balances.free(asset), balances.borrowed(asset));
                balances.set(asset, free + quantity, borrowed + quantity);
            }
            let mut lost = self.lost_borrow_replies.lock().unwrap();
            if *lost > 0 {
                *lost -= 1;
                return Err(BotError::Backend("connection reset".into()));
            }
            Ok(())
        }

        async fn repay(&self, asset: &str, quantity: Decimal) -> Result<()> {
            {
                let mut failures = self.repay_failures.lock().unwrap();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(BotError::Backend("repay rejected".into()));
                }
            }
            let mut balances = self.balances.lock().unwrap();
            let (free, borrowed) = (balances.free(asset), balances.borrowed(asset));
            balances.set(asset, free - quantity, borrowed - quantity);
            Ok(())
        }
    }

    async fn executor(backend: ScriptedBackend, mode: MarketMode) -> OrderExecutor<ScriptedBackend> {
        let policy = RetryPolicy::default().immediate();
        let mut executor = OrderExecutor::new(backend, Pair::new("USDT", "BTC"), mode, policy);
        executor.load_filters().await.unwrap();
        executor
    }

    #[tokio::test]
    async fn test_buy_sizes_from_working_balance() {
        let exec = executor(ScriptedBackend::new(dec!(50), dec!(0), dec!(0)), MarketMode::Spot).await;
        let sizing = Sizing {
            price: dec!(20000),
            working_balance: dec!(10),
        };

        let order = exec.buy(None, sizing).await.unwrap();

        assert_eq!(order.filled_qty, dec!(0.0005));
        assert_eq!(order.order_price, dec!(10));
        assert_eq!(exec.backend().free("USDT"), dec!(40));
        assert_eq!(exec.backend().free("BTC"), dec!(0.0005));
    }

    #[tokio::test]
    async fn test_buy_floors_to_lot_size() {
        let exec = executor(ScriptedBackend::new(dec!(50), dec!(0), dec!(0)), MarketMode::Spot).await;
        let sizing = Sizing {
            price: dec!(20000),
            working_balance: dec!(10),
        };

        exec.buy(Some(dec!(0.00057)), sizing).await.unwrap();
        assert_eq!(exec.backend().submitted.lock().unwrap()[0].1, dec!(0.0005));
    }

    #[tokio::test]
    async fn test_buy_below_lot_size_fails_without_submitting() {
        let exec = executor(ScriptedBackend::new(dec!(50), dec!(0), dec!(0)), MarketMode::Spot).await;
        let sizing = Sizing {
            price: dec!(20000),
            working_balance: dec!(1),
        };

        let result = exec.buy(None, sizing).await;
        assert!(matches!(result, Err(BotError::BelowLotSize { .. })));
        assert!(exec.backend().submitted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let backend = ScriptedBackend::new(dec!(50), dec!(0), dec!(0)).with_script(&[
            Scripted::Fail,
            Scripted::Fail,
            Scripted::Fail,
            Scripted::Fill,
        ]);
        let exec = executor(backend, MarketMode::Spot).await;

        let order = exec.buy(Some(dec!(0.0005)), Sizing { price: dec!(20000), working_balance: dec!(10) }).await;
        assert!(order.is_ok());

        // Quantity never changes between retries
        let submitted = exec.backend().submitted.lock().unwrap().clone();
        assert_eq!(submitted.len(), 4);
        assert!(submitted.iter().all(|(_, q)| *q == dec!(0.0005)));
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let backend = ScriptedBackend::new(dec!(50), dec!(0), dec!(0))
            .with_script(&[Scripted::Fail; 20]);
        let exec = executor(backend, MarketMode::Spot).await;

        let result = exec.buy(Some(dec!(0.0005)), Sizing { price: dec!(20000), working_balance: dec!(10) }).await;

        assert!(matches!(
            result,
            Err(BotError::RetriesExhausted { attempts: 11, .. })
        ));
        assert_eq!(exec.backend().submitted.lock().unwrap().len(), 11);
    }

    #[tokio::test]
    async fn test_partial_buy_is_cancelled_and_fails() {
        let backend =
            ScriptedBackend::new(dec!(50), dec!(0), dec!(0)).with_script(&[Scripted::Partial]);
        let exec = executor(backend, MarketMode::Spot).await;

        let result = exec.buy(Some(dec!(0.0004)), Sizing { price: dec!(20000), working_balance: dec!(10) }).await;

        assert!(matches!(result, Err(BotError::IncompleteFill { .. })));
        assert_eq!(*exec.backend().cancels.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sell_all_sells_exact_free_balance() {
        let exec = executor(ScriptedBackend::new(dec!(0), dec!(0.0003), dec!(0)), MarketMode::Spot).await;

        let order = exec.sell_all().await.unwrap();

        assert_eq!(order.filled_qty, dec!(0.0003));
        assert_eq!(exec.backend().free("BTC"), dec!(0));
        assert_eq!(exec.backend().free("USDT"), dec!(0.0003) * dec!(20000));
    }

    #[tokio::test]
    async fn test_sell_all_cancels_partials_and_retries() {
        let backend = ScriptedBackend::new(dec!(0), dec!(0.0004), dec!(0)).with_script(&[
            Scripted::Partial,
            Scripted::Partial,
            Scripted::Fill,
        ]);
        let exec = executor(backend, MarketMode::Spot).await;

        let order = exec.sell_all().await.unwrap();

        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(*exec.backend().cancels.lock().unwrap(), 2);

        // Each round resubmits against the refreshed balance
        let quantities: Vec<Decimal> = exec
            .backend()
            .submitted
            .lock()
            .unwrap()
            .iter()
            .map(|(_, q)| *q)
            .collect();
        assert_eq!(quantities, vec![dec!(0.0004), dec!(0.0002), dec!(0.0001)]);
        assert_eq!(exec.backend().free("BTC"), dec!(0));
    }

    #[tokio::test]
    async fn test_sell_all_gives_up_after_max_rounds() {
        let backend = ScriptedBackend::new(dec!(0), dec!(1), dec!(0))
            .with_script(&[Scripted::Partial; 10]);
        let exec = executor(backend, MarketMode::Spot).await;

        let result = exec.sell_all().await;

        assert!(matches!(result, Err(BotError::SellAllExhausted { rounds: 5 })));
        assert_eq!(exec.backend().submitted.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_borrow_with_lost_reply_is_not_repeated() {
        let backend = ScriptedBackend::new(dec!(50), dec!(0), dec!(0));
        *backend.lost_borrow_replies.lock().unwrap() = 1;
        let exec = executor(backend, MarketMode::Margin).await;

        let borrowed = exec.borrow(dec!(0.00057)).await.unwrap();

        assert_eq!(borrowed, dec!(0.0005));
        assert_eq!(exec.backend().borrowed("BTC"), dec!(0.0005));
        assert_eq!(exec.backend().free("BTC"), dec!(0.0005));
    }

    #[tokio::test]
    async fn test_repay_clears_loan() {
        let exec = executor(
            ScriptedBackend::new(dec!(60), dec!(0.0005), dec!(0.0005)),
            MarketMode::Margin,
        )
        .await;

        exec.repay_outstanding(dec!(20000)).await.unwrap();

        assert_eq!(exec.backend().borrowed("BTC"), dec!(0));
        assert_eq!(exec.backend().free("BTC"), dec!(0));
    }

    #[tokio::test]
    async fn test_repay_retries_then_fails_on_large_loan() {
        let backend = ScriptedBackend::new(dec!(60), dec!(0.001), dec!(0.001));
        *backend.repay_failures.lock().unwrap() = 100;
        let exec = executor(backend, MarketMode::Margin).await;

        let result = exec.repay_outstanding(dec!(20000)).await;

        assert!(matches!(result, Err(BotError::RepayFailed { .. })));
    }

    #[tokio::test]
    async fn test_repay_failure_tolerated_below_min_notional() {
        // 0.0004 BTC at 20000 is 8, under the min notional of 10
        let backend = ScriptedBackend::new(dec!(60), dec!(0.0004), dec!(0.0004));
        *backend.repay_failures.lock().unwrap() = 1;
        let exec = executor(backend, MarketMode::Margin).await;

        assert!(exec.repay_outstanding(dec!(20000)).await.is_ok());
        // The top-up repay still clears the loan
        assert_eq!(exec.backend().borrowed("BTC"), dec!(0));
    }
}
