use crate::config::BinanceSettings;
use crate::error::BotError;
use crate::execution::TradingBackend;
use crate::models::{Balances, Candle, MarketMode, Order, OrderStatus, Pair, Side, SymbolFilters};
use crate::Result;
use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

const MAX_RETRIES: u32 = 3;
/// Upper bound of candles per klines request
const KLINES_PAGE_LIMIT: usize = 1000;

type HmacSha256 = Hmac<Sha256>;

// Type alias for the rate limiter to simplify signatures
type BinanceRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Binance REST client for spot and cross-margin trading
///
/// Cloneable; all clones share the rate limiter and the filter cache.
#[derive(Clone)]
pub struct BinanceClient {
    client: Client,
    base_url: String,
    api_key: String,
    secret_key: String,
    retry_delay: Duration,
    rate_limiter: Arc<BinanceRateLimiter>,
    filters: Arc<RwLock<HashMap<String, SymbolFilters>>>,
}

#[derive(Debug, Deserialize)]
struct SpotAccount {
    balances: Vec<SpotBalance>,
}

#[derive(Debug, Deserialize)]
struct SpotBalance {
    asset: String,
    free: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarginAccount {
    user_assets: Vec<MarginAsset>,
}

#[derive(Debug, Deserialize)]
struct MarginAsset {
    asset: String,
    free: Decimal,
    borrowed: Decimal,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfo {
    symbol: String,
    filters: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: i64,
    status: String,
    orig_qty: Decimal,
    executed_qty: Decimal,
    cummulative_quote_qty: Decimal,
}

impl OrderResponse {
    fn into_order(self, side: Side) -> Order {
        let fill_price = if self.executed_qty.is_zero() {
            Decimal::ZERO
        } else {
            self.cummulative_quote_qty / self.executed_qty
        };
        Order {
            id: self.order_id.to_string(),
            side,
            requested_qty: self.orig_qty.normalize(),
            filled_qty: self.executed_qty.normalize(),
            fill_price,
            status: OrderStatus::from_exchange(&self.status),
            order_price: self.cummulative_quote_qty,
        }
    }
}

impl BinanceClient {
    pub fn new(settings: &BinanceSettings) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

        let per_second = NonZeroU32::new(settings.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_second(per_second)));

        Ok(Self {
            client,
            base_url: settings.rest_base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            secret_key: settings.secret_key.clone(),
            retry_delay: Duration::from_secs(1),
            rate_limiter,
            filters: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Base delay between retries; doubled on every attempt
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Hex HMAC-SHA256 of a query string
    fn sign(&self, query: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(self.secret_key.as_bytes())
            .map_err(|e| BotError::Config(format!("invalid secret key: {}", e)))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn encode(params: &[(&str, String)]) -> Result<String> {
        serde_urlencoded::to_string(params)
            .map_err(|e| BotError::Backend(format!("failed to encode query: {}", e)))
    }

    /// Append the timestamp and signature to the encoded parameters
    fn signed_query(&self, params: &[(&str, String)]) -> Result<String> {
        let mut query = Self::encode(params)?;
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&format!("timestamp={}", chrono::Utc::now().timestamp_millis()));
        let signature = self.sign(&query)?;
        query.push_str(&format!("&signature={}", signature));
        Ok(query)
    }

    /// Rate-limited request with retries on 429, 5xx and network errors
    ///
    /// Only GETs are retried after a 5xx or a dropped connection. For an order,
    /// loan or repay those leave the outcome unknown, so the error goes back to
    /// the caller instead of a second submission.
    async fn request(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        signed: bool,
    ) -> Result<Value> {
        let query = if signed {
            self.signed_query(params)?
        } else {
            Self::encode(params)?
        };
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };

        let idempotent = method == Method::GET;

        for attempt in 1..=MAX_RETRIES {
            self.rate_limiter.until_ready().await;

            let backoff = self.retry_delay * 2u32.pow(attempt - 1);
            let mut request = self.client.request(method.clone(), &url);
            if signed {
                request = request.header("X-MBX-APIKEY", &self.api_key);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response.json().await?);
                    }

                    if status.as_u16() == 429 || (idempotent && status.is_server_error()) {
                        tracing::warn!(
                            "Binance returned {} for {}, retrying in {:?} (attempt {}/{})",
                            status,
                            path,
                            backoff,
                            attempt,
                            MAX_RETRIES
                        );
                        tokio::time::sleep(backoff).await;
                        continue;
                    }

                    if status.is_server_error() {
                        return Err(BotError::ExecutionUnknown {
                            path: path.to_string(),
                            status: status.as_u16(),
                        });
                    }

                    // Other errors (4xx) - don't retry
                    let body = response.text().await.unwrap_or_default();
                    return Err(BotError::Backend(api_error_message(status.as_u16(), &body)));
                }
                // A refused connection never reached the exchange
                Err(e) if attempt < MAX_RETRIES && (idempotent || e.is_connect()) => {
                    tracing::warn!(
                        "Network error calling {}: {}, retrying in {:?} (attempt {}/{})",
                        path,
                        e,
                        backoff,
                        attempt,
                        MAX_RETRIES
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(BotError::RetriesExhausted {
            operation: "binance request",
            attempts: MAX_RETRIES,
        })
    }

    /// Look up an order whose submission had no clear answer
    ///
    /// Returns `cause` when the exchange has no such order, so the caller may
    /// submit again.
    async fn find_order(
        &self,
        pair: &Pair,
        mode: MarketMode,
        client_order_id: &str,
        cause: BotError,
    ) -> Result<Value> {
        tracing::warn!("{}; looking up order {} on {}", cause, client_order_id, pair);
        let params = [
            ("symbol", pair.symbol()),
            ("origClientOrderId", client_order_id.to_string()),
        ];
        match self
            .request(Method::GET, Self::order_path(mode), &params, true)
            .await
        {
            Ok(value) => Ok(value),
            Err(e) => {
                tracing::info!("Order {} not found ({}), safe to resubmit", client_order_id, e);
                Err(cause)
            }
        }
    }

    async fn klines(
        &self,
        symbol: &str,
        interval: &str,
        start_time: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let mut params = vec![
            ("symbol", symbol.to_string()),
            ("interval", interval.to_string()),
            ("limit", limit.min(KLINES_PAGE_LIMIT).to_string()),
        ];
        if let Some(start) = start_time {
            params.push(("startTime", start.to_string()));
        }

        let rows: Vec<Vec<Value>> =
            serde_json::from_value(self.request(Method::GET, "/api/v3/klines", &params, false).await?)?;
        rows.iter().map(|row| parse_kline_row(row)).collect()
    }

    /// Every candle of `interval` opening in `[start_ms, end_ms)`, oldest first
    pub async fn download_klines(
        &self,
        pair: &Pair,
        interval: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Candle>> {
        let symbol = pair.symbol();
        let mut candles: Vec<Candle> = Vec::new();
        let mut cursor = start_ms;

        while cursor < end_ms {
            let page = self
                .klines(&symbol, interval, Some(cursor), KLINES_PAGE_LIMIT)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            let next = last.open_time + 1;
            candles.extend(page.into_iter().filter(|c| c.open_time < end_ms));
            if next <= cursor {
                break;
            }
            cursor = next;
            tracing::debug!("Downloaded {} {} candles for {}", candles.len(), interval, symbol);
        }

        Ok(candles)
    }

    fn order_path(mode: MarketMode) -> &'static str {
        match mode {
            MarketMode::Spot => "/api/v3/order",
            MarketMode::Margin => "/sapi/v1/margin/order",
        }
    }
}

/// Binance error bodies look like `{"code": -2010, "msg": "..."}`
fn api_error_message(status: u16, body: &str) -> String {
    #[derive(Deserialize)]
    struct ApiError {
        code: i64,
        msg: String,
    }

    match serde_json::from_str::<ApiError>(body) {
        Ok(err) => format!("Binance API error {} ({}): {}", err.code, status, err.msg),
        Err(_) => format!("Binance API error ({}): {}", status, body),
    }
}

fn decimal_field(row: &[Value], index: usize) -> Result<Decimal> {
    let raw = row
        .get(index)
        .ok_or_else(|| BotError::Backend(format!("kline row missing column {}", index)))?;
    match raw {
        Value::String(s) => Ok(Decimal::from_str(s)?),
        other => Ok(Decimal::from_str(&other.to_string())?),
    }
}

/// `[openTime, open, high, low, close, volume, closeTime, ...]`
fn parse_kline_row(row: &[Value]) -> Result<Candle> {
    let open_time = row
        .first()
        .and_then(Value::as_i64)
        .ok_or_else(|| BotError::Backend("kline row missing open time".into()))?;
    Ok(Candle {
        open_time,
        open: decimal_field(row, 1)?,
        high: decimal_field(row, 2)?,
        low: decimal_field(row, 3)?,
        close: decimal_field(row, 4)?,
        volume: decimal_field(row, 5)?,
    })
}

fn parse_filters(info: &SymbolInfo) -> Result<SymbolFilters> {
    let field = |filter_type: &str, key: &str| -> Option<Decimal> {
        info.filters
            .iter()
            .find(|f| f.get("filterType").and_then(Value::as_str) == Some(filter_type))
            .and_then(|f| f.get(key))
            .and_then(Value::as_str)
            .and_then(|s| Decimal::from_str(s).ok())
            .map(|d| d.normalize())
    };

    let lot_size = field("LOT_SIZE", "stepSize").ok_or_else(|| {
        BotError::Backend(format!("{} has no LOT_SIZE filter", info.symbol))
    })?;
    let min_notional = field("MIN_NOTIONAL", "minNotional")
        .or_else(|| field("NOTIONAL", "minNotional"))
        .unwrap_or(Decimal::ZERO);

    Ok(SymbolFilters {
        lot_size,
        min_notional,
    })
}

#[async_trait]
impl TradingBackend for BinanceClient {
    async fn account_balances(&self, mode: MarketMode, pair: &Pair) -> Result<Balances> {
        let mut balances = Balances::default();
        let wanted = |asset: &str| asset == pair.bridge || asset == pair.target;

        match mode {
            MarketMode::Spot => {
                let value = self.request(Method::GET, "/api/v3/account", &[], true).await?;
                let account: SpotAccount = serde_json::from_value(value)?;
                for coin in account.balances.iter().filter(|c| wanted(&c.asset)) {
                    balances.set(&coin.asset, coin.free, Decimal::ZERO);
                }
            }
            MarketMode::Margin => {
                let value = self
                    .request(Method::GET, "/sapi/v1/margin/account", &[], true)
                    .await?;
                let account: MarginAccount = serde_json::from_value(value)?;
                for coin in account.user_assets.iter().filter(|c| wanted(&c.asset)) {
                    balances.set(&coin.asset, coin.free, coin.borrowed);
                }
            }
        }

        Ok(balances)
    }

    async fn symbol_filters(&self, pair: &Pair) -> Result<SymbolFilters> {
        let symbol = pair.symbol();
        if let Some(filters) = self.filters.read().await.get(&symbol) {
            return Ok(*filters);
        }

        let value = self
            .request(
                Method::GET,
                "/api/v3/exchangeInfo",
                &[("symbol", symbol.clone())],
                false,
            )
            .await?;
        let info: ExchangeInfo = serde_json::from_value(value)?;
        let symbol_info = info
            .symbols
            .iter()
            .find(|s| s.symbol == symbol)
            .ok_or_else(|| BotError::Backend(format!("symbol {} not listed", symbol)))?;
        let filters = parse_filters(symbol_info)?;

        tracing::info!(
            "{} filters: lot size {}, min notional {}",
            symbol,
            filters.lot_size,
            filters.min_notional
        );
        self.filters.write().await.insert(symbol, filters);
        Ok(filters)
    }

    async fn last_period_candle(&self, pair: &Pair, interval: &str) -> Result<Option<Candle>> {
        // The newest candle is still open; the one before it is the last closed one
        let candles = self.klines(&pair.symbol(), interval, None, 2).await?;
        Ok(match candles.as_slice() {
            [closed, _open] => Some(closed.clone()),
            _ => None,
        })
    }

    async fn historical_period_candles(
        &self,
        pair: &Pair,
        count: usize,
        interval: &str,
    ) -> Result<Vec<Candle>> {
        let mut candles = self
            .klines(&pair.symbol(), interval, None, count + 1)
            .await?;
        // Drop the candle that is still open
        candles.pop();
        let skip = candles.len().saturating_sub(count);
        Ok(candles.split_off(skip))
    }

    async fn submit_order(
        &self,
        pair: &Pair,
        side: Side,
        quantity: Decimal,
        mode: MarketMode,
    ) -> Result<Order> {
        let client_order_id = format!("bridgebot-{}", chrono::Utc::now().timestamp_micros());
        let params = [
            ("symbol", pair.symbol()),
            ("side", side.to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", quantity.normalize().to_string()),
            ("newClientOrderId", client_order_id.clone()),
            ("newOrderRespType", "FULL".to_string()),
        ];
        let value = match self
            .request(Method::POST, Self::order_path(mode), &params, true)
            .await
        {
            Ok(value) => value,
            Err(e @ BotError::ExecutionUnknown { .. }) => {
                self.find_order(pair, mode, &client_order_id, e).await?
            }
            Err(e) => return Err(e),
        };
        let response: OrderResponse = serde_json::from_value(value)?;
        let order = response.into_order(side);

        tracing::info!(
            "{} {} order {} on {}: {:?} {} of {}",
            mode,
            side,
            order.id,
            pair,
            order.status,
            order.filled_qty,
            order.requested_qty
        );
        Ok(order)
    }

    async fn cancel_order(&self, pair: &Pair, order_id: &str, mode: MarketMode) -> Result<()> {
        let params = [("symbol", pair.symbol()), ("orderId", order_id.to_string())];
        self.request(Method::DELETE, Self::order_path(mode), &params, true)
            .await?;
        tracing::info!("Cancelled order {} on {}", order_id, pair);
        Ok(())
    }

    async fn borrow(&self, asset: &str, quantity: Decimal) -> Result<()> {
        let params = [
            ("asset", asset.to_string()),
            ("amount", quantity.normalize().to_string()),
        ];
        self.request(Method::POST, "/sapi/v1/margin/loan", &params, true)
            .await?;
        tracing::info!("Borrowed {} {}", quantity, asset);
        Ok(())
    }

    async fn repay(&self, asset: &str, quantity: Decimal) -> Result<()> {
        let params = [
            ("asset", asset.to_string()),
            ("amount", quantity.normalize().to_string()),
        ];
        self.request(Method::POST, "/sapi/v1/margin/repay", &params, true)
            .await?;
        tracing::info!("Repaid {} {}", quantity, asset);
        Ok(())
    }
}
