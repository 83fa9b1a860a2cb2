use rust_decimal::Decimal;
use thiserror::Error;

/// Every failure the bot can surface to a caller
#[derive(Debug, Error)]
pub enum BotError {
    #[error("backend request failed: {0}")]
    Backend(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("decimal parse error: {0}")]
    Decimal(#[from] rust_decimal::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("not enough history: need {needed} candles, got {got}")]
    InsufficientHistory { needed: usize, got: usize },

    #[error("{operation} gave up after {attempts} attempts")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
    },

    #[error("{path} returned {status}, execution status unknown")]
    ExecutionUnknown { path: String, status: u16 },

    #[error("order {order_id} not completed: filled {filled} of {requested}")]
    IncompleteFill {
        order_id: String,
        requested: Decimal,
        filled: Decimal,
    },

    #[error("sell-all still incomplete after {rounds} rounds")]
    SellAllExhausted { rounds: u32 },

    #[error("quantity {quantity} is below lot size {lot_size}")]
    BelowLotSize { quantity: Decimal, lot_size: Decimal },

    #[error("still borrowing {borrowed} {asset} after repay attempts")]
    RepayFailed { asset: String, borrowed: Decimal },

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("tick stream disconnected: {0}")]
    Disconnected(String),
}

impl From<config::ConfigError> for BotError {
    fn from(err: config::ConfigError) -> Self {
        BotError::Config(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for BotError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        BotError::Disconnected(err.to_string())
    }
}
