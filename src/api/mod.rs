pub mod binance;
pub mod binance_stream;

pub use binance::BinanceClient;
pub use binance_stream::{parse_kline_message, BinanceKlineStream};
