// Order execution, balances and the candle window a strategy trades on
pub mod backend;
pub mod candle_window;
pub mod executor;
pub mod portfolio;

pub use backend::TradingBackend;
pub use candle_window::CandleWindow;
pub use executor::{OrderExecutor, RetryPolicy, Sizing};
pub use portfolio::{Portfolio, TargetOrder};
