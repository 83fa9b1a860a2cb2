pub mod metrics;
pub mod replay;
pub mod runner;
pub mod sources;
pub mod synthetic;

pub use metrics::{BacktestSummary, TradeRecord};
pub use replay::{CandleCursor, FeedState, Ledger, ReplayBackend};
pub use runner::{BacktestRunner, ReplayRow};
pub use sources::{aggregate_candles, load_klines_csv, write_klines_csv};
pub use synthetic::{MarketScenario, SyntheticDataGenerator};
