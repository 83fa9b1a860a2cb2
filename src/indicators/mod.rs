// Indicators derived from the period candle window

pub mod moving_average;
pub mod range;

pub use moving_average::calculate_sma;
pub use range::{price_range, PriceRange};
