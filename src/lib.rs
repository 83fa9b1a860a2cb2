// Core modules
pub mod api;
pub mod backtest;
pub mod config;
pub mod control;
pub mod error;
pub mod execution;
pub mod indicators;
pub mod models;
pub mod persistence;
pub mod report;
pub mod strategy;

// Re-export commonly used types
pub use config::Settings;
pub use error::BotError;
pub use models::*;
pub use strategy::StrategyMachine;

// Error handling
pub type Result<T> = std::result::Result<T, BotError>;
