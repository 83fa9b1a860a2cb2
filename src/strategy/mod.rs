// Strategy state machine and its spot/margin variants
pub mod cycle;
pub mod machine;
pub mod market;

pub use cycle::{StrategyCycle, StrategyState};
pub use machine::{Decision, StrategyMachine, TickOutcome};
pub use market::{AccountCheck, MarginMarket, Market, Reconciled, Signals, SpotMarket};

use crate::config::StrategySettings;
use crate::execution::{OrderExecutor, TradingBackend};
use crate::Result;

/// Build a spot machine from settings
pub fn spot_machine<B: TradingBackend>(
    executor: OrderExecutor<B>,
    settings: &StrategySettings,
) -> Result<StrategyMachine<B, SpotMarket>> {
    let market = SpotMarket {
        entry_rule: settings.entry_rule,
        stop_loss_factor: settings.spot_stop_loss,
    };
    StrategyMachine::new(market, executor, settings.clone())
}

/// Build a margin machine from settings
pub fn margin_machine<B: TradingBackend>(
    executor: OrderExecutor<B>,
    settings: &StrategySettings,
) -> Result<StrategyMachine<B, MarginMarket>> {
    let market = MarginMarket {
        stop_loss_factor: settings.margin_stop_loss,
    };
    StrategyMachine::new(market, executor, settings.clone())
}
