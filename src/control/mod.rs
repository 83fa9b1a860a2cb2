// Live control loop: kline dispatch, operator commands and reconnects
pub mod backoff;
pub mod command;
pub mod controller;
pub mod stream;

pub use backoff::BackoffPolicy;
pub use command::{Command, CommandSource, QueuedCommands};
pub use controller::{Controller, PairRunner, RunState};
pub use stream::{KlineSink, StreamEvent, TickSource};
