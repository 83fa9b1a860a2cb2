use crate::models::KlineEvent;
use crate::Result;
use async_trait::async_trait;

/// Next thing the live tick source has to say
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Kline(KlineEvent),
    /// Transport dropped or went idle; reconnect with backoff
    Disconnected(String),
    /// The source has no more data and will not reconnect
    Finished,
}

/// Live minute klines for the traded symbols
#[async_trait]
pub trait TickSource: Send {
    async fn connect(&mut self) -> Result<()>;

    /// Wait for the next event
    ///
    /// Must be cancel safe: the control loop races it against command polling.
    async fn next_event(&mut self) -> StreamEvent;

    async fn close(&mut self);
}

/// Destination for raw kline events
#[async_trait]
pub trait KlineSink: Send {
    async fn store_kline(&mut self, event: &KlineEvent) -> Result<()>;
}
