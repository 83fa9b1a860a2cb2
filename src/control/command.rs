use crate::error::BotError;
use crate::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

/// Operator command for the live loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Re-initialize every pair and resume trading
    Start,
    /// Close positions, disconnect and stop dispatching
    Stop,
    /// Disconnect and stop dispatching, keeping positions
    Pause,
    /// Resume dispatching after a pause or stop
    Continue,
    ClosePosition,
}

impl Command {
    pub const ALL: [Command; 5] = [
        Command::Start,
        Command::Stop,
        Command::Pause,
        Command::Continue,
        Command::ClosePosition,
    ];

    /// Token stored in the task queue
    pub fn token(&self) -> &'static str {
        match self {
            Command::Start => "START",
            Command::Stop => "STOP",
            Command::Pause => "PAUSE",
            Command::Continue => "CONTINUE",
            Command::ClosePosition => "CLOSE_POSITION",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.token())
    }
}

impl FromStr for Command {
    type Err = BotError;

    /// Accepts queue tokens as well as `close-position` style spellings
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = s.trim().to_uppercase().replace('-', "_");
        Command::ALL
            .into_iter()
            .find(|c| c.token() == normalized)
            .ok_or_else(|| BotError::UnknownCommand(s.to_string()))
    }
}

/// FIFO queue of operator commands
#[async_trait]
pub trait CommandSource: Send {
    /// Oldest pending command, if any
    async fn pop_command(&mut self) -> Result<Option<Command>>;
}

/// In-process command queue
#[derive(Debug, Default)]
pub struct QueuedCommands {
    queue: VecDeque<Command>,
}

impl QueuedCommands {
    pub fn new(commands: impl IntoIterator<Item = Command>) -> Self {
        Self {
            queue: commands.into_iter().collect(),
        }
    }

    pub fn push(&mut self, command: Command) {
        self.queue.push_back(command);
    }
}

#[async_trait]
impl CommandSource for QueuedCommands {
    async fn pop_command(&mut self) -> Result<Option<Command>> {
        Ok(self.queue.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tokens_and_cli_spellings() {
        assert_eq!("START".parse::<Command>().unwrap(), Command::Start);
        assert_eq!("close-position".parse::<Command>().unwrap(), Command::ClosePosition);
        assert_eq!("CLOSE_POSITION".parse::<Command>().unwrap(), Command::ClosePosition);
        assert_eq!(" continue ".parse::<Command>().unwrap(), Command::Continue);
    }

    #[test]
    fn test_unknown_command() {
        let err = "RESTART".parse::<Command>().unwrap_err();
        assert!(matches!(err, BotError::UnknownCommand(ref s) if s == "RESTART"));
    }

    #[test]
    fn test_display_matches_token() {
        for command in Command::ALL {
            assert_eq!(command.to_string().parse::<Command>().unwrap(), command);
        }
    }

    #[tokio::test]
    async fn test_queue_is_fifo() {
        let mut queue = QueuedCommands::new([Command::Pause, Command::Continue]);
        queue.push(Command::Stop);

        assert_eq!(queue.pop_command().await.unwrap(), Some(Command::Pause));
        assert_eq!(queue.pop_command().await.unwrap(), Some(Command::Continue));
        assert_eq!(queue.pop_command().await.unwrap(), Some(Command::Stop));
        assert_eq!(queue.pop_command().await.unwrap(), None);
    }
}
