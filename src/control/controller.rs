use crate::config::ControlSettings;
use crate::control::backoff::BackoffPolicy;
use crate::control::command::{Command, CommandSource};
use crate::control::stream::{KlineSink, StreamEvent, TickSource};
use crate::error::BotError;
use crate::execution::TradingBackend;
use crate::models::{Candle, KlineEvent, MarketMode, Order};
use crate::report::{Report, ReportSink};
use crate::strategy::{Decision, Market, StrategyMachine, TickOutcome};
use crate::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Paused,
    Stopped,
}

/// Object-safe view of a strategy machine, one per traded pair
#[async_trait]
pub trait PairRunner: Send {
    /// Exchange symbol the runner trades, e.g. `BTCUSDT`
    fn symbol(&self) -> String;

    fn mode(&self) -> MarketMode;

    async fn initialize(&mut self) -> Result<()>;

    async fn on_tick(&mut self, candle: &Candle, event_time: i64) -> TickOutcome;

    async fn close_position(&mut self) -> Option<Order>;

    fn report(&self, outcome: &TickOutcome) -> Report;
}

#[async_trait]
impl<B, M> PairRunner for StrategyMachine<B, M>
where
    B: TradingBackend + 'static,
    M: Market + 'static,
{
    fn symbol(&self) -> String {
        self.pair().symbol()
    }

    fn mode(&self) -> MarketMode {
        self.market().mode()
    }

    async fn initialize(&mut self) -> Result<()> {
        StrategyMachine::initialize(self).await
    }

    async fn on_tick(&mut self, candle: &Candle, event_time: i64) -> TickOutcome {
        StrategyMachine::on_tick(self, candle, event_time).await
    }

    async fn close_position(&mut self) -> Option<Order> {
        StrategyMachine::close_position(self).await
    }

    fn report(&self, outcome: &TickOutcome) -> Report {
        StrategyMachine::report(self, outcome)
    }
}

struct PairSlot {
    runner: Box<dyn PairRunner>,
    symbol: String,
    last_open_time: i64,
    cooldown_until: Option<Instant>,
}

/// Live loop: feeds klines to the pair runners and services operator commands
///
/// Pairs are handled one after another on the calling task, so ticks for a
/// pair are always processed in order and never overlap.
pub struct Controller<S> {
    stream: S,
    commands: Box<dyn CommandSource>,
    reports: Box<dyn ReportSink>,
    klines: Option<Box<dyn KlineSink>>,
    pairs: Vec<PairSlot>,
    backoff: BackoffPolicy,
    cooldown: Duration,
    command_poll: Duration,
    state: RunState,
    reconnects: u32,
}

impl<S: TickSource> Controller<S> {
    pub fn new(
        stream: S,
        commands: Box<dyn CommandSource>,
        reports: Box<dyn ReportSink>,
        settings: &ControlSettings,
    ) -> Self {
        Self {
            stream,
            commands,
            reports,
            klines: None,
            pairs: Vec::new(),
            backoff: BackoffPolicy::from(settings),
            cooldown: Duration::from_secs(settings.insufficient_funds_cooldown_secs),
            command_poll: Duration::from_millis(settings.command_poll_ms),
            state: RunState::Stopped,
            reconnects: 0,
        }
    }

    pub fn with_kline_sink(mut self, sink: impl KlineSink + 'static) -> Self {
        self.klines = Some(Box::new(sink));
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn add_pair(&mut self, runner: Box<dyn PairRunner>) {
        let symbol = runner.symbol();
        self.pairs.push(PairSlot {
            runner,
            symbol,
            last_open_time: i64::MIN,
            cooldown_until: None,
        });
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Initialize every pair, connect and run until the stream finishes
    ///
    /// Startup failures are returned before any tick is processed. Afterwards
    /// only running out of reconnect attempts ends the loop with an error.
    pub async fn run(&mut self) -> Result<()> {
        self.initialize_pairs().await?;
        self.stream.connect().await?;
        self.state = RunState::Running;
        tracing::info!("🚀 Live loop running for {} pair(s)", self.pairs.len());

        loop {
            self.service_command().await;

            if self.state != RunState::Running {
                tokio::time::sleep(self.command_poll).await;
                continue;
            }

            let event = tokio::select! {
                event = self.stream.next_event() => event,
                _ = tokio::time::sleep(self.command_poll) => continue,
            };

            match event {
                StreamEvent::Kline(kline) => {
                    self.reconnects = 0;
                    self.dispatch(kline).await;
                }
                StreamEvent::Disconnected(reason) => {
                    tracing::warn!("Tick stream disconnected: {}", reason);
                    self.reconnect().await?;
                }
                StreamEvent::Finished => {
                    tracing::info!("Tick stream finished");
                    self.stream.close().await;
                    return Ok(());
                }
            }
        }
    }

    async fn initialize_pairs(&mut self) -> Result<()> {
        for slot in self.pairs.iter_mut() {
            slot.runner.initialize().await?;
            slot.cooldown_until = None;
        }
        Ok(())
    }

    /// Hand one kline to its pair, at most once per candle open time
    async fn dispatch(&mut self, event: KlineEvent) {
        let Some(slot) = self.pairs.iter_mut().find(|p| p.symbol == event.symbol) else {
            tracing::debug!("Ignoring kline for untracked symbol {}", event.symbol);
            return;
        };

        if event.candle.open_time <= slot.last_open_time {
            return;
        }
        slot.last_open_time = event.candle.open_time;

        if let Some(klines) = self.klines.as_mut() {
            if let Err(e) = klines.store_kline(&event).await {
                tracing::warn!("Failed to store kline for {}: {}", event.symbol, e);
            }
        }

        if let Some(until) = slot.cooldown_until {
            if Instant::now() < until {
                tracing::debug!("{} cooling down after insufficient funds", slot.symbol);
                return;
            }
            slot.cooldown_until = None;
        }

        let outcome = slot.runner.on_tick(&event.candle, event.event_time).await;
        if outcome.decision == Decision::InsufficientFunds {
            tracing::warn!(
                "{} {}: insufficient funds, pausing entries for {:?}",
                slot.runner.mode(),
                slot.symbol,
                self.cooldown
            );
            slot.cooldown_until = Some(Instant::now() + self.cooldown);
        }

        if outcome.is_reportable() {
            let report = slot.runner.report(&outcome);
            if let Err(e) = self.reports.emit(&report).await {
                tracing::warn!("Failed to emit report for {}: {}", slot.symbol, e);
            }
        }
    }

    async fn reconnect(&mut self) -> Result<()> {
        self.stream.close().await;

        loop {
            self.reconnects += 1;
            let Some(delay) = self.backoff.delay(self.reconnects) else {
                return Err(BotError::Disconnected(format!(
                    "gave up after {} reconnect attempts",
                    self.backoff.max_attempts
                )));
            };

            tracing::info!(
                "Reconnecting in {:?} (attempt {}/{})",
                delay,
                self.reconnects,
                self.backoff.max_attempts
            );
            tokio::time::sleep(delay).await;

            match self.stream.connect().await {
                Ok(()) => return Ok(()),
                Err(e) => tracing::warn!("Reconnect failed: {}", e),
            }
        }
    }

    async fn service_command(&mut self) {
        match self.commands.pop_command().await {
            Ok(Some(command)) => {
                if let Err(e) = self.execute(command).await {
                    tracing::error!("Command {} failed: {}", command, e);
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Failed to read command queue: {}", e),
        }
    }

    /// Apply one operator command
    pub async fn execute(&mut self, command: Command) -> Result<()> {
        tracing::info!("📨 Command {} (state {:?})", command, self.state);

        match command {
            Command::Start => {
                if self.state == RunState::Running {
                    tracing::info!("Already running, ignoring START");
                    return Ok(());
                }
                self.initialize_pairs().await?;
                self.stream.connect().await?;
                self.state = RunState::Running;
            }
            Command::Stop => {
                if self.state == RunState::Stopped {
                    tracing::info!("Already stopped, ignoring STOP");
                    return Ok(());
                }
                self.close_positions().await;
                self.stream.close().await;
                self.state = RunState::Stopped;
            }
            Command::Pause => {
                if self.state != RunState::Running {
                    tracing::info!("Not running, ignoring PAUSE");
                    return Ok(());
                }
                self.stream.close().await;
                self.state = RunState::Paused;
            }
            Command::Continue => {
                if self.state == RunState::Running {
                    tracing::info!("Already running, ignoring CONTINUE");
                    return Ok(());
                }
                self.stream.connect().await?;
                self.state = RunState::Running;
            }
            Command::ClosePosition => self.close_positions().await,
        }

        Ok(())
    }

    async fn close_positions(&mut self) {
        for slot in self.pairs.iter_mut() {
            let Some(order) = slot.runner.close_position().await else {
                continue;
            };
            let outcome = TickOutcome {
                order: Some(order),
                candle_updated: false,
                initial: false,
                decision: Decision::Closed,
            };
            let mut report = slot.runner.report(&outcome);
            // Keyed by time, so it must not reuse the last tick's stamp
            report.event_time = chrono::Utc::now()
                .timestamp_millis()
                .max(report.event_time + 1);
            if let Err(e) = self.reports.emit(&report).await {
                tracing::warn!("Failed to emit close report for {}: {}", slot.symbol, e);
            }
        }
    }

    /// Close the stream without touching positions
    pub async fn shutdown(&mut self) {
        self.stream.close().await;
        self.state = RunState::Stopped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::command::QueuedCommands;
    use crate::models::Side;
    use crate::report::MemorySink;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorded {
        ticks: Vec<(String, i64)>,
        closes: usize,
        initializations: usize,
        connects: usize,
        closes_stream: usize,
        reports: usize,
        klines: usize,
    }

    type Shared = Arc<Mutex<Recorded>>;

    struct FakeRunner {
        symbol: String,
        shared: Shared,
        decision: Decision,
        event_time: i64,
    }

    #[async_trait]
    impl PairRunner for FakeRunner {
        fn symbol(&self) -> String {
            self.symbol.clone()
        }

        fn mode(&self) -> MarketMode {
            MarketMode::Spot
        }

        async fn initialize(&mut self) -> Result<()> {
            self.shared.lock().unwrap().initializations += 1;
            Ok(())
        }

        async fn on_tick(&mut self, candle: &Candle, event_time: i64) -> TickOutcome {
            self.event_time = event_time;
            self.shared
                .lock()
                .unwrap()
                .ticks
                .push((self.symbol.clone(), candle.open_time));
            TickOutcome {
                order: None,
                candle_updated: false,
                initial: false,
                decision: self.decision.clone(),
            }
        }

        async fn close_position(&mut self) -> Option<Order> {
            self.shared.lock().unwrap().closes += 1;
            Some(Order {
                id: "close".into(),
                side: Side::Sell,
                requested_qty: dec!(1),
                filled_qty: dec!(1),
                fill_price: dec!(100),
                status: crate::models::OrderStatus::Filled,
                order_price: dec!(100),
            })
        }

        fn report(&self, outcome: &TickOutcome) -> Report {
            self.shared.lock().unwrap().reports += 1;
            Report {
                event_time: self.event_time,
                market: MarketMode::Spot,
                target_asset: "BTC".into(),
                bridge_asset: "USDT".into(),
                moving_average: Decimal::ZERO,
                period_min: Decimal::ZERO,
                period_max: Decimal::ZERO,
                stop_loss: Decimal::ZERO,
                bridge_balance: Decimal::ZERO,
                target_balance: Decimal::ZERO,
                target_borrowed: Decimal::ZERO,
                strategy: "INITIAL".into(),
                order_side: outcome.order.as_ref().map(|o| o.side),
                order_quantity: None,
                order_price: None,
                fill_price: None,
                profit: None,
                total_profit: Decimal::ZERO,
            }
        }
    }

    struct ScriptedStream {
        events: VecDeque<StreamEvent>,
        shared: Shared,
        /// Connects that succeed before every further one is refused
        accepted_connects: u32,
    }

    #[async_trait]
    impl TickSource for ScriptedStream {
        async fn connect(&mut self) -> Result<()> {
            self.shared.lock().unwrap().connects += 1;
            if self.accepted_connects == 0 {
                return Err(BotError::Disconnected("refused".into()));
            }
            self.accepted_connects -= 1;
            Ok(())
        }

        async fn next_event(&mut self) -> StreamEvent {
            self.events.pop_front().unwrap_or(StreamEvent::Finished)
        }

        async fn close(&mut self) {
            self.shared.lock().unwrap().closes_stream += 1;
        }
    }

    struct SharedReports(Arc<Mutex<Vec<Report>>>);

    #[async_trait]
    impl ReportSink for SharedReports {
        async fn emit(&mut self, report: &Report) -> Result<()> {
            self.0.lock().unwrap().push(report.clone());
            Ok(())
        }
    }

    struct CountingKlines(Shared);

    #[async_trait]
    impl KlineSink for CountingKlines {
        async fn store_kline(&mut self, _event: &KlineEvent) -> Result<()> {
            self.0.lock().unwrap().klines += 1;
            Ok(())
        }
    }

    fn kline(symbol: &str, minute: i64) -> StreamEvent {
        let price = dec!(100);
        StreamEvent::Kline(KlineEvent {
            symbol: symbol.to_string(),
            event_time: minute * 60_000 + 1,
            is_closed: false,
            candle: Candle {
                open_time: minute * 60_000,
                open: price,
                high: price,
                low: price,
                close: price,
                volume: dec!(1),
            },
        })
    }

    fn settings() -> ControlSettings {
        ControlSettings {
            backoff_base_secs: 0,
            backoff_max_secs: 0,
            max_reconnect_attempts: 3,
            command_poll_ms: 1,
            ..ControlSettings::default()
        }
    }

    fn controller(
        events: Vec<StreamEvent>,
        commands: Vec<Command>,
        decision: Decision,
    ) -> (Controller<ScriptedStream>, Shared) {
        let shared = Shared::default();
        let stream = ScriptedStream {
            events: events.into(),
            shared: shared.clone(),
            accepted_connects: u32::MAX,
        };
        let mut controller = Controller::new(
            stream,
            Box::new(QueuedCommands::new(commands)),
            Box::new(MemorySink::default()),
            &settings(),
        )
        .with_kline_sink(CountingKlines(shared.clone()));

        for symbol in ["BTCUSDT", "ETHUSDT"] {
            controller.add_pair(Box::new(FakeRunner {
                symbol: symbol.to_string(),
                shared: shared.clone(),
                decision: decision.clone(),
                event_time: 0,
            }));
        }
        (controller, shared)
    }

    #[tokio::test]
    async fn test_dispatch_dedups_per_pair() {
        let events = vec![
            kline("BTCUSDT", 1),
            kline("BTCUSDT", 1),
            kline("ETHUSDT", 1),
            kline("BTCUSDT", 2),
            kline("BTCUSDT", 0),
            kline("DOGEUSDT", 5),
            kline("ETHUSDT", 2),
        ];
        let (mut controller, shared) = controller(events, vec![], Decision::Hold);

        controller.run().await.unwrap();

        let recorded = shared.lock().unwrap();
        assert_eq!(
            recorded.ticks,
            vec![
                ("BTCUSDT".to_string(), 60_000),
                ("ETHUSDT".to_string(), 60_000),
                ("BTCUSDT".to_string(), 120_000),
                ("ETHUSDT".to_string(), 120_000),
            ]
        );
        assert_eq!(recorded.klines, 4);
        assert_eq!(recorded.initializations, 2);
    }

    #[tokio::test]
    async fn test_reconnects_then_resumes() {
        let events = vec![
            kline("BTCUSDT", 1),
            StreamEvent::Disconnected("idle".into()),
            kline("BTCUSDT", 2),
        ];
        let (mut controller, shared) = controller(events, vec![], Decision::Hold);

        controller.run().await.unwrap();

        let recorded = shared.lock().unwrap();
        assert_eq!(recorded.connects, 2);
        assert_eq!(recorded.ticks.len(), 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_reconnects() {
        let (mut controller, shared) = controller(
            vec![StreamEvent::Disconnected("reset".into())],
            vec![],
            Decision::Hold,
        );
        controller.stream.accepted_connects = 1;

        let err = controller.run().await.unwrap_err();

        assert!(matches!(err, BotError::Disconnected(_)));
        assert_eq!(controller.reconnects, 4);
        assert_eq!(shared.lock().unwrap().connects, 4);
    }

    #[tokio::test]
    async fn test_insufficient_funds_starts_cooldown() {
        let events = vec![kline("BTCUSDT", 1), kline("BTCUSDT", 2), kline("BTCUSDT", 3)];
        let (mut controller, shared) = controller(events, vec![], Decision::InsufficientFunds);

        controller.run().await.unwrap();

        let recorded = shared.lock().unwrap();
        assert_eq!(recorded.ticks.len(), 1);
        assert_eq!(recorded.klines, 3);
    }

    #[tokio::test]
    async fn test_stop_closes_positions_and_start_reinitializes() {
        let (mut controller, shared) = controller(vec![], vec![], Decision::Hold);
        controller.initialize_pairs().await.unwrap();
        controller.state = RunState::Running;

        controller.execute(Command::Stop).await.unwrap();
        assert_eq!(controller.state(), RunState::Stopped);
        controller.execute(Command::Stop).await.unwrap();
        controller.execute(Command::Pause).await.unwrap();
        assert_eq!(controller.state(), RunState::Stopped);

        controller.execute(Command::Start).await.unwrap();
        assert_eq!(controller.state(), RunState::Running);

        let recorded = shared.lock().unwrap();
        assert_eq!(recorded.closes, 2);
        assert_eq!(recorded.reports, 2);
        assert_eq!(recorded.closes_stream, 1);
        assert_eq!(recorded.initializations, 4);
        assert_eq!(recorded.connects, 1);
    }

    #[tokio::test]
    async fn test_pause_keeps_positions_and_continue_resumes() {
        let (mut controller, shared) = controller(vec![], vec![], Decision::Hold);
        controller.state = RunState::Running;

        controller.execute(Command::Pause).await.unwrap();
        assert_eq!(controller.state(), RunState::Paused);
        controller.execute(Command::Continue).await.unwrap();
        assert_eq!(controller.state(), RunState::Running);
        controller.execute(Command::Continue).await.unwrap();

        let recorded = shared.lock().unwrap();
        assert_eq!(recorded.closes, 0);
        assert_eq!(recorded.connects, 1);
        assert_eq!(recorded.initializations, 0);
    }

    #[tokio::test]
    async fn test_commands_run_between_ticks() {
        let events = vec![kline("BTCUSDT", 1), kline("BTCUSDT", 2)];
        let (mut controller, shared) =
            controller(events, vec![Command::ClosePosition], Decision::Hold);

        controller.run().await.unwrap();

        let recorded = shared.lock().unwrap();
        assert_eq!(recorded.closes, 2);
        assert_eq!(recorded.ticks.len(), 2);
    }

    #[tokio::test]
    async fn test_close_report_does_not_reuse_tick_time() {
        // A tick stamped ahead of the wall clock
        let tick = kline("BTCUSDT", 40_000_000);
        let (mut controller, _shared) = controller(vec![tick], vec![], Decision::Hold);
        let reports = Arc::new(Mutex::new(Vec::new()));
        controller.reports = Box::new(SharedReports(reports.clone()));

        controller.run().await.unwrap();
        let before = chrono::Utc::now().timestamp_millis();
        controller.execute(Command::ClosePosition).await.unwrap();

        let reports = reports.lock().unwrap();
        // Holding ticks are not reported, so these are the two closes
        assert_eq!(reports.len(), 2);
        assert!(reports[0].event_time > 40_000_000 * 60_000 + 1);
        assert!(reports[1].event_time >= before);
    }
}
