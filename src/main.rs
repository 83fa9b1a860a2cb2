use anyhow::{Context, Result};
use bridgebot::api::{BinanceClient, BinanceKlineStream};
use bridgebot::config::Settings;
use bridgebot::control::{Command, Controller};
use bridgebot::execution::{OrderExecutor, RetryPolicy};
use bridgebot::persistence::RedisPersistence;
use bridgebot::report::{LogSink, MultiSink};
use bridgebot::strategy;
use bridgebot::MarketMode;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bridgebot", version, about = "Breakout trading bot for Binance spot and margin")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the live trading loop
    Run,
    /// Queue a command for a running bot: start, stop, pause, continue or close-position
    Send {
        command: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    let settings = Settings::load().context("Failed to load settings")?;

    match cli.command {
        Commands::Run => run(settings).await,
        Commands::Send { command } => send(&settings, &command).await,
    }
}

// ============================================================================
// Initialization Functions
// ============================================================================

fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("bridgebot=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn connect_to_redis(settings: &Settings) -> Result<RedisPersistence> {
    let mut redis = RedisPersistence::new(&settings.redis_url)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", settings.redis_url))?;

    if settings.clear_db {
        let removed = redis.clear().await?;
        tracing::info!("🧹 Cleared {} keys from previous runs", removed);
    }

    Ok(redis)
}

fn build_controller(
    settings: &Settings,
    client: &BinanceClient,
    redis: &RedisPersistence,
) -> Result<Controller<BinanceKlineStream>> {
    let markets = settings.markets();
    let symbols: Vec<String> = markets.iter().map(|(_, pair)| pair.symbol()).collect();

    let stream = BinanceKlineStream::new(
        &settings.binance.ws_base_url,
        &symbols,
        settings.control.idle_timeout(),
    );
    let reports = MultiSink::new().with(LogSink).with(redis.clone());

    let mut controller = Controller::new(
        stream,
        Box::new(redis.clone()),
        Box::new(reports),
        &settings.control,
    )
    .with_kline_sink(redis.clone());

    let policy = RetryPolicy::from(&settings.execution);
    for (mode, pair) in markets {
        let executor = OrderExecutor::new(client.clone(), pair.clone(), mode, policy);
        match mode {
            MarketMode::Spot => {
                controller.add_pair(Box::new(strategy::spot_machine(executor, &settings.strategy)?))
            }
            MarketMode::Margin => {
                controller.add_pair(Box::new(strategy::margin_machine(executor, &settings.strategy)?))
            }
        }
        tracing::info!("  {} {}", mode, pair);
    }

    Ok(controller)
}

// ============================================================================
// Commands
// ============================================================================

async fn run(settings: Settings) -> Result<()> {
    tracing::info!("🚀 bridgebot starting ({} market)", settings.market);

    let client = BinanceClient::new(&settings.binance).context("Failed to build Binance client")?;
    let mut redis = connect_to_redis(&settings).await?;
    redis
        .register_market(&settings.market.to_string(), &settings.markets())
        .await?;

    tracing::info!("\n📊 Configuration:");
    tracing::info!("  SMA period: {} x {}", settings.strategy.sma_period, settings.strategy.period_interval);
    tracing::info!("  Working balance: {}", settings.strategy.working_balance);
    tracing::info!("  Steps: {}", settings.strategy.steps.len());
    let mut controller = build_controller(&settings, &client, &redis)?;

    tracing::info!("\nPress Ctrl+C to stop...\n");

    tokio::select! {
        result = controller.run() => {
            result.context("Live loop failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("\n⚠️  Received Ctrl+C, shutting down...");
        }
    }

    controller.shutdown().await;
    tracing::info!("👋 bridgebot stopped");
    Ok(())
}

async fn send(settings: &Settings, raw: &str) -> Result<()> {
    let command: Command = raw.parse()?;
    let mut redis = RedisPersistence::new(&settings.redis_url)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", settings.redis_url))?;

    let id = redis.push_command(command).await?;
    println!("Queued {} as task {}", command, id);
    Ok(())
}
