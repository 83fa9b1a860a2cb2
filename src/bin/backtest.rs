use anyhow::{bail, Context, Result};
use bridgebot::api::BinanceClient;
use bridgebot::backtest::{
    aggregate_candles, load_klines_csv, write_klines_csv, BacktestRunner, BacktestSummary,
    MarketScenario, SyntheticDataGenerator,
};
use bridgebot::config::{Settings, MINUTE_MS};
use bridgebot::{Candle, MarketMode, Pair};
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// Replay recorded or synthetic candles through the strategy
#[derive(Parser)]
#[command(name = "backtest", version)]
struct Args {
    /// Market to replay: spot or margin
    #[arg(long, default_value = "spot")]
    market: String,

    /// Minute klines CSV (defaults to the file under backtest.data_dir)
    #[arg(long)]
    minute_csv: Option<PathBuf>,

    /// Period klines CSV (defaults to the file under backtest.data_dir)
    #[arg(long)]
    period_csv: Option<PathBuf>,

    /// Write one row per tick to this CSV
    #[arg(long)]
    report_csv: Option<PathBuf>,

    /// Download missing kline files from Binance first
    #[arg(long, default_value_t = false)]
    download: bool,

    /// Use a synthetic scenario instead of recorded data (or "all")
    #[arg(long)]
    synthetic: Option<String>,

    /// Seed for synthetic data
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Length of synthetic data in days
    #[arg(long, default_value_t = 7)]
    days: usize,
}

fn parse_market(raw: &str) -> Result<MarketMode> {
    match raw.to_lowercase().as_str() {
        "spot" => Ok(MarketMode::Spot),
        "margin" => Ok(MarketMode::Margin),
        other => bail!("unknown market {:?}, expected spot or margin", other),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("bridgebot=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let settings = Settings::load().context("Failed to load settings")?;
    let mode = parse_market(&args.market)?;
    let pair = settings.pair_for(mode);
    let period_ms = settings.strategy.period_ms()?;

    println!("\n╔═══════════════════════════════════════════════════════╗");
    println!("║            BRIDGEBOT BACKTESTING SUITE                ║");
    println!("╚═══════════════════════════════════════════════════════╝");

    let mut runner = BacktestRunner::new(
        mode,
        pair.clone(),
        settings.strategy.clone(),
        settings.backtest.clone(),
    );
    if let Some(path) = &args.report_csv {
        runner = runner.with_report_csv(path);
    }

    match args.synthetic.as_deref() {
        Some("all") => {
            let mut results = Vec::new();
            for scenario in MarketScenario::ALL {
                let (minutes, periods) = synthetic_data(scenario, args.seed, args.days, period_ms);
                match runner
                    .run_and_report(minutes, periods, &scenario.to_string())
                    .await
                {
                    Ok(summary) => results.push((scenario.to_string(), summary)),
                    Err(e) => eprintln!("❌ Backtest failed for {}: {}", scenario, e),
                }
            }
            print_summary_comparison(&results);
        }
        Some(name) => {
            let scenario: MarketScenario = name.parse().map_err(anyhow::Error::msg)?;
            let (minutes, periods) = synthetic_data(scenario, args.seed, args.days, period_ms);
            runner
                .run_and_report(minutes, periods, &scenario.to_string())
                .await?;
        }
        None => {
            let minute_csv = args
                .minute_csv
                .clone()
                .unwrap_or_else(|| settings.backtest.minute_csv(&pair));
            let period_csv = args
                .period_csv
                .clone()
                .unwrap_or_else(|| {
                    settings
                        .backtest
                        .period_csv(&pair, &settings.strategy.period_interval)
                });

            if args.download {
                download_missing(&settings, &pair, &minute_csv, &period_csv).await?;
            }

            let minutes = load_klines_csv(&minute_csv)
                .with_context(|| format!("Failed to load {}", minute_csv.display()))?;
            let periods = load_klines_csv(&period_csv)
                .with_context(|| format!("Failed to load {}", period_csv.display()))?;
            runner
                .run_and_report(minutes, periods, &minute_csv.display().to_string())
                .await?;
        }
    }

    Ok(())
}

fn synthetic_data(
    scenario: MarketScenario,
    seed: u64,
    days: usize,
    period_ms: i64,
) -> (Vec<Candle>, Vec<Candle>) {
    let mut generator = SyntheticDataGenerator::new(seed);
    let minutes = generator.generate(scenario, days * 24 * 60);
    let periods = aggregate_candles(&minutes, period_ms);
    (minutes, periods)
}

async fn download_missing(
    settings: &Settings,
    pair: &Pair,
    minute_csv: &Path,
    period_csv: &Path,
) -> Result<()> {
    let client = BinanceClient::new(&settings.binance)?;
    let period_ms = settings.strategy.period_ms()?;
    let end = chrono::Utc::now().timestamp_millis();
    let start = end - i64::from(settings.backtest.history_months) * 30 * 24 * 60 * MINUTE_MS;

    for (path, interval, period_ms) in [
        (minute_csv, "1m", MINUTE_MS),
        (period_csv, settings.strategy.period_interval.as_str(), period_ms),
    ] {
        if path.exists() {
            tracing::info!("{} already present, skipping download", path.display());
            continue;
        }
        tracing::info!("Downloading {} {} klines for {}", interval, pair, path.display());
        let candles = client.download_klines(pair, interval, start, end).await?;
        write_klines_csv(path, &candles, period_ms)?;
        tracing::info!("Saved {} candles to {}", candles.len(), path.display());
    }

    Ok(())
}

fn print_summary_comparison(results: &[(String, BacktestSummary)]) {
    println!("\n╔═══════════════════════════════════════════════════════╗");
    println!("║              SCENARIO COMPARISON                      ║");
    println!("╚═══════════════════════════════════════════════════════╝\n");

    println!(
        "{:<14} {:>12} {:>10} {:>8} {:>8}",
        "Scenario", "Profit", "Return%", "Trades", "Win%"
    );
    println!("{}", "─".repeat(56));

    for (name, summary) in results {
        println!(
            "{:<14} {:>12} {:>10} {:>8} {:>8}",
            name,
            summary.total_profit.round_dp(2),
            summary.return_pct.round_dp(2),
            summary.total_trades,
            summary.win_rate.round_dp(1)
        );
    }

    println!("\n");
}
