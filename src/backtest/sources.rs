use crate::error::BotError;
use crate::models::Candle;
use crate::Result;
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;

/// Load candles from a Binance kline CSV
///
/// Rows are raw exchange klines without a header:
/// `open_time, open, high, low, close, volume, close_time, ...`.
/// Columns past the volume are ignored.
pub fn load_klines_csv(path: impl AsRef<Path>) -> Result<Vec<Candle>> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;

    let mut candles = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        let candle = parse_kline_row(&record).map_err(|e| {
            BotError::Config(format!("{}:{}: {}", path.display(), line + 1, e))
        })?;
        candles.push(candle);
    }

    tracing::info!("Loaded {} candles from {}", candles.len(), path.display());
    Ok(candles)
}

fn column(record: &csv::StringRecord, i: usize) -> Result<&str> {
    record
        .get(i)
        .map(str::trim)
        .ok_or_else(|| BotError::Config(format!("missing column {}", i)))
}

fn parse_kline_row(record: &csv::StringRecord) -> Result<Candle> {
    let field = |i: usize| column(record, i);

    let open_time = field(0)?
        .parse::<i64>()
        .map_err(|e| BotError::Config(format!("bad open time: {}", e)))?;

    Ok(Candle {
        open_time,
        open: Decimal::from_str(field(1)?)?,
        high: Decimal::from_str(field(2)?)?,
        low: Decimal::from_str(field(3)?)?,
        close: Decimal::from_str(field(4)?)?,
        volume: Decimal::from_str(field(5)?)?,
    })
}

/// Write candles in the same headerless kline layout, creating parent dirs
pub fn write_klines_csv(path: impl AsRef<Path>, candles: &[Candle], period_ms: i64) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)?;
    for c in candles {
        writer.write_record([
            c.open_time.to_string(),
            c.open.to_string(),
            c.high.to_string(),
            c.low.to_string(),
            c.close.to_string(),
            c.volume.to_string(),
            (c.open_time + period_ms - 1).to_string(),
        ])?;
    }
    writer.flush()?;

    tracing::info!("Wrote {} candles to {}", candles.len(), path.display());
    Ok(())
}

/// Roll fine candles up into `period_ms` buckets aligned on the epoch
///
/// Input must be sorted by open time.
pub fn aggregate_candles(candles: &[Candle], period_ms: i64) -> Vec<Candle> {
    let mut periods: Vec<Candle> = Vec::new();

    for c in candles {
        let bucket = c.open_time - c.open_time.rem_euclid(period_ms);
        match periods.last_mut() {
            Some(p) if p.open_time == bucket => {
                p.high = p.high.max(c.high);
                p.low = p.low.min(c.low);
                p.close = c.close;
                p.volume += c.volume;
            }
            _ => periods.push(Candle {
                open_time: bucket,
                ..c.clone()
            }),
        }
    }

    periods
}
