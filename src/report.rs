use crate::models::{MarketMode, Side};
use crate::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Snapshot of a pair emitted on reportable ticks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub event_time: i64,
    pub market: MarketMode,
    pub target_asset: String,
    pub bridge_asset: String,
    pub moving_average: Decimal,
    pub period_min: Decimal,
    pub period_max: Decimal,
    pub stop_loss: Decimal,
    pub bridge_balance: Decimal,
    pub target_balance: Decimal,
    pub target_borrowed: Decimal,
    pub strategy: String,
    pub order_side: Option<Side>,
    pub order_quantity: Option<Decimal>,
    /// Quote notional of the order
    pub order_price: Option<Decimal>,
    pub fill_price: Option<Decimal>,
    pub profit: Option<Decimal>,
    pub total_profit: Decimal,
}

impl Report {
    pub fn symbol(&self) -> String {
        format!("{}{}", self.target_asset, self.bridge_asset)
    }
}

fn or_dash<T: fmt::Display>(value: &Option<T>) -> String {
    value
        .as_ref()
        .map(|v| v.to_string())
        .unwrap_or_else(|| "-".to_string())
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target_balance = match self.market {
            MarketMode::Spot => self.target_balance.to_string(),
            MarketMode::Margin => format!(
                "free: {} | borrowed: {}",
                self.target_balance, self.target_borrowed
            ),
        };

        writeln!(f)?;
        writeln!(f, "{} | {}/{}", self.market, self.target_asset, self.bridge_asset)?;
        writeln!(f)?;
        writeln!(f, "Unix time: {}", self.event_time)?;
        writeln!(f)?;
        writeln!(f, "MA: {}", self.moving_average.round_dp(8))?;
        writeln!(f, "Min: {}", self.period_min)?;
        writeln!(f, "Max: {}", self.period_max)?;
        writeln!(f, "Stop loss: {}", self.stop_loss.round_dp(8))?;
        writeln!(f)?;
        writeln!(f, "Cash({}): {}", self.bridge_asset, self.bridge_balance)?;
        writeln!(f, "{}: {}", self.target_asset, target_balance)?;
        writeln!(f)?;
        writeln!(f, "Current strategy: {}", self.strategy)?;
        writeln!(f, "Activity: {}", or_dash(&self.order_side))?;
        writeln!(f, "Quantity: {}", or_dash(&self.order_quantity))?;
        writeln!(f, "Price({}): {}", self.bridge_asset, or_dash(&self.order_price))?;
        writeln!(
            f,
            "Market position price({}): {}",
            self.bridge_asset,
            or_dash(&self.fill_price)
        )?;
        writeln!(f, "Profit({}): {}", self.bridge_asset, or_dash(&self.profit))?;
        write!(f, "Total profit: {}", self.total_profit)
    }
}

/// Destination for reports
#[async_trait]
pub trait ReportSink: Send {
    async fn emit(&mut self, report: &Report) -> Result<()>;
}

/// Writes every report to the log
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl ReportSink for LogSink {
    async fn emit(&mut self, report: &Report) -> Result<()> {
        tracing::info!("{}", report);
        Ok(())
    }
}

/// Keeps reports in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    pub reports: Vec<Report>,
}

#[async_trait]
impl ReportSink for MemorySink {
    async fn emit(&mut self, report: &Report) -> Result<()> {
        self.reports.push(report.clone());
        Ok(())
    }
}

/// Fans a report out to several sinks; a failing sink does not stop the others
#[derive(Default)]
pub struct MultiSink {
    sinks: Vec<Box<dyn ReportSink>>,
}

impl MultiSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl ReportSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

#[async_trait]
impl ReportSink for MultiSink {
    async fn emit(&mut self, report: &Report) -> Result<()> {
        for sink in self.sinks.iter_mut() {
            if let Err(e) = sink.emit(report).await {
                tracing::warn!("Report sink failed for {}: {}", report.symbol(), e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample(market: MarketMode) -> Report {
        Report {
            event_time: 1_700_000_000_000,
            market,
            target_asset: "BTC".to_string(),
            bridge_asset: "USDT".to_string(),
            moving_average: dec!(20000),
            period_min: dec!(19500),
            period_max: dec!(20500),
            stop_loss: dec!(0),
            bridge_balance: dec!(40),
            target_balance: dec!(0.0005),
            target_borrowed: dec!(0.0002),
            strategy: "FIRST_STEP".to_string(),
            order_side: Some(Side::Buy),
            order_quantity: Some(dec!(0.0005)),
            order_price: Some(dec!(10)),
            fill_price: Some(dec!(20000)),
            profit: None,
            total_profit: dec!(0),
        }
    }

    #[test]
    fn test_display_uses_dash_for_missing_values() {
        let text = sample(MarketMode::Spot).to_string();
        assert!(text.contains("SPOT | BTC/USDT"));
        assert!(text.contains("Activity: BUY"));
        assert!(text.contains("Profit(USDT): -"));
        assert!(text.contains("BTC: 0.0005\n"));
    }

    #[test]
    fn test_margin_display_shows_borrowed() {
        let text = sample(MarketMode::Margin).to_string();
        assert!(text.contains("BTC: free: 0.0005 | borrowed: 0.0002"));
    }

    #[tokio::test]
    async fn test_multi_sink_forwards_to_all() {
        let mut sink = MultiSink::new().with(LogSink).with(MemorySink::default());
        sink.emit(&sample(MarketMode::Spot)).await.unwrap();
        assert_eq!(sink.sinks.len(), 2);
    }

    #[test]
    fn test_report_serializes_side_uppercase() {
        let json = serde_json::to_value(sample(MarketMode::Spot)).unwrap();
        assert_eq!(json["order_side"], "BUY");
        assert_eq!(json["market"], "spot");
    }
}
