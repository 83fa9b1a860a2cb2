use rust_decimal::Decimal;

/// Calculate Simple Moving Average (SMA) over the last `period` values
pub fn calculate_sma(values: &[Decimal], period: usize) -> Option<Decimal> {
    if period == 0 || values.len() < period {
        return None;
    }

    let sum: Decimal = values.iter().rev().take(period).sum();
    Some(sum / Decimal::from(period))
}
