use crate::config::ExtremaSource;
use crate::models::Candle;
use rust_decimal::Decimal;

/// Highest and lowest price over a window of candles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PriceRange {
    pub max: Decimal,
    pub min: Decimal,
}

/// Compute the period range, or `None` for an empty window
///
/// `Close` uses closing prices on both sides; `HighLow` takes the max over
/// highs and the min over lows.
pub fn price_range<'a, I>(candles: I, source: ExtremaSource) -> Option<PriceRange>
where
    I: IntoIterator<Item = &'a Candle>,
{
    candles.into_iter().fold(None, |acc, candle| {
        let (hi, lo) = match source {
            ExtremaSource::Close => (candle.close, candle.close),
            ExtremaSource::HighLow => (candle.high, candle.low),
        };
        Some(match acc {
            None => PriceRange { max: hi, min: lo },
            Some(range) => PriceRange {
                max: range.max.max(hi),
                min: range.min.min(lo),
            },
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn candle(close: Decimal, high: Decimal, low: Decimal) -> Candle {
        Candle {
            open_time: 0,
            open: close,
            high,
            low,
            close,
            volume: Decimal::ZERO,
        }
    }

    #[test]
    fn test_close_range() {
        let candles = vec![
            candle(dec!(10), dec!(12), dec!(9)),
            candle(dec!(14), dec!(15), dec!(13)),
            candle(dec!(11), dec!(11.5), dec!(8)),
        ];
        let range = price_range(&candles, ExtremaSource::Close).unwrap();
        assert_eq!(range.max, dec!(14));
        assert_eq!(range.min, dec!(10));
    }

    #[test]
    fn test_high_low_range() {
        let candles = vec![
            candle(dec!(10), dec!(12), dec!(9)),
            candle(dec!(14), dec!(15), dec!(13)),
            candle(dec!(11), dec!(11.5), dec!(8)),
        ];
        let range = price_range(&candles, ExtremaSource::HighLow).unwrap();
        assert_eq!(range.max, dec!(15));
        assert_eq!(range.min, dec!(8));
    }

    #[test]
    fn test_empty_window() {
        let candles: Vec<Candle> = Vec::new();
        assert!(price_range(&candles, ExtremaSource::Close).is_none());
    }
}
