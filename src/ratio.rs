use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::exchange::Kline;
use crate::position::{Direction, PairPosition};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RatioPoint {
    pub start_ms: i64,
    pub ratio: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntryMarker {
    pub start_ms: i64,
    pub ratio: Decimal,
    pub direction: Direction,
    pub trade_id: String,
}

impl EntryMarker {
    pub fn arrow(&self) -> char {
        match self.direction {
            Direction::Long => '↑',
            Direction::Short => '↓',
        }
    }
}

/// `close_b / close_a` for every candle start present in both series.
pub fn pair_ratio_series(klines_a: &[Kline], klines_b: &[Kline]) -> Vec<RatioPoint> {
    let closes_a: HashMap<i64, Decimal> = klines_a.iter().map(|k| (k.start_ms, k.close)).collect();
    let mut series: Vec<RatioPoint> = klines_b
        .iter()
        .filter_map(|kb| {
            let close_a = *closes_a.get(&kb.start_ms)?;
            if close_a.is_zero() {
                return None;
            }
            // a near-zero close overflows the division
            Some(RatioPoint {
                start_ms: kb.start_ms,
                ratio: kb.close.checked_div(close_a)?,
            })
        })
        .collect();
    series.sort_by_key(|p| p.start_ms);
    series.dedup_by_key(|p| p.start_ms);
    series
}

pub fn entry_markers(series: &[RatioPoint], positions: &[PairPosition]) -> Vec<EntryMarker> {
    let by_time: HashMap<i64, Decimal> = series.iter().map(|p| (p.start_ms, p.ratio)).collect();
    positions
        .iter()
        .filter_map(|position| {
            let start_ms = position.opened_at_rounded.timestamp_millis();
            by_time.get(&start_ms).map(|ratio| EntryMarker {
                start_ms,
                ratio: *ratio,
                direction: position.direction,
                trade_id: position.trade_id.clone(),
            })
        })
        .collect()
}

pub fn latest_ratio(series: &[RatioPoint]) -> Option<Decimal> {
    series.last().map(|p| p.ratio)
}

const SPARK_LEVELS: [char; 8] = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];

/// Block-character rendering of the most recent `width` points.
pub fn sparkline(series: &[RatioPoint], width: usize) -> String {
    let tail = &series[series.len().saturating_sub(width)..];
    let (Some(min), Some(max)) = (
        tail.iter().map(|p| p.ratio).min(),
        tail.iter().map(|p| p.ratio).max(),
    ) else {
        return String::new();
    };
    let span = max - min;
    let top = Decimal::from(SPARK_LEVELS.len() - 1);
    tail.iter()
        .map(|p| {
            if span.is_zero() {
                return SPARK_LEVELS[0];
            }
            let level = ((p.ratio - min) / span * top)
                .round()
                .to_usize()
                .unwrap_or(0)
                .min(SPARK_LEVELS.len() - 1);
            SPARK_LEVELS[level]
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn kline(start_ms: i64, close: Decimal) -> Kline {
        Kline {
            start_ms,
            open: close,
            high: close,
            low: close,
            close,
            volume: Decimal::ZERO,
        }
    }

    #[test]
    fn joins_on_start_time_and_sorts() {
        let a = vec![kline(180_000, dec!(4)), kline(60_000, dec!(2)), kline(120_000, dec!(0))];
        let b = vec![kline(60_000, dec!(1)), kline(120_000, dec!(5)), kline(180_000, dec!(2)), kline(240_000, dec!(9))];
        let series = pair_ratio_series(&a, &b);
        assert_eq!(
            series,
            vec![
                RatioPoint { start_ms: 60_000, ratio: dec!(0.5) },
                RatioPoint { start_ms: 180_000, ratio: dec!(0.5) },
            ]
        );
        assert_eq!(latest_ratio(&series), Some(dec!(0.5)));
        assert_eq!(latest_ratio(&[]), None);
    }

    #[test]
    fn overflowing_ratio_is_skipped() {
        let tiny = Decimal::new(1, 28);
        let a = vec![kline(60_000, tiny), kline(120_000, dec!(4))];
        let b = vec![kline(60_000, dec!(1000)), kline(120_000, dec!(2))];
        let series = pair_ratio_series(&a, &b);
        assert_eq!(series, vec![RatioPoint { start_ms: 120_000, ratio: dec!(0.5) }]);
    }

    #[test]
    fn markers_only_on_exact_minute() {
        let opened = Utc.timestamp_millis_opt(1_700_000_075_500).unwrap();
        let long = PairPosition::open(
            Direction::Long,
            "BTCUSDT",
            "ETHUSDT",
            dec!(1),
            dec!(1),
            dec!(1),
            dec!(1),
            opened,
        );
        let series = vec![
            RatioPoint { start_ms: 1_699_999_980_000, ratio: dec!(0.04) },
            RatioPoint { start_ms: 1_700_000_040_000, ratio: dec!(0.05) },
        ];
        let markers = entry_markers(&series, &[long.clone()]);
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].ratio, dec!(0.05));
        assert_eq!(markers[0].arrow(), '↑');

        assert!(entry_markers(&series[..1], &[long]).is_empty());
    }

    #[test]
    fn sparkline_spans_levels() {
        let series: Vec<RatioPoint> = [dec!(1), dec!(2), dec!(8), dec!(1)]
            .iter()
            .enumerate()
            .map(|(i, r)| RatioPoint { start_ms: i as i64 * 60_000, ratio: *r })
            .collect();
        assert_eq!(sparkline(&series, 10), "▁▂█▁");
        assert_eq!(sparkline(&series, 2), "█▁");
        assert_eq!(sparkline(&[], 5), "");
    }
}
