use crate::candle_utils::{floor_to_timeframe, timeframe_to_duration, timeframe_to_minutes};
use crate::models::{Candle, Trade};
use anyhow::Result;
use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Decimal places looked at when counting significant digits.
const PRICE_PRECISION_DIGITS: usize = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ParallelismRow {
    pub date: DateTime<Utc>,
    pub open_trades: usize,
}

/// Open-trade count per timeframe bucket. A trade occupies every candle from
/// its open date up to, but excluding, its close date. Buckets between the
/// first and last occupied one are reported even when empty.
pub fn analyze_trade_parallelism(trades: &[Trade], timeframe: &str) -> Result<Vec<ParallelismRow>> {
    let minutes = timeframe_to_minutes(timeframe)?;
    let step = timeframe_to_duration(timeframe)?;
    let mut counts: BTreeMap<DateTime<Utc>, usize> = BTreeMap::new();

    for trade in trades {
        let Some(close_date) = trade.close_date else {
            continue;
        };
        let mut date = trade.open_date;
        while date < close_date {
            *counts.entry(floor_to_timeframe(date, minutes)).or_default() += 1;
            date += step;
        }
    }

    let (Some(&first), Some(&last)) = (counts.keys().next(), counts.keys().next_back()) else {
        return Ok(Vec::new());
    };
    let mut rows = Vec::new();
    let mut bucket = first;
    while bucket <= last {
        rows.push(ParallelismRow {
            date: bucket,
            open_trades: counts.get(&bucket).copied().unwrap_or(0),
        });
        bucket += step;
    }
    Ok(rows)
}

/// Buckets where more trades were open than `max_open_trades` allows.
/// `None` means unlimited and never reports anything.
pub fn evaluate_result_multi(
    trades: &[Trade],
    timeframe: &str,
    max_open_trades: Option<usize>,
) -> Result<Vec<ParallelismRow>> {
    let Some(limit) = max_open_trades else {
        return Ok(Vec::new());
    };
    Ok(analyze_trade_parallelism(trades, timeframe)?
        .into_iter()
        .filter(|row| row.open_trades > limit)
        .collect())
}

fn significant_decimals(price: f64) -> usize {
    let formatted = format!("{:.*}", PRICE_PRECISION_DIGITS, price);
    match formatted.split_once('.') {
        Some((_, decimals)) => decimals.trim_end_matches('0').len(),
        None => 0,
    }
}

fn month_start(date: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Utc.with_ymd_and_hms(date.year(), date.month(), 1, 0, 0, 0)
        .single()
}

/// Price step observed per calendar month: `10^-n` where `n` is the most
/// significant decimals any OHLC price of that month carries.
pub fn get_tick_size_over_time(candles: &[Candle]) -> BTreeMap<DateTime<Utc>, f64> {
    let mut digits: BTreeMap<DateTime<Utc>, usize> = BTreeMap::new();
    for candle in candles {
        let Some(month) = month_start(candle.date) else {
            continue;
        };
        let count = [candle.open, candle.high, candle.low, candle.close]
            .into_iter()
            .map(significant_decimals)
            .max()
            .unwrap_or(0);
        let entry = digits.entry(month).or_default();
        *entry = (*entry).max(count);
    }
    digits
        .into_iter()
        .map(|(month, count)| (month, 10f64.powi(-(count as i32))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MarginMode, TradeId, TradingMode};
    use chrono::Duration;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, hour, minute, 0).unwrap()
    }

    fn trade(open: DateTime<Utc>, close: DateTime<Utc>) -> Trade {
        Trade {
            id: TradeId(0),
            pair: "BTC/USDT".to_string(),
            is_short: false,
            is_open: false,
            open_date: open,
            close_date: Some(close),
            open_rate: 100.0,
            close_rate: Some(101.0),
            amount: 1.0,
            stake_amount: 100.0,
            leverage: 1.0,
            trading_mode: TradingMode::Spot,
            margin_mode: MarginMode::Isolated,
            fee_open: 0.0,
            fee_close: 0.0,
            funding_fees: 0.0,
            close_profit: Some(0.01),
            close_profit_abs: Some(1.0),
            stop_loss: 90.0,
            stop_loss_pct: -0.1,
            initial_stop_loss: 90.0,
            initial_stop_loss_pct: Some(-0.1),
            is_stop_loss_trailing: false,
            max_rate: 101.0,
            min_rate: 100.0,
            liquidation_price: None,
            exit_type: None,
            exit_reason: None,
            enter_tag: None,
            orders: Vec::new(),
        }
    }

    #[test]
    fn overlapping_trades_are_counted_per_candle() {
        let trades = vec![
            trade(at(0, 0), at(0, 15)),
            trade(at(0, 5), at(0, 10)),
            trade(at(0, 25), at(0, 30)),
        ];
        let rows = analyze_trade_parallelism(&trades, "5m").unwrap();
        let counts: Vec<usize> = rows.iter().map(|r| r.open_trades).collect();
        assert_eq!(rows.first().map(|r| r.date), Some(at(0, 0)));
        // 00:00, 00:05, 00:10, 00:15 (gap), 00:20 (gap), 00:25
        assert_eq!(counts, vec![1, 2, 1, 0, 0, 1]);

        let over = evaluate_result_multi(&trades, "5m", Some(1)).unwrap();
        assert_eq!(over.len(), 1);
        assert_eq!(over[0].date, at(0, 5));
        assert!(evaluate_result_multi(&trades, "5m", None).unwrap().is_empty());
    }

    #[test]
    fn zero_length_trade_occupies_nothing() {
        let rows = analyze_trade_parallelism(&[trade(at(1, 0), at(1, 0))], "5m").unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn tick_size_uses_monthly_maximum_precision() {
        let candle = |date: DateTime<Utc>, price: f64| Candle {
            date,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 1.0,
        };
        let jan = Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap();
        let feb = Utc.with_ymd_and_hms(2024, 2, 10, 0, 0, 0).unwrap();
        let ticks = get_tick_size_over_time(&[
            candle(jan, 1.25),
            candle(jan + Duration::days(1), 1.125),
            candle(feb, 42.0),
        ]);
        let values: Vec<f64> = ticks.values().copied().collect();
        assert_eq!(ticks.len(), 2);
        assert!((values[0] - 0.001).abs() < 1e-12);
        assert!((values[1] - 1.0).abs() < 1e-12);
    }
}
