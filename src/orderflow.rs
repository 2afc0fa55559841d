use crate::candle_utils::{floor_to_timeframe, timeframe_to_minutes};
use crate::config::OrderflowConfig;
use crate::error::EngineError;
use crate::strategy::SignalFrame;
use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, TimeZone, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

/// Numeric columns added to a frame by [`populate_with_trades`].
///
/// `imbalances_*` count imbalanced levels in the candle. `stacked_imbalances_*`
/// hold the lowest start price of a stacked run, or NaN when there is none.
pub const ORDERFLOW_COLUMNS: [&str; 10] = [
    "bid",
    "ask",
    "delta",
    "min_delta",
    "max_delta",
    "total_trades",
    "imbalances_bid",
    "imbalances_ask",
    "stacked_imbalances_bid",
    "stacked_imbalances_ask",
];

/// One public trade print.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradePrint {
    /// Milliseconds since the epoch.
    pub timestamp: i64,
    pub price: f64,
    pub amount: f64,
    pub side: String,
}

impl TradePrint {
    fn is_sell(&self) -> bool {
        self.side.contains("sell")
    }

    fn is_buy(&self) -> bool {
        self.side.contains("buy")
    }

    fn date(&self) -> Result<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.timestamp)
            .single()
            .ok_or_else(|| anyhow!("Invalid trade timestamp {}", self.timestamp))
    }
}

/// Volume traded at one price level of a candle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VolumeLevel {
    pub price: f64,
    /// Sell prints at this level.
    pub bid: usize,
    /// Buy prints at this level.
    pub ask: usize,
    pub bid_amount: f64,
    pub ask_amount: f64,
    pub delta: f64,
    pub total_volume: f64,
    pub total_trades: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Imbalance {
    pub price: f64,
    pub bid_imbalance: bool,
    pub ask_imbalance: bool,
}

/// Order-flow summary of one candle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandleOrderflow {
    pub date: DateTime<Utc>,
    pub bid: f64,
    pub ask: f64,
    pub delta: f64,
    pub min_delta: f64,
    pub max_delta: f64,
    pub total_trades: usize,
    pub levels: Vec<VolumeLevel>,
    pub imbalances: Vec<Imbalance>,
    pub stacked_imbalances_bid: Vec<f64>,
    pub stacked_imbalances_ask: Vec<f64>,
}

impl CandleOrderflow {
    fn column_value(&self, column: &str) -> f64 {
        match column {
            "bid" => self.bid,
            "ask" => self.ask,
            "delta" => self.delta,
            "min_delta" => self.min_delta,
            "max_delta" => self.max_delta,
            "total_trades" => self.total_trades as f64,
            "imbalances_bid" => self.imbalances.iter().filter(|i| i.bid_imbalance).count() as f64,
            "imbalances_ask" => self.imbalances.iter().filter(|i| i.ask_imbalance).count() as f64,
            "stacked_imbalances_bid" => self.stacked_imbalances_bid.first().copied().unwrap_or(f64::NAN),
            "stacked_imbalances_ask" => self.stacked_imbalances_ask.first().copied().unwrap_or(f64::NAN),
            _ => f64::NAN,
        }
    }
}

/// Bins prints into price levels of width `scale`, ascending by price.
pub fn volume_profile(trades: &[&TradePrint], scale: f64) -> Vec<VolumeLevel> {
    let mut levels: BTreeMap<i64, VolumeLevel> = BTreeMap::new();
    for trade in trades {
        let step = (trade.price / scale).round() as i64;
        let level = levels.entry(step).or_insert_with(|| VolumeLevel {
            price: step as f64 * scale,
            ..VolumeLevel::default()
        });
        if trade.is_sell() {
            level.bid += 1;
            level.bid_amount += trade.amount;
        }
        if trade.is_buy() {
            level.ask += 1;
            level.ask_amount += trade.amount;
        }
    }
    levels
        .into_values()
        .map(|mut level| {
            level.delta = level.ask_amount - level.bid_amount;
            level.total_volume = level.ask_amount + level.bid_amount;
            level.total_trades = level.ask + level.bid;
            level
        })
        .collect()
}

/// Compares each level's bids with the asks one level up. Levels below
/// `imbalance_volume` never count as imbalanced.
pub fn imbalances(levels: &[VolumeLevel], imbalance_ratio: f64, imbalance_volume: f64) -> Vec<Imbalance> {
    levels
        .iter()
        .enumerate()
        .map(|(i, level)| {
            let bid = level.bid as f64;
            let ask_above = levels.get(i + 1).map_or(f64::NAN, |next| next.ask as f64);
            let enough_volume = level.total_volume >= imbalance_volume;
            Imbalance {
                price: level.price,
                bid_imbalance: enough_volume && bid / ask_above > imbalance_ratio,
                ask_imbalance: enough_volume && ask_above / bid > imbalance_ratio,
            }
        })
        .collect()
}

/// Start prices of every run of at least `range` consecutive imbalanced levels.
pub fn stacked_imbalance(imbalances: &[Imbalance], bid_side: bool, range: usize) -> Vec<f64> {
    let range = range.max(1);
    let mut prices = Vec::new();
    let mut run = 0;
    for (i, imbalance) in imbalances.iter().enumerate() {
        let flagged = if bid_side {
            imbalance.bid_imbalance
        } else {
            imbalance.ask_imbalance
        };
        run = if flagged { run + 1 } else { 0 };
        if run >= range {
            prices.push(imbalances[i + 1 - range].price);
        }
    }
    prices
}

fn summarize_candle(
    date: DateTime<Utc>,
    trades: &[&TradePrint],
    config: &OrderflowConfig,
) -> CandleOrderflow {
    let levels = volume_profile(trades, config.scale);
    let imbalances = imbalances(&levels, config.imbalance_ratio, config.imbalance_volume);
    let (mut bid, mut ask) = (0.0, 0.0);
    let (mut min_delta, mut max_delta) = (f64::INFINITY, f64::NEG_INFINITY);
    let mut cumulative = 0.0;
    for trade in trades {
        let sold = if trade.is_sell() { trade.amount } else { 0.0 };
        let bought = if trade.is_buy() { trade.amount } else { 0.0 };
        bid += sold;
        ask += bought;
        cumulative += bought - sold;
        min_delta = min_delta.min(cumulative);
        max_delta = max_delta.max(cumulative);
    }
    CandleOrderflow {
        date,
        bid,
        ask,
        delta: ask - bid,
        min_delta,
        max_delta,
        total_trades: trades.len(),
        stacked_imbalances_bid: stacked_imbalance(&imbalances, true, config.stacked_imbalance_range),
        stacked_imbalances_ask: stacked_imbalance(&imbalances, false, config.stacked_imbalance_range),
        levels,
        imbalances,
    }
}

fn aggregate(
    frame: &mut SignalFrame,
    trades: &[TradePrint],
    timeframe: &str,
    config: &OrderflowConfig,
) -> Result<Vec<Option<CandleOrderflow>>> {
    if !(config.scale.is_finite() && config.scale > 0.0) {
        bail!("Order flow scale must be positive, got {}", config.scale);
    }
    let minutes = timeframe_to_minutes(timeframe)?;
    let n = frame.len();
    let mut summaries: Vec<Option<CandleOrderflow>> = vec![None; n];
    let first_row = n.saturating_sub(config.max_candles.max(1));
    let Some(start_date) = frame.candles.get(first_row).map(|c| c.date) else {
        return Ok(summaries);
    };
    let rows: HashMap<DateTime<Utc>, usize> = frame
        .candles
        .iter()
        .enumerate()
        .map(|(i, candle)| (candle.date, i))
        .collect();

    let mut grouped: BTreeMap<DateTime<Utc>, Vec<&TradePrint>> = BTreeMap::new();
    for trade in trades {
        if !trade.price.is_finite() || !trade.amount.is_finite() {
            bail!("Malformed trade print at {}: {:?}", trade.timestamp, trade);
        }
        let candle_start = floor_to_timeframe(trade.date()?, minutes);
        if candle_start >= start_date {
            grouped.entry(candle_start).or_default().push(trade);
        }
    }

    for (candle_start, group) in grouped {
        if let Some(&row) = rows.get(&candle_start) {
            summaries[row] = Some(summarize_candle(candle_start, &group, config));
        }
    }

    for column in ORDERFLOW_COLUMNS {
        let values: Vec<f64> = summaries
            .iter()
            .map(|summary| summary.as_ref().map_or(f64::NAN, |s| s.column_value(column)))
            .collect();
        frame.set_column(column, values);
    }
    Ok(summaries)
}

/// Buckets `trades` into the frame's candles and adds the order-flow columns.
/// Candles without prints get NaN. Returns the per-candle details.
pub fn populate_with_trades(
    frame: &mut SignalFrame,
    trades: &[TradePrint],
    timeframe: &str,
    config: &OrderflowConfig,
) -> Result<Vec<Option<CandleOrderflow>>> {
    let started = Instant::now();
    let summaries = aggregate(frame, trades, timeframe, config)
        .map_err(|err| EngineError::dependency("Error populating dataframe with trades", err))?;
    debug!(
        "Grouped {} trade prints in {:.3}s",
        trades.len(),
        started.elapsed().as_secs_f64()
    );
    Ok(summaries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::engine_error;
    use crate::models::Candle;
    use chrono::Duration;
    use std::sync::Arc;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn frame(n: usize) -> SignalFrame {
        let candles = (0..n)
            .map(|i| Candle {
                date: base() + Duration::minutes(5 * i as i64),
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.0,
                volume: 10.0,
            })
            .collect();
        SignalFrame::new(Arc::new(candles))
    }

    fn print(offset_secs: i64, price: f64, amount: f64, side: &str) -> TradePrint {
        TradePrint {
            timestamp: (base() + Duration::seconds(offset_secs)).timestamp_millis(),
            price,
            amount,
            side: side.to_string(),
        }
    }

    #[test]
    fn candles_get_bid_ask_and_delta() {
        let mut frame = frame(3);
        let trades = vec![
            print(10, 100.0, 2.0, "buy"),
            print(20, 100.2, 1.0, "sell"),
            print(30, 100.4, 4.0, "sell"),
            print(320, 100.0, 1.5, "buy"),
        ];
        let summaries =
            populate_with_trades(&mut frame, &trades, "5m", &OrderflowConfig::default()).unwrap();

        let first = summaries[0].as_ref().unwrap();
        assert_eq!(first.total_trades, 3);
        assert!((first.ask - 2.0).abs() < 1e-12);
        assert!((first.bid - 5.0).abs() < 1e-12);
        assert!((first.delta + 3.0).abs() < 1e-12);
        assert!((first.max_delta - 2.0).abs() < 1e-12);
        assert!((first.min_delta + 3.0).abs() < 1e-12);
        // 100.0 and 100.2 share the 100.0 level at scale 0.5; 100.4 rounds to 100.5
        assert_eq!(first.levels.len(), 2);
        assert_eq!(first.levels[0].total_trades, 2);

        assert!(summaries[1].is_some());
        assert!(summaries[2].is_none());
        let delta = frame.column("delta").unwrap();
        assert!((delta[1] - 1.5).abs() < 1e-12);
        assert!(delta[2].is_nan());
    }

    #[test]
    fn stacked_imbalances_report_run_starts() {
        let flags = [true, true, true, false, true];
        let imbalances: Vec<Imbalance> = flags
            .iter()
            .enumerate()
            .map(|(i, &flag)| Imbalance {
                price: i as f64,
                bid_imbalance: flag,
                ask_imbalance: false,
            })
            .collect();
        assert_eq!(stacked_imbalance(&imbalances, true, 2), vec![0.0, 1.0]);
        assert_eq!(stacked_imbalance(&imbalances, true, 3), vec![0.0]);
        assert!(stacked_imbalance(&imbalances, false, 1).is_empty());
    }

    #[test]
    fn bid_imbalance_compares_diagonally() {
        let levels = vec![
            VolumeLevel {
                price: 1.0,
                bid: 7,
                ask: 0,
                total_volume: 7.0,
                ..VolumeLevel::default()
            },
            VolumeLevel {
                price: 2.0,
                bid: 0,
                ask: 2,
                total_volume: 2.0,
                ..VolumeLevel::default()
            },
        ];
        let result = imbalances(&levels, 3.0, 0.0);
        assert!(result[0].bid_imbalance);
        assert!(!result[0].ask_imbalance);
        assert!(!result[1].bid_imbalance);

        let filtered = imbalances(&levels, 3.0, 10.0);
        assert!(!filtered[0].bid_imbalance);
    }

    #[test]
    fn malformed_prints_are_dependency_errors() {
        let mut frame = frame(2);
        let trades = vec![print(10, f64::NAN, 1.0, "buy")];
        let err = populate_with_trades(&mut frame, &trades, "5m", &OrderflowConfig::default())
            .unwrap_err();
        assert!(matches!(engine_error(&err), Some(EngineError::Dependency { .. })));
    }

    #[test]
    fn stacked_bid_imbalance_lands_in_frame() {
        let mut frame = frame(2);
        // Sells at 100.0..101.0 against buys one level up, three levels deep.
        let mut trades = Vec::new();
        for level in 0..3 {
            let price = 100.0 + 0.5 * level as f64;
            for k in 0..4 {
                trades.push(print(10 + k, price, 1.0, "sell"));
            }
            trades.push(print(20, price + 0.5, 1.0, "buy"));
        }
        let config = OrderflowConfig::default();
        let summaries = populate_with_trades(&mut frame, &trades, "5m", &config).unwrap();

        let first = summaries[0].as_ref().unwrap();
        assert_eq!(first.stacked_imbalances_bid, vec![100.0]);
        let stacked = frame.column("stacked_imbalances_bid").unwrap();
        assert!((stacked[0] - 100.0).abs() < 1e-12);
        assert!(stacked[1].is_nan());
        assert!(frame.column("stacked_imbalances_ask").unwrap()[0].is_nan());
        assert_eq!(frame.column("imbalances_bid").unwrap()[0], 3.0);
    }
}
