use crate::models::Candle;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use log::warn;
use std::cmp::Ordering;

/// Parses `1m`, `15m`, `1h`, `4h`, `1d`, `1w` style timeframes into minutes.
pub fn timeframe_to_minutes(timeframe: &str) -> Result<i64> {
    let trimmed = timeframe.trim();
    if trimmed.len() < 2 {
        return Err(anyhow!("Invalid timeframe '{}'", timeframe));
    }
    let (amount, unit) = trimmed.split_at(trimmed.len() - 1);
    let amount = amount
        .parse::<i64>()
        .map_err(|_| anyhow!("Invalid timeframe '{}'", timeframe))?;
    if amount <= 0 {
        return Err(anyhow!("Invalid timeframe '{}'", timeframe));
    }
    let unit_minutes = match unit {
        "m" => 1,
        "h" => 60,
        "d" => 1_440,
        "w" => 10_080,
        _ => return Err(anyhow!("Invalid timeframe '{}'", timeframe)),
    };
    Ok(amount * unit_minutes)
}

pub fn timeframe_to_duration(timeframe: &str) -> Result<Duration> {
    Ok(Duration::minutes(timeframe_to_minutes(timeframe)?))
}

/// Floors `date` to the start of its timeframe bucket. Weekly buckets start on Monday.
pub fn floor_to_timeframe(date: DateTime<Utc>, timeframe_minutes: i64) -> DateTime<Utc> {
    let bucket_seconds = timeframe_minutes.max(1) * 60;
    // 1970-01-01 was a Thursday; shift weekly buckets so they open on Monday.
    let offset = if timeframe_minutes % 10_080 == 0 {
        4 * 86_400
    } else {
        0
    };
    let ts = date.timestamp() - offset;
    let floored = ts.div_euclid(bucket_seconds) * bucket_seconds + offset;
    Utc.timestamp_opt(floored, 0).single().unwrap_or(date)
}

/// Inclusive start / exclusive stop date window, either side optional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeRange {
    pub start: Option<DateTime<Utc>>,
    pub stop: Option<DateTime<Utc>>,
}

impl TimeRange {
    /// Accepts `YYYYMMDD-YYYYMMDD`, `YYYYMMDD-` and `-YYYYMMDD`.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let (start_raw, stop_raw) = trimmed
            .split_once('-')
            .ok_or_else(|| anyhow!("Incorrect syntax for timerange '{}'", raw))?;
        let start = parse_compact_date(start_raw, raw)?;
        let stop = parse_compact_date(stop_raw, raw)?;
        if let (Some(s), Some(e)) = (start, stop) {
            if s >= e {
                return Err(anyhow!("Start date is after stop date for timerange '{}'", raw));
            }
        }
        Ok(Self { start, stop })
    }

    pub fn contains(&self, date: DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| date >= s) && self.stop.map_or(true, |e| date < e)
    }
}

fn parse_compact_date(part: &str, raw: &str) -> Result<Option<DateTime<Utc>>> {
    let part = part.trim();
    if part.is_empty() {
        return Ok(None);
    }
    let date = NaiveDate::parse_from_str(part, "%Y%m%d")
        .map_err(|_| anyhow!("Incorrect syntax for timerange '{}'", raw))?;
    let datetime = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| anyhow!("Incorrect syntax for timerange '{}'", raw))?;
    Ok(Some(Utc.from_utc_datetime(&datetime)))
}

/// Sorts by date, drops duplicate timestamps (last one wins) and reports gaps.
pub fn clean_candles(pair: &str, mut candles: Vec<Candle>, timeframe_minutes: i64) -> Vec<Candle> {
    candles.sort_by(|a, b| a.date.cmp(&b.date));
    let mut cleaned: Vec<Candle> = Vec::with_capacity(candles.len());
    for candle in candles {
        match cleaned.last_mut() {
            Some(last) if last.date == candle.date => *last = candle,
            _ => cleaned.push(candle),
        }
    }

    let missing = count_missing_candles(&cleaned, timeframe_minutes);
    if missing > 0 {
        warn!(
            "{} has {} missing candle(s) for the {}m timeframe.",
            pair, missing, timeframe_minutes
        );
    }
    cleaned
}

pub fn count_missing_candles(candles: &[Candle], timeframe_minutes: i64) -> usize {
    if timeframe_minutes <= 0 {
        return 0;
    }
    candles
        .windows(2)
        .map(|pair| {
            let gap = (pair[1].date - pair[0].date).num_minutes();
            (gap / timeframe_minutes - 1).max(0) as usize
        })
        .sum()
}

pub fn trim_to_timerange(candles: &[Candle], range: &TimeRange) -> Vec<Candle> {
    candles
        .iter()
        .filter(|candle| range.contains(candle.date))
        .copied()
        .collect()
}

/// One step of the merged multi-pair replay: row `row` of pair `pair_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamEvent {
    pub date: DateTime<Utc>,
    pub pair_index: usize,
    pub row: usize,
}

/// Builds a chronologically merged event stream across pairs. Events sharing a
/// timestamp are ordered by pair name so replays are deterministic.
pub fn merged_event_stream(pairs: &[(&str, &[DateTime<Utc>])]) -> Vec<StreamEvent> {
    let total: usize = pairs.iter().map(|(_, dates)| dates.len()).sum();
    let mut events = Vec::with_capacity(total);
    for (pair_index, (_, dates)) in pairs.iter().enumerate() {
        for (row, date) in dates.iter().enumerate() {
            events.push(StreamEvent {
                date: *date,
                pair_index,
                row,
            });
        }
    }
    events.sort_by(|a, b| match a.date.cmp(&b.date) {
        Ordering::Equal => pairs[a.pair_index]
            .0
            .cmp(pairs[b.pair_index].0)
            .then(a.row.cmp(&b.row)),
        other => other,
    });
    events
}
