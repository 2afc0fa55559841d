use crate::candle_utils::{clean_candles, timeframe_to_minutes, trim_to_timerange, TimeRange};
use crate::models::Candle;
use crate::optimizer_status::OptimizerStatus;
use crate::orderflow::TradePrint;
use anyhow::{anyhow, Context, Result};
use chrono::prelude::*;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const MARKET_DATA_SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct MarketDataSnapshot {
    version: u32,
    generated_at: DateTime<Utc>,
    timeframe: String,
    pairs: Vec<String>,
    candles: BTreeMap<String, Vec<Candle>>,
}

/// Read-only historical candles per pair for one timeframe. Cloning is cheap;
/// candle vectors are shared behind `Arc`.
#[derive(Clone, Debug)]
pub struct MarketData {
    timeframe: String,
    pairs: Arc<Vec<String>>,
    candles: Arc<BTreeMap<String, Arc<Vec<Candle>>>>,
}

impl MarketData {
    pub fn from_candles(timeframe: &str, candles: BTreeMap<String, Vec<Candle>>) -> Result<Self> {
        let timeframe_minutes = timeframe_to_minutes(timeframe)?;
        let mut cleaned = BTreeMap::new();
        for (pair, rows) in candles {
            let rows = clean_candles(&pair, rows, timeframe_minutes);
            if rows.is_empty() {
                warn!("No candles for {}; pair skipped.", pair);
                continue;
            }
            cleaned.insert(pair, Arc::new(rows));
        }
        let pairs = cleaned.keys().cloned().collect::<Vec<_>>();
        Ok(Self {
            timeframe: timeframe.to_string(),
            pairs: Arc::new(pairs),
            candles: Arc::new(cleaned),
        })
    }

    /// Loads `<PAIR>-<timeframe>.json` files (`[[ms, open, high, low, close, volume], ...]`)
    /// with `/` in the pair name written as `_`.
    pub fn load_json_dir<P: AsRef<Path>>(
        datadir: P,
        pairs: &[String],
        timeframe: &str,
        status: &OptimizerStatus,
    ) -> Result<Self> {
        let datadir = datadir.as_ref();
        status.set_phase(format!("Loading candles from {}", datadir.display()));
        let mut candles = BTreeMap::new();
        for pair in pairs {
            let path = pair_data_path(datadir, pair, timeframe);
            if !path.is_file() {
                warn!("No history for {} found at {}", pair, path.display());
                continue;
            }
            let rows = read_json_candles(&path)?;
            candles.insert(pair.clone(), rows);
        }
        if candles.is_empty() {
            return Err(anyhow!(
                "No data found. Terminating. (looked in {})",
                datadir.display()
            ));
        }
        Self::from_candles(timeframe, candles)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P, status: &OptimizerStatus) -> Result<Self> {
        let path = path.as_ref();
        status.set_phase(format!(
            "Loading market data snapshot from {}",
            path.display()
        ));
        let file = File::open(path).with_context(|| {
            format!("Failed to open market data snapshot at {}", path.display())
        })?;
        let reader = BufReader::new(file);
        let snapshot: MarketDataSnapshot =
            bincode::deserialize_from(reader).context("Snapshot decode failed")?;

        if snapshot.version != MARKET_DATA_SNAPSHOT_VERSION {
            return Err(anyhow!(
                "Market data snapshot version mismatch (found {}, expected {})",
                snapshot.version,
                MARKET_DATA_SNAPSHOT_VERSION
            ));
        }
        info!(
            "Loaded snapshot generated at {} with {} pair(s)",
            snapshot.generated_at,
            snapshot.pairs.len()
        );
        Self::from_candles(&snapshot.timeframe, snapshot.candles)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create snapshot directory {}", parent.display())
                })?;
            }
        }

        let file = File::create(path).with_context(|| {
            format!(
                "Unable to create market data snapshot at {}",
                path.display()
            )
        })?;
        let mut writer = BufWriter::new(file);
        let snapshot = MarketDataSnapshot {
            version: MARKET_DATA_SNAPSHOT_VERSION,
            generated_at: Utc::now(),
            timeframe: self.timeframe.clone(),
            pairs: self.pairs.as_ref().clone(),
            candles: self
                .candles
                .iter()
                .map(|(pair, rows)| (pair.clone(), rows.as_ref().clone()))
                .collect(),
        };
        bincode::serialize_into(&mut writer, &snapshot)
            .context("Failed to serialize market data snapshot")?;
        writer
            .flush()
            .context("Failed to flush market data snapshot to disk")?;
        Ok(())
    }

    pub fn has_data(&self) -> bool {
        !self.pairs.is_empty()
    }

    pub fn timeframe(&self) -> &str {
        &self.timeframe
    }

    pub fn pairs(&self) -> &[String] {
        &self.pairs
    }

    pub fn candles(&self, pair: &str) -> Option<&Arc<Vec<Candle>>> {
        self.candles.get(pair)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<Vec<Candle>>)> {
        self.candles.iter()
    }

    /// Earliest and latest candle dates across all pairs.
    pub fn date_bounds(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let min = self.candles.values().filter_map(|rows| rows.first()).map(|c| c.date).min()?;
        let max = self.candles.values().filter_map(|rows| rows.last()).map(|c| c.date).max()?;
        Some((min, max))
    }

    /// Trims to `range`, keeping `startup_candles` extra rows before the start
    /// so indicators are warmed up when the window opens.
    pub fn restrict_to_timerange(&self, range: &TimeRange, startup_candles: usize) -> Self {
        let candles: BTreeMap<_, _> = self
            .candles
            .iter()
            .filter_map(|(pair, rows)| {
                let mut window = TimeRange {
                    start: range.start,
                    stop: range.stop,
                };
                if let Some(start) = range.start {
                    let first_in_range = rows.iter().position(|c| c.date >= start)?;
                    let warm_index = first_in_range.saturating_sub(startup_candles);
                    window.start = Some(rows[warm_index].date);
                }
                let trimmed = trim_to_timerange(rows, &window);
                if trimmed.is_empty() {
                    None
                } else {
                    Some((pair.clone(), Arc::new(trimmed)))
                }
            })
            .collect();
        Self {
            timeframe: self.timeframe.clone(),
            pairs: Arc::new(candles.keys().cloned().collect()),
            candles: Arc::new(candles),
        }
    }
}

pub fn pair_data_path(datadir: &Path, pair: &str, timeframe: &str) -> PathBuf {
    datadir.join(format!("{}-{}.json", pair_file_stem(pair), timeframe))
}

pub fn pair_trades_path(datadir: &Path, pair: &str) -> PathBuf {
    datadir.join(format!("{}-trades.json", pair_file_stem(pair)))
}

fn pair_file_stem(pair: &str) -> String {
    pair.replace(['/', ':'], "_")
}

fn read_json_candles(path: &Path) -> Result<Vec<Candle>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open candle file {}", path.display()))?;
    let rows: Vec<[f64; 6]> = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Invalid candle file {}", path.display()))?;
    rows.into_iter()
        .map(|[ts, open, high, low, close, volume]| {
            let date = Utc
                .timestamp_millis_opt(ts as i64)
                .single()
                .ok_or_else(|| anyhow!("Invalid timestamp {} in {}", ts, path.display()))?;
            Ok(Candle {
                date,
                open,
                high,
                low,
                close,
                volume,
            })
        })
        .collect()
}

/// Raw trade prints for order-flow analysis (`[{timestamp, price, amount, side}]`).
pub fn load_trades_json(datadir: &Path, pair: &str) -> Result<Vec<TradePrint>> {
    let path = pair_trades_path(datadir, pair);
    let file = File::open(&path)
        .with_context(|| format!("Failed to open trades file {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Invalid trades file {}", path.display()))
}

pub fn write_json_candles(path: &Path, candles: &[Candle]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create data directory {}", parent.display()))?;
    }
    let rows: Vec<[f64; 6]> = candles
        .iter()
        .map(|c| {
            [
                c.date.timestamp_millis() as f64,
                c.open,
                c.high,
                c.low,
                c.close,
                c.volume,
            ]
        })
        .collect();
    let file = File::create(path)
        .with_context(|| format!("Failed to create candle file {}", path.display()))?;
    serde_json::to_writer(BufWriter::new(file), &rows)
        .with_context(|| format!("Failed to write candle file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn candles(count: usize) -> Vec<Candle> {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..count)
            .map(|i| Candle {
                date: base + Duration::hours(i as i64),
                open: 100.0 + i as f64,
                high: 101.0 + i as f64,
                low: 99.0 + i as f64,
                close: 100.5 + i as f64,
                volume: 10.0,
            })
            .collect()
    }

    #[test]
    fn snapshot_round_trips_through_bincode() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = BTreeMap::new();
        map.insert("BTC/USDT".to_string(), candles(5));
        let data = MarketData::from_candles("1h", map).unwrap();
        let path = dir.path().join("snapshot.bin");
        data.save_to_file(&path).unwrap();

        let loaded = MarketData::load_from_file(&path, &OptimizerStatus::new()).unwrap();
        assert_eq!(loaded.pairs(), data.pairs());
        assert_eq!(
            loaded.candles("BTC/USDT").unwrap().as_ref(),
            data.candles("BTC/USDT").unwrap().as_ref()
        );
    }

    #[test]
    fn loads_json_candle_files() {
        let dir = tempfile::tempdir().unwrap();
        let pair = "ETH/USDT".to_string();
        write_json_candles(&pair_data_path(dir.path(), &pair, "1h"), &candles(3)).unwrap();
        let data = MarketData::load_json_dir(
            dir.path(),
            &[pair.clone(), "MISSING/USDT".to_string()],
            "1h",
            &OptimizerStatus::new(),
        )
        .unwrap();
        assert_eq!(data.pairs(), &[pair.clone()]);
        assert_eq!(data.candles(&pair).unwrap().len(), 3);
    }

    #[test]
    fn timerange_keeps_startup_candles() {
        let mut map = BTreeMap::new();
        map.insert("BTC/USDT".to_string(), candles(10));
        let data = MarketData::from_candles("1h", map).unwrap();
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let range = TimeRange {
            start: Some(base + Duration::hours(5)),
            stop: Some(base + Duration::hours(8)),
        };
        let trimmed = data.restrict_to_timerange(&range, 2);
        let rows = trimmed.candles("BTC/USDT").unwrap();
        assert_eq!(rows.first().unwrap().date, base + Duration::hours(3));
        assert_eq!(rows.last().unwrap().date, base + Duration::hours(7));
    }
}
