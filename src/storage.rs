use crate::config::BacktestConfig;
use crate::error::EngineError;
use crate::models::*;
use crate::parameters::ParamsDict;
use crate::reports::{BacktestStats, StrategyStats};
use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

const BACKTEST_ARCHIVE_VERSION: u32 = 1;
pub const HYPEROPT_FILE_VERSION: u32 = 2;
pub const LAST_RESULT_FILE: &str = ".last_result.json";
const LATEST_BACKTEST_KEY: &str = "latest_backtest";
const LATEST_HYPEROPT_KEY: &str = "latest_hyperopt";
const HYPEROPT_LOCK_FILE: &str = "hyperopt.lock";

/// Per-strategy entry of `{base}.meta.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestMetadata {
    pub run_id: String,
    pub backtest_start_time: i64,
    pub timeframe: String,
    pub timerange: Option<String>,
    pub backtest_start_ts: i64,
    pub backtest_end_ts: i64,
}

/// Trade ledger stored column by column.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TradeColumns {
    id: Vec<usize>,
    pair: Vec<String>,
    is_short: Vec<bool>,
    open_date: Vec<i64>,
    close_date: Vec<Option<i64>>,
    open_rate: Vec<f64>,
    close_rate: Vec<Option<f64>>,
    amount: Vec<f64>,
    stake_amount: Vec<f64>,
    leverage: Vec<f64>,
    trading_mode: Vec<TradingMode>,
    margin_mode: Vec<MarginMode>,
    fee_open: Vec<f64>,
    fee_close: Vec<f64>,
    funding_fees: Vec<f64>,
    profit_ratio: Vec<Option<f64>>,
    profit_abs: Vec<Option<f64>>,
    stop_loss: Vec<f64>,
    stop_loss_pct: Vec<f64>,
    initial_stop_loss: Vec<f64>,
    initial_stop_loss_pct: Vec<Option<f64>>,
    is_stop_loss_trailing: Vec<bool>,
    max_rate: Vec<f64>,
    min_rate: Vec<f64>,
    liquidation_price: Vec<Option<f64>>,
    exit_type: Vec<Option<ExitType>>,
    exit_reason: Vec<Option<String>>,
    enter_tag: Vec<Option<String>>,
    orders: Vec<Vec<Order>>,
}

fn millis_to_date(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| anyhow!("Invalid timestamp {} in backtest archive", ms))
}

impl TradeColumns {
    fn from_trades(trades: &[Trade]) -> Self {
        let mut columns = Self::default();
        for trade in trades {
            columns.id.push(trade.id.0);
            columns.pair.push(trade.pair.clone());
            columns.is_short.push(trade.is_short);
            columns.open_date.push(trade.open_date.timestamp_millis());
            columns.close_date.push(trade.close_date.map(|d| d.timestamp_millis()));
            columns.open_rate.push(trade.open_rate);
            columns.close_rate.push(trade.close_rate);
            columns.amount.push(trade.amount);
            columns.stake_amount.push(trade.stake_amount);
            columns.leverage.push(trade.leverage);
            columns.trading_mode.push(trade.trading_mode);
            columns.margin_mode.push(trade.margin_mode);
            columns.fee_open.push(trade.fee_open);
            columns.fee_close.push(trade.fee_close);
            columns.funding_fees.push(trade.funding_fees);
            columns.profit_ratio.push(trade.close_profit);
            columns.profit_abs.push(trade.close_profit_abs);
            columns.stop_loss.push(trade.stop_loss);
            columns.stop_loss_pct.push(trade.stop_loss_pct);
            columns.initial_stop_loss.push(trade.initial_stop_loss);
            columns.initial_stop_loss_pct.push(trade.initial_stop_loss_pct);
            columns.is_stop_loss_trailing.push(trade.is_stop_loss_trailing);
            columns.max_rate.push(trade.max_rate);
            columns.min_rate.push(trade.min_rate);
            columns.liquidation_price.push(trade.liquidation_price);
            columns.exit_type.push(trade.exit_type);
            columns.exit_reason.push(trade.exit_reason.clone());
            columns.enter_tag.push(trade.enter_tag.clone());
            columns.orders.push(trade.orders.clone());
        }
        columns
    }

    fn column_lengths(&self) -> [(&'static str, usize); 29] {
        [
            ("id", self.id.len()),
            ("pair", self.pair.len()),
            ("is_short", self.is_short.len()),
            ("open_date", self.open_date.len()),
            ("close_date", self.close_date.len()),
            ("open_rate", self.open_rate.len()),
            ("close_rate", self.close_rate.len()),
            ("amount", self.amount.len()),
            ("stake_amount", self.stake_amount.len()),
            ("leverage", self.leverage.len()),
            ("trading_mode", self.trading_mode.len()),
            ("margin_mode", self.margin_mode.len()),
            ("fee_open", self.fee_open.len()),
            ("fee_close", self.fee_close.len()),
            ("funding_fees", self.funding_fees.len()),
            ("profit_ratio", self.profit_ratio.len()),
            ("profit_abs", self.profit_abs.len()),
            ("stop_loss", self.stop_loss.len()),
            ("stop_loss_pct", self.stop_loss_pct.len()),
            ("initial_stop_loss", self.initial_stop_loss.len()),
            ("initial_stop_loss_pct", self.initial_stop_loss_pct.len()),
            ("is_stop_loss_trailing", self.is_stop_loss_trailing.len()),
            ("max_rate", self.max_rate.len()),
            ("min_rate", self.min_rate.len()),
            ("liquidation_price", self.liquidation_price.len()),
            ("exit_type", self.exit_type.len()),
            ("exit_reason", self.exit_reason.len()),
            ("enter_tag", self.enter_tag.len()),
            ("orders", self.orders.len()),
        ]
    }

    fn into_trades(self) -> Result<Vec<Trade>> {
        let len = self.id.len();
        if let Some((name, found)) = self
            .column_lengths()
            .into_iter()
            .find(|(_, column)| *column != len)
        {
            return Err(EngineError::dependency(
                "Backtest archive has misaligned trade columns",
                anyhow!("column {} has {} rows, expected {}", name, found, len),
            )
            .into());
        }
        let mut trades = Vec::with_capacity(len);
        let mut orders = self.orders.into_iter();
        for i in 0..len {
            trades.push(Trade {
                id: TradeId(self.id[i]),
                pair: self.pair[i].clone(),
                is_short: self.is_short[i],
                is_open: self.close_date[i].is_none(),
                open_date: millis_to_date(self.open_date[i])?,
                close_date: self.close_date[i].map(millis_to_date).transpose()?,
                open_rate: self.open_rate[i],
                close_rate: self.close_rate[i],
                amount: self.amount[i],
                stake_amount: self.stake_amount[i],
                leverage: self.leverage[i],
                trading_mode: self.trading_mode[i],
                margin_mode: self.margin_mode[i],
                fee_open: self.fee_open[i],
                fee_close: self.fee_close[i],
                funding_fees: self.funding_fees[i],
                close_profit: self.profit_ratio[i],
                close_profit_abs: self.profit_abs[i],
                stop_loss: self.stop_loss[i],
                stop_loss_pct: self.stop_loss_pct[i],
                initial_stop_loss: self.initial_stop_loss[i],
                initial_stop_loss_pct: self.initial_stop_loss_pct[i],
                is_stop_loss_trailing: self.is_stop_loss_trailing[i],
                max_rate: self.max_rate[i],
                min_rate: self.min_rate[i],
                liquidation_price: self.liquidation_price[i],
                exit_type: self.exit_type[i],
                exit_reason: self.exit_reason[i].clone(),
                enter_tag: self.enter_tag[i].clone(),
                orders: orders.next().unwrap_or_default(),
            });
        }
        Ok(trades)
    }
}

/// JSON documents travel as strings; bincode has no self-describing values.
#[derive(Serialize, Deserialize)]
struct BacktestArchive {
    version: u32,
    generated_at: DateTime<Utc>,
    stats_json: String,
    config_json: String,
    trades: BTreeMap<String, TradeColumns>,
    market_change: Vec<(i64, f64)>,
}

/// Decoded contents of a backtest archive.
#[derive(Debug, Clone)]
pub struct LoadedBacktest {
    pub stats: BacktestStats,
    pub config: Value,
    pub trades: BTreeMap<String, Vec<Trade>>,
    pub market_change: Vec<(DateTime<Utc>, f64)>,
}

/// `backtest-result-{appendix}` inside an export directory, otherwise
/// `{stem}-{appendix}` next to the given file.
pub fn backtest_base_name(export_path: &Path, appendix: &str) -> PathBuf {
    if export_path.is_dir() || export_path.extension().is_none() {
        export_path.join(format!("backtest-result-{}", appendix))
    } else {
        let stem = export_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "backtest-result".to_string());
        export_path
            .parent()
            .unwrap_or_else(|| Path::new(""))
            .join(format!("{}-{}", stem, appendix))
    }
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

pub fn meta_path(base: &Path) -> PathBuf {
    with_suffix(base, ".meta.json")
}

pub fn archive_path(base: &Path) -> PathBuf {
    with_suffix(base, ".bin")
}

fn write_json(path: &Path, value: &Value) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    writer
        .flush()
        .with_context(|| format!("Failed to flush {}", path.display()))
}

fn update_last_result(dir: &Path, key: &str, file_name: &str) -> Result<()> {
    let path = dir.join(LAST_RESULT_FILE);
    let mut content = match fs::read_to_string(&path) {
        Ok(raw) => serde_json::from_str::<Map<String, Value>>(&raw).unwrap_or_default(),
        Err(_) => Map::new(),
    };
    content.insert(key.to_string(), Value::String(file_name.to_string()));
    write_json(&path, &Value::Object(content))
}

fn read_last_result(dir: &Path, key: &str) -> Result<String> {
    let path = dir.join(LAST_RESULT_FILE);
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("Directory {} does not seem to contain results", dir.display()))?;
    let content: Map<String, Value> = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid {}", path.display()))?;
    content
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow!("Invalid '{}' format in {}", key, path.display()))
}

/// Writes `{base}.meta.json` and `{base}.bin` and points `.last_result.json`
/// at the archive. Returns the archive path.
pub fn store_backtest_results(
    config: &BacktestConfig,
    stats: &BacktestStats,
    results: &BTreeMap<String, BacktestResult>,
    market_change: &[(DateTime<Utc>, f64)],
    appendix: &str,
) -> Result<PathBuf> {
    let export_path = config.export_path();
    let base = backtest_base_name(&export_path, appendix);
    let dir = base
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create export directory {}", dir.display()))?;

    let mut metadata = Map::new();
    for (name, result) in results {
        let strategy_stats: Option<&StrategyStats> = stats.strategy.get(name);
        let entry = BacktestMetadata {
            run_id: result.run_id.clone(),
            backtest_start_time: result.backtest_start_time,
            timeframe: config.timeframe.clone(),
            timerange: config.timerange.clone(),
            backtest_start_ts: strategy_stats
                .map(|s| s.backtest_start.timestamp())
                .unwrap_or_default(),
            backtest_end_ts: strategy_stats
                .map(|s| s.backtest_end.timestamp())
                .unwrap_or_default(),
        };
        metadata.insert(name.clone(), serde_json::to_value(entry)?);
    }
    write_json(&meta_path(&base), &Value::Object(metadata))?;

    let archive = BacktestArchive {
        version: BACKTEST_ARCHIVE_VERSION,
        generated_at: Utc::now(),
        stats_json: serde_json::to_string(stats).context("Failed to encode backtest stats")?,
        config_json: serde_json::to_string(&config.sanitized()?)?,
        trades: results
            .iter()
            .map(|(name, result)| (name.clone(), TradeColumns::from_trades(&result.trades)))
            .collect(),
        market_change: market_change
            .iter()
            .map(|(date, value)| (date.timestamp_millis(), *value))
            .collect(),
    };
    let path = archive_path(&base);
    let file = File::create(&path)
        .with_context(|| format!("Unable to create backtest archive at {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    bincode::serialize_into(&mut writer, &archive).context("Failed to serialize backtest archive")?;
    writer
        .flush()
        .context("Failed to flush backtest archive to disk")?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    update_last_result(&dir, LATEST_BACKTEST_KEY, &file_name)?;
    info!("Dumping backtest results to {}", path.display());
    Ok(path)
}

/// Metadata of an archive, read from its sibling `.meta.json`.
pub fn load_backtest_metadata(archive: &Path) -> Result<BTreeMap<String, BacktestMetadata>> {
    let base = archive.with_extension("");
    let path = meta_path(&base);
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("Unexpected error while loading backtest metadata {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid backtest metadata {}", path.display()))
}

pub fn load_backtest_archive(path: &Path) -> Result<LoadedBacktest> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open backtest archive at {}", path.display()))?;
    let archive: BacktestArchive = bincode::deserialize_from(BufReader::new(file))
        .context("Backtest archive decode failed")?;
    if archive.version != BACKTEST_ARCHIVE_VERSION {
        bail!(
            "Backtest archive version mismatch (found {}, expected {})",
            archive.version,
            BACKTEST_ARCHIVE_VERSION
        );
    }
    let stats: BacktestStats =
        serde_json::from_str(&archive.stats_json).context("Invalid stats in backtest archive")?;
    let config: Value =
        serde_json::from_str(&archive.config_json).context("Invalid config in backtest archive")?;
    let mut trades = BTreeMap::new();
    for (name, columns) in archive.trades {
        trades.insert(name, columns.into_trades()?);
    }
    let market_change = archive
        .market_change
        .into_iter()
        .map(|(ms, value)| Ok((millis_to_date(ms)?, value)))
        .collect::<Result<Vec<_>>>()?;
    Ok(LoadedBacktest {
        stats,
        config,
        trades,
        market_change,
    })
}

/// Archive named by `.last_result.json` in `dir`.
pub fn latest_backtest_path(dir: &Path) -> Result<PathBuf> {
    Ok(dir.join(read_last_result(dir, LATEST_BACKTEST_KEY)?))
}

/// One optimizer epoch as written to the `.fthypt` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HyperoptEpoch {
    pub loss: f64,
    pub params_dict: ParamsDict,
    pub params_details: Map<String, Value>,
    pub params_not_optimized: Map<String, Value>,
    pub results_metrics: StrategyStats,
    pub results_explanation: String,
    pub total_profit: f64,
    pub current_epoch: usize,
    pub is_initial_point: bool,
    pub is_random: bool,
    pub is_best: bool,
    #[serde(rename = "__ftHyperoptFileVersion", default)]
    pub file_version: u32,
}

pub fn hyperopt_results_filename(dir: &Path, strategy: &str, started: DateTime<Utc>) -> PathBuf {
    dir.join(format!(
        "strategy_{}_{}.fthypt",
        strategy,
        started.format("%Y-%m-%d_%H-%M-%S")
    ))
}

/// Appends epochs as newline-delimited JSON.
pub fn save_epochs(path: &Path, epochs: &[HyperoptEpoch]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create results directory {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open hyperopt results {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    for epoch in epochs {
        let mut record = epoch.clone();
        record.file_version = HYPEROPT_FILE_VERSION;
        serde_json::to_writer(&mut writer, &record)?;
        writer.write_all(b"\n")?;
    }
    writer
        .flush()
        .with_context(|| format!("Failed to flush hyperopt results {}", path.display()))?;
    Ok(())
}

pub fn load_epochs(path: &Path) -> Result<Vec<HyperoptEpoch>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open hyperopt results {}", path.display()))?;
    let mut epochs = Vec::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let epoch: HyperoptEpoch = serde_json::from_str(&line).with_context(|| {
            format!("Invalid epoch on line {} of {}", line_no + 1, path.display())
        })?;
        if epoch.file_version != HYPEROPT_FILE_VERSION {
            bail!(
                "Hyperopt results file {} has version {}, expected {}",
                path.display(),
                epoch.file_version,
                HYPEROPT_FILE_VERSION
            );
        }
        epochs.push(epoch);
    }
    Ok(epochs)
}

pub fn write_latest_hyperopt(dir: &Path, results_file: &Path) -> Result<()> {
    let file_name = results_file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| anyhow!("Invalid hyperopt results path {}", results_file.display()))?;
    update_last_result(dir, LATEST_HYPEROPT_KEY, &file_name)
}

pub fn latest_hyperopt_path(dir: &Path) -> Result<PathBuf> {
    Ok(dir.join(read_last_result(dir, LATEST_HYPEROPT_KEY)?))
}

/// Best epoch: the last one flagged best, else the lowest loss.
pub fn best_epoch(epochs: &[HyperoptEpoch]) -> Option<&HyperoptEpoch> {
    epochs
        .iter()
        .rev()
        .find(|epoch| epoch.is_best)
        .or_else(|| epochs.iter().min_by(|a, b| a.loss.total_cmp(&b.loss)))
}

pub fn clean_hyperopt_results(path: &Path) -> Result<()> {
    if path.is_file() {
        warn!("Removing `{}`.", path.display());
        fs::remove_file(path)
            .with_context(|| format!("Failed to remove {}", path.display()))?;
    }
    Ok(())
}

/// Exclusive `hyperopt.lock`, removed on drop.
#[derive(Debug)]
pub struct HyperoptLock {
    path: PathBuf,
}

impl HyperoptLock {
    pub fn acquire(user_data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(user_data_dir)
            .with_context(|| format!("Failed to create {}", user_data_dir.display()))?;
        let path = user_data_dir.join(HYPEROPT_LOCK_FILE);
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|err| {
                anyhow!(
                    "Another running instance of hyperopt detected ({}): {}",
                    path.display(),
                    err
                )
            })?;
        Ok(Self { path })
    }
}

impl Drop for HyperoptLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!("Failed to release {}: {}", self.path.display(), err);
        }
    }
}
