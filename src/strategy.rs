use crate::config::BacktestConfig;
use crate::error::EngineError;
use crate::models::{Candle, Trade};
use crate::optimizer_status::HyperoptState;
use crate::parameters::{ParameterRegistry, ParamsDict};
use crate::space::{SPACE_BUY, SPACE_PROTECTION, SPACE_SELL};
use crate::trading_rules::RiskSettings;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const STRATEGY_PARAMS_FILE_VERSION: u32 = 1;

/// Per-call context for strategy callbacks. The hyperopt state travels here
/// instead of living in global state.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub pair: String,
    pub timeframe: String,
    pub state: HyperoptState,
}

/// Column store for one pair: candles, indicator columns and signal columns.
#[derive(Debug, Clone, Default)]
pub struct SignalFrame {
    pub candles: Arc<Vec<Candle>>,
    pub columns: BTreeMap<String, Vec<f64>>,
    pub enter_long: Vec<bool>,
    pub enter_short: Vec<bool>,
    pub exit_long: Vec<bool>,
    pub exit_short: Vec<bool>,
    pub enter_tag: Vec<Option<String>>,
    pub exit_tag: Vec<Option<String>>,
}

impl SignalFrame {
    pub fn new(candles: Arc<Vec<Candle>>) -> Self {
        let n = candles.len();
        Self {
            candles,
            columns: BTreeMap::new(),
            enter_long: vec![false; n],
            enter_short: vec![false; n],
            exit_long: vec![false; n],
            exit_short: vec![false; n],
            enter_tag: vec![None; n],
            exit_tag: vec![None; n],
        }
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn closes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.close).collect()
    }

    pub fn highs(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.high).collect()
    }

    pub fn lows(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.low).collect()
    }

    pub fn dates(&self) -> Vec<DateTime<Utc>> {
        self.candles.iter().map(|c| c.date).collect()
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    pub fn set_column(&mut self, name: impl Into<String>, values: Vec<f64>) {
        self.columns.insert(name.into(), values);
    }

    /// Clears every signal column, keeping indicators.
    pub fn reset_signals(&mut self) {
        let n = self.len();
        self.enter_long = vec![false; n];
        self.enter_short = vec![false; n];
        self.exit_long = vec![false; n];
        self.exit_short = vec![false; n];
        self.enter_tag = vec![None; n];
        self.exit_tag = vec![None; n];
    }

    /// Drops the first `rows` rows (indicator warm-up).
    pub fn trim_startup(&mut self, rows: usize) {
        let rows = rows.min(self.len());
        if rows == 0 {
            return;
        }
        self.candles = Arc::new(self.candles[rows..].to_vec());
        for values in self.columns.values_mut() {
            drain_front(values, rows);
        }
        drain_front(&mut self.enter_long, rows);
        drain_front(&mut self.enter_short, rows);
        drain_front(&mut self.exit_long, rows);
        drain_front(&mut self.exit_short, rows);
        drain_front(&mut self.enter_tag, rows);
        drain_front(&mut self.exit_tag, rows);
    }

    fn signal_lengths_match(&self) -> bool {
        let n = self.len();
        self.enter_long.len() == n
            && self.enter_short.len() == n
            && self.exit_long.len() == n
            && self.exit_short.len() == n
            && self.enter_tag.len() == n
            && self.exit_tag.len() == n
            && self.columns.values().all(|values| values.len() == n)
    }
}

fn drain_front<T>(values: &mut Vec<T>, rows: usize) {
    let rows = rows.min(values.len());
    values.drain(..rows);
}

/// Captures the shape of a frame before a strategy call and checks the frame
/// that comes back.
pub struct StrategyResultValidator {
    length: usize,
    last_close: Option<f64>,
    last_date: Option<DateTime<Utc>>,
    warn_only: bool,
}

impl StrategyResultValidator {
    pub fn new(frame: &SignalFrame, warn_only: bool) -> Self {
        Self {
            length: frame.len(),
            last_close: frame.candles.last().map(|c| c.close),
            last_date: frame.candles.last().map(|c| c.date),
            warn_only,
        }
    }

    pub fn validate(&self, frame: Option<&SignalFrame>) -> Result<()> {
        let Some(frame) = frame else {
            return Err(EngineError::strategy("No dataframe returned (return statement missing?).").into());
        };
        let mut message = String::new();
        if self.length != frame.len() || !frame.signal_lengths_match() {
            message.push_str("length");
        } else if self.last_close != frame.candles.last().map(|c| c.close) {
            message.push_str("last close price");
        } else if self.last_date != frame.candles.last().map(|c| c.date) {
            message.push_str("last date");
        }
        if message.is_empty() {
            return Ok(());
        }
        let message = format!(
            "Dataframe returned from strategy has mismatching {}.",
            message
        );
        if self.warn_only {
            warn!("{}", message);
            Ok(())
        } else {
            Err(EngineError::strategy(message).into())
        }
    }
}

/// Runs a strategy callback. Failures are logged with `message`; the default
/// (or `T::default()` when `suppress_error` is set) is returned instead,
/// otherwise the failure is raised as a strategy error.
pub fn strategy_safe_wrapper<T, F>(
    message: &str,
    default: Option<T>,
    suppress_error: bool,
    callback: F,
) -> Result<T>
where
    T: Default,
    F: FnOnce() -> Result<T>,
{
    match callback() {
        Ok(value) => Ok(value),
        Err(err) => {
            error!("{}Strategy caused the following exception: {:#}", message, err);
            match default {
                Some(value) => Ok(value),
                None if suppress_error => Ok(T::default()),
                None => Err(EngineError::strategy(format!("{:#}", err)).into()),
            }
        }
    }
}

/// Capability interface of a trading strategy. The engine only ever talks to
/// this trait; parameter values are the only state that changes between runs.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    fn timeframe(&self) -> &str;

    fn startup_candle_count(&self) -> usize;

    fn can_short(&self) -> bool {
        false
    }

    fn parameters(&self) -> &ParameterRegistry;

    fn parameters_mut(&mut self) -> &mut ParameterRegistry;

    fn apply_parameters(&mut self, values: &ParamsDict) -> Result<()> {
        self.parameters_mut().apply(values).map(|_| ())
    }

    /// Exit rules declared by the strategy itself.
    fn risk_settings(&self) -> RiskSettings {
        RiskSettings::default()
    }

    fn advise_indicators(&self, frame: SignalFrame, metadata: &Metadata) -> Result<SignalFrame>;

    fn advise_entry(&self, frame: SignalFrame, metadata: &Metadata) -> Result<SignalFrame>;

    fn advise_exit(&self, frame: SignalFrame, metadata: &Metadata) -> Result<SignalFrame>;

    /// Exit reason to close `trade` at `rate`, if any. Errors are handled per
    /// candle by the engine.
    fn custom_exit(
        &self,
        _pair: &str,
        _trade: &Trade,
        _date: DateTime<Utc>,
        _rate: f64,
        _profit: f64,
    ) -> Result<Option<String>> {
        Ok(None)
    }

    /// Limit price for a new entry. `None` enters at the proposed rate.
    fn custom_entry_price(
        &self,
        _pair: &str,
        _date: DateTime<Utc>,
        _proposed_rate: f64,
        _is_short: bool,
    ) -> Result<Option<f64>> {
        Ok(None)
    }

    fn leverage(
        &self,
        _pair: &str,
        _date: DateTime<Utc>,
        proposed_leverage: f64,
        _max_leverage: f64,
        _is_short: bool,
    ) -> Result<f64> {
        Ok(proposed_leverage)
    }
}

#[path = "strategies/sample.rs"]
pub mod sample;

pub use sample::SampleStrategy;

#[path = "strategies/ma_crossover.rs"]
pub mod ma_crossover;

pub use ma_crossover::MaCrossoverStrategy;

pub fn create_strategy(name: &str) -> Result<Box<dyn Strategy>> {
    match name.trim() {
        "sample" | "SampleStrategy" => Ok(Box::new(SampleStrategy::new()?)),
        "ma_crossover" | "MaCrossoverStrategy" => Ok(Box::new(MaCrossoverStrategy::new()?)),
        other => Err(EngineError::configuration(format!(
            "Impossible to load Strategy '{}'. This strategy does not exist.",
            other
        ))
        .into()),
    }
}

/// Indicator pass with validation, failing soft unless `fail_hard`.
pub fn advise_indicators(
    strategy: &dyn Strategy,
    frame: SignalFrame,
    metadata: &Metadata,
    warn_only: bool,
) -> Result<SignalFrame> {
    let validator = StrategyResultValidator::new(&frame, warn_only);
    let analyzed = strategy.advise_indicators(frame, metadata)?;
    validator.validate(Some(&analyzed))?;
    Ok(analyzed)
}

/// Entry and exit passes over an indicator frame.
pub fn advise_signals(
    strategy: &dyn Strategy,
    mut frame: SignalFrame,
    metadata: &Metadata,
    warn_only: bool,
) -> Result<SignalFrame> {
    frame.reset_signals();
    let validator = StrategyResultValidator::new(&frame, warn_only);
    let frame = strategy.advise_entry(frame, metadata)?;
    validator.validate(Some(&frame))?;
    let frame = strategy.advise_exit(frame, metadata)?;
    validator.validate(Some(&frame))?;
    Ok(frame)
}

pub(crate) fn is_validation_failure(err: &anyhow::Error) -> bool {
    matches!(
        crate::error::engine_error(err),
        Some(EngineError::Strategy(message)) if message.starts_with("Dataframe returned") || message.starts_with("No dataframe")
    )
}

/// On-disk `<strategy>.json` holding optimized parameters per space.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyParamsFile {
    pub strategy_name: String,
    pub params: Map<String, Value>,
    pub ft_stratparam_v: u32,
    pub export_time: DateTime<Utc>,
}

pub fn strategy_params_path(dir: &Path, strategy_name: &str) -> PathBuf {
    dir.join(format!("{}.json", strategy_name))
}

pub fn save_strategy_params(
    dir: &Path,
    strategy_name: &str,
    params: Map<String, Value>,
) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create strategy directory {}", dir.display()))?;
    let path = strategy_params_path(dir, strategy_name);
    let file = StrategyParamsFile {
        strategy_name: strategy_name.to_string(),
        params,
        ft_stratparam_v: STRATEGY_PARAMS_FILE_VERSION,
        export_time: Utc::now(),
    };
    let raw = serde_json::to_string_pretty(&file)?;
    fs::write(&path, raw)
        .with_context(|| format!("Failed to write strategy parameters to {}", path.display()))?;
    info!("Strategy parameters exported to {}", path.display());
    Ok(path)
}

pub fn load_strategy_params(dir: &Path, strategy_name: &str) -> Result<Option<StrategyParamsFile>> {
    let path = strategy_params_path(dir, strategy_name);
    if !path.is_file() {
        return Ok(None);
    }
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read strategy parameters {}", path.display()))?;
    let file: StrategyParamsFile = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid strategy parameter file {}", path.display()))?;
    if file.strategy_name != strategy_name {
        return Err(anyhow!(
            "Parameter file {} belongs to strategy {}, not {}",
            path.display(),
            file.strategy_name,
            strategy_name
        ));
    }
    if file.ft_stratparam_v != STRATEGY_PARAMS_FILE_VERSION {
        warn!(
            "Strategy parameter file {} has version {}, expected {}",
            path.display(),
            file.ft_stratparam_v,
            STRATEGY_PARAMS_FILE_VERSION
        );
    }
    Ok(Some(file))
}

/// Applies a parameter file to the strategy's buy/sell/protection parameters
/// and to `risk`.
pub fn apply_strategy_params(
    strategy: &mut dyn Strategy,
    risk: &mut RiskSettings,
    file: &StrategyParamsFile,
) -> Result<()> {
    for space in [SPACE_BUY, SPACE_SELL, SPACE_PROTECTION] {
        let values: ParamsDict = match file.params.get(space) {
            Some(section) => serde_json::from_value(section.clone())
                .with_context(|| format!("Invalid {} section in strategy parameters", space))?,
            None => ParamsDict::new(),
        };
        strategy.parameters_mut().load_space(space, &values)?;
    }
    risk.apply_details(&file.params)
}

/// Exit rules for a run of `strategy`: its own defaults, then the
/// configuration, then a saved parameter file if one exists.
pub fn prepare_strategy(
    strategy: &mut dyn Strategy,
    config: &BacktestConfig,
) -> Result<RiskSettings> {
    let mut risk = strategy.risk_settings();
    risk.apply_config(config)?;
    let name = strategy.name().to_string();
    let dir = config.strategy_params_dir();
    if let Some(file) = load_strategy_params(&dir, &name)? {
        info!(
            "Loading parameters from file {}",
            strategy_params_path(&dir, &name).display()
        );
        apply_strategy_params(strategy, &mut risk, &file)?;
    }
    Ok(risk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::engine_error;
    use chrono::{Duration, TimeZone};

    fn candles(n: usize) -> Arc<Vec<Candle>> {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Arc::new(
            (0..n)
                .map(|i| Candle {
                    date: base + Duration::minutes(5 * i as i64),
                    open: 100.0,
                    high: 101.0,
                    low: 99.0,
                    close: 100.0 + i as f64,
                    volume: 1.0,
                })
                .collect(),
        )
    }

    #[test]
    fn validator_reports_mismatches() {
        let frame = SignalFrame::new(candles(5));
        let validator = StrategyResultValidator::new(&frame, false);
        validator.validate(Some(&frame)).unwrap();

        let mut shorter = frame.clone();
        shorter.trim_startup(1);
        let err = validator.validate(Some(&shorter)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Dataframe returned from strategy has mismatching length."
        );

        let mut changed = frame.clone();
        let mut rows = changed.candles.as_ref().clone();
        rows[4].close = 1.0;
        changed.candles = Arc::new(rows);
        let err = validator.validate(Some(&changed)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Dataframe returned from strategy has mismatching last close price."
        );

        let mut moved = frame.clone();
        let mut rows = moved.candles.as_ref().clone();
        rows[4].date = rows[4].date + Duration::minutes(1);
        moved.candles = Arc::new(rows);
        let err = validator.validate(Some(&moved)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Dataframe returned from strategy has mismatching last date."
        );

        let err = validator.validate(None).unwrap_err();
        assert_eq!(err.to_string(), "No dataframe returned (return statement missing?).");
        assert!(matches!(engine_error(&err), Some(EngineError::Strategy(_))));

        StrategyResultValidator::new(&frame, true)
            .validate(Some(&shorter))
            .unwrap();
    }

    #[test]
    fn safe_wrapper_defaults_or_raises() {
        let value: i32 = strategy_safe_wrapper("", Some(7), false, || Err(anyhow!("boom"))).unwrap();
        assert_eq!(value, 7);
        let value: i32 = strategy_safe_wrapper("", None, true, || Err(anyhow!("boom"))).unwrap();
        assert_eq!(value, 0);
        let err = strategy_safe_wrapper::<i32, _>("", None, false, || Err(anyhow!("boom")))
            .unwrap_err();
        assert!(matches!(engine_error(&err), Some(EngineError::Strategy(msg)) if msg == "boom"));
        let value: i32 = strategy_safe_wrapper("", None, false, || Ok(3)).unwrap();
        assert_eq!(value, 3);
    }

    #[test]
    fn unknown_strategy_is_configuration_error() {
        let err = create_strategy("DoesNotExist").err().unwrap();
        assert!(matches!(
            engine_error(&err),
            Some(EngineError::Configuration(_))
        ));
        assert_eq!(create_strategy("sample").unwrap().name(), "sample");
    }

    #[test]
    fn trim_startup_keeps_columns_aligned() {
        let mut frame = SignalFrame::new(candles(6));
        frame.set_column("x", (0..6).map(|v| v as f64).collect());
        frame.enter_long[3] = true;
        frame.trim_startup(2);
        assert_eq!(frame.len(), 4);
        assert_eq!(frame.column("x").unwrap()[0], 2.0);
        assert!(frame.enter_long[1]);
    }

    #[test]
    fn trim_startup_tolerates_short_signal_columns() {
        let mut frame = SignalFrame::new(candles(6));
        frame.exit_short.truncate(1);
        frame.enter_tag.clear();
        let validator = StrategyResultValidator::new(&SignalFrame::new(candles(6)), true);
        assert!(validator.validate(Some(&frame)).is_ok());

        frame.trim_startup(3);
        assert_eq!(frame.len(), 3);
        assert_eq!(frame.enter_long.len(), 3);
        assert!(frame.exit_short.is_empty());
        assert!(frame.enter_tag.is_empty());
    }

    #[test]
    fn params_file_round_trip_applies_values() {
        let dir = tempfile::tempdir().unwrap();
        let mut strategy = create_strategy("sample").unwrap();
        let mut params = Map::new();
        params.insert("buy".to_string(), serde_json::json!({"buy_rsi": 25}));
        params.insert("stoploss".to_string(), serde_json::json!({"stoploss": -0.2}));
        params.insert("roi".to_string(), serde_json::json!({"0": 0.05, "30": 0.01}));
        save_strategy_params(dir.path(), "sample", params).unwrap();

        let file = load_strategy_params(dir.path(), "sample").unwrap().unwrap();
        assert_eq!(file.ft_stratparam_v, 1);
        let mut risk = strategy.risk_settings();
        apply_strategy_params(strategy.as_mut(), &mut risk, &file).unwrap();
        assert_eq!(strategy.parameters().int_value("buy_rsi", 0), 25);
        assert_eq!(risk.stoploss, -0.2);
        assert_eq!(risk.minimal_roi.min_roi_entry(45), Some((30, 0.01)));
        assert!(load_strategy_params(dir.path(), "other").unwrap().is_none());
    }
}
