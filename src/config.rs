use crate::error::EngineError;
use crate::models::{MarginMode, TradingMode};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_FEE_RATE: f64 = 0.001;
pub const UNLIMITED_STAKE_AMOUNT: &str = "unlimited";

/// Stake per trade: a fixed amount or an even split of the free balance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum StakeAmount {
    Fixed(f64),
    Unlimited,
}

impl StakeAmount {
    pub fn is_unlimited(&self) -> bool {
        matches!(self, StakeAmount::Unlimited)
    }
}

impl TryFrom<Value> for StakeAmount {
    type Error = String;

    fn try_from(value: Value) -> std::result::Result<Self, Self::Error> {
        match value {
            Value::Number(number) => number
                .as_f64()
                .map(StakeAmount::Fixed)
                .ok_or_else(|| format!("stake_amount must be a finite number (value: {})", number)),
            Value::String(text) if text.trim().eq_ignore_ascii_case(UNLIMITED_STAKE_AMOUNT) => {
                Ok(StakeAmount::Unlimited)
            }
            other => Err(format!(
                "stake_amount must be a number or \"unlimited\" (value: {})",
                other
            )),
        }
    }
}

impl From<StakeAmount> for Value {
    fn from(stake: StakeAmount) -> Self {
        match stake {
            StakeAmount::Fixed(amount) => Value::from(amount),
            StakeAmount::Unlimited => Value::String(UNLIMITED_STAKE_AMOUNT.to_string()),
        }
    }
}

/// Starting balance: one scalar, or one value per currency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DryRunWallet {
    Scalar(f64),
    PerCurrency(BTreeMap<String, f64>),
}

impl DryRunWallet {
    pub fn balance(&self, stake_currency: &str) -> Result<f64> {
        match self {
            DryRunWallet::Scalar(value) => Ok(*value),
            DryRunWallet::PerCurrency(values) => values.get(stake_currency).copied().ok_or_else(|| {
                EngineError::configuration(format!(
                    "dry_run_wallet has no balance for stake currency {}",
                    stake_currency
                ))
                .into()
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossFunctionName {
    #[serde(rename = "SharpeHyperOptLoss")]
    Sharpe,
    #[serde(rename = "SortinoHyperOptLoss")]
    Sortino,
    #[serde(rename = "CalmarHyperOptLoss")]
    Calmar,
    #[serde(rename = "MaxDrawDownPerPairHyperOptLoss")]
    MaxDrawDownPerPair,
}

impl LossFunctionName {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sharpehyperoptloss" | "sharpe" => Ok(Self::Sharpe),
            "sortinohyperoptloss" | "sortino" => Ok(Self::Sortino),
            "calmarhyperoptloss" | "calmar" => Ok(Self::Calmar),
            "maxdrawdownperpairhyperoptloss" | "max_drawdown_per_pair" => {
                Ok(Self::MaxDrawDownPerPair)
            }
            _ => Err(EngineError::configuration(format!(
                "Unknown hyperopt loss function {} (expected SharpeHyperOptLoss, SortinoHyperOptLoss, CalmarHyperOptLoss or MaxDrawDownPerPairHyperOptLoss)",
                raw
            ))
            .into()),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Sharpe => "SharpeHyperOptLoss",
            Self::Sortino => "SortinoHyperOptLoss",
            Self::Calmar => "CalmarHyperOptLoss",
            Self::MaxDrawDownPerPair => "MaxDrawDownPerPairHyperOptLoss",
        }
    }
}

/// Search strategy used by hyperopt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerName {
    Tpe,
    Random,
}

impl SamplerName {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "tpesampler" | "tpe" => Ok(Self::Tpe),
            "randomsampler" | "random" => Ok(Self::Random),
            _ => Err(EngineError::configuration(format!(
                "Unknown hyperopt sampler {} (expected TPESampler or RandomSampler)",
                raw
            ))
            .into()),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Tpe => "TPESampler",
            Self::Random => "RandomSampler",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderflowConfig {
    pub scale: f64,
    pub imbalance_ratio: f64,
    pub imbalance_volume: f64,
    pub stacked_imbalance_range: usize,
    pub max_candles: usize,
}

impl Default for OrderflowConfig {
    fn default() -> Self {
        Self {
            scale: 0.5,
            imbalance_ratio: 3.0,
            imbalance_volume: 0.0,
            stacked_imbalance_range: 3,
            max_candles: 1500,
        }
    }
}

/// Run configuration. Unset keys fall back to `Default`; strategy-level risk
/// settings stay `None` unless the file overrides the strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    pub strategy: String,
    pub stake_currency: String,
    pub stake_amount: StakeAmount,
    pub tradable_balance_ratio: f64,
    pub dry_run_wallet: DryRunWallet,
    pub max_open_trades: i64,
    pub timeframe: String,
    pub timerange: Option<String>,
    pub pairs: Vec<String>,
    pub fee: Option<f64>,

    pub trading_mode: TradingMode,
    pub margin_mode: MarginMode,
    pub leverage: f64,
    pub exchange: String,
    pub liquidation_buffer: f64,
    pub maintenance_margin_ratio: f64,
    pub maintenance_amount: f64,
    pub max_leverage: f64,
    pub funding_rate: f64,

    pub minimal_roi: Option<BTreeMap<String, f64>>,
    pub stoploss: Option<f64>,
    pub trailing_stop: Option<bool>,
    pub trailing_stop_positive: Option<f64>,
    pub trailing_stop_positive_offset: Option<f64>,
    pub trailing_only_offset_is_reached: Option<bool>,
    pub stoploss_on_exchange: bool,
    pub use_exit_signal: bool,
    pub exit_profit_only: bool,
    pub exit_profit_offset: f64,
    pub ignore_roi_if_entry_signal: bool,
    pub can_short: bool,
    pub position_stacking: bool,
    pub unfilledtimeout_entry_minutes: Option<i64>,

    pub strategy_fail_hard: bool,
    pub strategy_validation_warn_only: bool,

    pub epochs: usize,
    pub hyperopt_jobs: i64,
    pub spaces: Vec<String>,
    pub hyperopt_loss: String,
    pub hyperopt_sampler: String,
    pub hyperopt_min_trades: usize,
    pub hyperopt_random_state: Option<u64>,
    pub analyze_per_epoch: bool,
    pub print_all: bool,
    pub hyperopt_clean: bool,

    pub user_data_dir: PathBuf,
    pub datadir: Option<PathBuf>,
    pub exportfilename: Option<PathBuf>,

    /// Aggregate raw trade prints into order-flow columns before indicators run.
    pub use_public_trades: bool,
    pub orderflow: OrderflowConfig,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            strategy: "sample".to_string(),
            stake_currency: "USDT".to_string(),
            stake_amount: StakeAmount::Unlimited,
            tradable_balance_ratio: 0.99,
            dry_run_wallet: DryRunWallet::Scalar(1000.0),
            max_open_trades: 3,
            timeframe: "5m".to_string(),
            timerange: None,
            pairs: Vec::new(),
            fee: None,
            trading_mode: TradingMode::Spot,
            margin_mode: MarginMode::Isolated,
            leverage: 1.0,
            exchange: "binance".to_string(),
            liquidation_buffer: 0.05,
            maintenance_margin_ratio: 0.01,
            maintenance_amount: 0.0,
            max_leverage: 20.0,
            funding_rate: 0.0,
            minimal_roi: None,
            stoploss: None,
            trailing_stop: None,
            trailing_stop_positive: None,
            trailing_stop_positive_offset: None,
            trailing_only_offset_is_reached: None,
            stoploss_on_exchange: false,
            use_exit_signal: true,
            exit_profit_only: false,
            exit_profit_offset: 0.0,
            ignore_roi_if_entry_signal: false,
            can_short: false,
            position_stacking: false,
            unfilledtimeout_entry_minutes: None,
            strategy_fail_hard: false,
            strategy_validation_warn_only: false,
            epochs: 100,
            hyperopt_jobs: -1,
            spaces: vec!["default".to_string()],
            hyperopt_loss: LossFunctionName::Sharpe.label().to_string(),
            hyperopt_sampler: SamplerName::Tpe.label().to_string(),
            hyperopt_min_trades: 1,
            hyperopt_random_state: None,
            analyze_per_epoch: false,
            print_all: false,
            hyperopt_clean: false,
            user_data_dir: PathBuf::from("user_data"),
            datadir: None,
            exportfilename: None,
            use_public_trades: false,
            orderflow: OrderflowConfig::default(),
        }
    }
}

impl BacktestConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration at {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid configuration file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure_range("tradable_balance_ratio", self.tradable_balance_ratio, Some(0.0), Some(1.0))?;
        if self.tradable_balance_ratio == 0.0 {
            return Err(config_error("Setting tradable_balance_ratio must be > 0 (value: 0)"));
        }
        ensure_range("leverage", self.leverage, Some(1.0), None)?;
        ensure_range("liquidation_buffer", self.liquidation_buffer, Some(0.0), Some(0.99))?;
        ensure_range(
            "maintenance_margin_ratio",
            self.maintenance_margin_ratio,
            Some(0.0),
            Some(1.0),
        )?;
        ensure_range("max_leverage", self.max_leverage, Some(1.0), None)?;
        if let Some(fee) = self.fee {
            ensure_range("fee", fee, Some(0.0), Some(0.1))?;
        }

        if let StakeAmount::Fixed(amount) = self.stake_amount {
            if !(amount.is_finite() && amount > 0.0) {
                return Err(config_error(format!(
                    "Setting stake_amount must be > 0 (value: {})",
                    amount
                )));
            }
        }
        if self.stake_amount.is_unlimited() && self.max_open_trades_limit().is_none() {
            return Err(config_error(
                "`max_open_trades` and `stake_amount` cannot both be unlimited.",
            ));
        }
        if self.max_open_trades < -1 {
            return Err(config_error(format!(
                "Setting max_open_trades must be >= -1 (value: {})",
                self.max_open_trades
            )));
        }

        let wallet = self.starting_balance()?;
        ensure_range("dry_run_wallet", wallet, Some(0.0), None)?;

        if self.can_short && self.trading_mode == TradingMode::Spot {
            return Err(config_error(
                "Short trading requires trading_mode futures (can_short is set in spot mode).",
            ));
        }
        if self.leverage > 1.0 && self.trading_mode == TradingMode::Spot {
            return Err(config_error(format!(
                "Leverage {} requires trading_mode futures.",
                self.leverage
            )));
        }

        crate::candle_utils::timeframe_to_minutes(&self.timeframe)
            .map_err(|err| config_error(err.to_string()))?;
        if let Some(raw) = self.timerange.as_deref() {
            crate::candle_utils::TimeRange::parse(raw)
                .map_err(|err| config_error(err.to_string()))?;
        }

        if let Some(roi) = &self.minimal_roi {
            for key in roi.keys() {
                if key.trim().parse::<i64>().map(|v| v < 0).unwrap_or(true) {
                    return Err(config_error(format!(
                        "minimal_roi keys must be non-negative minutes (value: {})",
                        key
                    )));
                }
            }
        }
        if let Some(stoploss) = self.stoploss {
            ensure_range("stoploss", stoploss, Some(-1.0), Some(0.0))?;
        }

        if self.hyperopt_jobs == 0 {
            return Err(config_error("Setting hyperopt_jobs must not be 0"));
        }
        LossFunctionName::parse(&self.hyperopt_loss)?;
        SamplerName::parse(&self.hyperopt_sampler)?;
        crate::space::resolve_spaces(&self.spaces)?;
        Ok(())
    }

    pub fn starting_balance(&self) -> Result<f64> {
        self.dry_run_wallet.balance(&self.stake_currency)
    }

    pub fn fee_rate(&self) -> f64 {
        self.fee.unwrap_or(DEFAULT_FEE_RATE)
    }

    /// `None` means no cap on concurrently open trades.
    pub fn max_open_trades_limit(&self) -> Option<usize> {
        max_open_trades_limit(self.max_open_trades)
    }

    pub fn loss_function(&self) -> Result<LossFunctionName> {
        LossFunctionName::parse(&self.hyperopt_loss)
    }

    pub fn sampler(&self) -> Result<SamplerName> {
        SamplerName::parse(&self.hyperopt_sampler)
    }

    /// Resolves the worker count the way `-1 = all cores, -2 = all but one` reads.
    pub fn effective_jobs(&self) -> usize {
        let cpus = std::cmp::max(1, num_cpus::get()) as i64;
        let jobs = if self.hyperopt_jobs < 0 {
            cpus + 1 + self.hyperopt_jobs
        } else {
            self.hyperopt_jobs
        };
        std::cmp::max(1, jobs) as usize
    }

    pub fn datadir(&self) -> PathBuf {
        self.datadir
            .clone()
            .unwrap_or_else(|| self.user_data_dir.join("data"))
    }

    pub fn export_path(&self) -> PathBuf {
        self.exportfilename
            .clone()
            .unwrap_or_else(|| self.user_data_dir.join("backtest_results"))
    }

    pub fn hyperopt_results_dir(&self) -> PathBuf {
        self.user_data_dir.join("hyperopt_results")
    }

    pub fn strategy_params_dir(&self) -> PathBuf {
        self.user_data_dir.join("strategies")
    }

    /// Copy safe to persist next to results.
    pub fn sanitized(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(|err| anyhow!("Failed to serialize config: {}", err))
    }
}

pub fn max_open_trades_limit(raw: i64) -> Option<usize> {
    if raw < 0 {
        None
    } else {
        Some(raw as usize)
    }
}

fn config_error(message: impl Into<String>) -> anyhow::Error {
    EngineError::configuration(message).into()
}

fn ensure_range(key: &str, value: f64, min: Option<f64>, max: Option<f64>) -> Result<f64> {
    if !value.is_finite() {
        return Err(config_error(format!(
            "Setting {} must be finite (value: {})",
            key, value
        )));
    }
    if let Some(min_value) = min {
        if value < min_value {
            return Err(config_error(format!(
                "Setting {} must be >= {} (value: {})",
                key, min_value, value
            )));
        }
    }
    if let Some(max_value) = max {
        if value > max_value {
            return Err(config_error(format!(
                "Setting {} must be <= {} (value: {})",
                key, max_value, value
            )));
        }
    }
    Ok(value)
}
