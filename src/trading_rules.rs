use crate::config::{BacktestConfig, StakeAmount};
use crate::error::EngineError;
use crate::models::{Candle, Trade};
use crate::parameters::{ParameterValue, ParamsDict};
use crate::space::{self, generate_roi_table};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const PRICE_EPSILON: f64 = 1e-6;

/// Minutes-since-open → minimum profit ratio required to exit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoiTable(pub BTreeMap<i64, f64>);

impl Default for RoiTable {
    fn default() -> Self {
        let mut table = BTreeMap::new();
        table.insert(0, 0.10);
        Self(table)
    }
}

impl RoiTable {
    pub fn from_config(raw: &BTreeMap<String, f64>) -> Result<Self> {
        let mut table = BTreeMap::new();
        for (key, ratio) in raw {
            let minutes = key.trim().parse::<i64>().map_err(|_| {
                EngineError::configuration(format!("Invalid minimal_roi key '{}'", key))
            })?;
            table.insert(minutes, *ratio);
        }
        Ok(Self(table))
    }

    /// Entry with the largest key not after `elapsed_minutes`. Negative elapsed
    /// times never match.
    pub fn min_roi_entry(&self, elapsed_minutes: i64) -> Option<(i64, f64)> {
        if elapsed_minutes < 0 {
            return None;
        }
        self.0
            .range(..=elapsed_minutes)
            .next_back()
            .map(|(minutes, ratio)| (*minutes, *ratio))
    }

    pub fn to_json(&self) -> Value {
        Value::Object(
            self.0
                .iter()
                .map(|(minutes, ratio)| (minutes.to_string(), Value::from(*ratio)))
                .collect(),
        )
    }
}

/// Exit rules of one run: strategy defaults overridden by configuration,
/// a parameter file, then the epoch's asked point.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskSettings {
    pub minimal_roi: RoiTable,
    pub stoploss: f64,
    pub trailing_stop: bool,
    pub trailing_stop_positive: Option<f64>,
    pub trailing_stop_positive_offset: f64,
    pub trailing_only_offset_is_reached: bool,
    pub stoploss_on_exchange: bool,
    pub use_exit_signal: bool,
    pub exit_profit_only: bool,
    pub exit_profit_offset: f64,
    pub ignore_roi_if_entry_signal: bool,
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            minimal_roi: RoiTable::default(),
            stoploss: -0.10,
            trailing_stop: false,
            trailing_stop_positive: None,
            trailing_stop_positive_offset: 0.0,
            trailing_only_offset_is_reached: false,
            stoploss_on_exchange: false,
            use_exit_signal: true,
            exit_profit_only: false,
            exit_profit_offset: 0.0,
            ignore_roi_if_entry_signal: false,
        }
    }
}

impl RiskSettings {
    pub fn apply_config(&mut self, config: &BacktestConfig) -> Result<()> {
        if let Some(roi) = &config.minimal_roi {
            self.minimal_roi = RoiTable::from_config(roi)?;
        }
        if let Some(stoploss) = config.stoploss {
            self.stoploss = stoploss;
        }
        if let Some(trailing) = config.trailing_stop {
            self.trailing_stop = trailing;
        }
        if config.trailing_stop_positive.is_some() {
            self.trailing_stop_positive = config.trailing_stop_positive;
        }
        if let Some(offset) = config.trailing_stop_positive_offset {
            self.trailing_stop_positive_offset = offset;
        }
        if let Some(only_offset) = config.trailing_only_offset_is_reached {
            self.trailing_only_offset_is_reached = only_offset;
        }
        self.stoploss_on_exchange = config.stoploss_on_exchange;
        self.use_exit_signal = config.use_exit_signal;
        self.exit_profit_only = config.exit_profit_only;
        self.exit_profit_offset = config.exit_profit_offset;
        self.ignore_roi_if_entry_signal = config.ignore_roi_if_entry_signal;
        Ok(())
    }

    /// Applies the roi/stoploss/trailing parts of an asked point.
    pub fn apply_params(&mut self, params: &ParamsDict, spaces: &[String]) {
        if space::has_space(spaces, space::SPACE_ROI) {
            self.minimal_roi = RoiTable(generate_roi_table(params));
        }
        if space::has_space(spaces, space::SPACE_STOPLOSS) {
            if let Some(stoploss) = params.get("stoploss").and_then(ParameterValue::as_f64) {
                self.stoploss = stoploss;
            }
        }
        if space::has_space(spaces, space::SPACE_TRAILING) {
            let settings = space::trailing_settings(params);
            self.apply_trailing_json(&settings);
        }
    }

    /// Applies a `params` section of a strategy parameter file.
    pub fn apply_details(&mut self, details: &serde_json::Map<String, Value>) -> Result<()> {
        if let Some(Value::Object(roi)) = details.get(space::SPACE_ROI) {
            let raw: BTreeMap<String, f64> = roi
                .iter()
                .filter_map(|(k, v)| Some((k.clone(), v.as_f64()?)))
                .collect();
            self.minimal_roi = RoiTable::from_config(&raw)?;
        }
        if let Some(stoploss) = details
            .get(space::SPACE_STOPLOSS)
            .and_then(|section| section.get("stoploss"))
            .and_then(Value::as_f64)
        {
            self.stoploss = stoploss;
        }
        if let Some(Value::Object(trailing)) = details.get(space::SPACE_TRAILING) {
            self.apply_trailing_json(trailing);
        }
        Ok(())
    }

    fn apply_trailing_json(&mut self, settings: &serde_json::Map<String, Value>) {
        if let Some(enabled) = settings.get("trailing_stop").and_then(Value::as_bool) {
            self.trailing_stop = enabled;
        }
        if let Some(positive) = settings.get("trailing_stop_positive").and_then(Value::as_f64) {
            self.trailing_stop_positive = Some(positive);
        }
        if let Some(offset) = settings
            .get("trailing_stop_positive_offset")
            .and_then(Value::as_f64)
        {
            self.trailing_stop_positive_offset = offset;
        }
        if let Some(only_offset) = settings
            .get("trailing_only_offset_is_reached")
            .and_then(Value::as_bool)
        {
            self.trailing_only_offset_is_reached = only_offset;
        }
    }

    /// Stoploss ratio to trail with at `bound_profit`, or `None` when trailing
    /// is inactive.
    pub fn trailing_stop_ratio(&self, bound_profit: f64) -> Option<f64> {
        let offset = self.trailing_stop_positive_offset;
        if !self.trailing_stop || (self.trailing_only_offset_is_reached && bound_profit <= offset) {
            return None;
        }
        match self.trailing_stop_positive {
            Some(positive) if bound_profit > offset => Some(positive),
            _ => Some(self.stoploss),
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "minimal_roi": self.minimal_roi.to_json(),
            "stoploss": self.stoploss,
            "trailing_stop": self.trailing_stop,
            "trailing_stop_positive": self.trailing_stop_positive,
            "trailing_stop_positive_offset": self.trailing_stop_positive_offset,
            "trailing_only_offset_is_reached": self.trailing_only_offset_is_reached,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StakeSizingOutcome {
    Sized(f64),
    NoSlot,
    InsufficientBalance { required: f64, available: f64 },
}

pub struct StakeSizingParams {
    pub stake_amount: StakeAmount,
    pub free_balance: f64,
    pub tied_up: f64,
    pub tradable_balance_ratio: f64,
    pub open_trade_count: usize,
    pub max_open_trades: Option<usize>,
}

/// Stake for a new trade. Unlimited stakes split the tradable balance evenly
/// over the slots still free at the time of the entry.
pub fn determine_stake_amount(params: StakeSizingParams) -> StakeSizingOutcome {
    let StakeSizingParams {
        stake_amount,
        free_balance,
        tied_up,
        tradable_balance_ratio,
        open_trade_count,
        max_open_trades,
    } = params;

    if let Some(max) = max_open_trades {
        if open_trade_count >= max {
            return StakeSizingOutcome::NoSlot;
        }
    }

    let tradable = (free_balance + tied_up) * tradable_balance_ratio - tied_up;
    let available = tradable.min(free_balance).max(0.0);

    match stake_amount {
        StakeAmount::Fixed(amount) => {
            if amount > available + PRICE_EPSILON {
                StakeSizingOutcome::InsufficientBalance {
                    required: amount,
                    available,
                }
            } else {
                StakeSizingOutcome::Sized(amount)
            }
        }
        StakeAmount::Unlimited => {
            let slots = max_open_trades
                .map(|max| max.saturating_sub(open_trade_count))
                .unwrap_or(1)
                .max(1);
            let stake = available / slots as f64;
            if stake <= PRICE_EPSILON {
                StakeSizingOutcome::InsufficientBalance {
                    required: PRICE_EPSILON,
                    available,
                }
            } else {
                StakeSizingOutcome::Sized(stake)
            }
        }
    }
}

fn clamp_to_candle(price: f64, candle: &Candle) -> f64 {
    price.clamp(candle.low, candle.high.max(candle.low))
}

/// Fill price of a stop at `stop_loss`, or `None` if the candle never reached
/// it. A candle that opens beyond the stop fills at the open.
pub fn stop_loss_exit_price(current_candle: &Candle, stop_loss: f64, is_short: bool) -> Option<f64> {
    let fill = if !is_short {
        if current_candle.low > stop_loss {
            return None;
        }
        if current_candle.open <= stop_loss {
            current_candle.open
        } else {
            stop_loss
        }
    } else {
        if current_candle.high < stop_loss {
            return None;
        }
        if current_candle.open >= stop_loss {
            current_candle.open
        } else {
            stop_loss
        }
    };
    Some(clamp_to_candle(fill, current_candle))
}

/// Fill price of a stop that may have been trailed during `current_candle`.
/// Only a candle that opened beyond the stop resting before it (`resting_stop`)
/// fills at the open; otherwise the trade leaves at the current stop.
pub fn trailed_stop_exit_price(
    current_candle: &Candle,
    resting_stop: f64,
    stop_loss: f64,
    is_short: bool,
) -> Option<f64> {
    let reached = if is_short {
        current_candle.high >= stop_loss
    } else {
        current_candle.low <= stop_loss
    };
    if !reached {
        return None;
    }
    let gapped = if is_short {
        current_candle.open >= resting_stop
    } else {
        current_candle.open <= resting_stop
    };
    let fill = if gapped { current_candle.open } else { stop_loss };
    Some(clamp_to_candle(fill, current_candle))
}

/// Close rate at which `trade` gains `roi` of its open rate after both fees.
pub fn roi_close_rate(trade: &Trade, roi: f64) -> f64 {
    let side = trade.side_sign();
    let leverage = if trade.leverage > 0.0 { trade.leverage } else { 1.0 };
    -(trade.open_rate * roi / leverage + side * trade.open_rate * (1.0 + side * trade.fee_open))
        / (trade.fee_close - side)
}

pub struct RoiExitParams<'a> {
    pub trade: &'a Trade,
    pub roi: f64,
    pub roi_entry_minutes: i64,
    pub candle: &'a Candle,
    pub trade_duration_minutes: i64,
    pub timeframe_minutes: i64,
}

/// Fill price of an ROI exit. When the ROI step became active with this candle
/// and the open already satisfied it, the trade fills at the open.
pub fn roi_exit_price(params: RoiExitParams) -> f64 {
    let RoiExitParams {
        trade,
        roi,
        roi_entry_minutes,
        candle,
        trade_duration_minutes,
        timeframe_minutes,
    } = params;

    let close_rate = roi_close_rate(trade, roi);
    let just_activated = roi_entry_minutes > 0
        && trade_duration_minutes - timeframe_minutes < roi_entry_minutes
        && trade_duration_minutes >= roi_entry_minutes;
    let open_beyond = if trade.is_short {
        candle.open < close_rate
    } else {
        candle.open > close_rate
    };
    if just_activated && open_beyond {
        return candle.open;
    }
    if roi == -1.0 && roi_entry_minutes == trade_duration_minutes {
        return candle.open;
    }
    clamp_to_candle(close_rate, candle)
}

/// Whether an exit signal may be honoured under `exit_profit_only`.
pub fn exit_signal_allowed(settings: &RiskSettings, current_profit: f64) -> bool {
    !settings.exit_profit_only || current_profit > settings.exit_profit_offset
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MarginMode, TradeId, TradingMode};
    use chrono::{TimeZone, Utc};

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            date: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            open,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    fn trade(is_short: bool) -> Trade {
        Trade {
            id: TradeId(1),
            pair: "ETH/USDT".to_string(),
            is_short,
            is_open: true,
            open_date: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            close_date: None,
            open_rate: 100.0,
            close_rate: None,
            amount: 1.0,
            stake_amount: 100.0,
            leverage: 1.0,
            trading_mode: TradingMode::Spot,
            margin_mode: MarginMode::Isolated,
            fee_open: 0.001,
            fee_close: 0.001,
            funding_fees: 0.0,
            close_profit: None,
            close_profit_abs: None,
            stop_loss: 0.0,
            stop_loss_pct: 0.0,
            initial_stop_loss: 0.0,
            initial_stop_loss_pct: None,
            is_stop_loss_trailing: false,
            max_rate: 100.0,
            min_rate: 100.0,
            liquidation_price: None,
            exit_type: None,
            exit_reason: None,
            enter_tag: None,
            orders: Vec::new(),
        }
    }

    #[test]
    fn roi_lookup_uses_largest_key_not_after_elapsed() {
        let mut raw = BTreeMap::new();
        raw.insert("0".to_string(), 0.10);
        raw.insert("30".to_string(), 0.05);
        raw.insert("60".to_string(), 0.02);
        let table = RoiTable::from_config(&raw).unwrap();
        assert_eq!(table.min_roi_entry(45), Some((30, 0.05)));
        assert_eq!(table.min_roi_entry(120), Some((60, 0.02)));
        assert_eq!(table.min_roi_entry(0), Some((0, 0.10)));
        assert_eq!(table.min_roi_entry(-1), None);

        let mut late = BTreeMap::new();
        late.insert(10, 0.01);
        assert_eq!(RoiTable(late).min_roi_entry(5), None);
    }

    #[test]
    fn roi_close_rate_realises_ratio_of_open_rate_after_fees() {
        let long = trade(false);
        let rate = roi_close_rate(&long, 0.05);
        assert!((long.calc_profit(rate) - 5.0).abs() < 1e-9);

        let short = trade(true);
        let rate = roi_close_rate(&short, 0.05);
        assert!(rate < 100.0);
        assert!((short.calc_profit(rate) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn roi_exit_uses_open_when_step_just_activated() {
        let long = trade(false);
        let c = candle(110.0, 112.0, 108.0, 111.0);
        let price = roi_exit_price(RoiExitParams {
            trade: &long,
            roi: 0.05,
            roi_entry_minutes: 30,
            candle: &c,
            trade_duration_minutes: 30,
            timeframe_minutes: 5,
        });
        assert_eq!(price, 110.0);

        let price = roi_exit_price(RoiExitParams {
            trade: &long,
            roi: 0.05,
            roi_entry_minutes: 30,
            candle: &c,
            trade_duration_minutes: 60,
            timeframe_minutes: 5,
        });
        assert!((price - 110.0).abs() > 1e-9);
        assert!(price >= c.low && price <= c.high);
    }

    #[test]
    fn stop_loss_exit_price_prefers_open_gap() {
        let c = candle(9.0, 12.0, 8.5, 10.0);
        assert_eq!(stop_loss_exit_price(&c, 9.5, false), Some(9.0));
        assert!(stop_loss_exit_price(&c, 8.0, false).is_none());

        let mut short_candle = candle(12.5, 12.5, 9.0, 10.0);
        assert_eq!(stop_loss_exit_price(&short_candle, 12.0, true), Some(12.5));
        short_candle.open = 11.5;
        assert_eq!(stop_loss_exit_price(&short_candle, 12.0, true), Some(12.0));
        assert!(stop_loss_exit_price(&short_candle, 13.0, true).is_none());
    }

    #[test]
    fn unlimited_stake_splits_over_free_slots() {
        let outcome = determine_stake_amount(StakeSizingParams {
            stake_amount: StakeAmount::Unlimited,
            free_balance: 900.0,
            tied_up: 0.0,
            tradable_balance_ratio: 1.0,
            open_trade_count: 0,
            max_open_trades: Some(3),
        });
        assert_eq!(outcome, StakeSizingOutcome::Sized(300.0));

        let outcome = determine_stake_amount(StakeSizingParams {
            stake_amount: StakeAmount::Unlimited,
            free_balance: 600.0,
            tied_up: 300.0,
            tradable_balance_ratio: 1.0,
            open_trade_count: 1,
            max_open_trades: Some(3),
        });
        assert_eq!(outcome, StakeSizingOutcome::Sized(300.0));

        let outcome = determine_stake_amount(StakeSizingParams {
            stake_amount: StakeAmount::Unlimited,
            free_balance: 600.0,
            tied_up: 300.0,
            tradable_balance_ratio: 1.0,
            open_trade_count: 3,
            max_open_trades: Some(3),
        });
        assert_eq!(outcome, StakeSizingOutcome::NoSlot);
    }

    #[test]
    fn fixed_stake_above_balance_is_rejected() {
        let outcome = determine_stake_amount(StakeSizingParams {
            stake_amount: StakeAmount::Fixed(500.0),
            free_balance: 400.0,
            tied_up: 0.0,
            tradable_balance_ratio: 0.99,
            open_trade_count: 0,
            max_open_trades: None,
        });
        assert!(matches!(
            outcome,
            StakeSizingOutcome::InsufficientBalance { required, .. } if required == 500.0
        ));
    }

    #[test]
    fn trailing_waits_for_offset_when_configured() {
        let settings = RiskSettings {
            trailing_stop: true,
            trailing_stop_positive: Some(0.02),
            trailing_stop_positive_offset: 0.05,
            trailing_only_offset_is_reached: true,
            ..RiskSettings::default()
        };
        assert_eq!(settings.trailing_stop_ratio(0.03), None);
        assert_eq!(settings.trailing_stop_ratio(0.06), Some(0.02));

        let loose = RiskSettings {
            trailing_only_offset_is_reached: false,
            ..settings.clone()
        };
        assert_eq!(loose.trailing_stop_ratio(0.03), Some(-0.10));
        assert!(RiskSettings::default().trailing_stop_ratio(0.5).is_none());
    }

    #[test]
    fn params_override_roi_and_stoploss() {
        let mut settings = RiskSettings::default();
        let mut params = ParamsDict::new();
        params.insert("stoploss".into(), ParameterValue::Float(-0.2));
        params.insert("roi_t1".into(), ParameterValue::Int(60));
        params.insert("roi_t2".into(), ParameterValue::Int(30));
        params.insert("roi_t3".into(), ParameterValue::Int(10));
        params.insert("roi_p1".into(), ParameterValue::Float(0.01));
        params.insert("roi_p2".into(), ParameterValue::Float(0.01));
        params.insert("roi_p3".into(), ParameterValue::Float(0.01));
        settings.apply_params(&params, &["stoploss".to_string()]);
        assert_eq!(settings.stoploss, -0.2);
        assert_eq!(settings.minimal_roi, RoiTable::default());
        settings.apply_params(&params, &["roi".to_string()]);
        assert_eq!(settings.minimal_roi.min_roi_entry(0), Some((0, 0.03)));
    }

    #[test]
    fn trailed_stop_fills_at_stop_unless_candle_gapped() {
        let c = candle(100.0, 120.0, 100.0, 119.0);
        assert_eq!(trailed_stop_exit_price(&c, 90.0, 114.0, false), Some(114.0));
        let gap = candle(85.0, 92.0, 84.0, 88.0);
        assert_eq!(trailed_stop_exit_price(&gap, 90.0, 90.0, false), Some(85.0));
        assert_eq!(trailed_stop_exit_price(&c, 90.0, 95.0, false), None);
        let short = candle(100.0, 104.0, 90.0, 95.0);
        assert_eq!(trailed_stop_exit_price(&short, 110.0, 94.5, true), Some(94.5));
    }
}
