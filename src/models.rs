use anyhow::{anyhow, Result as AnyResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub date: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    #[default]
    Spot,
    Futures,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MarginMode {
    #[default]
    Isolated,
    Cross,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExitType {
    Liquidation,
    StoplossOnExchange,
    CustomExit,
    Roi,
    TrailingStopLoss,
    StopLoss,
    ExitSignal,
    ForceExit,
}

impl ExitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitType::Liquidation => "liquidation",
            ExitType::StoplossOnExchange => "stoploss_on_exchange",
            ExitType::CustomExit => "custom_exit",
            ExitType::Roi => "roi",
            ExitType::TrailingStopLoss => "trailing_stop_loss",
            ExitType::StopLoss => "stop_loss",
            ExitType::ExitSignal => "exit_signal",
            ExitType::ForceExit => "force_exit",
        }
    }
}

impl fmt::Display for ExitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExitType {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> AnyResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "liquidation" => Ok(ExitType::Liquidation),
            "stoploss_on_exchange" => Ok(ExitType::StoplossOnExchange),
            "custom_exit" => Ok(ExitType::CustomExit),
            "roi" => Ok(ExitType::Roi),
            "trailing_stop_loss" => Ok(ExitType::TrailingStopLoss),
            "stop_loss" => Ok(ExitType::StopLoss),
            "exit_signal" => Ok(ExitType::ExitSignal),
            "force_exit" => Ok(ExitType::ForceExit),
            other => Err(anyhow!("Unknown exit type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Entry,
    Exit,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Limit,
    Market,
    Stoploss,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Open,
    Closed,
    Canceled,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub side: OrderSide,
    pub order_type: OrderType,
    pub amount: f64,
    pub price: f64,
    pub fee: f64,
    pub status: OrderStatus,
    pub order_date: DateTime<Utc>,
    pub fill_date: Option<DateTime<Utc>>,
}

impl Order {
    pub fn is_open(&self) -> bool {
        self.status == OrderStatus::Open
    }

    pub fn fill(&mut self, price: f64, fee: f64, date: DateTime<Utc>) {
        self.price = price;
        self.fee = fee;
        self.status = OrderStatus::Closed;
        self.fill_date = Some(date);
    }
}

/// Opaque handle into the engine's trade arena.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct TradeId(pub usize);

impl fmt::Display for TradeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trade {
    pub id: TradeId,
    pub pair: String,
    pub is_short: bool,
    pub is_open: bool,
    pub open_date: DateTime<Utc>,
    pub close_date: Option<DateTime<Utc>>,
    pub open_rate: f64,
    pub close_rate: Option<f64>,
    pub amount: f64,
    pub stake_amount: f64,
    pub leverage: f64,
    pub trading_mode: TradingMode,
    pub margin_mode: MarginMode,
    pub fee_open: f64,
    pub fee_close: f64,
    pub funding_fees: f64,
    pub close_profit: Option<f64>,
    pub close_profit_abs: Option<f64>,
    pub stop_loss: f64,
    pub stop_loss_pct: f64,
    pub initial_stop_loss: f64,
    pub initial_stop_loss_pct: Option<f64>,
    pub is_stop_loss_trailing: bool,
    pub max_rate: f64,
    pub min_rate: f64,
    pub liquidation_price: Option<f64>,
    pub exit_type: Option<ExitType>,
    pub exit_reason: Option<String>,
    pub enter_tag: Option<String>,
    pub orders: Vec<Order>,
}

impl Trade {
    pub fn side_sign(&self) -> f64 {
        if self.is_short {
            -1.0
        } else {
            1.0
        }
    }

    pub fn direction(&self) -> &'static str {
        if self.is_short {
            "short"
        } else {
            "long"
        }
    }

    pub fn open_trade_value(&self) -> f64 {
        let open_trade = self.amount * self.open_rate;
        let fees = open_trade * self.fee_open;
        if self.is_short {
            open_trade - fees
        } else {
            open_trade + fees
        }
    }

    pub fn close_trade_value(&self, rate: f64) -> f64 {
        let close_trade = self.amount * rate;
        let fees = close_trade * self.fee_close;
        let funding = match self.trading_mode {
            TradingMode::Futures => self.funding_fees,
            TradingMode::Spot => 0.0,
        };
        if self.is_short {
            close_trade + fees - funding
        } else {
            close_trade - fees + funding
        }
    }

    /// Absolute profit in stake currency if the trade closed at `rate`.
    pub fn calc_profit(&self, rate: f64) -> f64 {
        let open_value = self.open_trade_value();
        let close_value = self.close_trade_value(rate);
        if self.is_short {
            open_value - close_value
        } else {
            close_value - open_value
        }
    }

    /// Profit ratio relative to the stake, leverage included.
    pub fn calc_profit_ratio(&self, rate: f64) -> f64 {
        let open_value = self.open_trade_value();
        if open_value == 0.0 {
            return 0.0;
        }
        let close_value = self.close_trade_value(rate);
        let ratio = if self.is_short {
            1.0 - close_value / open_value
        } else {
            close_value / open_value - 1.0
        };
        ratio * self.leverage
    }

    pub fn duration_minutes(&self, now: DateTime<Utc>) -> i64 {
        (now - self.open_date).num_minutes()
    }

    /// Moves the stop toward profit only. The first call fixes the initial stop.
    pub fn adjust_stop_loss(&mut self, current_price: f64, stoploss: f64, initial: bool) {
        if initial && self.initial_stop_loss_pct.is_some() {
            return;
        }
        let leverage = if self.leverage > 0.0 { self.leverage } else { 1.0 };
        let distance = (stoploss / leverage).abs();
        let new_loss = if self.is_short {
            current_price * (1.0 + distance)
        } else {
            current_price * (1.0 - distance)
        };

        if self.initial_stop_loss_pct.is_none() {
            self.set_stop_loss(new_loss, stoploss);
            self.initial_stop_loss = self.stop_loss;
            self.initial_stop_loss_pct = Some(-stoploss.abs());
            return;
        }

        let moves_favourably = if self.is_short {
            new_loss < self.stop_loss
        } else {
            new_loss > self.stop_loss
        };
        if moves_favourably {
            self.set_stop_loss(new_loss, stoploss);
            self.is_stop_loss_trailing = true;
        }
    }

    fn set_stop_loss(&mut self, stop_loss: f64, stoploss_ratio: f64) {
        let bounded = match self.liquidation_price {
            Some(liquidation) if self.is_short => stop_loss.min(liquidation),
            Some(liquidation) => stop_loss.max(liquidation),
            None => stop_loss,
        };
        self.stop_loss = bounded;
        self.stop_loss_pct = -stoploss_ratio.abs();
    }

    pub fn set_liquidation_price(&mut self, liquidation_price: Option<f64>) {
        self.liquidation_price = liquidation_price;
        if liquidation_price.is_some() && self.initial_stop_loss_pct.is_some() {
            let ratio = self.stop_loss_pct;
            self.set_stop_loss(self.stop_loss, ratio);
        }
    }

    pub fn update_rate_extremes(&mut self, high: f64, low: f64) {
        self.max_rate = self.max_rate.max(high);
        self.min_rate = if self.min_rate > 0.0 {
            self.min_rate.min(low)
        } else {
            low
        };
    }

    pub fn has_open_orders(&self) -> bool {
        self.orders.iter().any(Order::is_open)
    }

    pub fn close(
        &mut self,
        rate: f64,
        date: DateTime<Utc>,
        exit_type: ExitType,
        exit_reason: Option<String>,
    ) {
        let fee = self.amount * rate * self.fee_close;
        self.orders.push(Order {
            side: OrderSide::Exit,
            order_type: match exit_type {
                ExitType::StopLoss
                | ExitType::TrailingStopLoss
                | ExitType::StoplossOnExchange
                | ExitType::Liquidation => OrderType::Stoploss,
                ExitType::Roi => OrderType::Limit,
                _ => OrderType::Market,
            },
            amount: self.amount,
            price: rate,
            fee,
            status: OrderStatus::Closed,
            order_date: date,
            fill_date: Some(date),
        });
        self.close_rate = Some(rate);
        self.close_date = Some(date);
        self.close_profit = Some(self.calc_profit_ratio(rate));
        self.close_profit_abs = Some(self.calc_profit(rate));
        self.exit_type = Some(exit_type);
        self.exit_reason = Some(exit_reason.unwrap_or_else(|| exit_type.as_str().to_string()));
        self.is_open = false;
    }

    pub fn profit_abs(&self) -> f64 {
        self.close_profit_abs.unwrap_or(0.0)
    }

    pub fn profit_ratio(&self) -> f64 {
        self.close_profit.unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RejectedSignal {
    pub pair: String,
    pub date: DateTime<Utc>,
    pub is_short: bool,
    pub enter_tag: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub run_id: String,
    pub strategy: String,
    pub trades: Vec<Trade>,
    pub rejected_signals: usize,
    pub rejected_signal_log: Vec<RejectedSignal>,
    pub timedout_entry_orders: usize,
    pub timedout_exit_orders: usize,
    pub canceled_trade_entries: usize,
    pub canceled_entry_orders: usize,
    pub replaced_entry_orders: usize,
    pub starting_balance: f64,
    pub final_balance: f64,
    pub backtest_start_time: i64,
    pub backtest_end_time: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn sample_trade(is_short: bool) -> Trade {
        let open_date = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Trade {
            id: TradeId(0),
            pair: "BTC/USDT".to_string(),
            is_short,
            is_open: true,
            open_date,
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
    fn profit_includes_both_fees() {
        let trade = sample_trade(false);
        let profit = trade.calc_profit(110.0);
        let expected = 110.0 * 0.999 - 100.0 * 1.001;
        assert!((profit - expected).abs() < 1e-9);
        let ratio = trade.calc_profit_ratio(110.0);
        assert!((ratio - (110.0 * 0.999 / 100.1 - 1.0)).abs() < 1e-9);
    }

    #[test]
    fn short_profit_is_mirrored() {
        let trade = sample_trade(true);
        assert!(trade.calc_profit(90.0) > 0.0);
        assert!(trade.calc_profit(110.0) < 0.0);
    }

    #[test]
    fn stop_loss_only_moves_toward_profit() {
        let mut trade = sample_trade(false);
        trade.adjust_stop_loss(100.0, -0.10, true);
        assert!((trade.stop_loss - 90.0).abs() < 1e-9);
        assert!(!trade.is_stop_loss_trailing);

        trade.adjust_stop_loss(95.0, -0.10, false);
        assert!((trade.stop_loss - 90.0).abs() < 1e-9);

        trade.adjust_stop_loss(120.0, -0.05, false);
        assert!((trade.stop_loss - 114.0).abs() < 1e-9);
        assert!(trade.is_stop_loss_trailing);
        assert!((trade.initial_stop_loss - 90.0).abs() < 1e-9);
    }

    #[test]
    fn stop_loss_respects_liquidation_price() {
        let mut trade = sample_trade(false);
        trade.leverage = 5.0;
        trade.liquidation_price = Some(95.0);
        trade.adjust_stop_loss(100.0, -0.5, true);
        assert!((trade.stop_loss - 95.0).abs() < 1e-9);
    }

    #[test]
    fn close_records_exit_order() {
        let mut trade = sample_trade(false);
        let when = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        trade.close(105.0, when, ExitType::Roi, None);
        assert!(!trade.is_open);
        assert_eq!(trade.close_date, Some(when));
        assert_eq!(trade.exit_reason.as_deref(), Some("roi"));
        assert_eq!(trade.orders.len(), 1);
        assert_eq!(trade.orders[0].side, OrderSide::Exit);
    }

    #[test]
    fn exit_type_parses_from_label() {
        assert_eq!("trailing_stop_loss".parse::<ExitType>().unwrap(), ExitType::TrailingStopLoss);
        assert!("nope".parse::<ExitType>().is_err());
    }
}
