use crate::config::BacktestConfig;
use crate::error::EngineError;
use crate::models::{MarginMode, Trade, TradingMode};
use anyhow::Result;
use chrono::{DateTime, Duration, Timelike, Utc};

/// Hours between funding settlements.
pub const FUNDING_INTERVAL_HOURS: i64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Binance,
    Bybit,
    Hyperliquid,
    Generic,
}

impl ExchangeKind {
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "binance" | "binanceusdm" => ExchangeKind::Binance,
            "bybit" => ExchangeKind::Bybit,
            "hyperliquid" => ExchangeKind::Hyperliquid,
            _ => ExchangeKind::Generic,
        }
    }
}

/// Dry-run margin model used to price liquidations and funding.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub kind: ExchangeKind,
    pub trading_mode: TradingMode,
    pub margin_mode: MarginMode,
    pub liquidation_buffer: f64,
    pub maintenance_margin_ratio: f64,
    pub maintenance_amount: f64,
    pub max_leverage: f64,
    pub taker_fee: f64,
    pub funding_rate: f64,
}

pub struct LiquidationParams<'a> {
    pub open_rate: f64,
    pub is_short: bool,
    pub amount: f64,
    pub stake_amount: f64,
    pub leverage: f64,
    pub wallet_balance: f64,
    /// Other open trades; only used in cross margin mode.
    pub open_trades: &'a [&'a Trade],
}

impl Exchange {
    pub fn from_config(config: &BacktestConfig) -> Self {
        Self {
            kind: ExchangeKind::from_name(&config.exchange),
            trading_mode: config.trading_mode,
            margin_mode: config.margin_mode,
            liquidation_buffer: config.liquidation_buffer,
            maintenance_margin_ratio: config.maintenance_margin_ratio,
            maintenance_amount: config.maintenance_amount,
            max_leverage: config.max_leverage,
            taker_fee: config.fee_rate(),
            funding_rate: config.funding_rate,
        }
    }

    /// Liquidation price including the configured safety buffer, or `None` in
    /// spot mode.
    pub fn liquidation_price(&self, params: LiquidationParams) -> Result<Option<f64>> {
        if self.trading_mode == TradingMode::Spot {
            return Ok(None);
        }
        let open_rate = params.open_rate;
        let is_short = params.is_short;
        let raw = match self.kind {
            ExchangeKind::Binance => self.binance_liquidation(&params),
            ExchangeKind::Bybit => self.bybit_liquidation(&params)?,
            ExchangeKind::Hyperliquid => self.hyperliquid_liquidation(&params),
            ExchangeKind::Generic => self.generic_liquidation(&params)?,
        };
        let Some(liquidation) = raw.filter(|price| price.is_finite()) else {
            return Ok(None);
        };
        let buffer = (open_rate - liquidation).abs() * self.liquidation_buffer;
        let buffered = if is_short {
            liquidation - buffer
        } else {
            liquidation + buffer
        };
        Ok(Some(buffered.max(0.0)))
    }

    fn wallet(&self, params: &LiquidationParams) -> f64 {
        match self.margin_mode {
            MarginMode::Isolated => params.stake_amount,
            MarginMode::Cross => params.wallet_balance,
        }
    }

    fn binance_liquidation(&self, params: &LiquidationParams) -> Option<f64> {
        let side = if params.is_short { -1.0 } else { 1.0 };
        let mmr = self.maintenance_margin_ratio;
        let cross_vars = match self.margin_mode {
            MarginMode::Isolated => 0.0,
            MarginMode::Cross => params
                .open_trades
                .iter()
                .map(|trade| {
                    // Other positions are marked at their open rate.
                    let mark = trade.open_rate;
                    let upnl = trade.side_sign() * trade.amount * (mark - trade.open_rate);
                    let maintenance = trade.amount * mark * mmr;
                    upnl - maintenance
                })
                .sum(),
        };
        let numerator = self.wallet(params) + cross_vars + self.maintenance_amount
            - side * params.amount * params.open_rate;
        let denominator = params.amount * mmr - side * params.amount;
        if denominator == 0.0 {
            return None;
        }
        Some(numerator / denominator)
    }

    fn bybit_liquidation(&self, params: &LiquidationParams) -> Result<Option<f64>> {
        if self.margin_mode != MarginMode::Isolated {
            return Err(EngineError::operational(
                "Bybit liquidation prices are only available in isolated margin mode",
            )
            .into());
        }
        if params.amount <= 0.0 || params.leverage <= 0.0 {
            return Ok(None);
        }
        let position_value = params.amount * params.open_rate;
        let initial_margin = position_value / params.leverage;
        let maintenance_margin = position_value * self.maintenance_margin_ratio;
        let distance = (initial_margin - maintenance_margin) / params.amount;
        Ok(Some(if params.is_short {
            params.open_rate + distance
        } else {
            params.open_rate - distance
        }))
    }

    fn hyperliquid_liquidation(&self, params: &LiquidationParams) -> Option<f64> {
        if params.amount <= 0.0 || self.max_leverage <= 0.0 {
            return None;
        }
        let side = if params.is_short { -1.0 } else { 1.0 };
        let position_value = params.amount * params.open_rate;
        let maintenance_requirement = position_value / self.max_leverage / 2.0;
        let margin_available = self.wallet(params) - maintenance_requirement;
        let maintenance_leverage = 2.0 * self.max_leverage;
        Some(
            params.open_rate
                - side * margin_available / params.amount / (1.0 - side / maintenance_leverage),
        )
    }

    fn generic_liquidation(&self, params: &LiquidationParams) -> Result<Option<f64>> {
        if self.margin_mode != MarginMode::Isolated {
            return Err(EngineError::operational(format!(
                "{:?} margin mode is only supported with known exchanges",
                self.margin_mode
            ))
            .into());
        }
        if params.amount <= 0.0 {
            return Ok(None);
        }
        let value = self.wallet(params) / params.amount;
        let mm_plus_fee = self.maintenance_margin_ratio + self.taker_fee;
        Ok(Some(if params.is_short {
            (params.open_rate + value) / (1.0 + mm_plus_fee)
        } else {
            (params.open_rate - value) / (1.0 - mm_plus_fee)
        }))
    }

    /// Funding owed (negative) or received (positive) by `trade` between `from`
    /// and `to`, settled at every 8h boundary crossed.
    pub fn funding_fee(
        &self,
        trade: &Trade,
        mark_price: f64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> f64 {
        if self.trading_mode != TradingMode::Futures || self.funding_rate == 0.0 {
            return 0.0;
        }
        let settlements = funding_settlements_between(from, to);
        if settlements == 0 {
            return 0.0;
        }
        let per_settlement = trade.amount * mark_price * self.funding_rate;
        let sign = if trade.is_short { 1.0 } else { -1.0 };
        sign * per_settlement * settlements as f64
    }
}

/// Count of funding timestamps in `(from, to]`.
pub fn funding_settlements_between(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    if to <= from {
        return 0;
    }
    let interval = Duration::hours(FUNDING_INTERVAL_HOURS);
    let Some(day_start) = from
        .with_hour(0)
        .and_then(|d| d.with_minute(0))
        .and_then(|d| d.with_second(0))
        .and_then(|d| d.with_nanosecond(0))
    else {
        return 0;
    };
    let elapsed = from - day_start;
    let mut next = day_start
        + interval * ((elapsed.num_seconds() / interval.num_seconds()) as i32 + 1);
    let mut count = 0;
    while next <= to {
        count += 1;
        next += interval;
    }
    count
}
