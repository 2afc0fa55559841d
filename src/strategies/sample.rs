use crate::indicators;
use crate::parameters::{HyperoptParameter, ParameterOptions, ParameterRegistry};
use crate::strategy::{Metadata, SignalFrame, Strategy};
use crate::strategy_utils::{all_finite, crossed_above_level, mark_entry, mark_exit};
use crate::trading_rules::{RiskSettings, RoiTable};
use anyhow::Result;
use std::collections::BTreeMap;

/// RSI mean reversion confirmed by Bollinger bands and an EMA turn.
pub struct SampleStrategy {
    parameters: ParameterRegistry,
}

impl SampleStrategy {
    pub fn new() -> Result<Self> {
        let parameters = ParameterRegistry::new()
            .with(
                "buy_rsi",
                HyperoptParameter::int([10, 40], None, 30, ParameterOptions::space("buy"))?,
            )?
            .with(
                "sell_rsi",
                HyperoptParameter::int([60, 90], None, 70, ParameterOptions::space("sell"))?,
            )?
            .with(
                "short_rsi",
                HyperoptParameter::int([51, 100], None, 70, ParameterOptions::space("sell"))?,
            )?
            .with(
                "exit_short_rsi",
                HyperoptParameter::int([1, 50], None, 30, ParameterOptions::space("buy"))?,
            )?
            .with(
                "buy_ema_confirm",
                HyperoptParameter::boolean(true, ParameterOptions::space("buy"))?,
            )?
            .with(
                "sell_bb_offset",
                HyperoptParameter::decimal_step(
                    [0.0, 1.0],
                    None,
                    0.0,
                    0.05,
                    ParameterOptions::space("sell"),
                )?,
            )?;
        Ok(Self { parameters })
    }
}

impl Strategy for SampleStrategy {
    fn name(&self) -> &str {
        "sample"
    }

    fn timeframe(&self) -> &str {
        "5m"
    }

    fn startup_candle_count(&self) -> usize {
        30
    }

    fn can_short(&self) -> bool {
        true
    }

    fn parameters(&self) -> &ParameterRegistry {
        &self.parameters
    }

    fn parameters_mut(&mut self) -> &mut ParameterRegistry {
        &mut self.parameters
    }

    fn risk_settings(&self) -> RiskSettings {
        let mut roi = BTreeMap::new();
        roi.insert(0, 0.04);
        roi.insert(30, 0.02);
        roi.insert(60, 0.01);
        RiskSettings {
            minimal_roi: RoiTable(roi),
            stoploss: -0.10,
            ..RiskSettings::default()
        }
    }

    fn advise_indicators(&self, mut frame: SignalFrame, _metadata: &Metadata) -> Result<SignalFrame> {
        let closes = frame.closes();
        let bands = indicators::calculate_bollinger_bands(&closes, 20, 2.0);
        frame.set_column("rsi", indicators::calculate_rsi(&closes, 14));
        frame.set_column("ema", indicators::calculate_ema(&closes, 9));
        frame.set_column("bb_lowerband", bands.lower);
        frame.set_column("bb_middleband", bands.middle);
        frame.set_column("bb_upperband", bands.upper);
        Ok(frame)
    }

    fn advise_entry(&self, mut frame: SignalFrame, _metadata: &Metadata) -> Result<SignalFrame> {
        let buy_rsi = self.parameters.int_value("buy_rsi", 30) as f64;
        let short_rsi = self.parameters.int_value("short_rsi", 70) as f64;
        let ema_confirm = self.parameters.bool_value("buy_ema_confirm", true);
        let rsi = frame.column("rsi").unwrap_or_default().to_vec();
        let ema = frame.column("ema").unwrap_or_default().to_vec();
        let middle = frame.column("bb_middleband").unwrap_or_default().to_vec();

        for i in 1..frame.len() {
            if !all_finite(&[&rsi, &ema, &middle], i) || !ema[i - 1].is_finite() {
                continue;
            }
            let volume = frame.candles[i].volume;
            if volume <= 0.0 {
                continue;
            }
            let ema_turned_up = !ema_confirm || ema[i] > ema[i - 1];
            if crossed_above_level(&rsi, buy_rsi, i) && ema[i] <= middle[i] && ema_turned_up {
                mark_entry(&mut frame, i, false, Some("rsi_cross"));
            }
            if crossed_above_level(&rsi, short_rsi, i) && ema[i] > middle[i] && ema[i] < ema[i - 1] {
                mark_entry(&mut frame, i, true, Some("rsi_overbought"));
            }
        }
        Ok(frame)
    }

    fn advise_exit(&self, mut frame: SignalFrame, _metadata: &Metadata) -> Result<SignalFrame> {
        let sell_rsi = self.parameters.int_value("sell_rsi", 70) as f64;
        let exit_short_rsi = self.parameters.int_value("exit_short_rsi", 30) as f64;
        // Fraction of the upper half-band the EMA must clear before a long exit.
        let bb_offset = self.parameters.float_value("sell_bb_offset", 0.0);
        let rsi = frame.column("rsi").unwrap_or_default().to_vec();
        let ema = frame.column("ema").unwrap_or_default().to_vec();
        let middle = frame.column("bb_middleband").unwrap_or_default().to_vec();
        let upper = frame.column("bb_upperband").unwrap_or_default().to_vec();

        for i in 1..frame.len() {
            if !all_finite(&[&rsi, &ema, &middle], i) || !ema[i - 1].is_finite() {
                continue;
            }
            let exit_level = middle[i] + bb_offset * (upper.get(i).copied().unwrap_or(middle[i]) - middle[i]);
            if crossed_above_level(&rsi, sell_rsi, i) && ema[i] > exit_level && ema[i] < ema[i - 1] {
                mark_exit(&mut frame, i, false, None);
            }
            if crossed_above_level(&rsi, exit_short_rsi, i)
                && ema[i] <= middle[i]
                && ema[i] > ema[i - 1]
            {
                mark_exit(&mut frame, i, true, None);
            }
        }
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Candle;
    use crate::optimizer_status::HyperoptState;
    use chrono::{Duration, TimeZone, Utc};
    use std::sync::Arc;

    fn wave(n: usize) -> Arc<Vec<Candle>> {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Arc::new(
            (0..n)
                .map(|i| {
                    let close = 100.0 + 10.0 * (i as f64 / 6.0).sin();
                    Candle {
                        date: base + Duration::minutes(5 * i as i64),
                        open: close,
                        high: close + 1.0,
                        low: close - 1.0,
                        close,
                        volume: 10.0,
                    }
                })
                .collect(),
        )
    }

    #[test]
    fn produces_aligned_signal_columns() {
        let strategy = SampleStrategy::new().unwrap();
        let metadata = Metadata {
            pair: "BTC/USDT".to_string(),
            timeframe: "5m".to_string(),
            state: HyperoptState::Startup,
        };
        let frame = crate::strategy::advise_indicators(
            &strategy,
            SignalFrame::new(wave(200)),
            &metadata,
            false,
        )
        .and_then(|frame| crate::strategy::advise_signals(&strategy, frame, &metadata, false))
        .unwrap();
        assert_eq!(frame.len(), 200);
        assert_eq!(frame.column("rsi").unwrap().len(), 200);
        assert_eq!(frame.enter_long.len(), 200);
        assert!(frame.column("rsi").unwrap()[..14].iter().all(|v| v.is_nan()));
    }

    #[test]
    fn declares_buy_and_sell_parameters() {
        let strategy = SampleStrategy::new().unwrap();
        assert_eq!(strategy.parameters().int_value("buy_rsi", 0), 30);
        assert!(strategy.parameters().has_space("sell"));
        assert!(strategy.parameters().bool_value("buy_ema_confirm", false));
        let offset = strategy.parameters().get("sell_bb_offset").unwrap();
        assert_eq!(offset.domain().values().len(), 21);
    }

    #[test]
    fn bb_offset_delays_long_exits() {
        let metadata = Metadata {
            pair: "BTC/USDT".to_string(),
            timeframe: "5m".to_string(),
            state: HyperoptState::Startup,
        };
        let exits = |offset: f64| {
            let mut strategy = SampleStrategy::new().unwrap();
            let mut values = crate::parameters::ParamsDict::new();
            values.insert("sell_bb_offset".to_string(), offset.into());
            strategy.apply_parameters(&values).unwrap();
            let frame = strategy
                .advise_indicators(SignalFrame::new(wave(300)), &metadata)
                .and_then(|frame| crate::strategy::advise_signals(&strategy, frame, &metadata, false))
                .unwrap();
            frame.exit_long.iter().filter(|&&exit| exit).count()
        };
        assert!(exits(1.0) <= exits(0.0));
    }
}
