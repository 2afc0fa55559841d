use crate::indicators::{calculate_sma, crossed_above, crossed_below};
use crate::parameters::{HyperoptParameter, ParameterOptions, ParameterRegistry};
use crate::strategy::{Metadata, SignalFrame, Strategy};
use crate::strategy_utils::{mark_entry, mark_exit};
use crate::trading_rules::{RiskSettings, RoiTable};
use anyhow::{anyhow, Result};
use std::collections::BTreeMap;

/// Fast/slow SMA crossover, long and short.
pub struct MaCrossoverStrategy {
    parameters: ParameterRegistry,
}

impl MaCrossoverStrategy {
    pub fn new() -> Result<Self> {
        let parameters = ParameterRegistry::new()
            .with(
                "buy_fast",
                HyperoptParameter::int([5, 20], None, 10, ParameterOptions::space("buy"))?,
            )?
            .with(
                "buy_slow",
                HyperoptParameter::int([20, 60], None, 30, ParameterOptions::space("buy"))?,
            )?;
        Ok(Self { parameters })
    }

    fn column_name(period: i64) -> String {
        format!("sma_{}", period)
    }

    fn averages<'a>(&self, frame: &'a SignalFrame) -> Result<(&'a [f64], &'a [f64])> {
        let fast = Self::column_name(self.parameters.int_value("buy_fast", 10));
        let slow = Self::column_name(self.parameters.int_value("buy_slow", 30));
        let fast = frame
            .column(&fast)
            .ok_or_else(|| anyhow!("Missing indicator column {}", fast))?;
        let slow = frame
            .column(&slow)
            .ok_or_else(|| anyhow!("Missing indicator column {}", slow))?;
        Ok((fast, slow))
    }
}

impl Strategy for MaCrossoverStrategy {
    fn name(&self) -> &str {
        "ma_crossover"
    }

    fn timeframe(&self) -> &str {
        "5m"
    }

    fn startup_candle_count(&self) -> usize {
        60
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
        roi.insert(0, 0.15);
        RiskSettings {
            minimal_roi: RoiTable(roi),
            stoploss: -0.08,
            ..RiskSettings::default()
        }
    }

    // During optimization every candidate period gets its own column so that
    // later epochs only recompute signals.
    fn advise_indicators(&self, mut frame: SignalFrame, metadata: &Metadata) -> Result<SignalFrame> {
        let closes = frame.closes();
        for name in ["buy_fast", "buy_slow"] {
            let Some(parameter) = self.parameters.get(name) else {
                continue;
            };
            for value in parameter.range(metadata.state) {
                let Some(period) = value.as_i64() else {
                    continue;
                };
                let column = Self::column_name(period);
                if frame.column(&column).is_none() {
                    frame.set_column(column, calculate_sma(&closes, period.max(1) as usize));
                }
            }
        }
        Ok(frame)
    }

    fn advise_entry(&self, mut frame: SignalFrame, _metadata: &Metadata) -> Result<SignalFrame> {
        let (fast, slow) = self.averages(&frame)?;
        let (fast, slow) = (fast.to_vec(), slow.to_vec());
        for i in 1..frame.len() {
            if frame.candles[i].volume <= 0.0 {
                continue;
            }
            if crossed_above(&fast, &slow, i) {
                mark_entry(&mut frame, i, false, Some("golden_cross"));
            } else if crossed_below(&fast, &slow, i) {
                mark_entry(&mut frame, i, true, Some("death_cross"));
            }
        }
        Ok(frame)
    }

    fn advise_exit(&self, mut frame: SignalFrame, _metadata: &Metadata) -> Result<SignalFrame> {
        let (fast, slow) = self.averages(&frame)?;
        let (fast, slow) = (fast.to_vec(), slow.to_vec());
        for i in 1..frame.len() {
            if crossed_below(&fast, &slow, i) {
                mark_exit(&mut frame, i, false, None);
            } else if crossed_above(&fast, &slow, i) {
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
                    let close = 100.0 + 10.0 * (i as f64 / 15.0).sin();
                    Candle {
                        date: base + Duration::minutes(5 * i as i64),
                        open: close,
                        high: close + 0.5,
                        low: close - 0.5,
                        close,
                        volume: 5.0,
                    }
                })
                .collect(),
        )
    }

    fn metadata(state: HyperoptState) -> Metadata {
        Metadata {
            pair: "ETH/USDT".to_string(),
            timeframe: "5m".to_string(),
            state,
        }
    }

    #[test]
    fn crossovers_produce_both_directions() {
        let strategy = MaCrossoverStrategy::new().unwrap();
        let metadata = metadata(HyperoptState::Startup);
        let frame = crate::strategy::advise_indicators(
            &strategy,
            SignalFrame::new(wave(400)),
            &metadata,
            false,
        )
        .and_then(|frame| crate::strategy::advise_signals(&strategy, frame, &metadata, false))
        .unwrap();
        assert!(frame.enter_long.iter().any(|v| *v));
        assert!(frame.enter_short.iter().any(|v| *v));
        assert!(frame.exit_long.iter().any(|v| *v));
        assert!(frame
            .enter_tag
            .iter()
            .flatten()
            .any(|tag| tag == "golden_cross"));
    }

    #[test]
    fn precomputes_every_period_while_in_space() {
        let mut strategy = MaCrossoverStrategy::new().unwrap();
        strategy.parameters_mut().set_in_space(&["buy".to_string()]);
        let frame = strategy
            .advise_indicators(
                SignalFrame::new(wave(100)),
                &metadata(HyperoptState::Indicators),
            )
            .unwrap();
        assert!(frame.column("sma_5").is_some());
        assert!(frame.column("sma_60").is_some());

        let frame = strategy
            .advise_indicators(SignalFrame::new(wave(100)), &metadata(HyperoptState::Optimize))
            .unwrap();
        assert_eq!(frame.columns.len(), 2);
    }
}
