use crate::models::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::collections::BTreeMap;

/// Sentinel returned by ratio metrics whose denominator collapses to zero.
pub const DEGENERATE_RATIO: f64 = -100.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawdownResult {
    pub drawdown_abs: f64,
    pub high_date: DateTime<Utc>,
    pub low_date: DateTime<Utc>,
    pub high_value: f64,
    pub low_value: f64,
    pub relative_account_drawdown: f64,
}

/// One point of the cumulative-profit curve, ordered by close date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawdownPoint {
    pub date: DateTime<Utc>,
    pub cumulative: f64,
    pub high_value: f64,
    pub drawdown: f64,
    pub drawdown_relative: f64,
}

pub struct PerformanceCalculator;

impl PerformanceCalculator {
    fn sorted_by_close(trades: &[Trade]) -> Vec<&Trade> {
        let mut sorted: Vec<&Trade> = trades.iter().collect();
        sorted.sort_by_key(|trade| trade.close_date.unwrap_or(trade.open_date));
        sorted
    }

    /// Cumulative profit curve with its running high and drawdown. The
    /// relative drawdown is measured against the account balance when
    /// `starting_balance` is non-zero.
    pub fn calculate_underwater(trades: &[Trade], starting_balance: f64) -> Vec<DrawdownPoint> {
        let mut cumulative = 0.0;
        let mut running_max = f64::NEG_INFINITY;
        let mut points = Vec::with_capacity(trades.len());
        for trade in Self::sorted_by_close(trades) {
            cumulative += trade.profit_abs();
            running_max = running_max.max(cumulative);
            let high_value = running_max.max(0.0);
            let drawdown = cumulative - high_value;
            let drawdown_relative = if starting_balance != 0.0 {
                let max_balance = starting_balance + high_value;
                (max_balance - (starting_balance + cumulative)) / max_balance
            } else if high_value != 0.0 {
                (high_value - cumulative) / high_value
            } else {
                0.0
            };
            points.push(DrawdownPoint {
                date: trade.close_date.unwrap_or(trade.open_date),
                cumulative,
                high_value,
                drawdown,
                drawdown_relative,
            });
        }
        points
    }

    /// Largest drawdown of the cumulative profit curve, absolute or (with
    /// `relative`) measured against the account. `None` for an empty ledger.
    pub fn calculate_max_drawdown(
        trades: &[Trade],
        starting_balance: f64,
        relative: bool,
    ) -> Option<DrawdownResult> {
        let points = Self::calculate_underwater(trades, starting_balance);
        if points.is_empty() {
            return None;
        }
        let mut low_index = 0;
        for (i, point) in points.iter().enumerate() {
            let better = if relative {
                point.drawdown_relative > points[low_index].drawdown_relative
            } else {
                point.drawdown < points[low_index].drawdown
            };
            if better {
                low_index = i;
            }
        }
        let mut high_index = 0;
        for (i, point) in points.iter().enumerate().take(low_index + 1) {
            if point.high_value > points[high_index].high_value {
                high_index = i;
            }
        }
        let low = &points[low_index];
        let high = &points[high_index];
        Some(DrawdownResult {
            drawdown_abs: low.drawdown.abs(),
            high_date: high.date,
            low_date: low.date,
            high_value: high.cumulative,
            low_value: low.cumulative,
            relative_account_drawdown: low.drawdown_relative,
        })
    }

    /// Lowest and highest account balance along the ledger.
    pub fn calculate_csum(trades: &[Trade], starting_balance: f64) -> Option<(f64, f64)> {
        let points = Self::calculate_underwater(trades, starting_balance);
        if points.is_empty() {
            return None;
        }
        let balances = points.iter().map(|p| starting_balance + p.cumulative);
        let min = balances.clone().fold(f64::INFINITY, f64::min);
        let max = balances.fold(f64::NEG_INFINITY, f64::max);
        Some((min, max))
    }

    fn days_period(min_date: DateTime<Utc>, max_date: DateTime<Utc>) -> f64 {
        std::cmp::max(1, (max_date - min_date).num_days()) as f64
    }

    fn relative_profits(trades: &[Trade], starting_balance: f64) -> Vec<f64> {
        trades
            .iter()
            .map(|trade| trade.profit_abs() / starting_balance)
            .collect()
    }

    fn population_std_dev(values: &[f64]) -> f64 {
        if values.is_empty() {
            return f64::NAN;
        }
        values.population_std_dev()
    }

    /// Annualized Sharpe ratio over the per-trade returns of the ledger.
    pub fn calculate_sharpe(
        trades: &[Trade],
        min_date: DateTime<Utc>,
        max_date: DateTime<Utc>,
        starting_balance: f64,
    ) -> f64 {
        if trades.is_empty() || min_date >= max_date || starting_balance <= 0.0 {
            return 0.0;
        }
        let returns = Self::relative_profits(trades, starting_balance);
        let total: f64 = returns.iter().sum();
        let expected_returns_mean = total / Self::days_period(min_date, max_date);
        let std_dev = Self::population_std_dev(&returns);
        Self::annualized(expected_returns_mean, std_dev)
    }

    /// Sortino ratio: as Sharpe, with the deviation of losing trades only.
    pub fn calculate_sortino(
        trades: &[Trade],
        min_date: DateTime<Utc>,
        max_date: DateTime<Utc>,
        starting_balance: f64,
    ) -> f64 {
        if trades.is_empty() || min_date >= max_date || starting_balance <= 0.0 {
            return 0.0;
        }
        let returns = Self::relative_profits(trades, starting_balance);
        let total: f64 = returns.iter().sum();
        let expected_returns_mean = total / Self::days_period(min_date, max_date);
        let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
        let down_std = Self::population_std_dev(&downside);
        Self::annualized(expected_returns_mean, down_std)
    }

    fn annualized(expected_returns_mean: f64, deviation: f64) -> f64 {
        if deviation != 0.0 && deviation.is_finite() {
            expected_returns_mean / deviation * 365f64.sqrt()
        } else if expected_returns_mean == 0.0 {
            0.0
        } else {
            DEGENERATE_RATIO
        }
    }

    /// Calmar ratio: daily return in percent over the relative account drawdown.
    pub fn calculate_calmar(
        trades: &[Trade],
        min_date: DateTime<Utc>,
        max_date: DateTime<Utc>,
        starting_balance: f64,
    ) -> f64 {
        if trades.is_empty() || min_date >= max_date || starting_balance <= 0.0 {
            return 0.0;
        }
        let total_profit: f64 = trades.iter().map(Trade::profit_abs).sum::<f64>() / starting_balance;
        let expected_returns_mean = total_profit / Self::days_period(min_date, max_date) * 100.0;
        let max_drawdown = Self::calculate_max_drawdown(trades, starting_balance, false)
            .map(|dd| dd.relative_account_drawdown)
            .unwrap_or(0.0);
        if max_drawdown != 0.0 {
            expected_returns_mean / max_drawdown * 365f64.sqrt()
        } else if expected_returns_mean == 0.0 {
            0.0
        } else {
            DEGENERATE_RATIO
        }
    }

    pub fn calculate_cagr(days_passed: i64, starting_balance: f64, final_balance: f64) -> f64 {
        if final_balance <= 0.0 || starting_balance <= 0.0 || days_passed <= 0 {
            return 0.0;
        }
        (final_balance / starting_balance).powf(1.0 / (days_passed as f64 / 365.0)) - 1.0
    }

    /// Expected profit per trade and the expectancy ratio (risk/reward
    /// weighted winrate). The ratio is 100 while there are no losing trades.
    pub fn calculate_expectancy(trades: &[Trade]) -> (f64, f64) {
        if trades.is_empty() {
            return (0.0, 100.0);
        }
        let wins: Vec<f64> = trades.iter().map(Trade::profit_abs).filter(|p| *p > 0.0).collect();
        let losses: Vec<f64> = trades.iter().map(Trade::profit_abs).filter(|p| *p < 0.0).collect();
        let total = trades.len() as f64;
        let average_win = if wins.is_empty() {
            0.0
        } else {
            wins.iter().sum::<f64>() / wins.len() as f64
        };
        let average_loss = if losses.is_empty() {
            0.0
        } else {
            losses.iter().sum::<f64>().abs() / losses.len() as f64
        };
        let winrate = wins.len() as f64 / total;
        let loserate = losses.len() as f64 / total;
        let expectancy = winrate * average_win - loserate * average_loss;
        let expectancy_ratio = if average_loss > 0.0 {
            let risk_reward = average_win / average_loss;
            (1.0 + risk_reward) * winrate - 1.0
        } else {
            100.0
        };
        (expectancy, expectancy_ratio)
    }

    /// System Quality Number, rounded to 4 decimals.
    pub fn calculate_sqn(trades: &[Trade], starting_balance: f64) -> f64 {
        if trades.is_empty() || starting_balance <= 0.0 {
            return 0.0;
        }
        let returns = Self::relative_profits(trades, starting_balance);
        if returns.len() < 2 {
            return DEGENERATE_RATIO;
        }
        let mean = returns.iter().mean();
        let std_dev = returns.iter().std_dev();
        if std_dev == 0.0 || !std_dev.is_finite() {
            return DEGENERATE_RATIO;
        }
        let sqn = (returns.len() as f64).sqrt() * (mean / std_dev);
        (sqn * 10_000.0).round() / 10_000.0
    }

    pub fn calculate_profit_factor(trades: &[Trade]) -> f64 {
        let winning: f64 = trades.iter().map(Trade::profit_abs).filter(|p| *p > 0.0).sum();
        let losing: f64 = trades.iter().map(Trade::profit_abs).filter(|p| *p < 0.0).sum();
        if losing != 0.0 {
            winning / losing.abs()
        } else {
            0.0
        }
    }

    /// Longest streaks of winning and losing trades, in close order.
    pub fn max_consecutive(trades: &[Trade]) -> (usize, usize) {
        let mut wins = 0;
        let mut losses = 0;
        let mut max_wins = 0;
        let mut max_losses = 0;
        for trade in Self::sorted_by_close(trades) {
            let profit = trade.profit_abs();
            if profit > 0.0 {
                wins += 1;
                losses = 0;
            } else if profit < 0.0 {
                losses += 1;
                wins = 0;
            } else {
                wins = 0;
                losses = 0;
            }
            max_wins = max_wins.max(wins);
            max_losses = max_losses.max(losses);
        }
        (max_wins, max_losses)
    }

    /// Mean relative change of the close price across pairs, first valid close
    /// to last.
    pub fn calculate_market_change<'a>(pairs: impl IntoIterator<Item = &'a [Candle]>) -> f64 {
        let changes: Vec<f64> = pairs
            .into_iter()
            .filter_map(|candles| {
                let start = candles.iter().map(|c| c.close).find(|v| v.is_finite())?;
                let end = candles.iter().rev().map(|c| c.close).find(|v| v.is_finite())?;
                if start == 0.0 {
                    return None;
                }
                Some((end - start) / start)
            })
            .collect();
        if changes.is_empty() {
            return 0.0;
        }
        changes.iter().sum::<f64>() / changes.len() as f64
    }

    /// Cumulative relative change of the cross-pair mean close, per date.
    pub fn market_change_series<'a>(
        pairs: impl IntoIterator<Item = &'a [Candle]>,
    ) -> Vec<(DateTime<Utc>, f64)> {
        let mut by_date: BTreeMap<DateTime<Utc>, (f64, usize)> = BTreeMap::new();
        for candles in pairs {
            for candle in candles.iter().filter(|c| c.close.is_finite()) {
                let entry = by_date.entry(candle.date).or_insert((0.0, 0));
                entry.0 += candle.close;
                entry.1 += 1;
            }
        }
        let mut series = Vec::with_capacity(by_date.len());
        let mut previous: Option<f64> = None;
        let mut cumulative = 0.0;
        for (date, (sum, count)) in by_date {
            let mean = sum / count as f64;
            if let Some(prev) = previous {
                if prev != 0.0 {
                    cumulative += mean / prev - 1.0;
                }
            }
            previous = Some(mean);
            series.push((date, cumulative));
        }
        series
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    pub(crate) fn closed_trade(pair: &str, day: i64, profit: f64) -> Trade {
        let open_date = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::days(day);
        Trade {
            id: TradeId(day as usize),
            pair: pair.to_string(),
            is_short: false,
            is_open: false,
            open_date,
            close_date: Some(open_date + Duration::hours(6)),
            open_rate: 100.0,
            close_rate: Some(100.0 + profit),
            amount: 1.0,
            stake_amount: 100.0,
            leverage: 1.0,
            trading_mode: TradingMode::Spot,
            margin_mode: MarginMode::Isolated,
            fee_open: 0.0,
            fee_close: 0.0,
            funding_fees: 0.0,
            close_profit: Some(profit / 100.0),
            close_profit_abs: Some(profit),
            stop_loss: 90.0,
            stop_loss_pct: -0.1,
            initial_stop_loss: 90.0,
            initial_stop_loss_pct: Some(-0.1),
            is_stop_loss_trailing: false,
            max_rate: 100.0,
            min_rate: 100.0,
            liquidation_price: None,
            exit_type: Some(ExitType::ExitSignal),
            exit_reason: Some("exit_signal".to_string()),
            enter_tag: None,
            orders: Vec::new(),
        }
    }

    fn span() -> (DateTime<Utc>, DateTime<Utc>) {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (start, start + Duration::days(10))
    }

    #[test]
    fn max_drawdown_tracks_peak_before_trough() {
        let trades = vec![
            closed_trade("A", 0, 10.0),
            closed_trade("A", 1, 20.0),
            closed_trade("A", 2, -25.0),
            closed_trade("A", 3, -5.0),
            closed_trade("A", 4, 40.0),
        ];
        let dd = PerformanceCalculator::calculate_max_drawdown(&trades, 1000.0, false).unwrap();
        assert!((dd.drawdown_abs - 30.0).abs() < 1e-9);
        assert!((dd.high_value - 30.0).abs() < 1e-9);
        assert!((dd.low_value - 0.0).abs() < 1e-9);
        assert_eq!(dd.high_date, trades[1].close_date.unwrap());
        assert_eq!(dd.low_date, trades[3].close_date.unwrap());
        assert!((dd.relative_account_drawdown - 30.0 / 1030.0).abs() < 1e-12);
        assert!(PerformanceCalculator::calculate_max_drawdown(&[], 1000.0, false).is_none());
    }

    #[test]
    fn sharpe_is_positive_for_profitable_ledgers() {
        let (start, end) = span();
        let trades = vec![
            closed_trade("A", 0, 10.0),
            closed_trade("A", 1, 20.0),
            closed_trade("A", 2, 5.0),
        ];
        let returns = [0.01, 0.02, 0.005];
        let mean: f64 = returns.iter().sum::<f64>() / 10.0;
        let avg = returns.iter().sum::<f64>() / 3.0;
        let std = (returns.iter().map(|r| (r - avg).powi(2)).sum::<f64>() / 3.0).sqrt();
        let expected = mean / std * 365f64.sqrt();
        let sharpe = PerformanceCalculator::calculate_sharpe(&trades, start, end, 1000.0);
        assert!((sharpe - expected).abs() < 1e-9);
        assert!(sharpe > 0.0);

        let flat = vec![closed_trade("A", 0, 0.0), closed_trade("A", 1, 0.0)];
        assert_eq!(PerformanceCalculator::calculate_sharpe(&flat, start, end, 1000.0), 0.0);
    }

    #[test]
    fn sortino_without_losses_is_degenerate() {
        let (start, end) = span();
        let trades = vec![closed_trade("A", 0, 10.0), closed_trade("A", 1, 20.0)];
        assert_eq!(
            PerformanceCalculator::calculate_sortino(&trades, start, end, 1000.0),
            DEGENERATE_RATIO
        );
        let mixed = vec![
            closed_trade("A", 0, 10.0),
            closed_trade("A", 1, -5.0),
            closed_trade("A", 2, -15.0),
        ];
        let sortino = PerformanceCalculator::calculate_sortino(&mixed, start, end, 1000.0);
        let expected = (-0.01 / 10.0) / 0.005 * 365f64.sqrt();
        assert!((sortino - expected).abs() < 1e-9);
    }

    #[test]
    fn calmar_uses_relative_account_drawdown() {
        let (start, end) = span();
        let trades = vec![closed_trade("A", 0, 100.0), closed_trade("A", 1, -50.0)];
        let calmar = PerformanceCalculator::calculate_calmar(&trades, start, end, 1000.0);
        let expected = (0.05 / 10.0 * 100.0) / (50.0 / 1100.0) * 365f64.sqrt();
        assert!((calmar - expected).abs() < 1e-9);
    }

    #[test]
    fn expectancy_and_profit_factor() {
        let trades = vec![
            closed_trade("A", 0, 30.0),
            closed_trade("A", 1, -10.0),
            closed_trade("A", 2, 10.0),
            closed_trade("A", 3, -10.0),
        ];
        let (expectancy, ratio) = PerformanceCalculator::calculate_expectancy(&trades);
        assert!((expectancy - 5.0).abs() < 1e-9);
        assert!((ratio - 0.5).abs() < 1e-9);
        assert!((PerformanceCalculator::calculate_profit_factor(&trades) - 2.0).abs() < 1e-9);
        assert_eq!(PerformanceCalculator::calculate_expectancy(&[]), (0.0, 100.0));
    }

    #[test]
    fn sqn_and_streaks() {
        let trades = vec![
            closed_trade("A", 0, 10.0),
            closed_trade("A", 1, 10.0),
            closed_trade("A", 2, -10.0),
            closed_trade("A", 3, 10.0),
        ];
        let sqn = PerformanceCalculator::calculate_sqn(&trades, 1000.0);
        assert!((sqn - 1.0).abs() < 1e-4);
        assert_eq!(PerformanceCalculator::max_consecutive(&trades), (2, 1));
        assert_eq!(PerformanceCalculator::calculate_sqn(&trades[..1], 1000.0), DEGENERATE_RATIO);
    }

    #[test]
    fn cagr_compounds_over_a_year() {
        let cagr = PerformanceCalculator::calculate_cagr(365, 1000.0, 1210.0);
        assert!((cagr - 0.21).abs() < 1e-9);
        assert_eq!(PerformanceCalculator::calculate_cagr(365, 1000.0, 0.0), 0.0);
    }

    #[test]
    fn market_change_averages_pairs() {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let make = |closes: &[f64]| -> Vec<Candle> {
            closes
                .iter()
                .enumerate()
                .map(|(i, &close)| Candle {
                    date: base + Duration::hours(i as i64),
                    open: close,
                    high: close,
                    low: close,
                    close,
                    volume: 1.0,
                })
                .collect()
        };
        let a = make(&[100.0, 110.0, 120.0]);
        let b = make(&[10.0, 10.0, 9.0]);
        let change = PerformanceCalculator::calculate_market_change([a.as_slice(), b.as_slice()]);
        assert!((change - 0.05).abs() < 1e-9);

        let series = PerformanceCalculator::market_change_series([a.as_slice(), b.as_slice()]);
        assert_eq!(series.len(), 3);
        assert_eq!(series[0].1, 0.0);
        assert!((series[1].1 - (60.0 / 55.0 - 1.0)).abs() < 1e-12);
    }
}
