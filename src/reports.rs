use crate::config::BacktestConfig;
use crate::models::*;
use crate::performance::PerformanceCalculator;
use crate::strategy_utils::calculate_period_days;
use anyhow::Result;
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const TOTAL_KEY: &str = "TOTAL";

/// One row of a grouped breakdown (per pair, tag, exit reason or side).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub key: String,
    pub trades: usize,
    pub profit_mean: f64,
    pub profit_mean_pct: f64,
    pub profit_sum: f64,
    pub profit_total_abs: f64,
    pub profit_total: f64,
    pub profit_total_pct: f64,
    pub duration_avg: String,
    pub wins: usize,
    pub draws: usize,
    pub losses: usize,
    pub winrate: f64,
    pub max_drawdown_account: f64,
    pub max_drawdown_abs: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakdownPeriod {
    Day,
    Week,
    Month,
}

impl BreakdownPeriod {
    pub const ALL: [BreakdownPeriod; 3] = [Self::Day, Self::Week, Self::Month];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
        }
    }

    /// Period label: the day itself, the Monday closing the week, or the last
    /// day of the month.
    fn bucket(&self, date: NaiveDate) -> NaiveDate {
        match self {
            Self::Day => date,
            Self::Week => {
                let offset = (7 - date.weekday().num_days_from_monday()) % 7;
                date + Duration::days(offset as i64)
            }
            Self::Month => {
                let (year, month) = if date.month() == 12 {
                    (date.year() + 1, 1)
                } else {
                    (date.year(), date.month() + 1)
                };
                NaiveDate::from_ymd_opt(year, month, 1)
                    .map(|first| first - Duration::days(1))
                    .unwrap_or(date)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodicRow {
    pub date: NaiveDate,
    pub profit_abs: f64,
    pub trades: usize,
    pub wins: usize,
    pub draws: usize,
    pub losses: usize,
}

/// Aggregate statistics of one strategy's backtest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyStats {
    pub strategy_name: String,
    pub run_id: String,
    pub results_per_pair: Vec<ResultRow>,
    pub results_per_enter_tag: Vec<ResultRow>,
    pub exit_reason_summary: Vec<ResultRow>,
    pub results_per_side: Vec<ResultRow>,
    pub left_open_trades: Vec<ResultRow>,
    pub periodic_breakdown: BTreeMap<String, Vec<PeriodicRow>>,

    pub total_trades: usize,
    pub trade_count_long: usize,
    pub trade_count_short: usize,
    pub wins: usize,
    pub draws: usize,
    pub losses: usize,
    pub winrate: f64,
    pub trades_per_day: f64,

    pub profit_mean: f64,
    pub profit_median: f64,
    pub profit_total: f64,
    pub profit_total_long: f64,
    pub profit_total_short: f64,
    pub profit_total_abs: f64,
    pub profit_total_long_abs: f64,
    pub profit_total_short_abs: f64,
    pub cagr: f64,
    pub expectancy: f64,
    pub expectancy_ratio: f64,
    pub sortino: f64,
    pub sharpe: f64,
    pub calmar: f64,
    pub sqn: f64,
    pub profit_factor: f64,

    pub backtest_start: DateTime<Utc>,
    pub backtest_end: DateTime<Utc>,
    pub backtest_days: i64,
    pub backtest_run_start_ts: i64,
    pub backtest_run_end_ts: i64,
    pub market_change: f64,

    pub pairlist: Vec<String>,
    pub stake_amount: Value,
    pub stake_currency: String,
    pub starting_balance: f64,
    pub final_balance: f64,
    pub max_open_trades: i64,
    pub timeframe: String,
    pub timerange: Option<String>,
    pub trading_mode: TradingMode,

    pub rejected_signals: usize,
    pub timedout_entry_orders: usize,
    pub timedout_exit_orders: usize,
    pub canceled_trade_entries: usize,
    pub canceled_entry_orders: usize,
    pub replaced_entry_orders: usize,

    pub best_pair: Option<ResultRow>,
    pub worst_pair: Option<ResultRow>,
    pub holding_avg: String,
    pub holding_avg_minutes: f64,
    pub winner_holding_avg_minutes: f64,
    pub loser_holding_avg_minutes: f64,
    pub max_consecutive_wins: usize,
    pub max_consecutive_losses: usize,

    pub backtest_best_day: f64,
    pub backtest_worst_day: f64,
    pub backtest_best_day_abs: f64,
    pub backtest_worst_day_abs: f64,
    pub winning_days: usize,
    pub draw_days: usize,
    pub losing_days: usize,

    pub max_drawdown_account: f64,
    pub max_relative_drawdown: f64,
    pub max_drawdown_abs: f64,
    pub max_drawdown_low: f64,
    pub max_drawdown_high: f64,
    pub drawdown_start: Option<DateTime<Utc>>,
    pub drawdown_end: Option<DateTime<Utc>>,
    pub csum_min: f64,
    pub csum_max: f64,
}

/// Everything a backtest run reports, keyed by strategy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BacktestStats {
    pub strategy: BTreeMap<String, StrategyStats>,
    pub strategy_comparison: Vec<ResultRow>,
}

fn trade_minutes(trade: &Trade) -> f64 {
    trade
        .close_date
        .map(|close| (close - trade.open_date).num_minutes() as f64)
        .unwrap_or(0.0)
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

fn median(mut values: Vec<f64>) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

/// `H:MM:SS`, prefixed with days when the duration exceeds one.
pub fn format_duration(minutes: f64) -> String {
    let total_seconds = (minutes * 60.0).round().max(0.0) as i64;
    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3_600;
    let mins = (total_seconds % 3_600) / 60;
    let seconds = total_seconds % 60;
    if days > 0 {
        format!("{} day{}, {}:{:02}:{:02}", days, if days == 1 { "" } else { "s" }, hours, mins, seconds)
    } else {
        format!("{}:{:02}:{:02}", hours, mins, seconds)
    }
}

pub fn generate_result_row(key: &str, trades: &[&Trade], starting_balance: f64) -> ResultRow {
    let owned: Vec<Trade> = trades.iter().map(|trade| (*trade).clone()).collect();
    let profit_sum: f64 = owned.iter().map(Trade::profit_ratio).sum();
    let profit_total_abs: f64 = owned.iter().map(Trade::profit_abs).sum();
    let profit_mean = mean(owned.iter().map(Trade::profit_ratio));
    let profit_total = if starting_balance != 0.0 {
        profit_total_abs / starting_balance
    } else {
        0.0
    };
    let wins = owned.iter().filter(|t| t.profit_abs() > 0.0).count();
    let draws = owned.iter().filter(|t| t.profit_abs() == 0.0).count();
    let losses = owned.iter().filter(|t| t.profit_abs() < 0.0).count();
    let drawdown = PerformanceCalculator::calculate_max_drawdown(&owned, starting_balance, false);
    ResultRow {
        key: key.to_string(),
        trades: owned.len(),
        profit_mean,
        profit_mean_pct: (profit_mean * 10_000.0).round() / 100.0,
        profit_sum,
        profit_total_abs,
        profit_total,
        profit_total_pct: (profit_total * 10_000.0).round() / 100.0,
        duration_avg: format_duration(mean(owned.iter().map(trade_minutes))),
        wins,
        draws,
        losses,
        winrate: if owned.is_empty() {
            0.0
        } else {
            wins as f64 / owned.len() as f64
        },
        max_drawdown_account: drawdown
            .as_ref()
            .map(|dd| dd.relative_account_drawdown)
            .unwrap_or(0.0),
        max_drawdown_abs: drawdown.map(|dd| dd.drawdown_abs).unwrap_or(0.0),
    }
}

fn grouped_rows<F>(trades: &[Trade], starting_balance: f64, key_fn: F) -> Vec<ResultRow>
where
    F: Fn(&Trade) -> String,
{
    let mut groups: BTreeMap<String, Vec<&Trade>> = BTreeMap::new();
    for trade in trades {
        groups.entry(key_fn(trade)).or_default().push(trade);
    }
    let mut rows: Vec<ResultRow> = groups
        .iter()
        .map(|(key, group)| generate_result_row(key, group, starting_balance))
        .collect();
    rows.sort_by(|a, b| {
        b.profit_total_abs
            .total_cmp(&a.profit_total_abs)
            .then_with(|| a.key.cmp(&b.key))
    });
    let all: Vec<&Trade> = trades.iter().collect();
    rows.push(generate_result_row(TOTAL_KEY, &all, starting_balance));
    rows
}

/// Per-pair rows for every pair of the whitelist (including pairs without
/// trades unless `skip_empty`), sorted by absolute profit, plus `TOTAL`.
pub fn generate_pair_metrics(
    pairlist: &[String],
    starting_balance: f64,
    trades: &[Trade],
    skip_empty: bool,
) -> Vec<ResultRow> {
    let mut rows = Vec::new();
    for pair in pairlist {
        let group: Vec<&Trade> = trades.iter().filter(|t| &t.pair == pair).collect();
        if skip_empty && group.is_empty() {
            continue;
        }
        rows.push(generate_result_row(pair, &group, starting_balance));
    }
    rows.sort_by(|a, b| {
        b.profit_total_abs
            .total_cmp(&a.profit_total_abs)
            .then_with(|| a.key.cmp(&b.key))
    });
    let all: Vec<&Trade> = trades.iter().collect();
    rows.push(generate_result_row(TOTAL_KEY, &all, starting_balance));
    rows
}

pub fn generate_tag_metrics(trades: &[Trade], starting_balance: f64) -> Vec<ResultRow> {
    grouped_rows(trades, starting_balance, |trade| {
        trade.enter_tag.clone().unwrap_or_else(|| "OTHER".to_string())
    })
}

pub fn generate_exit_reason_stats(trades: &[Trade], starting_balance: f64) -> Vec<ResultRow> {
    grouped_rows(trades, starting_balance, |trade| {
        trade
            .exit_reason
            .clone()
            .or_else(|| trade.exit_type.map(|t| t.as_str().to_string()))
            .unwrap_or_default()
    })
}

pub fn generate_side_metrics(trades: &[Trade], starting_balance: f64) -> Vec<ResultRow> {
    grouped_rows(trades, starting_balance, |trade| trade.direction().to_string())
}

pub fn generate_periodic_breakdown(trades: &[Trade], period: BreakdownPeriod) -> Vec<PeriodicRow> {
    let mut buckets: BTreeMap<NaiveDate, PeriodicRow> = BTreeMap::new();
    for trade in trades {
        let Some(close_date) = trade.close_date else {
            continue;
        };
        let date = period.bucket(close_date.date_naive());
        let row = buckets.entry(date).or_insert_with(|| PeriodicRow {
            date,
            profit_abs: 0.0,
            trades: 0,
            wins: 0,
            draws: 0,
            losses: 0,
        });
        let profit = trade.profit_abs();
        row.profit_abs += profit;
        row.trades += 1;
        if profit > 0.0 {
            row.wins += 1;
        } else if profit < 0.0 {
            row.losses += 1;
        } else {
            row.draws += 1;
        }
    }
    buckets.into_values().collect()
}

struct DailyProfit {
    best: f64,
    worst: f64,
    best_abs: f64,
    worst_abs: f64,
    winning_days: usize,
    draw_days: usize,
    losing_days: usize,
}

fn daily_profit_stats(trades: &[Trade], starting_balance: f64) -> DailyProfit {
    let days = generate_periodic_breakdown(trades, BreakdownPeriod::Day);
    if days.is_empty() {
        return DailyProfit {
            best: 0.0,
            worst: 0.0,
            best_abs: 0.0,
            worst_abs: 0.0,
            winning_days: 0,
            draw_days: 0,
            losing_days: 0,
        };
    }
    let best_abs = days.iter().map(|d| d.profit_abs).fold(f64::NEG_INFINITY, f64::max);
    let worst_abs = days.iter().map(|d| d.profit_abs).fold(f64::INFINITY, f64::min);
    let ratio = |abs: f64| if starting_balance != 0.0 { abs / starting_balance } else { 0.0 };
    DailyProfit {
        best: ratio(best_abs),
        worst: ratio(worst_abs),
        best_abs,
        worst_abs,
        winning_days: days.iter().filter(|d| d.profit_abs > 0.0).count(),
        draw_days: days.iter().filter(|d| d.profit_abs == 0.0).count(),
        losing_days: days.iter().filter(|d| d.profit_abs < 0.0).count(),
    }
}

/// Statistics of one backtest over `[min_date, max_date]`.
pub fn generate_strategy_stats(
    config: &BacktestConfig,
    pairlist: &[String],
    result: &BacktestResult,
    min_date: DateTime<Utc>,
    max_date: DateTime<Utc>,
    market_change: f64,
) -> StrategyStats {
    let trades = &result.trades;
    let starting_balance = result.starting_balance;
    let total_trades = trades.len();

    let results_per_pair = generate_pair_metrics(pairlist, starting_balance, trades, false);
    let left_open: Vec<Trade> = trades
        .iter()
        .filter(|t| t.exit_type == Some(ExitType::ForceExit))
        .cloned()
        .collect();
    let left_open_trades = generate_pair_metrics(pairlist, starting_balance, &left_open, true);

    let mut periodic_breakdown = BTreeMap::new();
    for period in BreakdownPeriod::ALL {
        periodic_breakdown.insert(
            period.as_str().to_string(),
            generate_periodic_breakdown(trades, period),
        );
    }

    let pair_rows: Vec<&ResultRow> = results_per_pair
        .iter()
        .filter(|row| row.key != TOTAL_KEY && row.trades > 0)
        .collect();
    let best_pair = pair_rows
        .iter()
        .max_by(|a, b| a.profit_total.total_cmp(&b.profit_total))
        .map(|row| (*row).clone());
    let worst_pair = pair_rows
        .iter()
        .min_by(|a, b| a.profit_total.total_cmp(&b.profit_total))
        .map(|row| (*row).clone());

    let long_trades: Vec<&Trade> = trades.iter().filter(|t| !t.is_short).collect();
    let short_trades: Vec<&Trade> = trades.iter().filter(|t| t.is_short).collect();
    let profit_total_abs: f64 = trades.iter().map(Trade::profit_abs).sum();
    let profit_total_long_abs: f64 = long_trades.iter().map(|t| t.profit_abs()).sum();
    let profit_total_short_abs: f64 = short_trades.iter().map(|t| t.profit_abs()).sum();
    let ratio = |abs: f64| if starting_balance != 0.0 { abs / starting_balance } else { 0.0 };

    let wins = trades.iter().filter(|t| t.profit_abs() > 0.0).count();
    let draws = trades.iter().filter(|t| t.profit_abs() == 0.0).count();
    let losses = trades.iter().filter(|t| t.profit_abs() < 0.0).count();
    let backtest_days = calculate_period_days(&min_date, &max_date);
    let (expectancy, expectancy_ratio) = PerformanceCalculator::calculate_expectancy(trades);
    let (max_consecutive_wins, max_consecutive_losses) =
        PerformanceCalculator::max_consecutive(trades);
    let daily = daily_profit_stats(trades, starting_balance);
    let holding_avg_minutes = mean(trades.iter().map(trade_minutes));

    let drawdown = PerformanceCalculator::calculate_max_drawdown(trades, starting_balance, false);
    let relative_drawdown =
        PerformanceCalculator::calculate_max_drawdown(trades, starting_balance, true);
    let (csum_min, csum_max) = PerformanceCalculator::calculate_csum(trades, starting_balance)
        .unwrap_or((starting_balance, starting_balance));

    StrategyStats {
        strategy_name: result.strategy.clone(),
        run_id: result.run_id.clone(),
        results_per_pair,
        results_per_enter_tag: generate_tag_metrics(trades, starting_balance),
        exit_reason_summary: generate_exit_reason_stats(trades, starting_balance),
        results_per_side: generate_side_metrics(trades, starting_balance),
        left_open_trades,
        periodic_breakdown,
        total_trades,
        trade_count_long: long_trades.len(),
        trade_count_short: short_trades.len(),
        wins,
        draws,
        losses,
        winrate: if total_trades > 0 {
            wins as f64 / total_trades as f64
        } else {
            0.0
        },
        trades_per_day: if backtest_days > 0 {
            ((total_trades as f64 / backtest_days as f64) * 100.0).round() / 100.0
        } else {
            0.0
        },
        profit_mean: mean(trades.iter().map(Trade::profit_ratio)),
        profit_median: median(trades.iter().map(Trade::profit_ratio).collect()),
        profit_total: ratio(profit_total_abs),
        profit_total_long: ratio(profit_total_long_abs),
        profit_total_short: ratio(profit_total_short_abs),
        profit_total_abs,
        profit_total_long_abs,
        profit_total_short_abs,
        cagr: PerformanceCalculator::calculate_cagr(
            backtest_days,
            starting_balance,
            result.final_balance,
        ),
        expectancy,
        expectancy_ratio,
        sortino: PerformanceCalculator::calculate_sortino(trades, min_date, max_date, starting_balance),
        sharpe: PerformanceCalculator::calculate_sharpe(trades, min_date, max_date, starting_balance),
        calmar: PerformanceCalculator::calculate_calmar(trades, min_date, max_date, starting_balance),
        sqn: PerformanceCalculator::calculate_sqn(trades, starting_balance),
        profit_factor: PerformanceCalculator::calculate_profit_factor(trades),
        backtest_start: min_date,
        backtest_end: max_date,
        backtest_days,
        backtest_run_start_ts: result.backtest_start_time,
        backtest_run_end_ts: result.backtest_end_time,
        market_change,
        pairlist: pairlist.to_vec(),
        stake_amount: config.stake_amount.clone().into(),
        stake_currency: config.stake_currency.clone(),
        starting_balance,
        final_balance: result.final_balance,
        max_open_trades: config.max_open_trades,
        timeframe: config.timeframe.clone(),
        timerange: config.timerange.clone(),
        trading_mode: config.trading_mode,
        rejected_signals: result.rejected_signals,
        timedout_entry_orders: result.timedout_entry_orders,
        timedout_exit_orders: result.timedout_exit_orders,
        canceled_trade_entries: result.canceled_trade_entries,
        canceled_entry_orders: result.canceled_entry_orders,
        replaced_entry_orders: result.replaced_entry_orders,
        best_pair,
        worst_pair,
        holding_avg: format_duration(holding_avg_minutes),
        holding_avg_minutes,
        winner_holding_avg_minutes: mean(
            trades.iter().filter(|t| t.profit_abs() > 0.0).map(trade_minutes),
        ),
        loser_holding_avg_minutes: mean(
            trades.iter().filter(|t| t.profit_abs() < 0.0).map(trade_minutes),
        ),
        max_consecutive_wins,
        max_consecutive_losses,
        backtest_best_day: daily.best,
        backtest_worst_day: daily.worst,
        backtest_best_day_abs: daily.best_abs,
        backtest_worst_day_abs: daily.worst_abs,
        winning_days: daily.winning_days,
        draw_days: daily.draw_days,
        losing_days: daily.losing_days,
        max_drawdown_account: relative_drawdown
            .as_ref()
            .map(|dd| dd.relative_account_drawdown)
            .unwrap_or(0.0),
        max_relative_drawdown: relative_drawdown
            .as_ref()
            .map(|dd| dd.relative_account_drawdown)
            .unwrap_or(0.0),
        max_drawdown_abs: drawdown.as_ref().map(|dd| dd.drawdown_abs).unwrap_or(0.0),
        max_drawdown_low: drawdown.as_ref().map(|dd| dd.low_value).unwrap_or(0.0),
        max_drawdown_high: drawdown.as_ref().map(|dd| dd.high_value).unwrap_or(0.0),
        drawdown_start: drawdown.as_ref().map(|dd| dd.high_date),
        drawdown_end: drawdown.as_ref().map(|dd| dd.low_date),
        csum_min,
        csum_max,
    }
}

/// Stats for every strategy run over the same market data, plus one
/// comparison row per strategy.
pub fn generate_backtest_stats<'a>(
    config: &BacktestConfig,
    pairlist: &[String],
    market: impl IntoIterator<Item = &'a [Candle]>,
    results: &BTreeMap<String, BacktestResult>,
    min_date: DateTime<Utc>,
    max_date: DateTime<Utc>,
) -> Result<BacktestStats> {
    let market_change = PerformanceCalculator::calculate_market_change(market);
    let mut stats = BacktestStats::default();
    for (name, result) in results {
        let strategy_stats =
            generate_strategy_stats(config, pairlist, result, min_date, max_date, market_change);
        let all: Vec<&Trade> = result.trades.iter().collect();
        stats
            .strategy_comparison
            .push(generate_result_row(name, &all, result.starting_balance));
        stats.strategy.insert(name.clone(), strategy_stats);
    }
    Ok(stats)
}

/// One-line summary printed for every hyperopt epoch.
pub fn results_explanation(stats: &StrategyStats) -> String {
    format!(
        "{:>6} trades. {}/{}/{} Wins/Draws/Losses. Avg profit {:>7.2}%. Median profit {:>7.2}%. Total profit {:>11.8} {} ({:>8.2}%). Avg duration {} min.",
        stats.total_trades,
        stats.wins,
        stats.draws,
        stats.losses,
        stats.profit_mean * 100.0,
        stats.profit_median * 100.0,
        stats.profit_total_abs,
        stats.stake_currency,
        stats.profit_total * 100.0,
        stats.holding_avg_minutes.round(),
    )
}

/// Plain text table of breakdown rows.
pub fn render_rows(title: &str, rows: &[ResultRow], stake_currency: &str) -> String {
    let mut out = format!("{}\n", title);
    out.push_str(&format!(
        "{:<24} {:>7} {:>10} {:>16} {:>10} {:>18} {:>16}\n",
        "Key",
        "Trades",
        "Avg %",
        format!("Tot {}", stake_currency),
        "Tot %",
        "Avg Duration",
        "W/D/L Win%"
    ));
    for row in rows {
        out.push_str(&format!(
            "{:<24} {:>7} {:>10.2} {:>16.3} {:>10.2} {:>18} {:>16}\n",
            row.key,
            row.trades,
            row.profit_mean_pct,
            row.profit_total_abs,
            row.profit_total_pct,
            row.duration_avg,
            format!(
                "{}/{}/{} {:.1}",
                row.wins,
                row.draws,
                row.losses,
                row.winrate * 100.0
            ),
        ));
    }
    out
}

/// Multi-section text report for one strategy.
pub fn render_strategy_report(stats: &StrategyStats) -> String {
    let mut out = String::new();
    out.push_str(&render_rows("BACKTESTING REPORT", &stats.results_per_pair, &stats.stake_currency));
    out.push('\n');
    out.push_str(&render_rows("ENTER TAG STATS", &stats.results_per_enter_tag, &stats.stake_currency));
    out.push('\n');
    out.push_str(&render_rows("EXIT REASON STATS", &stats.exit_reason_summary, &stats.stake_currency));
    out.push('\n');
    out.push_str(&render_rows("LEFT OPEN TRADES REPORT", &stats.left_open_trades, &stats.stake_currency));
    out.push('\n');
    let lines = [
        ("Backtesting from", stats.backtest_start.to_rfc3339()),
        ("Backtesting to", stats.backtest_end.to_rfc3339()),
        ("Total/Daily Avg Trades", format!("{} / {}", stats.total_trades, stats.trades_per_day)),
        ("Starting balance", format!("{:.3} {}", stats.starting_balance, stats.stake_currency)),
        ("Final balance", format!("{:.3} {}", stats.final_balance, stats.stake_currency)),
        ("Absolute profit", format!("{:.3} {}", stats.profit_total_abs, stats.stake_currency)),
        ("Total profit %", format!("{:.2}%", stats.profit_total * 100.0)),
        ("CAGR %", format!("{:.2}%", stats.cagr * 100.0)),
        ("Sortino", format!("{:.2}", stats.sortino)),
        ("Sharpe", format!("{:.2}", stats.sharpe)),
        ("Calmar", format!("{:.2}", stats.calmar)),
        ("SQN", format!("{:.2}", stats.sqn)),
        ("Profit factor", format!("{:.2}", stats.profit_factor)),
        ("Expectancy (Ratio)", format!("{:.2} ({:.2})", stats.expectancy, stats.expectancy_ratio)),
        ("Avg. duration", stats.holding_avg.clone()),
        ("Max consecutive wins / losses", format!("{} / {}", stats.max_consecutive_wins, stats.max_consecutive_losses)),
        ("Rejected Entry signals", stats.rejected_signals.to_string()),
        ("Entry/Exit Timeouts", format!("{} / {}", stats.timedout_entry_orders, stats.timedout_exit_orders)),
        ("Canceled Trade Entries", stats.canceled_trade_entries.to_string()),
        ("Canceled Entry Orders", stats.canceled_entry_orders.to_string()),
        ("Replaced Entry Orders", stats.replaced_entry_orders.to_string()),
        ("Min balance", format!("{:.3} {}", stats.csum_min, stats.stake_currency)),
        ("Max balance", format!("{:.3} {}", stats.csum_max, stats.stake_currency)),
        ("Absolute Drawdown (Account)", format!("{:.2}%", stats.max_drawdown_account * 100.0)),
        ("Absolute Drawdown", format!("{:.3} {}", stats.max_drawdown_abs, stats.stake_currency)),
        ("Market change", format!("{:.2}%", stats.market_change * 100.0)),
    ];
    out.push_str("SUMMARY METRICS\n");
    for (label, value) in lines {
        out.push_str(&format!("{:<32} {}\n", label, value));
    }
    out
}
