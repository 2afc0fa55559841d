use crate::analysis::get_tick_size_over_time;
use crate::config::BacktestConfig;
use crate::engine::{analyzed_date_bounds, Backtesting};
use crate::models::Candle;
use crate::optimizer_status::{HyperoptState, OptimizerStatus};
use crate::performance::PerformanceCalculator;
use crate::reports::{generate_backtest_stats, render_strategy_report, BacktestStats};
use crate::storage::store_backtest_results;
use crate::strategy::{create_strategy, prepare_strategy};
use anyhow::{anyhow, Result};
use chrono::Utc;
use log::{debug, info};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Outcome of one backtesting command.
#[derive(Debug, Clone)]
pub struct BacktestRun {
    pub stats: BacktestStats,
    pub archive: PathBuf,
}

/// Backtests the configured strategy, prints the report and stores the results.
pub fn run(config: &BacktestConfig) -> Result<BacktestRun> {
    let mut strategy = create_strategy(&config.strategy)?;
    let risk = prepare_strategy(strategy.as_mut(), config)?;
    let backtesting = Backtesting::new(config)?;
    let status = OptimizerStatus::new();
    info!(
        "Running backtesting for Strategy {} on {} pair(s)",
        strategy.name(),
        config.pairs.len()
    );

    let data = backtesting.load_market_data(strategy.as_ref(), &status)?;
    for (pair, candles) in data.iter() {
        if let Some((month, tick)) = get_tick_size_over_time(candles).into_iter().next_back() {
            debug!("{} price tick size {} (as of {})", pair, tick, month.format("%Y-%m"));
        }
    }
    let analyzed = backtesting.analyze(strategy.as_ref(), &data, HyperoptState::Startup)?;
    let (min_date, max_date) = analyzed_date_bounds(&analyzed)
        .ok_or_else(|| anyhow!("No data left after adjusting for startup candles."))?;
    info!(
        "Backtesting with data from {} up to {} ({} days).",
        min_date.format("%Y-%m-%d %H:%M:%S"),
        max_date.format("%Y-%m-%d %H:%M:%S"),
        (max_date - min_date).num_days()
    );

    let result = backtesting.backtest(strategy.as_ref(), &risk, &analyzed)?;
    let strategy_name = strategy.name().to_string();
    let mut results = BTreeMap::new();
    results.insert(strategy_name.clone(), result);

    let pairlist: Vec<String> = analyzed.keys().cloned().collect();
    let candles: Vec<&[Candle]> = analyzed.values().map(|f| f.candles.as_slice()).collect();
    let stats = generate_backtest_stats(
        config,
        &pairlist,
        candles.iter().copied(),
        &results,
        min_date,
        max_date,
    )?;
    let market_change = PerformanceCalculator::market_change_series(candles.iter().copied());

    if let Some(strategy_stats) = stats.strategy.get(&strategy_name) {
        println!("{}", render_strategy_report(strategy_stats));
    }

    let appendix = Utc::now().format("%Y-%m-%d_%H-%M-%S").to_string();
    let archive = store_backtest_results(config, &stats, &results, &market_change, &appendix)?;
    Ok(BacktestRun { stats, archive })
}
