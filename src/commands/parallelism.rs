use crate::analysis::{analyze_trade_parallelism, evaluate_result_multi};
use crate::config::max_open_trades_limit;
use crate::storage::load_backtest_archive;
use anyhow::Result;
use log::info;
use std::path::Path;

/// Reports candles of a stored backtest where more trades were open than
/// `max_open_trades` allows.
pub fn run(archive: &Path, timeframe: &str, max_open_trades: i64) -> Result<usize> {
    let loaded = load_backtest_archive(archive)?;
    let limit = max_open_trades_limit(max_open_trades);
    let mut violations = 0;
    for (strategy, trades) in &loaded.trades {
        let peak = analyze_trade_parallelism(trades, timeframe)?
            .iter()
            .map(|row| row.open_trades)
            .max()
            .unwrap_or(0);
        info!("{}: at most {} trades open at once", strategy, peak);
        let over = evaluate_result_multi(trades, timeframe, limit)?;
        for row in &over {
            println!(
                "{}  {}  {} open trades",
                strategy,
                row.date.format("%Y-%m-%d %H:%M"),
                row.open_trades
            );
        }
        violations += over.len();
    }
    if violations == 0 {
        println!("No candle exceeded max_open_trades = {}", max_open_trades);
    }
    Ok(violations)
}
