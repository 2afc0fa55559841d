use crate::config::LossFunctionName;
use crate::models::Trade;
use crate::performance::PerformanceCalculator;
use crate::reports::{StrategyStats, TOTAL_KEY};
use chrono::{DateTime, Utc};

/// Loss assigned to epochs with too few trades to be scored.
pub const MAX_LOSS: f64 = 100_000.0;

/// Acceptable profit/drawdown ratio per pair before the penalty applies.
const ACCEPTABLE_PAIR_RATIO: f64 = 1.0;
const PAIR_PENALTY: f64 = 20.0;

/// Everything a loss function may look at for one evaluated epoch.
pub struct LossContext<'a> {
    pub results: &'a [Trade],
    pub trade_count: usize,
    pub min_date: DateTime<Utc>,
    pub max_date: DateTime<Utc>,
    pub starting_balance: f64,
    pub stats: &'a StrategyStats,
}

/// Objective minimized by the optimizer. Lower is better.
pub trait HyperoptLoss: Send + Sync {
    fn name(&self) -> &'static str;

    fn hyperopt_loss_function(&self, context: &LossContext) -> f64;
}

pub struct SharpeHyperOptLoss;

impl HyperoptLoss for SharpeHyperOptLoss {
    fn name(&self) -> &'static str {
        LossFunctionName::Sharpe.label()
    }

    fn hyperopt_loss_function(&self, context: &LossContext) -> f64 {
        -PerformanceCalculator::calculate_sharpe(
            context.results,
            context.min_date,
            context.max_date,
            context.starting_balance,
        )
    }
}

pub struct SortinoHyperOptLoss;

impl HyperoptLoss for SortinoHyperOptLoss {
    fn name(&self) -> &'static str {
        LossFunctionName::Sortino.label()
    }

    fn hyperopt_loss_function(&self, context: &LossContext) -> f64 {
        -PerformanceCalculator::calculate_sortino(
            context.results,
            context.min_date,
            context.max_date,
            context.starting_balance,
        )
    }
}

pub struct CalmarHyperOptLoss;

impl HyperoptLoss for CalmarHyperOptLoss {
    fn name(&self) -> &'static str {
        LossFunctionName::Calmar.label()
    }

    fn hyperopt_loss_function(&self, context: &LossContext) -> f64 {
        -PerformanceCalculator::calculate_calmar(
            context.results,
            context.min_date,
            context.max_date,
            context.starting_balance,
        )
    }
}

/// Scores the worst pair's profit/drawdown ratio so no single pair is
/// sacrificed for the aggregate.
pub struct MaxDrawDownPerPairHyperOptLoss;

impl HyperoptLoss for MaxDrawDownPerPairHyperOptLoss {
    fn name(&self) -> &'static str {
        LossFunctionName::MaxDrawDownPerPair.label()
    }

    fn hyperopt_loss_function(&self, context: &LossContext) -> f64 {
        let worst = context
            .stats
            .results_per_pair
            .iter()
            .filter(|row| row.key != TOTAL_KEY)
            .map(|row| {
                let profit = row.profit_total_abs;
                let drawdown = row.max_drawdown_abs;
                let ratio = if profit != 0.0 && drawdown != 0.0 {
                    profit / drawdown
                } else {
                    profit
                };
                if ratio < ACCEPTABLE_PAIR_RATIO {
                    ratio - PAIR_PENALTY
                } else {
                    ratio
                }
            })
            .fold(f64::INFINITY, f64::min);
        if worst.is_finite() {
            -worst
        } else {
            0.0
        }
    }
}

pub fn loss_function(name: LossFunctionName) -> Box<dyn HyperoptLoss> {
    match name {
        LossFunctionName::Sharpe => Box::new(SharpeHyperOptLoss),
        LossFunctionName::Sortino => Box::new(SortinoHyperOptLoss),
        LossFunctionName::Calmar => Box::new(CalmarHyperOptLoss),
        LossFunctionName::MaxDrawDownPerPair => Box::new(MaxDrawDownPerPairHyperOptLoss),
    }
}

/// Loss of one epoch, or `MAX_LOSS` when fewer than `min_trades` trades exist.
pub fn calculate_loss(loss: &dyn HyperoptLoss, context: &LossContext, min_trades: usize) -> f64 {
    if context.trade_count < min_trades {
        return MAX_LOSS;
    }
    let value = loss.hyperopt_loss_function(context);
    if value.is_finite() {
        value
    } else {
        MAX_LOSS
    }
}
