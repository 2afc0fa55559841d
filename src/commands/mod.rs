pub mod backtesting;
pub mod hyperopt;
pub mod list_hyperopt;
pub mod parallelism;
