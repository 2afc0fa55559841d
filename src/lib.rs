pub mod analysis;
pub mod candle_utils;
pub mod commands;
pub mod config;
pub mod data_context;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod indicators;
pub mod loss;
pub mod models;
pub mod optimizer;
pub mod optimizer_status;
pub mod orderflow;
pub mod parameters;
pub mod performance;
pub mod reports;
pub mod sampler;
pub mod space;
pub mod storage;
pub mod strategy;
pub mod strategy_utils;
pub mod trading_rules;
