use anyhow::Result;
use backtest_engine::{
    commands::{backtesting, hyperopt, list_hyperopt, parallelism},
    config::BacktestConfig,
};
use clap::{Parser, Subcommand};
use log::info;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "backtest-engine")]
#[command(about = "Candle-based strategy backtesting and hyperparameter optimization")]
struct Cli {
    /// Verbose logging (debug level)
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Backtest a strategy over historical candles
    Backtesting {
        /// Path to the JSON configuration
        #[arg(short, long, value_name = "PATH")]
        config: PathBuf,
        /// Strategy to run (overrides the configuration)
        #[arg(short, long)]
        strategy: Option<String>,
        /// Timerange such as 20240101-20240301
        #[arg(long)]
        timerange: Option<String>,
        /// Directory or file the results are exported to
        #[arg(long = "export-dir", value_name = "PATH")]
        export_dir: Option<PathBuf>,
    },
    /// Optimize strategy parameters
    Hyperopt {
        /// Path to the JSON configuration
        #[arg(short, long, value_name = "PATH")]
        config: PathBuf,
        /// Strategy to optimize (overrides the configuration)
        #[arg(short, long)]
        strategy: Option<String>,
        #[arg(short, long)]
        epochs: Option<usize>,
        /// Spaces to optimize: all, default, buy, sell, roi, stoploss, trailing, protection, trades
        #[arg(long, num_args = 1..)]
        spaces: Vec<String>,
        /// Loss function name
        #[arg(long = "hyperopt-loss", alias = "loss")]
        loss: Option<String>,
        /// Sampler: TPESampler or RandomSampler
        #[arg(long)]
        sampler: Option<String>,
        /// Parallel workers (-1 = all cores, -2 = all but one)
        #[arg(short = 'j', long = "job-workers", allow_hyphen_values = true)]
        jobs: Option<i64>,
        #[arg(long = "random-state")]
        random_state: Option<u64>,
        #[arg(long = "min-trades")]
        min_trades: Option<usize>,
        /// Print every epoch, not just improvements
        #[arg(long = "print-all")]
        print_all: bool,
        /// Recompute indicators inside every epoch
        #[arg(long = "analyze-per-epoch")]
        analyze_per_epoch: bool,
        /// Remove the previous results file first
        #[arg(long = "hyperopt-clean")]
        clean: bool,
        #[arg(long)]
        timerange: Option<String>,
    },
    /// Find candles of a stored backtest where too many trades were open
    Parallelism {
        /// Backtest archive (.bin)
        #[arg(long, value_name = "PATH")]
        result: PathBuf,
        #[arg(long, default_value = "5m")]
        timeframe: String,
        /// -1 means unlimited
        #[arg(long = "max-open-trades", allow_hyphen_values = true)]
        max_open_trades: i64,
    },
    /// Show the best epoch of a hyperopt results file
    ListHyperopt {
        /// Results file; defaults to the latest run under the user data directory
        #[arg(long, value_name = "PATH")]
        file: Option<PathBuf>,
        #[arg(long = "user-data-dir", value_name = "PATH", default_value = "user_data")]
        user_data_dir: PathBuf,
    },
}

fn load_config(
    path: &Path,
    strategy: Option<String>,
    timerange: Option<String>,
) -> Result<BacktestConfig> {
    let mut config = BacktestConfig::from_file(path)?;
    if let Some(strategy) = strategy {
        config.strategy = strategy;
    }
    if timerange.is_some() {
        config.timerange = timerange;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let Cli { verbose, command } = cli;

    let default_level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    info!("Starting backtest-engine. Past performance does not predict future results.");

    match command {
        Commands::Backtesting {
            config,
            strategy,
            timerange,
            export_dir,
        } => {
            let mut config = load_config(&config, strategy, timerange)?;
            if export_dir.is_some() {
                config.exportfilename = export_dir;
            }
            backtesting::run(&config)?;
        }
        Commands::Hyperopt {
            config,
            strategy,
            epochs,
            spaces,
            loss,
            sampler,
            jobs,
            random_state,
            min_trades,
            print_all,
            analyze_per_epoch,
            clean,
            timerange,
        } => {
            let mut config = load_config(&config, strategy, timerange)?;
            if let Some(epochs) = epochs {
                config.epochs = epochs;
            }
            if !spaces.is_empty() {
                config.spaces = spaces;
            }
            if let Some(loss) = loss {
                config.hyperopt_loss = loss;
            }
            if let Some(sampler) = sampler {
                config.hyperopt_sampler = sampler;
            }
            if let Some(jobs) = jobs {
                config.hyperopt_jobs = jobs;
            }
            if random_state.is_some() {
                config.hyperopt_random_state = random_state;
            }
            if let Some(min_trades) = min_trades {
                config.hyperopt_min_trades = min_trades;
            }
            config.print_all |= print_all;
            config.analyze_per_epoch |= analyze_per_epoch;
            config.hyperopt_clean |= clean;
            hyperopt::run(config).await?;
        }
        Commands::Parallelism {
            result,
            timeframe,
            max_open_trades,
        } => {
            parallelism::run(&result, &timeframe, max_open_trades)?;
        }
        Commands::ListHyperopt {
            file,
            user_data_dir,
        } => {
            let path = list_hyperopt::resolve_results_file(
                file,
                &user_data_dir.join("hyperopt_results"),
            )?;
            list_hyperopt::run(&path)?;
        }
    }

    Ok(())
}
