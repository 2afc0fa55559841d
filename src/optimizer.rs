use crate::config::BacktestConfig;
use crate::data_context::MarketData;
use crate::engine::{analyzed_date_bounds, AnalyzedPairs, Backtesting};
use crate::error::EngineError;
use crate::loss::{calculate_loss, loss_function, HyperoptLoss, LossContext};
use crate::optimizer_status::{HyperoptState, OptimizerStatus};
use crate::parameters::{params_key, ParamsDict};
use crate::reports::{generate_strategy_stats, results_explanation};
use crate::sampler::{create_sampler, Sampler, INITIAL_POINTS};
use crate::space::{
    self, params_details, resolve_spaces, Dimension, SPACE_BUY, SPACE_PROTECTION, SPACE_ROI,
    SPACE_SELL, SPACE_STOPLOSS, SPACE_TRADES, SPACE_TRAILING,
};
use crate::storage::{
    clean_hyperopt_results, hyperopt_results_filename, latest_hyperopt_path, save_epochs,
    write_latest_hyperopt, HyperoptEpoch, HyperoptLock,
};
use crate::strategy::{create_strategy, prepare_strategy, save_strategy_params, Strategy};
use crate::trading_rules::RiskSettings;
use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn, Level};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Builds a fresh strategy instance. Every worker owns one.
pub type StrategyFactory = Arc<dyn Fn() -> Result<Box<dyn Strategy>> + Send + Sync>;

/// Loss every real epoch has to beat to count as best.
pub const INITIAL_BEST_LOSS: f64 = 100.0;

const ASK_ATTEMPTS: usize = 5;
const MODEL_ASK_ATTEMPTS: usize = 3;
const ASK_OVERSAMPLING: usize = 5;

/// Log line produced inside a worker, replayed by the coordinator.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub level: Level,
    pub message: String,
}

impl LogRecord {
    fn new(level: Level, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }
}

/// Emits everything queued by workers so far. Returns the number of records.
pub fn drain_log_queue(queue: &Receiver<LogRecord>) -> usize {
    let mut drained = 0;
    while let Ok(record) = queue.try_recv() {
        log::log!(record.level, "{}", record.message);
        drained += 1;
    }
    drained
}

/// Point handed to a worker, flagged when it came from uniform sampling.
#[derive(Debug, Clone, PartialEq)]
pub struct AskedPoint {
    pub params: ParamsDict,
    pub is_random: bool,
}

/// Asks the sampler for `n_points` points not evaluated before. After three
/// model rounds come up short, uniform random points fill the gap. If
/// nothing new turns up at all, a plain ask is returned as-is.
pub fn get_asked_points(
    sampler: &mut dyn Sampler,
    tried: &HashSet<String>,
    n_points: usize,
) -> Vec<AskedPoint> {
    let mut collected: Vec<AskedPoint> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut attempt = 0;
    while collected.len() < n_points && attempt < ASK_ATTEMPTS {
        let is_random = attempt >= MODEL_ASK_ATTEMPTS;
        let candidates = if is_random {
            sampler.sample_random(n_points * ASK_OVERSAMPLING)
        } else if attempt == 0 {
            sampler.ask(n_points)
        } else {
            sampler.ask(n_points * ASK_OVERSAMPLING)
        };
        for params in candidates {
            let key = params_key(&params);
            if tried.contains(&key) || !seen.insert(key) {
                continue;
            }
            collected.push(AskedPoint { params, is_random });
        }
        attempt += 1;
    }
    if collected.is_empty() {
        return sampler
            .ask(n_points)
            .into_iter()
            .map(|params| AskedPoint {
                params,
                is_random: false,
            })
            .collect();
    }
    collected.truncate(n_points);
    collected
}

pub fn is_best_loss(loss: f64, current_best_loss: f64) -> bool {
    loss < current_best_loss
}

/// Number of generations and the size of each, for `jobs` workers.
pub fn generation_sizes(total_epochs: usize, start: usize, jobs: usize) -> Vec<usize> {
    let jobs = jobs.max(1);
    let remaining = total_epochs.saturating_sub(start);
    let generations = (remaining + jobs - 1) / jobs;
    (0..generations)
        .map(|i| {
            let n_rest = (i + 1) * jobs;
            if n_rest > remaining {
                jobs - (n_rest - remaining)
            } else {
                jobs
            }
        })
        .collect()
}

/// Parameter tree as written to the strategy's parameter file.
pub fn export_params(epoch: &HyperoptEpoch) -> Map<String, Value> {
    let mut merged = epoch.params_details.clone();
    for (space, values) in &epoch.params_not_optimized {
        match (merged.get_mut(space), values) {
            (Some(Value::Object(existing)), Value::Object(extra)) => {
                for (key, value) in extra {
                    existing.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }
            (None, _) => {
                merged.insert(space.clone(), values.clone());
            }
            _ => {}
        }
    }
    merged
}

pub fn format_epoch_line(epoch: &HyperoptEpoch, total_epochs: usize) -> String {
    let marker = if epoch.is_best { "*" } else { " " };
    let origin = if epoch.is_random { " (random)" } else { "" };
    format!(
        "{}{:>5}/{}: {} Objective: {:.5}{}",
        marker,
        epoch.current_epoch,
        total_epochs,
        epoch.results_explanation,
        epoch.loss,
        origin
    )
}

/// Read-only state shared by every worker of a run.
struct EvaluationContext {
    factory: StrategyFactory,
    backtesting: Backtesting,
    spaces: Vec<String>,
    dimensions: Vec<Dimension>,
    pairlist: Vec<String>,
    base_params: ParamsDict,
    base_risk: RiskSettings,
    params_not_optimized: Map<String, Value>,
    loss: Box<dyn HyperoptLoss>,
    market: MarketData,
    indicators: Option<AnalyzedPairs>,
    min_date: DateTime<Utc>,
    max_date: DateTime<Utc>,
}

impl EvaluationContext {
    fn config(&self) -> &BacktestConfig {
        self.backtesting.config()
    }

    /// Strategy instance for a worker, carrying the run's base values.
    fn new_strategy(&self) -> Result<Box<dyn Strategy>> {
        let mut strategy = (self.factory)()?;
        strategy.parameters_mut().set_in_space(&self.spaces);
        strategy.apply_parameters(&self.base_params)?;
        Ok(strategy)
    }

    fn strategy_params(&self, params: &ParamsDict) -> ParamsDict {
        params
            .iter()
            .filter(|(name, _)| {
                self.dimensions.iter().any(|d| {
                    &d.name == *name
                        && matches!(d.space.as_str(), SPACE_BUY | SPACE_SELL | SPACE_PROTECTION)
                })
            })
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    fn max_open_trades_override(&self, params: &ParamsDict) -> Option<i64> {
        if !space::has_space(&self.spaces, SPACE_TRADES) {
            return None;
        }
        let mut max_open_trades = params.get("max_open_trades")?.as_i64()?;
        let config = self.config();
        if config.stake_amount.is_unlimited() && (max_open_trades == -1 || max_open_trades == 0) {
            max_open_trades = config.max_open_trades;
        }
        if max_open_trades == 0 {
            max_open_trades = -1;
        }
        Some(max_open_trades)
    }

    /// Runs one epoch: parameters in, scored backtest out.
    fn evaluate(
        &self,
        strategy: &mut dyn Strategy,
        params: &ParamsDict,
        logs: &Sender<LogRecord>,
    ) -> Result<HyperoptEpoch> {
        let started = Instant::now();
        strategy.apply_parameters(&self.strategy_params(params))?;

        let mut risk = self.base_risk.clone();
        risk.apply_params(params, &self.spaces);

        let override_backtesting;
        let backtesting = match self.max_open_trades_override(params) {
            Some(max_open_trades) => {
                let mut config = self.config().clone();
                config.max_open_trades = max_open_trades;
                override_backtesting = Backtesting::new(&config)?;
                &override_backtesting
            }
            None => &self.backtesting,
        };

        let processed = match &self.indicators {
            Some(frames) => backtesting.populate_signals(strategy, frames, HyperoptState::Optimize)?,
            None => backtesting.analyze(strategy, &self.market, HyperoptState::Optimize)?,
        };
        let result = backtesting.backtest(strategy, &risk, &processed)?;
        let stats = generate_strategy_stats(
            backtesting.config(),
            &self.pairlist,
            &result,
            self.min_date,
            self.max_date,
            0.0,
        );
        let context = LossContext {
            results: &result.trades,
            trade_count: result.trades.len(),
            min_date: self.min_date,
            max_date: self.max_date,
            starting_balance: backtesting.starting_balance(),
            stats: &stats,
        };
        let loss = calculate_loss(
            self.loss.as_ref(),
            &context,
            self.config().hyperopt_min_trades,
        );
        let explanation = results_explanation(&stats);
        let _ = logs.send(LogRecord::new(
            Level::Debug,
            format!(
                "Epoch evaluated in {:.2}s: {} trades, loss {:.5}",
                started.elapsed().as_secs_f64(),
                result.trades.len(),
                loss
            ),
        ));
        Ok(HyperoptEpoch {
            loss,
            params_dict: params.clone(),
            params_details: params_details(params, &self.dimensions),
            params_not_optimized: self.params_not_optimized.clone(),
            total_profit: stats.profit_total_abs,
            results_explanation: explanation,
            results_metrics: stats,
            current_epoch: 0,
            is_initial_point: false,
            is_random: false,
            is_best: false,
            file_version: 0,
        })
    }
}

struct EpochTask {
    index: usize,
    params: ParamsDict,
}

struct EpochOutcome {
    index: usize,
    result: std::result::Result<HyperoptEpoch, String>,
}

/// Outcome of a hyperopt run.
#[derive(Debug, Clone)]
pub struct HyperoptSummary {
    pub epochs_saved: usize,
    pub best: Option<HyperoptEpoch>,
    pub results_file: PathBuf,
    pub params_file: Option<PathBuf>,
    pub interrupted: bool,
}

/// Drives the ask/evaluate/tell loop over a pool of worker threads.
pub struct Hyperopt {
    config: BacktestConfig,
    factory: StrategyFactory,
    status: OptimizerStatus,
    cancel: Arc<AtomicBool>,
    results_file: PathBuf,
    total_epochs: usize,
    jobs: usize,
    random_state: u64,
    current_best_loss: f64,
    current_best_epoch: Option<HyperoptEpoch>,
    num_epochs_saved: usize,
}

impl Hyperopt {
    pub fn new(config: BacktestConfig, factory: StrategyFactory) -> Result<Self> {
        config.validate()?;
        let strategy = factory()?;
        let results_file = hyperopt_results_filename(
            &config.hyperopt_results_dir(),
            strategy.name(),
            Utc::now(),
        );
        let random_state = config
            .hyperopt_random_state
            .unwrap_or_else(|| fastrand::u64(1..65535));
        Ok(Self {
            total_epochs: config.epochs,
            jobs: config.effective_jobs(),
            config,
            factory,
            status: OptimizerStatus::new(),
            cancel: Arc::new(AtomicBool::new(false)),
            results_file,
            random_state,
            current_best_loss: INITIAL_BEST_LOSS,
            current_best_epoch: None,
            num_epochs_saved: 0,
        })
    }

    /// Hyperopt for the strategy named in the configuration.
    pub fn for_config(config: BacktestConfig) -> Result<Self> {
        let name = config.strategy.clone();
        let factory: StrategyFactory = Arc::new(move || create_strategy(&name));
        Self::new(config, factory)
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn status(&self) -> OptimizerStatus {
        self.status.clone()
    }

    pub fn results_file(&self) -> &Path {
        &self.results_file
    }

    pub fn random_state(&self) -> u64 {
        self.random_state
    }

    pub fn start(&mut self) -> Result<HyperoptSummary> {
        let _lock = HyperoptLock::acquire(&self.config.user_data_dir)?;
        if self.config.hyperopt_clean {
            if let Ok(previous) = latest_hyperopt_path(&self.config.hyperopt_results_dir()) {
                clean_hyperopt_results(&previous)?;
            }
        }
        info!("Using optimizer random state: {}", self.random_state);

        let context = Arc::new(self.prepare()?);
        let mut sampler =
            create_sampler(self.config.sampler()?, context.dimensions.clone(), self.random_state);
        let mut tried: HashSet<String> = HashSet::new();

        info!(
            "Found {} CPU cores. Let's make them scream!",
            num_cpus::get()
        );
        info!("Number of parallel jobs set as: {}", self.jobs);
        info!(
            "Effective number of parallel workers used: {}",
            self.jobs.min(self.total_epochs.max(1))
        );

        let pb = ProgressBar::new(self.total_epochs as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        let (log_tx, log_rx) = unbounded::<LogRecord>();

        let mut start = 0;
        let mut interrupted = false;
        if context.indicators.is_none() && self.total_epochs > 0 {
            // Indicators are computed inside the first epoch; run it alone.
            let asked = get_asked_points(sampler.as_mut(), &tried, 1);
            let outcomes = self.run_generation(&context, &asked, &log_tx, &pb)?;
            self.tell_generation(sampler.as_mut(), &mut tried, &asked, &outcomes);
            self.record_generation(asked, outcomes, 0, &pb, &log_rx)?;
            start = 1;
        }

        for (i, current_jobs) in generation_sizes(self.total_epochs, start, self.jobs)
            .into_iter()
            .enumerate()
        {
            if self.cancel.load(Ordering::SeqCst) {
                interrupted = true;
                break;
            }
            let asked = get_asked_points(sampler.as_mut(), &tried, current_jobs);
            let outcomes = self.run_generation(&context, &asked, &log_tx, &pb)?;
            self.tell_generation(sampler.as_mut(), &mut tried, &asked, &outcomes);
            self.record_generation(asked, outcomes, start + i * self.jobs, &pb, &log_rx)?;
        }
        drain_log_queue(&log_rx);

        if interrupted || self.cancel.load(Ordering::SeqCst) {
            interrupted = true;
            pb.abandon();
            println!("User interrupted..");
            self.status.transition(HyperoptState::Interrupted);
        } else {
            pb.finish_and_clear();
            self.status.transition(HyperoptState::Completed);
        }

        info!(
            "{} epochs saved to '{}'.",
            self.num_epochs_saved,
            self.results_file.display()
        );

        let mut params_file = None;
        match &self.current_best_epoch {
            Some(best) => {
                let strategy_name = (self.factory)()?.name().to_string();
                params_file = Some(save_strategy_params(
                    &self.config.strategy_params_dir(),
                    &strategy_name,
                    export_params(best),
                )?);
                println!(
                    "\nBest result:\n\n{}\n",
                    format_epoch_line(best, self.total_epochs)
                );
                println!(
                    "{}",
                    serde_json::to_string_pretty(&Value::Object(export_params(best)))?
                );
            }
            None if self.num_epochs_saved > 0 => println!(
                "No good result found for given optimization function in {} epochs.",
                self.num_epochs_saved
            ),
            None => println!("No epochs evaluated yet, no best result."),
        }

        Ok(HyperoptSummary {
            epochs_saved: self.num_epochs_saved,
            best: self.current_best_epoch.clone(),
            results_file: self.results_file.clone(),
            params_file,
            interrupted,
        })
    }

    fn prepare(&self) -> Result<EvaluationContext> {
        self.status.transition(HyperoptState::DataLoad);
        let spaces = resolve_spaces(&self.config.spaces)?;
        let mut config = self.config.clone();
        if space::has_space(&spaces, SPACE_SELL) {
            // Sell parameters only matter when exit signals are honoured.
            config.use_exit_signal = true;
        }

        let mut strategy = (self.factory)()?;
        let mut base_risk = prepare_strategy(strategy.as_mut(), &config)?;
        base_risk.use_exit_signal = config.use_exit_signal;
        strategy.parameters_mut().set_in_space(&spaces);
        let backtesting = Backtesting::new(&config)?;

        let market = backtesting.load_market_data(strategy.as_ref(), &self.status)?;
        let pairlist = market.pairs().to_vec();
        let dimensions = self.dimensions(strategy.as_ref(), &spaces, &backtesting, pairlist.len())?;

        let indicators = if config.analyze_per_epoch {
            None
        } else {
            self.status.transition(HyperoptState::Indicators);
            self.status.set_phase("Calculating indicators");
            Some(backtesting.populate_indicators(
                strategy.as_ref(),
                &market,
                HyperoptState::Indicators,
            )?)
        };
        self.status.transition(HyperoptState::Optimize);

        let preprocessed = match &indicators {
            Some(frames) => {
                backtesting.populate_signals(strategy.as_ref(), frames, HyperoptState::Optimize)?
            }
            None => backtesting.analyze(strategy.as_ref(), &market, HyperoptState::Optimize)?,
        };
        let (min_date, max_date) = analyzed_date_bounds(&preprocessed)
            .ok_or_else(|| anyhow!("No data left after adjusting for startup candles."))?;
        info!(
            "Hyperopting with data from {} up to {} ({} days)..",
            min_date.format("%Y-%m-%d %H:%M:%S"),
            max_date.format("%Y-%m-%d %H:%M:%S"),
            (max_date - min_date).num_days()
        );

        let base_params: ParamsDict = strategy
            .parameters()
            .iter()
            .filter_map(|p| Some((p.name()?.to_string(), p.value().clone())))
            .collect();
        let params_not_optimized = not_optimized_details(strategy.as_ref(), &base_risk, &config, &spaces);
        let loss = loss_function(config.loss_function()?);
        info!("Using loss function: {}", loss.name());

        Ok(EvaluationContext {
            factory: Arc::clone(&self.factory),
            backtesting,
            spaces,
            dimensions,
            pairlist,
            base_params,
            base_risk,
            params_not_optimized,
            loss,
            market,
            indicators,
            min_date,
            max_date,
        })
    }

    fn dimensions(
        &self,
        strategy: &dyn Strategy,
        spaces: &[String],
        backtesting: &Backtesting,
        pair_count: usize,
    ) -> Result<Vec<Dimension>> {
        let mut dimensions = Vec::new();
        for space in spaces {
            match space.as_str() {
                SPACE_BUY | SPACE_SELL | SPACE_PROTECTION => {
                    let found = strategy.parameters().dimensions(space);
                    if found.is_empty() {
                        return Err(EngineError::configuration(format!(
                            "The '{}' space is included into the hyperoptimization but no \
                             parameter for this space was found in your Strategy. Please make \
                             sure to have parameters for this space enabled for optimization or \
                             remove the '{}' space from hyperoptimization.",
                            space, space
                        ))
                        .into());
                    }
                    dimensions.extend(found);
                }
                SPACE_ROI => dimensions.extend(space::roi_space(backtesting.timeframe_minutes())),
                SPACE_STOPLOSS => dimensions.extend(space::stoploss_space()),
                SPACE_TRAILING => dimensions.extend(space::trailing_space()),
                SPACE_TRADES => dimensions.extend(space::trades_space(pair_count)),
                other => bail!("Unknown hyperopt space '{}'", other),
            }
        }
        if dimensions.is_empty() {
            return Err(EngineError::configuration("No parameters to optimize.").into());
        }
        debug!(
            "Hyperopt dimensions: {}",
            dimensions
                .iter()
                .map(|d| d.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(dimensions)
    }

    /// Evaluates `asked` on up to `jobs` threads. Outcomes come back in ask order.
    fn run_generation(
        &self,
        context: &Arc<EvaluationContext>,
        asked: &[AskedPoint],
        logs: &Sender<LogRecord>,
        pb: &ProgressBar,
    ) -> Result<Vec<std::result::Result<HyperoptEpoch, String>>> {
        let task_count = asked.len();
        let num_workers = std::cmp::min(task_count, self.jobs).max(1);
        let (tx, rx): (Sender<EpochTask>, Receiver<EpochTask>) = bounded(task_count.max(1));
        let (result_tx, result_rx): (Sender<EpochOutcome>, Receiver<EpochOutcome>) =
            bounded(task_count.max(1));

        let mut handles = Vec::new();
        for worker_id in 0..num_workers {
            let rx = rx.clone();
            let result_tx = result_tx.clone();
            let context = Arc::clone(context);
            let logs = logs.clone();
            let handle = thread::spawn(move || {
                let mut strategy = context.new_strategy();
                while let Ok(task) = rx.recv() {
                    let result = match strategy.as_mut() {
                        Ok(strategy) => context
                            .evaluate(&mut **strategy, &task.params, &logs)
                            .map_err(|err| format!("{:#}", err)),
                        Err(err) => Err(format!("{:#}", err)),
                    };
                    if let Err(error) = &result {
                        let _ = logs.send(LogRecord::new(
                            Level::Warn,
                            format!("Worker {} failed an epoch: {}", worker_id, error),
                        ));
                    }
                    let outcome = EpochOutcome {
                        index: task.index,
                        result,
                    };
                    if result_tx.send(outcome).is_err() {
                        break;
                    }
                }
            });
            handles.push(handle);
        }
        drop(result_tx);

        for (index, point) in asked.iter().enumerate() {
            tx.send(EpochTask {
                index,
                params: point.params.clone(),
            })?;
        }
        drop(tx);

        let mut outcomes: Vec<Option<std::result::Result<HyperoptEpoch, String>>> =
            (0..task_count).map(|_| None).collect();
        let mut completed = 0;
        while completed < task_count {
            match result_rx.recv_timeout(Duration::from_millis(200)) {
                Ok(outcome) => {
                    completed += 1;
                    outcomes[outcome.index] = Some(outcome.result);
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => pb.tick(),
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    warn!("Result channel closed unexpectedly. Some epochs may be lost.");
                    break;
                }
            }
        }

        for handle in handles {
            if handle.join().is_err() {
                warn!("Hyperopt worker thread panicked");
            }
        }
        Ok(outcomes
            .into_iter()
            .map(|outcome| outcome.unwrap_or_else(|| Err("Epoch result lost".to_string())))
            .collect())
    }

    fn tell_generation(
        &self,
        sampler: &mut dyn Sampler,
        tried: &mut HashSet<String>,
        asked: &[AskedPoint],
        outcomes: &[std::result::Result<HyperoptEpoch, String>],
    ) {
        for (point, outcome) in asked.iter().zip(outcomes) {
            if let Ok(epoch) = outcome {
                sampler.tell(&point.params, epoch.loss);
                tried.insert(params_key(&point.params));
            }
        }
    }

    /// Numbers, scores and persists one generation's epochs in ask order.
    fn record_generation(
        &mut self,
        asked: Vec<AskedPoint>,
        outcomes: Vec<std::result::Result<HyperoptEpoch, String>>,
        first_epoch_offset: usize,
        pb: &ProgressBar,
        logs: &Receiver<LogRecord>,
    ) -> Result<()> {
        drain_log_queue(logs);
        if let Some(error) = outcomes.iter().find_map(|o| o.as_ref().err()) {
            pb.abandon();
            self.status.set_progress(
                self.total_epochs,
                self.num_epochs_saved,
                outcomes.iter().filter(|o| o.is_err()).count(),
            );
            bail!(
                "Epoch evaluation failed: {}. {} epochs saved to '{}'.",
                error,
                self.num_epochs_saved,
                self.results_file.display()
            );
        }
        for (j, (point, outcome)) in asked.into_iter().zip(outcomes).enumerate() {
            if let Ok(epoch) = outcome {
                let current_epoch = first_epoch_offset + j + 1;
                self.evaluate_result(epoch, current_epoch, point.is_random, pb)?;
                pb.inc(1);
            }
        }
        self.status
            .set_progress(self.total_epochs, self.num_epochs_saved, 0);
        Ok(())
    }

    fn evaluate_result(
        &mut self,
        mut epoch: HyperoptEpoch,
        current_epoch: usize,
        is_random: bool,
        pb: &ProgressBar,
    ) -> Result<()> {
        epoch.current_epoch = current_epoch;
        epoch.is_initial_point = current_epoch <= INITIAL_POINTS;
        epoch.is_random = is_random;
        epoch.is_best = is_best_loss(epoch.loss, self.current_best_loss);

        if self.config.print_all || epoch.is_best {
            pb.println(format_epoch_line(&epoch, self.total_epochs));
        }
        if epoch.is_best {
            self.current_best_loss = epoch.loss;
            self.status.record_best(current_epoch, epoch.loss);
            self.current_best_epoch = Some(epoch.clone());
        }

        save_epochs(&self.results_file, std::slice::from_ref(&epoch))?;
        self.num_epochs_saved += 1;
        debug!(
            "{} epoch(s) saved to '{}'.",
            self.num_epochs_saved,
            self.results_file.display()
        );
        let results_dir = self
            .results_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.config.hyperopt_results_dir());
        write_latest_hyperopt(&results_dir, &self.results_file)
    }
}

/// Values held fixed during the run, grouped the way epoch records store them.
fn not_optimized_details(
    strategy: &dyn Strategy,
    risk: &RiskSettings,
    config: &BacktestConfig,
    spaces: &[String],
) -> Map<String, Value> {
    let mut details = Map::new();
    for (space, values) in strategy.parameters().not_optimized() {
        let section: Map<String, Value> = values
            .into_iter()
            .map(|(name, value)| (name, value.to_json()))
            .collect();
        details.insert(space, Value::Object(section));
    }
    if !space::has_space(spaces, SPACE_ROI) {
        details.insert(SPACE_ROI.to_string(), risk.minimal_roi.to_json());
    }
    if !space::has_space(spaces, SPACE_STOPLOSS) {
        details.insert(
            SPACE_STOPLOSS.to_string(),
            json!({ "stoploss": risk.stoploss }),
        );
    }
    if !space::has_space(spaces, SPACE_TRAILING) {
        details.insert(
            SPACE_TRAILING.to_string(),
            json!({
                "trailing_stop": risk.trailing_stop,
                "trailing_stop_positive": risk.trailing_stop_positive,
                "trailing_stop_positive_offset": risk.trailing_stop_positive_offset,
                "trailing_only_offset_is_reached": risk.trailing_only_offset_is_reached,
            }),
        );
    }
    if !space::has_space(spaces, SPACE_TRADES) {
        details.insert(
            "max_open_trades".to_string(),
            json!({ "max_open_trades": config.max_open_trades }),
        );
    }
    details
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::ParameterValue;

    /// Hands out the same three points forever.
    struct CyclingSampler {
        points: Vec<ParamsDict>,
        next: usize,
        random_calls: usize,
    }

    fn point(value: i64) -> ParamsDict {
        let mut params = ParamsDict::new();
        params.insert("buy_rsi".to_string(), ParameterValue::Int(value));
        params
    }

    impl CyclingSampler {
        fn new() -> Self {
            Self {
                points: vec![point(1), point(2), point(3)],
                next: 0,
                random_calls: 0,
            }
        }
    }

    impl Sampler for CyclingSampler {
        fn ask(&mut self, n: usize) -> Vec<ParamsDict> {
            (0..n)
                .map(|_| {
                    let p = self.points[self.next % self.points.len()].clone();
                    self.next += 1;
                    p
                })
                .collect()
        }

        fn tell(&mut self, _point: &ParamsDict, _loss: f64) {}

        fn sample_random(&mut self, n: usize) -> Vec<ParamsDict> {
            self.random_calls += 1;
            (0..n).map(|i| point(100 + i as i64)).collect()
        }

        fn told(&self) -> usize {
            0
        }
    }

    #[test]
    fn asked_points_are_unique_and_sized() {
        let mut sampler = CyclingSampler::new();
        let asked = get_asked_points(&mut sampler, &HashSet::new(), 2);
        assert_eq!(asked.len(), 2);
        assert_ne!(asked[0].params, asked[1].params);
        assert!(asked.iter().all(|p| !p.is_random));
        assert_eq!(sampler.random_calls, 0);
    }

    #[test]
    fn exhausted_model_falls_back_to_random_points() {
        let mut sampler = CyclingSampler::new();
        let asked = get_asked_points(&mut sampler, &HashSet::new(), 5);
        assert_eq!(asked.len(), 5);
        assert_eq!(asked.iter().filter(|p| !p.is_random).count(), 3);
        assert_eq!(asked.iter().filter(|p| p.is_random).count(), 2);
        assert_eq!(sampler.random_calls, 1);
    }

    #[test]
    fn previously_evaluated_points_are_skipped() {
        let mut sampler = CyclingSampler::new();
        let tried: HashSet<String> = [point(1), point(2)].iter().map(params_key).collect();
        let asked = get_asked_points(&mut sampler, &tried, 1);
        assert_eq!(asked, vec![AskedPoint { params: point(3), is_random: false }]);
    }

    #[test]
    fn best_flag_tracks_strict_improvements() {
        let mut best = INITIAL_BEST_LOSS;
        let flags: Vec<bool> = [5.0, 3.0, 3.0, 1.0, 4.0]
            .iter()
            .map(|&loss| {
                let is_best = is_best_loss(loss, best);
                if is_best {
                    best = loss;
                }
                is_best
            })
            .collect();
        assert_eq!(flags, vec![true, true, false, true, false]);
        assert!(!is_best_loss(crate::loss::MAX_LOSS, INITIAL_BEST_LOSS));
    }

    #[test]
    fn generations_cover_every_epoch() {
        assert_eq!(generation_sizes(10, 0, 4), vec![4, 4, 2]);
        assert_eq!(generation_sizes(10, 1, 3), vec![3, 3, 3]);
        assert_eq!(generation_sizes(3, 0, 8), vec![3]);
        assert!(generation_sizes(0, 0, 2).is_empty());
        assert_eq!(generation_sizes(5, 0, 1).iter().sum::<usize>(), 5);
    }

    fn empty_stats() -> crate::reports::StrategyStats {
        use chrono::TimeZone;
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let result = crate::models::BacktestResult {
            run_id: "test".to_string(),
            strategy: "sample".to_string(),
            trades: Vec::new(),
            rejected_signals: 0,
            rejected_signal_log: Vec::new(),
            timedout_entry_orders: 0,
            timedout_exit_orders: 0,
            canceled_trade_entries: 0,
            canceled_entry_orders: 0,
            replaced_entry_orders: 0,
            starting_balance: 1000.0,
            final_balance: 1000.0,
            backtest_start_time: 0,
            backtest_end_time: 0,
        };
        generate_strategy_stats(&BacktestConfig::default(), &[], &result, start, start, 0.0)
    }

    #[test]
    fn export_merges_fixed_values_into_optimized_sections() {
        let mut details = Map::new();
        details.insert("buy".to_string(), json!({ "buy_rsi": 30 }));
        details.insert("stoploss".to_string(), json!({ "stoploss": -0.05 }));
        let mut fixed = Map::new();
        fixed.insert("buy".to_string(), json!({ "buy_enabled": true, "buy_rsi": 99 }));
        fixed.insert("roi".to_string(), json!({ "0": 0.1 }));
        let epoch = HyperoptEpoch {
            loss: 1.0,
            params_dict: ParamsDict::new(),
            params_details: details,
            params_not_optimized: fixed,
            results_metrics: empty_stats(),
            results_explanation: String::new(),
            total_profit: 0.0,
            current_epoch: 1,
            is_initial_point: true,
            is_random: false,
            is_best: true,
            file_version: 0,
        };
        let merged = export_params(&epoch);
        assert_eq!(merged["buy"], json!({ "buy_rsi": 30, "buy_enabled": true }));
        assert_eq!(merged["roi"], json!({ "0": 0.1 }));
        assert_eq!(merged["stoploss"], json!({ "stoploss": -0.05 }));
    }
}
