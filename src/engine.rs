use crate::candle_utils::{merged_event_stream, timeframe_to_minutes, TimeRange};
use crate::config::BacktestConfig;
use crate::data_context::{load_trades_json, MarketData};
use crate::exchange::{Exchange, LiquidationParams};
use crate::models::*;
use crate::optimizer_status::{HyperoptState, OptimizerStatus};
use crate::orderflow::populate_with_trades;
use crate::strategy::{
    advise_indicators, advise_signals, is_validation_failure, strategy_safe_wrapper, Metadata,
    SignalFrame, Strategy,
};
use crate::trading_rules::{
    determine_stake_amount, exit_signal_allowed, roi_exit_price, stop_loss_exit_price,
    trailed_stop_exit_price, RiskSettings, RoiExitParams, StakeSizingOutcome, StakeSizingParams,
    PRICE_EPSILON,
};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use uuid::Uuid;

const CUSTOM_EXIT_MAX_LENGTH: usize = 64;

/// Analyzed frames per pair, trimmed to the trading window.
pub type AnalyzedPairs = BTreeMap<String, SignalFrame>;

/// First and last candle dates across analyzed frames.
pub fn analyzed_date_bounds(frames: &AnalyzedPairs) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let min = frames
        .values()
        .filter_map(|frame| frame.candles.first().map(|c| c.date))
        .min()?;
    let max = frames
        .values()
        .filter_map(|frame| frame.candles.last().map(|c| c.date))
        .max()?;
    Some((min, max))
}

#[derive(Debug, PartialEq)]
enum EntrySignalOutcome {
    Executed(TradeId),
    Pending(TradeId),
    Skipped {
        reason: &'static str,
        details: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
struct ExitDecision {
    rate: f64,
    exit_type: ExitType,
    reason: Option<String>,
}

/// Signals of the previous row, acted upon at the current row's open.
#[derive(Debug, Clone, Copy, Default)]
struct SignalRow<'a> {
    enter_long: bool,
    enter_short: bool,
    exit_long: bool,
    exit_short: bool,
    enter_tag: Option<&'a str>,
    exit_tag: Option<&'a str>,
}

impl<'a> SignalRow<'a> {
    fn at(frame: &'a SignalFrame, row: usize) -> Self {
        Self {
            enter_long: frame.enter_long.get(row).copied().unwrap_or(false),
            enter_short: frame.enter_short.get(row).copied().unwrap_or(false),
            exit_long: frame.exit_long.get(row).copied().unwrap_or(false),
            exit_short: frame.exit_short.get(row).copied().unwrap_or(false),
            enter_tag: frame.enter_tag.get(row).and_then(|tag| tag.as_deref()),
            exit_tag: frame.exit_tag.get(row).and_then(|tag| tag.as_deref()),
        }
    }

    /// Entry direction (`Some(is_short)`); conflicting signals cancel out.
    fn entry_direction(&self, can_short: bool) -> Option<bool> {
        if self.enter_long && !self.exit_long && !self.enter_short {
            Some(false)
        } else if can_short && self.enter_short && !self.exit_short && !self.enter_long {
            Some(true)
        } else {
            None
        }
    }

    fn exits(&self, is_short: bool) -> bool {
        if is_short {
            self.exit_short && !self.enter_short
        } else {
            self.exit_long && !self.enter_long
        }
    }

    fn enters(&self, is_short: bool) -> bool {
        if is_short {
            self.enter_short
        } else {
            self.enter_long
        }
    }
}

/// Mutable state of one replay.
#[derive(Default)]
struct BacktestLoop {
    trades: Vec<Trade>,
    open_by_pair: BTreeMap<String, Vec<TradeId>>,
    closed: Vec<TradeId>,
    last_funding: HashMap<TradeId, DateTime<Utc>>,
    realized_profit: f64,
    rejected: Vec<RejectedSignal>,
    timedout_entry_orders: usize,
    canceled_trade_entries: usize,
    canceled_entry_orders: usize,
    replaced_entry_orders: usize,
}

impl BacktestLoop {
    fn open_ids(&self) -> impl Iterator<Item = TradeId> + '_ {
        self.open_by_pair.values().flatten().copied()
    }

    fn open_trade_count(&self) -> usize {
        self.open_by_pair.values().map(Vec::len).sum()
    }

    fn tied_up(&self) -> f64 {
        self.open_ids().map(|id| self.trades[id.0].stake_amount).sum()
    }

    fn free_balance(&self, starting_balance: f64) -> f64 {
        starting_balance + self.realized_profit - self.tied_up()
    }

    fn pair_ids(&self, pair: &str) -> Vec<TradeId> {
        self.open_by_pair.get(pair).cloned().unwrap_or_default()
    }

    fn detach(&mut self, pair: &str, id: TradeId) {
        if let Some(ids) = self.open_by_pair.get_mut(pair) {
            ids.retain(|open| *open != id);
            if ids.is_empty() {
                self.open_by_pair.remove(pair);
            }
        }
        self.last_funding.remove(&id);
    }

    fn close_trade(&mut self, id: TradeId, decision: ExitDecision, date: DateTime<Utc>) {
        let trade = &mut self.trades[id.0];
        trade.close(decision.rate, date, decision.exit_type, decision.reason);
        self.realized_profit += trade.profit_abs();
        debug!(
            "Closed {} trade {} on {} at {:.8} ({}), profit {:.8}",
            trade.direction(),
            id,
            trade.pair,
            decision.rate,
            decision.exit_type,
            trade.profit_abs()
        );
        let pair = trade.pair.clone();
        self.detach(&pair, id);
        self.closed.push(id);
    }

    /// Drops a trade whose entry order never filled. The stake is released and
    /// the trade never reaches the ledger.
    fn cancel_entry(&mut self, id: TradeId, date: DateTime<Utc>, status: OrderStatus) {
        let trade = &mut self.trades[id.0];
        for order in trade.orders.iter_mut().filter(|order| order.is_open()) {
            order.status = status;
            order.fill_date = Some(date);
        }
        trade.is_open = false;
        let pair = trade.pair.clone();
        self.detach(&pair, id);
        self.canceled_trade_entries += 1;
    }

    fn reject(&mut self, pair: &str, date: DateTime<Utc>, is_short: bool, tag: Option<&str>, reason: String) {
        debug!("Rejected {} entry signal on {} at {}: {}", if is_short { "short" } else { "long" }, pair, date, reason);
        self.rejected.push(RejectedSignal {
            pair: pair.to_string(),
            date,
            is_short,
            enter_tag: tag.map(str::to_string),
            reason,
        });
    }
}

/// Event-driven replay of analyzed candles through a strategy's exit rules.
/// A single run is synchronous and deterministic.
pub struct Backtesting {
    config: BacktestConfig,
    exchange: Exchange,
    timeframe_minutes: i64,
    fee: f64,
    starting_balance: f64,
    timerange: TimeRange,
}

impl Backtesting {
    pub fn new(config: &BacktestConfig) -> Result<Self> {
        config.validate()?;
        let timerange = match config.timerange.as_deref() {
            Some(raw) => TimeRange::parse(raw)?,
            None => TimeRange::default(),
        };
        Ok(Self {
            exchange: Exchange::from_config(config),
            timeframe_minutes: timeframe_to_minutes(&config.timeframe)?,
            fee: config.fee_rate(),
            starting_balance: config.starting_balance()?,
            timerange,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    pub fn timeframe_minutes(&self) -> i64 {
        self.timeframe_minutes
    }

    pub fn starting_balance(&self) -> f64 {
        self.starting_balance
    }

    pub fn timerange(&self) -> TimeRange {
        self.timerange
    }

    /// Loads the configured pairs and cuts them to the timerange, keeping the
    /// strategy's startup candles in front of it.
    pub fn load_market_data(
        &self,
        strategy: &dyn Strategy,
        status: &OptimizerStatus,
    ) -> Result<MarketData> {
        if self.config.pairs.is_empty() {
            return Err(anyhow!("No pairs configured. Add a `pairs` list to the configuration."));
        }
        let data = MarketData::load_json_dir(
            self.config.datadir(),
            &self.config.pairs,
            &self.config.timeframe,
            status,
        )?;
        let data = data.restrict_to_timerange(&self.timerange, self.startup_candles(strategy));
        if !data.has_data() {
            return Err(anyhow!("No data left after adjusting for startup candles."));
        }
        if let Some((min, max)) = data.date_bounds() {
            info!(
                "Loaded data for {} pair(s) from {} up to {} ({} days).",
                data.pairs().len(),
                min,
                max,
                (max - min).num_days()
            );
        }
        Ok(data)
    }

    fn startup_candles(&self, strategy: &dyn Strategy) -> usize {
        strategy.startup_candle_count()
    }

    fn metadata(&self, pair: &str, state: HyperoptState) -> Metadata {
        Metadata {
            pair: pair.to_string(),
            timeframe: self.config.timeframe.clone(),
            state,
        }
    }

    /// Indicator pass over every pair. Frames keep their startup rows.
    pub fn populate_indicators(
        &self,
        strategy: &dyn Strategy,
        data: &MarketData,
        state: HyperoptState,
    ) -> Result<AnalyzedPairs> {
        let pairs: Vec<(&String, &Arc<Vec<Candle>>)> = data.iter().collect();
        pairs
            .par_iter()
            .map(|(pair, candles)| {
                let metadata = self.metadata(pair, state);
                let mut frame = SignalFrame::new(Arc::clone(candles));
                if self.config.use_public_trades {
                    let trades = load_trades_json(&self.config.datadir(), pair)?;
                    let summaries = populate_with_trades(
                        &mut frame,
                        &trades,
                        &self.config.timeframe,
                        &self.config.orderflow,
                    )?;
                    let stacked = summaries
                        .iter()
                        .flatten()
                        .filter(|s| !s.stacked_imbalances_bid.is_empty() || !s.stacked_imbalances_ask.is_empty())
                        .count();
                    debug!("{}: {} candles with stacked imbalances", pair, stacked);
                }
                let analyzed = advise_indicators(
                    strategy,
                    frame,
                    &metadata,
                    self.config.strategy_validation_warn_only,
                );
                let frame = self.guard_pair(pair, candles, analyzed)?;
                Ok(((*pair).clone(), frame))
            })
            .collect::<Result<AnalyzedPairs>>()
    }

    /// Entry/exit pass over indicator frames, trimmed to the trading window.
    pub fn populate_signals(
        &self,
        strategy: &dyn Strategy,
        frames: &AnalyzedPairs,
        state: HyperoptState,
    ) -> Result<AnalyzedPairs> {
        let startup = self.startup_candles(strategy);
        let mut analyzed = AnalyzedPairs::new();
        for (pair, frame) in frames {
            let metadata = self.metadata(pair, state);
            let result = advise_signals(
                strategy,
                frame.clone(),
                &metadata,
                self.config.strategy_validation_warn_only,
            );
            let mut frame = self.guard_pair(pair, &frame.candles, result)?;
            let rows = self.startup_rows(&frame, startup);
            frame.trim_startup(rows);
            if frame.is_empty() {
                warn!("{} has no data left after removing startup candles", pair);
                continue;
            }
            analyzed.insert(pair.clone(), frame);
        }
        Ok(analyzed)
    }

    pub fn analyze(
        &self,
        strategy: &dyn Strategy,
        data: &MarketData,
        state: HyperoptState,
    ) -> Result<AnalyzedPairs> {
        let frames = self.populate_indicators(strategy, data, state)?;
        self.populate_signals(strategy, &frames, state)
    }

    fn startup_rows(&self, frame: &SignalFrame, startup: usize) -> usize {
        match self.timerange.start {
            Some(start) => frame.candles.iter().take_while(|c| c.date < start).count(),
            None => startup,
        }
    }

    // Validation failures always abort; anything else leaves the pair
    // without signals unless fail-hard is configured.
    fn guard_pair(
        &self,
        pair: &str,
        candles: &Arc<Vec<Candle>>,
        result: Result<SignalFrame>,
    ) -> Result<SignalFrame> {
        match result {
            Ok(frame) => Ok(frame),
            Err(err) if is_validation_failure(&err) => Err(err),
            Err(err) => {
                let message = format!("Unable to analyze candles for pair {}. ", pair);
                let fallback = if self.config.strategy_fail_hard {
                    None
                } else {
                    Some(SignalFrame::new(Arc::clone(candles)))
                };
                strategy_safe_wrapper(&message, fallback, false, || Err(err))
            }
        }
    }

    /// Replays `analyzed` and returns the closed-trade ledger.
    pub fn backtest(
        &self,
        strategy: &dyn Strategy,
        risk: &RiskSettings,
        analyzed: &AnalyzedPairs,
    ) -> Result<BacktestResult> {
        let started = Utc::now();
        let pairs: Vec<&String> = analyzed.keys().collect();
        let dates: Vec<Vec<DateTime<Utc>>> = analyzed.values().map(|f| f.dates()).collect();
        let stream_input: Vec<(&str, &[DateTime<Utc>])> = pairs
            .iter()
            .zip(dates.iter())
            .map(|(pair, dates)| (pair.as_str(), dates.as_slice()))
            .collect();
        let events = merged_event_stream(&stream_input);
        let can_short = self.config.can_short && strategy.can_short();

        let mut state = BacktestLoop::default();
        for event in events {
            let pair = pairs[event.pair_index].as_str();
            let frame = &analyzed[pair];
            self.process_candle(strategy, risk, &mut state, pair, frame, event.row, can_short)?;
        }
        self.force_exit_open_trades(&mut state, analyzed);

        let trades: Vec<Trade> = state
            .closed
            .iter()
            .map(|id| state.trades[id.0].clone())
            .collect();
        let final_balance = self.starting_balance + state.realized_profit;
        if !state.rejected.is_empty() {
            info!("{} entry signal(s) rejected", state.rejected.len());
        }
        Ok(BacktestResult {
            run_id: Uuid::new_v4().to_string(),
            strategy: strategy.name().to_string(),
            trades,
            rejected_signals: state.rejected.len(),
            rejected_signal_log: state.rejected,
            timedout_entry_orders: state.timedout_entry_orders,
            timedout_exit_orders: 0,
            canceled_trade_entries: state.canceled_trade_entries,
            canceled_entry_orders: state.canceled_entry_orders,
            replaced_entry_orders: state.replaced_entry_orders,
            starting_balance: self.starting_balance,
            final_balance,
            backtest_start_time: started.timestamp(),
            backtest_end_time: Utc::now().timestamp(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn process_candle(
        &self,
        strategy: &dyn Strategy,
        risk: &RiskSettings,
        state: &mut BacktestLoop,
        pair: &str,
        frame: &SignalFrame,
        row: usize,
        can_short: bool,
    ) -> Result<()> {
        let candle = frame.candles[row];
        let signals = if row > 0 {
            SignalRow::at(frame, row - 1)
        } else {
            SignalRow::default()
        };
        let mark_price = if row > 0 {
            frame.candles[row - 1].close
        } else {
            candle.open
        };

        let mut exited = false;
        for id in state.pair_ids(pair) {
            if state.trades[id.0].has_open_orders() {
                self.check_pending_entry(state, id, &candle, &signals);
                continue;
            }
            self.accrue_funding(state, id, mark_price, candle.date);
            if let Some(decision) =
                self.check_exit(strategy, risk, &mut state.trades[id.0], &candle, &signals)?
            {
                state.close_trade(id, decision, candle.date);
                exited = true;
            }
        }

        if exited {
            return Ok(());
        }
        let Some(is_short) = signals.entry_direction(can_short) else {
            return Ok(());
        };
        let tag = signals.enter_tag;
        match self.enter_trade(strategy, risk, state, pair, &candle, is_short, tag)? {
            EntrySignalOutcome::Executed(id) => {
                if let Some(decision) =
                    self.check_exit(strategy, risk, &mut state.trades[id.0], &candle, &signals)?
                {
                    state.close_trade(id, decision, candle.date);
                }
            }
            EntrySignalOutcome::Pending(id) => {
                debug!("Entry order for {} trade {} left open", pair, id);
            }
            EntrySignalOutcome::Skipped { reason, details } => {
                if reason != "trade_already_open" {
                    let reason = match details {
                        Some(details) => format!("{} ({})", reason, details),
                        None => reason.to_string(),
                    };
                    state.reject(pair, candle.date, is_short, tag, reason);
                }
            }
        }
        Ok(())
    }

    fn accrue_funding(
        &self,
        state: &mut BacktestLoop,
        id: TradeId,
        mark_price: f64,
        now: DateTime<Utc>,
    ) {
        if self.config.trading_mode != TradingMode::Futures {
            return;
        }
        let trade = &mut state.trades[id.0];
        let from = state.last_funding.get(&id).copied().unwrap_or(trade.open_date);
        let fee = self.exchange.funding_fee(trade, mark_price, from, now);
        trade.funding_fees += fee;
        state.last_funding.insert(id, now);
    }

    /// Fills, times out or cancels an open entry order.
    fn check_pending_entry(
        &self,
        state: &mut BacktestLoop,
        id: TradeId,
        candle: &Candle,
        signals: &SignalRow,
    ) {
        let trade = &mut state.trades[id.0];
        let Some(order) = trade.orders.iter_mut().find(|order| order.is_open()) else {
            return;
        };
        if order.price >= candle.low - PRICE_EPSILON && order.price <= candle.high + PRICE_EPSILON {
            let fee = order.amount * order.price * trade.fee_open;
            order.fill(order.price, fee, candle.date);
            debug!("Entry order for {} trade {} filled at {:.8}", trade.pair, id, order.price);
            return;
        }
        if signals.exits(trade.is_short) {
            state.canceled_entry_orders += 1;
            state.cancel_entry(id, candle.date, OrderStatus::Canceled);
            return;
        }
        if let Some(timeout) = self.config.unfilledtimeout_entry_minutes {
            if candle.date - order.order_date >= Duration::minutes(timeout) {
                state.timedout_entry_orders += 1;
                state.cancel_entry(id, candle.date, OrderStatus::Expired);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn enter_trade(
        &self,
        strategy: &dyn Strategy,
        risk: &RiskSettings,
        state: &mut BacktestLoop,
        pair: &str,
        candle: &Candle,
        is_short: bool,
        tag: Option<&str>,
    ) -> Result<EntrySignalOutcome> {
        let open_ids = state.pair_ids(pair);
        if open_ids.iter().any(|id| state.trades[id.0].is_short != is_short) {
            return Ok(EntrySignalOutcome::Skipped {
                reason: "opposite_trade_open",
                details: None,
            });
        }
        if !open_ids.is_empty() && !self.config.position_stacking {
            if let Some(&id) = open_ids.last() {
                let custom = self.guard_callback(
                    &format!("custom_entry_price failed for {} at {}. ", pair, candle.date),
                    None,
                    strategy.custom_entry_price(pair, candle.date, candle.open, is_short),
                )?;
                if let Some(price) = custom {
                    let trade = &mut state.trades[id.0];
                    if let Some(order) = trade.orders.iter_mut().find(|order| order.is_open()) {
                        if (order.price - price).abs() > PRICE_EPSILON {
                            order.price = price;
                            order.order_date = candle.date;
                            state.replaced_entry_orders += 1;
                        }
                    }
                }
            }
            return Ok(EntrySignalOutcome::Skipped {
                reason: "trade_already_open",
                details: None,
            });
        }

        let free_balance = state.free_balance(self.starting_balance);
        let stake = match determine_stake_amount(StakeSizingParams {
            stake_amount: self.config.stake_amount,
            free_balance,
            tied_up: state.tied_up(),
            tradable_balance_ratio: self.config.tradable_balance_ratio,
            open_trade_count: state.open_trade_count(),
            max_open_trades: self.config.max_open_trades_limit(),
        }) {
            StakeSizingOutcome::Sized(stake) => stake,
            StakeSizingOutcome::NoSlot => {
                return Ok(EntrySignalOutcome::Skipped {
                    reason: "max_open_trades",
                    details: None,
                })
            }
            StakeSizingOutcome::InsufficientBalance {
                required,
                available,
            } => {
                return Ok(EntrySignalOutcome::Skipped {
                    reason: "insufficient_balance",
                    details: Some(format!("need {:.8}, have {:.8}", required, available)),
                })
            }
        };

        let leverage = match self.config.trading_mode {
            TradingMode::Spot => 1.0,
            TradingMode::Futures => {
                let max = self.exchange.max_leverage;
                let requested = self.guard_callback(
                    &format!("leverage failed for {} at {}. ", pair, candle.date),
                    self.config.leverage,
                    strategy.leverage(pair, candle.date, self.config.leverage, max, is_short),
                )?;
                if requested.is_finite() {
                    requested.clamp(1.0, max)
                } else {
                    1.0
                }
            }
        };

        let (price, filled) = self.entry_price(strategy, pair, candle, is_short)?;
        if !(price.is_finite() && price > 0.0) {
            return Ok(EntrySignalOutcome::Skipped {
                reason: "invalid_entry_price",
                details: Some(format!("{}", price)),
            });
        }
        let amount = stake * leverage / price;

        let liquidation_price = {
            let others: Vec<&Trade> = state
                .open_ids()
                .map(|id| &state.trades[id.0])
                .filter(|trade| !trade.has_open_orders())
                .collect();
            self.exchange.liquidation_price(LiquidationParams {
                open_rate: price,
                is_short,
                amount,
                stake_amount: stake,
                leverage,
                wallet_balance: free_balance,
                open_trades: &others,
            })?
        };

        let id = TradeId(state.trades.len());
        let fee = amount * price * self.fee;
        let mut trade = Trade {
            id,
            pair: pair.to_string(),
            is_short,
            is_open: true,
            open_date: candle.date,
            close_date: None,
            open_rate: price,
            close_rate: None,
            amount,
            stake_amount: stake,
            leverage,
            trading_mode: self.config.trading_mode,
            margin_mode: self.config.margin_mode,
            fee_open: self.fee,
            fee_close: self.fee,
            funding_fees: 0.0,
            close_profit: None,
            close_profit_abs: None,
            stop_loss: 0.0,
            stop_loss_pct: 0.0,
            initial_stop_loss: 0.0,
            initial_stop_loss_pct: None,
            is_stop_loss_trailing: false,
            max_rate: price,
            min_rate: price,
            liquidation_price: None,
            exit_type: None,
            exit_reason: None,
            enter_tag: tag.map(str::to_string),
            orders: vec![Order {
                side: OrderSide::Entry,
                order_type: if filled { OrderType::Market } else { OrderType::Limit },
                amount,
                price,
                fee: if filled { fee } else { 0.0 },
                status: if filled { OrderStatus::Closed } else { OrderStatus::Open },
                order_date: candle.date,
                fill_date: filled.then_some(candle.date),
            }],
        };
        trade.adjust_stop_loss(price, risk.stoploss, true);
        trade.set_liquidation_price(liquidation_price);

        debug!(
            "Opened {} trade {} on {} at {:.8}, stake {:.8}, leverage {}",
            trade.direction(),
            id,
            pair,
            price,
            stake,
            leverage
        );
        state.trades.push(trade);
        state.open_by_pair.entry(pair.to_string()).or_default().push(id);
        Ok(if filled {
            EntrySignalOutcome::Executed(id)
        } else {
            EntrySignalOutcome::Pending(id)
        })
    }

    /// Entry rate and whether it fills on this candle. A custom price beyond
    /// the open fills at the open; one outside the candle range stays open.
    fn entry_price(
        &self,
        strategy: &dyn Strategy,
        pair: &str,
        candle: &Candle,
        is_short: bool,
    ) -> Result<(f64, bool)> {
        let custom = self.guard_callback(
            &format!("custom_entry_price failed for {} at {}. ", pair, candle.date),
            None,
            strategy.custom_entry_price(pair, candle.date, candle.open, is_short),
        )?;
        let Some(custom) = custom else {
            return Ok((candle.open, true));
        };
        Ok(if is_short {
            if custom <= candle.open {
                (candle.open, true)
            } else {
                (custom, custom <= candle.high)
            }
        } else if custom >= candle.open {
            (candle.open, true)
        } else {
            (custom, custom >= candle.low)
        })
    }

    // A failing per-candle callback counts as "no action" unless fail-hard
    // is configured.
    fn guard_callback<T: Default>(&self, message: &str, fallback: T, result: Result<T>) -> Result<T> {
        let fallback = if self.config.strategy_fail_hard {
            None
        } else {
            Some(fallback)
        };
        strategy_safe_wrapper(message, fallback, false, || result)
    }

    /// Exit decision for one filled trade on `candle`, evaluated in priority
    /// order: liquidation, stoploss on exchange, custom exit, ROI, trailing
    /// stop, stoploss, exit signal.
    fn check_exit(
        &self,
        strategy: &dyn Strategy,
        risk: &RiskSettings,
        trade: &mut Trade,
        candle: &Candle,
        signals: &SignalRow,
    ) -> Result<Option<ExitDecision>> {
        trade.update_rate_extremes(candle.high, candle.low);
        let bound = if trade.is_short { candle.low } else { candle.high };
        let bound_profit = trade.calc_profit_ratio(bound);
        let open_profit = trade.calc_profit_ratio(candle.open);
        let resting_stop = trade.stop_loss;

        if let Some(liquidation) = trade.liquidation_price {
            if let Some(rate) = stop_loss_exit_price(candle, liquidation, trade.is_short) {
                return Ok(Some(ExitDecision {
                    rate,
                    exit_type: ExitType::Liquidation,
                    reason: None,
                }));
            }
        }

        if risk.stoploss_on_exchange {
            if let Some(rate) = stop_loss_exit_price(candle, resting_stop, trade.is_short) {
                return Ok(Some(ExitDecision {
                    rate,
                    exit_type: ExitType::StoplossOnExchange,
                    reason: None,
                }));
            }
        }

        if let Some(ratio) = risk.trailing_stop_ratio(bound_profit) {
            trade.adjust_stop_loss(bound, ratio, false);
        }

        let custom_exit = self.guard_callback(
            &format!("custom_exit failed for {} at {}. ", trade.pair, candle.date),
            None,
            strategy.custom_exit(&trade.pair, trade, candle.date, candle.open, open_profit),
        )?;
        if let Some(reason) = custom_exit {
            let reason = reason.trim();
            if !reason.is_empty() {
                let mut reason = reason.to_string();
                if reason.chars().count() > CUSTOM_EXIT_MAX_LENGTH {
                    warn!(
                        "Custom exit reason returned from custom_exit is too long and was trimmed to {} characters.",
                        CUSTOM_EXIT_MAX_LENGTH
                    );
                    reason = reason.chars().take(CUSTOM_EXIT_MAX_LENGTH).collect();
                }
                return Ok(Some(ExitDecision {
                    rate: candle.open,
                    exit_type: ExitType::CustomExit,
                    reason: Some(reason),
                }));
            }
        }

        let duration = trade.duration_minutes(candle.date);
        let roi_blocked = risk.ignore_roi_if_entry_signal && signals.enters(trade.is_short);
        if !roi_blocked {
            if let Some((roi_minutes, roi)) = risk.minimal_roi.min_roi_entry(duration) {
                if bound_profit > roi {
                    return Ok(Some(ExitDecision {
                        rate: roi_exit_price(RoiExitParams {
                            trade,
                            roi,
                            roi_entry_minutes: roi_minutes,
                            candle,
                            trade_duration_minutes: duration,
                            timeframe_minutes: self.timeframe_minutes,
                        }),
                        exit_type: ExitType::Roi,
                        reason: None,
                    }));
                }
            }
        }

        if let Some(rate) =
            trailed_stop_exit_price(candle, resting_stop, trade.stop_loss, trade.is_short)
        {
            let exit_type = if trade.is_stop_loss_trailing {
                ExitType::TrailingStopLoss
            } else {
                ExitType::StopLoss
            };
            return Ok(Some(ExitDecision {
                rate,
                exit_type,
                reason: None,
            }));
        }

        if risk.use_exit_signal
            && signals.exits(trade.is_short)
            && exit_signal_allowed(risk, open_profit)
        {
            return Ok(Some(ExitDecision {
                rate: candle.open,
                exit_type: ExitType::ExitSignal,
                reason: signals.exit_tag.map(str::to_string),
            }));
        }
        Ok(None)
    }

    fn force_exit_open_trades(&self, state: &mut BacktestLoop, analyzed: &AnalyzedPairs) {
        let pairs: Vec<String> = state.open_by_pair.keys().cloned().collect();
        for pair in pairs {
            let Some(last) = analyzed.get(&pair).and_then(|frame| frame.candles.last().copied()) else {
                continue;
            };
            for id in state.pair_ids(&pair) {
                if state.trades[id.0].has_open_orders() {
                    state.cancel_entry(id, last.date, OrderStatus::Canceled);
                    continue;
                }
                self.accrue_funding(state, id, last.close, last.date);
                state.close_trade(
                    id,
                    ExitDecision {
                        rate: last.close,
                        exit_type: ExitType::ForceExit,
                        reason: None,
                    },
                    last.date,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DryRunWallet, StakeAmount};
    use crate::parameters::ParameterRegistry;
    use crate::trading_rules::RoiTable;
    use chrono::TimeZone;
    use std::sync::Mutex;

    struct ScriptedStrategy {
        parameters: ParameterRegistry,
        can_short: bool,
        entry_price: Option<f64>,
        custom_exit_after: Option<i64>,
        custom_exit_fails_at: Option<DateTime<Utc>>,
        enter_on_column: Option<&'static str>,
        calls: Mutex<usize>,
    }

    impl ScriptedStrategy {
        fn new() -> Self {
            Self {
                parameters: ParameterRegistry::new(),
                can_short: false,
                entry_price: None,
                custom_exit_after: None,
                custom_exit_fails_at: None,
                enter_on_column: None,
                calls: Mutex::new(0),
            }
        }
    }

    impl Strategy for ScriptedStrategy {
        fn name(&self) -> &str {
            "scripted"
        }
        fn timeframe(&self) -> &str {
            "5m"
        }
        fn startup_candle_count(&self) -> usize {
            0
        }
        fn can_short(&self) -> bool {
            self.can_short
        }
        fn parameters(&self) -> &ParameterRegistry {
            &self.parameters
        }
        fn parameters_mut(&mut self) -> &mut ParameterRegistry {
            &mut self.parameters
        }
        fn advise_indicators(&self, frame: SignalFrame, _m: &Metadata) -> Result<SignalFrame> {
            Ok(frame)
        }
        fn advise_entry(&self, mut frame: SignalFrame, _m: &Metadata) -> Result<SignalFrame> {
            if let Some(name) = self.enter_on_column {
                let values = frame.column(name).unwrap_or_default().to_vec();
                for (i, value) in values.iter().enumerate() {
                    frame.enter_long[i] = value.is_finite();
                }
            }
            Ok(frame)
        }
        fn advise_exit(&self, frame: SignalFrame, _m: &Metadata) -> Result<SignalFrame> {
            Ok(frame)
        }
        fn custom_entry_price(
            &self,
            _pair: &str,
            _date: DateTime<Utc>,
            _proposed: f64,
            _is_short: bool,
        ) -> Result<Option<f64>> {
            Ok(self.entry_price)
        }
        fn custom_exit(
            &self,
            _pair: &str,
            trade: &Trade,
            date: DateTime<Utc>,
            _rate: f64,
            _profit: f64,
        ) -> Result<Option<String>> {
            if let Ok(mut calls) = self.calls.lock() {
                *calls += 1;
            }
            if self.custom_exit_fails_at == Some(date) {
                return Err(anyhow!("exit model unavailable"));
            }
            let Some(after) = self.custom_exit_after else {
                return Ok(None);
            };
            Ok((trade.duration_minutes(date) >= after).then(|| "time_is_up".to_string()))
        }
    }

    fn base_date() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn candles(rows: &[(f64, f64, f64, f64)]) -> Vec<Candle> {
        rows.iter()
            .enumerate()
            .map(|(i, &(open, high, low, close))| Candle {
                date: base_date() + Duration::minutes(5 * i as i64),
                open,
                high,
                low,
                close,
                volume: 10.0,
            })
            .collect()
    }

    fn flat(n: usize, price: f64) -> Vec<Candle> {
        candles(&vec![(price, price, price, price); n])
    }

    fn frame(rows: Vec<Candle>, long_entries: &[usize], long_exits: &[usize]) -> SignalFrame {
        let mut frame = SignalFrame::new(Arc::new(rows));
        for &i in long_entries {
            frame.enter_long[i] = true;
        }
        for &i in long_exits {
            frame.exit_long[i] = true;
        }
        frame
    }

    fn config() -> BacktestConfig {
        BacktestConfig {
            stake_amount: StakeAmount::Fixed(100.0),
            dry_run_wallet: DryRunWallet::Scalar(1000.0),
            max_open_trades: 2,
            fee: Some(0.0),
            tradable_balance_ratio: 1.0,
            ..BacktestConfig::default()
        }
    }

    fn risk() -> RiskSettings {
        let mut roi = BTreeMap::new();
        roi.insert(0, 10.0);
        RiskSettings {
            minimal_roi: RoiTable(roi),
            stoploss: -0.10,
            ..RiskSettings::default()
        }
    }

    fn run(config: &BacktestConfig, strategy: &ScriptedStrategy, risk: &RiskSettings, frames: Vec<(&str, SignalFrame)>) -> BacktestResult {
        let engine = Backtesting::new(config).unwrap();
        let analyzed: AnalyzedPairs = frames
            .into_iter()
            .map(|(pair, frame)| (pair.to_string(), frame))
            .collect();
        engine.backtest(strategy, risk, &analyzed).unwrap()
    }

    #[test]
    fn entry_uses_next_candle_open_and_force_exits_at_end() {
        let rows = candles(&[
            (100.0, 100.0, 100.0, 100.0),
            (101.0, 102.0, 100.5, 101.5),
            (102.0, 103.0, 101.5, 103.0),
        ]);
        let result = run(&config(), &ScriptedStrategy::new(), &risk(), vec![("BTC/USDT", frame(rows, &[0], &[]))]);
        assert_eq!(result.trades.len(), 1);
        let trade = &result.trades[0];
        assert_eq!(trade.open_rate, 101.0);
        assert_eq!(trade.open_date, base_date() + Duration::minutes(5));
        assert_eq!(trade.exit_type, Some(ExitType::ForceExit));
        assert_eq!(trade.close_rate, Some(103.0));
        assert!((result.final_balance - (1000.0 + trade.profit_abs())).abs() < 1e-9);
    }

    #[test]
    fn stoploss_fills_at_stop_level() {
        let rows = candles(&[
            (100.0, 100.0, 100.0, 100.0),
            (100.0, 100.0, 100.0, 100.0),
            (99.0, 99.5, 85.0, 88.0),
        ]);
        let result = run(&config(), &ScriptedStrategy::new(), &risk(), vec![("BTC/USDT", frame(rows, &[0], &[]))]);
        let trade = &result.trades[0];
        assert_eq!(trade.exit_type, Some(ExitType::StopLoss));
        assert!((trade.close_rate.unwrap() - 90.0).abs() < 1e-9);
    }

    #[test]
    fn stoploss_beats_exit_signal_on_same_candle() {
        let rows = candles(&[
            (100.0, 100.0, 100.0, 100.0),
            (100.0, 100.0, 100.0, 100.0),
            (95.0, 96.0, 80.0, 82.0),
        ]);
        let result = run(&config(), &ScriptedStrategy::new(), &risk(), vec![("BTC/USDT", frame(rows, &[0], &[1]))]);
        assert_eq!(result.trades[0].exit_type, Some(ExitType::StopLoss));
    }

    #[test]
    fn exit_signal_fills_at_open() {
        let rows = candles(&[
            (100.0, 100.0, 100.0, 100.0),
            (100.0, 101.0, 99.0, 100.0),
            (100.0, 101.0, 99.0, 100.5),
            (102.0, 103.0, 101.0, 102.0),
        ]);
        let result = run(&config(), &ScriptedStrategy::new(), &risk(), vec![("BTC/USDT", frame(rows, &[0], &[2]))]);
        let trade = &result.trades[0];
        assert_eq!(trade.exit_type, Some(ExitType::ExitSignal));
        assert_eq!(trade.exit_reason.as_deref(), Some("exit_signal"));
        assert_eq!(trade.close_rate, Some(102.0));
    }

    #[test]
    fn roi_exit_realises_table_ratio() {
        let rows = candles(&[
            (100.0, 100.0, 100.0, 100.0),
            (100.0, 100.5, 99.5, 100.0),
            (100.0, 110.0, 99.0, 109.0),
        ]);
        let mut risk = risk();
        risk.minimal_roi = RoiTable([(0, 0.05)].into_iter().collect());
        let result = run(&config(), &ScriptedStrategy::new(), &risk, vec![("BTC/USDT", frame(rows, &[0], &[]))]);
        let trade = &result.trades[0];
        assert_eq!(trade.exit_type, Some(ExitType::Roi));
        assert!((trade.close_rate.unwrap() - 105.0).abs() < 1e-9);
    }

    #[test]
    fn custom_exit_wins_over_roi() {
        let rows = candles(&[
            (100.0, 100.0, 100.0, 100.0),
            (100.0, 100.0, 100.0, 100.0),
            (101.0, 120.0, 100.0, 110.0),
        ]);
        let mut strategy = ScriptedStrategy::new();
        strategy.custom_exit_after = Some(5);
        let mut risk = risk();
        risk.minimal_roi = RoiTable([(0, 0.01)].into_iter().collect());
        let result = run(&config(), &strategy, &risk, vec![("BTC/USDT", frame(rows, &[0], &[]))]);
        let trade = &result.trades[0];
        assert_eq!(trade.exit_type, Some(ExitType::CustomExit));
        assert_eq!(trade.exit_reason.as_deref(), Some("time_is_up"));
        assert_eq!(trade.close_rate, Some(101.0));
    }

    #[test]
    fn trailing_stop_labels_exit() {
        let rows = candles(&[
            (100.0, 100.0, 100.0, 100.0),
            (100.0, 100.0, 100.0, 100.0),
            (100.0, 120.0, 100.0, 119.0),
            (118.0, 118.0, 100.0, 101.0),
        ]);
        let mut risk = risk();
        risk.trailing_stop = true;
        risk.trailing_stop_positive = Some(0.05);
        let result = run(&config(), &ScriptedStrategy::new(), &risk, vec![("BTC/USDT", frame(rows, &[0], &[]))]);
        let trade = &result.trades[0];
        assert_eq!(trade.exit_type, Some(ExitType::TrailingStopLoss));
        assert!((trade.close_rate.unwrap() - 114.0).abs() < 1e-9);
    }

    #[test]
    fn rejects_entries_without_free_slot() {
        let mut config = config();
        config.max_open_trades = 1;
        let result = run(
            &config,
            &ScriptedStrategy::new(),
            &risk(),
            vec![
                ("AAA/USDT", frame(flat(4, 10.0), &[0], &[])),
                ("BBB/USDT", frame(flat(4, 20.0), &[0], &[])),
            ],
        );
        assert_eq!(result.trades.len(), 1);
        assert_eq!(result.trades[0].pair, "AAA/USDT");
        assert_eq!(result.rejected_signals, 1);
        assert_eq!(result.rejected_signal_log[0].pair, "BBB/USDT");
        assert_eq!(result.rejected_signal_log[0].reason, "max_open_trades");
    }

    #[test]
    fn unlimited_stake_splits_over_free_slots() {
        let mut config = config();
        config.stake_amount = StakeAmount::Unlimited;
        config.max_open_trades = 4;
        let result = run(
            &config,
            &ScriptedStrategy::new(),
            &risk(),
            vec![
                ("AAA/USDT", frame(flat(3, 10.0), &[0], &[])),
                ("BBB/USDT", frame(flat(3, 10.0), &[0], &[])),
            ],
        );
        assert!((result.trades[0].stake_amount - 250.0).abs() < 1e-9);
        assert!((result.trades[1].stake_amount - 250.0).abs() < 1e-9);
    }

    #[test]
    fn unfilled_custom_entry_times_out() {
        let mut config = config();
        config.unfilledtimeout_entry_minutes = Some(10);
        let mut strategy = ScriptedStrategy::new();
        strategy.entry_price = Some(50.0);
        let result = run(&config, &strategy, &risk(), vec![("BTC/USDT", frame(flat(6, 100.0), &[0], &[]))]);
        assert!(result.trades.is_empty());
        assert_eq!(result.timedout_entry_orders, 1);
        assert_eq!(result.canceled_trade_entries, 1);
    }

    #[test]
    fn custom_entry_inside_range_fills_at_limit() {
        let rows = candles(&[
            (100.0, 100.0, 100.0, 100.0),
            (100.0, 101.0, 97.0, 99.0),
            (99.0, 100.0, 98.0, 99.0),
        ]);
        let mut strategy = ScriptedStrategy::new();
        strategy.entry_price = Some(98.0);
        let result = run(&config(), &strategy, &risk(), vec![("BTC/USDT", frame(rows, &[0], &[]))]);
        assert_eq!(result.trades[0].open_rate, 98.0);
    }

    #[test]
    fn short_trades_need_futures_and_strategy_support() {
        let mut config = config();
        config.trading_mode = TradingMode::Futures;
        config.can_short = true;
        let rows = candles(&[
            (100.0, 100.0, 100.0, 100.0),
            (100.0, 100.0, 100.0, 100.0),
            (95.0, 95.0, 90.0, 90.0),
        ]);
        let mut short_frame = SignalFrame::new(Arc::new(rows));
        short_frame.enter_short[0] = true;

        let blocked = run(&config, &ScriptedStrategy::new(), &risk(), vec![("BTC/USDT", short_frame.clone())]);
        assert!(blocked.trades.is_empty());

        let mut strategy = ScriptedStrategy::new();
        strategy.can_short = true;
        let result = run(&config, &strategy, &risk(), vec![("BTC/USDT", short_frame)]);
        let trade = &result.trades[0];
        assert!(trade.is_short);
        assert!(trade.profit_abs() > 0.0);
        assert!(trade.liquidation_price.is_some());
    }

    #[test]
    fn leveraged_long_is_liquidated_before_stoploss() {
        let mut config = config();
        config.trading_mode = TradingMode::Futures;
        config.leverage = 10.0;
        let rows = candles(&[
            (100.0, 100.0, 100.0, 100.0),
            (100.0, 100.0, 100.0, 100.0),
            (100.0, 100.0, 80.0, 81.0),
        ]);
        let mut risk = risk();
        risk.stoploss = -0.99;
        let result = run(&config, &ScriptedStrategy::new(), &risk, vec![("BTC/USDT", frame(rows, &[0], &[]))]);
        let trade = &result.trades[0];
        assert_eq!(trade.exit_type, Some(ExitType::Liquidation));
        assert!(trade.close_rate.unwrap() > 80.0);
    }

    #[test]
    fn futures_longs_pay_funding() {
        let mut config = config();
        config.trading_mode = TradingMode::Futures;
        config.funding_rate = 0.001;
        let rows: Vec<Candle> = (0..200)
            .map(|i| Candle {
                date: base_date() + Duration::minutes(5 * i),
                open: 100.0,
                high: 100.0,
                low: 100.0,
                close: 100.0,
                volume: 1.0,
            })
            .collect();
        let result = run(&config, &ScriptedStrategy::new(), &risk(), vec![("BTC/USDT", frame(rows, &[0], &[]))]);
        let trade = &result.trades[0];
        // 1 unit held across the 08:00 and 16:00 settlements.
        assert!((trade.funding_fees + 0.2).abs() < 1e-9);
        assert!(trade.profit_abs() < 0.0);
    }

    #[test]
    fn future_rows_do_not_change_past_decisions() {
        let rows = candles(&[
            (100.0, 100.0, 100.0, 100.0),
            (100.0, 101.0, 99.0, 100.0),
            (100.0, 100.0, 85.0, 86.0),
            (86.0, 87.0, 85.0, 86.0),
            (86.0, 87.0, 85.0, 86.0),
        ]);
        let mut perturbed = rows.clone();
        for candle in perturbed.iter_mut().skip(3) {
            candle.open *= 3.0;
            candle.high *= 3.0;
            candle.low *= 3.0;
            candle.close *= 3.0;
        }
        let original = run(&config(), &ScriptedStrategy::new(), &risk(), vec![("BTC/USDT", frame(rows, &[0], &[]))]);
        let changed = run(&config(), &ScriptedStrategy::new(), &risk(), vec![("BTC/USDT", frame(perturbed, &[0], &[]))]);
        assert_eq!(original.trades, changed.trades);
    }

    #[test]
    fn conflicting_signals_do_not_enter() {
        let mut rows = frame(flat(3, 10.0), &[0], &[0]);
        rows.enter_short[1] = true;
        rows.enter_long[1] = true;
        let result = run(&config(), &ScriptedStrategy::new(), &risk(), vec![("BTC/USDT", rows)]);
        assert!(result.trades.is_empty());
        assert_eq!(result.rejected_signals, 0);
    }

    #[test]
    fn failing_custom_exit_skips_only_that_candle() {
        let mut strategy = ScriptedStrategy::new();
        strategy.custom_exit_after = Some(5);
        strategy.custom_exit_fails_at = Some(base_date() + Duration::minutes(10));
        let result = run(&config(), &strategy, &risk(), vec![("BTC/USDT", frame(flat(5, 100.0), &[0], &[]))]);
        assert_eq!(result.trades.len(), 1);
        let trade = &result.trades[0];
        assert_eq!(trade.exit_type, Some(ExitType::CustomExit));
        assert_eq!(trade.close_date, Some(base_date() + Duration::minutes(15)));
    }

    #[test]
    fn failing_custom_exit_aborts_when_fail_hard() {
        let mut config = config();
        config.strategy_fail_hard = true;
        let mut strategy = ScriptedStrategy::new();
        strategy.custom_exit_after = Some(5);
        strategy.custom_exit_fails_at = Some(base_date() + Duration::minutes(10));
        let engine = Backtesting::new(&config).unwrap();
        let analyzed: AnalyzedPairs =
            [("BTC/USDT".to_string(), frame(flat(5, 100.0), &[0], &[]))].into_iter().collect();
        let err = engine.backtest(&strategy, &risk(), &analyzed).unwrap_err();
        assert!(matches!(
            crate::error::engine_error(&err),
            Some(crate::error::EngineError::Strategy(_))
        ));
        assert!(format!("{:#}", err).contains("exit model unavailable"));
    }

    #[test]
    fn strategy_sees_stacked_imbalances_from_public_trades() {
        let dir = tempfile::tempdir().unwrap();
        let mut trades = Vec::new();
        for level in 0..3 {
            let price = 100.0 + 0.5 * level as f64;
            for k in 0..4 {
                trades.push(crate::orderflow::TradePrint {
                    timestamp: (base_date() + Duration::seconds(10 + k)).timestamp_millis(),
                    price,
                    amount: 1.0,
                    side: "sell".to_string(),
                });
            }
            trades.push(crate::orderflow::TradePrint {
                timestamp: (base_date() + Duration::seconds(30)).timestamp_millis(),
                price: price + 0.5,
                amount: 1.0,
                side: "buy".to_string(),
            });
        }
        std::fs::write(
            crate::data_context::pair_trades_path(dir.path(), "BTC/USDT"),
            serde_json::to_vec(&trades).unwrap(),
        )
        .unwrap();

        let mut config = config();
        config.use_public_trades = true;
        config.datadir = Some(dir.path().to_path_buf());
        let mut candles = BTreeMap::new();
        candles.insert("BTC/USDT".to_string(), flat(4, 100.0));
        let data = MarketData::from_candles("5m", candles).unwrap();
        let strategy = ScriptedStrategy {
            enter_on_column: Some("stacked_imbalances_bid"),
            ..ScriptedStrategy::new()
        };

        let engine = Backtesting::new(&config).unwrap();
        let indicators = engine
            .populate_indicators(&strategy, &data, HyperoptState::Startup)
            .unwrap();
        let stacked = indicators["BTC/USDT"].column("stacked_imbalances_bid").unwrap();
        assert!((stacked[0] - 100.0).abs() < 1e-12);
        let signals = engine
            .populate_signals(&strategy, &indicators, HyperoptState::Startup)
            .unwrap();
        assert_eq!(signals["BTC/USDT"].enter_long, vec![true, false, false, false]);
    }
}
