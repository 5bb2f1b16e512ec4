//! The trading loop.
//!
//! One cycle, in order:
//! 1. Account state and the broker's open positions. Failure of either marks
//!    the cycle disconnected and ends it.
//! 2. Reconcile: positions the broker no longer reports are closed, entries
//!    whose submit outcome was unknown are adopted or dropped, and symbols
//!    with a broker position nobody manages are kept out of new entries.
//! 3. Lifecycle: track open positions against fresh quotes, push tightened
//!    stops to the broker, close exits and advised exits, learn from every
//!    closed trade.
//! 4. Per-symbol analysis, concurrently: bars, quote, analysis, recall,
//!    oracle, decision.
//! 5. Match bookkeeping for everything recalled, in one memory write.
//! 6. Sizing and execution, one symbol at a time against the live book, most
//!    confident decision first.
//!
//! Stage failures stay with their symbol. Consecutive execution errors on a
//! symbol suspend it; consecutive disconnected cycles end `run` with
//! `LoopError::ConnectivityLost` for the supervisor to handle.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use otrade_core::analysis::{MarketView, MultiTimeframeAnalyzer};
use otrade_core::decision::{DecisionSynthesizer, OracleScore};
use otrade_core::domain::{
    AccountState, Bar, ClosedTrade, Decision, ExitReason, PatternId, Position, PositionState,
    SymbolConstraints, Tick, TicketId, Timeframe,
};
use otrade_core::lifecycle::{CloseFill, LifecycleAction, PositionLifecycleManager};
use otrade_core::memory::SymbolBias;
use otrade_core::risk::RiskManager;

use crate::collaborators::{
    BrokerPosition, ExecutionBridge, ExitRequest, ForcedExitSource, MarketDataSource,
    OracleRequest, ScoringOracle,
};
use crate::config::BotConfig;
use crate::error::{DataError, ExecutionError, LoopError, OracleError};
use crate::journal::{SessionStats, TradeJournal};
use crate::memory_service::MemoryService;
use crate::suspension::SymbolSuspensions;

/// Everything the loop talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub market: Arc<dyn MarketDataSource>,
    pub broker: Arc<dyn ExecutionBridge>,
    pub oracle: Arc<dyn ScoringOracle>,
    pub forced_exits: Arc<dyn ForcedExitSource>,
}

/// What one cycle did.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub cycle: u64,
    /// False when the broker could not be reached; nothing else ran.
    pub connected: bool,
    pub decisions: Vec<Decision>,
    pub opened: Vec<Position>,
    pub closed: Vec<ClosedTrade>,
    pub stop_updates: usize,
    /// Symbols that produced no order, with the reason.
    pub skipped: Vec<(String, String)>,
}

impl CycleReport {
    pub fn skip_reason(&self, symbol: &str) -> Option<&str> {
        self.skipped
            .iter()
            .find(|(s, _)| s == symbol)
            .map(|(_, r)| r.as_str())
    }
}

/// Analysis result for one symbol, waiting for sizing.
struct Evaluation {
    view: MarketView,
    tick: Tick,
    decision: Decision,
    recalled: Vec<PatternId>,
}

pub struct TradingLoopController {
    config: BotConfig,
    collaborators: Collaborators,
    analyzer: MultiTimeframeAnalyzer,
    synthesizer: DecisionSynthesizer,
    risk: RiskManager,
    lifecycle: PositionLifecycleManager,
    memory: Arc<MemoryService>,
    suspensions: Arc<SymbolSuspensions>,
    journal: TradeJournal,
    constraints: HashMap<String, SymbolConstraints>,
    untracked: HashSet<TicketId>,
    cycle: u64,
}

async fn exec_call<T>(
    budget: Duration,
    operation: &str,
    fut: impl Future<Output = Result<T, ExecutionError>>,
) -> Result<T, ExecutionError> {
    tokio::time::timeout(budget, fut)
        .await
        .unwrap_or_else(|_| Err(ExecutionError::timeout(operation, budget)))
}

async fn data_call<T>(
    budget: Duration,
    symbol: &str,
    what: &str,
    fut: impl Future<Output = Result<T, DataError>>,
) -> Result<T, DataError> {
    tokio::time::timeout(budget, fut).await.unwrap_or_else(|_| {
        Err(DataError::Timeout {
            symbol: symbol.to_string(),
            what: what.to_string(),
            timeout_ms: budget.as_millis() as u64,
        })
    })
}

/// Profit of closing `position` at `exit_price`; zero without constraints.
fn estimate_profit(
    constraints: Option<&SymbolConstraints>,
    position: &Position,
    exit_price: f64,
) -> f64 {
    constraints.map_or(0.0, |c| {
        c.profit_for(position.favourable_move(exit_price), position.volume)
    })
}

impl TradingLoopController {
    pub fn new(
        config: BotConfig,
        collaborators: Collaborators,
        memory: Arc<MemoryService>,
        journal: TradeJournal,
    ) -> Result<Self, LoopError> {
        config.validate()?;
        let analyzer = MultiTimeframeAnalyzer::new(
            &config.timeframes,
            config.primary_timeframe,
            config.analyzer.clone(),
        );
        Ok(Self {
            synthesizer: DecisionSynthesizer::new(config.decision.clone()),
            risk: RiskManager::new(config.risk.clone()),
            lifecycle: PositionLifecycleManager::new(config.lifecycle.clone()),
            suspensions: Arc::new(SymbolSuspensions::new(
                config.supervision.suspension_threshold,
            )),
            analyzer,
            config,
            collaborators,
            memory,
            journal,
            constraints: HashMap::new(),
            untracked: HashSet::new(),
            cycle: 0,
        })
    }

    pub fn config(&self) -> &BotConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> &PositionLifecycleManager {
        &self.lifecycle
    }

    pub fn risk(&self) -> &RiskManager {
        &self.risk
    }

    pub fn memory(&self) -> &Arc<MemoryService> {
        &self.memory
    }

    pub fn stats(&self) -> &SessionStats {
        self.journal.stats()
    }

    /// Handle for inspecting and clearing suspensions while `run` is active.
    pub fn suspensions(&self) -> Arc<SymbolSuspensions> {
        Arc::clone(&self.suspensions)
    }

    pub fn clear_suspension(&self, symbol: &str) -> bool {
        self.suspensions.clear_suspension(symbol)
    }

    /// Run cycles until `shutdown` turns true (or its sender is dropped).
    ///
    /// The cycle in flight when shutdown is signalled always completes, and
    /// the memory is persisted before returning. Returns the session
    /// statistics, or `ConnectivityLost` after too many disconnected cycles;
    /// state is kept, so calling `run` again resumes.
    pub async fn run(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<SessionStats, LoopError> {
        let hash = self.config.config_hash()?;
        tracing::info!(
            config_hash = %hash.short(),
            symbols = ?self.config.symbols,
            cadence_secs = self.config.cadence_secs,
            "trading loop started"
        );
        let cadence = Duration::from_secs(self.config.cadence_secs);
        let max_failures = self.config.supervision.max_connectivity_failures;
        let mut failures = 0u32;

        loop {
            if *shutdown.borrow() {
                break;
            }
            let report = self.run_cycle(Utc::now()).await;
            if report.connected {
                failures = 0;
            } else {
                failures += 1;
                tracing::warn!(
                    consecutive = failures,
                    max = max_failures,
                    "cycle without broker connectivity"
                );
                if failures >= max_failures {
                    self.persist_memory().await;
                    return Err(LoopError::ConnectivityLost {
                        consecutive: failures,
                    });
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(cadence) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!("shutdown requested, finishing");
        self.persist_memory().await;
        self.journal.stats().log_summary();
        Ok(self.journal.stats().clone())
    }

    async fn persist_memory(&self) {
        match self.memory.persist(Utc::now()).await {
            Ok(()) => tracing::info!(records = self.memory.len().await, "pattern memory saved"),
            Err(e) => tracing::error!(error = %e, "final pattern memory persist failed"),
        }
    }

    /// Run one cycle at `now`.
    pub async fn run_cycle(&mut self, now: DateTime<Utc>) -> CycleReport {
        self.cycle += 1;
        let mut report = CycleReport {
            cycle: self.cycle,
            ..CycleReport::default()
        };
        let budget = self.config.timeouts.account();
        let broker = Arc::clone(&self.collaborators.broker);

        let account =
            match exec_call(budget, "get_account_state", broker.get_account_state()).await {
                Ok(a) => a,
                Err(e) => {
                    tracing::warn!(cycle = self.cycle, error = %e, "account state unavailable");
                    return report;
                }
            };
        let broker_positions =
            match exec_call(budget, "open_positions", broker.open_positions()).await {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(cycle = self.cycle, error = %e, "broker positions unavailable");
                    return report;
                }
            };
        report.connected = true;
        tracing::debug!(
            cycle = self.cycle,
            equity = account.equity,
            open = self.lifecycle.live_count(),
            "cycle started"
        );

        // Reconcile
        let live: Vec<String> = self.lifecycle.positions().map(|p| p.symbol.clone()).collect();
        let ticks = self.fetch_ticks(&live).await;
        let tickets: HashSet<TicketId> =
            broker_positions.iter().map(|p| p.ticket_id.clone()).collect();
        let constraints = &self.constraints;
        let gone = self.lifecycle.reconcile(&tickets, &ticks, now, |p, exit| {
            estimate_profit(constraints.get(&p.symbol), p, exit)
        });
        for trade in gone {
            self.on_closed(trade, now, &mut report).await;
        }
        self.resolve_pending(&broker_positions, now, &mut report);
        let unmanaged = self.note_untracked(&broker_positions);

        // Lifecycle
        let forced = match tokio::time::timeout(
            self.config.timeouts.execution(),
            self.collaborators.forced_exits.forced_closes(),
        )
        .await
        {
            Ok(f) => f,
            Err(_) => {
                tracing::warn!("forced exit source timed out");
                HashSet::new()
            }
        };
        for action in self.lifecycle.track(&ticks, &forced, now) {
            self.apply(action, &ticks, now, &mut report).await;
        }
        self.review_open_positions(&ticks, now, &mut report).await;

        // Analysis
        let mut candidates = Vec::new();
        for symbol in &self.config.symbols {
            if self.lifecycle.get(symbol).is_some() {
                continue;
            }
            if unmanaged.contains(symbol) {
                report
                    .skipped
                    .push((symbol.clone(), "unmanaged broker position".into()));
                continue;
            }
            if self.suspensions.is_suspended(symbol) {
                tracing::debug!(symbol = %symbol, "suspended, not analyzed");
                continue;
            }
            candidates.push(symbol.clone());
        }
        let results = join_all(candidates.iter().map(|s| self.evaluate_symbol(s))).await;

        let mut recalled = Vec::new();
        let mut ready = Vec::new();
        for (symbol, result) in candidates.into_iter().zip(results) {
            match result {
                Ok(eval) => {
                    recalled.extend(eval.recalled.iter().cloned());
                    report.decisions.push(eval.decision.clone());
                    ready.push(eval);
                }
                Err(reason) => report.skipped.push((symbol, reason)),
            }
        }
        self.memory.mark_matched(&recalled, now).await;

        // Execution
        ready.sort_by(|a, b| {
            b.decision
                .confidence
                .partial_cmp(&a.decision.confidence)
                .unwrap_or(Ordering::Equal)
        });
        for eval in ready {
            if eval.decision.direction.is_flat() {
                let reason = eval
                    .decision
                    .rationale_tags
                    .iter()
                    .find(|t| t.starts_with("flat_"))
                    .cloned()
                    .unwrap_or_else(|| "flat".into());
                report.skipped.push((eval.decision.symbol.clone(), reason));
                continue;
            }
            self.try_enter(eval, &account, now, &mut report).await;
        }

        report
    }

    async fn fetch_ticks(&self, symbols: &[String]) -> BTreeMap<String, Tick> {
        let budget = self.config.timeouts.market_data();
        let market = &self.collaborators.market;
        let quotes = join_all(symbols.iter().map(|s| async move {
            (s, data_call(budget, s, "tick", market.get_tick(s)).await)
        }))
        .await;
        quotes
            .into_iter()
            .filter_map(|(symbol, quote)| match quote {
                Ok(tick) => Some((symbol.clone(), tick)),
                Err(e) => {
                    tracing::warn!(symbol = %symbol, error = %e, "no quote for open position");
                    None
                }
            })
            .collect()
    }

    /// Settle entries whose submit outcome was unknown.
    ///
    /// A broker position on the same symbol and side that nothing manages is
    /// the order that landed, and is adopted. Without one the order never
    /// reached the broker and the entry is dropped.
    fn resolve_pending(
        &mut self,
        broker_positions: &[BrokerPosition],
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) {
        let pending: Vec<Position> = self
            .lifecycle
            .positions()
            .filter(|p| p.state == PositionState::Pending)
            .cloned()
            .collect();
        for position in pending {
            let managed: HashSet<TicketId> = self
                .lifecycle
                .positions()
                .filter_map(|p| p.ticket_id.clone())
                .collect();
            let landed = broker_positions.iter().find(|b| {
                b.symbol == position.symbol
                    && b.direction == position.direction
                    && !managed.contains(&b.ticket_id)
            });
            match landed {
                Some(landed) => {
                    tracing::info!(
                        symbol = %position.symbol,
                        ticket = %landed.ticket_id,
                        "order of unknown outcome found at the broker, adopting"
                    );
                    self.confirm_entry(
                        &position.symbol,
                        landed.ticket_id.clone(),
                        landed.entry_price,
                        now,
                        report,
                    );
                }
                None => {
                    tracing::info!(
                        symbol = %position.symbol,
                        "order of unknown outcome never reached the broker, dropping it"
                    );
                    if let Err(e) = self.lifecycle.abandon_entry(&position.symbol) {
                        tracing::error!(symbol = %position.symbol, error = %e, "could not drop pending entry");
                    }
                }
            }
        }
    }

    /// Broker positions this process does not manage are reported once.
    /// Returns their symbols.
    fn note_untracked(&mut self, broker_positions: &[BrokerPosition]) -> HashSet<String> {
        let managed: HashSet<&TicketId> = self
            .lifecycle
            .positions()
            .filter_map(|p| p.ticket_id.as_ref())
            .collect();
        let mut symbols = HashSet::new();
        for position in broker_positions {
            let ticket = &position.ticket_id;
            if managed.contains(ticket) {
                continue;
            }
            symbols.insert(position.symbol.clone());
            if self.untracked.insert(ticket.clone()) {
                tracing::warn!(
                    ticket = %ticket,
                    symbol = %position.symbol,
                    "broker position not managed by this process, symbol blocked"
                );
            }
        }
        self.untracked
            .retain(|t| broker_positions.iter().any(|p| &p.ticket_id == t));
        symbols
    }

    /// Close open positions the market has turned against.
    async fn review_open_positions(
        &mut self,
        ticks: &BTreeMap<String, Tick>,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) {
        if !self.config.decision.advised_exits {
            return;
        }
        let open: Vec<Position> = self
            .lifecycle
            .positions()
            .filter(|p| p.state == PositionState::Open)
            .cloned()
            .collect();
        if open.is_empty() {
            return;
        }
        let advice = join_all(open.iter().map(|p| self.exit_advice(p))).await;
        for (position, reason) in open.iter().zip(advice) {
            let Some(reason) = reason else {
                continue;
            };
            tracing::info!(symbol = %position.symbol, %reason, "exit advised");
            match self
                .lifecycle
                .request_close(&position.symbol, ExitReason::Advised)
            {
                Ok(action) => self.apply(action, ticks, now, report).await,
                Err(e) => {
                    tracing::warn!(symbol = %position.symbol, error = %e, "advised exit not started")
                }
            }
        }
    }

    /// Rules first, then the oracle. Any failure keeps the position.
    async fn exit_advice(&self, position: &Position) -> Option<String> {
        let view = self.market_view(&position.symbol).await.ok()?;
        if let Some(reason) = self.synthesizer.exit_advice(position.direction, &view) {
            return Some(reason);
        }

        let request = ExitRequest::new(position, &view);
        let budget = self.config.timeouts.oracle();
        match tokio::time::timeout(budget, self.collaborators.oracle.advise_exit(&request)).await {
            Ok(Ok(verdict)) if verdict.close => Some(
                verdict
                    .reason
                    .map_or_else(|| "oracle".to_string(), |r| format!("oracle:{r}")),
            ),
            Ok(Ok(_)) | Ok(Err(OracleError::Disabled)) => None,
            Ok(Err(e)) => {
                tracing::warn!(symbol = %position.symbol, error = %e, "oracle exit advice failed");
                None
            }
            Err(_) => {
                tracing::warn!(
                    symbol = %position.symbol,
                    timeout_ms = budget.as_millis() as u64,
                    "oracle exit advice timed out"
                );
                None
            }
        }
    }

    /// Bars for every analyzed timeframe, analyzed into a view.
    async fn market_view(&self, symbol: &str) -> Result<MarketView, String> {
        let budget = self.config.timeouts.market_data();
        let count = self.analyzer.bars_needed();
        let market = &self.collaborators.market;

        let requests = self.analyzer.timeframes().iter().map(|tf| async move {
            let bars = data_call(budget, symbol, "bars", market.get_bars(symbol, *tf, count)).await?;
            Ok::<(Timeframe, Vec<Bar>), DataError>((*tf, bars))
        });
        let bars: BTreeMap<Timeframe, Vec<Bar>> = join_all(requests)
            .await
            .into_iter()
            .collect::<Result<_, _>>()
            .map_err(|e| {
                tracing::warn!(symbol, error = %e, "market data unavailable");
                e.to_string()
            })?;
        let states = self.analyzer.analyze(symbol, &bars).map_err(|e| {
            tracing::debug!(symbol, error = %e, "analysis skipped");
            e.to_string()
        })?;
        Ok(self.analyzer.market_view(symbol, states))
    }

    async fn evaluate_symbol(&self, symbol: &str) -> Result<Evaluation, String> {
        let view = self.market_view(symbol).await?;
        let budget = self.config.timeouts.market_data();
        let tick = data_call(budget, symbol, "tick", self.collaborators.market.get_tick(symbol))
            .await
            .map_err(|e| {
                tracing::warn!(symbol, error = %e, "quote unavailable");
                e.to_string()
            })?;

        let hits = self
            .memory
            .query(&view.features, self.config.memory.recall_k)
            .await;
        let bias = self.memory.symbol_bias(symbol).await;
        let oracle = self.consult_oracle(&view, hits.len(), bias.clone()).await;
        let decision = self
            .synthesizer
            .decide_with_bias(&view, &hits, oracle, bias.as_ref());
        tracing::debug!(
            symbol,
            regime = %view.regime.regime,
            direction = %decision.direction,
            confidence = decision.confidence,
            tags = ?decision.rationale_tags,
            "decision"
        );

        Ok(Evaluation {
            recalled: hits.into_iter().map(|h| h.record.id).collect(),
            view,
            tick,
            decision,
        })
    }

    async fn consult_oracle(
        &self,
        view: &MarketView,
        memory_hits: usize,
        bias: Option<SymbolBias>,
    ) -> Option<OracleScore> {
        let request = OracleRequest::from_view(view, memory_hits).with_bias(bias);
        let budget = self.config.timeouts.oracle();
        match tokio::time::timeout(budget, self.collaborators.oracle.score(&request)).await {
            Ok(Ok(score)) => Some(score),
            Ok(Err(OracleError::Disabled)) => None,
            Ok(Err(e)) => {
                tracing::warn!(symbol = %view.symbol, error = %e, "oracle failed, deciding without it");
                None
            }
            Err(_) => {
                tracing::warn!(
                    symbol = %view.symbol,
                    timeout_ms = budget.as_millis() as u64,
                    "oracle timed out, deciding without it"
                );
                None
            }
        }
    }

    /// Cached constraints, fetched on first use.
    async fn symbol_constraints(
        &mut self,
        symbol: &str,
        now: DateTime<Utc>,
    ) -> Option<SymbolConstraints> {
        if let Some(c) = self.constraints.get(symbol) {
            return Some(c.clone());
        }
        let budget = self.config.timeouts.execution();
        match exec_call(
            budget,
            "get_symbol_constraints",
            self.collaborators.broker.get_symbol_constraints(symbol),
        )
        .await
        {
            Ok(c) => {
                self.constraints.insert(symbol.to_string(), c.clone());
                Some(c)
            }
            Err(e) => {
                tracing::warn!(symbol, error = %e, "symbol constraints unavailable");
                self.suspensions.record_failure(symbol, &e, now);
                None
            }
        }
    }

    async fn try_enter(
        &mut self,
        eval: Evaluation,
        account: &AccountState,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) {
        let symbol = eval.decision.symbol.clone();
        let Some(constraints) = self.symbol_constraints(&symbol, now).await else {
            report
                .skipped
                .push((symbol, "constraints unavailable".into()));
            return;
        };

        let book = self.lifecycle.book();
        let plan = match self.risk.evaluate(
            &eval.decision,
            &eval.view,
            &eval.tick,
            account,
            &book,
            &constraints,
            now,
        ) {
            Ok(plan) => plan,
            Err(reason) => {
                tracing::debug!(symbol = %symbol, %reason, "no trade");
                report.skipped.push((symbol, reason.to_string()));
                return;
            }
        };

        if let Err(e) = self
            .lifecycle
            .begin_entry(&plan, eval.view.features.clone(), now)
        {
            tracing::warn!(symbol = %symbol, error = %e, "entry refused by lifecycle");
            report.skipped.push((symbol, e.to_string()));
            return;
        }

        let budget = self.config.timeouts.execution();
        let broker = Arc::clone(&self.collaborators.broker);
        match exec_call(budget, "submit_order", broker.submit_order(&plan)).await {
            Ok(fill) => {
                self.confirm_entry(&symbol, fill.ticket_id, fill.fill_price, now, report);
            }
            Err(e) if e.is_connectivity() => {
                // The order may have landed; look before deciding, never resubmit
                let known: HashSet<TicketId> = self
                    .lifecycle
                    .positions()
                    .filter_map(|p| p.ticket_id.clone())
                    .collect();
                match exec_call(budget, "open_positions", broker.open_positions()).await {
                    Ok(positions) => {
                        let landed = positions.into_iter().find(|p| {
                            p.symbol == plan.symbol
                                && p.direction == plan.direction
                                && !known.contains(&p.ticket_id)
                        });
                        if let Some(landed) = landed {
                            tracing::info!(
                                symbol = %symbol,
                                ticket = %landed.ticket_id,
                                "order landed despite submit error, adopting"
                            );
                            self.confirm_entry(
                                &symbol,
                                landed.ticket_id,
                                landed.entry_price,
                                now,
                                report,
                            );
                        } else {
                            self.entry_failed(&symbol, &e, now, report);
                        }
                    }
                    Err(requery) => {
                        // Stays pending, which blocks the symbol until the
                        // next connected cycle settles it
                        tracing::error!(
                            symbol = %symbol,
                            error = %requery,
                            "order outcome unknown after submit error"
                        );
                        self.suspensions.record_failure(&symbol, &e, now);
                        report
                            .skipped
                            .push((symbol, format!("order outcome unknown: {e}")));
                    }
                }
            }
            Err(e) => self.entry_failed(&symbol, &e, now, report),
        }
    }

    fn confirm_entry(
        &mut self,
        symbol: &str,
        ticket: TicketId,
        fill_price: f64,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) {
        match self
            .lifecycle
            .confirm_entry(symbol, ticket, Some(fill_price), now)
        {
            Ok(position) => {
                tracing::info!(
                    symbol = %position.symbol,
                    ticket = ?position.ticket_id,
                    direction = %position.direction,
                    volume = position.volume,
                    entry = position.entry_price,
                    stop_loss = position.stop_loss,
                    take_profit = position.take_profit,
                    "position opened"
                );
                report.opened.push(position.clone());
                self.risk.guard_mut().record_entry(now);
                self.suspensions.record_success(symbol);
            }
            Err(e) => tracing::error!(symbol, error = %e, "could not confirm entry"),
        }
    }

    fn entry_failed(
        &mut self,
        symbol: &str,
        error: &ExecutionError,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) {
        tracing::warn!(symbol, error = %error, "order not placed");
        if let Err(e) = self.lifecycle.abandon_entry(symbol) {
            tracing::error!(symbol, error = %e, "could not drop pending entry");
        }
        self.suspensions.record_failure(symbol, error, now);
        report.skipped.push((symbol.to_string(), error.to_string()));
    }

    async fn apply(
        &mut self,
        action: LifecycleAction,
        ticks: &BTreeMap<String, Tick>,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) {
        let budget = self.config.timeouts.execution();
        let broker = Arc::clone(&self.collaborators.broker);
        match action {
            LifecycleAction::UpdateStop {
                symbol,
                ticket_id,
                stop_loss,
            } => match exec_call(budget, "modify_stop", broker.modify_stop(&ticket_id, stop_loss))
                .await
            {
                Ok(()) => {
                    tracing::debug!(symbol = %symbol, stop_loss, "stop tightened");
                    report.stop_updates += 1;
                    self.suspensions.record_success(&symbol);
                }
                Err(e) => {
                    // The local stop still applies on the next track
                    tracing::warn!(symbol = %symbol, error = %e, "broker stop not updated");
                    self.suspensions.record_failure(&symbol, &e, now);
                }
            },
            LifecycleAction::Close {
                symbol,
                ticket_id,
                reason,
            } => {
                tracing::info!(symbol = %symbol, ticket = %ticket_id, %reason, "closing position");
                match exec_call(budget, "close_position", broker.close_position(&ticket_id)).await
                {
                    Ok(fill) => {
                        let fill = CloseFill {
                            exit_price: fill.exit_price,
                            profit: fill.profit,
                            estimated: false,
                        };
                        self.complete_close(&symbol, fill, now, report).await;
                    }
                    Err(ExecutionError::UnknownTicket(_)) => {
                        self.close_estimated(&symbol, ticks, now, report).await;
                    }
                    Err(e) if e.is_connectivity() => {
                        // A close that landed leaves no ticket behind
                        let gone = exec_call(budget, "open_positions", broker.open_positions())
                            .await
                            .map(|ps| !ps.iter().any(|p| p.ticket_id == ticket_id));
                        if let Ok(true) = gone {
                            self.close_estimated(&symbol, ticks, now, report).await;
                        } else {
                            self.close_failed(&symbol, &e, now);
                        }
                    }
                    Err(e) => self.close_failed(&symbol, &e, now),
                }
            }
        }
    }

    fn close_failed(&mut self, symbol: &str, error: &ExecutionError, now: DateTime<Utc>) {
        tracing::warn!(symbol, error = %error, "close failed, will retry");
        if let Err(e) = self.lifecycle.close_failed(symbol) {
            tracing::error!(symbol, error = %e, "could not reopen position after failed close");
        }
        self.suspensions.record_failure(symbol, error, now);
    }

    /// Confirm a close the broker did not price, from the latest quote.
    async fn close_estimated(
        &mut self,
        symbol: &str,
        ticks: &BTreeMap<String, Tick>,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) {
        let Some(position) = self.lifecycle.get(symbol) else {
            return;
        };
        let exit_price = ticks
            .get(symbol)
            .map(|t| position.exit_price(t.bid, t.ask))
            .unwrap_or(position.entry_price);
        let profit = estimate_profit(self.constraints.get(symbol), position, exit_price);
        let fill = CloseFill {
            exit_price,
            profit,
            estimated: true,
        };
        self.complete_close(symbol, fill, now, report).await;
    }

    async fn complete_close(
        &mut self,
        symbol: &str,
        fill: CloseFill,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) {
        match self.lifecycle.complete_close(symbol, fill, now) {
            Ok(trade) => {
                self.suspensions.record_success(symbol);
                self.on_closed(trade, now, report).await;
            }
            Err(e) => tracing::error!(symbol, error = %e, "could not complete close"),
        }
    }

    /// Every closed trade: guard, journal, memory.
    async fn on_closed(&mut self, trade: ClosedTrade, now: DateTime<Utc>, report: &mut CycleReport) {
        tracing::info!(
            symbol = %trade.symbol,
            ticket = %trade.ticket_id,
            reason = %trade.exit_reason,
            realized_return = trade.realized_return,
            profit = trade.profit,
            estimated = trade.estimated,
            "position closed"
        );
        self.risk.guard_mut().record_close(trade.profit, now);
        if let Err(e) = self.journal.record(&trade) {
            tracing::warn!(error = %e, "trade not journaled");
        }
        self.memory.learn(&trade, now).await;
        report.closed.push(trade);
    }
}
