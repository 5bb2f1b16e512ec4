//! Trading loop scenarios against scripted collaborators.
//!
//! The market is a steady uptrend on every timeframe, so with a long oracle
//! the loop wants to buy. The broker fills at the planned price and can be
//! told to reject, hang or drop off the network.
//!
//! Scenarios with a blocking pattern store run on the real clock: blocking
//! tasks keep a paused clock from advancing.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use otrade_core::decision::OracleScore;
use otrade_core::domain::{
    AccountState, Bar, Direction, ExitReason, OrderPlan, PositionState, SymbolConstraints, Tick,
    TicketId, Timeframe,
};
use otrade_core::memory::{
    InMemoryStore, MemoryError, MemorySnapshot, PatternMemory, PatternStore,
};
use otrade_runner::{
    BotConfig, BrokerPosition, CloseReport, Collaborators, DataError, ExecutionBridge,
    ExecutionError, ExitRequest, ExitVerdict, ForcedExitSource, LoopError, MarketDataSource,
    MemoryService, OracleError, OracleRequest, OrderFill, ScoringOracle, TradeJournal,
    TradingLoopController,
};

const TIMEFRAMES: [Timeframe; 3] = [Timeframe::M15, Timeframe::H1, Timeframe::H4];
const STEP: f64 = 0.0004;
const SPREAD: f64 = 0.0002;
const HANG: Duration = Duration::from_secs(3600);
const STORAGE_BUDGET: Duration = Duration::from_secs(5);

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).single().unwrap()
}

fn at(minutes: i64) -> DateTime<Utc> {
    t0() + ChronoDuration::minutes(minutes)
}

fn uptrend(tf: Timeframe, n: usize) -> Vec<Bar> {
    (0..n)
        .map(|i| {
            let open = 1.1 + i as f64 * STEP;
            let close = open + STEP;
            Bar {
                timeframe: tf,
                open_time: t0() - tf.duration() * (n - i) as i32,
                open,
                high: close + 0.0002,
                low: open - 0.0002,
                close,
                volume: 500.0,
            }
        })
        .collect()
}

// ── Scripted collaborators ──

struct ScriptedMarket {
    bars: BTreeMap<Timeframe, Vec<Bar>>,
    price: Mutex<f64>,
    failing: Mutex<HashSet<String>>,
}

impl ScriptedMarket {
    fn new() -> Self {
        let bars: BTreeMap<Timeframe, Vec<Bar>> =
            TIMEFRAMES.iter().map(|tf| (*tf, uptrend(*tf, 150))).collect();
        let last = bars[&Timeframe::M15].last().unwrap().close;
        Self {
            bars,
            price: Mutex::new(last),
            failing: Mutex::new(HashSet::new()),
        }
    }

    fn set_price(&self, bid: f64) {
        *self.price.lock().unwrap() = bid;
    }

    fn fail(&self, symbol: &str) {
        self.failing.lock().unwrap().insert(symbol.to_string());
    }

    fn tick(&self) -> Tick {
        let bid = *self.price.lock().unwrap();
        Tick {
            bid,
            ask: bid + SPREAD,
            time: t0(),
        }
    }

    fn check(&self, symbol: &str) -> Result<(), DataError> {
        if self.failing.lock().unwrap().contains(symbol) {
            return Err(DataError::Unavailable {
                symbol: symbol.to_string(),
                reason: "feed down".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl MarketDataSource for ScriptedMarket {
    async fn get_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<Bar>, DataError> {
        self.check(symbol)?;
        let bars = self
            .bars
            .get(&timeframe)
            .ok_or_else(|| DataError::UnknownSymbol(symbol.to_string()))?;
        Ok(bars[bars.len().saturating_sub(count)..].to_vec())
    }

    async fn get_tick(&self, symbol: &str) -> Result<Tick, DataError> {
        self.check(symbol)?;
        Ok(self.tick())
    }
}

#[derive(Debug, Clone, Copy, Default)]
enum Hang {
    #[default]
    Never,
    /// The call takes effect at the broker, then the reply never comes.
    AfterEffect,
    /// The call never reaches the broker.
    BeforeEffect,
}

#[derive(Debug, Clone, Default)]
struct Faults {
    offline: bool,
    reject_orders: bool,
    reject_closes: bool,
    reject_stops: bool,
    submit: Hang,
    close: Hang,
    /// The connection drops right after a submit, before the reply.
    sever_after_submit: bool,
}

#[derive(Debug, Default)]
struct Book {
    next_ticket: u64,
    positions: BTreeMap<TicketId, BrokerPosition>,
    submits: usize,
    closes: usize,
}

struct ScriptedBroker {
    market: Arc<ScriptedMarket>,
    book: Mutex<Book>,
    faults: Mutex<Faults>,
}

impl ScriptedBroker {
    fn new(market: Arc<ScriptedMarket>) -> Self {
        Self {
            market,
            book: Mutex::new(Book {
                next_ticket: 100,
                ..Book::default()
            }),
            faults: Mutex::new(Faults::default()),
        }
    }

    fn set(&self, f: impl FnOnce(&mut Faults)) {
        f(&mut self.faults.lock().unwrap());
    }

    fn faults(&self) -> Faults {
        self.faults.lock().unwrap().clone()
    }

    fn positions(&self) -> Vec<BrokerPosition> {
        self.book.lock().unwrap().positions.values().cloned().collect()
    }

    fn submits(&self) -> usize {
        self.book.lock().unwrap().submits
    }

    fn closes(&self) -> usize {
        self.book.lock().unwrap().closes
    }

    /// The broker closes the position on its own (stop hit server-side).
    fn drop_position(&self, ticket: &TicketId) {
        self.book.lock().unwrap().positions.remove(ticket);
    }

    /// A position opened outside this process (another terminal, by hand).
    fn place_foreign(&self, symbol: &str, direction: Direction) -> TicketId {
        let mut book = self.book.lock().unwrap();
        book.next_ticket += 1;
        let ticket_id = TicketId::from(book.next_ticket);
        book.positions.insert(
            ticket_id.clone(),
            BrokerPosition {
                ticket_id: ticket_id.clone(),
                symbol: symbol.to_string(),
                direction,
                volume: 0.1,
                entry_price: 1.1,
                stop_loss: None,
                take_profit: None,
                profit: 0.0,
            },
        );
        ticket_id
    }

    fn offline() -> ExecutionError {
        ExecutionError::Unreachable("connection reset".into())
    }
}

#[async_trait]
impl ExecutionBridge for ScriptedBroker {
    async fn submit_order(&self, plan: &OrderPlan) -> Result<OrderFill, ExecutionError> {
        let faults = self.faults();
        if faults.offline {
            return Err(Self::offline());
        }
        let fill = {
            let mut book = self.book.lock().unwrap();
            book.submits += 1;
            if faults.reject_orders {
                return Err(ExecutionError::Rejected {
                    operation: "submit_order".into(),
                    reason: "market closed".into(),
                });
            }
            if matches!(faults.submit, Hang::BeforeEffect) {
                None
            } else {
                book.next_ticket += 1;
                let ticket_id = TicketId::from(book.next_ticket);
                book.positions.insert(
                    ticket_id.clone(),
                    BrokerPosition {
                        ticket_id: ticket_id.clone(),
                        symbol: plan.symbol.clone(),
                        direction: plan.direction,
                        volume: plan.volume,
                        entry_price: plan.entry_price,
                        stop_loss: Some(plan.stop_loss),
                        take_profit: Some(plan.take_profit),
                        profit: 0.0,
                    },
                );
                Some(OrderFill {
                    ticket_id,
                    fill_price: plan.entry_price,
                })
            }
        };
        if faults.sever_after_submit {
            self.set(|f| f.offline = true);
        }
        if !matches!(faults.submit, Hang::Never) {
            tokio::time::sleep(HANG).await;
        }
        fill.ok_or_else(Self::offline)
    }

    async fn close_position(&self, ticket: &TicketId) -> Result<CloseReport, ExecutionError> {
        let faults = self.faults();
        if faults.offline {
            return Err(Self::offline());
        }
        let report = {
            let mut book = self.book.lock().unwrap();
            book.closes += 1;
            if faults.reject_closes {
                return Err(ExecutionError::Rejected {
                    operation: "close_position".into(),
                    reason: "requote".into(),
                });
            }
            if matches!(faults.close, Hang::BeforeEffect) {
                None
            } else {
                let position = book
                    .positions
                    .remove(ticket)
                    .ok_or_else(|| ExecutionError::UnknownTicket(ticket.clone()))?;
                let tick = self.market.tick();
                let exit_price = match position.direction {
                    Direction::Short => tick.ask,
                    _ => tick.bid,
                };
                let profit = SymbolConstraints::fx_major().profit_for(
                    (exit_price - position.entry_price) * position.direction.sign(),
                    position.volume,
                );
                Some(CloseReport { exit_price, profit })
            }
        };
        if !matches!(faults.close, Hang::Never) {
            tokio::time::sleep(HANG).await;
        }
        report.ok_or_else(Self::offline)
    }

    async fn modify_stop(&self, ticket: &TicketId, stop_loss: f64) -> Result<(), ExecutionError> {
        let faults = self.faults();
        if faults.offline {
            return Err(Self::offline());
        }
        if faults.reject_stops {
            return Err(ExecutionError::Rejected {
                operation: "modify_stop".into(),
                reason: "stop too close".into(),
            });
        }
        let mut book = self.book.lock().unwrap();
        let position = book
            .positions
            .get_mut(ticket)
            .ok_or_else(|| ExecutionError::UnknownTicket(ticket.clone()))?;
        position.stop_loss = Some(stop_loss);
        Ok(())
    }

    async fn get_account_state(&self) -> Result<AccountState, ExecutionError> {
        if self.faults().offline {
            return Err(Self::offline());
        }
        Ok(AccountState::flat(10_000.0, "USD"))
    }

    async fn get_symbol_constraints(
        &self,
        _symbol: &str,
    ) -> Result<SymbolConstraints, ExecutionError> {
        if self.faults().offline {
            return Err(Self::offline());
        }
        Ok(SymbolConstraints::fx_major())
    }

    async fn open_positions(&self) -> Result<Vec<BrokerPosition>, ExecutionError> {
        if self.faults().offline {
            return Err(Self::offline());
        }
        Ok(self.positions())
    }
}

#[derive(Default)]
struct LongOracle {
    hang: AtomicBool,
    /// Advise closing every open position.
    advise_close: AtomicBool,
}

#[async_trait]
impl ScoringOracle for LongOracle {
    async fn score(&self, _request: &OracleRequest) -> Result<OracleScore, OracleError> {
        if self.hang.load(Ordering::SeqCst) {
            tokio::time::sleep(HANG).await;
        }
        Ok(OracleScore {
            direction: Direction::Long,
            confidence: 0.9,
        })
    }

    async fn advise_exit(&self, _request: &ExitRequest) -> Result<ExitVerdict, OracleError> {
        Ok(ExitVerdict {
            close: self.advise_close.load(Ordering::SeqCst),
            reason: Some("reversal".into()),
        })
    }
}

#[derive(Default)]
struct ForcedList(Mutex<HashSet<TicketId>>);

#[async_trait]
impl ForcedExitSource for ForcedList {
    async fn forced_closes(&self) -> HashSet<TicketId> {
        self.0.lock().unwrap().clone()
    }
}

/// Pattern store whose persist blocks until released (or five seconds pass).
#[derive(Default)]
struct BlockingStore {
    blocking: AtomicBool,
    released: Mutex<bool>,
    wake: Condvar,
    persisted: AtomicUsize,
    last_len: AtomicUsize,
}

impl BlockingStore {
    fn block(&self) {
        *self.released.lock().unwrap() = false;
        self.blocking.store(true, Ordering::SeqCst);
    }

    fn release(&self) {
        self.blocking.store(false, Ordering::SeqCst);
        *self.released.lock().unwrap() = true;
        self.wake.notify_all();
    }
}

impl PatternStore for BlockingStore {
    fn load(&self) -> Result<Option<MemorySnapshot>, MemoryError> {
        Ok(None)
    }

    fn persist(&self, snapshot: &MemorySnapshot) -> Result<(), MemoryError> {
        if self.blocking.load(Ordering::SeqCst) {
            let released = self.released.lock().unwrap();
            let _ = self
                .wake
                .wait_timeout_while(released, Duration::from_secs(5), |r| !*r)
                .unwrap();
        }
        self.persisted.fetch_add(1, Ordering::SeqCst);
        self.last_len.store(snapshot.records.len(), Ordering::SeqCst);
        Ok(())
    }

    fn describe(&self) -> String {
        "blocking".into()
    }
}

// ── Harness ──

struct Harness {
    market: Arc<ScriptedMarket>,
    broker: Arc<ScriptedBroker>,
    oracle: Arc<LongOracle>,
    forced: Arc<ForcedList>,
    store: Arc<InMemoryStore>,
    controller: TradingLoopController,
}

fn config() -> BotConfig {
    BotConfig {
        symbols: vec!["EURUSD".into()],
        timeframes: TIMEFRAMES.to_vec(),
        primary_timeframe: Timeframe::M15,
        ..BotConfig::default()
    }
}

async fn harness_with(config: BotConfig, store: Arc<InMemoryStore>) -> Harness {
    let dyn_store: Arc<dyn PatternStore> = store.clone();
    harness_on(config, dyn_store, STORAGE_BUDGET, store).await
}

/// Harness whose controller persists to `backing`; `store` is what the
/// harness exposes for inspection.
async fn harness_on(
    config: BotConfig,
    backing: Arc<dyn PatternStore>,
    storage_timeout: Duration,
    store: Arc<InMemoryStore>,
) -> Harness {
    let market = Arc::new(ScriptedMarket::new());
    let broker = Arc::new(ScriptedBroker::new(Arc::clone(&market)));
    let oracle = Arc::new(LongOracle::default());
    let forced = Arc::new(ForcedList::default());

    let memory = MemoryService::open(
        PatternMemory::new(config.memory.clone()),
        backing,
        storage_timeout,
    )
    .await
    .unwrap();
    let collaborators = Collaborators {
        market: market.clone(),
        broker: broker.clone(),
        oracle: oracle.clone(),
        forced_exits: forced.clone(),
    };
    let controller = TradingLoopController::new(
        config,
        collaborators,
        Arc::new(memory),
        TradeJournal::in_memory(),
    )
    .unwrap();

    Harness {
        market,
        broker,
        oracle,
        forced,
        store,
        controller,
    }
}

async fn harness(config: BotConfig) -> Harness {
    harness_with(config, Arc::new(InMemoryStore::new())).await
}

/// Open a EURUSD long in the first cycle and return its ticket.
async fn open_long(h: &mut Harness) -> TicketId {
    let report = h.controller.run_cycle(at(0)).await;
    assert!(report.connected);
    assert_eq!(report.opened.len(), 1, "skipped: {:?}", report.skipped);
    report.opened[0].ticket_id.clone().unwrap()
}

// ── Entries ──

#[tokio::test(start_paused = true)]
async fn agreeing_signals_open_a_sized_position() {
    let mut h = harness(config()).await;
    let report = h.controller.run_cycle(at(0)).await;

    assert_eq!(report.decisions.len(), 1);
    assert_eq!(report.decisions[0].direction, Direction::Long);
    assert_eq!(report.opened.len(), 1);

    let position = &report.opened[0];
    assert_eq!(position.direction, Direction::Long);
    assert!(position.stop_loss < position.entry_price);
    assert!(position.take_profit > position.entry_price);
    // Loss at the stop stays within 1% of equity
    let max_loss = SymbolConstraints::fx_major()
        .profit_for(position.entry_price - position.stop_loss, position.volume);
    assert!(max_loss <= 100.0 + 1e-6);

    let broker = h.broker.positions();
    assert_eq!(broker.len(), 1);
    assert_eq!(Some(&broker[0].ticket_id), position.ticket_id.as_ref());
    assert_eq!(h.controller.risk().guard().trades_today(at(0)), 1);
}

#[tokio::test(start_paused = true)]
async fn live_position_blocks_a_second_entry() {
    let mut h = harness(config()).await;
    open_long(&mut h).await;

    let report = h.controller.run_cycle(at(15)).await;
    assert!(report.opened.is_empty());
    assert!(report.decisions.is_empty());
    assert_eq!(h.broker.submits(), 1);
}

#[tokio::test(start_paused = true)]
async fn hung_oracle_falls_back_to_rules_and_memory() {
    let mut cfg = config();
    cfg.decision.min_agreeing_signals = 1;
    let mut h = harness(cfg).await;
    h.oracle.hang.store(true, Ordering::SeqCst);

    let started = Instant::now();
    let report = h.controller.run_cycle(at(0)).await;
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(3_000));
    assert!(elapsed < Duration::from_secs(10));
    assert!(report.decisions[0].has_tag("oracle_unavailable"));
    assert_eq!(report.decisions[0].direction, Direction::Long);
    assert_eq!(report.opened.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn hung_oracle_without_enough_signals_is_flat() {
    let mut h = harness(config()).await;
    h.oracle.hang.store(true, Ordering::SeqCst);

    let report = h.controller.run_cycle(at(0)).await;
    assert_eq!(report.decisions[0].direction, Direction::Flat);
    assert!(report
        .skip_reason("EURUSD")
        .is_some_and(|r| r.starts_with("flat_no_agreement")));
    assert_eq!(h.broker.submits(), 0);
}

#[tokio::test(start_paused = true)]
async fn failing_feed_only_skips_its_symbol() {
    let mut cfg = config();
    cfg.symbols = vec!["EURUSD".into(), "GBPUSD".into()];
    let mut h = harness(cfg).await;
    h.market.fail("GBPUSD");

    let report = h.controller.run_cycle(at(0)).await;
    assert!(report
        .skip_reason("GBPUSD")
        .is_some_and(|r| r.contains("feed down")));
    assert_eq!(report.opened.len(), 1);
    assert_eq!(report.opened[0].symbol, "EURUSD");
}

// ── Submit timeouts ──

#[tokio::test(start_paused = true)]
async fn submit_timeout_adopts_the_order_that_landed() {
    let mut h = harness(config()).await;
    h.broker.set(|f| f.submit = Hang::AfterEffect);

    let report = h.controller.run_cycle(at(0)).await;

    assert_eq!(h.broker.submits(), 1, "never resubmitted");
    assert_eq!(report.opened.len(), 1);
    let broker = h.broker.positions();
    assert_eq!(broker.len(), 1);
    assert_eq!(report.opened[0].ticket_id.as_ref(), Some(&broker[0].ticket_id));
    assert_eq!(h.controller.suspensions().consecutive_failures("EURUSD"), 0);
}

#[tokio::test(start_paused = true)]
async fn submit_timeout_without_an_order_abandons_the_entry() {
    let mut h = harness(config()).await;
    h.broker.set(|f| f.submit = Hang::BeforeEffect);

    let report = h.controller.run_cycle(at(0)).await;

    assert!(report.opened.is_empty());
    assert!(h.controller.lifecycle().is_empty());
    assert!(h.broker.positions().is_empty());
    assert_eq!(h.broker.submits(), 1);
    assert_eq!(h.controller.suspensions().consecutive_failures("EURUSD"), 1);
    assert!(report
        .skip_reason("EURUSD")
        .is_some_and(|r| r.contains("timed out")));
}

#[tokio::test(start_paused = true)]
async fn lost_connection_after_submit_adopts_the_order_next_cycle() {
    let mut h = harness(config()).await;
    h.broker.set(|f| {
        f.submit = Hang::AfterEffect;
        f.sever_after_submit = true;
    });

    // The order lands, the reply never comes and the re-query fails too
    let report = h.controller.run_cycle(at(0)).await;
    assert!(report.opened.is_empty());
    assert!(report
        .skip_reason("EURUSD")
        .is_some_and(|r| r.starts_with("order outcome unknown")));
    assert_eq!(
        h.controller.lifecycle().get("EURUSD").unwrap().state,
        PositionState::Pending
    );
    assert_eq!(h.broker.positions().len(), 1);

    let report = h.controller.run_cycle(at(15)).await;
    assert!(!report.connected);

    h.broker.set(|f| {
        f.offline = false;
        f.submit = Hang::Never;
        f.sever_after_submit = false;
    });
    let report = h.controller.run_cycle(at(30)).await;
    assert_eq!(h.broker.submits(), 1, "never resubmitted");
    assert_eq!(report.opened.len(), 1);
    let broker = h.broker.positions();
    assert_eq!(broker.len(), 1);
    assert_eq!(report.opened[0].ticket_id.as_ref(), Some(&broker[0].ticket_id));
    assert_eq!(
        h.controller.lifecycle().get("EURUSD").unwrap().state,
        PositionState::Open
    );

    let report = h.controller.run_cycle(at(45)).await;
    assert!(report.opened.is_empty());
    assert_eq!(h.broker.submits(), 1);
    assert_eq!(h.broker.positions().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn lost_connection_before_the_order_landed_drops_the_entry_next_cycle() {
    let mut h = harness(config()).await;
    h.broker.set(|f| {
        f.submit = Hang::BeforeEffect;
        f.sever_after_submit = true;
    });

    let report = h.controller.run_cycle(at(0)).await;
    assert!(report.opened.is_empty());
    assert!(h.broker.positions().is_empty());
    assert_eq!(h.controller.suspensions().consecutive_failures("EURUSD"), 1);

    h.broker.set(|f| {
        f.offline = false;
        f.submit = Hang::Never;
        f.sever_after_submit = false;
    });
    // The stale entry is dropped and a fresh order goes out
    let report = h.controller.run_cycle(at(15)).await;
    assert_eq!(h.broker.submits(), 2);
    assert_eq!(report.opened.len(), 1);
    assert_eq!(h.broker.positions().len(), 1);
    assert_eq!(h.controller.suspensions().consecutive_failures("EURUSD"), 0);
}

#[tokio::test(start_paused = true)]
async fn unmanaged_broker_position_blocks_entries_on_its_symbol() {
    let mut cfg = config();
    cfg.symbols = vec!["EURUSD".into(), "GBPUSD".into()];
    let mut h = harness(cfg).await;
    let foreign = h.broker.place_foreign("EURUSD", Direction::Short);

    let report = h.controller.run_cycle(at(0)).await;
    assert_eq!(
        report.skip_reason("EURUSD"),
        Some("unmanaged broker position")
    );
    assert_eq!(report.opened.len(), 1);
    assert_eq!(report.opened[0].symbol, "GBPUSD");
    assert!(h.controller.lifecycle().get("EURUSD").is_none());

    h.broker.drop_position(&foreign);
    let report = h.controller.run_cycle(at(15)).await;
    assert_eq!(report.opened.len(), 1);
    assert_eq!(report.opened[0].symbol, "EURUSD");
}

// ── Exits ──

#[tokio::test(start_paused = true)]
async fn advised_exit_closes_and_learns() {
    let mut h = harness(config()).await;
    let ticket = open_long(&mut h).await;
    h.oracle.advise_close.store(true, Ordering::SeqCst);

    let report = h.controller.run_cycle(at(15)).await;
    assert_eq!(report.closed.len(), 1);
    assert_eq!(report.closed[0].ticket_id, ticket);
    assert_eq!(report.closed[0].exit_reason, ExitReason::Advised);
    assert!(!report.closed[0].estimated);
    assert!(h.broker.positions().iter().all(|p| p.ticket_id != ticket));
    assert_eq!(h.controller.memory().len().await, 1);
}

#[tokio::test(start_paused = true)]
async fn advised_exits_can_be_switched_off() {
    let mut cfg = config();
    cfg.decision.advised_exits = false;
    let mut h = harness(cfg).await;
    open_long(&mut h).await;
    h.oracle.advise_close.store(true, Ordering::SeqCst);

    let report = h.controller.run_cycle(at(15)).await;
    assert!(report.closed.is_empty());
    assert_eq!(h.broker.positions().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn take_profit_closes_and_learns_one_pattern() {
    let mut h = harness(config()).await;
    open_long(&mut h).await;

    h.market.set_price(1.1640);
    let report = h.controller.run_cycle(at(15)).await;

    assert_eq!(report.closed.len(), 1);
    let trade = &report.closed[0];
    assert_eq!(trade.exit_reason, ExitReason::TakeProfit);
    assert!(!trade.estimated);
    assert!(trade.profit > 0.0);
    assert!(trade.realized_return > 0.0);
    assert_eq!(h.controller.memory().len().await, 1);
    assert_eq!(h.store.stored_len(), Some(1));
    assert_eq!(h.controller.stats().trades, 1);
    assert_eq!(h.controller.stats().wins, 1);
}

#[tokio::test(start_paused = true)]
async fn trailing_stop_is_pushed_to_the_broker() {
    let mut h = harness(config()).await;
    open_long(&mut h).await;
    let initial = h.broker.positions()[0].stop_loss.unwrap();

    h.market.set_price(1.1625);
    let report = h.controller.run_cycle(at(15)).await;

    assert_eq!(report.stop_updates, 1);
    let moved = h.broker.positions()[0].stop_loss.unwrap();
    assert!(moved > initial);
    assert_eq!(h.controller.lifecycle().get("EURUSD").unwrap().stop_loss, moved);
}

#[tokio::test(start_paused = true)]
async fn rejected_stop_update_is_still_enforced_locally() {
    let mut h = harness(config()).await;
    open_long(&mut h).await;
    let broker_stop = h.broker.positions()[0].stop_loss.unwrap();
    h.broker.set(|f| f.reject_stops = true);

    h.market.set_price(1.1625);
    let report = h.controller.run_cycle(at(15)).await;
    assert_eq!(report.stop_updates, 0);
    let local_stop = h.controller.lifecycle().get("EURUSD").unwrap().stop_loss;
    assert!(local_stop > broker_stop);

    // Between the two stops: only the local one is hit
    let between = (local_stop + broker_stop) / 2.0;
    h.market.set_price(between);
    let report = h.controller.run_cycle(at(30)).await;
    assert_eq!(report.closed.len(), 1);
    assert_eq!(report.closed[0].exit_reason, ExitReason::StopLoss);
}

#[tokio::test(start_paused = true)]
async fn forced_exit_closes_the_ticket() {
    let mut h = harness(config()).await;
    let ticket = open_long(&mut h).await;
    h.forced.0.lock().unwrap().insert(ticket.clone());

    let report = h.controller.run_cycle(at(15)).await;
    assert_eq!(report.closed.len(), 1);
    assert_eq!(report.closed[0].ticket_id, ticket);
    assert_eq!(report.closed[0].exit_reason, ExitReason::Forced);
}

#[tokio::test(start_paused = true)]
async fn broker_side_close_is_reconciled_once() {
    let mut h = harness(config()).await;
    let ticket = open_long(&mut h).await;
    h.broker.drop_position(&ticket);

    let report = h.controller.run_cycle(at(15)).await;
    assert_eq!(report.closed.len(), 1);
    assert_eq!(report.closed[0].exit_reason, ExitReason::External);
    assert!(report.closed[0].estimated);
    assert_eq!(h.broker.closes(), 0);

    h.controller.run_cycle(at(30)).await;
    assert_eq!(h.controller.memory().len().await, 1);
    assert_eq!(h.controller.stats().trades, 1);
}

#[tokio::test(start_paused = true)]
async fn close_timeout_after_the_close_landed_is_estimated() {
    let mut h = harness(config()).await;
    open_long(&mut h).await;
    h.broker.set(|f| f.close = Hang::AfterEffect);

    h.market.set_price(1.1640);
    let report = h.controller.run_cycle(at(15)).await;

    assert_eq!(report.closed.len(), 1);
    let trade = &report.closed[0];
    assert!(trade.estimated);
    assert_eq!(trade.exit_reason, ExitReason::TakeProfit);
    assert!((trade.exit_price - 1.1640).abs() < 1e-9);
    assert_eq!(h.controller.stats().estimated, 1);

    h.broker.set(|f| f.close = Hang::Never);
    h.controller.run_cycle(at(30)).await;
    assert_eq!(h.controller.memory().len().await, 1);
}

#[tokio::test(start_paused = true)]
async fn failed_close_reopens_and_retries_next_cycle() {
    let mut h = harness(config()).await;
    open_long(&mut h).await;
    h.broker.set(|f| f.reject_closes = true);

    h.market.set_price(1.1640);
    let report = h.controller.run_cycle(at(15)).await;
    assert!(report.closed.is_empty());
    assert_eq!(h.broker.positions().len(), 1);
    assert_eq!(h.controller.suspensions().consecutive_failures("EURUSD"), 1);

    h.broker.set(|f| f.reject_closes = false);
    let report = h.controller.run_cycle(at(30)).await;
    assert_eq!(report.closed.len(), 1);
    assert_eq!(h.broker.closes(), 2);
    assert_eq!(h.controller.memory().len().await, 1);
}

// ── Supervision ──

#[tokio::test(start_paused = true)]
async fn repeated_rejections_suspend_until_cleared() {
    let mut h = harness(config()).await;
    h.broker.set(|f| f.reject_orders = true);

    for i in 0..3 {
        h.controller.run_cycle(at(i * 15)).await;
    }
    assert_eq!(h.broker.submits(), 3);
    let suspended = h.controller.suspensions().suspended();
    assert_eq!(suspended.len(), 1);
    assert_eq!(suspended[0].symbol, "EURUSD");

    let report = h.controller.run_cycle(at(45)).await;
    assert!(report.decisions.is_empty());
    assert_eq!(h.broker.submits(), 3);

    assert!(h.controller.clear_suspension("EURUSD"));
    h.broker.set(|f| f.reject_orders = false);
    let report = h.controller.run_cycle(at(60)).await;
    assert_eq!(report.opened.len(), 1);
    assert_eq!(h.broker.submits(), 4);
}

#[tokio::test(start_paused = true)]
async fn broker_outage_ends_run_and_a_restart_resumes() {
    let mut cfg = config();
    cfg.supervision.max_connectivity_failures = 3;
    let mut h = harness(cfg).await;
    h.broker.set(|f| f.offline = true);

    let (_tx, rx) = watch::channel(false);
    let started = Instant::now();
    let err = h.controller.run(rx).await.unwrap_err();
    assert!(matches!(err, LoopError::ConnectivityLost { consecutive: 3 }));
    // Two cadence waits between three failed cycles
    assert!(started.elapsed() >= Duration::from_secs(120));
    assert_eq!(h.store.stored_len(), Some(0));

    h.broker.set(|f| f.offline = false);
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(90)).await;
        let _ = tx.send(true);
    });
    let stats = h.controller.run(rx).await.unwrap();
    assert_eq!(stats.trades, 0);
    assert_eq!(h.broker.positions().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_persists_what_the_store_missed() {
    let store = Arc::new(InMemoryStore::new());
    store.set_unavailable(true);
    let mut h = harness_with(config(), Arc::clone(&store)).await;

    open_long(&mut h).await;
    h.market.set_price(1.1640);
    let report = h.controller.run_cycle(at(15)).await;
    assert_eq!(report.closed.len(), 1);
    assert_eq!(h.controller.memory().len().await, 1);
    assert!(h.controller.memory().is_degraded());
    assert_eq!(store.stored_len(), None);

    store.set_unavailable(false);
    let (tx, rx) = watch::channel(false);
    tx.send(true).unwrap();
    h.controller.run(rx).await.unwrap();

    assert_eq!(store.stored_len(), Some(1));
    assert!(!h.controller.memory().is_degraded());
}

#[tokio::test]
async fn blocked_store_during_learn_keeps_trading() {
    let backing = Arc::new(BlockingStore::default());
    let dyn_backing: Arc<dyn PatternStore> = backing.clone();
    let mut h = harness_on(
        config(),
        dyn_backing,
        Duration::from_millis(100),
        Arc::new(InMemoryStore::new()),
    )
    .await;
    open_long(&mut h).await;
    backing.block();

    h.market.set_price(1.1640);
    let started = std::time::Instant::now();
    let report = h.controller.run_cycle(at(15)).await;
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(report.closed.len(), 1);
    assert_eq!(h.controller.memory().len().await, 1);
    assert!(h.controller.memory().is_degraded());

    // Cycles keep running while the write is stuck
    let started = std::time::Instant::now();
    let report = h.controller.run_cycle(at(30)).await;
    assert!(report.connected);
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(backing.persisted.load(Ordering::SeqCst), 0);

    backing.release();
    let mut saved = false;
    for _ in 0..200 {
        if h.controller.memory().persist(at(30)).await.is_ok() {
            saved = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(saved);
    assert!(!h.controller.memory().is_degraded());
    assert_eq!(backing.last_len.load(Ordering::SeqCst), 1);
    assert_eq!(backing.persisted.load(Ordering::SeqCst), 2);
}
