//! Paper-trading collaborators: a synthetic market and a simulated broker.
//!
//! `SyntheticMarket` generates a one-minute random walk per symbol with slowly
//! switching drift, seeded through `RngHierarchy` so a seed replays the same
//! prices whatever order symbols are first requested in. Bars of any timeframe
//! are aggregated from the minute path. The market only moves when `advance`
//! is called (or `drive` runs), which keeps tests deterministic.
//!
//! `PaperBroker` fills market orders at the synthetic quote (ask for longs,
//! bid for shorts) and books profit with the symbol's pip value.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

use otrade_core::domain::{
    AccountState, Bar, Direction, OrderPlan, SymbolConstraints, Tick, TicketId, Timeframe,
};
use otrade_core::rng::RngHierarchy;

use crate::collaborators::{
    BrokerPosition, CloseReport, ExecutionBridge, MarketDataSource, OrderFill,
};
use crate::config::PaperConfig;
use crate::error::{DataError, ExecutionError};

/// Upper bound on generated history per symbol (about one year of minutes).
pub const MAX_HISTORY_MINUTES: usize = 525_600;

/// Per-minute probability that the drift regime changes.
const DRIFT_SWITCH: f64 = 1.0 / 720.0;
/// Drift magnitude in units of one-minute volatility.
const DRIFT: f64 = 0.15;

#[derive(Debug, Clone, Copy)]
struct MinuteBar {
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

#[derive(Debug)]
struct PricePath {
    minutes: Vec<MinuteBar>,
    rng: StdRng,
    drift: f64,
}

impl PricePath {
    fn new(rngs: &RngHierarchy, symbol: &str) -> Self {
        let start = 1.0 + rngs.rng_for("start", symbol, 0).gen_range(0.0..0.5);
        Self {
            minutes: vec![MinuteBar {
                open: start,
                high: start,
                low: start,
                close: start,
                volume: 0.0,
            }],
            rng: rngs.rng_for("path", symbol, 0),
            drift: 0.0,
        }
    }

    fn last_close(&self) -> f64 {
        self.minutes.last().map_or(1.0, |m| m.close)
    }

    fn step(&mut self, volatility: f64) {
        if self.rng.gen_bool(DRIFT_SWITCH) {
            self.drift = match self.rng.gen_range(0..3) {
                0 => -DRIFT,
                1 => 0.0,
                _ => DRIFT,
            };
        }
        let open = self.last_close();
        let sigma = open * volatility;
        // Uniform on [-sqrt(3), sqrt(3)] has unit variance
        let z = self.rng.gen_range(-1.0..1.0) * 3f64.sqrt();
        let close = (open + sigma * (z + self.drift)).max(open * 0.5);
        let high = open.max(close) + sigma * 0.5 * self.rng.gen_range(0.0..1.0);
        let low = open.min(close) - sigma * 0.5 * self.rng.gen_range(0.0..1.0);
        let volume = self.rng.gen_range(50.0..150.0);
        self.minutes.push(MinuteBar {
            open,
            high,
            low,
            close,
            volume,
        });
    }
}

#[derive(Debug)]
struct MarketState {
    /// Minutes elapsed since construction.
    elapsed: usize,
    paths: HashMap<String, PricePath>,
}

#[derive(Debug)]
pub struct SyntheticMarket {
    rngs: RngHierarchy,
    config: PaperConfig,
    epoch: DateTime<Utc>,
    history_minutes: usize,
    state: Mutex<MarketState>,
}

impl SyntheticMarket {
    /// A market whose symbols start with `history_minutes` of past prices.
    pub fn new(config: PaperConfig, history_minutes: usize) -> Self {
        Self {
            rngs: RngHierarchy::new(config.seed),
            config,
            epoch: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_default(),
            history_minutes: history_minutes.clamp(1, MAX_HISTORY_MINUTES),
            state: Mutex::new(MarketState {
                elapsed: 0,
                paths: HashMap::new(),
            }),
        }
    }

    /// History long enough for `bars` bars of the largest timeframe.
    pub fn history_for(timeframes: &[Timeframe], bars: usize) -> usize {
        let longest = timeframes
            .iter()
            .map(|tf| tf.duration().num_minutes().max(1) as usize)
            .max()
            .unwrap_or(1);
        longest.saturating_mul(bars + 1).min(MAX_HISTORY_MINUTES)
    }

    fn lock(&self) -> MutexGuard<'_, MarketState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_path<T>(&self, symbol: &str, f: impl FnOnce(&PricePath) -> T) -> T {
        let mut state = self.lock();
        let target = self.history_minutes + state.elapsed;
        let path = state
            .paths
            .entry(symbol.to_string())
            .or_insert_with(|| PricePath::new(&self.rngs, symbol));
        while path.minutes.len() < target {
            path.step(self.config.volatility);
        }
        f(path)
    }

    /// Move every symbol forward by `minutes`.
    pub fn advance(&self, minutes: usize) {
        let mut state = self.lock();
        state.elapsed += minutes;
        let target = self.history_minutes + state.elapsed;
        for path in state.paths.values_mut() {
            while path.minutes.len() < target {
                path.step(self.config.volatility);
            }
        }
    }

    /// Advance `minutes_per_sec` minutes every second until shutdown.
    pub async fn drive(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let step = self.config.minutes_per_sec as usize;
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => self.advance(step),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Market time of the latest minute.
    pub fn now(&self) -> DateTime<Utc> {
        let state = self.lock();
        self.minute_time(self.history_minutes + state.elapsed)
    }

    fn minute_time(&self, index: usize) -> DateTime<Utc> {
        self.epoch + Duration::minutes(index as i64)
    }

    fn spread(&self) -> f64 {
        self.config.spread_pips * SymbolConstraints::fx_major().pip_size
    }

    /// Current quote without awaiting.
    pub fn quote(&self, symbol: &str) -> Tick {
        let half = self.spread() / 2.0;
        let (mid, len) = self.with_path(symbol, |p| (p.last_close(), p.minutes.len()));
        Tick {
            bid: mid - half,
            ask: mid + half,
            time: self.minute_time(len),
        }
    }

    /// The last `count` bars of `timeframe`, the newest possibly still forming.
    pub fn bars(&self, symbol: &str, timeframe: Timeframe, count: usize) -> Vec<Bar> {
        let span = timeframe.duration().num_minutes().max(1) as usize;
        self.with_path(symbol, |path| {
            let n = path.minutes.len();
            if n == 0 || count == 0 {
                return Vec::new();
            }
            let last_block = (n - 1) / span;
            let first_block = (last_block + 1).saturating_sub(count);
            (first_block..=last_block)
                .map(|b| {
                    let start = b * span;
                    let end = ((b + 1) * span).min(n);
                    let chunk = &path.minutes[start..end];
                    Bar {
                        timeframe,
                        open_time: self.minute_time(start),
                        open: chunk[0].open,
                        high: chunk.iter().map(|m| m.high).fold(f64::MIN, f64::max),
                        low: chunk.iter().map(|m| m.low).fold(f64::MAX, f64::min),
                        close: chunk[chunk.len() - 1].close,
                        volume: chunk.iter().map(|m| m.volume).sum(),
                    }
                })
                .collect()
        })
    }
}

#[async_trait]
impl MarketDataSource for SyntheticMarket {
    async fn get_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<Bar>, DataError> {
        Ok(self.bars(symbol, timeframe, count))
    }

    async fn get_tick(&self, symbol: &str) -> Result<Tick, DataError> {
        Ok(self.quote(symbol))
    }
}

#[derive(Debug)]
struct PaperAccount {
    balance: f64,
    next_ticket: u64,
    positions: BTreeMap<TicketId, BrokerPosition>,
}

/// Simulated broker over a `SyntheticMarket`.
#[derive(Debug)]
pub struct PaperBroker {
    market: Arc<SyntheticMarket>,
    constraints: SymbolConstraints,
    currency: String,
    account: Mutex<PaperAccount>,
    unreachable: AtomicBool,
}

impl PaperBroker {
    pub fn new(market: Arc<SyntheticMarket>, config: &PaperConfig) -> Self {
        Self {
            market,
            constraints: SymbolConstraints::fx_major(),
            currency: config.currency.clone(),
            account: Mutex::new(PaperAccount {
                balance: config.initial_equity,
                next_ticket: 1,
                positions: BTreeMap::new(),
            }),
            unreachable: AtomicBool::new(false),
        }
    }

    /// Make every call fail with `Unreachable`, as a dropped connection would.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), ExecutionError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(ExecutionError::Unreachable("paper broker offline".into()));
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, PaperAccount> {
        self.account.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn mark_to_market(&self, position: &BrokerPosition) -> (f64, f64) {
        let tick = self.market.quote(&position.symbol);
        let exit = match position.direction {
            Direction::Short => tick.ask,
            _ => tick.bid,
        };
        let profit = self.constraints.profit_for(
            (exit - position.entry_price) * position.direction.sign(),
            position.volume,
        );
        (exit, profit)
    }
}

#[async_trait]
impl ExecutionBridge for PaperBroker {
    async fn submit_order(&self, plan: &OrderPlan) -> Result<OrderFill, ExecutionError> {
        self.check()?;
        let reject = |reason: String| ExecutionError::Rejected {
            operation: "submit_order".into(),
            reason,
        };
        if plan.direction.is_flat() {
            return Err(reject("flat order".into()));
        }
        let c = &self.constraints;
        if !(plan.volume >= c.min_lot - 1e-9 && plan.volume <= c.max_lot + 1e-9) {
            return Err(reject(format!(
                "volume {} outside [{}, {}]",
                plan.volume, c.min_lot, c.max_lot
            )));
        }

        let tick = self.market.quote(&plan.symbol);
        let fill_price = match plan.direction {
            Direction::Short => tick.bid,
            _ => tick.ask,
        };
        let mut account = self.lock();
        let ticket_id = TicketId::from(account.next_ticket);
        account.next_ticket += 1;
        account.positions.insert(
            ticket_id.clone(),
            BrokerPosition {
                ticket_id: ticket_id.clone(),
                symbol: plan.symbol.clone(),
                direction: plan.direction,
                volume: plan.volume,
                entry_price: fill_price,
                stop_loss: Some(plan.stop_loss),
                take_profit: Some(plan.take_profit),
                profit: 0.0,
            },
        );
        tracing::debug!(ticket = %ticket_id, symbol = %plan.symbol, fill_price, "paper order filled");
        Ok(OrderFill {
            ticket_id,
            fill_price,
        })
    }

    async fn close_position(&self, ticket: &TicketId) -> Result<CloseReport, ExecutionError> {
        self.check()?;
        let mut account = self.lock();
        let position = account
            .positions
            .remove(ticket)
            .ok_or_else(|| ExecutionError::UnknownTicket(ticket.clone()))?;
        let (exit_price, profit) = self.mark_to_market(&position);
        account.balance += profit;
        Ok(CloseReport { exit_price, profit })
    }

    async fn modify_stop(&self, ticket: &TicketId, stop_loss: f64) -> Result<(), ExecutionError> {
        self.check()?;
        let mut account = self.lock();
        let position = account
            .positions
            .get_mut(ticket)
            .ok_or_else(|| ExecutionError::UnknownTicket(ticket.clone()))?;
        position.stop_loss = Some(stop_loss);
        Ok(())
    }

    async fn get_account_state(&self) -> Result<AccountState, ExecutionError> {
        self.check()?;
        let account = self.lock();
        let mut unrealized = 0.0;
        let mut margin = 0.0;
        for p in account.positions.values() {
            let (price, profit) = self.mark_to_market(p);
            unrealized += profit;
            // 1:100 leverage on 100k-unit lots
            margin += p.volume * 100_000.0 * price / 100.0;
        }
        let equity = account.balance + unrealized;
        Ok(AccountState {
            equity,
            balance: account.balance,
            margin,
            free_margin: equity - margin,
            currency: self.currency.clone(),
        })
    }

    async fn get_symbol_constraints(
        &self,
        _symbol: &str,
    ) -> Result<SymbolConstraints, ExecutionError> {
        self.check()?;
        Ok(self.constraints.clone())
    }

    async fn open_positions(&self) -> Result<Vec<BrokerPosition>, ExecutionError> {
        self.check()?;
        let account = self.lock();
        Ok(account
            .positions
            .values()
            .map(|p| BrokerPosition {
                profit: self.mark_to_market(p).1,
                ..p.clone()
            })
            .collect())
    }
}
