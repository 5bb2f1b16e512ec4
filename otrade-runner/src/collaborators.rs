//! External collaborators of the trading loop.
//!
//! The loop talks to the outside world only through these traits: a market
//! data source, an execution bridge to the broker, a scoring oracle and a
//! source of forced exits. Each is injected as `Arc<dyn Trait>`, so the paper
//! collaborators, a live bridge and test doubles are interchangeable.
//!
//! The traits are async (`async_trait`) and carry no timeouts of their own;
//! the controller wraps every call in its budget from `TimeoutConfig`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use otrade_core::analysis::{MarketRegime, MarketView};
use otrade_core::decision::OracleScore;
use otrade_core::domain::{
    AccountState, Bar, Direction, OrderPlan, Position, SymbolConstraints, Tick, TicketId,
    Timeframe,
};
use otrade_core::memory::SymbolBias;

use crate::error::{DataError, ExecutionError, OracleError};

#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// The most recent `count` bars, oldest first.
    async fn get_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<Bar>, DataError>;

    async fn get_tick(&self, symbol: &str) -> Result<Tick, DataError>;
}

/// Broker acknowledgement of a market order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderFill {
    pub ticket_id: TicketId,
    pub fill_price: f64,
}

/// Broker acknowledgement of a close.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CloseReport {
    pub exit_price: f64,
    /// Realized profit in account currency.
    pub profit: f64,
}

/// A position as the broker reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub ticket_id: TicketId,
    pub symbol: String,
    pub direction: Direction,
    pub volume: f64,
    pub entry_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub profit: f64,
}

#[async_trait]
pub trait ExecutionBridge: Send + Sync {
    async fn submit_order(&self, plan: &OrderPlan) -> Result<OrderFill, ExecutionError>;

    async fn close_position(&self, ticket: &TicketId) -> Result<CloseReport, ExecutionError>;

    async fn modify_stop(&self, ticket: &TicketId, stop_loss: f64) -> Result<(), ExecutionError>;

    async fn get_account_state(&self) -> Result<AccountState, ExecutionError>;

    async fn get_symbol_constraints(
        &self,
        symbol: &str,
    ) -> Result<SymbolConstraints, ExecutionError>;

    async fn open_positions(&self) -> Result<Vec<BrokerPosition>, ExecutionError>;
}

/// Market context sent to the oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleRequest {
    pub symbol: String,
    pub regime: MarketRegime,
    pub regime_confidence: f64,
    pub features: Vec<f64>,
    /// Patterns recalled for this state.
    pub memory_hits: usize,
    pub price: Option<f64>,
    /// Learned track record of the symbol, once it has traded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol_bias: Option<SymbolBias>,
}

impl OracleRequest {
    pub fn from_view(view: &MarketView, memory_hits: usize) -> Self {
        Self {
            symbol: view.symbol.clone(),
            regime: view.regime.regime,
            regime_confidence: view.regime.confidence,
            features: view.features.clone(),
            memory_hits,
            price: view.primary_state().map(|s| s.close),
            symbol_bias: None,
        }
    }

    pub fn with_bias(mut self, bias: Option<SymbolBias>) -> Self {
        self.symbol_bias = bias;
        self
    }
}

/// An open position with fresh market context, sent when asking whether to
/// close it early.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitRequest {
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub opened_at: DateTime<Utc>,
    pub price: Option<f64>,
    pub regime: MarketRegime,
    pub regime_confidence: f64,
    pub features: Vec<f64>,
}

impl ExitRequest {
    pub fn new(position: &Position, view: &MarketView) -> Self {
        Self {
            symbol: position.symbol.clone(),
            direction: position.direction,
            entry_price: position.entry_price,
            opened_at: position.opened_at,
            price: view.primary_state().map(|s| s.close),
            regime: view.regime.regime,
            regime_confidence: view.regime.confidence,
            features: view.features.clone(),
        }
    }
}

/// Oracle verdict on an open position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitVerdict {
    pub close: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

#[async_trait]
pub trait ScoringOracle: Send + Sync {
    async fn score(&self, request: &OracleRequest) -> Result<OracleScore, OracleError>;

    /// Whether an open position should be closed now. Oracles that only
    /// score entries keep the default and abstain.
    async fn advise_exit(&self, _request: &ExitRequest) -> Result<ExitVerdict, OracleError> {
        Err(OracleError::Disabled)
    }
}

#[async_trait]
pub trait ForcedExitSource: Send + Sync {
    /// Tickets to close this cycle regardless of their stops.
    async fn forced_closes(&self) -> HashSet<TicketId>;
}

/// Oracle that always abstains.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOracle;

#[async_trait]
impl ScoringOracle for NoOracle {
    async fn score(&self, _request: &OracleRequest) -> Result<OracleScore, OracleError> {
        Err(OracleError::Disabled)
    }
}

/// Nothing is ever force-closed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoForcedExits;

#[async_trait]
impl ForcedExitSource for NoForcedExits {
    async fn forced_closes(&self) -> HashSet<TicketId> {
        HashSet::new()
    }
}
