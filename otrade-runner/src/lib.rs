//! OTrade Runner — the async trading loop around `otrade-core`.
//!
//! This crate builds on `otrade-core` to provide:
//! - Collaborator traits for market data, execution, oracle and forced exits
//! - The trading loop controller with per-call timeouts and symbol suspension
//! - A shared pattern memory service (concurrent recall, serialized writes)
//! - Bot configuration (TOML) and config hashing
//! - CSV trade journal and session statistics
//! - Paper trading collaborators and an HTTP scoring oracle
//! - Logging setup

pub mod collaborators;
pub mod config;
pub mod controller;
pub mod error;
pub mod journal;
pub mod logging;
pub mod memory_service;
pub mod oracle;
pub mod paper;
pub mod suspension;

pub use collaborators::{
    BrokerPosition, CloseReport, ExecutionBridge, ExitRequest, ExitVerdict, ForcedExitSource,
    MarketDataSource, NoForcedExits, NoOracle, OracleRequest, OrderFill, ScoringOracle,
};
pub use config::{
    BotConfig, ConfigError, JournalConfig, LoggingConfig, OracleConfig, PaperConfig,
    SupervisionConfig, TimeoutConfig,
};
pub use controller::{Collaborators, CycleReport, TradingLoopController};
pub use error::{DataError, ExecutionError, LoopError, OracleError};
pub use journal::{JournalError, SessionStats, TradeJournal};
pub use memory_service::MemoryService;
pub use oracle::HttpOracle;
pub use paper::{PaperBroker, SyntheticMarket};
pub use suspension::{Suspension, SymbolSuspensions};
