//! Error types for collaborator calls and the trading loop.

use std::time::Duration;
use thiserror::Error;

use otrade_core::domain::TicketId;
use otrade_core::memory::MemoryError;

use crate::config::ConfigError;

/// Failures of the execution bridge.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("{operation} rejected: {reason}")]
    Rejected { operation: String, reason: String },

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("broker unreachable: {0}")]
    Unreachable(String),

    #[error("unknown ticket {0}")]
    UnknownTicket(TicketId),
}

impl ExecutionError {
    pub fn timeout(operation: &str, budget: Duration) -> Self {
        ExecutionError::Timeout {
            operation: operation.to_string(),
            timeout_ms: budget.as_millis() as u64,
        }
    }

    /// Timeouts and unreachable brokers say nothing about the order itself.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            ExecutionError::Timeout { .. } | ExecutionError::Unreachable(_)
        )
    }
}

/// Failures of the scoring oracle. All of them mean "decide without it".
#[derive(Debug, Error, Clone, PartialEq)]
pub enum OracleError {
    #[error("oracle timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("oracle unavailable: {0}")]
    Unavailable(String),

    #[error("invalid oracle response: {0}")]
    InvalidResponse(String),

    #[error("no oracle configured")]
    Disabled,
}

/// Failures of the market data source.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DataError {
    #[error("{what} for {symbol} timed out after {timeout_ms}ms")]
    Timeout {
        symbol: String,
        what: String,
        timeout_ms: u64,
    },

    #[error("market data unavailable for {symbol}: {reason}")]
    Unavailable { symbol: String, reason: String },

    #[error("unknown symbol {0}")]
    UnknownSymbol(String),
}

/// Reasons the trading loop stops on its own.
#[derive(Debug, Error)]
pub enum LoopError {
    #[error("broker connectivity lost for {consecutive} consecutive cycles")]
    ConnectivityLost { consecutive: u32 },

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("memory error: {0}")]
    Memory(#[from] MemoryError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_reports_budget() {
        let e = ExecutionError::timeout("submit_order", Duration::from_millis(2500));
        assert_eq!(e.to_string(), "submit_order timed out after 2500ms");
        assert!(e.is_connectivity());
    }

    #[test]
    fn rejection_is_not_connectivity() {
        let e = ExecutionError::Rejected {
            operation: "submit_order".into(),
            reason: "market closed".into(),
        };
        assert!(!e.is_connectivity());
        assert!(!ExecutionError::UnknownTicket(TicketId::from(7)).is_connectivity());
    }
}
