//! Per-symbol suspension after repeated execution failures.
//!
//! Each symbol counts consecutive execution errors. Reaching the threshold
//! suspends the symbol: the loop stops opening positions on it (open positions
//! are still managed) until an operator calls `clear_suspension`. A success
//! resets the count.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::error::ExecutionError;

#[derive(Debug, Clone, Default, PartialEq)]
struct SymbolHealth {
    consecutive_failures: u32,
    suspended_since: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

/// Suspension state of one symbol, for reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct Suspension {
    pub symbol: String,
    pub since: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Shared between the controller and whoever clears suspensions.
#[derive(Debug)]
pub struct SymbolSuspensions {
    threshold: u32,
    health: Mutex<HashMap<String, SymbolHealth>>,
}

impl SymbolSuspensions {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            health: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SymbolHealth>> {
        // Counters stay meaningful even if a holder panicked
        self.health.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_suspended(&self, symbol: &str) -> bool {
        self.lock()
            .get(symbol)
            .is_some_and(|h| h.suspended_since.is_some())
    }

    pub fn consecutive_failures(&self, symbol: &str) -> u32 {
        self.lock()
            .get(symbol)
            .map_or(0, |h| h.consecutive_failures)
    }

    /// Reset the failure count. Does not lift a suspension.
    pub fn record_success(&self, symbol: &str) {
        if let Some(h) = self.lock().get_mut(symbol) {
            h.consecutive_failures = 0;
        }
    }

    /// Count a failure. Returns true when this failure suspended the symbol.
    pub fn record_failure(&self, symbol: &str, error: &ExecutionError, now: DateTime<Utc>) -> bool {
        let mut health = self.lock();
        let h = health.entry(symbol.to_string()).or_default();
        h.consecutive_failures += 1;
        h.last_error = Some(error.to_string());
        if h.suspended_since.is_none() && h.consecutive_failures >= self.threshold {
            h.suspended_since = Some(now);
            tracing::error!(
                symbol,
                failures = h.consecutive_failures,
                error = %error,
                "symbol suspended after repeated execution errors"
            );
            return true;
        }
        false
    }

    /// Lift a suspension. Returns false if the symbol was not suspended.
    pub fn clear_suspension(&self, symbol: &str) -> bool {
        let mut health = self.lock();
        match health.get_mut(symbol) {
            Some(h) if h.suspended_since.is_some() => {
                *h = SymbolHealth::default();
                tracing::info!(symbol, "suspension cleared");
                true
            }
            _ => false,
        }
    }

    pub fn suspended(&self) -> Vec<Suspension> {
        let mut out: Vec<Suspension> = self
            .lock()
            .iter()
            .filter_map(|(symbol, h)| {
                h.suspended_since.map(|since| Suspension {
                    symbol: symbol.clone(),
                    since,
                    last_error: h.last_error.clone(),
                })
            })
            .collect();
        out.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        out
    }
}
