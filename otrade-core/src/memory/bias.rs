//! Per-symbol track record learned from closed trades.
//!
//! The win rate is an exponential average that starts at even odds and moves
//! a tenth of the way toward each decided outcome; neutral outcomes leave it
//! alone. The average return is a plain running mean over every trade.

use serde::{Deserialize, Serialize};

use super::OutcomeLabel;

/// Step of the win-rate average per decided trade.
const WIN_RATE_STEP: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolBias {
    pub trades: u64,
    pub win_rate: f64,
    pub average_return: f64,
}

impl Default for SymbolBias {
    fn default() -> Self {
        Self {
            trades: 0,
            win_rate: 0.5,
            average_return: 0.0,
        }
    }
}

impl SymbolBias {
    pub fn record(&mut self, outcome: OutcomeLabel, realized_return: f64) {
        self.trades += 1;
        if realized_return.is_finite() {
            self.average_return += (realized_return - self.average_return) / self.trades as f64;
        }
        self.win_rate = match outcome {
            OutcomeLabel::Win => self.win_rate + (1.0 - self.win_rate) * WIN_RATE_STEP,
            OutcomeLabel::Loss => self.win_rate * (1.0 - WIN_RATE_STEP),
            OutcomeLabel::Neutral => self.win_rate,
        };
    }

    /// Factor in `(0.5, 1]` applied to a decision's confidence: a symbol
    /// with a poor record trades with less conviction, a good one is not
    /// boosted. `None` until `min_trades` trades were seen.
    pub fn confidence_factor(&self, min_trades: u64) -> Option<f64> {
        if min_trades == 0 || self.trades < min_trades {
            return None;
        }
        Some((0.5 + self.win_rate).clamp(0.5, 1.0))
    }
}
