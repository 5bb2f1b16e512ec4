//! Trade journal (CSV) and session statistics.
//!
//! Each closed trade is appended as one CSV row to
//! `<dir>/trades_<session-start>.csv`, and folded into `SessionStats`.
//!
//! Columns: ticket, symbol, direction, entry_price, exit_price, volume,
//! opened_at, closed_at, holding_secs, realized_return, profit, exit_reason,
//! estimated

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use thiserror::Error;

use otrade_core::domain::ClosedTrade;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal CSV error: {0}")]
    Csv(#[from] csv::Error),
}

const HEADER: [&str; 13] = [
    "ticket",
    "symbol",
    "direction",
    "entry_price",
    "exit_price",
    "volume",
    "opened_at",
    "closed_at",
    "holding_secs",
    "realized_return",
    "profit",
    "exit_reason",
    "estimated",
];

/// Running totals for one trading session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    pub trades: usize,
    pub wins: usize,
    pub losses: usize,
    /// Sum of realized returns.
    pub total_return: f64,
    pub gross_profit: f64,
    pub gross_loss: f64,
    pub best_return: Option<f64>,
    pub worst_return: Option<f64>,
    /// Trades whose close was only confirmed by re-query.
    pub estimated: usize,
}

impl SessionStats {
    pub fn record(&mut self, trade: &ClosedTrade) {
        self.trades += 1;
        if trade.profit > 0.0 {
            self.wins += 1;
            self.gross_profit += trade.profit;
        } else if trade.profit < 0.0 {
            self.losses += 1;
            self.gross_loss += -trade.profit;
        }
        if trade.estimated {
            self.estimated += 1;
        }
        let r = trade.realized_return;
        self.total_return += r;
        self.best_return = Some(self.best_return.map_or(r, |b| b.max(r)));
        self.worst_return = Some(self.worst_return.map_or(r, |w| w.min(r)));
    }

    /// Wins over decided (non-flat) trades.
    pub fn win_rate(&self) -> f64 {
        let decided = self.wins + self.losses;
        if decided == 0 {
            0.0
        } else {
            self.wins as f64 / decided as f64
        }
    }

    /// Gross profit over gross loss. `None` without losses.
    pub fn profit_factor(&self) -> Option<f64> {
        (self.gross_loss > 0.0).then(|| self.gross_profit / self.gross_loss)
    }

    pub fn net_profit(&self) -> f64 {
        self.gross_profit - self.gross_loss
    }

    pub fn log_summary(&self) {
        tracing::info!(
            trades = self.trades,
            wins = self.wins,
            losses = self.losses,
            win_rate = self.win_rate(),
            total_return = self.total_return,
            net_profit = self.net_profit(),
            profit_factor = ?self.profit_factor(),
            best = ?self.best_return,
            worst = ?self.worst_return,
            estimated = self.estimated,
            "session statistics"
        );
    }
}

#[derive(Debug)]
pub struct TradeJournal {
    path: Option<PathBuf>,
    stats: SessionStats,
}

impl TradeJournal {
    /// Journal writing to a new file under `dir`, created if missing.
    pub fn open(dir: &Path, session_start: DateTime<Utc>) -> Result<Self, JournalError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!(
            "trades_{}.csv",
            session_start.format("%Y%m%d_%H%M%S")
        ));
        Ok(Self {
            path: Some(path),
            stats: SessionStats::default(),
        })
    }

    /// Journal that only keeps statistics.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            stats: SessionStats::default(),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Count the trade and append it to the file.
    ///
    /// Statistics are updated even when the write fails.
    pub fn record(&mut self, trade: &ClosedTrade) -> Result<(), JournalError> {
        self.stats.record(trade);
        let Some(path) = &self.path else {
            return Ok(());
        };

        let new_file = !path.exists();
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut wtr = csv::Writer::from_writer(file);
        if new_file {
            wtr.write_record(HEADER)?;
        }
        wtr.write_record(row(trade))?;
        wtr.flush()?;
        Ok(())
    }
}

fn row(t: &ClosedTrade) -> [String; 13] {
    [
        t.ticket_id.0.clone(),
        t.symbol.clone(),
        t.direction.to_string(),
        format!("{:.6}", t.entry_price),
        format!("{:.6}", t.exit_price),
        format!("{:.4}", t.volume),
        t.opened_at.to_rfc3339(),
        t.closed_at.to_rfc3339(),
        t.holding_duration().num_seconds().to_string(),
        format!("{:.6}", t.realized_return),
        format!("{:.2}", t.profit),
        t.exit_reason.to_string(),
        t.estimated.to_string(),
    ]
}
