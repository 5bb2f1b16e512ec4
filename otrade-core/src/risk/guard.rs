//! Daily trade guard: trade count, day P/L and loss streak.
//!
//! Counters belong to one UTC day. Reads for a later day see a fresh day; the
//! next mutation rolls the counters over.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Entries allowed per UTC day.
    pub max_daily_trades: u32,
    /// Consecutive losses that stop trading for the rest of the day.
    pub max_consecutive_losses: u32,
    /// Consecutive losses after which risk per trade is halved.
    pub loss_streak_throttle: u32,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_daily_trades: 10,
            max_consecutive_losses: 5,
            loss_streak_throttle: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskGuard {
    config: GuardConfig,
    day: Option<NaiveDate>,
    trades_today: u32,
    pnl_today: f64,
    loss_streak: u32,
}

impl RiskGuard {
    pub fn new(config: GuardConfig) -> Self {
        Self {
            config,
            day: None,
            trades_today: 0,
            pnl_today: 0.0,
            loss_streak: 0,
        }
    }

    fn is_today(&self, now: DateTime<Utc>) -> bool {
        self.day == Some(now.date_naive())
    }

    fn roll(&mut self, now: DateTime<Utc>) {
        if !self.is_today(now) {
            self.day = Some(now.date_naive());
            self.trades_today = 0;
            self.pnl_today = 0.0;
            self.loss_streak = 0;
        }
    }

    pub fn trades_today(&self, now: DateTime<Utc>) -> u32 {
        if self.is_today(now) {
            self.trades_today
        } else {
            0
        }
    }

    pub fn pnl_today(&self, now: DateTime<Utc>) -> f64 {
        if self.is_today(now) {
            self.pnl_today
        } else {
            0.0
        }
    }

    pub fn loss_streak(&self, now: DateTime<Utc>) -> u32 {
        if self.is_today(now) {
            self.loss_streak
        } else {
            0
        }
    }

    /// `Err` with the reason when no new entry is allowed.
    pub fn check(&self, now: DateTime<Utc>) -> Result<(), String> {
        let trades = self.trades_today(now);
        if trades >= self.config.max_daily_trades {
            return Err(format!(
                "daily trade limit reached ({trades}/{})",
                self.config.max_daily_trades
            ));
        }
        let streak = self.loss_streak(now);
        if streak >= self.config.max_consecutive_losses {
            return Err(format!("{streak} consecutive losses"));
        }
        Ok(())
    }

    /// Multiplier on the per-trade risk amount: halved on a losing streak,
    /// three quarters while the day is in loss.
    pub fn risk_scale(&self, now: DateTime<Utc>) -> f64 {
        let mut scale = 1.0;
        if self.config.loss_streak_throttle > 0
            && self.loss_streak(now) >= self.config.loss_streak_throttle
        {
            scale *= 0.5;
        }
        if self.pnl_today(now) < 0.0 {
            scale *= 0.75;
        }
        scale
    }

    pub fn record_entry(&mut self, now: DateTime<Utc>) {
        self.roll(now);
        self.trades_today += 1;
    }

    pub fn record_close(&mut self, profit: f64, now: DateTime<Utc>) {
        self.roll(now);
        self.pnl_today += profit;
        if profit < 0.0 {
            self.loss_streak += 1;
        } else if profit > 0.0 {
            self.loss_streak = 0;
        }
    }
}
