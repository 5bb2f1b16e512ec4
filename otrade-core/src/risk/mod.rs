//! Risk management: decisions become bounded orders, or no trade at all.
//!
//! `RiskManager::evaluate` returns either an `OrderPlan` or the `NoTrade`
//! reason. Stops come from volatility (ATR), never from confidence. Volume is
//! floored to the broker's lot step and capped at its maximum; it is never
//! rounded up.

pub mod guard;
pub mod sizing;

pub use guard::{GuardConfig, RiskGuard};
pub use sizing::{round_to_lot_step, AtrRiskSizer};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analysis::MarketView;
use crate::domain::{
    AccountState, Decision, Direction, OrderPlan, Position, SymbolConstraints, Tick,
    TrailingPolicy,
};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RiskError {
    #[error("constraint violation for {symbol}: {reason}")]
    ConstraintViolation { symbol: String, reason: String },
}

/// Why a decision did not become an order.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum NoTrade {
    #[error("decision is flat")]
    Flat,

    #[error("confidence {confidence:.3} below floor {floor:.3}")]
    BelowConfidenceFloor { confidence: f64, floor: f64 },

    #[error("{symbol} already has a live position")]
    AlreadyOpen { symbol: String },

    #[error("open exposure {open} at maximum {max}")]
    MaxExposure { open: usize, max: usize },

    #[error("blocked by trade guard: {0}")]
    GuardBlocked(String),

    #[error("account equity {0} is not positive")]
    NoEquity(f64),

    #[error("no usable volatility for sizing")]
    NoVolatility,

    #[error("invalid quote: bid {bid}, ask {ask}")]
    InvalidQuote { bid: f64, ask: f64 },

    #[error(transparent)]
    Constraint(#[from] RiskError),

    #[error("volume {raw:.6} rounds below minimum lot {min_lot}")]
    SizeTooSmall { raw: f64, min_lot: f64 },
}

/// Risk settings (the `[risk]` config section).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Fraction of equity risked per trade.
    pub risk_fraction: f64,
    /// Minimum decision confidence to trade.
    pub confidence_floor: f64,
    /// Maximum live positions across all symbols.
    pub max_open_positions: usize,
    pub stop_atr_multiple: f64,
    /// Take-profit distance as a multiple of the stop distance.
    pub reward_ratio: f64,
    /// Favourable move, in ATR, before trailing starts.
    pub trailing_activation_atr: f64,
    /// Trail distance in ATR. Zero disables trailing.
    pub trailing_distance_atr: f64,
    pub breakeven_first: bool,
    pub guard: GuardConfig,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            risk_fraction: 0.01,
            confidence_floor: 0.6,
            max_open_positions: 3,
            stop_atr_multiple: 2.0,
            reward_ratio: 2.0,
            trailing_activation_atr: 1.0,
            trailing_distance_atr: 1.5,
            breakeven_first: true,
            guard: GuardConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RiskManager {
    config: RiskConfig,
    sizer: AtrRiskSizer,
    guard: RiskGuard,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Self {
        let sizer = AtrRiskSizer::new(config.risk_fraction, config.stop_atr_multiple);
        let guard = RiskGuard::new(config.guard.clone());
        Self {
            config,
            sizer,
            guard,
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn guard(&self) -> &RiskGuard {
        &self.guard
    }

    pub fn guard_mut(&mut self) -> &mut RiskGuard {
        &mut self.guard
    }

    /// Turn `decision` into an order plan, or explain why not.
    #[allow(clippy::too_many_arguments)]
    pub fn evaluate(
        &self,
        decision: &Decision,
        view: &MarketView,
        tick: &Tick,
        account: &AccountState,
        open_positions: &[Position],
        constraints: &SymbolConstraints,
        now: DateTime<Utc>,
    ) -> Result<OrderPlan, NoTrade> {
        if decision.direction.is_flat() {
            return Err(NoTrade::Flat);
        }
        if !(decision.confidence >= self.config.confidence_floor) {
            return Err(NoTrade::BelowConfidenceFloor {
                confidence: decision.confidence,
                floor: self.config.confidence_floor,
            });
        }

        let live: Vec<&Position> = open_positions.iter().filter(|p| p.state.is_live()).collect();
        if live.iter().any(|p| p.symbol == decision.symbol) {
            return Err(NoTrade::AlreadyOpen {
                symbol: decision.symbol.clone(),
            });
        }
        if live.len() >= self.config.max_open_positions {
            return Err(NoTrade::MaxExposure {
                open: live.len(),
                max: self.config.max_open_positions,
            });
        }
        self.guard.check(now).map_err(NoTrade::GuardBlocked)?;

        if !(account.equity > 0.0) {
            return Err(NoTrade::NoEquity(account.equity));
        }
        if !(tick.bid > 0.0 && tick.ask >= tick.bid) {
            return Err(NoTrade::InvalidQuote {
                bid: tick.bid,
                ask: tick.ask,
            });
        }
        constraints
            .validate()
            .map_err(|reason| RiskError::ConstraintViolation {
                symbol: decision.symbol.clone(),
                reason,
            })?;

        let atr = view
            .primary_state()
            .map(|s| s.atr)
            .filter(|a| a.is_finite() && *a > 0.0)
            .ok_or(NoTrade::NoVolatility)?;

        let risk_amount = self.sizer.risk_amount(account.equity) * self.guard.risk_scale(now);
        let stop_distance = self.sizer.stop_distance(atr);
        let raw = self.sizer.raw_volume(risk_amount, stop_distance, constraints);
        let volume = round_to_lot_step(&decision.symbol, raw, constraints)?.ok_or(
            NoTrade::SizeTooSmall {
                raw,
                min_lot: constraints.min_lot,
            },
        )?;

        let sign = decision.direction.sign();
        let entry_price = match decision.direction {
            Direction::Short => tick.bid,
            _ => tick.ask,
        };
        let trailing_policy = if self.config.trailing_distance_atr > 0.0 {
            TrailingPolicy {
                activation_distance: atr * self.config.trailing_activation_atr,
                trail_distance: atr * self.config.trailing_distance_atr,
                breakeven_first: self.config.breakeven_first,
            }
        } else {
            TrailingPolicy::disabled()
        };

        Ok(OrderPlan {
            symbol: decision.symbol.clone(),
            direction: decision.direction,
            volume,
            entry_price,
            stop_loss: entry_price - sign * stop_distance,
            take_profit: entry_price + sign * stop_distance * self.config.reward_ratio,
            trailing_policy,
            confidence: decision.confidence,
        })
    }

    /// `evaluate` without the reason.
    #[allow(clippy::too_many_arguments)]
    pub fn size(
        &self,
        decision: &Decision,
        view: &MarketView,
        tick: &Tick,
        account: &AccountState,
        open_positions: &[Position],
        constraints: &SymbolConstraints,
        now: DateTime<Utc>,
    ) -> Option<OrderPlan> {
        self.evaluate(decision, view, tick, account, open_positions, constraints, now)
            .ok()
    }
}
