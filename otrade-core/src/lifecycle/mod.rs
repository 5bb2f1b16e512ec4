//! Position lifecycle: entry confirmation, trailing stops, exits, reconciliation.
//!
//! The manager owns every live position, at most one per symbol. Each position
//! moves through `Pending -> Open -> Closing -> Closed`; `Closing -> Open` is
//! taken only when a close attempt fails. A closed position leaves the book,
//! so re-entering a symbol always creates a new `Position`.

pub mod ratchet;

pub use ratchet::RatchetState;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

use crate::domain::{
    ClosedTrade, Direction, ExitReason, OrderPlan, Position, PositionState, Tick, TicketId,
};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LifecycleError {
    #[error("{symbol} already has a live position")]
    AlreadyOpen { symbol: String },

    #[error("no position for {symbol}")]
    NotFound { symbol: String },

    #[error("{symbol}: cannot move from {from} to {to}")]
    InvalidTransition {
        symbol: String,
        from: PositionState,
        to: PositionState,
    },
}

/// Lifecycle settings (the `[lifecycle]` config section).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Close positions held longer than this. `None` disables the limit.
    pub max_holding_secs: Option<u64>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_holding_secs: Some(24 * 60 * 60),
        }
    }
}

/// Largest holding limit a config may ask for: ten years.
pub const MAX_HOLDING_CEILING_SECS: u64 = 10 * 365 * 24 * 60 * 60;

impl LifecycleConfig {
    /// The holding limit as a duration. `None` when disabled, and when the
    /// value does not fit a `Duration`.
    pub fn max_holding(&self) -> Option<Duration> {
        self.max_holding_secs
            .and_then(|s| i64::try_from(s).ok())
            .and_then(Duration::try_seconds)
    }
}

/// What the controller should do for a position this cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LifecycleAction {
    UpdateStop {
        symbol: String,
        ticket_id: TicketId,
        stop_loss: f64,
    },
    Close {
        symbol: String,
        ticket_id: TicketId,
        reason: ExitReason,
    },
}

impl LifecycleAction {
    pub fn symbol(&self) -> &str {
        match self {
            LifecycleAction::UpdateStop { symbol, .. } | LifecycleAction::Close { symbol, .. } => {
                symbol
            }
        }
    }
}

/// Result of a completed close.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CloseFill {
    pub exit_price: f64,
    /// Profit in account currency.
    pub profit: f64,
    /// Confirmed by re-query instead of a broker fill.
    pub estimated: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PositionLifecycleManager {
    config: LifecycleConfig,
    positions: BTreeMap<String, Position>,
    exit_reasons: BTreeMap<String, ExitReason>,
}

impl PositionLifecycleManager {
    pub fn new(config: LifecycleConfig) -> Self {
        Self {
            config,
            positions: BTreeMap::new(),
            exit_reasons: BTreeMap::new(),
        }
    }

    pub fn get(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    /// Copy of the book, for exposure checks.
    pub fn book(&self) -> Vec<Position> {
        self.positions.values().cloned().collect()
    }

    pub fn live_count(&self) -> usize {
        self.positions.values().filter(|p| p.state.is_live()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    fn position_mut(&mut self, symbol: &str) -> Result<&mut Position, LifecycleError> {
        self.positions
            .get_mut(symbol)
            .ok_or_else(|| LifecycleError::NotFound {
                symbol: symbol.to_string(),
            })
    }

    fn transition(
        &mut self,
        symbol: &str,
        to: PositionState,
    ) -> Result<&mut Position, LifecycleError> {
        let position = self.position_mut(symbol)?;
        if !position.state.can_transition_to(to) {
            return Err(LifecycleError::InvalidTransition {
                symbol: symbol.to_string(),
                from: position.state,
                to,
            });
        }
        tracing::debug!(symbol, from = %position.state, to = %to, "position transition");
        position.state = to;
        Ok(position)
    }

    /// Register a pending position for an order about to be submitted.
    pub fn begin_entry(
        &mut self,
        plan: &OrderPlan,
        entry_features: Vec<f64>,
        now: DateTime<Utc>,
    ) -> Result<&Position, LifecycleError> {
        if self.positions.contains_key(&plan.symbol) {
            return Err(LifecycleError::AlreadyOpen {
                symbol: plan.symbol.clone(),
            });
        }
        let position = Position::pending(plan, entry_features, now);
        Ok(self.positions.entry(plan.symbol.clone()).or_insert(position))
    }

    /// The broker confirmed the order. A differing fill price moves the entry,
    /// keeping the planned stop and target levels.
    pub fn confirm_entry(
        &mut self,
        symbol: &str,
        ticket_id: TicketId,
        fill_price: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<&Position, LifecycleError> {
        let position = self.transition(symbol, PositionState::Open)?;
        position.ticket_id = Some(ticket_id);
        position.opened_at = now;
        if let Some(price) = fill_price.filter(|p| p.is_finite() && *p > 0.0) {
            position.entry_price = price;
            position.trailing_state.best_price = price;
        }
        Ok(position)
    }

    /// The order never landed; drop the pending position.
    pub fn abandon_entry(&mut self, symbol: &str) -> Result<Position, LifecycleError> {
        self.transition(symbol, PositionState::Closed)?;
        self.positions
            .remove(symbol)
            .ok_or_else(|| LifecycleError::NotFound {
                symbol: symbol.to_string(),
            })
    }

    /// Start closing an open position outside `track` (shutdown, manual).
    pub fn request_close(
        &mut self,
        symbol: &str,
        reason: ExitReason,
    ) -> Result<LifecycleAction, LifecycleError> {
        let position = self.transition(symbol, PositionState::Closing)?;
        let action = close_action(position, reason);
        self.exit_reasons.insert(symbol.to_string(), reason);
        Ok(action)
    }

    /// Evaluate every open position against the latest ticks.
    ///
    /// Positions that hit an exit move to `Closing` and yield a `Close`;
    /// trailing stops that tighten yield an `UpdateStop`. Pending and closing
    /// positions are left alone.
    pub fn track(
        &mut self,
        ticks: &BTreeMap<String, Tick>,
        forced: &HashSet<TicketId>,
        now: DateTime<Utc>,
    ) -> Vec<LifecycleAction> {
        let max_holding = self.config.max_holding();
        let mut actions = Vec::new();

        for (symbol, position) in self.positions.iter_mut() {
            if position.state != PositionState::Open {
                continue;
            }
            let Some(ticket) = position.ticket_id.clone() else {
                continue;
            };
            let price = ticks
                .get(symbol)
                .map(|t| position.exit_price(t.bid, t.ask))
                .filter(|p| p.is_finite() && *p > 0.0);

            let exit = exit_reason(position, &ticket, price, forced, max_holding, now);

            if let Some(reason) = exit {
                position.state = PositionState::Closing;
                self.exit_reasons.insert(symbol.clone(), reason);
                tracing::debug!(symbol = %symbol, %reason, "exit triggered");
                actions.push(close_action(position, reason));
                continue;
            }

            if let Some(stop_loss) = price.and_then(|p| advance_trailing(position, p)) {
                actions.push(LifecycleAction::UpdateStop {
                    symbol: symbol.clone(),
                    ticket_id: ticket,
                    stop_loss,
                });
            }
        }
        actions
    }

    /// A close attempt failed; the position is open again.
    pub fn close_failed(&mut self, symbol: &str) -> Result<(), LifecycleError> {
        self.transition(symbol, PositionState::Open)?;
        self.exit_reasons.remove(symbol);
        Ok(())
    }

    /// The close landed. Removes the position and returns its trade record.
    pub fn complete_close(
        &mut self,
        symbol: &str,
        fill: CloseFill,
        now: DateTime<Utc>,
    ) -> Result<ClosedTrade, LifecycleError> {
        self.transition(symbol, PositionState::Closed)?;
        let reason = self
            .exit_reasons
            .remove(symbol)
            .unwrap_or(ExitReason::External);
        let position = self
            .positions
            .remove(symbol)
            .ok_or_else(|| LifecycleError::NotFound {
                symbol: symbol.to_string(),
            })?;
        Ok(closed_trade(position, fill, reason, now))
    }

    /// Close out positions the broker no longer reports.
    ///
    /// Open or closing positions whose ticket is missing from
    /// `broker_tickets` are closed at the current tick (entry if no tick),
    /// with an estimated return. `profit_of(position, exit_price)` prices the
    /// exit in account currency.
    pub fn reconcile<F>(
        &mut self,
        broker_tickets: &HashSet<TicketId>,
        ticks: &BTreeMap<String, Tick>,
        now: DateTime<Utc>,
        profit_of: F,
    ) -> Vec<ClosedTrade>
    where
        F: Fn(&Position, f64) -> f64,
    {
        let gone: Vec<String> = self
            .positions
            .iter()
            .filter(|(_, p)| matches!(p.state, PositionState::Open | PositionState::Closing))
            .filter(|(_, p)| {
                p.ticket_id
                    .as_ref()
                    .is_some_and(|t| !broker_tickets.contains(t))
            })
            .map(|(s, _)| s.clone())
            .collect();

        let mut closed = Vec::with_capacity(gone.len());
        for symbol in gone {
            let Some(mut position) = self.positions.remove(&symbol) else {
                continue;
            };
            let reason = self
                .exit_reasons
                .remove(&symbol)
                .unwrap_or(ExitReason::External);
            let exit_price = ticks
                .get(&symbol)
                .map(|t| position.exit_price(t.bid, t.ask))
                .unwrap_or(position.entry_price);
            let profit = profit_of(&position, exit_price);
            position.state = PositionState::Closed;
            tracing::info!(symbol = %symbol, %reason, "position no longer reported by broker");
            closed.push(closed_trade(
                position,
                CloseFill {
                    exit_price,
                    profit,
                    estimated: true,
                },
                reason,
                now,
            ));
        }
        closed
    }
}

fn close_action(position: &Position, reason: ExitReason) -> LifecycleAction {
    LifecycleAction::Close {
        symbol: position.symbol.clone(),
        ticket_id: position.ticket_id.clone().unwrap_or_else(|| TicketId::new("")),
        reason,
    }
}

fn closed_trade(
    position: Position,
    fill: CloseFill,
    exit_reason: ExitReason,
    now: DateTime<Utc>,
) -> ClosedTrade {
    ClosedTrade {
        ticket_id: position.ticket_id.clone().unwrap_or_else(|| TicketId::new("")),
        realized_return: position.return_at(fill.exit_price),
        symbol: position.symbol,
        direction: position.direction,
        entry_price: position.entry_price,
        exit_price: fill.exit_price,
        volume: position.volume,
        opened_at: position.opened_at,
        closed_at: now,
        profit: fill.profit,
        exit_reason,
        entry_features: position.entry_features,
        estimated: fill.estimated,
    }
}

fn exit_reason(
    position: &Position,
    ticket: &TicketId,
    price: Option<f64>,
    forced: &HashSet<TicketId>,
    max_holding: Option<Duration>,
    now: DateTime<Utc>,
) -> Option<ExitReason> {
    if forced.contains(ticket) {
        Some(ExitReason::Forced)
    } else if price.is_some_and(|p| stop_hit(position, p)) {
        Some(ExitReason::StopLoss)
    } else if price.is_some_and(|p| target_hit(position, p)) {
        Some(ExitReason::TakeProfit)
    } else if max_holding.is_some_and(|max| now - position.opened_at >= max) {
        Some(ExitReason::MaxHolding)
    } else {
        None
    }
}

fn stop_hit(position: &Position, price: f64) -> bool {
    match position.direction {
        Direction::Long => price <= position.stop_loss,
        Direction::Short => price >= position.stop_loss,
        Direction::Flat => false,
    }
}

fn target_hit(position: &Position, price: f64) -> bool {
    if !(position.take_profit.is_finite() && position.take_profit > 0.0) {
        return false;
    }
    match position.direction {
        Direction::Long => price >= position.take_profit,
        Direction::Short => price <= position.take_profit,
        Direction::Flat => false,
    }
}

/// Update the best price and return the new stop if the trail tightened it.
fn advance_trailing(position: &mut Position, price: f64) -> Option<f64> {
    let direction = position.direction;
    let entry = position.entry_price;
    let ts = &mut position.trailing_state;
    ts.best_price = match direction {
        Direction::Long => ts.best_price.max(price),
        Direction::Short => ts.best_price.min(price),
        Direction::Flat => return None,
    };
    if !ts.policy.is_enabled() {
        return None;
    }
    let sign = direction.sign();
    if (ts.best_price - entry) * sign < ts.policy.activation_distance {
        return None;
    }
    ts.activated = true;

    let trail = ts.best_price - sign * ts.policy.trail_distance;
    let proposal = if ts.policy.breakeven_first && !ts.breakeven_done {
        ts.breakeven_done = true;
        match direction {
            Direction::Short => trail.min(entry),
            _ => trail.max(entry),
        }
    } else {
        trail
    };

    let mut ratchet = RatchetState::with_initial_level(direction, position.stop_loss);
    if !ratchet.tightens(proposal) {
        return None;
    }
    let stop = ratchet.apply(proposal)?;
    position.stop_loss = stop;
    Some(stop)
}
