//! Positions, their lifecycle states, and closed-trade records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{Direction, OrderPlan, TicketId, TrailingPolicy};

/// Lifecycle state of a position.
///
/// `Pending` covers only the interval between order submission and broker
/// confirmation. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionState {
    Pending,
    Open,
    Closing,
    Closed,
}

impl PositionState {
    /// Legal transitions. `Closing -> Open` is only used when a close attempt fails.
    pub fn can_transition_to(self, next: PositionState) -> bool {
        use PositionState::*;
        matches!(
            (self, next),
            (Pending, Open) | (Pending, Closed) | (Open, Closing) | (Closing, Open) | (Closing, Closed)
        )
    }

    /// Pending, open and closing positions all count against exposure.
    pub fn is_live(self) -> bool {
        !matches!(self, PositionState::Closed)
    }
}

impl fmt::Display for PositionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PositionState::Pending => "pending",
            PositionState::Open => "open",
            PositionState::Closing => "closing",
            PositionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Why a position was (or is being) closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    MaxHolding,
    /// Raised by an external forced-close source (e.g. margin call).
    Forced,
    /// The broker stopped reporting the position.
    External,
    /// Closed early because the market turned against the position.
    Advised,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::MaxHolding => "max_holding",
            ExitReason::Forced => "forced",
            ExitReason::External => "external",
            ExitReason::Advised => "advised",
        };
        f.write_str(s)
    }
}

/// Trailing-stop bookkeeping carried by an open position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrailingState {
    pub policy: TrailingPolicy,
    /// Most favourable price seen since entry (highest for longs, lowest for shorts).
    pub best_price: f64,
    pub breakeven_done: bool,
    pub activated: bool,
}

impl TrailingState {
    pub fn new(policy: TrailingPolicy, entry_price: f64) -> Self {
        Self {
            policy,
            best_price: entry_price,
            breakeven_done: false,
            activated: false,
        }
    }
}

/// A position owned by the lifecycle manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Assigned by the broker on confirmation; `None` while pending.
    pub ticket_id: Option<TicketId>,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub volume: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub opened_at: DateTime<Utc>,
    pub trailing_state: TrailingState,
    pub state: PositionState,
    /// Market feature vector at entry; becomes the pattern vector on close.
    pub entry_features: Vec<f64>,
}

impl Position {
    /// A pending position for a submitted order.
    pub fn pending(plan: &OrderPlan, entry_features: Vec<f64>, now: DateTime<Utc>) -> Self {
        Self {
            ticket_id: None,
            symbol: plan.symbol.clone(),
            direction: plan.direction,
            entry_price: plan.entry_price,
            volume: plan.volume,
            stop_loss: plan.stop_loss,
            take_profit: plan.take_profit,
            opened_at: now,
            trailing_state: TrailingState::new(plan.trailing_policy, plan.entry_price),
            state: PositionState::Pending,
            entry_features,
        }
    }

    /// Signed price move from entry to `price`, positive when in profit.
    pub fn favourable_move(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.direction.sign()
    }

    /// Fractional return on entry price if closed at `exit_price`.
    pub fn return_at(&self, exit_price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        self.favourable_move(exit_price) / self.entry_price
    }

    /// Price at which this position would be closed against a tick:
    /// bid for longs, ask for shorts.
    pub fn exit_price(&self, bid: f64, ask: f64) -> f64 {
        match self.direction {
            Direction::Short => ask,
            _ => bid,
        }
    }
}

/// Record of a completed round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub ticket_id: TicketId,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub exit_price: f64,
    pub volume: f64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    /// Fractional return on entry price, signed by direction.
    pub realized_return: f64,
    /// Profit in account currency.
    pub profit: f64,
    pub exit_reason: ExitReason,
    pub entry_features: Vec<f64>,
    /// True when the close was confirmed by re-query rather than a broker fill.
    pub estimated: bool,
}

impl ClosedTrade {
    pub fn is_win(&self) -> bool {
        self.profit > 0.0
    }

    pub fn holding_duration(&self) -> chrono::Duration {
        self.closed_at - self.opened_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(direction: Direction) -> OrderPlan {
        OrderPlan {
            symbol: "EURUSD".into(),
            direction,
            volume: 0.1,
            entry_price: 1.1000,
            stop_loss: 1.0950,
            take_profit: 1.1100,
            trailing_policy: TrailingPolicy::disabled(),
            confidence: 0.8,
        }
    }

    #[test]
    fn state_transitions() {
        use PositionState::*;
        assert!(Pending.can_transition_to(Open));
        assert!(Open.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Open));
        assert!(Closing.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Open));
        assert!(!Closed.can_transition_to(Pending));
        assert!(!Open.can_transition_to(Pending));
        assert!(!Open.can_transition_to(Closed));
    }

    #[test]
    fn pending_position_from_plan() {
        let p = Position::pending(&plan(Direction::Long), vec![0.5; 6], Utc::now());
        assert_eq!(p.state, PositionState::Pending);
        assert!(p.ticket_id.is_none());
        assert_eq!(p.trailing_state.best_price, 1.1000);
    }

    #[test]
    fn return_is_signed_by_direction() {
        let long = Position::pending(&plan(Direction::Long), vec![], Utc::now());
        let short = Position::pending(&plan(Direction::Short), vec![], Utc::now());
        assert!(long.return_at(1.1110) > 0.0);
        assert!(short.return_at(1.1110) < 0.0);
        assert!((long.return_at(1.1110) + short.return_at(1.1110)).abs() < 1e-12);
    }

    #[test]
    fn exit_price_uses_correct_side() {
        let long = Position::pending(&plan(Direction::Long), vec![], Utc::now());
        let short = Position::pending(&plan(Direction::Short), vec![], Utc::now());
        assert_eq!(long.exit_price(1.1, 1.2), 1.1);
        assert_eq!(short.exit_price(1.1, 1.2), 1.2);
    }
}
