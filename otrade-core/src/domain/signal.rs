//! Trade direction, decisions and order plans.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Direction of a decision or position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
    Flat,
}

impl Direction {
    /// +1 for long, -1 for short, 0 for flat.
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
            Direction::Flat => 0.0,
        }
    }

    pub fn is_flat(&self) -> bool {
        matches!(self, Direction::Flat)
    }

    pub fn opposite(&self) -> Direction {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
            Direction::Flat => Direction::Flat,
        }
    }

    /// Direction of a signed score; values inside `[-dead_zone, dead_zone]` are flat.
    pub fn from_score(score: f64, dead_zone: f64) -> Direction {
        if score > dead_zone {
            Direction::Long
        } else if score < -dead_zone {
            Direction::Short
        } else {
            Direction::Flat
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Direction::Long => "long",
            Direction::Short => "short",
            Direction::Flat => "flat",
        };
        f.write_str(s)
    }
}

/// One cycle's verdict for a symbol. Consumed immediately by the risk manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub symbol: String,
    pub direction: Direction,
    /// Conviction in `[0, 1]`. Always 0 for a flat decision.
    pub confidence: f64,
    pub rationale_tags: Vec<String>,
}

impl Decision {
    pub fn flat(symbol: impl Into<String>, rationale_tags: Vec<String>) -> Self {
        Self {
            symbol: symbol.into(),
            direction: Direction::Flat,
            confidence: 0.0,
            rationale_tags,
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.rationale_tags.iter().any(|t| t == tag)
    }
}

/// Trailing-stop parameters attached to an order, expressed as price distances.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrailingPolicy {
    /// Favourable excursion from entry before trailing starts.
    pub activation_distance: f64,
    /// Distance kept between the best price seen and the stop.
    pub trail_distance: f64,
    /// Move the stop to entry once activated, before trailing.
    pub breakeven_first: bool,
}

impl TrailingPolicy {
    /// A policy that never moves the stop.
    pub fn disabled() -> Self {
        Self {
            activation_distance: f64::INFINITY,
            trail_distance: 0.0,
            breakeven_first: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.activation_distance.is_finite() && self.trail_distance > 0.0
    }
}

/// A sized, bounded order ready for the execution bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPlan {
    pub symbol: String,
    pub direction: Direction,
    pub volume: f64,
    /// Reference price used for sizing (ask for longs, bid for shorts).
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub trailing_policy: TrailingPolicy,
    pub confidence: f64,
}

impl OrderPlan {
    pub fn stop_distance(&self) -> f64 {
        (self.entry_price - self.stop_loss).abs()
    }
}
