/// Ratchet invariant enforcement
///
/// **Core Rule:** Stops may tighten, never loosen (even if ATR expands).
///
/// This prevents the "volatility trap" where a wider trail distance would
/// loosen the stop after a favourable move.
use crate::domain::Direction;

/// Ratchet state for stop-loss management
///
/// Enforces the invariant that stops can only move in the favorable direction:
/// - Long positions: stop can only rise (tighten)
/// - Short positions: stop can only fall (tighten)
#[derive(Debug, Clone, PartialEq)]
pub struct RatchetState {
    /// Current stop level (high-water mark for longs, low-water mark for shorts)
    current_level: Option<f64>,

    direction: Direction,
}

impl RatchetState {
    pub fn new(direction: Direction) -> Self {
        Self {
            current_level: None,
            direction,
        }
    }

    /// Create a ratchet with an initial level
    pub fn with_initial_level(direction: Direction, initial_level: f64) -> Self {
        Self {
            current_level: Some(initial_level),
            direction,
        }
    }

    /// Apply ratchet to a proposed stop level
    ///
    /// Returns the ratcheted level (can only tighten, never loosen).
    ///
    /// # Rules
    /// - Long positions: stop can only rise (max of current and proposed)
    /// - Short positions: stop can only fall (min of current and proposed)
    /// - Flat or non-finite proposals leave the level unchanged
    /// - If no current level exists, initializes to proposed level
    ///
    /// # Example
    /// ```
    /// use otrade_core::domain::Direction;
    /// use otrade_core::lifecycle::RatchetState;
    ///
    /// let mut ratchet = RatchetState::with_initial_level(Direction::Long, 1.0950);
    ///
    /// // Tightening: 1.0950 -> 1.1000 (allowed)
    /// assert_eq!(ratchet.apply(1.1000), Some(1.1000));
    ///
    /// // Loosening: 1.1000 -> 1.0900 (blocked)
    /// assert_eq!(ratchet.apply(1.0900), Some(1.1000));
    /// ```
    pub fn apply(&mut self, proposed: f64) -> Option<f64> {
        if !proposed.is_finite() {
            return self.current_level;
        }
        let next = match self.current_level {
            None => proposed,
            Some(current) => match self.direction {
                Direction::Long => current.max(proposed),
                Direction::Short => current.min(proposed),
                Direction::Flat => current,
            },
        };
        self.current_level = Some(next);
        self.current_level
    }

    /// Get current ratchet level (if set)
    pub fn current_level(&self) -> Option<f64> {
        self.current_level
    }

    /// True when `candidate` is strictly tighter than the current level.
    pub fn tightens(&self, candidate: f64) -> bool {
        match (self.current_level, self.direction) {
            (None, _) => candidate.is_finite(),
            (Some(current), Direction::Long) => candidate > current,
            (Some(current), Direction::Short) => candidate < current,
            (Some(_), Direction::Flat) => false,
        }
    }
}
