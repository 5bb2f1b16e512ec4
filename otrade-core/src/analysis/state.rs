//! Per-timeframe technical state and its numeric projection.

use serde::{Deserialize, Serialize};

use crate::domain::{Direction, Timeframe};

/// Number of features each timeframe contributes to the market feature vector.
pub const FEATURES_PER_TIMEFRAME: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    StrongBearish,
    Bearish,
    Neutral,
    Bullish,
    StrongBullish,
}

impl Trend {
    pub fn value(&self) -> f64 {
        match self {
            Trend::StrongBearish => -1.0,
            Trend::Bearish => -0.5,
            Trend::Neutral => 0.0,
            Trend::Bullish => 0.5,
            Trend::StrongBullish => 1.0,
        }
    }

    pub fn direction(&self) -> Direction {
        Direction::from_score(self.value(), 0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Momentum {
    ExtremelyOversold,
    Bearish,
    Neutral,
    Bullish,
    ExtremelyOverbought,
}

impl Momentum {
    pub fn value(&self) -> f64 {
        match self {
            Momentum::ExtremelyOversold => -1.0,
            Momentum::Bearish => -0.5,
            Momentum::Neutral => 0.0,
            Momentum::Bullish => 0.5,
            Momentum::ExtremelyOverbought => 1.0,
        }
    }

    /// True when momentum points against `direction`.
    pub fn opposes(&self, direction: Direction) -> bool {
        self.value() * direction.sign() < 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Volatility {
    Low,
    Normal,
    High,
}

impl Volatility {
    pub fn value(&self) -> f64 {
        match self {
            Volatility::Low => 0.0,
            Volatility::Normal => 0.5,
            Volatility::High => 1.0,
        }
    }
}

/// Support, resistance and pivot for the analyzed window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KeyLevels {
    pub support: f64,
    pub resistance: f64,
    pub pivot: f64,
}

/// Crossover and bounce events on the last bar.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureFlags {
    pub macd_cross_up: bool,
    pub macd_cross_down: bool,
    pub rsi_oversold_exit: bool,
    pub rsi_overbought_exit: bool,
    pub stoch_cross_up: bool,
    pub stoch_cross_down: bool,
    pub bb_lower_bounce: bool,
    pub bb_upper_bounce: bool,
}

impl StructureFlags {
    fn bullish_count(&self) -> usize {
        [
            self.macd_cross_up,
            self.rsi_oversold_exit,
            self.stoch_cross_up,
            self.bb_lower_bounce,
        ]
        .iter()
        .filter(|f| **f)
        .count()
    }

    fn bearish_count(&self) -> usize {
        [
            self.macd_cross_down,
            self.rsi_overbought_exit,
            self.stoch_cross_down,
            self.bb_upper_bounce,
        ]
        .iter()
        .filter(|f| **f)
        .count()
    }

    /// Net bullish minus bearish events, scaled to `[-1, 1]`.
    pub fn bias(&self) -> f64 {
        (self.bullish_count() as f64 - self.bearish_count() as f64) / 4.0
    }

    /// Names of the raised flags, for rationale tags and logs.
    pub fn names(&self) -> Vec<&'static str> {
        let all = [
            (self.macd_cross_up, "macd_bullish_cross"),
            (self.macd_cross_down, "macd_bearish_cross"),
            (self.rsi_oversold_exit, "rsi_oversold_exit"),
            (self.rsi_overbought_exit, "rsi_overbought_exit"),
            (self.stoch_cross_up, "stoch_bullish_cross"),
            (self.stoch_cross_down, "stoch_bearish_cross"),
            (self.bb_lower_bounce, "bb_lower_bounce"),
            (self.bb_upper_bounce, "bb_upper_bounce"),
        ];
        all.iter().filter(|(f, _)| *f).map(|(_, n)| *n).collect()
    }
}

/// Derived state of one (symbol, timeframe) for the current cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeframeState {
    pub timeframe: Timeframe,
    pub trend: Trend,
    /// Trend strength in `[0, 1]`.
    pub strength: f64,
    pub momentum: Momentum,
    pub volatility: Volatility,
    pub atr: f64,
    pub close: f64,
    pub levels: KeyLevels,
    pub flags: StructureFlags,
}

impl TimeframeState {
    /// Position of the close inside the support/resistance range, in `[-1, 1]`.
    pub fn range_position(&self) -> f64 {
        let span = self.levels.resistance - self.levels.support;
        if !(span > 0.0) {
            return 0.0;
        }
        let pos = (self.close - self.levels.support) / span;
        (2.0 * pos - 1.0).clamp(-1.0, 1.0)
    }

    /// `[trend, strength, momentum, volatility, range_position, structure_bias]`
    pub fn features(&self) -> [f64; FEATURES_PER_TIMEFRAME] {
        [
            self.trend.value(),
            self.strength,
            self.momentum.value(),
            self.volatility.value(),
            self.range_position(),
            self.flags.bias(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> TimeframeState {
        TimeframeState {
            timeframe: Timeframe::H1,
            trend: Trend::Bullish,
            strength: 0.4,
            momentum: Momentum::Neutral,
            volatility: Volatility::Normal,
            atr: 0.001,
            close: 1.1050,
            levels: KeyLevels {
                support: 1.1000,
                resistance: 1.1100,
                pivot: 1.1040,
            },
            flags: StructureFlags::default(),
        }
    }

    #[test]
    fn range_position_midpoint_is_zero() {
        let s = state();
        assert!(s.range_position().abs() < 1e-9);
    }

    #[test]
    fn range_position_degenerate_range() {
        let mut s = state();
        s.levels.resistance = s.levels.support;
        assert_eq!(s.range_position(), 0.0);
    }

    #[test]
    fn features_have_fixed_width_and_bounds() {
        let f = state().features();
        assert_eq!(f.len(), FEATURES_PER_TIMEFRAME);
        assert!(f.iter().all(|v| (-1.0..=1.0).contains(v)));
        assert_eq!(f[0], 0.5);
        assert_eq!(f[3], 0.5);
    }

    #[test]
    fn structure_bias_nets_flags() {
        let flags = StructureFlags {
            macd_cross_up: true,
            stoch_cross_up: true,
            bb_upper_bounce: true,
            ..Default::default()
        };
        assert!((flags.bias() - 0.25).abs() < 1e-12);
        assert_eq!(flags.names().len(), 3);
    }

    #[test]
    fn momentum_opposition() {
        assert!(Momentum::Bearish.opposes(Direction::Long));
        assert!(!Momentum::ExtremelyOverbought.opposes(Direction::Long));
        assert!(Momentum::ExtremelyOverbought.opposes(Direction::Short));
        assert!(!Momentum::Neutral.opposes(Direction::Short));
    }

    #[test]
    fn trend_direction() {
        assert_eq!(Trend::StrongBullish.direction(), Direction::Long);
        assert_eq!(Trend::Bearish.direction(), Direction::Short);
        assert_eq!(Trend::Neutral.direction(), Direction::Flat);
    }
}
