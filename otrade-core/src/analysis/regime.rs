//! Market regime: a one-word summary of the analyzed timeframes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::state::{TimeframeState, Volatility};
use crate::domain::{Direction, Timeframe};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketRegime {
    TrendingBullish,
    TrendingBearish,
    Volatile,
    Consolidating,
    Ranging,
    Unknown,
}

impl fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MarketRegime::TrendingBullish => "trending_bullish",
            MarketRegime::TrendingBearish => "trending_bearish",
            MarketRegime::Volatile => "volatile",
            MarketRegime::Consolidating => "consolidating",
            MarketRegime::Ranging => "ranging",
            MarketRegime::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegimeAssessment {
    pub regime: MarketRegime,
    pub confidence: f64,
}

impl RegimeAssessment {
    pub fn unknown() -> Self {
        Self {
            regime: MarketRegime::Unknown,
            confidence: 0.0,
        }
    }
}

/// Dominance ratio one side's score needs over the other to call a trend.
const DOMINANCE: f64 = 1.5;
/// Minimum normalized score to call a trend.
const TREND_FLOOR: f64 = 0.3;

/// Classify the regime from weighted bullish/bearish strength and the
/// volatility majority.
pub fn assess_regime(
    states: &BTreeMap<Timeframe, TimeframeState>,
    weights: &BTreeMap<Timeframe, f64>,
) -> RegimeAssessment {
    if states.is_empty() {
        return RegimeAssessment::unknown();
    }

    let mut bullish = 0.0;
    let mut bearish = 0.0;
    let mut total_weight = 0.0;
    for (tf, state) in states {
        let w = weights.get(tf).copied().unwrap_or(0.0);
        total_weight += w;
        match state.trend.direction() {
            Direction::Long => bullish += w * state.strength,
            Direction::Short => bearish += w * state.strength,
            Direction::Flat => {}
        }
    }
    if total_weight <= 0.0 {
        return RegimeAssessment::unknown();
    }
    bullish /= total_weight;
    bearish /= total_weight;

    let half = states.len() as f64 / 2.0;
    let high = states
        .values()
        .filter(|s| s.volatility == Volatility::High)
        .count() as f64;
    let low = states
        .values()
        .filter(|s| s.volatility == Volatility::Low)
        .count() as f64;

    if bullish > bearish * DOMINANCE && bullish > TREND_FLOOR {
        RegimeAssessment {
            regime: MarketRegime::TrendingBullish,
            confidence: bullish.min(1.0),
        }
    } else if bearish > bullish * DOMINANCE && bearish > TREND_FLOOR {
        RegimeAssessment {
            regime: MarketRegime::TrendingBearish,
            confidence: bearish.min(1.0),
        }
    } else if high > half {
        RegimeAssessment {
            regime: MarketRegime::Volatile,
            confidence: 0.6,
        }
    } else if low > half {
        RegimeAssessment {
            regime: MarketRegime::Consolidating,
            confidence: 0.6,
        }
    } else {
        RegimeAssessment {
            regime: MarketRegime::Ranging,
            confidence: 0.5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::state::{KeyLevels, Momentum, StructureFlags, Trend};

    fn state(tf: Timeframe, trend: Trend, strength: f64, volatility: Volatility) -> TimeframeState {
        TimeframeState {
            timeframe: tf,
            trend,
            strength,
            momentum: Momentum::Neutral,
            volatility,
            atr: 1.0,
            close: 100.0,
            levels: KeyLevels {
                support: 90.0,
                resistance: 110.0,
                pivot: 100.0,
            },
            flags: StructureFlags::default(),
        }
    }

    fn uniform(states: &BTreeMap<Timeframe, TimeframeState>) -> BTreeMap<Timeframe, f64> {
        states.keys().map(|tf| (*tf, 1.0)).collect()
    }

    #[test]
    fn empty_is_unknown() {
        let states = BTreeMap::new();
        assert_eq!(assess_regime(&states, &BTreeMap::new()).regime, MarketRegime::Unknown);
    }

    #[test]
    fn aligned_bulls_trend() {
        let mut states = BTreeMap::new();
        for tf in [Timeframe::M15, Timeframe::H1, Timeframe::H4] {
            states.insert(tf, state(tf, Trend::StrongBullish, 0.8, Volatility::Normal));
        }
        let r = assess_regime(&states, &uniform(&states));
        assert_eq!(r.regime, MarketRegime::TrendingBullish);
        assert!((r.confidence - 0.8).abs() < 1e-12);
    }

    #[test]
    fn weak_trend_with_high_volatility_is_volatile() {
        let mut states = BTreeMap::new();
        for tf in [Timeframe::M15, Timeframe::H1, Timeframe::H4] {
            states.insert(tf, state(tf, Trend::Bullish, 0.1, Volatility::High));
        }
        let r = assess_regime(&states, &uniform(&states));
        assert_eq!(r.regime, MarketRegime::Volatile);
    }

    #[test]
    fn mixed_is_ranging() {
        let mut states = BTreeMap::new();
        states.insert(
            Timeframe::H1,
            state(Timeframe::H1, Trend::Bullish, 0.5, Volatility::Normal),
        );
        states.insert(
            Timeframe::H4,
            state(Timeframe::H4, Trend::Bearish, 0.5, Volatility::Low),
        );
        let r = assess_regime(&states, &uniform(&states));
        assert_eq!(r.regime, MarketRegime::Ranging);
    }
}
