//! Timeframe weighting and the concatenated market feature vector.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::regime::RegimeAssessment;
use super::state::{TimeframeState, FEATURES_PER_TIMEFRAME};
use crate::domain::Timeframe;

/// How timeframe blocks are weighted in the feature vector and in voting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum TimeframeWeighting {
    /// Every timeframe weighs 1.
    Uniform,
    /// Rank `i` (1-based, ascending duration) of `n` weighs `i / n`.
    LinearByRank,
    /// Explicit weights; timeframes not listed weigh 0.
    Explicit { weights: BTreeMap<Timeframe, f64> },
}

impl Default for TimeframeWeighting {
    fn default() -> Self {
        TimeframeWeighting::LinearByRank
    }
}

impl TimeframeWeighting {
    /// Weights for the given timeframes. Output is keyed and ordered by timeframe.
    pub fn weights(&self, timeframes: &[Timeframe]) -> BTreeMap<Timeframe, f64> {
        let mut sorted: Vec<Timeframe> = timeframes.to_vec();
        sorted.sort();
        sorted.dedup();
        let n = sorted.len() as f64;

        sorted
            .iter()
            .enumerate()
            .map(|(i, tf)| {
                let w = match self {
                    TimeframeWeighting::Uniform => 1.0,
                    TimeframeWeighting::LinearByRank => (i + 1) as f64 / n,
                    TimeframeWeighting::Explicit { weights } => {
                        weights.get(tf).copied().unwrap_or(0.0)
                    }
                };
                (*tf, w)
            })
            .collect()
    }
}

/// Everything downstream needs about one symbol for this cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketView {
    pub symbol: String,
    pub primary: Timeframe,
    pub states: BTreeMap<Timeframe, TimeframeState>,
    pub weights: BTreeMap<Timeframe, f64>,
    /// Weighted blocks of `FEATURES_PER_TIMEFRAME`, ascending timeframe order.
    pub features: Vec<f64>,
    pub regime: RegimeAssessment,
}

impl MarketView {
    /// State of the primary timeframe, falling back to the lowest analyzed one.
    pub fn primary_state(&self) -> Option<&TimeframeState> {
        self.states
            .get(&self.primary)
            .or_else(|| self.states.values().next())
    }

    pub fn weight(&self, tf: Timeframe) -> f64 {
        self.weights.get(&tf).copied().unwrap_or(0.0)
    }
}

/// Concatenate per-timeframe features in ascending timeframe order, each block
/// scaled by its weight.
pub fn feature_vector(
    states: &BTreeMap<Timeframe, TimeframeState>,
    weights: &BTreeMap<Timeframe, f64>,
) -> Vec<f64> {
    let mut out = Vec::with_capacity(states.len() * FEATURES_PER_TIMEFRAME);
    for (tf, state) in states {
        let w = weights.get(tf).copied().unwrap_or(0.0);
        out.extend(state.features().iter().map(|f| f * w));
    }
    out
}
