//! Multi-timeframe analysis.
//!
//! Turns raw bar series into a per-timeframe `TimeframeState` and, from those,
//! a `MarketView`: the weighted feature vector consumed by pattern memory and
//! the decision synthesizer, plus the market regime.
//!
//! Analysis is pure. Identical bars always produce identical states, which
//! keeps pattern-memory feature vectors reproducible.

pub mod compute;
pub mod features;
pub mod regime;
pub mod state;

pub use compute::{compute_state, IndicatorParams};
pub use features::{feature_vector, MarketView, TimeframeWeighting};
pub use regime::{assess_regime, MarketRegime, RegimeAssessment};
pub use state::{
    KeyLevels, Momentum, StructureFlags, TimeframeState, Trend, Volatility, FEATURES_PER_TIMEFRAME,
};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::domain::{is_chronological, Bar, Timeframe};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AnalysisError {
    #[error("insufficient data for {symbol} {timeframe}: need {required} bars, have {available}")]
    InsufficientData {
        symbol: String,
        timeframe: Timeframe,
        required: usize,
        available: usize,
    },

    #[error("bars for {symbol} {timeframe} are not in chronological order")]
    Unordered { symbol: String, timeframe: Timeframe },

    #[error("invalid bar for {symbol} {timeframe} at index {index}")]
    InvalidBar {
        symbol: String,
        timeframe: Timeframe,
        index: usize,
    },
}

/// Analyzer settings (the `[analyzer]` config section).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Minimum bars per timeframe; fewer is `InsufficientData`.
    pub min_bars: usize,
    /// Only the most recent `lookback` bars are analyzed.
    pub lookback: usize,
    pub weighting: TimeframeWeighting,
    pub indicators: IndicatorParams,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            min_bars: 60,
            lookback: 300,
            weighting: TimeframeWeighting::default(),
            indicators: IndicatorParams::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MultiTimeframeAnalyzer {
    timeframes: Vec<Timeframe>,
    primary: Timeframe,
    config: AnalyzerConfig,
    weights: BTreeMap<Timeframe, f64>,
}

impl MultiTimeframeAnalyzer {
    pub fn new(timeframes: &[Timeframe], primary: Timeframe, config: AnalyzerConfig) -> Self {
        let mut timeframes = timeframes.to_vec();
        timeframes.sort();
        timeframes.dedup();
        let weights = config.weighting.weights(&timeframes);
        Self {
            timeframes,
            primary,
            config,
            weights,
        }
    }

    pub fn timeframes(&self) -> &[Timeframe] {
        &self.timeframes
    }

    pub fn primary(&self) -> Timeframe {
        self.primary
    }

    pub fn weights(&self) -> &BTreeMap<Timeframe, f64> {
        &self.weights
    }

    /// Bars to request per timeframe from the market data source.
    pub fn bars_needed(&self) -> usize {
        self.config.lookback.max(self.config.min_bars)
    }

    /// Width of the feature vectors produced by `market_view`.
    pub fn feature_width(&self) -> usize {
        self.timeframes.len() * FEATURES_PER_TIMEFRAME
    }

    /// Analyze every configured timeframe for `symbol`.
    ///
    /// Extra timeframes in the input are ignored.
    pub fn analyze(
        &self,
        symbol: &str,
        bars_by_timeframe: &BTreeMap<Timeframe, Vec<Bar>>,
    ) -> Result<BTreeMap<Timeframe, TimeframeState>, AnalysisError> {
        let required = self.config.min_bars.max(1);
        let mut states = BTreeMap::new();

        for &tf in &self.timeframes {
            let bars = bars_by_timeframe.get(&tf).map(Vec::as_slice).unwrap_or(&[]);
            if bars.len() < required {
                return Err(AnalysisError::InsufficientData {
                    symbol: symbol.to_string(),
                    timeframe: tf,
                    required,
                    available: bars.len(),
                });
            }

            let window = &bars[bars.len().saturating_sub(self.config.lookback.max(required))..];
            if !is_chronological(window) {
                return Err(AnalysisError::Unordered {
                    symbol: symbol.to_string(),
                    timeframe: tf,
                });
            }
            if let Some(index) = window.iter().position(|b| !b.is_sane()) {
                return Err(AnalysisError::InvalidBar {
                    symbol: symbol.to_string(),
                    timeframe: tf,
                    index,
                });
            }

            states.insert(tf, compute_state(tf, window, &self.config.indicators));
        }

        Ok(states)
    }

    /// Build the weighted feature vector and regime from analyzed states.
    pub fn market_view(
        &self,
        symbol: &str,
        states: BTreeMap<Timeframe, TimeframeState>,
    ) -> MarketView {
        let features = feature_vector(&states, &self.weights);
        let regime = assess_regime(&states, &self.weights);
        MarketView {
            symbol: symbol.to_string(),
            primary: self.primary,
            weights: self.weights.clone(),
            states,
            features,
            regime,
        }
    }
}
