//! Single-timeframe indicator pipeline and classification rules.

use serde::{Deserialize, Serialize};

use super::state::{KeyLevels, Momentum, StructureFlags, TimeframeState, Trend, Volatility};
use crate::domain::{Bar, Timeframe};
use crate::indicators::sma::sma_of_series;
use crate::indicators::{
    last_valid, value_back, Atr, Bollinger, Indicator, Macd, MacdLine, Rsi, Sma, Stochastic,
    StochasticLine,
};

/// Indicator periods and classification thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndicatorParams {
    pub sma_fast: usize,
    pub sma_slow: usize,
    /// Capped at `bars - 1` when the window is shorter.
    pub sma_long: usize,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    pub rsi_period: usize,
    pub stoch_k: usize,
    pub stoch_d: usize,
    pub bollinger_period: usize,
    pub bollinger_mult: f64,
    pub atr_period: usize,
    /// Bars averaged to get the ATR baseline for volatility classification.
    pub atr_baseline: usize,
    /// Window for support/resistance.
    pub key_level_window: usize,
    pub high_vol_atr_ratio: f64,
    pub low_vol_atr_ratio: f64,
    pub high_bb_width: f64,
    pub low_bb_width: f64,
}

impl Default for IndicatorParams {
    fn default() -> Self {
        Self {
            sma_fast: 20,
            sma_slow: 50,
            sma_long: 200,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            rsi_period: 14,
            stoch_k: 14,
            stoch_d: 3,
            bollinger_period: 20,
            bollinger_mult: 2.0,
            atr_period: 14,
            atr_baseline: 20,
            key_level_window: 50,
            high_vol_atr_ratio: 1.5,
            low_vol_atr_ratio: 0.5,
            high_bb_width: 0.05,
            low_bb_width: 0.02,
        }
    }
}

impl IndicatorParams {
    /// Bars needed for every indicator to have a current and a previous value.
    pub fn required_bars(&self) -> usize {
        let macd = (self.macd_slow + self.macd_signal).saturating_sub(2);
        let stoch = (self.stoch_k + self.stoch_d).saturating_sub(2);
        [
            self.sma_slow.saturating_sub(1),
            macd,
            self.rsi_period,
            stoch,
            self.bollinger_period.saturating_sub(1),
            self.atr_period,
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
            + 2
    }
}

/// Current and previous value of one series.
#[derive(Debug, Clone, Copy)]
struct Pair {
    now: f64,
    prev: f64,
}

impl Pair {
    fn of(series: &[f64], fallback: f64) -> Self {
        Self {
            now: value_back(series, 0).unwrap_or(fallback),
            prev: value_back(series, 1).unwrap_or(fallback),
        }
    }
}

/// Compute the state of one timeframe. `bars` must be non-empty and chronological.
pub fn compute_state(timeframe: Timeframe, bars: &[Bar], p: &IndicatorParams) -> TimeframeState {
    let n = bars.len();
    let last = &bars[n - 1];
    let close = last.close;

    let sma_fast = last_valid(&Sma::new(p.sma_fast).compute(bars)).unwrap_or(close);
    let sma_slow = last_valid(&Sma::new(p.sma_slow).compute(bars)).unwrap_or(sma_fast);
    let long_period = p.sma_long.min(n.saturating_sub(1)).max(1);
    let sma_long = value_back(&Sma::new(long_period).compute(bars), 0);

    let macd_line = Macd::new(p.macd_fast, p.macd_slow, p.macd_signal, MacdLine::Line).compute(bars);
    let macd_signal =
        Macd::new(p.macd_fast, p.macd_slow, p.macd_signal, MacdLine::Signal).compute(bars);
    let macd_hist =
        Macd::new(p.macd_fast, p.macd_slow, p.macd_signal, MacdLine::Histogram).compute(bars);
    let rsi = Rsi::new(p.rsi_period).compute(bars);
    let stoch_k = Stochastic::new(p.stoch_k, p.stoch_d, StochasticLine::K).compute(bars);
    let stoch_d = Stochastic::new(p.stoch_k, p.stoch_d, StochasticLine::D).compute(bars);
    let bb_upper = Bollinger::upper(p.bollinger_period, p.bollinger_mult).compute(bars);
    let bb_lower = Bollinger::lower(p.bollinger_period, p.bollinger_mult).compute(bars);
    let bb_width = Bollinger::width(p.bollinger_period, p.bollinger_mult).compute(bars);
    let atr_series = Atr::new(p.atr_period).compute(bars);

    let rsi_now = value_back(&rsi, 0).unwrap_or(50.0);
    let hist_now = value_back(&macd_hist, 0).unwrap_or(0.0);
    let stoch_now = value_back(&stoch_k, 0).unwrap_or(50.0);

    let trend = classify_trend(close, sma_fast, sma_slow, sma_long);
    let strength = trend_strength(rsi_now, hist_now, &macd_hist);
    let momentum = classify_momentum(rsi_now, hist_now, stoch_now);

    let atr = last_valid(&atr_series).unwrap_or_else(|| last.range());
    let atr_baseline = last_valid(&sma_of_series(&atr_series, p.atr_baseline)).unwrap_or(atr);
    let width = value_back(&bb_width, 0).unwrap_or(f64::NAN);
    let volatility = classify_volatility(atr, atr_baseline, width, p);

    let window = &bars[n.saturating_sub(p.key_level_window)..];
    let levels = KeyLevels {
        support: window.iter().map(|b| b.low).fold(f64::INFINITY, f64::min),
        resistance: window.iter().map(|b| b.high).fold(f64::NEG_INFINITY, f64::max),
        pivot: last.typical_price(),
    };

    let closes = Pair {
        now: close,
        prev: if n >= 2 { bars[n - 2].close } else { close },
    };
    let flags = structure_flags(
        Pair::of(&macd_line, 0.0),
        Pair::of(&macd_signal, 0.0),
        Pair::of(&rsi, 50.0),
        Pair::of(&stoch_k, 50.0),
        Pair::of(&stoch_d, 50.0),
        closes,
        Pair::of(&bb_lower, f64::NEG_INFINITY),
        Pair::of(&bb_upper, f64::INFINITY),
    );

    TimeframeState {
        timeframe,
        trend,
        strength,
        momentum,
        volatility,
        atr,
        close,
        levels,
        flags,
    }
}

/// MA alignment plus price location.
fn classify_trend(close: f64, sma_fast: f64, sma_slow: f64, sma_long: Option<f64>) -> Trend {
    let above_fast = close > sma_fast;
    let above_slow = close > sma_slow;
    let (aligned_bull, aligned_bear) = match sma_long {
        Some(long) => (
            sma_fast > sma_slow && sma_slow > long,
            sma_fast < sma_slow && sma_slow < long,
        ),
        None => (sma_fast > sma_slow, sma_fast < sma_slow),
    };

    if aligned_bull && above_fast && above_slow {
        Trend::StrongBullish
    } else if above_fast && above_slow {
        Trend::Bullish
    } else if aligned_bear && !above_fast && !above_slow {
        Trend::StrongBearish
    } else if !above_fast && !above_slow {
        Trend::Bearish
    } else {
        Trend::Neutral
    }
}

/// Mean of RSI distance from 50 and the histogram relative to its window maximum.
fn trend_strength(rsi: f64, hist: f64, hist_series: &[f64]) -> f64 {
    let rsi_strength = (rsi - 50.0).abs() / 50.0;
    let hist_max = hist_series
        .iter()
        .filter(|v| !v.is_nan())
        .fold(0.0_f64, |m, v| m.max(v.abs()));
    let macd_strength = if hist_max > 0.0 {
        hist.abs() / hist_max
    } else {
        0.0
    };
    ((rsi_strength + macd_strength) / 2.0).clamp(0.0, 1.0)
}

fn classify_momentum(rsi: f64, hist: f64, stoch_k: f64) -> Momentum {
    if rsi > 70.0 && stoch_k > 80.0 {
        Momentum::ExtremelyOverbought
    } else if rsi > 60.0 && hist > 0.0 {
        Momentum::Bullish
    } else if rsi < 30.0 && stoch_k < 20.0 {
        Momentum::ExtremelyOversold
    } else if rsi < 40.0 && hist < 0.0 {
        Momentum::Bearish
    } else {
        Momentum::Neutral
    }
}

fn classify_volatility(atr: f64, baseline: f64, bb_width: f64, p: &IndicatorParams) -> Volatility {
    // NaN comparisons are false, so a missing width falls through to the ATR test
    if atr > baseline * p.high_vol_atr_ratio || bb_width > p.high_bb_width {
        Volatility::High
    } else if atr < baseline * p.low_vol_atr_ratio || bb_width < p.low_bb_width {
        Volatility::Low
    } else {
        Volatility::Normal
    }
}

#[allow(clippy::too_many_arguments)]
fn structure_flags(
    macd: Pair,
    signal: Pair,
    rsi: Pair,
    stoch_k: Pair,
    stoch_d: Pair,
    close: Pair,
    bb_lower: Pair,
    bb_upper: Pair,
) -> StructureFlags {
    StructureFlags {
        macd_cross_up: macd.prev < signal.prev && macd.now > signal.now,
        macd_cross_down: macd.prev > signal.prev && macd.now < signal.now,
        rsi_oversold_exit: rsi.prev < 30.0 && rsi.now >= 30.0,
        rsi_overbought_exit: rsi.prev > 70.0 && rsi.now <= 70.0,
        stoch_cross_up: stoch_k.prev < stoch_d.prev && stoch_k.now > stoch_d.now,
        stoch_cross_down: stoch_k.prev > stoch_d.prev && stoch_k.now < stoch_d.now,
        bb_lower_bounce: close.prev < bb_lower.prev && close.now > bb_lower.now,
        bb_upper_bounce: close.prev > bb_upper.prev && close.now < bb_upper.now,
    }
}
