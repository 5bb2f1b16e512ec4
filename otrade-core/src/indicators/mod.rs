//! Indicator trait and the concrete indicators used by the analyzer.
//!
//! Indicators are pure functions: bar history in, numeric series out. The
//! analyzer computes each one once per (symbol, timeframe) per cycle and reads
//! the trailing values.
//!
//! Multi-series indicators (MACD, Stochastic, Bollinger) are exposed as
//! separate named instances per line, keeping the single-series `Indicator`
//! trait unchanged.

pub mod atr;
pub mod bollinger;
pub mod ema;
pub mod macd;
pub mod rsi;
pub mod sma;
pub mod stochastic;

pub use atr::Atr;
pub use bollinger::{Bollinger, BollingerBand};
pub use ema::Ema;
pub use macd::{Macd, MacdLine};
pub use rsi::Rsi;
pub use sma::Sma;
pub use stochastic::{Stochastic, StochasticLine};

use crate::domain::Bar;

/// Trait for indicators.
///
/// Indicators take a full bar series and produce a numeric output series of
/// the same length. The first `lookback()` values are `f64::NAN` (warmup).
///
/// # Look-ahead contamination guard
/// No indicator value at bar t may depend on price data from bar t+1 or later.
pub trait Indicator: Send + Sync {
    /// Human-readable name (e.g., "sma_20", "atr_14").
    fn name(&self) -> &str;

    /// Number of bars needed before the indicator produces valid output.
    fn lookback(&self) -> usize;

    /// Compute the indicator for the entire bar series.
    ///
    /// Returns a `Vec<f64>` of the same length as `bars`.
    fn compute(&self, bars: &[Bar]) -> Vec<f64>;
}

/// Last non-NaN value of a series, if any.
pub fn last_valid(series: &[f64]) -> Option<f64> {
    series.iter().rev().copied().find(|v| !v.is_nan())
}

/// Value `back` positions before the end (0 = last), if present and not NaN.
pub fn value_back(series: &[f64], back: usize) -> Option<f64> {
    if back >= series.len() {
        return None;
    }
    let v = series[series.len() - 1 - back];
    (!v.is_nan()).then_some(v)
}

/// Create synthetic bars from close prices for testing.
///
/// Generates plausible OHLV: open = prev_close (or close for first bar),
/// high = max(open,close) + 1.0, low = min(open,close) - 1.0, volume = 1000.
#[cfg(test)]
pub fn make_bars(closes: &[f64]) -> Vec<Bar> {
    make_bars_with_wick(closes, 1.0)
}

/// Like `make_bars` with a configurable wick size, for FX-scale prices.
#[cfg(test)]
pub fn make_bars_with_wick(closes: &[f64], wick: f64) -> Vec<Bar> {
    use crate::domain::Timeframe;
    use chrono::TimeZone;
    let base = chrono::Utc
        .with_ymd_and_hms(2024, 1, 2, 0, 0, 0)
        .single()
        .unwrap();
    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| {
            let open = if i == 0 { close } else { closes[i - 1] };
            Bar {
                timeframe: Timeframe::M15,
                open_time: base + Timeframe::M15.duration() * i as i32,
                open,
                high: open.max(close) + wick,
                low: open.min(close) - wick,
                close,
                volume: 1000.0,
            }
        })
        .collect()
}

/// Assert two f64 values are approximately equal (within epsilon).
#[cfg(test)]
pub fn assert_approx(actual: f64, expected: f64, epsilon: f64) {
    assert!(
        (actual - expected).abs() < epsilon,
        "assert_approx failed: actual={actual}, expected={expected}, diff={}, epsilon={epsilon}",
        (actual - expected).abs()
    );
}

/// Default epsilon for indicator tests.
#[cfg(test)]
pub const DEFAULT_EPSILON: f64 = 1e-10;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_valid_skips_trailing_nan() {
        assert_eq!(last_valid(&[1.0, 2.0, f64::NAN]), Some(2.0));
        assert_eq!(last_valid(&[f64::NAN]), None);
        assert_eq!(last_valid(&[]), None);
    }

    #[test]
    fn value_back_indexes_from_end() {
        let s = [1.0, 2.0, 3.0];
        assert_eq!(value_back(&s, 0), Some(3.0));
        assert_eq!(value_back(&s, 2), Some(1.0));
        assert_eq!(value_back(&s, 3), None);
        assert_eq!(value_back(&[f64::NAN, 1.0], 1), None);
    }

    #[test]
    fn make_bars_are_chronological_and_sane() {
        let bars = make_bars(&[10.0, 11.0, 9.0]);
        assert!(crate::domain::is_chronological(&bars));
        assert!(bars.iter().all(|b| b.is_sane()));
    }
}
