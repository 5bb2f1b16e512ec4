//! Moving Average Convergence Divergence (MACD).
//!
//! - Line: EMA(close, fast) - EMA(close, slow)
//! - Signal: EMA(line, signal)
//! - Histogram: line - signal
//!
//! Lookback: slow - 1 for the line, slow + signal - 2 for signal and histogram.

use super::ema::ema_of_series;
use super::Indicator;
use crate::domain::Bar;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacdLine {
    Line,
    Signal,
    Histogram,
}

#[derive(Debug, Clone)]
pub struct Macd {
    fast: usize,
    slow: usize,
    signal: usize,
    line: MacdLine,
    name: String,
}

impl Macd {
    pub fn new(fast: usize, slow: usize, signal: usize, line: MacdLine) -> Self {
        assert!(fast >= 1 && signal >= 1, "MACD periods must be >= 1");
        assert!(slow > fast, "MACD slow period must exceed fast period");
        let label = match line {
            MacdLine::Line => "line",
            MacdLine::Signal => "signal",
            MacdLine::Histogram => "hist",
        };
        Self {
            fast,
            slow,
            signal,
            line,
            name: format!("macd_{label}_{fast}_{slow}_{signal}"),
        }
    }

    /// The conventional 12/26/9 configuration.
    pub fn standard(line: MacdLine) -> Self {
        Self::new(12, 26, 9, line)
    }
}

impl Indicator for Macd {
    fn name(&self) -> &str {
        &self.name
    }

    fn lookback(&self) -> usize {
        match self.line {
            MacdLine::Line => self.slow - 1,
            MacdLine::Signal | MacdLine::Histogram => self.slow + self.signal - 2,
        }
    }

    fn compute(&self, bars: &[Bar]) -> Vec<f64> {
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let fast = ema_of_series(&closes, self.fast);
        let slow = ema_of_series(&closes, self.slow);
        // NaN - x stays NaN, so warmup carries through
        let line: Vec<f64> = fast.iter().zip(&slow).map(|(f, s)| f - s).collect();

        match self.line {
            MacdLine::Line => line,
            MacdLine::Signal => ema_of_series(&line, self.signal),
            MacdLine::Histogram => {
                let signal = ema_of_series(&line, self.signal);
                line.iter().zip(&signal).map(|(l, s)| l - s).collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::{assert_approx, make_bars, DEFAULT_EPSILON};

    fn ramp(n: usize) -> Vec<f64> {
        (0..n).map(|i| 100.0 + i as f64).collect()
    }

    #[test]
    fn macd_warmup_matches_lookback() {
        let bars = make_bars(&ramp(40));
        for line in [MacdLine::Line, MacdLine::Signal, MacdLine::Histogram] {
            let macd = Macd::new(3, 6, 4, line);
            let result = macd.compute(&bars);
            let lb = macd.lookback();
            assert!(result[lb - 1].is_nan(), "{line:?} valid before lookback");
            assert!(!result[lb].is_nan(), "{line:?} NaN at lookback");
        }
    }

    #[test]
    fn macd_line_positive_in_uptrend() {
        let bars = make_bars(&ramp(60));
        let result = Macd::standard(MacdLine::Line).compute(&bars);
        assert!(result[59] > 0.0);
    }

    #[test]
    fn macd_histogram_is_line_minus_signal() {
        let closes: Vec<f64> = (0..50).map(|i| 100.0 + (i as f64 * 0.4).sin() * 5.0).collect();
        let bars = make_bars(&closes);
        let line = Macd::new(5, 10, 4, MacdLine::Line).compute(&bars);
        let signal = Macd::new(5, 10, 4, MacdLine::Signal).compute(&bars);
        let hist = Macd::new(5, 10, 4, MacdLine::Histogram).compute(&bars);
        for i in 20..50 {
            assert_approx(hist[i], line[i] - signal[i], DEFAULT_EPSILON);
        }
    }

    #[test]
    fn macd_flat_prices_zero() {
        let bars = make_bars(&[1.1; 40]);
        let hist = Macd::new(3, 6, 4, MacdLine::Histogram).compute(&bars);
        assert_approx(hist[39], 0.0, DEFAULT_EPSILON);
    }

    #[test]
    #[should_panic(expected = "slow period must exceed fast")]
    fn macd_rejects_inverted_periods() {
        let _ = Macd::new(26, 12, 9, MacdLine::Line);
    }
}
