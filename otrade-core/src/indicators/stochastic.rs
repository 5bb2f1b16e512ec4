//! Stochastic oscillator.
//!
//! %K = 100 * (close - lowest_low(k)) / (highest_high(k) - lowest_low(k))
//! %D = SMA(%K, d)
//! A zero-range window yields 50 (mid-scale).
//! Lookback: k - 1 for %K, k + d - 2 for %D.

use super::sma::sma_of_series;
use super::Indicator;
use crate::domain::Bar;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StochasticLine {
    K,
    D,
}

#[derive(Debug, Clone)]
pub struct Stochastic {
    k_period: usize,
    d_period: usize,
    line: StochasticLine,
    name: String,
}

impl Stochastic {
    pub fn new(k_period: usize, d_period: usize, line: StochasticLine) -> Self {
        assert!(k_period >= 1 && d_period >= 1, "Stochastic periods must be >= 1");
        let label = match line {
            StochasticLine::K => "k",
            StochasticLine::D => "d",
        };
        Self {
            k_period,
            d_period,
            line,
            name: format!("stoch_{label}_{k_period}_{d_period}"),
        }
    }
}

fn percent_k(bars: &[Bar], period: usize) -> Vec<f64> {
    let n = bars.len();
    let mut result = vec![f64::NAN; n];
    if n < period {
        return result;
    }
    for i in (period - 1)..n {
        let window = &bars[i + 1 - period..=i];
        if window.iter().any(|b| b.is_void()) {
            continue;
        }
        let hh = window.iter().map(|b| b.high).fold(f64::NEG_INFINITY, f64::max);
        let ll = window.iter().map(|b| b.low).fold(f64::INFINITY, f64::min);
        let range = hh - ll;
        result[i] = if range > 0.0 {
            100.0 * (bars[i].close - ll) / range
        } else {
            50.0
        };
    }
    result
}

impl Indicator for Stochastic {
    fn name(&self) -> &str {
        &self.name
    }

    fn lookback(&self) -> usize {
        match self.line {
            StochasticLine::K => self.k_period - 1,
            StochasticLine::D => self.k_period + self.d_period - 2,
        }
    }

    fn compute(&self, bars: &[Bar]) -> Vec<f64> {
        let k = percent_k(bars, self.k_period);
        match self.line {
            StochasticLine::K => k,
            StochasticLine::D => sma_of_series(&k, self.d_period),
        }
    }
}
