//! Bars and ticks: the market data consumed by the analyzer and the lifecycle manager.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Timeframe;

/// OHLCV bar for one symbol on one timeframe.
///
/// Immutable once closed. A series for a (symbol, timeframe) pair is ordered
/// by `open_time`, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timeframe: Timeframe,
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    /// Returns true if any OHLC field is NaN.
    pub fn is_void(&self) -> bool {
        self.open.is_nan() || self.high.is_nan() || self.low.is_nan() || self.close.is_nan()
    }

    /// Basic OHLC sanity check: high >= low, high >= open/close, low <= open/close.
    pub fn is_sane(&self) -> bool {
        if self.is_void() {
            return false;
        }
        self.high >= self.low
            && self.high >= self.open
            && self.high >= self.close
            && self.low <= self.open
            && self.low <= self.close
            && self.open > 0.0
            && self.close > 0.0
    }

    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    /// Typical price (high + low + close) / 3, used as the pivot level.
    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }
}

/// Current quote for a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub bid: f64,
    pub ask: f64,
    pub time: DateTime<Utc>,
}

impl Tick {
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    pub fn spread(&self) -> f64 {
        self.ask - self.bid
    }
}

/// Returns true if `bars` is strictly ordered by `open_time`.
pub fn is_chronological(bars: &[Bar]) -> bool {
    bars.windows(2).all(|w| w[0].open_time < w[1].open_time)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_bar() -> Bar {
        Bar {
            timeframe: Timeframe::H1,
            open_time: Utc.with_ymd_and_hms(2024, 1, 2, 10, 0, 0).unwrap(),
            open: 1.1000,
            high: 1.1050,
            low: 1.0980,
            close: 1.1030,
            volume: 1_250.0,
        }
    }

    #[test]
    fn bar_is_sane() {
        assert!(sample_bar().is_sane());
    }

    #[test]
    fn bar_detects_void() {
        let mut bar = sample_bar();
        bar.open = f64::NAN;
        assert!(bar.is_void());
        assert!(!bar.is_sane());
    }

    #[test]
    fn bar_detects_insane_high_low() {
        let mut bar = sample_bar();
        bar.high = 1.0970; // below low
        assert!(!bar.is_sane());
    }

    #[test]
    fn chronological_check() {
        let a = sample_bar();
        let mut b = sample_bar();
        b.open_time = a.open_time + chrono::Duration::hours(1);
        assert!(is_chronological(&[a.clone(), b.clone()]));
        assert!(!is_chronological(&[b, a.clone()]));
        assert!(!is_chronological(&[a.clone(), a]));
    }

    #[test]
    fn tick_mid_and_spread() {
        let tick = Tick {
            bid: 1.1000,
            ask: 1.1002,
            time: Utc::now(),
        };
        assert!((tick.mid() - 1.1001).abs() < 1e-12);
        assert!((tick.spread() - 0.0002).abs() < 1e-12);
    }
}
