//! ATR risk sizing in broker lots.
//!
//! Risk a fixed fraction of equity per trade, with the stop a multiple of ATR
//! away from entry.
//!
//! # Formula
//! ```text
//! risk_amount   = equity * risk_fraction
//! stop_distance = stop_atr_multiple * ATR
//! stop_pips     = stop_distance / pip_size
//! volume        = risk_amount / (stop_pips * pip_value)
//! ```
//!
//! # Example
//! - Equity: 10,000, risk 1% (100)
//! - ATR: 0.0010, multiple 2x (stop 0.0020 = 20 pips)
//! - Pip value: 10 per lot
//! - Volume: 100 / (20 * 10) = 0.5 lots

use crate::domain::SymbolConstraints;

use super::RiskError;

/// ATR-based risk sizer.
#[derive(Debug, Clone)]
pub struct AtrRiskSizer {
    /// Fraction of equity risked per trade (e.g. 0.01 = 1%).
    risk_fraction: f64,
    /// Stop distance as a multiple of ATR.
    stop_atr_multiple: f64,
}

impl AtrRiskSizer {
    pub fn new(risk_fraction: f64, stop_atr_multiple: f64) -> Self {
        Self {
            risk_fraction,
            stop_atr_multiple,
        }
    }

    pub fn risk_amount(&self, equity: f64) -> f64 {
        if equity <= 0.0 {
            return 0.0;
        }
        equity * self.risk_fraction
    }

    pub fn stop_distance(&self, atr: f64) -> f64 {
        self.stop_atr_multiple * atr
    }

    /// Unrounded volume risking `risk_amount` over `stop_distance`.
    ///
    /// Returns 0.0 when the stop or pip economics are unusable.
    pub fn raw_volume(
        &self,
        risk_amount: f64,
        stop_distance: f64,
        constraints: &SymbolConstraints,
    ) -> f64 {
        if !(stop_distance > 0.0) || !(risk_amount > 0.0) {
            return 0.0;
        }
        let stop_pips = stop_distance / constraints.pip_size;
        let per_lot = stop_pips * constraints.pip_value;
        if !(per_lot > 0.0) {
            return 0.0;
        }
        risk_amount / per_lot
    }
}

/// Absorbs float noise like 0.3 / 0.1 = 2.9999999999999996.
const STEP_TOLERANCE: f64 = 1e-9;

/// Round `raw` down to a whole number of lot steps, capped at `max_lot`.
///
/// Never rounds up. Returns `Ok(None)` when the result falls below `min_lot`
/// and `ConstraintViolation` when the constraints admit no tradable volume.
pub fn round_to_lot_step(
    symbol: &str,
    raw: f64,
    constraints: &SymbolConstraints,
) -> Result<Option<f64>, RiskError> {
    constraints
        .validate()
        .map_err(|reason| RiskError::ConstraintViolation {
            symbol: symbol.to_string(),
            reason,
        })?;
    if !(raw > 0.0) || !raw.is_finite() {
        return Ok(None);
    }

    let step = constraints.lot_step;
    let max_steps = (constraints.max_lot / step + STEP_TOLERANCE).floor();
    if max_steps * step < constraints.min_lot - STEP_TOLERANCE {
        return Err(RiskError::ConstraintViolation {
            symbol: symbol.to_string(),
            reason: format!(
                "no multiple of lot_step {} lies in [{}, {}]",
                step, constraints.min_lot, constraints.max_lot
            ),
        });
    }

    let steps = (raw / step + STEP_TOLERANCE).floor().min(max_steps);
    let volume = quantize(steps * step, step);
    if volume < constraints.min_lot - STEP_TOLERANCE {
        return Ok(None);
    }
    Ok(Some(volume))
}

/// Trim representation noise so `0.1 * 7` prints as 0.7.
fn quantize(volume: f64, step: f64) -> f64 {
    let decimals = (-step.log10()).ceil().clamp(0.0, 12.0) as i32 + 2;
    let scale = 10f64.powi(decimals);
    (volume * scale).round() / scale
}
