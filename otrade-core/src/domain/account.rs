use serde::{Deserialize, Serialize};

/// Snapshot of the trading account as reported by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountState {
    pub equity: f64,
    pub balance: f64,
    pub margin: f64,
    pub free_margin: f64,
    pub currency: String,
}

impl AccountState {
    /// Account with no open exposure: equity = balance = free margin.
    pub fn flat(equity: f64, currency: impl Into<String>) -> Self {
        Self {
            equity,
            balance: equity,
            margin: 0.0,
            free_margin: equity,
            currency: currency.into(),
        }
    }
}

/// Broker-declared lot constraints and pip economics for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolConstraints {
    pub min_lot: f64,
    pub max_lot: f64,
    pub lot_step: f64,
    /// Price distance of one pip (e.g. 0.0001 for EURUSD).
    pub pip_size: f64,
    /// Account-currency value of one pip for one lot.
    pub pip_value: f64,
}

impl SymbolConstraints {
    /// Checks the constraints are usable for sizing.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.lot_step > 0.0) {
            return Err(format!("lot_step must be > 0, got {}", self.lot_step));
        }
        if !(self.min_lot > 0.0) {
            return Err(format!("min_lot must be > 0, got {}", self.min_lot));
        }
        if !(self.max_lot >= self.min_lot) {
            return Err(format!(
                "max_lot ({}) must be >= min_lot ({})",
                self.max_lot, self.min_lot
            ));
        }
        if !(self.pip_size > 0.0) || !(self.pip_value > 0.0) {
            return Err(format!(
                "pip_size and pip_value must be > 0, got {} / {}",
                self.pip_size, self.pip_value
            ));
        }
        Ok(())
    }

    /// Profit in account currency for a price move of `price_delta` on `volume` lots.
    pub fn profit_for(&self, price_delta: f64, volume: f64) -> f64 {
        price_delta / self.pip_size * self.pip_value * volume
    }

    /// Standard major FX pair: 0.01..100 lots, 0.01 step, 4-digit pip worth 10 per lot.
    pub fn fx_major() -> Self {
        Self {
            min_lot: 0.01,
            max_lot: 100.0,
            lot_step: 0.01,
            pip_size: 0.0001,
            pip_value: 10.0,
        }
    }
}
