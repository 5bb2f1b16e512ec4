//! Bot configuration, loaded from a TOML file.
//!
//! Every section is optional and falls back to its defaults, so a minimal file
//! only names the symbols to trade:
//!
//! ```toml
//! symbols = ["EURUSD", "GBPUSD"]
//! timeframes = ["M15", "H1", "H4"]
//! primary_timeframe = "M15"
//!
//! [risk]
//! risk_fraction = 0.005
//!
//! [oracle]
//! type = "http"
//! url = "http://localhost:8080/score"
//! api_key_env = "OTRADE_ORACLE_KEY"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use otrade_core::analysis::AnalyzerConfig;
use otrade_core::decision::DecisionConfig;
use otrade_core::domain::{ConfigHash, Timeframe};
use otrade_core::lifecycle::{LifecycleConfig, MAX_HOLDING_CEILING_SECS};
use otrade_core::memory::MemoryConfig;
use otrade_core::risk::RiskConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Complete bot configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub symbols: Vec<String>,
    pub timeframes: Vec<Timeframe>,
    pub primary_timeframe: Timeframe,
    /// Seconds between the start of one cycle and the next.
    pub cadence_secs: u64,
    pub analyzer: AnalyzerConfig,
    pub memory: MemoryConfig,
    pub decision: DecisionConfig,
    pub risk: RiskConfig,
    pub lifecycle: LifecycleConfig,
    pub timeouts: TimeoutConfig,
    pub supervision: SupervisionConfig,
    pub oracle: OracleConfig,
    pub journal: JournalConfig,
    pub paper: PaperConfig,
    pub logging: LoggingConfig,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            symbols: vec!["EURUSD".into()],
            timeframes: vec![Timeframe::M15, Timeframe::H1, Timeframe::H4],
            primary_timeframe: Timeframe::M15,
            cadence_secs: 60,
            analyzer: AnalyzerConfig::default(),
            memory: MemoryConfig::default(),
            decision: DecisionConfig::default(),
            risk: RiskConfig::default(),
            lifecycle: LifecycleConfig::default(),
            timeouts: TimeoutConfig::default(),
            supervision: SupervisionConfig::default(),
            oracle: OracleConfig::default(),
            journal: JournalConfig::default(),
            paper: PaperConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Per-collaborator time budgets, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub market_data_ms: u64,
    pub oracle_ms: u64,
    pub execution_ms: u64,
    pub account_ms: u64,
    /// Pattern store load and persist.
    pub storage_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            market_data_ms: 5_000,
            oracle_ms: 3_000,
            execution_ms: 10_000,
            account_ms: 5_000,
            storage_ms: 5_000,
        }
    }
}

impl TimeoutConfig {
    pub fn market_data(&self) -> Duration {
        Duration::from_millis(self.market_data_ms)
    }

    pub fn oracle(&self) -> Duration {
        Duration::from_millis(self.oracle_ms)
    }

    pub fn execution(&self) -> Duration {
        Duration::from_millis(self.execution_ms)
    }

    pub fn account(&self) -> Duration {
        Duration::from_millis(self.account_ms)
    }

    pub fn storage(&self) -> Duration {
        Duration::from_millis(self.storage_ms)
    }
}

/// Failure escalation and restart policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisionConfig {
    /// Consecutive execution errors before a symbol is suspended.
    pub suspension_threshold: u32,
    /// Consecutive cycles without the broker before the loop gives up.
    pub max_connectivity_failures: u32,
    /// Restarts the supervisor attempts before exiting.
    pub max_restarts: u32,
    /// First restart delay; doubles on each further restart.
    pub restart_backoff_secs: u64,
    pub max_backoff_secs: u64,
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            suspension_threshold: 3,
            max_connectivity_failures: 5,
            max_restarts: 5,
            restart_backoff_secs: 5,
            max_backoff_secs: 300,
        }
    }
}

impl SupervisionConfig {
    /// Delay before restart number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let secs = self
            .restart_backoff_secs
            .saturating_mul(factor)
            .min(self.max_backoff_secs);
        Duration::from_secs(secs)
    }
}

/// Which scoring oracle to consult.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OracleConfig {
    /// Decide from rules and memory only.
    #[default]
    None,
    /// POST the market context as JSON to `url`.
    Http {
        url: String,
        /// Environment variable holding a bearer token.
        #[serde(default)]
        api_key_env: Option<String>,
        /// Endpoint asked whether an open position should be closed early.
        #[serde(default)]
        exit_url: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    pub enabled: bool,
    pub dir: PathBuf,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("journal"),
        }
    }
}

/// Paper-trading collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaperConfig {
    pub seed: u64,
    pub initial_equity: f64,
    pub currency: String,
    /// Spread in pips.
    pub spread_pips: f64,
    /// Standard deviation of one-minute price changes, relative to price.
    pub volatility: f64,
    /// Minutes the synthetic market moves per real second.
    pub minutes_per_sec: u64,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            initial_equity: 10_000.0,
            currency: "USD".into(),
            spread_pips: 1.0,
            volatility: 0.0004,
            minutes_per_sec: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set.
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

impl BotConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: BotConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Deterministic digest of the effective configuration.
    ///
    /// Two processes with identical settings log the same hash, whatever the
    /// formatting or key order of their files.
    pub fn config_hash(&self) -> Result<ConfigHash, ConfigError> {
        let json =
            serde_json::to_vec(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;
        Ok(ConfigHash::from_bytes(&json))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.symbols.is_empty() {
            return invalid("at least one symbol is required".into());
        }
        let mut seen = HashSet::new();
        for s in &self.symbols {
            if s.trim().is_empty() {
                return invalid("symbol names must not be empty".into());
            }
            if !seen.insert(s.as_str()) {
                return invalid(format!("duplicate symbol {s}"));
            }
        }
        if self.timeframes.is_empty() {
            return invalid("at least one timeframe is required".into());
        }
        if !self.timeframes.contains(&self.primary_timeframe) {
            return invalid(format!(
                "primary timeframe {} is not among the configured timeframes",
                self.primary_timeframe
            ));
        }
        if self.cadence_secs == 0 {
            return invalid("cadence_secs must be > 0".into());
        }

        let a = &self.analyzer;
        if a.min_bars == 0 || a.lookback < a.min_bars {
            return invalid(format!(
                "analyzer needs 0 < min_bars ({}) <= lookback ({})",
                a.min_bars, a.lookback
            ));
        }

        let m = &self.memory;
        if m.capacity == 0 || m.recall_k == 0 {
            return invalid("memory capacity and recall_k must be > 0".into());
        }
        if !(m.neutral_band >= 0.0) {
            return invalid(format!("memory.neutral_band must be >= 0, got {}", m.neutral_band));
        }

        let d = &self.decision;
        if !(0.0..=1.0).contains(&d.agreement_threshold) {
            return invalid(format!(
                "decision.agreement_threshold must be in [0, 1], got {}",
                d.agreement_threshold
            ));
        }
        if !(1..=3).contains(&d.min_agreeing_signals) {
            return invalid(format!(
                "decision.min_agreeing_signals must be 1, 2 or 3, got {}",
                d.min_agreeing_signals
            ));
        }
        if !(0.0..=1.0).contains(&d.dissent_penalty) {
            return invalid(format!(
                "decision.dissent_penalty must be in [0, 1], got {}",
                d.dissent_penalty
            ));
        }
        if !(0.0..=1.0).contains(&d.exit_regime_confidence)
            || !(0.0..=1.0).contains(&d.exit_opposing_confidence)
        {
            return invalid(format!(
                "decision exit thresholds must be in [0, 1], got {} and {}",
                d.exit_regime_confidence, d.exit_opposing_confidence
            ));
        }

        let r = &self.risk;
        if !(r.risk_fraction > 0.0 && r.risk_fraction < 1.0) {
            return invalid(format!(
                "risk.risk_fraction must be in (0, 1), got {}",
                r.risk_fraction
            ));
        }
        if !(0.0..=1.0).contains(&r.confidence_floor) {
            return invalid(format!(
                "risk.confidence_floor must be in [0, 1], got {}",
                r.confidence_floor
            ));
        }
        if r.max_open_positions == 0 {
            return invalid("risk.max_open_positions must be > 0".into());
        }
        if !(r.stop_atr_multiple > 0.0) || !(r.reward_ratio > 0.0) {
            return invalid("risk.stop_atr_multiple and risk.reward_ratio must be > 0".into());
        }
        if !(r.trailing_distance_atr >= 0.0) || !(r.trailing_activation_atr >= 0.0) {
            return invalid("risk trailing distances must be >= 0".into());
        }

        if let Some(secs) = self.lifecycle.max_holding_secs {
            if secs == 0 || secs > MAX_HOLDING_CEILING_SECS {
                return invalid(format!(
                    "lifecycle.max_holding_secs must be in 1..={MAX_HOLDING_CEILING_SECS}, got {secs}"
                ));
            }
        }

        let t = &self.timeouts;
        if [
            t.market_data_ms,
            t.oracle_ms,
            t.execution_ms,
            t.account_ms,
            t.storage_ms,
        ]
        .contains(&0)
        {
            return invalid("timeouts must be > 0".into());
        }

        let s = &self.supervision;
        if s.suspension_threshold == 0 || s.max_connectivity_failures == 0 {
            return invalid(
                "supervision.suspension_threshold and max_connectivity_failures must be > 0"
                    .into(),
            );
        }

        if let OracleConfig::Http { url, exit_url, .. } = &self.oracle {
            let is_http = |u: &str| u.starts_with("http://") || u.starts_with("https://");
            if !is_http(url) {
                return invalid(format!("oracle.url must be an http(s) URL, got {url}"));
            }
            if let Some(exit_url) = exit_url.as_deref().filter(|u| !is_http(u)) {
                return invalid(format!("oracle.exit_url must be an http(s) URL, got {exit_url}"));
            }
        }

        if !(self.paper.initial_equity > 0.0) {
            return invalid("paper.initial_equity must be > 0".into());
        }
        if !(self.paper.volatility > 0.0) || !(self.paper.spread_pips >= 0.0) {
            return invalid("paper.volatility must be > 0 and spread_pips >= 0".into());
        }

        Ok(())
    }
}
