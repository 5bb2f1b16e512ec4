//! Decision synthesis: rules, pattern memory and an external oracle combined
//! into one conservative verdict per symbol.
//!
//! Three signals vote:
//! - **rules**: the weighted trend vote across analyzed timeframes,
//! - **memory**: similarity-weighted outcomes of recalled patterns,
//! - **oracle**: an injected scorer, absent when it failed or timed out.
//!
//! A direction wins only when enough signals back it with enough conviction.
//! The resulting confidence never exceeds the weakest supporting signal, and
//! a symbol with a poor learned record scales it down further.
//!
//! The same market view also drives advised exits: an open position is closed
//! early when the regime flips against it or the rule vote turns on it.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::analysis::{MarketRegime, MarketView};
use crate::domain::{Decision, Direction};
use crate::memory::{RecallHit, SymbolBias};

/// Direction and confidence reported by a scoring oracle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OracleScore {
    pub direction: Direction,
    pub confidence: f64,
}

/// Synthesizer settings (the `[decision]` config section).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    /// Minimum confidence for a signal to count as agreeing.
    pub agreement_threshold: f64,
    /// Agreeing signals needed for a non-flat decision.
    pub min_agreeing_signals: usize,
    /// Scales how much the strongest dissenting signal cuts confidence.
    pub dissent_penalty: f64,
    /// Recalled patterns needed before memory casts a vote.
    pub min_memory_hits: usize,
    /// Closed trades on a symbol before its learned record scales confidence.
    pub bias_min_trades: u64,
    /// Close open positions early when the market turns against them.
    pub advised_exits: bool,
    /// Regime confidence above which an opposing regime advises an exit.
    pub exit_regime_confidence: f64,
    /// Opposing rule-vote confidence above which an exit is advised.
    pub exit_opposing_confidence: f64,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            agreement_threshold: 0.6,
            min_agreeing_signals: 2,
            dissent_penalty: 0.5,
            min_memory_hits: 3,
            bias_min_trades: 10,
            advised_exits: true,
            exit_regime_confidence: 0.7,
            exit_opposing_confidence: 0.6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalSource {
    Rules,
    Memory,
    Oracle,
}

impl fmt::Display for SignalSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SignalSource::Rules => "rules",
            SignalSource::Memory => "memory",
            SignalSource::Oracle => "oracle",
        };
        f.write_str(s)
    }
}

/// One signal's opinion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalVote {
    pub source: SignalSource,
    pub direction: Direction,
    pub confidence: f64,
}

impl SignalVote {
    fn tag(&self) -> String {
        format!("{}_{}:{:.2}", self.source, self.direction, self.confidence)
    }
}

/// Weighted trend vote. Each timeframe agrees fully with the net direction
/// when its trend matches, half when momentum pushes the other way.
pub fn rule_signal(view: &MarketView) -> Option<SignalVote> {
    let mut net = 0.0;
    let mut total = 0.0;
    for (tf, state) in &view.states {
        let w = view.weight(*tf);
        net += w * state.trend.direction().sign();
        total += w;
    }
    if !(total > 0.0) {
        return None;
    }
    let direction = Direction::from_score(net / total, 0.0);
    if direction.is_flat() {
        return Some(SignalVote {
            source: SignalSource::Rules,
            direction,
            confidence: 0.0,
        });
    }

    let agreement: f64 = view
        .states
        .iter()
        .filter(|(_, s)| s.trend.direction() == direction)
        .map(|(tf, s)| {
            let w = view.weight(*tf);
            if s.momentum.opposes(direction) {
                w * 0.5
            } else {
                w
            }
        })
        .sum();

    Some(SignalVote {
        source: SignalSource::Rules,
        direction,
        confidence: (agreement / total).clamp(0.0, 1.0),
    })
}

/// Similarity-weighted average of past outcomes, each signed by the direction
/// that was traded. Needs `min_hits` positively similar patterns.
pub fn memory_signal(recalled: &[RecallHit], min_hits: usize) -> Option<SignalVote> {
    let usable: Vec<&RecallHit> = recalled
        .iter()
        .filter(|h| h.similarity > 0.0 && !h.record.direction.is_flat())
        .collect();
    if usable.is_empty() || usable.len() < min_hits {
        return None;
    }
    let weight: f64 = usable.iter().map(|h| h.similarity).sum();
    let score: f64 = usable
        .iter()
        .map(|h| h.similarity * h.record.outcome_label.score() * h.record.direction.sign())
        .sum::<f64>()
        / weight;

    Some(SignalVote {
        source: SignalSource::Memory,
        direction: Direction::from_score(score, 0.0),
        confidence: score.abs().min(1.0),
    })
}

#[derive(Debug, Clone)]
pub struct DecisionSynthesizer {
    config: DecisionConfig,
}

impl DecisionSynthesizer {
    pub fn new(config: DecisionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DecisionConfig {
        &self.config
    }

    /// Combine the three signals into a decision for `view.symbol`.
    ///
    /// `external` is `None` when the oracle failed or timed out; the decision
    /// is then made from rules and memory alone.
    pub fn decide(
        &self,
        view: &MarketView,
        recalled: &[RecallHit],
        external: Option<OracleScore>,
    ) -> Decision {
        self.decide_with_bias(view, recalled, external, None)
    }

    /// `decide`, with the symbol's learned record applied to the confidence
    /// once it covers `bias_min_trades` trades.
    pub fn decide_with_bias(
        &self,
        view: &MarketView,
        recalled: &[RecallHit],
        external: Option<OracleScore>,
        bias: Option<&SymbolBias>,
    ) -> Decision {
        let mut tags = vec![format!("regime_{}", view.regime.regime)];
        let mut votes = Vec::with_capacity(3);

        match rule_signal(view) {
            Some(v) => votes.push(v),
            None => tags.push("rules_unavailable".into()),
        }
        match memory_signal(recalled, self.config.min_memory_hits) {
            Some(v) => votes.push(v),
            None => tags.push(format!("memory_insufficient:{}", recalled.len())),
        }
        match external {
            Some(score) => votes.push(SignalVote {
                source: SignalSource::Oracle,
                direction: score.direction,
                confidence: if score.confidence.is_finite() {
                    score.confidence.clamp(0.0, 1.0)
                } else {
                    0.0
                },
            }),
            None => tags.push("oracle_unavailable".into()),
        }
        tags.extend(votes.iter().map(SignalVote::tag));

        let required = self.config.min_agreeing_signals.max(1);
        let supporters = |dir: Direction| -> Vec<&SignalVote> {
            votes
                .iter()
                .filter(|v| v.direction == dir && v.confidence >= self.config.agreement_threshold)
                .collect()
        };
        let long = supporters(Direction::Long);
        let short = supporters(Direction::Short);

        let (direction, backing) = match (long.len() >= required, short.len() >= required) {
            (true, false) => (Direction::Long, long),
            (false, true) => (Direction::Short, short),
            (true, true) => {
                tags.push("flat_conflict".into());
                return Decision::flat(&view.symbol, tags);
            }
            (false, false) => {
                tags.push(format!(
                    "flat_no_agreement:{}/{}",
                    long.len().max(short.len()),
                    required
                ));
                return Decision::flat(&view.symbol, tags);
            }
        };

        let weakest = backing
            .iter()
            .map(|v| v.confidence)
            .fold(f64::INFINITY, f64::min);
        let dissent = votes
            .iter()
            .filter(|v| v.direction == direction.opposite())
            .map(|v| v.confidence)
            .fold(0.0, f64::max);
        if dissent > 0.0 {
            tags.push(format!("dissent:{dissent:.2}"));
        }
        let penalty = (1.0 - self.config.dissent_penalty.clamp(0.0, 1.0) * dissent).max(0.0);
        let mut confidence = (weakest * penalty).clamp(0.0, weakest);

        if let Some(bias) = bias {
            if let Some(factor) = bias.confidence_factor(self.config.bias_min_trades) {
                tags.push(format!("symbol_bias:{:.2}/{}", bias.win_rate, bias.trades));
                confidence *= factor;
            }
        }

        Decision {
            symbol: view.symbol.clone(),
            direction,
            confidence,
            rationale_tags: tags,
        }
    }

    /// Reason to close a `direction` position now, from a fresh view of its
    /// symbol. `None` keeps the position.
    pub fn exit_advice(&self, direction: Direction, view: &MarketView) -> Option<String> {
        if !self.config.advised_exits {
            return None;
        }
        let against = match direction {
            Direction::Long => MarketRegime::TrendingBearish,
            Direction::Short => MarketRegime::TrendingBullish,
            Direction::Flat => return None,
        };
        if view.regime.regime == against
            && view.regime.confidence > self.config.exit_regime_confidence
        {
            return Some(format!("regime_{}:{:.2}", against, view.regime.confidence));
        }
        rule_signal(view)
            .filter(|v| {
                v.direction == direction.opposite()
                    && v.confidence > self.config.exit_opposing_confidence
            })
            .map(|v| format!("opposing_{}", v.tag()))
    }
}

impl Default for DecisionSynthesizer {
    fn default() -> Self {
        Self::new(DecisionConfig::default())
    }
}
