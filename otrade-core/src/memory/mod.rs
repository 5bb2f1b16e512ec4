//! Pattern memory: learned state→outcome records with similarity recall.
//!
//! A nearest-neighbour memory. Each closed trade becomes a `PatternRecord`
//! holding the market feature vector at entry, the trade direction and its
//! outcome. Recall ranks stored records by similarity to the current vector.
//!
//! Recall is split into a read-only `query` and a mutating `mark_matched` so
//! that many readers can query concurrently while match bookkeeping goes
//! through the single writer.

pub mod bias;
pub mod similarity;
pub mod store;

pub use bias::SymbolBias;
pub use similarity::SimilarityMetric;
pub use store::{InMemoryStore, JsonFileStore, MemorySnapshot, PatternStore, StoreLease};

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use thiserror::Error;

use crate::domain::{ClosedTrade, Direction, PatternId};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MemoryError {
    #[error("pattern store unavailable ({store}): {reason}")]
    StorageUnavailable { store: String, reason: String },

    #[error("pattern store {store} is corrupt: {reason}")]
    Corrupt { store: String, reason: String },

    #[error("unsupported memory schema version {found} (max supported: {supported})")]
    UnsupportedSchema { found: u32, supported: u32 },

    #[error("memory was never loaded; refusing to overwrite the store")]
    NotLoaded,
}

/// Outcome class of a closed trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeLabel {
    Win,
    Loss,
    Neutral,
}

impl OutcomeLabel {
    /// Returns within `[-neutral_band, neutral_band]` are neutral.
    pub fn from_return(realized_return: f64, neutral_band: f64) -> Self {
        if realized_return > neutral_band {
            OutcomeLabel::Win
        } else if realized_return < -neutral_band {
            OutcomeLabel::Loss
        } else {
            OutcomeLabel::Neutral
        }
    }

    /// +1 win, -1 loss, 0 neutral.
    pub fn score(&self) -> f64 {
        match self {
            OutcomeLabel::Win => 1.0,
            OutcomeLabel::Loss => -1.0,
            OutcomeLabel::Neutral => 0.0,
        }
    }
}

/// One learned observation. Owned exclusively by `PatternMemory`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternRecord {
    pub id: PatternId,
    pub feature_vector: Vec<f64>,
    pub direction: Direction,
    pub outcome_label: OutcomeLabel,
    pub realized_return: f64,
    pub created_at: DateTime<Utc>,
    pub last_matched_at: Option<DateTime<Utc>>,
    pub match_count: u64,
    pub symbol: String,
    /// Insertion sequence, the last tie-breaker for ordering and eviction.
    pub seq: u64,
}

/// A recalled record and its similarity to the query vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecallHit {
    pub record: PatternRecord,
    pub similarity: f64,
}

/// Input to `learn`.
#[derive(Debug, Clone, PartialEq)]
pub struct LearnSample {
    pub features: Vec<f64>,
    pub direction: Direction,
    pub outcome: OutcomeLabel,
    pub realized_return: f64,
    pub symbol: String,
}

impl LearnSample {
    pub fn from_trade(trade: &ClosedTrade, neutral_band: f64) -> Self {
        Self {
            features: trade.entry_features.clone(),
            direction: trade.direction,
            outcome: OutcomeLabel::from_return(trade.realized_return, neutral_band),
            realized_return: trade.realized_return,
            symbol: trade.symbol.clone(),
        }
    }
}

/// Memory settings (the `[memory]` config section).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Location of the JSON store.
    pub path: PathBuf,
    pub capacity: usize,
    pub recall_k: usize,
    pub metric: SimilarityMetric,
    /// Hits below this similarity are dropped.
    pub min_similarity: Option<f64>,
    /// Absolute return below which an outcome is neutral.
    pub neutral_band: f64,
    /// Scan with rayon once the memory holds this many records.
    pub parallel_threshold: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/pattern_memory.json"),
            capacity: 10_000,
            recall_k: 10,
            metric: SimilarityMetric::Cosine,
            min_similarity: None,
            neutral_band: 0.0005,
            parallel_threshold: 2_048,
        }
    }
}

/// Aggregate view of what the memory has learned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningSummary {
    pub total: usize,
    pub wins: usize,
    pub losses: usize,
    pub neutral: usize,
    pub win_rate: f64,
    pub average_return: f64,
    pub most_matched: Option<(PatternId, u64)>,
}

/// A pattern predictor: anything that can recall by similarity and learn
/// from outcomes. Nearest-neighbour memory is the shipped implementation; a
/// trained model can stand in without changing callers.
pub trait PatternPredictor: Send + Sync {
    /// Up to `k` hits ordered by non-increasing similarity. Read-only.
    fn query(&self, features: &[f64], k: usize) -> Vec<RecallHit>;

    /// Record that these patterns were recalled at `now`.
    fn mark_matched(&mut self, ids: &[PatternId], now: DateTime<Utc>);

    fn learn(&mut self, sample: LearnSample, now: DateTime<Utc>) -> PatternRecord;

    fn records(&self) -> &[PatternRecord];

    fn replace_records(&mut self, records: Vec<PatternRecord>);

    fn len(&self) -> usize {
        self.records().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct PatternMemory {
    config: MemoryConfig,
    records: Vec<PatternRecord>,
    next_seq: u64,
    loaded: bool,
    biases: BTreeMap<String, SymbolBias>,
    /// Outcomes learned before the first load, replayed onto the stored
    /// biases when it happens.
    unsynced: Vec<(String, OutcomeLabel, f64)>,
}

/// Ranking: similarity desc, then newest `created_at`, then newest insertion.
fn rank(a: &RecallHit, b: &RecallHit) -> Ordering {
    b.similarity
        .partial_cmp(&a.similarity)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.record.created_at.cmp(&a.record.created_at))
        .then_with(|| b.record.seq.cmp(&a.record.seq))
}

impl PatternMemory {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            records: Vec::new(),
            next_seq: 0,
            loaded: false,
            biases: BTreeMap::new(),
            unsynced: Vec::new(),
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// True once a `load` has succeeded.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Learned track record of `symbol`; `None` if it never closed a trade.
    pub fn symbol_bias(&self, symbol: &str) -> Option<&SymbolBias> {
        self.biases.get(symbol)
    }

    pub fn get(&self, id: &PatternId) -> Option<&PatternRecord> {
        self.records.iter().find(|r| &r.id == id)
    }

    /// Query and mark in one step.
    pub fn recall(&mut self, features: &[f64], k: usize, now: DateTime<Utc>) -> Vec<RecallHit> {
        let mut hits = self.query(features, k);
        let ids: Vec<PatternId> = hits.iter().map(|h| h.record.id.clone()).collect();
        self.mark_matched(&ids, now);
        for hit in &mut hits {
            if let Some(r) = self.get(&hit.record.id) {
                hit.record = r.clone();
            }
        }
        hits
    }

    /// Victim for eviction: lowest `match_count`, then oldest `created_at`,
    /// then oldest insertion. `protect` is never chosen.
    fn eviction_victim(&self, protect: Option<u64>) -> Option<usize> {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, r)| Some(r.seq) != protect)
            .min_by(|(_, a), (_, b)| {
                a.match_count
                    .cmp(&b.match_count)
                    .then_with(|| a.created_at.cmp(&b.created_at))
                    .then_with(|| a.seq.cmp(&b.seq))
            })
            .map(|(i, _)| i)
    }

    fn enforce_capacity(&mut self, protect: Option<u64>) {
        while self.records.len() > self.config.capacity {
            let Some(idx) = self.eviction_victim(protect) else {
                break;
            };
            let evicted = self.records.remove(idx);
            tracing::debug!(
                id = %evicted.id,
                match_count = evicted.match_count,
                "evicted pattern record"
            );
        }
    }

    /// Copy of the current contents for persisting outside any lock.
    pub fn snapshot(&self, now: DateTime<Utc>) -> MemorySnapshot {
        MemorySnapshot::new(self.records.clone(), now).with_biases(self.biases.clone())
    }

    /// Load records from `store`, keeping any learned before the load.
    ///
    /// Returns the number of records held afterwards.
    pub fn load(&mut self, store: &dyn PatternStore) -> Result<usize, MemoryError> {
        let (stored, biases) = store
            .load()?
            .map(|s| (s.records, s.symbol_biases))
            .unwrap_or_default();
        let loaded_count = stored.len();
        if self.loaded {
            // Already in sync: local records include everything stored
            for (symbol, bias) in biases {
                self.biases.entry(symbol).or_insert(bias);
            }
        } else {
            self.biases = biases;
        }
        for (symbol, outcome, realized_return) in std::mem::take(&mut self.unsynced) {
            self.biases
                .entry(symbol)
                .or_default()
                .record(outcome, realized_return);
        }
        let pending = std::mem::take(&mut self.records);
        let mut merged = stored;
        let known: HashSet<PatternId> = merged.iter().map(|r| r.id.clone()).collect();
        merged.extend(pending.into_iter().filter(|r| !known.contains(&r.id)));
        self.replace_records(merged);
        self.loaded = true;
        tracing::info!(
            store = %store.describe(),
            loaded = loaded_count,
            total = self.records.len(),
            "pattern memory loaded"
        );
        Ok(self.records.len())
    }

    /// Persist the current contents to `store`.
    ///
    /// Refused until a load has succeeded, so a failed load never leads to
    /// the stored history being overwritten by a partial memory.
    pub fn persist(&self, store: &dyn PatternStore, now: DateTime<Utc>) -> Result<(), MemoryError> {
        persist_snapshot(self.loaded, store, &self.snapshot(now))
    }

    /// Mark the memory as loaded without a store (fresh start, tests).
    pub fn mark_loaded(&mut self) {
        self.loaded = true;
    }

    pub fn summary(&self) -> LearningSummary {
        let total = self.records.len();
        let count = |label: OutcomeLabel| {
            self.records
                .iter()
                .filter(|r| r.outcome_label == label)
                .count()
        };
        let wins = count(OutcomeLabel::Win);
        let losses = count(OutcomeLabel::Loss);
        let decided = wins + losses;
        LearningSummary {
            total,
            wins,
            losses,
            neutral: count(OutcomeLabel::Neutral),
            win_rate: if decided > 0 {
                wins as f64 / decided as f64
            } else {
                0.0
            },
            average_return: if total > 0 {
                self.records.iter().map(|r| r.realized_return).sum::<f64>() / total as f64
            } else {
                0.0
            },
            most_matched: self
                .records
                .iter()
                .filter(|r| r.match_count > 0)
                .max_by_key(|r| (r.match_count, r.seq))
                .map(|r| (r.id.clone(), r.match_count)),
        }
    }
}

/// Persist a snapshot taken earlier, honouring the loaded guard.
pub fn persist_snapshot(
    loaded: bool,
    store: &dyn PatternStore,
    snapshot: &MemorySnapshot,
) -> Result<(), MemoryError> {
    if !loaded {
        return Err(MemoryError::NotLoaded);
    }
    store.persist(snapshot)?;
    tracing::debug!(store = %store.describe(), records = snapshot.records.len(), "pattern memory persisted");
    Ok(())
}

impl PatternPredictor for PatternMemory {
    fn query(&self, features: &[f64], k: usize) -> Vec<RecallHit> {
        if k == 0 || self.records.is_empty() {
            return Vec::new();
        }
        let metric = self.config.metric;
        let floor = self.config.min_similarity.unwrap_or(f64::NEG_INFINITY);
        let score = |r: &PatternRecord| {
            metric
                .similarity(features, &r.feature_vector)
                .filter(|s| *s >= floor)
                .map(|similarity| RecallHit {
                    record: r.clone(),
                    similarity,
                })
        };

        let mut hits: Vec<RecallHit> = if self.records.len() >= self.config.parallel_threshold {
            self.records.par_iter().filter_map(score).collect()
        } else {
            self.records.iter().filter_map(score).collect()
        };
        hits.sort_by(rank);
        hits.truncate(k);
        hits
    }

    fn mark_matched(&mut self, ids: &[PatternId], now: DateTime<Utc>) {
        if ids.is_empty() {
            return;
        }
        let wanted: HashSet<&PatternId> = ids.iter().collect();
        for r in self.records.iter_mut().filter(|r| wanted.contains(&r.id)) {
            r.match_count += 1;
            r.last_matched_at = Some(now);
        }
    }

    fn learn(&mut self, sample: LearnSample, now: DateTime<Utc>) -> PatternRecord {
        let seq = self.next_seq;
        self.next_seq += 1;
        let record = PatternRecord {
            id: PatternId::derive(&sample.features, now.timestamp_millis(), seq),
            feature_vector: sample.features,
            direction: sample.direction,
            outcome_label: sample.outcome,
            realized_return: sample.realized_return,
            created_at: now,
            last_matched_at: None,
            match_count: 0,
            symbol: sample.symbol,
            seq,
        };
        self.biases
            .entry(record.symbol.clone())
            .or_default()
            .record(record.outcome_label, record.realized_return);
        if !self.loaded {
            self.unsynced.push((
                record.symbol.clone(),
                record.outcome_label,
                record.realized_return,
            ));
        }
        self.records.push(record.clone());
        self.enforce_capacity(Some(seq));
        record
    }

    fn records(&self) -> &[PatternRecord] {
        &self.records
    }

    /// Replace the contents. Sequence numbers are reassigned in the given
    /// order so later learning continues after them.
    fn replace_records(&mut self, mut records: Vec<PatternRecord>) {
        for (i, r) in records.iter_mut().enumerate() {
            r.seq = i as u64;
        }
        self.next_seq = records.len() as u64;
        self.records = records;
        self.enforce_capacity(None);
    }
}
