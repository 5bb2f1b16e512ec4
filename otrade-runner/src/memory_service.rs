//! Shared pattern memory for concurrent cycles.
//!
//! Readers (per-symbol recall) take the `RwLock` in shared mode and run
//! concurrently. Every mutation goes through the writer gate, a `Mutex` that
//! serializes learn, match bookkeeping and persistence. A write holds the
//! `RwLock` exclusively only for the in-memory change; the snapshot is then
//! persisted on the blocking pool with the lock released but the gate still
//! held. Readers therefore see either the state before a write or after it,
//! and persists land in the order their writes happened.
//!
//! Store calls run under the storage budget. A call that overruns it is
//! reported as `StorageUnavailable`, but its blocking task cannot be
//! cancelled, so the store stays busy until that task returns. No other store
//! call starts meanwhile; a stale write can therefore never land on top of a
//! newer one.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

use otrade_core::domain::{ClosedTrade, PatternId};
use otrade_core::memory::{
    persist_snapshot, LearnSample, LearningSummary, MemoryError, MemorySnapshot, PatternMemory,
    PatternPredictor, PatternRecord, PatternStore, RecallHit, SymbolBias,
};

pub struct MemoryService {
    memory: RwLock<PatternMemory>,
    writer: Mutex<()>,
    store: Arc<dyn PatternStore>,
    storage_timeout: Duration,
    /// Set while a blocking store call is running, including one that
    /// already timed out.
    store_busy: Arc<AtomicBool>,
    degraded: AtomicBool,
}

/// Clears the busy flag when the blocking store call returns.
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl MemoryService {
    pub fn new(
        memory: PatternMemory,
        store: Arc<dyn PatternStore>,
        storage_timeout: Duration,
    ) -> Self {
        Self {
            memory: RwLock::new(memory),
            writer: Mutex::new(()),
            store,
            storage_timeout,
            store_busy: Arc::new(AtomicBool::new(false)),
            degraded: AtomicBool::new(false),
        }
    }

    /// Create the service and load the store.
    ///
    /// An unavailable store is not fatal: the service starts empty in degraded
    /// mode and retries the load before its next persist. Any other load error
    /// is returned.
    pub async fn open(
        memory: PatternMemory,
        store: Arc<dyn PatternStore>,
        storage_timeout: Duration,
    ) -> Result<Self, MemoryError> {
        let service = Self::new(memory, store, storage_timeout);
        match service.load().await {
            Ok(_) => Ok(service),
            Err(e @ MemoryError::StorageUnavailable { .. }) => {
                tracing::warn!(error = %e, "pattern store unavailable, starting without recall");
                Ok(service)
            }
            Err(e) => Err(e),
        }
    }

    /// Load the store into memory, merging anything learned meanwhile.
    pub async fn load(&self) -> Result<usize, MemoryError> {
        let _gate = self.writer.lock().await;
        self.load_locked().await
    }

    async fn load_locked(&self) -> Result<usize, MemoryError> {
        let snapshot = match self.store_call("load", |store| store.load()).await {
            Ok(s) => s,
            Err(e) => {
                self.degraded.store(true, Ordering::SeqCst);
                return Err(e);
            }
        };

        let mut memory = self.memory.write().await;
        let count = memory.load(&PreloadedStore {
            snapshot,
            source: self.store.describe(),
        })?;
        self.degraded.store(false, Ordering::SeqCst);
        Ok(count)
    }

    /// Run `op` on the blocking pool within the storage budget.
    ///
    /// Refused while an earlier call is still running. On timeout the task is
    /// left to finish in the background and its result is discarded.
    async fn store_call<T, F>(&self, op: &'static str, op_fn: F) -> Result<T, MemoryError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn PatternStore) -> Result<T, MemoryError> + Send + 'static,
    {
        if self.store_busy.swap(true, Ordering::SeqCst) {
            return Err(self.unavailable(format!("{op} refused: previous store call still running")));
        }
        let guard = BusyGuard(Arc::clone(&self.store_busy));
        let store = Arc::clone(&self.store);
        let task = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            op_fn(store.as_ref())
        });

        match tokio::time::timeout(self.storage_timeout, task).await {
            Ok(joined) => joined.map_err(|e| self.join_error(e))?,
            Err(_) => {
                tracing::warn!(
                    op,
                    store = %self.store.describe(),
                    timeout_ms = self.storage_timeout.as_millis() as u64,
                    "pattern store call timed out"
                );
                Err(self.unavailable(format!(
                    "{op} timed out after {}ms",
                    self.storage_timeout.as_millis()
                )))
            }
        }
    }

    /// Nearest stored patterns. Read-only; match counts are updated later by
    /// `mark_matched`.
    pub async fn query(&self, features: &[f64], k: usize) -> Vec<RecallHit> {
        self.memory.read().await.query(features, k)
    }

    pub async fn mark_matched(&self, ids: &[PatternId], now: DateTime<Utc>) {
        if ids.is_empty() {
            return;
        }
        let _gate = self.writer.lock().await;
        self.memory.write().await.mark_matched(ids, now);
    }

    /// Learned track record of `symbol`, if it was ever traded.
    pub async fn symbol_bias(&self, symbol: &str) -> Option<SymbolBias> {
        self.memory.read().await.symbol_bias(symbol).cloned()
    }

    /// Learn from a closed trade and persist.
    ///
    /// The record is kept in memory even when persisting fails or times out;
    /// the failure is logged and the service goes degraded until a persist
    /// succeeds.
    pub async fn learn(&self, trade: &ClosedTrade, now: DateTime<Utc>) -> PatternRecord {
        let _gate = self.writer.lock().await;
        let (record, loaded, snapshot) = {
            let mut memory = self.memory.write().await;
            let sample = LearnSample::from_trade(trade, memory.config().neutral_band);
            let record = memory.learn(sample, now);
            (record, memory.is_loaded(), memory.snapshot(now))
        };
        tracing::info!(
            symbol = %record.symbol,
            id = %record.id,
            outcome = ?record.outcome_label,
            realized_return = record.realized_return,
            "learned pattern"
        );

        if let Err(e) = self.persist_locked(loaded, snapshot, now).await {
            tracing::warn!(error = %e, "pattern memory not persisted");
        }
        record
    }

    /// Persist the current contents.
    pub async fn persist(&self, now: DateTime<Utc>) -> Result<(), MemoryError> {
        let _gate = self.writer.lock().await;
        let (loaded, snapshot) = {
            let memory = self.memory.read().await;
            (memory.is_loaded(), memory.snapshot(now))
        };
        self.persist_locked(loaded, snapshot, now).await
    }

    /// Caller holds the writer gate.
    async fn persist_locked(
        &self,
        loaded: bool,
        snapshot: MemorySnapshot,
        now: DateTime<Utc>,
    ) -> Result<(), MemoryError> {
        let snapshot = if loaded {
            snapshot
        } else {
            // Retry the load first so the stored history is merged, not replaced
            self.load_locked().await?;
            self.memory.read().await.snapshot(now)
        };

        let result = self
            .store_call("persist", move |store| persist_snapshot(true, store, &snapshot))
            .await;
        self.degraded.store(result.is_err(), Ordering::SeqCst);
        result
    }

    pub async fn summary(&self) -> LearningSummary {
        self.memory.read().await.summary()
    }

    pub async fn len(&self) -> usize {
        self.memory.read().await.len()
    }

    pub async fn is_loaded(&self) -> bool {
        self.memory.read().await.is_loaded()
    }

    /// True while the store is unreachable.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    fn unavailable(&self, reason: String) -> MemoryError {
        MemoryError::StorageUnavailable {
            store: self.store.describe(),
            reason,
        }
    }

    fn join_error(&self, e: tokio::task::JoinError) -> MemoryError {
        self.unavailable(format!("store task failed: {e}"))
    }
}

/// A snapshot already read from the real store, replayed through
/// `PatternMemory::load` so the merge rules stay in one place.
struct PreloadedStore {
    snapshot: Option<MemorySnapshot>,
    source: String,
}

impl PatternStore for PreloadedStore {
    fn load(&self) -> Result<Option<MemorySnapshot>, MemoryError> {
        Ok(self.snapshot.clone())
    }

    fn persist(&self, _snapshot: &MemorySnapshot) -> Result<(), MemoryError> {
        Ok(())
    }

    fn describe(&self) -> String {
        self.source.clone()
    }
}
