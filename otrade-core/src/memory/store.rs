//! Persistent backing stores for pattern memory.
//!
//! `JsonFileStore` holds an exclusive `StoreLease` (a lock file next to the
//! data file) for the duration of each load or persist. The lease is released
//! in `Drop`, so every exit path, including errors and panics, gives it back.
//! Writes go to a temporary file that is renamed over the data file, so a
//! reader sees either the previous snapshot or the new one, never a partial
//! write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{MemoryError, PatternRecord, SymbolBias};

/// Current on-disk schema version. Newer versions are rejected on load.
pub const MEMORY_SCHEMA_VERSION: u32 = 1;

/// Lock files older than this are treated as abandoned by a crashed process.
const STALE_LEASE: Duration = Duration::from_secs(120);

/// A point-in-time copy of the memory contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub saved_at: DateTime<Utc>,
    pub records: Vec<PatternRecord>,
    /// Absent in stores written before per-symbol records were kept.
    #[serde(default)]
    pub symbol_biases: BTreeMap<String, SymbolBias>,
}

fn default_schema_version() -> u32 {
    MEMORY_SCHEMA_VERSION
}

impl MemorySnapshot {
    pub fn new(records: Vec<PatternRecord>, saved_at: DateTime<Utc>) -> Self {
        Self {
            schema_version: MEMORY_SCHEMA_VERSION,
            saved_at,
            records,
            symbol_biases: BTreeMap::new(),
        }
    }

    pub fn with_biases(mut self, symbol_biases: BTreeMap<String, SymbolBias>) -> Self {
        self.symbol_biases = symbol_biases;
        self
    }
}

/// Record-snapshot store with load/persist semantics.
pub trait PatternStore: Send + Sync {
    /// Load the last persisted snapshot; `Ok(None)` if nothing was stored yet.
    fn load(&self) -> Result<Option<MemorySnapshot>, MemoryError>;

    /// Replace the stored snapshot.
    fn persist(&self, snapshot: &MemorySnapshot) -> Result<(), MemoryError>;

    /// Short human-readable location, for logs and errors.
    fn describe(&self) -> String;
}

/// Exclusive lease on a store, held for one load or persist call.
#[derive(Debug)]
pub struct StoreLease {
    lock_path: PathBuf,
    _file: File,
}

impl StoreLease {
    /// Acquire the lease by creating `lock_path` exclusively.
    pub fn acquire(lock_path: &Path) -> Result<Self, MemoryError> {
        match Self::try_create(lock_path) {
            Ok(lease) => Ok(lease),
            Err(e) if e.kind() == ErrorKind::AlreadyExists && Self::is_stale(lock_path) => {
                tracing::warn!(lock = %lock_path.display(), "removing stale memory store lease");
                let _ = fs::remove_file(lock_path);
                Self::try_create(lock_path).map_err(|e| unavailable(lock_path, e))
            }
            Err(e) => Err(unavailable(lock_path, e)),
        }
    }

    fn try_create(lock_path: &Path) -> std::io::Result<Self> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lock_path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self {
            lock_path: lock_path.to_path_buf(),
            _file: file,
        })
    }

    fn is_stale(lock_path: &Path) -> bool {
        fs::metadata(lock_path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.elapsed().ok())
            .is_some_and(|age| age > STALE_LEASE)
    }
}

impl Drop for StoreLease {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.lock_path);
    }
}

fn unavailable(path: &Path, e: impl std::fmt::Display) -> MemoryError {
    MemoryError::StorageUnavailable {
        store: path.display().to_string(),
        reason: e.to_string(),
    }
}

/// Single JSON document on the local filesystem.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = sibling(&path, "lock");
        Self { path, lock_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lease(&self) -> Result<StoreLease, MemoryError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| unavailable(parent, e))?;
        }
        StoreLease::acquire(&self.lock_path)
    }
}

/// `dir/name.json` -> `dir/name.json.<ext>`
fn sibling(path: &Path, ext: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(ext);
    path.with_file_name(name)
}

impl PatternStore for JsonFileStore {
    fn load(&self) -> Result<Option<MemorySnapshot>, MemoryError> {
        let _lease = self.lease()?;
        let text = match fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(unavailable(&self.path, e)),
        };
        let snapshot: MemorySnapshot =
            serde_json::from_str(&text).map_err(|e| MemoryError::Corrupt {
                store: self.describe(),
                reason: e.to_string(),
            })?;
        if snapshot.schema_version > MEMORY_SCHEMA_VERSION {
            return Err(MemoryError::UnsupportedSchema {
                found: snapshot.schema_version,
                supported: MEMORY_SCHEMA_VERSION,
            });
        }
        Ok(Some(snapshot))
    }

    fn persist(&self, snapshot: &MemorySnapshot) -> Result<(), MemoryError> {
        let _lease = self.lease()?;
        let json = serde_json::to_vec_pretty(snapshot).map_err(|e| MemoryError::Corrupt {
            store: self.describe(),
            reason: e.to_string(),
        })?;

        let tmp = sibling(&self.path, "tmp");
        let write = || -> std::io::Result<()> {
            let mut f = File::create(&tmp)?;
            f.write_all(&json)?;
            f.sync_all()?;
            fs::rename(&tmp, &self.path)
        };
        write().map_err(|e| {
            let _ = fs::remove_file(&tmp);
            unavailable(&self.path, e)
        })
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Process-local store, used in tests and for dry runs.
///
/// Can be switched into an unavailable state to exercise degraded paths.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    snapshot: Mutex<Option<MemorySnapshot>>,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: MemorySnapshot) -> Self {
        Self {
            snapshot: Mutex::new(Some(snapshot)),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Records currently stored, if any.
    pub fn stored_len(&self) -> Option<usize> {
        self.snapshot
            .lock()
            .ok()
            .and_then(|s| s.as_ref().map(|s| s.records.len()))
    }

    fn check(&self) -> Result<(), MemoryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(MemoryError::StorageUnavailable {
                store: self.describe(),
                reason: "store marked unavailable".into(),
            });
        }
        Ok(())
    }
}

impl PatternStore for InMemoryStore {
    fn load(&self) -> Result<Option<MemorySnapshot>, MemoryError> {
        self.check()?;
        let guard = self.snapshot.lock().map_err(|e| MemoryError::StorageUnavailable {
            store: self.describe(),
            reason: e.to_string(),
        })?;
        Ok(guard.clone())
    }

    fn persist(&self, snapshot: &MemorySnapshot) -> Result<(), MemoryError> {
        self.check()?;
        let mut guard = self.snapshot.lock().map_err(|e| MemoryError::StorageUnavailable {
            store: self.describe(),
            reason: e.to_string(),
        })?;
        *guard = Some(snapshot.clone());
        Ok(())
    }

    fn describe(&self) -> String {
        "in-memory".to_string()
    }
}
