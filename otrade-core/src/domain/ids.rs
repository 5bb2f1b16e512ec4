use serde::{Deserialize, Serialize};
use std::fmt;

/// Broker ticket identifying an executed position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TicketId(pub String);

impl TicketId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl From<u64> for TicketId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Content-derived identity of a pattern record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PatternId(pub String);

impl PatternId {
    /// Derive an id from the feature vector, creation time and insertion sequence.
    ///
    /// Uses BLAKE3 so ids are stable across builds and platforms.
    pub fn derive(features: &[f64], created_at_millis: i64, seq: u64) -> Self {
        let mut hasher = blake3::Hasher::new();
        for v in features {
            hasher.update(&v.to_le_bytes());
        }
        hasher.update(&created_at_millis.to_le_bytes());
        hasher.update(&seq.to_le_bytes());
        let hex = hasher.finalize().to_hex();
        Self(hex[..16].to_string())
    }
}

impl fmt::Display for PatternId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Deterministic configuration hash (BLAKE3 of canonical JSON).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfigHash(pub String);

impl ConfigHash {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(blake3::hash(bytes).to_hex().to_string())
    }

    /// First 12 hex characters, enough for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for ConfigHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
