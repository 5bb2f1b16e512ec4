//! Similarity metrics for pattern recall.

use serde::{Deserialize, Serialize};

/// Similarity used to rank recalled patterns. Higher is more similar; an
/// exact match always scores 1.0, the maximum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityMetric {
    /// Cosine of the angle between vectors, in `[-1, 1]`.
    #[default]
    Cosine,
    /// `1 / (1 + euclidean_distance)`, in `(0, 1]`.
    Euclidean,
}

impl SimilarityMetric {
    /// Similarity of `a` and `b`, or `None` when the widths differ or the
    /// result is not a number.
    pub fn similarity(&self, a: &[f64], b: &[f64]) -> Option<f64> {
        if a.len() != b.len() {
            return None;
        }
        if a == b {
            return Some(1.0);
        }
        let s = match self {
            SimilarityMetric::Cosine => cosine(a, b),
            SimilarityMetric::Euclidean => 1.0 / (1.0 + euclidean(a, b)),
        };
        (!s.is_nan()).then_some(s)
    }
}

fn cosine(a: &[f64], b: &[f64]) -> f64 {
    let mut dot = 0.0;
    let mut na = 0.0;
    let mut nb = 0.0;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    // Two zero vectors are equal and never get here
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    // Rounding can push a parallel pair past 1; only exact matches may reach it
    (dot / (na.sqrt() * nb.sqrt())).clamp(-1.0, 1.0 - f64::EPSILON)
}

fn euclidean(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}
