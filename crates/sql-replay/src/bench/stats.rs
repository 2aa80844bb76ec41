//! Latency statistics over successful attempts.

use serde::Serialize;

/// Summary of a latency sample in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencyStats {
    pub avg_ms: f64,
    pub p95_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

impl LatencyStats {
    /// Statistics over an ascending-sorted sample; `None` when it is empty.
    pub fn from_sorted(sorted: &[f64]) -> Option<Self> {
        let (&min_ms, &max_ms) = (sorted.first()?, sorted.last()?);
        let avg_ms = sorted.iter().sum::<f64>() / sorted.len() as f64;
        let p95_ms = if sorted.len() == 1 {
            avg_ms
        } else {
            percentile_nearest_rank(sorted, 95.0)?
        };
        Some(Self {
            avg_ms,
            p95_ms,
            min_ms,
            max_ms,
        })
    }
}

/// Nearest-rank percentile: `sorted[ceil(p/100 * n) - 1]`.
pub fn percentile_nearest_rank(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let idx = ((sorted.len() as f64 * p / 100.0).ceil() as usize).saturating_sub(1);
    sorted.get(idx.min(sorted.len() - 1)).copied()
}

/// Sort a latency sample ascending. NaN never occurs for measured durations;
/// `total_cmp` keeps the order total regardless.
pub fn sort_samples(samples: &mut [f64]) {
    samples.sort_by(|a, b| a.total_cmp(b));
}
