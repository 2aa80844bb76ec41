//! Historical latency baselines.
//!
//! Resolution never fails a run: any lookup problem is logged and the
//! statement simply has no baseline.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{ReplayError, Result};
use crate::source::SourceSystem;
use crate::statement::StatementRecord;

/// One entry of a baseline file: either a bare number or an object carrying
/// `avg_latency_ms`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BaselineEntry {
    Value(f64),
    Detailed { avg_latency_ms: Option<f64> },
}

/// Where baseline latencies come from.
#[derive(Clone, Default)]
pub enum BaselineResolver {
    /// No baselines.
    #[default]
    Disabled,
    /// Ask the source system's execution statistics.
    Online(Arc<dyn SourceSystem>),
    /// Static mapping from exact statement text to average latency.
    File(HashMap<String, f64>),
}

impl std::fmt::Debug for BaselineResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BaselineResolver::Disabled => write!(f, "Disabled"),
            BaselineResolver::Online(source) => write!(f, "Online({})", source.db_type()),
            BaselineResolver::File(map) => write!(f, "File({} entries)", map.len()),
        }
    }
}

impl BaselineResolver {
    /// Load a baseline file (a JSON object keyed by statement text).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ReplayError::Config(format!("Cannot read baseline file {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
    }

    /// Parse baseline file content.
    pub fn from_json(content: &str) -> Result<Self> {
        let raw: HashMap<String, BaselineEntry> = serde_json::from_str(content)?;
        let map = raw
            .into_iter()
            .filter_map(|(text, entry)| {
                let value = match entry {
                    BaselineEntry::Value(v) => Some(v),
                    BaselineEntry::Detailed { avg_latency_ms } => avg_latency_ms,
                };
                value.map(|v| (text.trim().to_string(), v))
            })
            .collect();
        Ok(BaselineResolver::File(map))
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, BaselineResolver::Disabled)
    }

    /// Baseline for a statement, if any.
    pub async fn resolve(&self, record: &StatementRecord) -> Option<f64> {
        let source_id = record.origin().and_then(|o| o.source_id.as_deref());
        self.resolve_parts(source_id, record.text()).await
    }

    /// Baseline by explicit source execution id and/or text.
    pub async fn resolve_parts(&self, source_id: Option<&str>, text: &str) -> Option<f64> {
        match self {
            BaselineResolver::Disabled => None,
            BaselineResolver::File(map) => map.get(text.trim()).copied(),
            BaselineResolver::Online(source) => {
                match source.average_latency_ms(source_id, text).await {
                    Ok(Some(ms)) => Some(ms),
                    Ok(None) => {
                        debug!("No source statistics for {}", source_id.unwrap_or("statement"));
                        None
                    }
                    Err(e) => {
                        warn!(
                            "{}",
                            ReplayError::BaselineUnavailable(format!(
                                "{}: {}",
                                source_id.unwrap_or("statement"),
                                e
                            ))
                        );
                        None
                    }
                }
            }
        }
    }
}
