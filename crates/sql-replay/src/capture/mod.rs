//! Capture sampler: bounded polling of a live source for recent statements.
//!
//! States run `Idle -> Polling -> (Sleeping <-> Polling) -> Finished`. The
//! overall duration is measured from the first entry into `Polling`, so an
//! unreachable source still runs out the clock. A failed cycle counts as an
//! empty one; only invalid configuration stops the sampler from starting.
//!
//! The fingerprint set used for dedup belongs to one sampler and can be
//! injected (and taken back) to carry dedup state across sessions.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDateTime;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{validate_filters, CaptureConfig};
use crate::error::{ReplayError, Result};
use crate::source::{SampleQuery, SampledStatement, SourceSystem};
use crate::statement::{FingerprintStrategy, StatementRecord};
use crate::stream::JsonlWriter;

/// Sampler lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerState {
    Idle,
    Polling,
    Sleeping,
    Finished,
}

/// Sampling behavior.
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub duration: Duration,
    pub interval: Duration,
    pub limit_per_interval: usize,
    pub dedup: bool,
    pub include_binds: bool,
    pub schemas: Vec<String>,
    pub modules: Vec<String>,
    pub case_insensitive_filters: bool,
    pub fingerprint: FingerprintStrategy,
}

impl CaptureOptions {
    pub fn from_config(config: &CaptureConfig, fingerprint: FingerprintStrategy) -> Self {
        Self {
            duration: Duration::from_secs(config.duration_seconds),
            interval: Duration::from_secs(config.interval_seconds),
            limit_per_interval: config.limit_per_interval,
            dedup: config.dedup,
            include_binds: config.include_binds,
            schemas: config.schemas.clone(),
            modules: config.modules.clone(),
            case_insensitive_filters: config.case_insensitive_filters,
            fingerprint,
        }
    }
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self::from_config(&CaptureConfig::default(), FingerprintStrategy::default())
    }
}

/// Totals for one sampling session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CaptureSummary {
    pub cycles: usize,
    pub failed_cycles: usize,
    pub emitted: usize,
    pub duplicates_skipped: usize,
    pub filtered_out: usize,
    pub elapsed_seconds: f64,
}

#[derive(Debug, Default)]
struct Cycle {
    records: Vec<StatementRecord>,
    fingerprints: Vec<String>,
    duplicates: usize,
    filtered: usize,
}

/// Exact-match include list; empty accepts everything.
#[derive(Debug, Clone)]
struct IncludeFilter {
    entries: HashSet<String>,
    case_insensitive: bool,
}

impl IncludeFilter {
    fn new(entries: &[String], case_insensitive: bool) -> Self {
        let entries = entries
            .iter()
            .map(|e| {
                if case_insensitive {
                    e.to_lowercase()
                } else {
                    e.clone()
                }
            })
            .collect();
        Self {
            entries,
            case_insensitive,
        }
    }

    fn accepts(&self, value: Option<&str>) -> bool {
        if self.entries.is_empty() {
            return true;
        }
        match value {
            Some(v) if self.case_insensitive => self.entries.contains(&v.to_lowercase()),
            Some(v) => self.entries.contains(v),
            None => false,
        }
    }
}

/// Polls a source system and appends new statements to a JSONL sink.
pub struct CaptureSampler {
    source: Arc<dyn SourceSystem>,
    options: CaptureOptions,
    schemas: IncludeFilter,
    modules: IncludeFilter,
    seen: HashSet<String>,
    watermark: Option<NaiveDateTime>,
    state: SamplerState,
}

impl CaptureSampler {
    /// Build a sampler. Invalid filters or limits are rejected here, before
    /// any polling happens.
    pub fn new(source: Arc<dyn SourceSystem>, options: CaptureOptions) -> Result<Self> {
        validate_filters("capture.schemas", &options.schemas)?;
        validate_filters("capture.modules", &options.modules)?;
        if options.limit_per_interval == 0 {
            return Err(ReplayError::Config(
                "capture.limit_per_interval must be at least 1".into(),
            ));
        }
        if options.interval.is_zero() {
            return Err(ReplayError::Config(
                "capture.interval_seconds must be at least 1".into(),
            ));
        }

        let schemas = IncludeFilter::new(&options.schemas, options.case_insensitive_filters);
        let modules = IncludeFilter::new(&options.modules, options.case_insensitive_filters);
        Ok(Self {
            source,
            options,
            schemas,
            modules,
            seen: HashSet::new(),
            watermark: None,
            state: SamplerState::Idle,
        })
    }

    /// Seed the dedup set, e.g. with fingerprints from a previous session.
    pub fn with_seen(mut self, seen: HashSet<String>) -> Self {
        self.seen = seen;
        self
    }

    pub fn state(&self) -> SamplerState {
        self.state
    }

    pub fn seen(&self) -> &HashSet<String> {
        &self.seen
    }

    /// Give back the dedup set.
    pub fn into_seen(self) -> HashSet<String> {
        self.seen
    }

    /// Poll until the duration elapses or `cancel` fires, appending each
    /// cycle's records to `sink` before sleeping.
    pub async fn run(
        &mut self,
        sink: &mut JsonlWriter,
        cancel: CancellationToken,
    ) -> Result<CaptureSummary> {
        let mut summary = CaptureSummary::default();
        let duration = self.options.duration;

        info!(
            "Capturing from {} source for {:?} every {:?} (limit {}, dedup {})",
            self.source.db_type(),
            duration,
            self.options.interval,
            self.options.limit_per_interval,
            self.options.dedup
        );

        self.state = SamplerState::Polling;
        let started = Instant::now();

        while !cancel.is_cancelled() {
            let remaining = duration.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                break;
            }

            summary.cycles += 1;
            let query = self.next_query(self.options.limit_per_interval, self.options.interval);
            // an in-flight cycle is allowed to finish and flush after cancel
            let cycle = match tokio::time::timeout(remaining, self.poll(&query)).await {
                Ok(Ok(cycle)) => Some(cycle),
                Ok(Err(e)) => {
                    warn!("Capture cycle {} failed: {}", summary.cycles, e);
                    None
                }
                Err(_) => {
                    warn!("Capture cycle {} ran past the capture window", summary.cycles);
                    None
                }
            };

            match cycle {
                Some(cycle) => {
                    sink.append(&cycle.records).await?;
                    self.seen.extend(cycle.fingerprints);
                    summary.emitted += cycle.records.len();
                    summary.duplicates_skipped += cycle.duplicates;
                    summary.filtered_out += cycle.filtered;
                    debug!(
                        "Capture cycle {}: {} emitted, {} duplicates, {} filtered",
                        summary.cycles,
                        cycle.records.len(),
                        cycle.duplicates,
                        cycle.filtered
                    );
                }
                None => summary.failed_cycles += 1,
            }

            let remaining = duration.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                break;
            }
            self.state = SamplerState::Sleeping;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.options.interval.min(remaining)) => {}
            }
            self.state = SamplerState::Polling;
        }

        self.state = SamplerState::Finished;
        summary.elapsed_seconds = started.elapsed().as_secs_f64();

        info!(
            "Capture finished: {} records in {} cycles ({} failed, {} duplicates, {} filtered) -> {}",
            summary.emitted,
            summary.cycles,
            summary.failed_cycles,
            summary.duplicates_skipped,
            summary.filtered_out,
            sink.path().display()
        );
        Ok(summary)
    }

    /// One sampling pass over the whole capture window, for the online
    /// statement source. Source errors propagate.
    pub async fn sample_once(&mut self, limit: usize) -> Result<Vec<StatementRecord>> {
        let query = SampleQuery {
            since: None,
            ..self.next_query(limit, self.options.duration)
        };
        let cycle = self.poll(&query).await?;
        self.seen.extend(cycle.fingerprints);
        Ok(cycle.records)
    }

    fn next_query(&self, limit: usize, lookback: Duration) -> SampleQuery {
        // source-side filtering is exact, so leave it out when matching
        // case-insensitively and filter locally only
        let (schemas, modules) = if self.options.case_insensitive_filters {
            (Vec::new(), Vec::new())
        } else {
            (self.options.schemas.clone(), self.options.modules.clone())
        };
        SampleQuery {
            since: self.watermark,
            lookback,
            limit,
            schemas,
            modules,
        }
    }

    async fn poll(&mut self, query: &SampleQuery) -> Result<Cycle> {
        let rows = self.source.sample_recent(query).await?;

        if let Some(newest) = rows.iter().filter_map(|r| r.last_active_time).max() {
            self.watermark = Some(self.watermark.map_or(newest, |w| w.max(newest)));
        }

        let mut cycle = Cycle::default();
        let mut in_cycle = HashSet::new();
        for row in rows {
            if !self.schemas.accepts(row.schema.as_deref())
                || !self.modules.accepts(row.module.as_deref())
            {
                cycle.filtered += 1;
                continue;
            }

            let fingerprint = self.options.fingerprint.fingerprint(row.text.trim());
            if self.options.dedup
                && (self.seen.contains(&fingerprint) || !in_cycle.insert(fingerprint.clone()))
            {
                cycle.duplicates += 1;
                continue;
            }

            match self.build_record(&row).await {
                Ok(record) => {
                    cycle.records.push(record);
                    cycle.fingerprints.push(fingerprint);
                }
                Err(e) => {
                    debug!("Dropping sampled row: {}", e);
                    cycle.filtered += 1;
                }
            }
        }
        Ok(cycle)
    }

    async fn build_record(&self, row: &SampledStatement) -> Result<StatementRecord> {
        let binds = if self.options.include_binds {
            match self.source.fetch_binds(row).await {
                Ok(binds) => binds,
                Err(e) => {
                    warn!(
                        "Bind lookup failed for {}: {}",
                        row.source_id.as_deref().unwrap_or("statement"),
                        e
                    );
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };
        StatementRecord::new(
            row.text.clone(),
            binds,
            Some(row.origin()),
            self.options.fingerprint,
        )
    }
}
