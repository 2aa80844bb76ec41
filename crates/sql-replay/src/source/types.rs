//! Rows returned by source-system sampling queries.

use std::time::Duration;

use chrono::NaiveDateTime;

use crate::statement::OriginMetadata;

/// Parameters for one sampling cycle.
#[derive(Debug, Clone)]
pub struct SampleQuery {
    /// Only statements active after this server-local time.
    /// When absent the source falls back to "now - lookback" on its own clock.
    pub since: Option<NaiveDateTime>,
    /// Fallback window used when `since` is absent.
    pub lookback: Duration,
    /// Maximum rows returned.
    pub limit: usize,
    /// Pre-filter on schema (database) names. Empty means all.
    pub schemas: Vec<String>,
    /// Pre-filter on module (object/application) names. Empty means all.
    pub modules: Vec<String>,
}

impl Default for SampleQuery {
    fn default() -> Self {
        Self {
            since: None,
            lookback: Duration::from_secs(5),
            limit: 200,
            schemas: Vec::new(),
            modules: Vec::new(),
        }
    }
}

/// One statement seen in the source's execution statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampledStatement {
    pub text: String,
    pub source_id: Option<String>,
    pub child_number: Option<i64>,
    pub schema: Option<String>,
    pub module: Option<String>,
    pub last_active_time: Option<NaiveDateTime>,
    pub executions: Option<i64>,
    pub elapsed_time_us: Option<i64>,
    pub cpu_time_us: Option<i64>,
    pub buffer_gets: Option<i64>,
    pub disk_reads: Option<i64>,
    pub rows_processed: Option<i64>,
    pub fetches: Option<i64>,
    /// Opaque handle the source needs to look up bind values (plan handle).
    pub bind_handle: Option<String>,
}

impl SampledStatement {
    /// Historical average elapsed time, when the counters allow it.
    pub fn avg_elapsed_ms(&self) -> Option<f64> {
        match (self.elapsed_time_us, self.executions) {
            (Some(elapsed), Some(execs)) if execs > 0 => {
                Some(elapsed as f64 / 1000.0 / execs as f64)
            }
            _ => None,
        }
    }

    /// Provenance record attached to the emitted statement.
    pub fn origin(&self) -> OriginMetadata {
        OriginMetadata {
            schema: self.schema.clone(),
            module: self.module.clone(),
            source_id: self.source_id.clone(),
            child_number: self.child_number,
            last_active_time: self
                .last_active_time
                .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f").to_string()),
            executions: self.executions,
            avg_elapsed_ms: self.avg_elapsed_ms(),
            elapsed_time_us: self.elapsed_time_us,
            cpu_time_us: self.cpu_time_us,
            buffer_gets: self.buffer_gets,
            disk_reads: self.disk_reads,
            rows_processed: self.rows_processed,
            fetches: self.fetches,
            extra: Default::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_avg_elapsed_requires_executions() {
        let mut row = SampledStatement {
            text: "select 1".into(),
            elapsed_time_us: Some(9_000),
            executions: Some(3),
            ..Default::default()
        };
        assert_eq!(row.avg_elapsed_ms(), Some(3.0));

        row.executions = Some(0);
        assert_eq!(row.avg_elapsed_ms(), None);

        row.executions = None;
        assert_eq!(row.origin().avg_elapsed_ms, None);
        assert_eq!(row.origin().elapsed_time_us, Some(9_000));
    }
}
