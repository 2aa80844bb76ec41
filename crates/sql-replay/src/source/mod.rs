//! Source database boundary.
//!
//! The source system is only ever read: sampled for recently executed
//! statements by the capture sampler and asked for historical averages by
//! the baseline resolver.
//!
//! - [`mssql::MssqlSource`]: SQL Server via `sys.dm_exec_query_stats`
//! - [`postgres::PostgresSource`]: PostgreSQL via `pg_stat_activity` and
//!   `pg_stat_statements`

pub mod mssql;
pub mod postgres;
mod types;

pub use types::{SampleQuery, SampledStatement};

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::SourceConfig;
use crate::error::{ReplayError, Result};
use crate::statement::BindValue;

/// Read-only access to a live source database.
#[async_trait]
pub trait SourceSystem: Send + Sync {
    /// Statements executed recently, oldest first, at most `query.limit`.
    async fn sample_recent(&self, query: &SampleQuery) -> Result<Vec<SampledStatement>>;

    /// Bind values the source recorded for a sampled statement, in position
    /// order. Sources without bind capture return an empty list.
    async fn fetch_binds(&self, statement: &SampledStatement) -> Result<Vec<BindValue>>;

    /// Historical average latency in milliseconds, by execution id when one is
    /// given, otherwise by exact statement text. `None` when the source has no
    /// statistics for it.
    async fn average_latency_ms(&self, source_id: Option<&str>, text: &str)
        -> Result<Option<f64>>;

    /// Check that the source is reachable.
    async fn test_connection(&self) -> Result<()>;

    /// Database type identifier ("mssql", "postgres").
    fn db_type(&self) -> &str;
}

/// Connect to the configured source database.
pub async fn connect(config: &SourceConfig) -> Result<Arc<dyn SourceSystem>> {
    match config.r#type.as_str() {
        "mssql" => Ok(Arc::new(mssql::MssqlSource::new(config.clone()).await?)),
        "postgres" => Ok(Arc::new(postgres::PostgresSource::new(config).await?)),
        other => Err(ReplayError::Config(format!(
            "Unsupported source type '{}'",
            other
        ))),
    }
}
