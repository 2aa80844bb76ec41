//! PostgreSQL source.
//!
//! Samples `pg_stat_activity`, enriched with `pg_stat_statements` counters
//! when the extension is installed. PostgreSQL does not expose bind values
//! of past executions, so no binds are captured.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::types::ToSql;
use tokio_postgres::{Config as PgConfig, Row};
use tracing::{debug, info, warn};

use super::{SampleQuery, SampledStatement, SourceSystem};
use crate::config::SourceConfig;
use crate::error::{ReplayError, Result};
use crate::statement::BindValue;
use crate::tls::SslMode;

const POOL_MAX_SIZE: usize = 4;

const ACTIVITY_COLUMNS: &str = r#"
    a.query AS sql_text,
    a.query_id::text AS source_id,
    a.datname::text AS schema_name,
    NULLIF(a.application_name, '') AS module_name,
    a.query_start::timestamp AS last_active_time"#;

const STATEMENT_COLUMNS: &str = r#",
    s.calls::bigint AS executions,
    (s.total_exec_time * 1000)::bigint AS elapsed_time_us,
    (s.shared_blks_hit + s.shared_blks_read)::bigint AS buffer_gets,
    s.shared_blks_read::bigint AS disk_reads,
    s.rows::bigint AS rows_processed"#;

/// PostgreSQL source system.
pub struct PostgresSource {
    pool: Pool,
    has_pg_stat_statements: bool,
}

impl PostgresSource {
    /// Connect and verify the source is reachable.
    pub async fn new(config: &SourceConfig) -> Result<Self> {
        let mut pg_config = PgConfig::new();
        pg_config.host(&config.host);
        pg_config.port(config.port());
        pg_config.dbname(&config.database);
        pg_config.user(&config.user);
        pg_config.password(&config.password);
        pg_config.application_name("sql-replay");

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let pool = match SslMode::parse(&config.ssl_mode)?.connector()? {
            None => {
                warn!("PostgreSQL TLS is disabled. Credentials will be transmitted in plaintext.");
                let mgr = Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config);
                Pool::builder(mgr)
                    .max_size(POOL_MAX_SIZE)
                    .build()
                    .map_err(|e| ReplayError::pool(e, "creating PostgreSQL source pool"))?
            }
            Some(tls) => {
                let mgr = Manager::from_config(pg_config, tls, mgr_config);
                Pool::builder(mgr)
                    .max_size(POOL_MAX_SIZE)
                    .build()
                    .map_err(|e| ReplayError::pool(e, "creating PostgreSQL source pool"))?
            }
        };

        let client = pool
            .get()
            .await
            .map_err(|e| ReplayError::pool(e, "testing PostgreSQL source connection"))?;
        let has_pg_stat_statements = client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM pg_extension WHERE extname = 'pg_stat_statements')",
                &[],
            )
            .await?
            .get::<_, bool>(0);
        drop(client);

        if !has_pg_stat_statements {
            warn!("pg_stat_statements is not installed: execution counters and baselines unavailable");
        }

        info!(
            "Connected to PostgreSQL source: {}:{}/{}",
            config.host,
            config.port(),
            config.database
        );

        Ok(Self {
            pool,
            has_pg_stat_statements,
        })
    }

    async fn client(&self) -> Result<deadpool_postgres::Object> {
        self.pool
            .get()
            .await
            .map_err(|e| ReplayError::pool(e, "getting PostgreSQL source connection"))
    }

    fn sampling_sql(&self, since: bool) -> String {
        let (columns, join) = if self.has_pg_stat_statements {
            (
                format!("{}{}", ACTIVITY_COLUMNS, STATEMENT_COLUMNS),
                "\nLEFT JOIN pg_stat_statements s\n    ON s.queryid = a.query_id AND s.dbid = a.datid AND s.userid = a.usesysid",
            )
        } else {
            (ACTIVITY_COLUMNS.to_string(), "")
        };
        let watermark = if since {
            "a.query_start::timestamp > $2"
        } else {
            "a.query_start > now() - make_interval(secs => $2)"
        };

        format!(
            r#"SELECT{columns}
FROM pg_stat_activity a{join}
WHERE a.pid <> pg_backend_pid()
  AND a.backend_type = 'client backend'
  AND a.query <> ''
  AND {watermark}
  AND (cardinality($3::text[]) = 0 OR a.datname::text = ANY($3))
  AND (cardinality($4::text[]) = 0 OR a.application_name = ANY($4))
ORDER BY a.query_start ASC
LIMIT $1"#
        )
    }

    fn row_to_sample(&self, row: &Row) -> Option<SampledStatement> {
        let text = row.get::<_, Option<String>>("sql_text")?.trim().to_string();
        if text.is_empty() {
            return None;
        }
        let mut sample = SampledStatement {
            text,
            source_id: row.get("source_id"),
            schema: row.get("schema_name"),
            module: row.get("module_name"),
            last_active_time: row.get::<_, Option<NaiveDateTime>>("last_active_time"),
            ..Default::default()
        };
        if self.has_pg_stat_statements {
            sample.executions = row.get("executions");
            sample.elapsed_time_us = row.get("elapsed_time_us");
            sample.buffer_gets = row.get("buffer_gets");
            sample.disk_reads = row.get("disk_reads");
            sample.rows_processed = row.get("rows_processed");
        }
        Some(sample)
    }
}

#[async_trait]
impl SourceSystem for PostgresSource {
    async fn sample_recent(&self, query: &SampleQuery) -> Result<Vec<SampledStatement>> {
        let sql = self.sampling_sql(query.since.is_some());
        let limit = query.limit as i64;
        let lookback = query.lookback.as_secs_f64();

        let watermark: &(dyn ToSql + Sync) = match &query.since {
            Some(since) => since,
            None => &lookback,
        };
        let params: [&(dyn ToSql + Sync); 4] =
            [&limit, watermark, &query.schemas, &query.modules];

        let client = self.client().await?;
        let rows = client.query(sql.as_str(), &params).await?;

        let samples: Vec<SampledStatement> =
            rows.iter().filter_map(|row| self.row_to_sample(row)).collect();
        debug!("PostgreSQL sample returned {} statements", samples.len());
        Ok(samples)
    }

    async fn fetch_binds(&self, _statement: &SampledStatement) -> Result<Vec<BindValue>> {
        Ok(Vec::new())
    }

    async fn average_latency_ms(
        &self,
        source_id: Option<&str>,
        text: &str,
    ) -> Result<Option<f64>> {
        if !self.has_pg_stat_statements {
            return Ok(None);
        }

        let client = self.client().await?;
        let query_id = source_id.and_then(|id| id.parse::<i64>().ok());
        let row = match query_id {
            Some(id) => {
                client
                    .query_one(
                        "SELECT SUM(total_exec_time) / NULLIF(SUM(calls), 0)::float8 \
                         FROM pg_stat_statements WHERE queryid = $1",
                        &[&id],
                    )
                    .await?
            }
            None => {
                client
                    .query_one(
                        "SELECT SUM(total_exec_time) / NULLIF(SUM(calls), 0)::float8 \
                         FROM pg_stat_statements WHERE btrim(query) = $1",
                        &[&text.trim()],
                    )
                    .await?
            }
        };
        Ok(row.get::<_, Option<f64>>(0))
    }

    async fn test_connection(&self) -> Result<()> {
        let client = self.client().await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }

    fn db_type(&self) -> &str {
        "postgres"
    }
}
