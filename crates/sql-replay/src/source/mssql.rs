//! SQL Server source.
//!
//! Samples the plan cache (`sys.dm_exec_query_stats`) through a bb8 pool of
//! Tiberius clients. Bind values come from the `ParameterCompiledValue`
//! attributes of the cached plan, i.e. the values the plan was compiled for.

use std::time::Duration;

use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use chrono::NaiveDateTime;
use quick_xml::events::Event;
use quick_xml::Reader;
use tiberius::{AuthMethod, Client, Config, EncryptionLevel, Query, Row};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info};

use super::{SampleQuery, SampledStatement, SourceSystem};
use crate::config::SourceConfig;
use crate::error::{ReplayError, Result};
use crate::statement::BindValue;

/// Connection acquisition timeout from pool (30 seconds).
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Idle connection timeout (5 minutes).
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Sampling and baseline lookups never need many connections.
const POOL_MAX_SIZE: u32 = 4;

/// Statement text of one plan-cache entry, cut out of its batch.
const STATEMENT_TEXT_EXPR: &str = "SUBSTRING(st.text, (qs.statement_start_offset / 2) + 1, \
     ((CASE qs.statement_end_offset WHEN -1 THEN DATALENGTH(st.text) \
     ELSE qs.statement_end_offset END - qs.statement_start_offset) / 2) + 1)";

/// Connection manager for bb8 pool with Tiberius.
#[derive(Clone)]
struct TiberiusConnectionManager {
    config: SourceConfig,
}

impl TiberiusConnectionManager {
    fn build_config(&self) -> Config {
        let mut config = Config::new();
        config.host(&self.config.host);
        config.port(self.config.port());
        config.database(&self.config.database);
        config.authentication(AuthMethod::sql_server(
            &self.config.user,
            &self.config.password,
        ));

        if self.config.encrypt_enabled() {
            if self.config.trust_server_cert {
                config.trust_cert();
            }
            config.encryption(EncryptionLevel::Required);
        } else {
            config.encryption(EncryptionLevel::NotSupported);
        }

        config.application_name("sql-replay");
        config
    }
}

#[async_trait]
impl bb8::ManageConnection for TiberiusConnectionManager {
    type Connection = Client<Compat<TcpStream>>;
    type Error = tiberius::error::Error;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        let config = self.build_config();
        let tcp = TcpStream::connect(config.get_addr()).await.map_err(|e| {
            tiberius::error::Error::Io {
                kind: e.kind(),
                message: e.to_string(),
            }
        })?;
        tcp.set_nodelay(true).ok();
        Client::connect(config, tcp.compat_write()).await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        conn.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// SQL Server source system.
pub struct MssqlSource {
    pool: Pool<TiberiusConnectionManager>,
}

impl MssqlSource {
    /// Connect and verify the source is reachable.
    pub async fn new(config: SourceConfig) -> Result<Self> {
        let manager = TiberiusConnectionManager {
            config: config.clone(),
        };
        let pool = Pool::builder()
            .max_size(POOL_MAX_SIZE)
            .connection_timeout(POOL_CONNECTION_TIMEOUT)
            .idle_timeout(Some(POOL_IDLE_TIMEOUT))
            .test_on_check_out(true)
            .build(manager)
            .await
            .map_err(|e| ReplayError::pool(e, "creating MSSQL source pool"))?;

        let source = Self { pool };
        source.test_connection().await?;

        info!(
            "Connected to MSSQL source: {}:{}/{}",
            config.host,
            config.port(),
            config.database
        );

        Ok(source)
    }

    async fn get_client(&self) -> Result<PooledConnection<'_, TiberiusConnectionManager>> {
        self.pool
            .get()
            .await
            .map_err(|e| ReplayError::pool(e, "getting MSSQL connection from pool"))
    }

    fn row_to_sample(row: &Row) -> Option<SampledStatement> {
        let text = row.get::<&str, _>("sql_text")?.trim().to_string();
        if text.is_empty() {
            return None;
        }
        Some(SampledStatement {
            text,
            source_id: row.get::<&str, _>("source_id").map(str::to_string),
            child_number: row.get::<i64, _>("child_number"),
            schema: row.get::<&str, _>("schema_name").map(str::to_string),
            module: row.get::<&str, _>("module_name").map(str::to_string),
            last_active_time: row.get::<NaiveDateTime, _>("last_execution_time"),
            executions: row.get::<i64, _>("execution_count"),
            elapsed_time_us: row.get::<i64, _>("total_elapsed_time"),
            cpu_time_us: row.get::<i64, _>("total_worker_time"),
            buffer_gets: row.get::<i64, _>("total_logical_reads"),
            disk_reads: row.get::<i64, _>("total_physical_reads"),
            rows_processed: row.get::<i64, _>("total_rows"),
            fetches: None,
            bind_handle: row.get::<&str, _>("plan_handle").map(str::to_string),
        })
    }
}

/// Sampling query. `@P1` is the row limit, `@P2` the watermark (or the
/// lookback in seconds), then one parameter per schema and module filter.
fn sampling_sql(query: &SampleQuery) -> String {
    let mut param = 3;
    let mut placeholders = |n: usize| {
        let list: Vec<String> = (0..n)
            .map(|_| {
                let p = format!("@P{}", param);
                param += 1;
                p
            })
            .collect();
        list.join(", ")
    };

    let watermark = if query.since.is_some() {
        "qs.last_execution_time > @P2"
    } else {
        "qs.last_execution_time > DATEADD(SECOND, -@P2, GETDATE())"
    };

    let mut filters = String::new();
    if !query.schemas.is_empty() {
        filters.push_str(&format!(
            "\n  AND DB_NAME(st.dbid) IN ({})",
            placeholders(query.schemas.len())
        ));
    }
    if !query.modules.is_empty() {
        filters.push_str(&format!(
            "\n  AND OBJECT_NAME(st.objectid, st.dbid) IN ({})",
            placeholders(query.modules.len())
        ));
    }

    format!(
        r#"SELECT TOP (@P1)
    CONVERT(VARCHAR(20), qs.query_hash, 1) AS source_id,
    CAST(qs.plan_generation_num AS BIGINT) AS child_number,
    DB_NAME(st.dbid) AS schema_name,
    OBJECT_NAME(st.objectid, st.dbid) AS module_name,
    qs.last_execution_time,
    {text} AS sql_text,
    qs.execution_count,
    qs.total_elapsed_time,
    qs.total_worker_time,
    qs.total_logical_reads,
    qs.total_physical_reads,
    qs.total_rows,
    CONVERT(VARCHAR(130), qs.plan_handle, 1) AS plan_handle
FROM sys.dm_exec_query_stats qs
CROSS APPLY sys.dm_exec_sql_text(qs.sql_handle) st
WHERE {watermark}{filters}
ORDER BY qs.last_execution_time ASC"#,
        text = STATEMENT_TEXT_EXPR,
        watermark = watermark,
        filters = filters,
    )
}

#[async_trait]
impl SourceSystem for MssqlSource {
    async fn sample_recent(&self, query: &SampleQuery) -> Result<Vec<SampledStatement>> {
        let sql = sampling_sql(query);
        let mut q = Query::new(sql);
        q.bind(query.limit as i64);
        match query.since {
            Some(since) => q.bind(since),
            None => q.bind(query.lookback.as_secs() as i32),
        }
        for schema in &query.schemas {
            q.bind(schema.as_str());
        }
        for module in &query.modules {
            q.bind(module.as_str());
        }

        let mut client = self.get_client().await?;
        let stream = q.query(&mut *client).await?;
        let rows = stream.into_first_result().await?;

        let samples: Vec<SampledStatement> =
            rows.iter().filter_map(Self::row_to_sample).collect();
        debug!("MSSQL sample returned {} statements", samples.len());
        Ok(samples)
    }

    async fn fetch_binds(&self, statement: &SampledStatement) -> Result<Vec<BindValue>> {
        let Some(handle) = statement.bind_handle.as_deref() else {
            return Ok(Vec::new());
        };

        let mut q = Query::new(
            "SELECT CAST(qp.query_plan AS NVARCHAR(MAX)) \
             FROM sys.dm_exec_query_plan(CONVERT(VARBINARY(64), @P1, 1)) qp",
        );
        q.bind(handle);

        let mut client = self.get_client().await?;
        let stream = q.query(&mut *client).await?;
        let plan = match stream.into_row().await? {
            Some(row) => row.get::<&str, _>(0).map(str::to_string),
            None => None,
        };

        Ok(plan.map(|xml| parse_compiled_parameters(&xml)).unwrap_or_default())
    }

    async fn average_latency_ms(
        &self,
        source_id: Option<&str>,
        text: &str,
    ) -> Result<Option<f64>> {
        let (predicate, key) = match source_id {
            Some(id) => ("CONVERT(VARCHAR(20), qs.query_hash, 1) = @P1".to_string(), id),
            None => (format!("LTRIM(RTRIM({})) = @P1", STATEMENT_TEXT_EXPR), text.trim()),
        };
        let sql = format!(
            "SELECT CAST(SUM(qs.total_elapsed_time) AS FLOAT) \
                    / NULLIF(SUM(qs.execution_count), 0) / 1000.0 \
             FROM sys.dm_exec_query_stats qs \
             CROSS APPLY sys.dm_exec_sql_text(qs.sql_handle) st \
             WHERE {}",
            predicate
        );

        let mut q = Query::new(sql);
        q.bind(key);

        let mut client = self.get_client().await?;
        let stream = q.query(&mut *client).await?;
        Ok(stream
            .into_row()
            .await?
            .and_then(|row| row.get::<f64, _>(0)))
    }

    async fn test_connection(&self) -> Result<()> {
        let mut client = self.get_client().await?;
        client.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn db_type(&self) -> &str {
        "mssql"
    }
}

/// Extract `ParameterCompiledValue`s from showplan XML, ordered by parameter
/// position (`@P1`, `@P2`, ...) and otherwise by order of appearance.
fn parse_compiled_parameters(xml: &str) -> Vec<BindValue> {
    let mut reader = Reader::from_str(xml);
    let mut params: Vec<(Option<usize>, usize, BindValue)> = Vec::new();
    let mut seen = std::collections::HashSet::new();
    let mut order = 0usize;

    loop {
        let element = match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => e,
            Ok(Event::Eof) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("Stopped reading showplan XML: {}", e);
                break;
            }
        };
        if element.local_name().as_ref() != b"ColumnReference" {
            continue;
        }
        order += 1;

        let (mut column, mut value) = (None, None);
        for attr in element.attributes().flatten() {
            let slot = match attr.key.local_name().as_ref() {
                b"Column" => &mut column,
                b"ParameterCompiledValue" => &mut value,
                _ => continue,
            };
            *slot = attr.unescape_value().ok().map(|v| v.into_owned());
        }
        let (Some(column), Some(value)) = (column, value) else {
            continue;
        };
        if !seen.insert(column.clone()) {
            continue;
        }
        let position = column
            .strip_prefix("@P")
            .or_else(|| column.strip_prefix("@p"))
            .and_then(|n| n.parse().ok());
        params.push((position, order, parse_compiled_value(&value)));
    }

    params.sort_by_key(|(position, order, _)| (position.unwrap_or(usize::MAX), *order));
    params.into_iter().map(|(_, _, value)| value).collect()
}

/// `(42)`, `N'abc'`, `'2024-01-01'`, `NULL`.
fn parse_compiled_value(raw: &str) -> BindValue {
    let mut value = raw.trim();
    while value.starts_with('(') && value.ends_with(')') && value.len() >= 2 {
        value = value[1..value.len() - 1].trim();
    }

    if value.eq_ignore_ascii_case("NULL") {
        return BindValue::Null;
    }
    let quoted = value
        .strip_prefix('N')
        .filter(|v| v.starts_with('\''))
        .unwrap_or(value);
    if quoted.len() >= 2 && quoted.starts_with('\'') && quoted.ends_with('\'') {
        return BindValue::Text(quoted[1..quoted.len() - 1].replace("''", "'"));
    }
    match value.parse::<f64>() {
        Ok(n) if n.is_finite() => BindValue::Number(n),
        _ => BindValue::Text(value.to_string()),
    }
}
