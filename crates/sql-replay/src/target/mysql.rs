//! MySQL wire-protocol target sessions (MySQL, MariaDB, OceanBase tenants).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, Row, SslOpts};
use tracing::warn;

use super::{explain_sql, ExecOutput, TargetConnector, TargetError, TargetErrorKind, TargetSession};
use crate::config::TargetConfig;
use crate::statement::LiteralStyle;

/// Server error codes that mean "does not parse".
const SYNTAX_CODES: &[u16] = &[
    1064, // ER_PARSE_ERROR
    1149, // ER_SYNTAX_ERROR
];

/// Server error codes that mean "parses, but the target cannot run it".
const SEMANTIC_CODES: &[u16] = &[
    1054, // ER_BAD_FIELD_ERROR
    1142, // ER_TABLEACCESS_DENIED_ERROR
    1146, // ER_NO_SUCH_TABLE
    1235, // ER_NOT_SUPPORTED_YET
    1305, // ER_SP_DOES_NOT_EXIST
    1327, // ER_SP_UNDECLARED_VAR
    1630, // ER_FUNC_INEXISTENT_NAME_COLLISION
];

/// Server error codes for a killed or timed-out statement.
const TIMEOUT_CODES: &[u16] = &[
    1317, // ER_QUERY_INTERRUPTED
    3024, // ER_QUERY_TIMEOUT
];

/// Opens MySQL-protocol sessions.
pub struct MysqlConnector {
    opts: Opts,
    connect_timeout: Duration,
}

impl MysqlConnector {
    pub fn new(config: &TargetConfig) -> Self {
        let ssl_opts = match config.ssl_mode.to_lowercase().as_str() {
            "disable" => {
                warn!("MySQL TLS is disabled. Credentials will be transmitted in plaintext.");
                None
            }
            "verify-ca" | "verify_ca" | "verify-full" | "verify_identity" => {
                Some(SslOpts::default())
            }
            _ => Some(SslOpts::default().with_danger_accept_invalid_certs(true)),
        };

        let mut builder = OptsBuilder::default()
            .ip_or_hostname(&config.host)
            .tcp_port(config.port())
            .db_name(Some(&config.database))
            .user(Some(&config.user))
            .pass(Some(&config.password))
            .init(vec!["SET NAMES utf8mb4"]);

        if let Some(ssl) = ssl_opts {
            builder = builder.ssl_opts(ssl);
        }

        Self {
            opts: builder.into(),
            connect_timeout: Duration::from_secs(config.connect_timeout_seconds),
        }
    }
}

#[async_trait]
impl TargetConnector for MysqlConnector {
    async fn open(&self) -> std::result::Result<Box<dyn TargetSession>, TargetError> {
        let conn = tokio::time::timeout(self.connect_timeout, Conn::new(self.opts.clone()))
            .await
            .map_err(|_| {
                TargetError::connection(format!(
                    "connect timed out after {}s",
                    self.connect_timeout.as_secs()
                ))
            })?
            .map_err(classify)?;
        Ok(Box::new(MysqlSession { conn }))
    }

    fn db_type(&self) -> &str {
        "mysql"
    }

    fn literal_style(&self) -> LiteralStyle {
        LiteralStyle::BackslashEscapes
    }
}

/// One MySQL-protocol connection.
pub struct MysqlSession {
    conn: Conn,
}

#[async_trait]
impl TargetSession for MysqlSession {
    async fn explain(&mut self, sql: &str) -> std::result::Result<String, TargetError> {
        let rows: Vec<Row> = self
            .conn
            .query(explain_sql(sql)?)
            .await
            .map_err(classify)?;

        let plan: Vec<String> = rows
            .into_iter()
            .map(|row| {
                (0..row.len())
                    .map(|i| match row.as_ref(i) {
                        None | Some(mysql_async::Value::NULL) => "NULL".to_string(),
                        Some(mysql_async::Value::Bytes(bytes)) => {
                            String::from_utf8_lossy(bytes).into_owned()
                        }
                        Some(other) => other.as_sql(true),
                    })
                    .collect::<Vec<_>>()
                    .join(" | ")
            })
            .collect();
        Ok(plan.join("\n"))
    }

    async fn execute(&mut self, sql: &str) -> std::result::Result<ExecOutput, TargetError> {
        let start = Instant::now();
        let mut result = self.conn.query_iter(sql).await.map_err(classify)?;
        let mut rows = result.affected_rows();
        // drain every result set so the connection is reusable
        while !result.is_empty() {
            let set: Vec<Row> = result.collect().await.map_err(classify)?;
            rows += set.len() as u64;
        }
        let elapsed = start.elapsed();
        Ok(ExecOutput { rows, elapsed })
    }

    async fn close(self: Box<Self>) {
        if let Err(e) = self.conn.disconnect().await {
            warn!("Error closing MySQL target session: {}", e);
        }
    }
}

/// Map a driver error onto the target taxonomy.
fn classify(err: mysql_async::Error) -> TargetError {
    let message = err.to_string();
    let kind = match &err {
        mysql_async::Error::Server(server) => classify_server_code(server.code),
        mysql_async::Error::Io(_) => TargetErrorKind::Connection,
        mysql_async::Error::Driver(_) => TargetErrorKind::Connection,
        _ => TargetErrorKind::Other,
    };
    TargetError::new(kind, message)
}

fn classify_server_code(code: u16) -> TargetErrorKind {
    if SYNTAX_CODES.contains(&code) {
        TargetErrorKind::Syntax
    } else if SEMANTIC_CODES.contains(&code) {
        TargetErrorKind::Semantic
    } else if TIMEOUT_CODES.contains(&code) {
        TargetErrorKind::Timeout
    } else if matches!(code, 1040 | 1053 | 2006 | 2013) {
        // too many connections, server shutdown, gone away, lost connection
        TargetErrorKind::Connection
    } else {
        TargetErrorKind::Other
    }
}
