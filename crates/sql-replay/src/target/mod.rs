//! Target database boundary.
//!
//! A [`TargetConnector`] opens independent [`TargetSession`]s; each session
//! owns one physical connection and is never shared between workers, since
//! session variables and cursor state must not leak between units of work.

pub mod mysql;
pub mod postgres;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::TargetConfig;
use crate::error::{ReplayError, Result};
use crate::statement::{single_statement, LiteralStyle};

/// Coarse class of a target-side failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetErrorKind {
    /// The statement does not parse.
    Syntax,
    /// Parses but refers to unsupported features or missing objects.
    Semantic,
    /// Connection lost or could not be established.
    Connection,
    /// Gave up waiting for the target.
    Timeout,
    /// Anything else.
    Other,
}

/// Structured error returned by target sessions.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct TargetError {
    pub kind: TargetErrorKind,
    pub message: String,
}

impl TargetError {
    pub fn new(kind: TargetErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(TargetErrorKind::Connection, message)
    }

    pub fn is_connection(&self) -> bool {
        self.kind == TargetErrorKind::Connection
    }
}

/// Outcome of a full execution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecOutput {
    /// Rows returned or affected.
    pub rows: u64,
    /// Time spent in the execution call.
    pub elapsed: Duration,
}

/// Opens sessions against the target database.
#[async_trait]
pub trait TargetConnector: Send + Sync {
    /// Open a new, independent session.
    async fn open(&self) -> std::result::Result<Box<dyn TargetSession>, TargetError>;

    /// Database type identifier ("postgres", "mysql").
    fn db_type(&self) -> &str;

    /// How the target reads string literals in statement text.
    fn literal_style(&self) -> LiteralStyle {
        LiteralStyle::Standard
    }
}

/// One connection to the target database.
#[async_trait]
pub trait TargetSession: Send {
    /// Plan the statement without executing it; returns the plan text.
    async fn explain(&mut self, sql: &str) -> std::result::Result<String, TargetError>;

    /// Execute the statement, consuming any result set.
    async fn execute(&mut self, sql: &str) -> std::result::Result<ExecOutput, TargetError>;

    /// Close the session.
    async fn close(self: Box<Self>);
}

/// Build a connector for the configured target database.
pub fn connector(config: &TargetConfig) -> Result<Arc<dyn TargetConnector>> {
    match config.r#type.as_str() {
        "postgres" => Ok(Arc::new(postgres::PostgresConnector::new(config)?)),
        "mysql" => Ok(Arc::new(mysql::MysqlConnector::new(config))),
        other => Err(ReplayError::Config(format!(
            "Unsupported target type '{}'",
            other
        ))),
    }
}

/// Plan-only form of a statement. Text holding more than one statement is
/// refused: only the first would be planned and the rest would run.
pub(crate) fn explain_sql(sql: &str) -> std::result::Result<String, TargetError> {
    match single_statement(sql) {
        Some(statement) => Ok(format!("EXPLAIN {}", statement)),
        None => Err(TargetError::new(
            TargetErrorKind::Syntax,
            "text holds more than one statement; plan-only checks take exactly one",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explain_sql_strips_terminator() {
        assert_eq!(explain_sql(" select 1; ").unwrap(), "EXPLAIN select 1");
        assert_eq!(
            explain_sql("select 1; -- trailing note").unwrap(),
            "EXPLAIN select 1"
        );
    }

    #[test]
    fn test_explain_sql_refuses_trailing_statements() {
        let err = explain_sql("select * from t; delete from t").unwrap_err();
        assert_eq!(err.kind, TargetErrorKind::Syntax);
        assert!(explain_sql("select 'a\\''; drop table t").is_err());
    }
}
