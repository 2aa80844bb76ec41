//! The statement record flowing through every stage of a replay.
//!
//! A [`StatementRecord`] is immutable once built: its fingerprint is computed
//! in the constructor and measurements are kept in separate result types
//! that refer back to it by fingerprint or input position.

mod fingerprint;
mod lexer;
mod render;

pub use fingerprint::FingerprintStrategy;
pub(crate) use lexer::single_statement;
pub use render::render_with_binds;

use crate::error::{ReplayError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A scalar bind value captured alongside a statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BindValue {
    Null,
    Number(f64),
    Text(String),
}

/// How a target reads string literals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LiteralStyle {
    /// Only a doubled quote escapes (SQL standard, PostgreSQL default).
    #[default]
    Standard,
    /// A backslash escapes too (MySQL default `sql_mode`).
    BackslashEscapes,
}

impl BindValue {
    /// Render as a standard SQL literal.
    pub fn to_sql_literal(&self) -> String {
        self.to_sql_literal_in(LiteralStyle::Standard)
    }

    /// Render as a SQL literal for a target that reads literals in `style`.
    pub fn to_sql_literal_in(&self, style: LiteralStyle) -> String {
        match self {
            BindValue::Null => "NULL".to_string(),
            BindValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => {
                format!("{}", *n as i64)
            }
            BindValue::Number(n) => format!("{}", n),
            BindValue::Text(s) => {
                let escaped = match style {
                    LiteralStyle::Standard => s.replace('\'', "''"),
                    LiteralStyle::BackslashEscapes => {
                        s.replace('\\', "\\\\").replace('\'', "''")
                    }
                };
                format!("'{}'", escaped)
            }
        }
    }
}

/// Provenance of a statement captured from a live source system.
///
/// Every counter is optional: a missing value means "not reported", never zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OriginMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,

    /// Source-side execution identifier (SQL_ID, query hash, query id).
    #[serde(default, alias = "sql_id", skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_number: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_active_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executions: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_elapsed_ms: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_time_us: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_time_us: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_gets: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_reads: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows_processed: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetches: Option<i64>,

    /// Fields this version does not know about, preserved on rewrite.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl OriginMetadata {
    fn is_empty(&self) -> bool {
        *self == OriginMetadata::default()
    }
}

/// One SQL statement with optional bind values and provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct StatementRecord {
    text: String,
    bind_values: Vec<BindValue>,
    origin: Option<OriginMetadata>,
    fingerprint: String,
}

impl StatementRecord {
    /// Build a record from statement text alone.
    pub fn from_text(text: impl Into<String>, strategy: FingerprintStrategy) -> Result<Self> {
        Self::new(text, Vec::new(), None, strategy)
    }

    /// Build a record. Fails if the text is blank.
    pub fn new(
        text: impl Into<String>,
        bind_values: Vec<BindValue>,
        origin: Option<OriginMetadata>,
        strategy: FingerprintStrategy,
    ) -> Result<Self> {
        let text = text.into().trim().to_string();
        if text.is_empty() {
            return Err(ReplayError::source_read(0, "statement text is empty"));
        }
        let fingerprint = strategy.fingerprint(&text);
        Ok(Self {
            text,
            bind_values,
            origin: origin.filter(|o| !o.is_empty()),
            fingerprint,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn bind_values(&self) -> &[BindValue] {
        &self.bind_values
    }

    pub fn origin(&self) -> Option<&OriginMetadata> {
        self.origin.as_ref()
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Text to submit to a target, with bind values inlined as literals
    /// in the target's `style`.
    pub fn executable_text(&self, style: LiteralStyle) -> String {
        render_with_binds(&self.text, &self.bind_values, style)
    }

    /// Serialize into the persisted one-record-per-line format.
    pub fn to_json_line(&self) -> Result<String> {
        let record = PersistedRecord {
            text: Some(self.text.clone()),
            sql_text: None,
            bind_values: if self.bind_values.is_empty() {
                None
            } else {
                Some(self.bind_values.clone())
            },
            binds: None,
            origin_metadata: self.origin.clone(),
            fingerprint: Some(self.fingerprint.clone()),
            extra: Map::new(),
        };
        Ok(serde_json::to_string(&record)?)
    }

    /// Parse one persisted line. The fingerprint is recomputed with `strategy`.
    ///
    /// Also accepts the legacy capture layout (`sql_text`, `binds` and
    /// provenance fields at the top level).
    pub fn from_json_line(line: &str, strategy: FingerprintStrategy) -> Result<Self> {
        let record: PersistedRecord = serde_json::from_str(line)?;

        let legacy = record.text.is_none();
        let text = record
            .text
            .or(record.sql_text)
            .ok_or_else(|| ReplayError::source_read(0, "record has no `text` field"))?;

        let bind_values = match (record.bind_values, record.binds) {
            (Some(values), _) => values,
            (None, Some(binds)) => binds.into_iter().map(LegacyBind::into_value).collect(),
            (None, None) => Vec::new(),
        };

        let origin = match record.origin_metadata {
            Some(origin) => Some(origin),
            None if legacy && !record.extra.is_empty() => {
                Some(serde_json::from_value(Value::Object(record.extra))?)
            }
            None => None,
        };

        Self::new(text, bind_values, origin, strategy)
    }
}

/// Wire layout of one persisted record.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,

    #[serde(default, skip_serializing)]
    sql_text: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    bind_values: Option<Vec<BindValue>>,

    #[serde(default, skip_serializing)]
    binds: Option<Vec<LegacyBind>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    origin_metadata: Option<OriginMetadata>,

    /// Written for downstream consumers; ignored on read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fingerprint: Option<String>,

    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Bind entry as written by the legacy capture format.
#[derive(Debug, Serialize, Deserialize)]
struct LegacyBind {
    #[serde(default)]
    value: Option<Value>,
}

impl LegacyBind {
    fn into_value(self) -> BindValue {
        match self.value {
            None | Some(Value::Null) => BindValue::Null,
            Some(Value::Number(n)) => n.as_f64().map(BindValue::Number).unwrap_or(BindValue::Null),
            Some(Value::String(s)) => BindValue::Text(s),
            Some(other) => BindValue::Text(other.to_string()),
        }
    }
}
