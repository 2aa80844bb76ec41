//! Configuration type definitions.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::statement::FingerprintStrategy;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source database; needed for online capture and online baselines.
    #[serde(default)]
    pub source: Option<SourceConfig>,

    /// Target database under test.
    pub target: TargetConfig,

    /// Capture sampler behavior.
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Replay and benchmark behavior.
    #[serde(default)]
    pub replay: ReplayConfig,
}

/// Source database configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Database type: "mssql" or "postgres".
    #[serde(default = "default_mssql")]
    pub r#type: String,

    /// Database host.
    pub host: String,

    /// Database port (default depends on type).
    #[serde(default)]
    pub port: Option<u16>,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Encrypt connection, MSSQL only (default: "true").
    #[serde(default = "default_true_string")]
    pub encrypt: String,

    /// Trust server certificate, MSSQL only (default: false).
    #[serde(default)]
    pub trust_server_cert: bool,

    /// SSL mode, PostgreSQL only (default: "require").
    #[serde(default = "default_require")]
    pub ssl_mode: String,
}

impl SourceConfig {
    /// Port, falling back to the default for the database type.
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(match self.r#type.as_str() {
            "postgres" => 5432,
            _ => 1433,
        })
    }

    /// Whether the MSSQL `encrypt` flag asks for TLS.
    pub fn encrypt_enabled(&self) -> bool {
        !matches!(
            self.encrypt.to_lowercase().as_str(),
            "false" | "no" | "0" | "disable"
        )
    }
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("type", &self.r#type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("encrypt", &self.encrypt)
            .field("trust_server_cert", &self.trust_server_cert)
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

/// Target database configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Database type: "postgres" or "mysql" (MySQL wire protocol).
    #[serde(default = "default_postgres")]
    pub r#type: String,

    /// Database host.
    pub host: String,

    /// Database port (default depends on type).
    #[serde(default)]
    pub port: Option<u16>,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// SSL mode (default: "require").
    #[serde(default = "default_require")]
    pub ssl_mode: String,

    /// Connect timeout in seconds (default: 15).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
}

impl TargetConfig {
    /// Port, falling back to the default for the database type.
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(match self.r#type.as_str() {
            "mysql" => 3306,
            _ => 5432,
        })
    }
}

impl fmt::Debug for TargetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetConfig")
            .field("type", &self.r#type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("ssl_mode", &self.ssl_mode)
            .field("connect_timeout_seconds", &self.connect_timeout_seconds)
            .finish()
    }
}

/// Capture sampler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// JSONL file the sampler appends to.
    #[serde(default = "default_capture_output")]
    pub output: PathBuf,

    /// Total sampling duration in seconds (default: 3600).
    #[serde(default = "default_duration")]
    pub duration_seconds: u64,

    /// Sleep between polling cycles in seconds (default: 5).
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,

    /// Maximum statements fetched per cycle (default: 200).
    #[serde(default = "default_limit")]
    pub limit_per_interval: usize,

    /// Drop statements whose fingerprint was already emitted this run.
    #[serde(default)]
    pub dedup: bool,

    /// Look up bind values for each sampled statement (default: true).
    #[serde(default = "default_true")]
    pub include_binds: bool,

    /// Only keep statements from these schemas.
    #[serde(default)]
    pub schemas: Vec<String>,

    /// Only keep statements from these modules.
    #[serde(default)]
    pub modules: Vec<String>,

    /// Compare schema/module filters case-insensitively.
    #[serde(default)]
    pub case_insensitive_filters: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            output: default_capture_output(),
            duration_seconds: default_duration(),
            interval_seconds: default_interval(),
            limit_per_interval: default_limit(),
            dedup: false,
            include_binds: true,
            schemas: Vec::new(),
            modules: Vec::new(),
            case_insensitive_filters: false,
        }
    }
}

/// Where per-statement baselines come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaselineMode {
    #[default]
    None,
    Online,
    File,
}

/// Replay and benchmark configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Concurrent benchmark workers (default: 1).
    #[serde(default = "default_one")]
    pub concurrency: usize,

    /// Executions per statement (default: 1).
    #[serde(default = "default_one")]
    pub iterations: usize,

    /// Per-attempt timeout in milliseconds.
    #[serde(default)]
    pub attempt_timeout_ms: Option<u64>,

    /// Overall run timeout in seconds.
    #[serde(default)]
    pub run_timeout_seconds: Option<u64>,

    /// Malformed JSONL lines tolerated before the read fails (default: 0).
    #[serde(default)]
    pub max_malformed_lines: usize,

    /// Fingerprint strategy (default: exact).
    #[serde(default)]
    pub fingerprint: FingerprintStrategy,

    /// Baseline strategy (default: none).
    #[serde(default)]
    pub baseline: BaselineMode,

    /// JSON object mapping statement text to average latency in ms.
    #[serde(default)]
    pub baseline_file: Option<PathBuf>,

    /// Statement list produced inside a capture directory (default: "sqls.txt").
    #[serde(default = "default_handoff_file")]
    pub handoff_file: String,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            iterations: 1,
            attempt_timeout_ms: None,
            run_timeout_seconds: None,
            max_malformed_lines: 0,
            fingerprint: FingerprintStrategy::default(),
            baseline: BaselineMode::default(),
            baseline_file: None,
            handoff_file: default_handoff_file(),
        }
    }
}

fn default_mssql() -> String {
    "mssql".to_string()
}

fn default_postgres() -> String {
    "postgres".to_string()
}

fn default_true_string() -> String {
    "true".to_string()
}

fn default_require() -> String {
    "require".to_string()
}

fn default_connect_timeout() -> u64 {
    15
}

fn default_capture_output() -> PathBuf {
    PathBuf::from("captured_sqls.jsonl")
}

fn default_duration() -> u64 {
    3600
}

fn default_interval() -> u64 {
    5
}

fn default_limit() -> usize {
    200
}

fn default_one() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_handoff_file() -> String {
    "sqls.txt".to_string()
}
