//! Replay orchestrator - wires sources, target and evaluators into runs.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::baseline::BaselineResolver;
use crate::bench::{BenchmarkExecutor, BenchmarkOptions, BenchmarkRun};
use crate::capture::{CaptureOptions, CaptureSampler, CaptureSummary};
use crate::compat::{CompatibilityChecker, CompatibilityReport, CompatibilitySummary};
use crate::config::{BaselineMode, Config};
use crate::error::{ReplayError, Result};
use crate::source::{self, SourceSystem};
use crate::statement::{OriginMetadata, StatementRecord};
use crate::stream::{JsonlWriter, StatementSource};
use crate::target::{self, TargetConnector};

/// Replay orchestrator.
pub struct Replayer {
    config: Config,
    target: Arc<dyn TargetConnector>,
    source: OnceCell<Arc<dyn SourceSystem>>,
    store_file: Option<PathBuf>,
}

/// Compatibility section of a run result.
#[derive(Debug, Clone, Serialize)]
pub struct CompatibilityOutput {
    pub summary: CompatibilitySummary,
    pub reports: Vec<CompatibilityReport>,
}

/// Capture section of a run result.
#[derive(Debug, Clone, Serialize)]
pub struct CaptureOutput {
    pub output: PathBuf,
    pub summary: CaptureSummary,
}

/// Result of a replay run, handed to the reporter.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayResult {
    /// Unique run identifier.
    pub run_id: String,

    /// "compat", "perf" or "capture".
    pub mode: String,

    /// Final status: "completed", "cancelled" or "timed_out".
    pub status: String,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// When the run started.
    pub started_at: DateTime<Utc>,

    /// When the run completed.
    pub completed_at: DateTime<Utc>,

    /// Where statements came from.
    pub source: String,

    /// Statements read from the source.
    pub statements: usize,

    /// Hash of the effective configuration.
    pub config_hash: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub compatibility: Option<CompatibilityOutput>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub benchmark: Option<BenchmarkRun>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture: Option<CaptureOutput>,
}

impl ReplayResult {
    fn start(mode: &str, source: String, config: &Config) -> (Self, Instant) {
        let now = Utc::now();
        let result = Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            mode: mode.to_string(),
            status: "running".to_string(),
            duration_seconds: 0.0,
            started_at: now,
            completed_at: now,
            source,
            statements: 0,
            config_hash: config.hash(),
            compatibility: None,
            benchmark: None,
            capture: None,
        };
        info!("Starting {} run: {}", mode, result.run_id);
        (result, Instant::now())
    }

    fn finish(mut self, status: &str, clock: Instant) -> Self {
        self.status = status.to_string();
        self.completed_at = Utc::now();
        self.duration_seconds = clock.elapsed().as_secs_f64();
        self
    }

    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Error for a run that did not complete, so callers can exit with the
    /// matching code after reporting the partial results.
    pub fn status_error(&self) -> Option<ReplayError> {
        match self.status.as_str() {
            STATUS_CANCELLED => Some(ReplayError::Cancelled),
            STATUS_TIMED_OUT => Some(ReplayError::Timeout(format!(
                "run {} stopped at its run timeout",
                self.run_id
            ))),
            _ => None,
        }
    }
}

/// Result of a connectivity check.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub source_configured: bool,
    pub source_connected: bool,
    pub source_latency_ms: u64,
    pub source_error: Option<String>,
    pub target_connected: bool,
    pub target_latency_ms: u64,
    pub target_error: Option<String>,
    pub healthy: bool,
}

impl Replayer {
    /// Create a replayer. No connection is opened until a run needs one.
    pub fn new(config: Config) -> Result<Self> {
        let target = target::connector(&config.target)?;
        Ok(Self {
            config,
            target,
            source: OnceCell::new(),
            store_file: None,
        })
    }

    /// Use a specific target connector.
    pub fn with_connector(mut self, connector: Arc<dyn TargetConnector>) -> Self {
        self.target = connector;
        self
    }

    /// Use an already connected source system.
    pub fn with_source(mut self, source: Arc<dyn SourceSystem>) -> Self {
        self.source = OnceCell::new_with(Some(source));
        self
    }

    /// Persist loaded statements to this JSONL file as well.
    pub fn with_store_file(mut self, path: PathBuf) -> Self {
        self.store_file = Some(path);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    async fn source(&self) -> Result<Arc<dyn SourceSystem>> {
        self.source
            .get_or_try_init(|| async {
                let config = self.config.source.as_ref().ok_or_else(|| {
                    ReplayError::Config("source database is not configured".into())
                })?;
                source::connect(config).await
            })
            .await
            .cloned()
    }

    async fn baseline(&self) -> Result<BaselineResolver> {
        match self.config.replay.baseline {
            BaselineMode::None => Ok(BaselineResolver::Disabled),
            BaselineMode::File => {
                let path = self.config.replay.baseline_file.as_ref().ok_or_else(|| {
                    ReplayError::Config("replay.baseline_file is required for file baselines".into())
                })?;
                BaselineResolver::from_file(path)
            }
            BaselineMode::Online => match self.source().await {
                Ok(source) => Ok(BaselineResolver::Online(source)),
                Err(e) => {
                    warn!("{}", ReplayError::BaselineUnavailable(e.to_string()));
                    Ok(BaselineResolver::Disabled)
                }
            },
        }
    }

    /// One-shot online statement source against the configured source system.
    pub async fn online_source(&self, limit: usize) -> Result<StatementSource> {
        let options = CaptureOptions::from_config(&self.config.capture, self.config.replay.fingerprint);
        let sampler = CaptureSampler::new(self.source().await?, options)?;
        Ok(StatementSource::Online {
            sampler: Box::new(sampler),
            limit,
        })
    }

    async fn load(&self, source: StatementSource) -> Result<Vec<StatementRecord>> {
        let records = source
            .open(self.config.replay.fingerprint)
            .await?
            .collect_all()?;
        if let Some(path) = &self.store_file {
            let mut writer = JsonlWriter::open(path).await?;
            writer.append(&records).await?;
            info!("Stored {} statements in {}", records.len(), path.display());
        }
        Ok(records)
    }

    fn single(&self, sql: &str, source_id: Option<String>) -> Result<StatementRecord> {
        let origin = source_id.map(|id| OriginMetadata {
            source_id: Some(id),
            ..Default::default()
        });
        StatementRecord::new(sql, Vec::new(), origin, self.config.replay.fingerprint)
            .map_err(|_| ReplayError::Config("statement text must not be empty".into()))
    }

    /// Plan-only check of every statement from `source`.
    pub async fn check_compatibility(
        &self,
        source: StatementSource,
        cancel: CancellationToken,
    ) -> Result<ReplayResult> {
        let (mut result, clock) = ReplayResult::start("compat", source.to_string(), &self.config);

        info!("Phase 1: Loading statements");
        let records = self.load(source).await?;
        result.statements = records.len();
        self.run_compat(&mut result, &records, cancel).await;
        let status = status_of(result.compatibility.as_ref().map(|c| c.summary.cancelled), false);
        Ok(result.finish(status, clock))
    }

    /// Plan-only check of one statement.
    pub async fn check_statement(&self, sql: &str, cancel: CancellationToken) -> Result<ReplayResult> {
        let record = self.single(sql, None)?;
        let (mut result, clock) = ReplayResult::start("compat", "statement".into(), &self.config);
        result.statements = 1;
        self.run_compat(&mut result, &[record], cancel).await;
        let status = status_of(result.compatibility.as_ref().map(|c| c.summary.cancelled), false);
        Ok(result.finish(status, clock))
    }

    async fn run_compat(
        &self,
        result: &mut ReplayResult,
        records: &[StatementRecord],
        cancel: CancellationToken,
    ) {
        info!("Phase 2: Checking compatibility");
        let mut checker = CompatibilityChecker::new(self.target.clone()).with_timeout(
            self.config.replay.attempt_timeout_ms.map(Duration::from_millis),
        );
        let (reports, summary) = checker.check_all(records, &cancel).await;
        result.compatibility = Some(CompatibilityOutput { summary, reports });
    }

    /// Benchmark every statement from `source`.
    pub async fn benchmark(
        &self,
        source: StatementSource,
        cancel: CancellationToken,
    ) -> Result<ReplayResult> {
        let (mut result, clock) = ReplayResult::start("perf", source.to_string(), &self.config);

        info!("Phase 1: Loading statements");
        let records = self.load(source).await?;
        result.statements = records.len();

        let run = self.run_benchmark(&records, cancel).await?;
        let status = status_of(Some(run.cancelled), run.timed_out);
        result.benchmark = Some(run);
        Ok(result.finish(status, clock))
    }

    /// Benchmark one statement; `source_id` lets an online baseline find
    /// its execution statistics.
    pub async fn benchmark_statement(
        &self,
        sql: &str,
        source_id: Option<String>,
        cancel: CancellationToken,
    ) -> Result<ReplayResult> {
        let record = self.single(sql, source_id)?;
        let (mut result, clock) = ReplayResult::start("perf", "statement".into(), &self.config);
        result.statements = 1;

        let run = self.run_benchmark(&[record], cancel).await?;
        let status = status_of(Some(run.cancelled), run.timed_out);
        result.benchmark = Some(run);
        Ok(result.finish(status, clock))
    }

    async fn run_benchmark(
        &self,
        records: &[StatementRecord],
        cancel: CancellationToken,
    ) -> Result<BenchmarkRun> {
        info!("Phase 2: Resolving baselines");
        let baseline = self.baseline().await?;

        info!("Phase 3: Benchmarking");
        BenchmarkExecutor::new(
            self.target.clone(),
            BenchmarkOptions::from_config(&self.config.replay),
        )
        .with_baseline(baseline)
        .run(records, cancel)
        .await
    }

    /// Sample the live source into the configured capture file.
    pub async fn capture(&self, cancel: CancellationToken) -> Result<ReplayResult> {
        let output = self.config.capture.output.clone();
        let (mut result, clock) =
            ReplayResult::start("capture", format!("capture {}", output.display()), &self.config);

        info!("Phase 1: Connecting to source");
        let options = CaptureOptions::from_config(&self.config.capture, self.config.replay.fingerprint);
        let mut sampler = CaptureSampler::new(self.source().await?, options)?;
        let mut sink = JsonlWriter::open(&output).await?;

        info!("Phase 2: Sampling");
        let summary = sampler.run(&mut sink, cancel.clone()).await?;
        result.statements = summary.emitted;
        result.capture = Some(CaptureOutput { output, summary });

        let status = status_of(Some(cancel.is_cancelled()), false);
        Ok(result.finish(status, clock))
    }

    /// Check connectivity to the target and, when configured, the source.
    pub async fn health_check(&self) -> Result<HealthCheckResult> {
        let start = Instant::now();
        let (target_connected, target_error) = match self.target.open().await {
            Ok(session) => {
                session.close().await;
                (true, None)
            }
            Err(e) => (false, Some(e.message)),
        };
        let target_latency_ms = start.elapsed().as_millis() as u64;

        let source_configured = self.config.source.is_some();
        let start = Instant::now();
        let (source_connected, source_error) = if source_configured {
            match self.source().await {
                Ok(source) => match source.test_connection().await {
                    Ok(()) => (true, None),
                    Err(e) => (false, Some(e.to_string())),
                },
                Err(e) => (false, Some(e.to_string())),
            }
        } else {
            (false, None)
        };
        let source_latency_ms = start.elapsed().as_millis() as u64;

        Ok(HealthCheckResult {
            source_configured,
            source_connected,
            source_latency_ms,
            source_error,
            target_connected,
            target_latency_ms,
            target_error,
            healthy: target_connected && (source_connected || !source_configured),
        })
    }
}

const STATUS_COMPLETED: &str = "completed";
const STATUS_CANCELLED: &str = "cancelled";
const STATUS_TIMED_OUT: &str = "timed_out";

fn status_of(cancelled: Option<bool>, timed_out: bool) -> &'static str {
    if timed_out {
        STATUS_TIMED_OUT
    } else if cancelled.unwrap_or(false) {
        STATUS_CANCELLED
    } else {
        STATUS_COMPLETED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compat::CompatStatus;
    use crate::target::{ExecOutput, TargetError, TargetErrorKind, TargetSession};
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::TempDir;

    struct EchoTarget;
    struct EchoSession;

    #[async_trait]
    impl TargetConnector for EchoTarget {
        async fn open(&self) -> std::result::Result<Box<dyn TargetSession>, TargetError> {
            Ok(Box::new(EchoSession))
        }

        fn db_type(&self) -> &str {
            "echo"
        }
    }

    #[async_trait]
    impl TargetSession for EchoSession {
        async fn explain(&mut self, sql: &str) -> std::result::Result<String, TargetError> {
            if sql.contains("ROWNUM") {
                return Err(TargetError::new(
                    TargetErrorKind::Semantic,
                    "column \"rownum\" does not exist",
                ));
            }
            Ok("Result".into())
        }

        async fn execute(&mut self, _: &str) -> std::result::Result<ExecOutput, TargetError> {
            Ok(ExecOutput {
                rows: 1,
                elapsed: Duration::from_millis(2),
            })
        }

        async fn close(self: Box<Self>) {}
    }

    fn replayer(extra: &str) -> Replayer {
        let yaml = format!(
            "target:\n  host: localhost\n  database: app\n  user: app\n{}",
            extra
        );
        let config = Config::from_yaml(&yaml).unwrap();
        Replayer::new(config)
            .unwrap()
            .with_connector(Arc::new(EchoTarget))
    }

    fn lines_source(dir: &TempDir, content: &str) -> StatementSource {
        let path = dir.path().join("sqls.sql");
        std::fs::write(&path, content).unwrap();
        StatementSource::Lines { path }
    }

    #[tokio::test]
    async fn test_compat_run() {
        let dir = TempDir::new().unwrap();
        let result = replayer("")
            .check_compatibility(
                lines_source(&dir, "select 1\nselect ROWNUM from t\n"),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.mode, "compat");
        assert_eq!(result.status, "completed");
        assert_eq!(result.statements, 2);
        let compat = result.compatibility.as_ref().unwrap();
        assert_eq!(compat.summary.compatible, 1);
        assert_eq!(compat.reports[1].status, CompatStatus::IncompatibleSemantic);
        assert!(uuid::Uuid::parse_str(&result.run_id).is_ok());
        assert!(result.to_json().unwrap().contains("incompatible-semantic"));
    }

    #[tokio::test]
    async fn test_benchmark_with_file_baseline() {
        let dir = TempDir::new().unwrap();
        let baseline = dir.path().join("baseline.json");
        std::fs::write(&baseline, r#"{"select 1": 1.0}"#).unwrap();

        let extra = format!(
            "replay:\n  iterations: 2\n  concurrency: 2\n  baseline: file\n  baseline_file: {}\n",
            baseline.display()
        );
        let result = replayer(&extra)
            .benchmark(
                lines_source(&dir, "select 1\nselect 2\n"),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let run = result.benchmark.unwrap();
        assert_eq!(run.total_attempts, 4);
        assert_eq!(run.total_failures, 0);
        assert_eq!(run.results[0].baseline_latency_ms, Some(1.0));
        assert_eq!(run.results[0].ratio, Some(2.0));
        assert_eq!(run.results[1].baseline_latency_ms, None);
    }

    #[tokio::test]
    async fn test_store_file_receives_loaded_statements() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("stored.jsonl");
        replayer("")
            .with_store_file(store.clone())
            .check_compatibility(lines_source(&dir, "select 1\n"), CancellationToken::new())
            .await
            .unwrap();
        let stored = std::fs::read_to_string(store).unwrap();
        assert_eq!(stored.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_capture_requires_source() {
        let err = replayer("").capture(CancellationToken::new()).await.err().unwrap();
        assert!(matches!(err, ReplayError::Config(_)));
    }

    #[tokio::test]
    async fn test_interrupted_runs_carry_exit_errors() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let dir = TempDir::new().unwrap();
        let result = replayer("")
            .check_compatibility(lines_source(&dir, "select 1\n"), cancel)
            .await
            .unwrap();
        assert_eq!(result.status, "cancelled");
        let err = result.status_error().unwrap();
        assert!(matches!(err, ReplayError::Cancelled));
        assert_eq!(err.exit_code(), crate::error::EXIT_CANCELLED);

        let config = Config::from_yaml("target:\n  host: h\n  database: d\n  user: u\n").unwrap();
        let (started, clock) = ReplayResult::start("perf", "statement".into(), &config);
        let timed_out = started.finish(STATUS_TIMED_OUT, clock);
        assert_eq!(
            timed_out.status_error().map(|e| e.exit_code()),
            Some(crate::error::EXIT_TIMEOUT)
        );

        let (started, clock) = ReplayResult::start("perf", "statement".into(), &config);
        assert!(started.finish(STATUS_COMPLETED, clock).status_error().is_none());
    }

    #[tokio::test]
    async fn test_health_check_without_source() {
        let health = replayer("").health_check().await.unwrap();
        assert!(health.healthy);
        assert!(health.target_connected);
        assert!(!health.source_configured);
    }

    #[tokio::test]
    async fn test_single_statement_modes() {
        let r = replayer("");
        let compat = r
            .check_statement("select 1", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(compat.statements, 1);

        let perf = r
            .benchmark_statement("select 1", Some("0xA1".into()), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(perf.benchmark.unwrap().results[0].success_count, 1);

        assert!(r.check_statement("   ", CancellationToken::new()).await.is_err());
    }
}
