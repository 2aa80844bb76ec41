//! Plan-only compatibility checks against the target.
//!
//! Statements are checked one at a time over a single reusable session so
//! reports come out in input order. A connection failure gets exactly one
//! retry on a fresh session; every other failure is classified and recorded.
//! Text holding more than one statement is refused before it reaches the
//! target, since only the first would be planned and the rest would run.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::statement::{single_statement, StatementRecord};
use crate::target::{TargetConnector, TargetError, TargetErrorKind, TargetSession};

/// Classification of one statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompatStatus {
    Compatible,
    IncompatibleSyntax,
    IncompatibleSemantic,
    ConnectionError,
    UnknownError,
}

impl CompatStatus {
    fn from_error(error: &TargetError) -> Self {
        match error.kind {
            TargetErrorKind::Syntax => CompatStatus::IncompatibleSyntax,
            TargetErrorKind::Semantic => CompatStatus::IncompatibleSemantic,
            TargetErrorKind::Connection => CompatStatus::ConnectionError,
            TargetErrorKind::Timeout | TargetErrorKind::Other => CompatStatus::UnknownError,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CompatStatus::Compatible => "compatible",
            CompatStatus::IncompatibleSyntax => "incompatible-syntax",
            CompatStatus::IncompatibleSemantic => "incompatible-semantic",
            CompatStatus::ConnectionError => "connection-error",
            CompatStatus::UnknownError => "unknown-error",
        }
    }
}

impl std::fmt::Display for CompatStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of checking one statement.
#[derive(Debug, Clone, Serialize)]
pub struct CompatibilityReport {
    /// Position in the input sequence.
    pub index: usize,
    pub fingerprint: String,
    pub text: String,
    pub status: CompatStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    /// Rewrite suggestion derived from the error text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

/// Counts per status.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompatibilitySummary {
    pub total: usize,
    pub compatible: usize,
    pub by_status: BTreeMap<CompatStatus, usize>,
    pub cancelled: bool,
}

impl CompatibilitySummary {
    pub fn from_reports(reports: &[CompatibilityReport], cancelled: bool) -> Self {
        let mut by_status = BTreeMap::new();
        for report in reports {
            *by_status.entry(report.status).or_insert(0) += 1;
        }
        Self {
            total: reports.len(),
            compatible: by_status.get(&CompatStatus::Compatible).copied().unwrap_or(0),
            by_status,
            cancelled,
        }
    }

    pub fn incompatible(&self) -> usize {
        self.total - self.compatible
    }
}

/// Checks statements with the target's plan-only path.
pub struct CompatibilityChecker {
    connector: Arc<dyn TargetConnector>,
    session: Option<Box<dyn TargetSession>>,
    timeout: Option<Duration>,
}

impl CompatibilityChecker {
    pub fn new(connector: Arc<dyn TargetConnector>) -> Self {
        Self {
            connector,
            session: None,
            timeout: None,
        }
    }

    /// Limit the time spent planning one statement.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Check every record in order. Stops early, without error, when
    /// `cancel` fires; the summary records that.
    pub async fn check_all(
        &mut self,
        records: &[StatementRecord],
        cancel: &CancellationToken,
    ) -> (Vec<CompatibilityReport>, CompatibilitySummary) {
        info!(
            "Checking {} statements against {} (plan only)",
            records.len(),
            self.connector.db_type()
        );

        let mut reports = Vec::with_capacity(records.len());
        for (index, record) in records.iter().enumerate() {
            if cancel.is_cancelled() {
                warn!("Compatibility check cancelled after {} statements", index);
                break;
            }
            let Some(report) = self.check(index, record, cancel).await else {
                warn!("Compatibility check cancelled during statement {}", index);
                break;
            };
            debug!("[{}] {}", report.index, report.status);
            reports.push(report);
        }

        let summary = CompatibilitySummary::from_reports(&reports, cancel.is_cancelled());
        info!(
            "Compatibility: {}/{} compatible",
            summary.compatible, summary.total
        );
        self.close().await;
        (reports, summary)
    }

    /// Check one record. `None` when `cancel` fired before it finished.
    pub async fn check(
        &mut self,
        index: usize,
        record: &StatementRecord,
        cancel: &CancellationToken,
    ) -> Option<CompatibilityReport> {
        let sql = record.executable_text(self.connector.literal_style());

        let outcome = if single_statement(&sql).is_none() {
            Err(TargetError::new(
                TargetErrorKind::Syntax,
                "text holds more than one statement; plan-only checks take exactly one",
            ))
        } else {
            match self.explain_within(&sql, cancel).await? {
                Err(e) if e.is_connection() => {
                    warn!("Connection error on statement {}, retrying once: {}", index, e);
                    self.drop_session().await;
                    self.explain_within(&sql, cancel).await?
                }
                other => other,
            }
        };

        let (status, error, plan) = match outcome {
            Ok(plan) => (CompatStatus::Compatible, None, Some(plan)),
            Err(e) => {
                if e.is_connection() {
                    self.drop_session().await;
                }
                (CompatStatus::from_error(&e), Some(e.message), None)
            }
        };

        Some(CompatibilityReport {
            index,
            fingerprint: record.fingerprint().to_string(),
            text: record.text().to_string(),
            status,
            hint: error.as_deref().and_then(hint_from_error),
            error,
            plan,
        })
    }

    /// Plan `sql` within the configured timeout. `None` on cancellation.
    async fn explain_within(
        &mut self,
        sql: &str,
        cancel: &CancellationToken,
    ) -> Option<Result<String, TargetError>> {
        let limit = self.timeout;
        let planned = tokio::select! {
            _ = cancel.cancelled() => None,
            planned = async {
                match limit {
                    Some(limit) => tokio::time::timeout(limit, self.explain(sql)).await.ok(),
                    None => Some(self.explain(sql).await),
                }
            } => Some(planned),
        };

        match planned {
            Some(Some(outcome)) => Some(outcome),
            // busy sessions are dropped, not closed
            Some(None) => {
                self.session = None;
                Some(Err(TargetError::new(
                    TargetErrorKind::Timeout,
                    format!(
                        "plan-only check exceeded {}ms",
                        limit.unwrap_or_default().as_millis()
                    ),
                )))
            }
            None => {
                self.session = None;
                None
            }
        }
    }

    async fn explain(&mut self, sql: &str) -> Result<String, TargetError> {
        if self.session.is_none() {
            self.session = Some(self.connector.open().await?);
        }
        match self.session.as_mut() {
            Some(session) => session.explain(sql).await,
            None => Err(TargetError::connection("no target session")),
        }
    }

    async fn drop_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
        }
    }

    /// Close the underlying session, if open.
    pub async fn close(&mut self) {
        self.drop_session().await;
    }
}

/// Rewrite suggestion for common failure messages.
pub fn hint_from_error(message: &str) -> Option<String> {
    let msg = message.to_lowercase();
    let hint = if msg.contains("not supported") {
        "The target does not support this construct; rewrite it or upgrade the target"
    } else if msg.contains("syntax error") || msg.contains("error in your sql syntax") {
        "Check for source-specific syntax or functions and use a portable form"
    } else if msg.contains("permission") || msg.contains("privilege") || msg.contains("denied")
    {
        "Grant the target user the same privileges it had on the source"
    } else if msg.contains("does not exist") || msg.contains("doesn't exist") {
        "Make sure the referenced object was migrated to the target"
    } else {
        return None;
    };
    Some(hint.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statement::FingerprintStrategy;
    use crate::target::ExecOutput;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails based on keywords in the statement; the first `flaky` explains
    /// report a lost connection.
    struct KeywordTarget {
        opens: AtomicUsize,
        flaky: AtomicUsize,
    }

    impl KeywordTarget {
        fn new(flaky: usize) -> Arc<Self> {
            Arc::new(Self {
                opens: AtomicUsize::new(0),
                flaky: AtomicUsize::new(flaky),
            })
        }
    }

    struct KeywordSession {
        target: Arc<KeywordTarget>,
    }

    #[async_trait]
    impl TargetConnector for Arc<KeywordTarget> {
        async fn open(&self) -> Result<Box<dyn TargetSession>, TargetError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(KeywordSession {
                target: Arc::clone(self),
            }))
        }

        fn db_type(&self) -> &str {
            "keyword"
        }
    }

    #[async_trait]
    impl TargetSession for KeywordSession {
        async fn explain(&mut self, sql: &str) -> Result<String, TargetError> {
            let flaky = &self.target.flaky;
            if flaky.load(Ordering::SeqCst) > 0 {
                flaky.fetch_sub(1, Ordering::SeqCst);
                return Err(TargetError::connection("server closed the connection"));
            }
            if sql.contains("CONNECT BY") {
                Err(TargetError::new(TargetErrorKind::Syntax, "syntax error at or near \"CONNECT\""))
            } else if sql.contains("missing_table") {
                Err(TargetError::new(
                    TargetErrorKind::Semantic,
                    "relation \"missing_table\" does not exist",
                ))
            } else if sql.contains("pg_sleep") {
                tokio::time::sleep(Duration::from_secs(3)).await;
                Ok("Result".to_string())
            } else if sql.contains("weird") {
                Err(TargetError::new(TargetErrorKind::Other, "internal error"))
            } else {
                Ok(format!("Seq Scan ({})", sql.len()))
            }
        }

        async fn execute(&mut self, _: &str) -> Result<ExecOutput, TargetError> {
            panic!("compatibility checks must never execute statements");
        }

        async fn close(self: Box<Self>) {}
    }

    fn records(texts: &[&str]) -> Vec<StatementRecord> {
        texts
            .iter()
            .map(|t| StatementRecord::from_text(*t, FingerprintStrategy::Exact).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_classification_in_input_order() {
        let target = KeywordTarget::new(0);
        let mut checker = CompatibilityChecker::new(Arc::new(target.clone()));
        let input = records(&[
            "select * from t",
            "select level from dual CONNECT BY level < 3",
            "select * from missing_table",
            "select weird()",
        ]);
        let (reports, summary) = checker.check_all(&input, &CancellationToken::new()).await;

        let statuses: Vec<_> = reports.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                CompatStatus::Compatible,
                CompatStatus::IncompatibleSyntax,
                CompatStatus::IncompatibleSemantic,
                CompatStatus::UnknownError,
            ]
        );
        assert!(reports[0].plan.is_some() && reports[0].error.is_none());
        assert!(reports[3].error.is_some());
        assert!(reports[2].hint.is_some());
        assert_eq!(summary.total, 4);
        assert_eq!(summary.compatible, 1);
        assert_eq!(summary.incompatible(), 3);
        // one session for the whole run
        assert_eq!(target.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connection_error_retried_once() {
        let target = KeywordTarget::new(1);
        let mut checker = CompatibilityChecker::new(Arc::new(target.clone()));
        let (reports, _) = checker
            .check_all(&records(&["select 1"]), &CancellationToken::new())
            .await;
        assert_eq!(reports[0].status, CompatStatus::Compatible);
        assert_eq!(target.opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_persistent_connection_error_is_reported() {
        let target = KeywordTarget::new(2);
        let mut checker = CompatibilityChecker::new(Arc::new(target.clone()));
        let (reports, summary) = checker
            .check_all(&records(&["select 1", "select 2"]), &CancellationToken::new())
            .await;
        assert_eq!(reports[0].status, CompatStatus::ConnectionError);
        assert_eq!(reports[1].status, CompatStatus::Compatible);
        assert_eq!(summary.by_status.get(&CompatStatus::ConnectionError), Some(&1));
    }

    #[tokio::test]
    async fn test_cancelled_run_stops() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut checker = CompatibilityChecker::new(Arc::new(KeywordTarget::new(0)));
        let (reports, summary) = checker.check_all(&records(&["select 1"]), &cancel).await;
        assert!(reports.is_empty());
        assert!(summary.cancelled);
    }

    #[tokio::test]
    async fn test_multiple_statements_refused_before_reaching_target() {
        let target = KeywordTarget::new(0);
        let mut checker = CompatibilityChecker::new(Arc::new(target.clone()));
        let (reports, _) = checker
            .check_all(
                &records(&["select * from t; delete from t"]),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(reports[0].status, CompatStatus::IncompatibleSyntax);
        assert!(reports[0].error.as_deref().unwrap().contains("more than one statement"));
        assert_eq!(target.opens.load(Ordering::SeqCst), 0);

        let (reports, _) = checker
            .check_all(&records(&["select ';' from t; -- done"]), &CancellationToken::new())
            .await;
        assert_eq!(reports[0].status, CompatStatus::Compatible);
    }

    #[tokio::test]
    async fn test_slow_plan_times_out_and_run_continues() {
        let target = KeywordTarget::new(0);
        let mut checker = CompatibilityChecker::new(Arc::new(target.clone()))
            .with_timeout(Some(Duration::from_millis(100)));

        let started = std::time::Instant::now();
        let (reports, summary) = checker
            .check_all(
                &records(&["select pg_sleep(10)", "select 1"]),
                &CancellationToken::new(),
            )
            .await;

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(reports[0].status, CompatStatus::UnknownError);
        assert!(reports[0].error.as_deref().unwrap().contains("exceeded 100ms"));
        assert_eq!(reports[1].status, CompatStatus::Compatible);
        assert!(!summary.cancelled);
        // the timed-out session is not reused
        assert_eq!(target.opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_plan_in_flight() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let mut checker = CompatibilityChecker::new(Arc::new(KeywordTarget::new(0)));
        let started = std::time::Instant::now();
        let (reports, summary) = checker
            .check_all(&records(&["select pg_sleep(10)", "select 1"]), &cancel)
            .await;

        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(reports.is_empty());
        assert!(summary.cancelled);
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&CompatStatus::IncompatibleSemantic).unwrap();
        assert_eq!(json, "\"incompatible-semantic\"");
        assert_eq!(CompatStatus::ConnectionError.to_string(), "connection-error");
    }

    #[test]
    fn test_hints() {
        assert!(hint_from_error("ERROR: feature not supported").is_some());
        assert!(hint_from_error("permission denied for table t").is_some());
        assert!(hint_from_error("deadlock detected").is_none());
    }
}
