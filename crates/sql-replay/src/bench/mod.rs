//! Concurrent benchmark executor.
//!
//! A feeder pushes `(statement, iteration)` units into a bounded work queue
//! that exactly `concurrency` workers drain. Each worker reports every
//! attempt over a channel to a single aggregator, so no aggregate state is
//! shared between tasks. A worker keeps its session only while it runs
//! consecutive iterations of the same statement; a new statement gets a
//! fresh session, so session state never leaks between statements.
//!
//! Cancellation (signal or run timeout) stops the feeder and cancels
//! in-flight attempts. Units that never ran are reported as `skipped`, so
//! every statement still gets exactly `iterations` attempts.

mod stats;

pub use stats::{percentile_nearest_rank, LatencyStats};

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::baseline::BaselineResolver;
use crate::config::ReplayConfig;
use crate::error::{ReplayError, Result};
use crate::statement::StatementRecord;
use crate::target::{ExecOutput, TargetConnector, TargetError, TargetErrorKind, TargetSession};

/// How one attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttemptOutcome {
    Success,
    TargetError,
    Timeout,
    Skipped,
}

/// One timed execution of one statement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionAttempt {
    pub statement: usize,
    pub iteration: usize,
    pub latency_ms: f64,
    pub outcome: AttemptOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<u64>,
}

impl ExecutionAttempt {
    fn success(statement: usize, iteration: usize, elapsed: Duration, rows: u64) -> Self {
        Self {
            statement,
            iteration,
            latency_ms: millis(elapsed),
            outcome: AttemptOutcome::Success,
            error: None,
            rows: Some(rows),
        }
    }

    fn failed(
        statement: usize,
        iteration: usize,
        elapsed: Duration,
        outcome: AttemptOutcome,
        error: impl Into<String>,
    ) -> Self {
        Self {
            statement,
            iteration,
            latency_ms: millis(elapsed),
            outcome,
            error: Some(error.into()),
            rows: None,
        }
    }

    fn skipped(statement: usize, iteration: usize) -> Self {
        Self::failed(
            statement,
            iteration,
            Duration::ZERO,
            AttemptOutcome::Skipped,
            "not run: benchmark cancelled",
        )
    }
}

/// Error detail of one failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptError {
    pub iteration: usize,
    pub outcome: AttemptOutcome,
    pub message: String,
}

/// Per-statement statistics over one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateResult {
    /// Position in the input sequence.
    pub index: usize,
    pub fingerprint: String,
    pub text: String,
    pub iterations: usize,
    pub concurrency: usize,
    pub attempt_count: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub avg_latency_ms: Option<f64>,
    pub p95_latency_ms: Option<f64>,
    pub min_latency_ms: Option<f64>,
    pub max_latency_ms: Option<f64>,
    /// Successful latencies, ascending.
    pub samples_ms: Vec<f64>,
    /// Failures ordered by iteration.
    pub errors: Vec<AttemptError>,
    pub baseline_latency_ms: Option<f64>,
    pub delta_ms: Option<f64>,
    pub ratio: Option<f64>,
}

impl AggregateResult {
    /// Build the aggregate from a statement's attempts, in any order.
    fn from_attempts(
        index: usize,
        record: &StatementRecord,
        mut attempts: Vec<ExecutionAttempt>,
        iterations: usize,
        concurrency: usize,
    ) -> Self {
        attempts.sort_by_key(|a| a.iteration);

        let mut samples_ms: Vec<f64> = attempts
            .iter()
            .filter(|a| a.outcome == AttemptOutcome::Success)
            .map(|a| a.latency_ms)
            .collect();
        stats::sort_samples(&mut samples_ms);
        let latency = LatencyStats::from_sorted(&samples_ms);

        let errors: Vec<AttemptError> = attempts
            .iter()
            .filter(|a| a.outcome != AttemptOutcome::Success)
            .map(|a| AttemptError {
                iteration: a.iteration,
                outcome: a.outcome,
                message: a.error.clone().unwrap_or_default(),
            })
            .collect();

        Self {
            index,
            fingerprint: record.fingerprint().to_string(),
            text: record.text().to_string(),
            iterations,
            concurrency,
            attempt_count: attempts.len(),
            success_count: samples_ms.len(),
            failure_count: errors.len(),
            avg_latency_ms: latency.map(|l| l.avg_ms),
            p95_latency_ms: latency.map(|l| l.p95_ms),
            min_latency_ms: latency.map(|l| l.min_ms),
            max_latency_ms: latency.map(|l| l.max_ms),
            samples_ms,
            errors,
            baseline_latency_ms: None,
            delta_ms: None,
            ratio: None,
        }
    }

    /// Attach a baseline and derive the comparison where both sides exist.
    pub fn with_baseline(mut self, baseline_ms: Option<f64>) -> Self {
        self.baseline_latency_ms = baseline_ms;
        if let (Some(avg), Some(base)) = (self.avg_latency_ms, baseline_ms) {
            self.delta_ms = Some(avg - base);
            self.ratio = (base > 0.0).then(|| avg / base);
        }
        self
    }
}

/// Run-level output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchmarkRun {
    pub results: Vec<AggregateResult>,
    pub total_attempts: usize,
    pub total_failures: usize,
    /// Stopped early by a signal or the run timeout.
    pub cancelled: bool,
    pub timed_out: bool,
    pub elapsed_seconds: f64,
}

/// Executor settings.
#[derive(Debug, Clone)]
pub struct BenchmarkOptions {
    pub iterations: usize,
    pub concurrency: usize,
    pub attempt_timeout: Option<Duration>,
    pub run_timeout: Option<Duration>,
}

impl BenchmarkOptions {
    pub fn from_config(config: &ReplayConfig) -> Self {
        Self {
            iterations: config.iterations,
            concurrency: config.concurrency,
            attempt_timeout: config.attempt_timeout_ms.map(Duration::from_millis),
            run_timeout: config.run_timeout_seconds.map(Duration::from_secs),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.iterations == 0 {
            return Err(ReplayError::Config("iterations must be at least 1".into()));
        }
        if self.concurrency == 0 {
            return Err(ReplayError::Config("concurrency must be at least 1".into()));
        }
        Ok(())
    }
}

impl Default for BenchmarkOptions {
    fn default() -> Self {
        Self::from_config(&ReplayConfig::default())
    }
}

/// One unit of work.
#[derive(Debug, Clone, Copy)]
struct Unit {
    statement: usize,
    iteration: usize,
}

/// Drives statements against the target with a fixed worker pool.
pub struct BenchmarkExecutor {
    connector: Arc<dyn TargetConnector>,
    options: BenchmarkOptions,
    baseline: BaselineResolver,
}

impl BenchmarkExecutor {
    pub fn new(connector: Arc<dyn TargetConnector>, options: BenchmarkOptions) -> Self {
        Self {
            connector,
            options,
            baseline: BaselineResolver::Disabled,
        }
    }

    pub fn with_baseline(mut self, baseline: BaselineResolver) -> Self {
        self.baseline = baseline;
        self
    }

    pub fn options(&self) -> &BenchmarkOptions {
        &self.options
    }

    /// Run every record `iterations` times. Per-attempt failures end up in
    /// the results; only invalid options fail the call.
    pub async fn run(
        &self,
        records: &[StatementRecord],
        cancel: CancellationToken,
    ) -> Result<BenchmarkRun> {
        self.options.validate()?;
        let started = Instant::now();
        let BenchmarkOptions {
            iterations,
            concurrency,
            attempt_timeout,
            run_timeout,
        } = self.options.clone();

        info!(
            "Benchmarking {} statements x {} iterations with {} workers against {}",
            records.len(),
            iterations,
            concurrency,
            self.connector.db_type()
        );

        let run_token = cancel.child_token();
        let style = self.connector.literal_style();
        let sql: Arc<Vec<String>> =
            Arc::new(records.iter().map(|r| r.executable_text(style)).collect());

        let (work_tx, work_rx) = async_channel::bounded::<Unit>(concurrency * 2);
        let (result_tx, mut result_rx) = mpsc::channel::<ExecutionAttempt>(concurrency * 4);

        // Feeder: statement-major so a worker usually repeats one statement
        let total_units = records.len() * iterations;
        let feeder_token = run_token.clone();
        let feeder = tokio::spawn(async move {
            for unit in (0..total_units).map(|n| Unit {
                statement: n / iterations,
                iteration: n % iterations,
            }) {
                tokio::select! {
                    _ = feeder_token.cancelled() => break,
                    sent = work_tx.send(unit) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let mut workers = Vec::with_capacity(concurrency);
        for worker_id in 0..concurrency {
            let worker = Worker {
                id: worker_id,
                connector: self.connector.clone(),
                sql: sql.clone(),
                attempt_timeout,
                token: run_token.clone(),
                session: None,
            };
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            workers.push(tokio::spawn(worker.run(work_rx, result_tx)));
        }
        drop(work_rx);
        drop(result_tx);

        // Aggregator
        let mut per_statement: Vec<Vec<ExecutionAttempt>> = vec![Vec::new(); records.len()];
        let deadline = run_timeout.map(|t| tokio::time::Instant::now() + t);
        let mut timed_out = false;
        loop {
            let attempt = match deadline {
                Some(deadline) if !timed_out => {
                    tokio::select! {
                        attempt = result_rx.recv() => attempt,
                        _ = tokio::time::sleep_until(deadline) => {
                            warn!("Run timeout reached, cancelling remaining work");
                            timed_out = true;
                            run_token.cancel();
                            continue;
                        }
                    }
                }
                _ => result_rx.recv().await,
            };
            let Some(attempt) = attempt else {
                break;
            };
            if let Some(slot) = per_statement.get_mut(attempt.statement) {
                slot.push(attempt);
            }
        }

        if let Err(e) = feeder.await {
            warn!("Benchmark feeder task failed: {}", e);
        }
        for (worker_id, joined) in join_all(workers).await.into_iter().enumerate() {
            if let Err(e) = joined {
                warn!("Benchmark worker {} failed: {}", worker_id, e);
            }
        }

        // Fill in units that never ran
        for (statement, attempts) in per_statement.iter_mut().enumerate() {
            let mut ran = vec![false; iterations];
            for attempt in attempts.iter() {
                if let Some(flag) = ran.get_mut(attempt.iteration) {
                    *flag = true;
                }
            }
            attempts.extend(
                (0..iterations)
                    .filter(|i| !ran[*i])
                    .map(|i| ExecutionAttempt::skipped(statement, i)),
            );
        }

        let mut results = Vec::with_capacity(records.len());
        for (index, (record, attempts)) in records.iter().zip(per_statement).enumerate() {
            let result =
                AggregateResult::from_attempts(index, record, attempts, iterations, concurrency);
            let baseline = self.baseline.resolve(record).await;
            results.push(result.with_baseline(baseline));
        }

        let run = BenchmarkRun {
            total_attempts: results.iter().map(|r| r.attempt_count).sum(),
            total_failures: results.iter().map(|r| r.failure_count).sum(),
            results,
            cancelled: run_token.is_cancelled(),
            timed_out,
            elapsed_seconds: started.elapsed().as_secs_f64(),
        };
        info!(
            "Benchmark finished: {} attempts, {} failures in {:.2}s{}",
            run.total_attempts,
            run.total_failures,
            run.elapsed_seconds,
            if run.cancelled { " (cancelled)" } else { "" }
        );
        Ok(run)
    }
}

/// What one open-and-execute pass produced.
enum Pass {
    Executed(ExecOutput),
    Failed { error: TargetError, elapsed: Duration },
    OpenFailed(TargetError),
}

/// One pool member. Owns at most one session at a time.
struct Worker {
    id: usize,
    connector: Arc<dyn TargetConnector>,
    sql: Arc<Vec<String>>,
    attempt_timeout: Option<Duration>,
    token: CancellationToken,
    session: Option<(usize, Box<dyn TargetSession>)>,
}

impl Worker {
    async fn run(
        mut self,
        work_rx: async_channel::Receiver<Unit>,
        result_tx: mpsc::Sender<ExecutionAttempt>,
    ) {
        loop {
            let unit = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                unit = work_rx.recv() => match unit {
                    Ok(unit) => unit,
                    Err(_) => break,
                },
            };
            let attempt = self.attempt(unit).await;
            if result_tx.send(attempt).await.is_err() {
                break;
            }
        }
        self.release().await;
        debug!("Worker {} done", self.id);
    }

    /// Run one unit. Opening the session and executing share the attempt
    /// timeout and both stop on cancellation; only `execute` is timed. A
    /// connection lost during `execute` is retried once on a fresh session.
    async fn attempt(&mut self, unit: Unit) -> ExecutionAttempt {
        let Unit {
            statement,
            iteration,
        } = unit;
        let Some(sql) = self.sql.get(statement).cloned() else {
            return ExecutionAttempt::skipped(statement, iteration);
        };

        let token = self.token.clone();
        let started = Instant::now();
        let deadline = self
            .attempt_timeout
            .map(|limit| tokio::time::Instant::now() + limit);
        let mut retried = false;

        loop {
            let pass = tokio::select! {
                _ = token.cancelled() => None,
                pass = within(deadline, self.pass(statement, &sql)) => Some(pass),
            };

            break match pass {
                Some(Some(Pass::Executed(output))) => {
                    ExecutionAttempt::success(statement, iteration, output.elapsed, output.rows)
                }
                Some(Some(Pass::Failed { error, .. })) if error.is_connection() && !retried => {
                    warn!(
                        "Worker {}: connection lost, retrying once on a fresh session: {}",
                        self.id, error
                    );
                    retried = true;
                    continue;
                }
                Some(Some(Pass::Failed { error, elapsed })) => {
                    let outcome = match error.kind {
                        TargetErrorKind::Timeout => AttemptOutcome::Timeout,
                        _ => AttemptOutcome::TargetError,
                    };
                    ExecutionAttempt::failed(statement, iteration, elapsed, outcome, error.message)
                }
                Some(Some(Pass::OpenFailed(error))) => ExecutionAttempt::failed(
                    statement,
                    iteration,
                    Duration::ZERO,
                    AttemptOutcome::TargetError,
                    error.message,
                ),
                // the session may still be busy server-side; it was dropped
                // with the pass and is never reused
                Some(None) => ExecutionAttempt::failed(
                    statement,
                    iteration,
                    started.elapsed(),
                    AttemptOutcome::Timeout,
                    format!(
                        "attempt exceeded {}ms",
                        self.attempt_timeout.unwrap_or_default().as_millis()
                    ),
                ),
                None => ExecutionAttempt::failed(
                    statement,
                    iteration,
                    started.elapsed(),
                    AttemptOutcome::Skipped,
                    "cancelled while running",
                ),
            };
        }
    }

    /// Open (or reuse) a session and execute once.
    async fn pass(&mut self, statement: usize, sql: &str) -> Pass {
        let mut session = match self.session_for(statement).await {
            Ok(session) => session,
            Err(e) => return Pass::OpenFailed(e),
        };

        let start = Instant::now();
        let result = session.execute(sql).await;
        let elapsed = start.elapsed();

        match result {
            Ok(output) => {
                self.session = Some((statement, session));
                Pass::Executed(output)
            }
            Err(error) => {
                if !error.is_connection() {
                    self.session = Some((statement, session));
                }
                Pass::Failed { error, elapsed }
            }
        }
    }

    /// Session for `statement`: reused for consecutive iterations of the
    /// same statement, otherwise fresh. Opening is retried once.
    async fn session_for(
        &mut self,
        statement: usize,
    ) -> std::result::Result<Box<dyn TargetSession>, TargetError> {
        match self.session.take() {
            Some((owner, session)) if owner == statement => return Ok(session),
            Some((_, session)) => session.close().await,
            None => {}
        }
        match self.connector.open().await {
            Ok(session) => Ok(session),
            Err(e) if e.is_connection() => {
                warn!("Worker {}: open failed, retrying once: {}", self.id, e);
                self.connector.open().await
            }
            Err(e) => Err(e),
        }
    }

    async fn release(&mut self) {
        if let Some((_, session)) = self.session.take() {
            session.close().await;
        }
    }
}

fn millis(d: Duration) -> f64 {
    d.as_nanos() as f64 / 1_000_000.0
}

/// Await `fut` until the optional deadline; `None` when it passed first.
async fn within<F: std::future::Future>(
    deadline: Option<tokio::time::Instant>,
    fut: F,
) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut).await.ok(),
        None => Some(fut.await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statement::FingerprintStrategy;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Deterministic target: behavior depends only on the statement text.
    /// `fail` errors, `slow` sleeps well past any test timeout, anything
    /// else returns after a millisecond. The first `refuse` opens fail.
    struct StubTarget {
        opens: AtomicUsize,
        refuse: AtomicUsize,
    }

    impl StubTarget {
        fn new(refuse: usize) -> Arc<Self> {
            Arc::new(Self {
                opens: AtomicUsize::new(0),
                refuse: AtomicUsize::new(refuse),
            })
        }
    }

    struct StubSession;

    #[async_trait]
    impl TargetConnector for StubTarget {
        async fn open(&self) -> std::result::Result<Box<dyn TargetSession>, TargetError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.refuse.load(Ordering::SeqCst) > 0 {
                self.refuse.fetch_sub(1, Ordering::SeqCst);
                return Err(TargetError::connection("connection refused"));
            }
            Ok(Box::new(StubSession))
        }

        fn db_type(&self) -> &str {
            "stub"
        }
    }

    #[async_trait]
    impl TargetSession for StubSession {
        async fn explain(&mut self, _: &str) -> std::result::Result<String, TargetError> {
            Ok(String::new())
        }

        async fn execute(&mut self, sql: &str) -> std::result::Result<ExecOutput, TargetError> {
            let start = Instant::now();
            if sql.contains("fail") {
                return Err(TargetError::new(
                    TargetErrorKind::Semantic,
                    "relation does not exist",
                ));
            }
            let pause = if sql.contains("slow") { 2_000 } else { 1 };
            tokio::time::sleep(Duration::from_millis(pause)).await;
            Ok(ExecOutput {
                rows: 1,
                elapsed: start.elapsed(),
            })
        }

        async fn close(self: Box<Self>) {}
    }

    fn records(texts: &[String]) -> Vec<StatementRecord> {
        texts
            .iter()
            .map(|t| StatementRecord::from_text(t.as_str(), FingerprintStrategy::Exact).unwrap())
            .collect()
    }

    fn options(iterations: usize, concurrency: usize) -> BenchmarkOptions {
        BenchmarkOptions {
            iterations,
            concurrency,
            attempt_timeout: None,
            run_timeout: None,
        }
    }

    fn counts(run: &BenchmarkRun) -> Vec<(usize, usize, usize)> {
        run.results
            .iter()
            .map(|r| (r.index, r.success_count, r.failure_count))
            .collect()
    }

    #[tokio::test]
    async fn test_counts_independent_of_concurrency() {
        let texts: Vec<String> = (0..20)
            .map(|i| {
                if i % 5 == 0 {
                    format!("select fail_{i}")
                } else {
                    format!("select {i}")
                }
            })
            .collect();
        let input = records(&texts);

        let serial = BenchmarkExecutor::new(StubTarget::new(0), options(3, 1))
            .run(&input, CancellationToken::new())
            .await
            .unwrap();
        let parallel = BenchmarkExecutor::new(StubTarget::new(0), options(3, 8))
            .run(&input, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(serial.results.len(), 20);
        assert_eq!(counts(&serial), counts(&parallel));
        for result in &parallel.results {
            assert_eq!(result.attempt_count, 3);
            assert_eq!(result.success_count + result.failure_count, result.attempt_count);
        }
        assert_eq!(parallel.total_attempts, 60);
        assert_eq!(parallel.total_failures, 12);
        assert!(!parallel.cancelled);
    }

    #[tokio::test]
    async fn test_attempt_timeout_does_not_block_pool() {
        let input = records(&[
            "select slow".to_string(),
            "select 1".to_string(),
            "select 2".to_string(),
        ]);
        let mut opts = options(1, 1);
        opts.attempt_timeout = Some(Duration::from_millis(50));

        let started = Instant::now();
        let run = BenchmarkExecutor::new(StubTarget::new(0), opts)
            .run(&input, CancellationToken::new())
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_millis(1_500));
        assert_eq!(run.results[0].errors[0].outcome, AttemptOutcome::Timeout);
        assert_eq!(run.results[0].avg_latency_ms, None);
        assert_eq!(run.results[1].success_count, 1);
        assert_eq!(run.results[2].success_count, 1);
    }

    #[tokio::test]
    async fn test_run_timeout_keeps_partial_results() {
        let input = records(&[
            "select 1".to_string(),
            "select slow_a".to_string(),
            "select slow_b".to_string(),
        ]);
        let mut opts = options(2, 2);
        opts.run_timeout = Some(Duration::from_millis(200));

        let run = BenchmarkExecutor::new(StubTarget::new(0), opts)
            .run(&input, CancellationToken::new())
            .await
            .unwrap();

        assert!(run.cancelled);
        assert!(run.timed_out);
        assert_eq!(run.results.len(), 3);
        for result in &run.results {
            assert_eq!(result.attempt_count, 2);
        }
        assert_eq!(run.results[1].success_count, 0);
        assert_eq!(run.results[2].success_count, 0);
    }

    #[tokio::test]
    async fn test_open_failure_retried_once() {
        let target = StubTarget::new(1);
        let run = BenchmarkExecutor::new(target.clone(), options(2, 1))
            .run(&records(&["select 1".to_string()]), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(run.results[0].success_count, 2);
        // refused, retried, then reused for the second iteration
        assert_eq!(target.opens.load(Ordering::SeqCst), 2);
    }

    /// Target with a configurable connect delay whose sessions lose their
    /// connection on the first `drops` executes across all sessions.
    struct FlakyTarget {
        opens: AtomicUsize,
        open_delay: Duration,
        drops: Arc<AtomicUsize>,
    }

    impl FlakyTarget {
        fn new(open_delay: Duration, drops: usize) -> Arc<Self> {
            Arc::new(Self {
                opens: AtomicUsize::new(0),
                open_delay,
                drops: Arc::new(AtomicUsize::new(drops)),
            })
        }
    }

    struct FlakySession {
        drops: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TargetConnector for FlakyTarget {
        async fn open(&self) -> std::result::Result<Box<dyn TargetSession>, TargetError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.open_delay).await;
            Ok(Box::new(FlakySession {
                drops: self.drops.clone(),
            }))
        }

        fn db_type(&self) -> &str {
            "flaky"
        }
    }

    #[async_trait]
    impl TargetSession for FlakySession {
        async fn explain(&mut self, _: &str) -> std::result::Result<String, TargetError> {
            Ok(String::new())
        }

        async fn execute(&mut self, _: &str) -> std::result::Result<ExecOutput, TargetError> {
            let dropped = self
                .drops
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if dropped {
                return Err(TargetError::connection(
                    "server closed the connection unexpectedly",
                ));
            }
            let start = Instant::now();
            tokio::time::sleep(Duration::from_millis(2)).await;
            Ok(ExecOutput {
                rows: 1,
                elapsed: start.elapsed(),
            })
        }

        async fn close(self: Box<Self>) {}
    }

    #[tokio::test]
    async fn test_latency_excludes_connection_setup() {
        let target = FlakyTarget::new(Duration::from_millis(150), 0);
        let input = records(&["select 1".to_string(), "select 2".to_string()]);
        let run = BenchmarkExecutor::new(target.clone(), options(3, 2))
            .run(&input, CancellationToken::new())
            .await
            .unwrap();

        for result in &run.results {
            assert_eq!(result.success_count, 3);
            for sample in &result.samples_ms {
                assert!(*sample < 100.0, "sample {sample}ms includes connect time");
            }
        }
        assert!(target.opens.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_slow_connect_respects_attempt_timeout() {
        let mut opts = options(1, 1);
        opts.attempt_timeout = Some(Duration::from_millis(100));
        opts.run_timeout = Some(Duration::from_millis(200));

        let started = Instant::now();
        let run = BenchmarkExecutor::new(FlakyTarget::new(Duration::from_secs(3), 0), opts)
            .run(&records(&["select 1".to_string()]), CancellationToken::new())
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(run.results[0].attempt_count, 1);
        assert_eq!(run.results[0].errors[0].outcome, AttemptOutcome::Timeout);
    }

    #[tokio::test]
    async fn test_slow_connect_stops_on_run_timeout() {
        let mut opts = options(2, 1);
        opts.run_timeout = Some(Duration::from_millis(200));

        let started = Instant::now();
        let run = BenchmarkExecutor::new(FlakyTarget::new(Duration::from_secs(3), 0), opts)
            .run(&records(&["select 1".to_string()]), CancellationToken::new())
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(run.timed_out);
        assert_eq!(run.results[0].attempt_count, 2);
        assert!(run.results[0]
            .errors
            .iter()
            .all(|e| e.outcome == AttemptOutcome::Skipped));
    }

    #[tokio::test]
    async fn test_lost_connection_retried_once_on_fresh_session() {
        let target = FlakyTarget::new(Duration::ZERO, 1);
        let run = BenchmarkExecutor::new(target.clone(), options(1, 1))
            .run(&records(&["select 1".to_string()]), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(run.results[0].success_count, 1);
        assert_eq!(target.opens.load(Ordering::SeqCst), 2);

        let target = FlakyTarget::new(Duration::ZERO, 2);
        let run = BenchmarkExecutor::new(target.clone(), options(1, 1))
            .run(&records(&["select 1".to_string()]), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(run.results[0].failure_count, 1);
        assert_eq!(run.results[0].errors[0].outcome, AttemptOutcome::TargetError);
        assert_eq!(target.opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_baseline_attached_when_present() {
        let baseline = BaselineResolver::File(HashMap::from([("select 1".to_string(), 0.5)]));
        let run = BenchmarkExecutor::new(StubTarget::new(0), options(1, 2))
            .with_baseline(baseline)
            .run(
                &records(&["select 1".to_string(), "select 2".to_string()]),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let with = &run.results[0];
        assert_eq!(with.baseline_latency_ms, Some(0.5));
        assert!(with.ratio.is_some() && with.delta_ms.is_some());

        let without = &run.results[1];
        assert_eq!(without.baseline_latency_ms, None);
        assert_eq!(without.ratio, None);
        assert_eq!(without.success_count, 1);
    }

    #[test]
    fn test_aggregate_is_order_independent() {
        let record = StatementRecord::from_text("select 1", FingerprintStrategy::Exact).unwrap();
        let attempts = vec![
            ExecutionAttempt::success(0, 2, Duration::from_millis(30), 1),
            ExecutionAttempt::failed(
                0,
                1,
                Duration::from_millis(5),
                AttemptOutcome::TargetError,
                "boom",
            ),
            ExecutionAttempt::success(0, 0, Duration::from_millis(10), 1),
        ];
        let mut reversed = attempts.clone();
        reversed.reverse();

        let a = AggregateResult::from_attempts(0, &record, attempts, 3, 2);
        let b = AggregateResult::from_attempts(0, &record, reversed, 3, 2);
        assert_eq!(a, b);
        assert_eq!(a.samples_ms, vec![10.0, 30.0]);
        assert_eq!(a.avg_latency_ms, Some(20.0));
        assert_eq!(a.p95_latency_ms, Some(30.0));
        assert_eq!(a.errors[0].iteration, 1);
    }

    #[test]
    fn test_zero_baseline_has_no_ratio() {
        let record = StatementRecord::from_text("select 1", FingerprintStrategy::Exact).unwrap();
        let attempts = vec![ExecutionAttempt::success(0, 0, Duration::from_millis(4), 1)];
        let result =
            AggregateResult::from_attempts(0, &record, attempts, 1, 1).with_baseline(Some(0.0));
        assert_eq!(result.ratio, None);
        assert_eq!(result.delta_ms, Some(4.0));
    }

    #[tokio::test]
    async fn test_invalid_options_rejected() {
        let err = BenchmarkExecutor::new(StubTarget::new(0), options(0, 1))
            .run(&[], CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ReplayError::Config(_)));
    }
}
