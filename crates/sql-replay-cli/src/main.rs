//! sql-replay CLI - replay and benchmark captured SQL workloads.

use clap::{Parser, Subcommand, ValueEnum};
use sql_replay::{
    AttemptOutcome, BaselineMode, Config, HandoffStatus, ReplayError, ReplayResult, Replayer,
    StatementSource,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "sql-replay")]
#[command(about = "Replay and benchmark captured SQL workloads against a migration target")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum SourceType {
    /// Statement list inside a capture directory
    CaptureDir,
    /// Persisted capture records, one JSON object per line
    Jsonl,
    /// One statement per line
    Lines,
    /// One sampling pass against the live source
    Online,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    /// Plan-only compatibility check
    Compat,
    /// Timed execution
    Perf,
}

#[derive(Subcommand)]
enum Commands {
    /// Check whether one statement plans on the target
    Compat {
        /// Statement text
        #[arg(long, conflicts_with = "sql_file")]
        sql: Option<String>,

        /// File holding the statement text
        #[arg(long)]
        sql_file: Option<PathBuf>,
    },

    /// Benchmark one statement on the target
    Benchmark {
        /// Statement text
        #[arg(long, conflicts_with = "sql_file")]
        sql: Option<String>,

        /// File holding the statement text
        #[arg(long)]
        sql_file: Option<PathBuf>,

        /// Executions of the statement
        #[arg(long)]
        iterations: Option<usize>,

        /// Concurrent workers
        #[arg(long)]
        concurrency: Option<usize>,

        /// Source execution id used to look up an online baseline
        #[arg(long)]
        source_id: Option<String>,
    },

    /// Replay a statement source in compatibility or performance mode
    Replay {
        /// Where statements come from
        #[arg(long, value_enum)]
        source_type: SourceType,

        /// Capture directory or statement file (not used for online)
        #[arg(long)]
        source_path: Option<PathBuf>,

        /// Replay mode
        #[arg(long, value_enum, default_value = "compat")]
        mode: Mode,

        /// Concurrent workers (perf mode)
        #[arg(long)]
        concurrency: Option<usize>,

        /// Executions per statement (perf mode)
        #[arg(long)]
        iterations: Option<usize>,

        /// Maximum statements sampled by the online source
        #[arg(long, default_value = "200")]
        limit: usize,

        /// Only sample these schemas (online source, repeatable)
        #[arg(long = "schema")]
        schemas: Vec<String>,

        /// Only sample these modules (online source, repeatable)
        #[arg(long = "module")]
        modules: Vec<String>,

        /// Also write the loaded statements to this JSONL file
        #[arg(long)]
        store_file: Option<PathBuf>,

        /// Baseline latencies keyed by statement text (JSON)
        #[arg(long)]
        baseline_file: Option<PathBuf>,

        /// Per-attempt timeout in milliseconds
        #[arg(long)]
        attempt_timeout_ms: Option<u64>,

        /// Overall run timeout in seconds
        #[arg(long)]
        run_timeout_seconds: Option<u64>,

        /// Malformed JSONL lines tolerated before the read fails
        #[arg(long)]
        max_malformed_lines: Option<usize>,
    },

    /// Sample the live source into a JSONL capture file
    Capture {
        /// Output JSONL file
        #[arg(long)]
        output: Option<PathBuf>,

        /// Total sampling duration
        #[arg(long)]
        duration_seconds: Option<u64>,

        /// Pause between sampling cycles
        #[arg(long)]
        interval_seconds: Option<u64>,

        /// Maximum statements per cycle
        #[arg(long)]
        limit_per_interval: Option<usize>,

        /// Emit each statement fingerprint once
        #[arg(long)]
        dedup: bool,

        /// Skip bind value lookup
        #[arg(long)]
        no_binds: bool,

        /// Only capture these schemas (repeatable)
        #[arg(long = "schema")]
        schemas: Vec<String>,

        /// Only capture these modules (repeatable)
        #[arg(long = "module")]
        modules: Vec<String>,
    },

    /// Report whether an external tool has produced its handoff file
    Handoff {
        /// Capture directory to inspect
        #[arg(long)]
        capture_dir: PathBuf,

        /// Handoff file name inside the directory
        #[arg(long, default_value = "sqls.txt")]
        file: String,
    },

    /// Test database connections
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), ReplayError> {
    let cli = Cli::parse();

    // Handoff only inspects the filesystem and needs no configuration
    if let Commands::Handoff { capture_dir, file } = &cli.command {
        let status = HandoffStatus::inspect(capture_dir, file);
        if cli.output_json {
            println!("{}", serde_json::to_string_pretty(&status)?);
        } else {
            let label = if status.is_present() { "present" } else { "missing" };
            println!("Handoff file {}: {}", status.path().display(), label);
        }
        return match status {
            HandoffStatus::Present(_) => Ok(()),
            HandoffStatus::Missing(path) => Err(ReplayError::CaptureListMissing { path }),
        };
    }

    setup_logging(&cli.verbosity, &cli.log_format)
        .map_err(|e| ReplayError::Config(e.to_string()))?;

    let mut config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    let cancel_token = setup_signal_handler().await?;

    match cli.command {
        Commands::Handoff { .. } => unreachable!(), // Handled above

        Commands::Compat { sql, sql_file } => {
            let sql = statement_text(sql, sql_file)?;
            let replayer = Replayer::new(config)?;
            let result = replayer.check_statement(&sql, cancel_token).await?;
            report(&result, cli.output_json)?;
        }

        Commands::Benchmark {
            sql,
            sql_file,
            iterations,
            concurrency,
            source_id,
        } => {
            let sql = statement_text(sql, sql_file)?;
            if let Some(i) = iterations {
                config.replay.iterations = i;
            }
            if let Some(c) = concurrency {
                config.replay.concurrency = c;
            }
            config.validate()?;

            let replayer = Replayer::new(config)?;
            let result = replayer
                .benchmark_statement(&sql, source_id, cancel_token)
                .await?;
            report(&result, cli.output_json)?;
        }

        Commands::Replay {
            source_type,
            source_path,
            mode,
            concurrency,
            iterations,
            limit,
            schemas,
            modules,
            store_file,
            baseline_file,
            attempt_timeout_ms,
            run_timeout_seconds,
            max_malformed_lines,
        } => {
            // Apply overrides
            if let Some(c) = concurrency {
                config.replay.concurrency = c;
            }
            if let Some(i) = iterations {
                config.replay.iterations = i;
            }
            if attempt_timeout_ms.is_some() {
                config.replay.attempt_timeout_ms = attempt_timeout_ms;
            }
            if run_timeout_seconds.is_some() {
                config.replay.run_timeout_seconds = run_timeout_seconds;
            }
            if let Some(m) = max_malformed_lines {
                config.replay.max_malformed_lines = m;
            }
            if let Some(path) = baseline_file {
                config.replay.baseline = BaselineMode::File;
                config.replay.baseline_file = Some(path);
            }
            if !schemas.is_empty() {
                config.capture.schemas = schemas;
            }
            if !modules.is_empty() {
                config.capture.modules = modules;
            }
            config.validate()?;

            let handoff_file = config.replay.handoff_file.clone();
            let max_malformed = config.replay.max_malformed_lines;
            let mut replayer = Replayer::new(config)?;
            if let Some(path) = store_file {
                replayer = replayer.with_store_file(path);
            }

            let source = match source_type {
                SourceType::Online => replayer.online_source(limit).await?,
                SourceType::CaptureDir => StatementSource::CaptureDir {
                    dir: require_path(source_path)?,
                    handoff_file,
                },
                SourceType::Jsonl => StatementSource::Jsonl {
                    path: require_path(source_path)?,
                    max_malformed,
                },
                SourceType::Lines => StatementSource::Lines {
                    path: require_path(source_path)?,
                },
            };

            let result = match mode {
                Mode::Compat => replayer.check_compatibility(source, cancel_token).await?,
                Mode::Perf => replayer.benchmark(source, cancel_token).await?,
            };
            report(&result, cli.output_json)?;
        }

        Commands::Capture {
            output,
            duration_seconds,
            interval_seconds,
            limit_per_interval,
            dedup,
            no_binds,
            schemas,
            modules,
        } => {
            if let Some(path) = output {
                config.capture.output = path;
            }
            if let Some(d) = duration_seconds {
                config.capture.duration_seconds = d;
            }
            if let Some(i) = interval_seconds {
                config.capture.interval_seconds = i;
            }
            if let Some(l) = limit_per_interval {
                config.capture.limit_per_interval = l;
            }
            if dedup {
                config.capture.dedup = true;
            }
            if no_binds {
                config.capture.include_binds = false;
            }
            if !schemas.is_empty() {
                config.capture.schemas = schemas;
            }
            if !modules.is_empty() {
                config.capture.modules = modules;
            }
            config.validate()?;

            let replayer = Replayer::new(config)?;
            let result = replayer.capture(cancel_token).await?;
            report(&result, cli.output_json)?;
        }

        Commands::HealthCheck => {
            let replayer = Replayer::new(config)?;
            let result = replayer.health_check().await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                if result.source_configured {
                    println!(
                        "  Source: {} ({}ms)",
                        if result.source_connected { "OK" } else { "FAILED" },
                        result.source_latency_ms
                    );
                    if let Some(ref err) = result.source_error {
                        println!("    Error: {}", err);
                    }
                } else {
                    println!("  Source: not configured");
                }
                println!(
                    "  Target: {} ({}ms)",
                    if result.target_connected { "OK" } else { "FAILED" },
                    result.target_latency_ms
                );
                if let Some(ref err) = result.target_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "\n  Overall: {}",
                    if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !result.healthy {
                return Err(ReplayError::TargetConnection("Health check failed".to_string()));
            }
        }
    }

    Ok(())
}

fn statement_text(sql: Option<String>, sql_file: Option<PathBuf>) -> Result<String, ReplayError> {
    match (sql, sql_file) {
        (Some(sql), _) => Ok(sql),
        (None, Some(path)) => Ok(std::fs::read_to_string(path)?),
        (None, None) => Err(ReplayError::Config(
            "either --sql or --sql-file is required".to_string(),
        )),
    }
}

fn require_path(path: Option<PathBuf>) -> Result<PathBuf, ReplayError> {
    path.ok_or_else(|| ReplayError::Config("--source-path is required for this source type".into()))
}

/// Print the run result, then fail with the run's exit error if it was
/// cancelled or timed out.
fn report(result: &ReplayResult, output_json: bool) -> Result<(), ReplayError> {
    print_result(result, output_json)?;
    match result.status_error() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn print_result(result: &ReplayResult, output_json: bool) -> Result<(), ReplayError> {
    if output_json {
        println!("{}", result.to_json()?);
        return Ok(());
    }

    println!("\nRun {} ({})", result.status, result.mode);
    println!("  Run ID: {}", result.run_id);
    println!("  Source: {}", result.source);
    println!("  Duration: {:.2}s", result.duration_seconds);
    println!("  Statements: {}", result.statements);

    if let Some(compat) = &result.compatibility {
        println!(
            "  Compatible: {}/{}",
            compat.summary.compatible, compat.summary.total
        );
        for (status, count) in &compat.summary.by_status {
            println!("    {}: {}", status, count);
        }
        for report in compat.reports.iter().filter(|r| r.error.is_some()) {
            println!("  [{}] {} - {}", report.index, report.status, preview(&report.text));
            if let Some(ref err) = report.error {
                println!("    Error: {}", err);
            }
            if let Some(ref hint) = report.hint {
                println!("    Hint: {}", hint);
            }
        }
    }

    if let Some(run) = &result.benchmark {
        println!(
            "  Attempts: {} ({} failed)",
            run.total_attempts, run.total_failures
        );
        for r in &run.results {
            let avg = r.avg_latency_ms.map_or("-".to_string(), |v| format!("{:.2}ms", v));
            let p95 = r.p95_latency_ms.map_or("-".to_string(), |v| format!("{:.2}ms", v));
            print!(
                "  [{}] ok {}/{} avg {} p95 {}",
                r.index, r.success_count, r.attempt_count, avg, p95
            );
            match (r.baseline_latency_ms, r.ratio) {
                (Some(base), Some(ratio)) => println!(" baseline {:.2}ms x{:.2}", base, ratio),
                (Some(base), None) => println!(" baseline {:.2}ms", base),
                _ => println!(),
            }
            println!("    {}", preview(&r.text));
            if let Some(first) = r
                .errors
                .iter()
                .find(|e| e.outcome != AttemptOutcome::Skipped)
            {
                println!("    Error: {}", first.message);
            }
        }
    }

    if let Some(capture) = &result.capture {
        let s = &capture.summary;
        println!("  Output: {}", capture.output.display());
        println!(
            "  Cycles: {} ({} failed), emitted {}, duplicates {}, filtered {}",
            s.cycles, s.failed_cycles, s.emitted, s.duplicates_skipped, s.filtered_out
        );
    }

    Ok(())
}

fn preview(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() > 100 {
        format!("{}...", flat.chars().take(100).collect::<String>())
    } else {
        flat
    }
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .with_target(false);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM.
/// Returns a CancellationToken that will be cancelled when a signal is received.
#[cfg(unix)]
async fn setup_signal_handler() -> Result<CancellationToken, ReplayError> {
    let cancel_token = CancellationToken::new();

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let token_int = cancel_token.clone();
    tokio::spawn(async move {
        sigint.recv().await;
        eprintln!("\nReceived SIGINT. Stopping after in-flight work...");
        token_int.cancel();
    });

    let token_term = cancel_token.clone();
    tokio::spawn(async move {
        sigterm.recv().await;
        eprintln!("\nReceived SIGTERM. Stopping after in-flight work...");
        token_term.cancel();
    });

    Ok(cancel_token)
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
async fn setup_signal_handler() -> Result<CancellationToken, ReplayError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Stopping after in-flight work...");
            token.cancel();
        }
    });

    Ok(cancel_token)
}
