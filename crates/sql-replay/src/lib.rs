//! # sql-replay
//!
//! Replay captured SQL workloads against a migration target.
//!
//! This library provides:
//!
//! - **Statement sources** that turn capture directories, JSONL captures,
//!   plain statement files and live source polling into one ordered stream
//! - **Capture sampling** of a live SQL Server or PostgreSQL source with
//!   deduplication and durable per-cycle flushes
//! - **Compatibility checks** using the target's plan-only path
//! - **Benchmarks** with a fixed worker pool, per-attempt and run timeouts,
//!   and comparison against historical baselines
//!
//! ## Example
//!
//! ```rust,no_run
//! use sql_replay::{Config, Replayer, StatementSource};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> sql_replay::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let replayer = Replayer::new(config)?;
//!     let source = StatementSource::Lines { path: "sqls.sql".into() };
//!     let result = replayer.benchmark(source, CancellationToken::new()).await?;
//!     println!("{}", result.to_json()?);
//!     Ok(())
//! }
//! ```

pub mod baseline;
pub mod bench;
pub mod capture;
pub mod compat;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod source;
pub mod statement;
pub mod stream;
pub mod target;
pub mod tls;
pub mod tools;

// Re-exports for convenient access
pub use baseline::BaselineResolver;
pub use bench::{AggregateResult, AttemptOutcome, BenchmarkExecutor, BenchmarkOptions, BenchmarkRun};
pub use capture::{CaptureOptions, CaptureSampler, CaptureSummary, SamplerState};
pub use compat::{CompatStatus, CompatibilityChecker, CompatibilityReport, CompatibilitySummary};
pub use config::{BaselineMode, CaptureConfig, Config, ReplayConfig, SourceConfig, TargetConfig};
pub use error::{ReplayError, Result};
pub use orchestrator::{HealthCheckResult, ReplayResult, Replayer};
pub use statement::{BindValue, FingerprintStrategy, LiteralStyle, OriginMetadata, StatementRecord};
pub use stream::{JsonlWriter, StatementSource, StatementStream};
pub use tools::HandoffStatus;
