//! Error types for the replay library.

use std::path::PathBuf;
use thiserror::Error;

/// Exit code for configuration problems (invalid YAML, missing fields, etc.).
pub const EXIT_CONFIG_ERROR: u8 = 1;
/// Exit code for source database failures.
pub const EXIT_SOURCE_ERROR: u8 = 2;
/// Exit code for target database failures.
pub const EXIT_TARGET_ERROR: u8 = 3;
/// Exit code for run-level timeouts.
pub const EXIT_TIMEOUT: u8 = 4;
/// Exit code when the run was cancelled by a signal.
pub const EXIT_CANCELLED: u8 = 5;
/// Exit code for filesystem errors.
pub const EXIT_IO_ERROR: u8 = 7;

/// Main error type for replay operations.
#[derive(Error, Debug)]
pub enum ReplayError {
    /// Configuration error (invalid YAML, missing fields, bad filter, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The external analysis step has not produced its statement list yet.
    #[error("Statement list not found at {path:?} - run the external analysis step first")]
    CaptureListMissing { path: PathBuf },

    /// A statement source could not be read.
    #[error("Failed to read statement source at line {line}: {message}")]
    SourceRead { line: usize, message: String },

    /// Source database connection or query error
    #[error("Source database error: {0}")]
    Source(String),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Target database could not be reached
    #[error("Target connection error: {0}")]
    TargetConnection(String),

    /// Target database rejected a statement
    #[error("Target execution error: {0}")]
    TargetExecution(String),

    /// An operation exceeded its time budget
    #[error("Timed out: {0}")]
    Timeout(String),

    /// A historical baseline could not be resolved
    #[error("Baseline unavailable: {0}")]
    BaselineUnavailable(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Run was cancelled (SIGINT, etc.)
    #[error("Run cancelled")]
    Cancelled,
}

impl ReplayError {
    /// Create a Pool error with context about where it occurred.
    pub fn pool(message: impl std::fmt::Display, context: impl Into<String>) -> Self {
        ReplayError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a SourceRead error for a given 1-based line.
    pub fn source_read(line: usize, message: impl Into<String>) -> Self {
        ReplayError::SourceRead {
            line,
            message: message.into(),
        }
    }

    /// Process exit code for this error class.
    pub fn exit_code(&self) -> u8 {
        match self {
            ReplayError::Config(_)
            | ReplayError::CaptureListMissing { .. }
            | ReplayError::Yaml(_)
            | ReplayError::Json(_) => EXIT_CONFIG_ERROR,
            ReplayError::SourceRead { .. }
            | ReplayError::Source(_)
            | ReplayError::Pool { .. }
            | ReplayError::BaselineUnavailable(_) => EXIT_SOURCE_ERROR,
            ReplayError::TargetConnection(_) | ReplayError::TargetExecution(_) => {
                EXIT_TARGET_ERROR
            }
            ReplayError::Timeout(_) => EXIT_TIMEOUT,
            ReplayError::Cancelled => EXIT_CANCELLED,
            ReplayError::Io(_) => EXIT_IO_ERROR,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

impl From<tiberius::error::Error> for ReplayError {
    fn from(err: tiberius::error::Error) -> Self {
        ReplayError::Source(err.to_string())
    }
}

impl From<tokio_postgres::Error> for ReplayError {
    fn from(err: tokio_postgres::Error) -> Self {
        ReplayError::Source(err.to_string())
    }
}

/// Result type alias for replay operations.
pub type Result<T> = std::result::Result<T, ReplayError>;
