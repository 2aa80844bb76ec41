//! Handoff points with external workload-capture and assessment tools.
//!
//! Those tools run as opaque processes; all we rely on is the one file
//! each leaves behind.

use std::path::{Path, PathBuf};

use serde::Serialize;

/// Whether an external step has produced its handoff file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "path", rename_all = "snake_case")]
pub enum HandoffStatus {
    Present(PathBuf),
    Missing(PathBuf),
}

impl HandoffStatus {
    /// Look for `file` inside `dir`.
    pub fn inspect(dir: impl AsRef<Path>, file: &str) -> Self {
        let path = dir.as_ref().join(file);
        if path.is_file() {
            HandoffStatus::Present(path)
        } else {
            HandoffStatus::Missing(path)
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, HandoffStatus::Present(_))
    }

    pub fn path(&self) -> &Path {
        match self {
            HandoffStatus::Present(path) | HandoffStatus::Missing(path) => path,
        }
    }
}
