//! Append-only JSONL sink for captured statements.

use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::error::Result;
use crate::statement::StatementRecord;

/// Appends records to a JSONL file, syncing after every batch so a crash
/// loses at most the batch being written.
pub struct JsonlWriter {
    path: PathBuf,
    file: File,
    written: usize,
}

impl JsonlWriter {
    /// Open `path` for appending, creating it and its parent directory.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file,
            written: 0,
        })
    }

    /// Append a batch and make it durable.
    pub async fn append(&mut self, records: &[StatementRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut buf = String::new();
        for record in records {
            buf.push_str(&record.to_json_line()?);
            buf.push('\n');
        }
        self.file.write_all(buf.as_bytes()).await?;
        self.file.flush().await?;
        self.file.sync_data().await?;
        self.written += records.len();
        Ok(records.len())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records appended through this writer.
    pub fn written(&self) -> usize {
        self.written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statement::FingerprintStrategy;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_append_is_cumulative() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("out.jsonl");
        let record = StatementRecord::from_text("select 1", FingerprintStrategy::Exact).unwrap();

        let mut writer = JsonlWriter::open(&path).await.unwrap();
        assert_eq!(writer.append(&[]).await.unwrap(), 0);
        writer.append(&[record.clone()]).await.unwrap();
        drop(writer);

        let mut writer = JsonlWriter::open(&path).await.unwrap();
        writer.append(&[record]).await.unwrap();
        assert_eq!(writer.written(), 1);

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
