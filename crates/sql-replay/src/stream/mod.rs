//! Statement sources.
//!
//! Every origin (capture directory, JSONL file, plain line file, live
//! source) is opened into the same [`StatementStream`]: a lazy, single-pass
//! sequence of [`StatementRecord`]s in source order. Nothing here reorders
//! or deduplicates; that is the capture sampler's job.

mod writer;

pub use writer::JsonlWriter;

use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::capture::CaptureSampler;
use crate::error::{ReplayError, Result};
use crate::statement::{FingerprintStrategy, StatementRecord};
use crate::tools::HandoffStatus;

/// Where statements come from.
pub enum StatementSource {
    /// Statement list written into a capture directory by the external
    /// analysis step, one statement per line.
    CaptureDir { dir: PathBuf, handoff_file: String },
    /// Persisted capture records, one JSON object per line.
    Jsonl { path: PathBuf, max_malformed: usize },
    /// Raw statement text, one per line.
    Lines { path: PathBuf },
    /// One sampling pass against the live source.
    Online {
        sampler: Box<CaptureSampler>,
        limit: usize,
    },
}

impl fmt::Display for StatementSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatementSource::CaptureDir { dir, handoff_file } => {
                write!(f, "capture-dir {}", dir.join(handoff_file).display())
            }
            StatementSource::Jsonl { path, .. } => write!(f, "jsonl {}", path.display()),
            StatementSource::Lines { path } => write!(f, "lines {}", path.display()),
            StatementSource::Online { limit, .. } => write!(f, "online (limit {})", limit),
        }
    }
}

impl StatementSource {
    /// Open the source. Fails only if the stream cannot start at all.
    pub async fn open(self, strategy: FingerprintStrategy) -> Result<StatementStream> {
        info!("Reading statements from {}", self);
        let inner = match self {
            StatementSource::CaptureDir { dir, handoff_file } => {
                let path = match HandoffStatus::inspect(&dir, &handoff_file) {
                    HandoffStatus::Present(path) => path,
                    HandoffStatus::Missing(path) => {
                        return Err(ReplayError::CaptureListMissing { path })
                    }
                };
                Inner::Lines(open_lines(&path)?)
            }
            StatementSource::Lines { path } => Inner::Lines(open_lines(&path)?),
            StatementSource::Jsonl {
                path,
                max_malformed,
            } => Inner::Jsonl {
                lines: open_lines(&path)?,
                max_malformed,
                malformed: 0,
            },
            StatementSource::Online { mut sampler, limit } => {
                let records = sampler.sample_once(limit).await?;
                Inner::Buffered(records.into_iter())
            }
        };
        Ok(StatementStream {
            inner,
            strategy,
            line: 0,
            done: false,
        })
    }
}

fn open_lines(path: &Path) -> Result<RawLines> {
    let file = File::open(path).map_err(|e| {
        ReplayError::Config(format!("Cannot open statement file {}: {}", path.display(), e))
    })?;
    Ok(RawLines(BufReader::new(file)))
}

/// Lines as raw bytes without their terminator, so a line that is not
/// UTF-8 is reported on its own instead of failing the reader.
struct RawLines(BufReader<File>);

impl Iterator for RawLines {
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut buf = Vec::new();
        match self.0.read_until(b'\n', &mut buf) {
            Ok(0) => None,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                }
                Some(Ok(buf))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

enum Inner {
    Lines(RawLines),
    Jsonl {
        lines: RawLines,
        max_malformed: usize,
        malformed: usize,
    },
    Buffered(std::vec::IntoIter<StatementRecord>),
}

/// Lazy sequence of statements. Yields at most one error, then ends.
pub struct StatementStream {
    inner: Inner,
    strategy: FingerprintStrategy,
    line: usize,
    done: bool,
}

impl StatementStream {
    /// Drain the stream, failing on the first error.
    pub fn collect_all(self) -> Result<Vec<StatementRecord>> {
        self.collect()
    }

    fn next_line(&mut self) -> Option<Result<StatementRecord>> {
        loop {
            let Inner::Lines(lines) = &mut self.inner else {
                return None;
            };
            let bytes = match lines.next()? {
                Ok(bytes) => bytes,
                Err(e) => return Some(Err(ReplayError::source_read(self.line + 1, e.to_string()))),
            };
            self.line += 1;

            let raw = match String::from_utf8(bytes) {
                Ok(raw) => raw,
                Err(e) => return Some(Err(ReplayError::source_read(self.line, e.to_string()))),
            };
            let text = raw.trim();
            if text.is_empty() || text.starts_with("--") || text.starts_with('#') {
                continue;
            }
            return Some(
                StatementRecord::from_text(text, self.strategy)
                    .map_err(|e| ReplayError::source_read(self.line, e.to_string())),
            );
        }
    }

    fn next_json(&mut self) -> Option<Result<StatementRecord>> {
        loop {
            let Inner::Jsonl {
                lines,
                max_malformed,
                malformed,
            } = &mut self.inner
            else {
                return None;
            };
            let bytes = match lines.next()? {
                Ok(bytes) => bytes,
                Err(e) => return Some(Err(ReplayError::source_read(self.line + 1, e.to_string()))),
            };
            self.line += 1;

            let parsed = match String::from_utf8(bytes) {
                Ok(raw) if raw.trim().is_empty() => continue,
                Ok(raw) => {
                    StatementRecord::from_json_line(&raw, self.strategy).map_err(|e| e.to_string())
                }
                Err(e) => Err(format!("line is not valid UTF-8: {}", e)),
            };
            match parsed {
                Ok(record) => return Some(Ok(record)),
                Err(e) => {
                    *malformed += 1;
                    if *malformed > *max_malformed {
                        return Some(Err(ReplayError::source_read(self.line, e.to_string())));
                    }
                    warn!(
                        "Skipping malformed line {} ({} of {} tolerated): {}",
                        self.line, malformed, max_malformed, e
                    );
                }
            }
        }
    }
}

impl Iterator for StatementStream {
    type Item = Result<StatementRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = match &mut self.inner {
            Inner::Lines(_) => self.next_line(),
            Inner::Jsonl { .. } => self.next_json(),
            Inner::Buffered(records) => records.next().map(Ok),
        };
        if !matches!(item, Some(Ok(_))) {
            self.done = true;
        }
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statement::{BindValue, OriginMetadata};
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[tokio::test]
    async fn test_lines_skip_blank_and_comments() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "sqls.sql",
            "select 1 from dual\n\n-- a comment\n# another\n  select 2 from dual  \n",
        );
        let records = StatementSource::Lines { path }
            .open(FingerprintStrategy::Exact)
            .await
            .unwrap()
            .collect_all()
            .unwrap();
        let texts: Vec<_> = records.iter().map(|r| r.text()).collect();
        assert_eq!(texts, vec!["select 1 from dual", "select 2 from dual"]);
        assert!(records.iter().all(|r| r.bind_values().is_empty()));
    }

    #[tokio::test]
    async fn test_capture_dir_missing_handoff() {
        let dir = TempDir::new().unwrap();
        let err = StatementSource::CaptureDir {
            dir: dir.path().to_path_buf(),
            handoff_file: "sqls.txt".into(),
        }
        .open(FingerprintStrategy::Exact)
        .await
        .err()
        .unwrap();
        match err {
            ReplayError::CaptureListMissing { path } => {
                assert_eq!(path, dir.path().join("sqls.txt"))
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_capture_dir_reads_handoff_in_order() {
        let dir = TempDir::new().unwrap();
        write_file(&dir, "sqls.txt", "select b from t\nselect a from t\nselect b from t\n");
        let records = StatementSource::CaptureDir {
            dir: dir.path().to_path_buf(),
            handoff_file: "sqls.txt".into(),
        }
        .open(FingerprintStrategy::Exact)
        .await
        .unwrap()
        .collect_all()
        .unwrap();
        // no reordering, no dedup
        let texts: Vec<_> = records.iter().map(|r| r.text()).collect();
        assert_eq!(texts, vec!["select b from t", "select a from t", "select b from t"]);
    }

    #[tokio::test]
    async fn test_jsonl_malformed_line_fails_by_default() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "cap.jsonl",
            "{\"text\":\"select 1\"}\n{\"text\": oops\n",
        );
        let mut stream = StatementSource::Jsonl {
            path,
            max_malformed: 0,
        }
        .open(FingerprintStrategy::Exact)
        .await
        .unwrap();

        assert!(matches!(stream.next(), Some(Ok(_))));
        match stream.next() {
            Some(Err(ReplayError::SourceRead { line, .. })) => assert_eq!(line, 2),
            other => panic!("expected SourceRead, got {:?}", other.map(|r| r.is_ok())),
        }
        assert!(stream.next().is_none());
    }

    #[tokio::test]
    async fn test_jsonl_tolerance_skips_malformed() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "cap.jsonl",
            "not json\n{\"text\":\"select 1\"}\n{}\n{\"text\":\"select 2\"}\n",
        );
        let records = StatementSource::Jsonl {
            path,
            max_malformed: 2,
        }
        .open(FingerprintStrategy::Exact)
        .await
        .unwrap()
        .collect_all()
        .unwrap();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn test_jsonl_invalid_utf8_counts_as_malformed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cap.jsonl");
        let mut content = b"{\"text\":\"select 1\"}\n{\"text\":\"select ".to_vec();
        content.extend_from_slice(&[0xff]);
        content.extend_from_slice(b"\"}\r\n{\"text\":\"select 2\"}\n");
        std::fs::write(&path, &content).unwrap();

        let records = StatementSource::Jsonl {
            path: path.clone(),
            max_malformed: 5,
        }
        .open(FingerprintStrategy::Exact)
        .await
        .unwrap()
        .collect_all()
        .unwrap();
        let texts: Vec<_> = records.iter().map(|r| r.text()).collect();
        assert_eq!(texts, vec!["select 1", "select 2"]);

        let err = StatementSource::Jsonl {
            path,
            max_malformed: 0,
        }
        .open(FingerprintStrategy::Exact)
        .await
        .unwrap()
        .collect_all()
        .unwrap_err();
        assert!(matches!(err, ReplayError::SourceRead { line: 2, .. }));
    }

    #[tokio::test]
    async fn test_written_records_read_back_equal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("capture.jsonl");
        let strategy = FingerprintStrategy::Normalized;

        let original = vec![
            StatementRecord::new(
                "select * from orders where id = :1",
                vec![BindValue::Number(10.0)],
                Some(OriginMetadata {
                    schema: Some("SALES".into()),
                    ..Default::default()
                }),
                strategy,
            )
            .unwrap(),
            StatementRecord::from_text("select sysdate from dual", strategy).unwrap(),
        ];

        let mut writer = JsonlWriter::open(&path).await.unwrap();
        writer.append(&original).await.unwrap();
        drop(writer);

        let read = StatementSource::Jsonl {
            path,
            max_malformed: 0,
        }
        .open(strategy)
        .await
        .unwrap()
        .collect_all()
        .unwrap();

        assert_eq!(read.len(), original.len());
        for (a, b) in read.iter().zip(&original) {
            assert_eq!(a.text(), b.text());
            assert_eq!(a.bind_values(), b.bind_values());
            assert_eq!(a.fingerprint(), b.fingerprint());
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_config_error() {
        let err = StatementSource::Lines {
            path: PathBuf::from("/nonexistent/sqls.txt"),
        }
        .open(FingerprintStrategy::Exact)
        .await
        .err()
        .unwrap();
        assert!(matches!(err, ReplayError::Config(_)));
    }
}
