//! Incremental reads of append-only log files
//!
//! Each file has a byte cursor that only moves forward, and only past
//! newline-terminated lines. A trailing partial line stays unread until the
//! writer finishes it.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, warn};

use crate::error::Result;

pub struct LogTailer {
    cursors: HashMap<PathBuf, u64>,
    max_chunk: u64,
    start_at_tail: bool,
}

impl LogTailer {
    pub fn new(max_chunk: u64, start_at_tail: bool) -> Self {
        Self {
            cursors: HashMap::new(),
            max_chunk: max_chunk.max(1),
            start_at_tail,
        }
    }

    /// Consumed byte offset for `path`, if the file has been seen
    pub fn offset(&self, path: &Path) -> Option<u64> {
        self.cursors.get(path).copied()
    }

    /// Drop cursors of files that are no longer being tailed
    pub fn retain(&mut self, live: &[PathBuf]) {
        self.cursors.retain(|path, _| live.contains(path));
    }

    /// Read complete lines appended since the last call
    pub async fn read_new_lines(&mut self, path: &Path) -> Result<Vec<String>> {
        let mut file = File::open(path).await?;
        let len = file.metadata().await?.len();

        let offset = match self.cursors.get(path) {
            Some(offset) => *offset,
            None => {
                let start = if self.start_at_tail { len } else { 0 };
                self.cursors.insert(path.to_path_buf(), start);
                start
            }
        };

        if len <= offset {
            if len < offset {
                debug!(file = %path.display(), offset, len, "File shorter than cursor, waiting");
            }
            return Ok(Vec::new());
        }

        let available = len - offset;
        let want = available.min(self.max_chunk);
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = Vec::with_capacity(want as usize);
        (&mut file).take(want).read_to_end(&mut buf).await?;

        let (consumed, complete) = match buf.iter().rposition(|b| *b == b'\n') {
            Some(pos) => (pos + 1, true),
            // a single line longer than the chunk cap can never complete
            None if available > self.max_chunk => {
                warn!(file = %path.display(), offset, bytes = buf.len(), "Skipping oversized record");
                (buf.len(), false)
            }
            None => (0, false),
        };

        let lines: Vec<String> = if complete {
            String::from_utf8_lossy(&buf[..consumed])
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(str::to_string)
                .collect()
        } else {
            Vec::new()
        };

        let next = offset + consumed as u64;
        self.cursors.insert(path.to_path_buf(), next);
        debug!(file = %path.display(), from = offset, to = next, lines = lines.len(), "Tailed file");
        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_partial_line_waits_for_completion() {
        let mut file = NamedTempFile::new().unwrap();
        let mut tailer = LogTailer::new(1024, false);

        write!(file, "{{\"a\":1}}\n{{\"b\":").unwrap();
        file.flush().unwrap();
        let first = tailer.read_new_lines(file.path()).await.unwrap();
        assert_eq!(first, vec![r#"{"a":1}"#.to_string()]);
        let after_first = tailer.offset(file.path()).unwrap();
        assert_eq!(after_first, 8);

        write!(file, "2}}\n").unwrap();
        file.flush().unwrap();
        let second = tailer.read_new_lines(file.path()).await.unwrap();
        assert_eq!(second, vec![r#"{"b":2}"#.to_string()]);
        let after_second = tailer.offset(file.path()).unwrap();
        assert!(after_second >= after_first);
        assert_eq!(after_second, file.as_file().metadata().unwrap().len());

        assert!(tailer.read_new_lines(file.path()).await.unwrap().is_empty());
        assert_eq!(tailer.offset(file.path()), Some(after_second));
    }

    #[tokio::test]
    async fn test_start_at_tail_skips_existing_content() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "old").unwrap();
        file.flush().unwrap();

        let mut tailer = LogTailer::new(1024, true);
        assert!(tailer.read_new_lines(file.path()).await.unwrap().is_empty());

        writeln!(file, "new").unwrap();
        file.flush().unwrap();
        assert_eq!(tailer.read_new_lines(file.path()).await.unwrap(), vec!["new"]);
    }

    #[tokio::test]
    async fn test_chunk_cap_reads_in_pieces() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "aaaa").unwrap();
        writeln!(file, "bbbb").unwrap();
        file.flush().unwrap();

        let mut tailer = LogTailer::new(7, false);
        assert_eq!(tailer.read_new_lines(file.path()).await.unwrap(), vec!["aaaa"]);
        assert_eq!(tailer.read_new_lines(file.path()).await.unwrap(), vec!["bbbb"]);
        assert_eq!(tailer.offset(file.path()), Some(10));
    }
}
