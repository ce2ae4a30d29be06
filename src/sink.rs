//! Destinations for verdicts as they arrive.

use crate::error::ValidatorError;
use crate::verdict::VerdictRecord;

use log::debug;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Consumes verdicts one at a time. May be called from several workers at once.
pub trait ResultSink: Send + Sync {
    fn on_verdict(&self, record: &VerdictRecord) -> io::Result<()>;
}

/// Appends every successful link to a file, one flushed line per link.
///
/// The file is truncated when the sink is created. Each line is written with a single
/// `write_all` under a lock and flushed before the call returns, so an interrupted run
/// leaves a valid prefix of confirmed links.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileSink {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, ValidatorError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|source| ValidatorError::Output { path: path.clone(), source })?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ResultSink for FileSink {
    fn on_verdict(&self, record: &VerdictRecord) -> io::Result<()> {
        if !record.ok {
            return Ok(());
        }
        let line = format!("{}\n", record.link.trim_end());
        let mut file = self.file.lock();
        file.write_all(line.as_bytes())?;
        file.flush()?;
        debug!("Appended {} to {}", record.link, self.path.display());
        Ok(())
    }
}

/// Keeps every verdict in memory, in arrival order.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<VerdictRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<VerdictRecord> {
        self.records.lock().clone()
    }
}

impl ResultSink for MemorySink {
    fn on_verdict(&self, record: &VerdictRecord) -> io::Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DialError;
    use std::sync::Arc;

    #[test]
    fn only_successes_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("valid.txt");
        std::fs::write(&path, "stale\n").unwrap();

        let sink = FileSink::create(&path).unwrap();
        sink.on_verdict(&VerdictRecord::succeeded("vless://a", 10.0)).unwrap();
        sink.on_verdict(&VerdictRecord::failed("vless://b", DialError::Timeout)).unwrap();
        sink.on_verdict(&VerdictRecord::succeeded("vless://c", 20.0)).unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "vless://a\nvless://c\n");
    }

    #[test]
    fn concurrent_appends_do_not_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("valid.txt");
        let sink = Arc::new(FileSink::create(&path).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let sink = Arc::clone(&sink);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let link = format!("trojan://{}-{}@{}.example:443", t, i, "x".repeat(200));
                        sink.on_verdict(&VerdictRecord::succeeded(link, 1.0)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 400);
        assert!(lines.iter().all(|l| l.starts_with("trojan://") && l.ends_with(".example:443")));
    }

    #[test]
    fn unwritable_output_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("valid.txt");
        assert!(matches!(FileSink::create(&path), Err(ValidatorError::Output { .. })));
    }
}
