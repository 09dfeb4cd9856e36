use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::errors::AppResult;

const JOURNAL_FILE_NAME: &str = "status-journal.jsonl";
const JOURNAL_BATCH_SIZE: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// A retry is in progress; the operation may still succeed.
    Warning,
    /// The operation was abandoned.
    Fatal,
    Success,
}

#[derive(Clone, Debug, Serialize)]
pub struct Notice {
    pub severity: Severity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Notice {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Sink for messages that must reach the person running the action.
pub trait StatusChannel: Send + Sync {
    fn notify(&self, notice: Notice);

    fn warning(&self, message: String) {
        self.notify(Notice::new(Severity::Warning, message));
    }

    fn fatal(&self, message: String) {
        self.notify(Notice::new(Severity::Fatal, message));
    }

    fn success(&self, message: String) {
        self.notify(Notice::new(Severity::Success, message));
    }
}

#[derive(Clone, Copy, Default)]
pub struct TracingStatus;

impl StatusChannel for TracingStatus {
    fn notify(&self, notice: Notice) {
        log_notice(&notice);
    }
}

/// Keeps every notice in memory. Used by tests and by callers that render a summary.
#[derive(Clone, Default)]
pub struct MemoryStatus {
    notices: Arc<Mutex<Vec<Notice>>>,
}

impl MemoryStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().clone()
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.notices
            .lock()
            .iter()
            .filter(|notice| notice.severity == severity)
            .count()
    }
}

impl StatusChannel for MemoryStatus {
    fn notify(&self, notice: Notice) {
        self.notices.lock().push(notice);
    }
}

/// Logs notices and appends them to a JSON-lines journal in the data directory.
#[derive(Clone)]
pub struct JournalStatus {
    queue: Arc<Mutex<Vec<Notice>>>,
    journal_path: PathBuf,
    batch_size: usize,
}

impl JournalStatus {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> AppResult<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir)?;
        let journal_path = data_dir.join(JOURNAL_FILE_NAME);
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&journal_path)?;

        Ok(Self {
            queue: Arc::new(Mutex::new(Vec::new())),
            journal_path,
            batch_size: JOURNAL_BATCH_SIZE,
        })
    }

    pub fn journal_path(&self) -> &Path {
        &self.journal_path
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn flush(&self) -> AppResult<()> {
        let mut queue = self.queue.lock();
        self.persist_locked(&mut queue)
    }

    fn persist_locked(&self, queue: &mut Vec<Notice>) -> AppResult<()> {
        if queue.is_empty() {
            return Ok(());
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.journal_path)?;
        for notice in queue.iter() {
            let line = serde_json::to_vec(notice)?;
            file.write_all(&line)?;
            file.write_all(b"\n")?;
        }
        file.flush()?;
        queue.clear();
        Ok(())
    }
}

impl StatusChannel for JournalStatus {
    fn notify(&self, notice: Notice) {
        log_notice(&notice);
        let mut queue = self.queue.lock();
        let terminal = notice.severity != Severity::Warning;
        queue.push(notice);
        // Terminal notices end an action, so they are written out immediately.
        if terminal || queue.len() >= self.batch_size {
            if let Err(err) = self.persist_locked(&mut queue) {
                warn!(target: "status", ?err, "failed to persist status journal");
            }
        }
    }
}

impl Drop for JournalStatus {
    fn drop(&mut self) {
        if Arc::strong_count(&self.queue) == 1 {
            let _ = self.flush();
        }
    }
}

fn log_notice(notice: &Notice) {
    match notice.severity {
        Severity::Warning => warn!(target: "status", "{}", notice.message),
        Severity::Fatal => error!(target: "status", "{}", notice.message),
        Severity::Success => info!(target: "status", "{}", notice.message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn terminal_notices_reach_disk_immediately() {
        let dir = tempdir().unwrap();
        let journal = JournalStatus::new(dir.path()).unwrap();
        journal.warning("retrying append".into());
        assert_eq!(journal.queue_depth(), 1);

        journal.fatal("append abandoned".into());
        assert_eq!(journal.queue_depth(), 0);

        let contents = std::fs::read_to_string(journal.journal_path()).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"warning\""));
        assert!(lines[1].contains("append abandoned"));
    }

    #[test]
    fn keeps_journal_across_instances() {
        let dir = tempdir().unwrap();
        {
            let journal = JournalStatus::new(dir.path()).unwrap();
            journal.success("first".into());
        }
        let journal = JournalStatus::new(dir.path()).unwrap();
        journal.warning("second".into());
        journal.flush().unwrap();

        let contents = std::fs::read_to_string(journal.journal_path()).unwrap();
        assert!(contents.contains("first"));
        assert!(contents.contains("second"));
    }

    #[test]
    fn memory_status_counts_by_severity() {
        let status = MemoryStatus::new();
        status.warning("a".into());
        status.warning("b".into());
        status.success("c".into());
        assert_eq!(status.count(Severity::Warning), 2);
        assert_eq!(status.count(Severity::Fatal), 0);
        assert_eq!(status.notices().len(), 3);
    }
}
