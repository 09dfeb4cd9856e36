use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::records::{RawRow, TableKind};

/// Last-resort marker for capacity errors when the provider sends no structured code.
pub const QUOTA_EXCEEDED_MARKER: &str = "Quota exceeded";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Rate or quota exhaustion; expected to succeed after a delay.
    TransientCapacity,
    Permanent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub kind: FailureKind,
    pub code: Option<u16>,
    pub message: String,
}

impl RemoteError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::TransientCapacity,
            code: None,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            code: None,
            message: message.into(),
        }
    }

    /// Classifies a provider error. Structured signals win; the message
    /// substring is only consulted when the provider sent no status.
    pub fn classify(code: Option<u16>, status: Option<&str>, message: impl Into<String>) -> Self {
        let message = message.into();
        let structured = match (code, status) {
            (Some(429), _) | (_, Some("RESOURCE_EXHAUSTED")) => Some(FailureKind::TransientCapacity),
            (_, Some(_)) => Some(FailureKind::Permanent),
            (_, None) => None,
        };
        let kind = structured.unwrap_or_else(|| {
            if message.contains(QUOTA_EXCEEDED_MARKER) {
                FailureKind::TransientCapacity
            } else {
                FailureKind::Permanent
            }
        });
        Self {
            kind,
            code,
            message,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == FailureKind::TransientCapacity
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code {code})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for RemoteError {}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Rate-limited, fallible tabular store. Rows are keyed by canonical column name.
pub trait TabularBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn read_all(&self, table: TableKind) -> RemoteResult<Vec<RawRow>>;

    fn append(&self, table: TableKind, row: &RawRow) -> RemoteResult<()>;

    fn clear(&self, table: TableKind) -> RemoteResult<()>;

    fn bulk_write(&self, table: TableKind, rows: &[RawRow]) -> RemoteResult<()>;

    /// Swaps the contents of `table` for `rows`. Backends that can do this
    /// atomically override it; the default clears and then writes, so it is
    /// safe to retry as a whole.
    fn replace(&self, table: TableKind, rows: &[RawRow]) -> RemoteResult<()> {
        self.clear(table)?;
        self.bulk_write(table, rows)
    }
}

/// In-process tables with queued fault injection.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    tables: Arc<Mutex<HashMap<TableKind, Vec<RawRow>>>>,
    faults: Arc<Mutex<VecDeque<Option<RemoteError>>>>,
    calls: Arc<AtomicUsize>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(table: TableKind, rows: Vec<RawRow>) -> Self {
        let backend = Self::new();
        backend.tables.lock().insert(table, rows);
        backend
    }

    /// The next call, whatever the operation, fails with `error`.
    pub fn fail_next(&self, error: RemoteError) {
        self.faults.lock().push_back(Some(error));
    }

    pub fn fail_next_times(&self, times: usize, error: RemoteError) {
        let mut faults = self.faults.lock();
        for _ in 0..times {
            faults.push_back(Some(error.clone()));
        }
    }

    /// Lets `calls` more calls through, then fails the `times` after them.
    pub fn fail_after(&self, calls: usize, times: usize, error: RemoteError) {
        let mut faults = self.faults.lock();
        for _ in 0..calls {
            faults.push_back(None);
        }
        for _ in 0..times {
            faults.push_back(Some(error.clone()));
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn rows(&self, table: TableKind) -> Vec<RawRow> {
        self.tables.lock().get(&table).cloned().unwrap_or_default()
    }

    fn enter(&self) -> RemoteResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.faults.lock().pop_front() {
            Some(Some(err)) => Err(err),
            _ => Ok(()),
        }
    }
}

impl TabularBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn read_all(&self, table: TableKind) -> RemoteResult<Vec<RawRow>> {
        self.enter()?;
        Ok(self.rows(table))
    }

    fn append(&self, table: TableKind, row: &RawRow) -> RemoteResult<()> {
        self.enter()?;
        self.tables
            .lock()
            .entry(table)
            .or_default()
            .push(row.clone());
        Ok(())
    }

    fn clear(&self, table: TableKind) -> RemoteResult<()> {
        self.enter()?;
        self.tables.lock().remove(&table);
        Ok(())
    }

    fn bulk_write(&self, table: TableKind, rows: &[RawRow]) -> RemoteResult<()> {
        self.enter()?;
        self.tables
            .lock()
            .entry(table)
            .or_default()
            .extend(rows.iter().cloned());
        Ok(())
    }

    fn replace(&self, table: TableKind, rows: &[RawRow]) -> RemoteResult<()> {
        self.enter()?;
        self.tables.lock().insert(table, rows.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_codes_take_precedence_over_message_text() {
        let throttled = RemoteError::classify(Some(429), None, "Too many requests");
        assert!(throttled.is_transient());

        let exhausted = RemoteError::classify(Some(400), Some("RESOURCE_EXHAUSTED"), "limit");
        assert!(exhausted.is_transient());

        let auth = RemoteError::classify(Some(401), Some("UNAUTHENTICATED"), "Quota exceeded?");
        assert!(!auth.is_transient());
    }

    #[test]
    fn falls_back_to_quota_substring() {
        let err = RemoteError::classify(
            None,
            None,
            "Quota exceeded for quota metric 'Write requests' of service sheets",
        );
        assert_eq!(err.kind, FailureKind::TransientCapacity);
        assert_eq!(
            RemoteError::classify(None, None, "connection reset").kind,
            FailureKind::Permanent
        );
    }

    #[test]
    fn memory_backend_replays_faults_in_order() {
        let backend = MemoryBackend::new();
        backend.fail_next(RemoteError::transient("busy"));
        assert!(backend.read_all(TableKind::Tasks).is_err());
        assert!(backend.read_all(TableKind::Tasks).unwrap().is_empty());
        assert_eq!(backend.calls(), 2);
    }

    #[test]
    fn delayed_faults_skip_leading_calls() {
        let backend = MemoryBackend::new();
        backend.fail_after(1, 1, RemoteError::permanent("denied"));
        assert!(backend.read_all(TableKind::Audits).is_ok());
        assert!(backend.read_all(TableKind::Audits).is_err());
        assert!(backend.read_all(TableKind::Audits).is_ok());
    }
}
