use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::backend::TabularBackend;
use crate::ingestion::{self, UploadBatch};
use crate::merge::{self, MergeOutcome, NaturalKey};
use crate::records::{RawRow, Record, TableKind};
use crate::retry::RemoteCaller;
use crate::settings::TableSettings;
use crate::status::StatusChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Completed,
    /// A remote call failed for good; rows appended before it stay written.
    Aborted,
    /// The input was rejected before anything was written.
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub table: TableKind,
    pub incoming: usize,
    pub appended: usize,
    pub duplicates: usize,
    pub unkeyed: usize,
    pub outcome: SyncOutcome,
}

impl SyncSummary {
    fn empty(table: TableKind, incoming: usize, outcome: SyncOutcome) -> Self {
        Self {
            table,
            incoming,
            appended: 0,
            duplicates: 0,
            unkeyed: 0,
            outcome,
        }
    }
}

/// Reads, merges and writes table rows through one backend. Every remote
/// call goes through the retry wrapper.
#[derive(Clone)]
pub struct SyncService {
    backend: Arc<dyn TabularBackend>,
    caller: RemoteCaller,
    settings: TableSettings,
}

impl SyncService {
    pub fn new(backend: Arc<dyn TabularBackend>, caller: RemoteCaller, settings: TableSettings) -> Self {
        Self {
            backend,
            caller,
            settings,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn settings(&self) -> &TableSettings {
        &self.settings
    }

    fn status(&self) -> &Arc<dyn StatusChannel> {
        self.caller.status()
    }

    /// Current rows of `table` as records. Rows that no longer normalize are
    /// skipped with a warning; `None` means the read itself failed.
    pub fn load_table(&self, table: TableKind) -> Option<Vec<Record>> {
        let rows = self
            .caller
            .call(&format!("read {table}"), || self.backend.read_all(table))?;
        let mut records = Vec::with_capacity(rows.len());
        for (index, row) in rows.iter().enumerate() {
            match Record::from_raw(table, row) {
                Ok(record) => records.push(record),
                Err(err) => warn!(
                    target: "sync",
                    table = %table,
                    position = index,
                    error = %err,
                    "skipping stored row that does not normalize"
                ),
            }
        }
        debug!(target: "sync", table = %table, rows = records.len(), "loaded table");
        Some(records)
    }

    /// Natural keys already stored in `table`. Only key cells are normalized,
    /// so a row with a malformed non-key cell still blocks its key; a row
    /// whose key cells do not normalize is skipped with a warning.
    fn stored_keys(&self, table: TableKind, key_fields: &[String]) -> Option<HashSet<NaturalKey>> {
        let rows = self
            .caller
            .call(&format!("read {table}"), || self.backend.read_all(table))?;
        let mut keys = HashSet::with_capacity(rows.len());
        for (index, row) in rows.iter().enumerate() {
            match NaturalKey::from_stored(table, row, key_fields) {
                Ok(key) => {
                    keys.insert(key);
                }
                Err(err) => warn!(
                    target: "sync",
                    table = %table,
                    position = index,
                    error = %err,
                    "stored row has no usable natural key"
                ),
            }
        }
        debug!(target: "sync", table = %table, rows = rows.len(), keys = keys.len(), "collected stored keys");
        Some(keys)
    }

    /// Appends the records of `incoming` whose natural key is not stored yet.
    pub fn import_records(&self, table: TableKind, incoming: Vec<Record>) -> SyncSummary {
        let total = incoming.len();
        if let Some(stray) = incoming.iter().find(|record| record.kind() != table) {
            self.status().fatal(format!(
                "cannot import a {} record into {table}",
                stray.kind()
            ));
            return SyncSummary::empty(table, total, SyncOutcome::Rejected);
        }

        let key_fields = self.settings.natural_key(table);
        let Some(seen) = self.stored_keys(table, &key_fields) else {
            return SyncSummary::empty(table, total, SyncOutcome::Aborted);
        };
        let MergeOutcome {
            new_records,
            duplicate_records,
            unkeyed,
        } = merge::partition_seeded(incoming, seen, &key_fields);
        if unkeyed > 0 {
            warn!(
                target: "sync",
                table = %table,
                unkeyed,
                key = ?key_fields,
                "records without a complete natural key were not written"
            );
        }

        let mut summary = SyncSummary {
            table,
            incoming: total,
            appended: 0,
            duplicates: duplicate_records.len(),
            unkeyed,
            outcome: SyncOutcome::Completed,
        };
        let label = format!("append to {table}");
        for record in &new_records {
            let row: RawRow = record.to_raw();
            if self
                .caller
                .call(&label, || self.backend.append(table, &row))
                .is_none()
            {
                error!(
                    target: "sync",
                    table = %table,
                    appended = summary.appended,
                    remaining = new_records.len() - summary.appended,
                    "import aborted"
                );
                summary.outcome = SyncOutcome::Aborted;
                return summary;
            }
            summary.appended += 1;
        }

        info!(
            target: "sync",
            table = %table,
            appended = summary.appended,
            duplicates = summary.duplicates,
            "import completed"
        );
        self.status().success(format!(
            "{table}: {} new record(s) saved, {} duplicate(s) skipped",
            summary.appended, summary.duplicates
        ));
        summary
    }

    /// Parses an uploaded file and imports it. A file with a data-shape error
    /// is rejected whole. `operations` narrows post-application uploads.
    pub fn import_upload<S: AsRef<str>>(
        &self,
        table: TableKind,
        bytes: &[u8],
        operations: Option<&[S]>,
    ) -> SyncSummary {
        let mut batch: UploadBatch = match ingestion::parse_upload(table, bytes) {
            Ok(batch) => batch,
            Err(err) => {
                warn!(target: "sync", table = %table, error = %err, "upload rejected");
                self.status().fatal(format!("upload rejected: {err}"));
                return SyncSummary::empty(table, 0, SyncOutcome::Rejected);
            }
        };
        if !batch.ignored_headers.is_empty() {
            debug!(
                target: "sync",
                table = %table,
                headers = ?batch.ignored_headers,
                "ignoring unknown upload columns"
            );
        }
        if let Some(operations) = operations {
            batch.retain_operations(operations);
        }
        self.import_records(table, batch.records)
    }

    /// A single form submission, through the same idempotent path.
    pub fn register(&self, record: Record) -> SyncSummary {
        self.import_records(record.kind(), vec![record])
    }

    /// Rewrites `table` with `records`, dropping in-batch duplicates first.
    pub fn replace_table(&self, table: TableKind, records: Vec<Record>) -> SyncSummary {
        let total = records.len();
        if let Some(stray) = records.iter().find(|record| record.kind() != table) {
            self.status().fatal(format!(
                "cannot write a {} record into {table}",
                stray.kind()
            ));
            return SyncSummary::empty(table, total, SyncOutcome::Rejected);
        }

        let key_fields = self.settings.natural_key(table);
        let outcome = merge::partition_seeded(records, HashSet::new(), &key_fields);
        let rows: Vec<RawRow> = outcome.new_records.iter().map(Record::to_raw).collect();
        let mut summary = SyncSummary {
            table,
            incoming: total,
            appended: 0,
            duplicates: outcome.duplicate_records.len(),
            unkeyed: outcome.unkeyed,
            outcome: SyncOutcome::Aborted,
        };

        if self
            .caller
            .call(&format!("replace {table}"), || self.backend.replace(table, &rows))
            .is_none()
        {
            error!(target: "sync", table = %table, "table was not rewritten");
            return summary;
        }

        summary.appended = rows.len();
        summary.outcome = SyncOutcome::Completed;
        info!(target: "sync", table = %table, rows = rows.len(), "table replaced");
        self.status().success(format!(
            "{table}: table rewritten with {} record(s), {} duplicate(s) dropped",
            summary.appended, summary.duplicates
        ));
        summary
    }
}
