//! Idempotent append planning.
//!
//! [`partition`] splits an incoming batch into records that are genuinely new
//! and records whose natural key is already present, either in the stored table
//! or earlier in the same batch. It performs no I/O and never modifies a
//! record; the caller appends `new_records` and reports the counts.

use std::collections::HashSet;

use chrono::NaiveDate;
use serde::Serialize;

use crate::errors::AppResult;
use crate::normalize;
use crate::records::{FieldValue, RawRow, Record, TableKind};

/// Comparison form of one key field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyPart {
    Text(String),
    Integer(i64),
    /// Bit pattern of a non-integral float.
    Float(u64),
    Date(NaiveDate),
}

impl From<&FieldValue> for KeyPart {
    fn from(value: &FieldValue) -> Self {
        match value {
            FieldValue::Text(text) => KeyPart::Text(text.trim().to_string()),
            FieldValue::Integer(number) => KeyPart::Integer(*number),
            FieldValue::Float(number) => match normalize::integral(*number) {
                Some(whole) => KeyPart::Integer(whole),
                None => KeyPart::Float(number.to_bits()),
            },
            FieldValue::Date(date) => KeyPart::Date(*date),
        }
    }
}

/// Anything that can expose normalized key components by field name.
pub trait KeySource {
    fn key_part(&self, field: &str) -> Option<KeyPart>;
}

impl KeySource for Record {
    fn key_part(&self, field: &str) -> Option<KeyPart> {
        match self.field(field) {
            Some(value) => Some(KeyPart::from(&value)),
            // A column of the table left blank keys as empty text.
            None if self.kind().has_column(field) => Some(KeyPart::Text(String::new())),
            None => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NaturalKey(Vec<KeyPart>);

impl NaturalKey {
    /// Builds the ordered key tuple, or `None` when any key field is absent.
    pub fn build<R, S>(record: &R, key_fields: &[S]) -> Option<Self>
    where
        R: KeySource + ?Sized,
        S: AsRef<str>,
    {
        if key_fields.is_empty() {
            return None;
        }
        key_fields
            .iter()
            .map(|field| record.key_part(field.as_ref()))
            .collect::<Option<Vec<_>>>()
            .map(NaturalKey)
    }

    /// Key of a stored row, normalizing only the key cells. Errors when a key
    /// cell does not normalize; other cells of the row are never read.
    pub fn from_stored<S: AsRef<str>>(table: TableKind, row: &RawRow, key_fields: &[S]) -> AppResult<Self> {
        key_fields
            .iter()
            .map(|field| {
                let field = field.as_ref();
                let cell = row.get(field).map(String::as_str).unwrap_or("");
                Ok(match table.normalize_cell(field, cell)? {
                    Some(value) => KeyPart::from(&value),
                    None => KeyPart::Text(String::new()),
                })
            })
            .collect::<AppResult<Vec<_>>>()
            .map(NaturalKey)
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome<R> {
    pub new_records: Vec<R>,
    pub duplicate_records: Vec<R>,
    /// Incoming records routed to `duplicate_records` because a key field was absent.
    pub unkeyed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MergeCounts {
    pub new_records: usize,
    pub duplicate_records: usize,
    pub unkeyed: usize,
}

impl<R> MergeOutcome<R> {
    pub fn counts(&self) -> MergeCounts {
        MergeCounts {
            new_records: self.new_records.len(),
            duplicate_records: self.duplicate_records.len(),
            unkeyed: self.unkeyed,
        }
    }
}

/// Single left-to-right pass with a seen-set seeded from `existing`.
///
/// A record that cannot produce a key is treated as a duplicate so that it is
/// never written. Stored rows without a key do not seed the seen-set.
pub fn partition<R, S>(incoming: Vec<R>, existing: &[R], key_fields: &[S]) -> MergeOutcome<R>
where
    R: KeySource,
    S: AsRef<str>,
{
    let seen = existing
        .iter()
        .filter_map(|record| NaturalKey::build(record, key_fields))
        .collect();
    partition_seeded(incoming, seen, key_fields)
}

/// [`partition`] against keys already collected from the store.
pub fn partition_seeded<R, S>(
    incoming: Vec<R>,
    mut seen: HashSet<NaturalKey>,
    key_fields: &[S],
) -> MergeOutcome<R>
where
    R: KeySource,
    S: AsRef<str>,
{
    let mut new_records = Vec::new();
    let mut duplicate_records = Vec::new();
    let mut unkeyed = 0;
    for record in incoming {
        match NaturalKey::build(&record, key_fields) {
            Some(key) => {
                if seen.insert(key) {
                    new_records.push(record);
                } else {
                    duplicate_records.push(record);
                }
            }
            None => {
                unkeyed += 1;
                duplicate_records.push(record);
            }
        }
    }

    MergeOutcome {
        new_records,
        duplicate_records,
        unkeyed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{RawRow, TableKind};

    const KEY: &[&str] = &["operation", "date", "sector", "plot"];

    fn post(op: &str, date: &str, sector: &str, plot: &str) -> Record {
        let raw: RawRow = [
            ("operation", op),
            ("date", date),
            ("sector", sector),
            ("plot", plot),
            ("area", "10"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        Record::from_raw(TableKind::PostApplication, &raw).unwrap()
    }

    #[test]
    fn overlapping_upload_only_appends_the_new_row() {
        let existing = vec![post("A", "2024-01-01", "21", "T1")];
        let incoming = vec![
            post("A", "2024-01-01", "21", "T1"),
            post("B", "2024-01-02", "22", "T2"),
        ];

        let outcome = partition(incoming.clone(), &existing, KEY);
        assert_eq!(outcome.new_records, vec![incoming[1].clone()]);
        assert_eq!(outcome.duplicate_records, vec![incoming[0].clone()]);
        assert_eq!(outcome.unkeyed, 0);
    }

    #[test]
    fn disjoint_batch_passes_through_unchanged() {
        let existing = vec![post("A", "2024-01-01", "1", "T1")];
        let incoming = vec![
            post("C", "2024-02-01", "3", "T3"),
            post("B", "2024-02-02", "2", "T2"),
            post("D", "2024-02-03", "4", "T4"),
        ];

        let outcome = partition(incoming.clone(), &existing, KEY);
        assert_eq!(outcome.new_records, incoming);
        assert!(outcome.duplicate_records.is_empty());
    }

    #[test]
    fn fully_overlapping_batch_appends_nothing() {
        let existing = vec![
            post("A", "2024-01-01", "1", "T1"),
            post("B", "2024-01-02", "2", "T2"),
        ];
        let outcome = partition(existing.clone(), &existing, KEY);
        assert!(outcome.new_records.is_empty());
        assert_eq!(outcome.duplicate_records.len(), 2);
    }

    #[test]
    fn second_run_against_updated_store_is_a_no_op() {
        let mut existing = vec![post("A", "2024-01-01", "1", "T1")];
        let incoming = vec![
            post("A", "2024-01-01", "1", "T1"),
            post("B", "2024-01-02", "2", "T2"),
            post("B", "2024-01-02", "2", "T2"),
        ];

        let first = partition(incoming.clone(), &existing, KEY);
        assert_eq!(first.new_records.len(), 1);
        existing.extend(first.new_records);

        let second = partition(incoming, &existing, KEY);
        assert!(second.new_records.is_empty());
        assert_eq!(second.duplicate_records.len(), 3);
    }

    #[test]
    fn internal_duplicates_keep_the_first_occurrence_in_order() {
        let incoming = vec![
            post("B", "2024-01-02", "2", "T2"),
            post("A", "2024-01-01", "1", "T1"),
            post("B", "2024-01-02", "2.0", "T2"),
            post("C", "2024-01-03", "3", "T3"),
        ];
        let outcome = partition(incoming.clone(), &[], KEY);
        assert_eq!(
            outcome.new_records,
            vec![incoming[0].clone(), incoming[1].clone(), incoming[3].clone()]
        );
        assert_eq!(outcome.duplicate_records, vec![incoming[2].clone()]);
    }

    #[test]
    fn key_comparison_uses_normalized_values() {
        let existing = vec![post("A", "2024-01-05", "21", "12")];
        let incoming = vec![post(" A ", "2024-1-5", "21.0", "12.0")];
        let outcome = partition(incoming, &existing, KEY);
        assert!(outcome.new_records.is_empty());
        assert_eq!(outcome.duplicate_records.len(), 1);
    }

    #[test]
    fn integral_floats_match_integers() {
        assert_eq!(
            KeyPart::from(&FieldValue::Float(21.0)),
            KeyPart::from(&FieldValue::Integer(21))
        );
        assert_ne!(
            KeyPart::from(&FieldValue::Float(21.5)),
            KeyPart::from(&FieldValue::Integer(21))
        );
    }

    #[test]
    fn records_without_a_key_field_are_never_new() {
        let incoming = vec![post("A", "2024-01-01", "1", "T1")];
        let outcome = partition(incoming, &[], &["operation", "harvest"]);
        assert!(outcome.new_records.is_empty());
        assert_eq!(outcome.unkeyed, 1);

        let empty: &[&str] = &[];
        let outcome = partition(vec![post("A", "2024-01-01", "1", "T1")], &[], empty);
        assert_eq!(outcome.counts().unkeyed, 1);
    }

    #[test]
    fn stored_keys_ignore_cells_outside_the_key() {
        let stored: RawRow = [
            ("operation", "A"),
            ("date", "01/01/2024"),
            ("sector", "21"),
            ("plot", "T1"),
            ("area", "n/a"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let key = NaturalKey::from_stored(TableKind::PostApplication, &stored, KEY).unwrap();
        assert_eq!(
            NaturalKey::build(&post("A", "2024-01-01", "21.0", "T1"), KEY),
            Some(key.clone())
        );

        let outcome = partition_seeded(
            vec![post("A", "2024-01-01", "21", "T1")],
            HashSet::from([key]),
            KEY,
        );
        assert!(outcome.new_records.is_empty());

        let mut broken = stored;
        broken.insert("date".into(), "someday".into());
        assert!(NaturalKey::from_stored(TableKind::PostApplication, &broken, KEY).is_err());
    }

    #[test]
    fn blank_optional_key_columns_still_form_a_key() {
        let raw = |requester: &str| -> RawRow {
            [
                ("date", "2024-03-04"),
                ("collaborator", "Talita"),
                ("activity", "Mapa"),
                ("requester", requester),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
        };
        let blank = Record::from_raw(TableKind::ExtraActivities, &raw("")).unwrap();
        let named = Record::from_raw(TableKind::ExtraActivities, &raw("Iago")).unwrap();
        let key = ["date", "collaborator", "activity", "requester"];

        let outcome = partition(vec![blank.clone(), named, blank], &[], &key);
        assert_eq!(outcome.new_records.len(), 2);
        assert_eq!(outcome.duplicate_records.len(), 1);
        assert_eq!(outcome.unkeyed, 0);
    }
}
