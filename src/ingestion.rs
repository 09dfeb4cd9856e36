use csv::{ReaderBuilder, StringRecord, Trim};
use serde::Serialize;
use tracing::debug;

use crate::errors::{AppError, AppResult};
use crate::records::{RawRow, Record, TableKind};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Normalized records from one uploaded file, in file order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadBatch {
    pub table: TableKind,
    pub records: Vec<Record>,
    /// Lines with every cell empty; not counted as records.
    pub blank_lines: usize,
    /// Headers that matched no column of the table.
    pub ignored_headers: Vec<String>,
}

impl UploadBatch {
    /// Distinct post-application operations, in first-seen order.
    pub fn operations(&self) -> Vec<String> {
        let mut operations: Vec<String> = Vec::new();
        for record in &self.records {
            if let Record::PostApplication(post) = record {
                if !operations.contains(&post.operation) {
                    operations.push(post.operation.clone());
                }
            }
        }
        operations
    }

    /// Keeps only post-application records whose operation is listed.
    /// Other tables have no operation and are left untouched.
    pub fn retain_operations<S: AsRef<str>>(&mut self, selected: &[S]) {
        if self.table != TableKind::PostApplication {
            return;
        }
        let before = self.records.len();
        self.records.retain(|record| match record {
            Record::PostApplication(post) => selected
                .iter()
                .any(|operation| operation.as_ref().trim() == post.operation),
            _ => true,
        });
        debug!(
            target: "ingestion",
            kept = self.records.len(),
            dropped = before - self.records.len(),
            "filtered upload by operation"
        );
    }
}

/// Parses a CSV upload for `table`. Headers are matched case-insensitively
/// against the column names and their synonyms; `;` and `,` delimiters are
/// both accepted. A single malformed row rejects the whole file.
pub fn parse_upload(table: TableKind, bytes: &[u8]) -> AppResult<UploadBatch> {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    let mut reader = ReaderBuilder::new()
        .delimiter(sniff_delimiter(bytes))
        .trim(Trim::All)
        .flexible(true)
        .from_reader(bytes);

    let headers = reader.headers()?.clone();
    let (columns, ignored_headers) = resolve_columns(table, &headers);
    let missing: Vec<String> = table
        .columns()
        .iter()
        .filter(|column| column.required && !columns.iter().any(|c| *c == Some(column.name)))
        .map(|column| column.name.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(AppError::MissingColumns {
            table: table.slug(),
            missing,
        });
    }

    let mut records = Vec::new();
    let mut blank_lines = 0;
    for (index, line) in reader.records().enumerate() {
        // Header is line 1.
        let row_number = index + 2;
        let line = line.map_err(|err| AppError::from(err).at_row(row_number))?;
        if line.iter().all(|cell| cell.is_empty()) {
            blank_lines += 1;
            continue;
        }
        let raw = raw_row(&columns, &line);
        let record = Record::from_raw(table, &raw).map_err(|err| err.at_row(row_number))?;
        records.push(record);
    }

    debug!(
        target: "ingestion",
        table = %table,
        records = records.len(),
        blank_lines,
        "parsed upload"
    );
    Ok(UploadBatch {
        table,
        records,
        blank_lines,
        ignored_headers,
    })
}

fn resolve_columns(
    table: TableKind,
    headers: &StringRecord,
) -> (Vec<Option<&'static str>>, Vec<String>) {
    let mut columns = Vec::with_capacity(headers.len());
    let mut ignored = Vec::new();
    for header in headers {
        let resolved = table
            .resolve_header(header)
            .filter(|name| !columns.contains(&Some(*name)));
        if resolved.is_none() && !header.is_empty() {
            ignored.push(header.to_string());
        }
        columns.push(resolved);
    }
    (columns, ignored)
}

fn raw_row(columns: &[Option<&'static str>], line: &StringRecord) -> RawRow {
    columns
        .iter()
        .enumerate()
        .filter_map(|(index, column)| {
            column.map(|name| (name.to_string(), line.get(index).unwrap_or("").to_string()))
        })
        .collect()
}

/// Spreadsheet exports in pt-BR locales use `;` because `,` is the decimal mark.
fn sniff_delimiter(bytes: &[u8]) -> u8 {
    let first_line = bytes.split(|b| *b == b'\n').next().unwrap_or(bytes);
    let semicolons = first_line.iter().filter(|b| **b == b';').count();
    let commas = first_line.iter().filter(|b| **b == b',').count();
    if semicolons > commas {
        b';'
    } else {
        b','
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    const POST_APPLICATION_CSV: &str = "\u{feff}DESC_OPERAÇÃO;DATA;SETOR;TALHÃO;AREA;FAZENDA\n\
Herbicida pós;05/01/2024;21;1.0;12,5;Santa Rita\n\
Adubação;2024-01-06;21.0;T2;;Santa Rita\n\
;;;;;\n\
Herbicida pós;2024-01-07 00:00:00;22;3;4;Boa Vista\n";

    #[test]
    fn parses_legacy_headers_and_semicolons() {
        let batch = parse_upload(TableKind::PostApplication, POST_APPLICATION_CSV.as_bytes()).unwrap();
        assert_eq!(batch.records.len(), 3);
        assert_eq!(batch.blank_lines, 1);
        assert_eq!(batch.ignored_headers, vec!["FAZENDA".to_string()]);

        let Record::PostApplication(first) = &batch.records[0] else {
            panic!("expected post-application record");
        };
        assert_eq!(first.operation, "Herbicida pós");
        assert_eq!(first.date, NaiveDate::from_ymd_opt(2024, 1, 5).unwrap());
        assert_eq!(first.sector, 21);
        assert_eq!(first.plot, "1");
        assert_eq!(first.area, Some(12.5));
    }

    #[test]
    fn lists_and_filters_operations() {
        let mut batch =
            parse_upload(TableKind::PostApplication, POST_APPLICATION_CSV.as_bytes()).unwrap();
        assert_eq!(batch.operations(), vec!["Herbicida pós", "Adubação"]);
        batch.retain_operations(&["Herbicida pós"]);
        assert_eq!(batch.records.len(), 2);
        assert!(batch.operations().iter().all(|op| op == "Herbicida pós"));
    }

    #[test]
    fn missing_required_columns_reject_the_file() {
        let csv = "DATA,SETOR,AREA\n2024-01-05,21,3\n";
        let err = parse_upload(TableKind::PostApplication, csv.as_bytes()).unwrap_err();
        match err {
            AppError::MissingColumns { table, missing } => {
                assert_eq!(table, "post_application");
                assert_eq!(missing, vec!["operation", "plot"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn one_bad_row_rejects_everything() {
        let csv = "data,setor,colaborador,tipo\n\
2024-01-05,21,Ana,Plantio\n\
not a date,21,Pedro,Plantio\n";
        let err = parse_upload(TableKind::Tasks, csv.as_bytes()).unwrap_err();
        match err {
            AppError::InvalidRow { row, .. } => assert_eq!(row, 3),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn filter_leaves_other_tables_alone() {
        let csv = "Data,Setor,Colaborador\n2024-02-01,4,Ana\n";
        let mut batch = parse_upload(TableKind::Tasks, csv.as_bytes()).unwrap();
        batch.retain_operations(&["Herbicida"]);
        assert_eq!(batch.records.len(), 1);
        assert!(batch.operations().is_empty());
    }

    #[test]
    fn empty_upload_yields_no_records() {
        let csv = "data,setor,colaborador\n";
        let batch = parse_upload(TableKind::Tasks, csv.as_bytes()).unwrap();
        assert!(batch.records.is_empty());
    }
}
