use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, trace};

use crate::backend::{RemoteError, RemoteResult, TabularBackend};
use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::records::{RawRow, TableKind};
use crate::secrets::{SecretVault, SHEETS_TOKEN_ALIAS};

/// Cells are sent verbatim so that codes such as `012` and ISO dates read
/// back exactly as written.
const VALUE_INPUT_OPTION: &str = "RAW";

/// Google Sheets v4 values API; one sheet per table, named by the table slug.
#[derive(Clone)]
pub struct SheetsBackend {
    http: Client,
    api_base: String,
    spreadsheet_id: String,
    access_token: SecretString,
    /// Whether each sheet is known to start with a header row.
    headers: Arc<Mutex<HashMap<TableKind, bool>>>,
}

impl SheetsBackend {
    pub fn new(
        api_base: &str,
        spreadsheet_id: impl Into<String>,
        access_token: SecretString,
        timeout: Duration,
    ) -> AppResult<Self> {
        let http = Client::builder()
            .user_agent("geotec-ledger/0.1.0")
            .timeout(timeout)
            .build()?;
        let api_base = api_base.trim_end_matches('/').to_string();
        Url::parse(&api_base)
            .map_err(|err| AppError::Config(format!("invalid Sheets API base URL: {err}")))?;
        Ok(Self {
            http,
            api_base,
            spreadsheet_id: spreadsheet_id.into(),
            access_token,
            headers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Token precedence: environment, then the keyring vault.
    pub fn from_config(config: &AppConfig, vault: &SecretVault) -> AppResult<Self> {
        let spreadsheet_id = config
            .spreadsheet_id
            .clone()
            .ok_or_else(|| AppError::Config("SHEETS_SPREADSHEET_ID is not set".into()))?;
        let token = match config.sheets_access_token.clone() {
            Some(token) => token,
            None => vault.read_secret(SHEETS_TOKEN_ALIAS)?.ok_or_else(|| {
                AppError::Config(
                    "no Sheets access token; set SHEETS_ACCESS_TOKEN or run `login`".into(),
                )
            })?,
        };
        Self::new(
            &config.sheets_api_base,
            spreadsheet_id,
            token,
            Duration::from_secs(config.sheets_request_timeout_secs),
        )
    }

    fn values_url(&self, range: &str, action: Option<&str>) -> RemoteResult<Url> {
        let mut url = Url::parse(&self.api_base)
            .map_err(|err| RemoteError::permanent(format!("invalid Sheets API base: {err}")))?;
        let last = match action {
            Some(action) => format!("{range}:{action}"),
            None => range.to_string(),
        };
        url.path_segments_mut()
            .map_err(|_| RemoteError::permanent("invalid Sheets API base"))?
            .push("spreadsheets")
            .push(&self.spreadsheet_id)
            .push("values")
            .push(&last);
        Ok(url)
    }

    fn send(&self, request: RequestBuilder) -> RemoteResult<Response> {
        let response = request
            .bearer_auth(self.access_token.expose_secret())
            .send()
            .map_err(|err| RemoteError::permanent(format!("Sheets request failed: {err}")))?;
        if response.status().is_success() {
            return Ok(response);
        }
        Err(api_error(response))
    }

    fn get_values(&self, range: &str) -> RemoteResult<Vec<Vec<serde_json::Value>>> {
        let url = self.values_url(range, None)?;
        let response = self.send(self.http.get(url))?;
        let range: ValueRange = response
            .json()
            .map_err(|err| RemoteError::permanent(format!("unreadable Sheets response: {err}")))?;
        Ok(range.values)
    }

    fn put_values(&self, table: TableKind, values: Vec<Vec<String>>) -> RemoteResult<()> {
        let mut url = self.values_url(&format!("{}!A1", table.slug()), None)?;
        url.query_pairs_mut()
            .append_pair("valueInputOption", VALUE_INPUT_OPTION);
        self.send(self.http.put(url).json(&json!({ "values": values })))?;
        self.headers.lock().insert(table, true);
        Ok(())
    }

    /// An append into a sheet without a header would turn the first data row
    /// into the header on the next read, so one is written first.
    fn ensure_header(&self, table: TableKind) -> RemoteResult<()> {
        let known = self.headers.lock().get(&table).copied();
        let has_header = match known {
            Some(has_header) => has_header,
            None => !self
                .get_values(&format!("{}!1:1", table.slug()))?
                .iter()
                .flatten()
                .all(|cell| cell_text(cell).trim().is_empty()),
        };
        if has_header {
            self.headers.lock().insert(table, true);
            return Ok(());
        }
        self.put_values(table, vec![header_row(table)])?;
        debug!(target: "sheets", table = %table, "wrote header row");
        Ok(())
    }
}

impl TabularBackend for SheetsBackend {
    fn name(&self) -> &'static str {
        "sheets"
    }

    fn read_all(&self, table: TableKind) -> RemoteResult<Vec<RawRow>> {
        let values = self.get_values(table.slug())?;
        self.headers.lock().insert(table, !values.is_empty());
        let rows = rows_from_values(table, values);
        debug!(target: "sheets", table = %table, rows = rows.len(), "read sheet");
        Ok(rows)
    }

    fn append(&self, table: TableKind, row: &RawRow) -> RemoteResult<()> {
        self.ensure_header(table)?;
        let mut url = self.values_url(table.slug(), Some("append"))?;
        url.query_pairs_mut()
            .append_pair("valueInputOption", VALUE_INPUT_OPTION)
            .append_pair("insertDataOption", "INSERT_ROWS");
        let body = json!({ "values": [cells_in_order(table, row)] });
        self.send(self.http.post(url).json(&body))?;
        trace!(target: "sheets", table = %table, "appended row");
        Ok(())
    }

    fn clear(&self, table: TableKind) -> RemoteResult<()> {
        let url = self.values_url(table.slug(), Some("clear"))?;
        self.send(self.http.post(url).json(&json!({})))?;
        self.headers.lock().insert(table, false);
        debug!(target: "sheets", table = %table, "cleared sheet");
        Ok(())
    }

    fn bulk_write(&self, table: TableKind, rows: &[RawRow]) -> RemoteResult<()> {
        let mut values = Vec::with_capacity(rows.len() + 1);
        values.push(header_row(table));
        values.extend(rows.iter().map(|row| cells_in_order(table, row)));
        self.put_values(table, values)?;
        debug!(target: "sheets", table = %table, rows = rows.len(), "rewrote sheet");
        Ok(())
    }
}

fn header_row(table: TableKind) -> Vec<String> {
    table
        .column_names()
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn cells_in_order(table: TableKind, row: &RawRow) -> Vec<String> {
    table
        .columns()
        .iter()
        .map(|column| row.get(column.name).cloned().unwrap_or_default())
        .collect()
}

/// The first row is the header; unknown headers are dropped and short rows
/// leave their trailing columns empty.
fn rows_from_values(table: TableKind, values: Vec<Vec<serde_json::Value>>) -> Vec<RawRow> {
    let mut iter = values.into_iter();
    let Some(header) = iter.next() else {
        return Vec::new();
    };
    let columns: Vec<Option<&'static str>> = header
        .iter()
        .map(|cell| table.resolve_header(&cell_text(cell)))
        .collect();

    iter.filter(|row| row.iter().any(|cell| !cell_text(cell).trim().is_empty()))
        .map(|row| {
            let mut raw = RawRow::new();
            for (index, column) in columns.iter().enumerate() {
                if let Some(name) = column {
                    let value = row.get(index).map(cell_text).unwrap_or_default();
                    raw.insert(name.to_string(), value);
                }
            }
            raw
        })
        .collect()
}

fn cell_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn api_error(response: Response) -> RemoteError {
    let code = response.status().as_u16();
    match response.json::<ApiErrorEnvelope>() {
        Ok(envelope) => RemoteError::classify(
            Some(envelope.error.code.unwrap_or(code)),
            envelope.error.status.as_deref(),
            envelope.error.message,
        ),
        Err(_) => RemoteError::classify(Some(code), None, format!("Sheets API returned {code}")),
    }
}

#[derive(Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

#[derive(Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    code: Option<u16>,
    #[serde(default)]
    message: String,
    status: Option<String>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn maps_header_synonyms_and_pads_short_rows() {
        let values = vec![
            vec![json!("DESC_OPERAÇÃO"), json!("DATA"), json!("SETOR"), json!("TALHÃO"), json!("AREA"), json!("extra")],
            vec![json!("Herbicida"), json!("2024-01-05"), json!(21), json!("T1")],
            vec![json!(""), json!(null)],
        ];
        let rows = rows_from_values(TableKind::PostApplication, values);
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.get("operation").map(String::as_str), Some("Herbicida"));
        assert_eq!(row.get("sector").map(String::as_str), Some("21"));
        assert_eq!(row.get("area").map(String::as_str), Some(""));
        assert!(!row.contains_key("extra"));
    }

    #[test]
    fn empty_sheet_reads_as_no_rows() {
        assert!(rows_from_values(TableKind::Tasks, Vec::new()).is_empty());
    }

    #[test]
    fn builds_escaped_values_urls() {
        let backend = SheetsBackend::new(
            "https://sheets.example.com/v4/",
            "abc123",
            SecretString::from("token".to_string()),
            Duration::from_secs(5),
        )
        .unwrap();
        let url = backend.values_url("post_application", Some("append")).unwrap();
        assert_eq!(
            url.as_str(),
            "https://sheets.example.com/v4/spreadsheets/abc123/values/post_application:append"
        );
    }
}
