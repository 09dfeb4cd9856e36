use std::path::PathBuf;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

use crate::errors::{AppError, AppResult};

const DEFAULT_SHEETS_API_BASE: &str = "https://sheets.googleapis.com/v4";
const DEFAULT_DATABASE_FILE: &str = "geotec-ledger.db";
const DEFAULT_DATA_DIR: &str = ".geotec";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Sheets,
    Sqlite,
    Memory,
}

impl BackendKind {
    pub fn parse(value: &str) -> AppResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sheets" | "google_sheets" => Ok(BackendKind::Sheets),
            "sqlite" | "local" => Ok(BackendKind::Sqlite),
            "memory" => Ok(BackendKind::Memory),
            other => Err(AppError::Config(format!("unknown backend: {other}"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Sheets => "sheets",
            BackendKind::Sqlite => "sqlite",
            BackendKind::Memory => "memory",
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub backend: BackendKind,
    pub data_dir: PathBuf,
    pub database_file_name: String,
    pub spreadsheet_id: Option<String>,
    pub sheets_api_base: String,
    pub sheets_access_token: Option<SecretString>,
    pub sheets_request_timeout_secs: u64,
    pub retry_max_attempts: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_jitter_ms: u64,
    pub status_journal_enabled: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub backend: BackendKind,
    pub data_dir: String,
    pub database_file_name: String,
    pub spreadsheet_id: Option<String>,
    pub sheets_api_base: String,
    pub sheets_request_timeout_secs: u64,
    pub retry_max_attempts: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_jitter_ms: u64,
    pub status_journal_enabled: bool,
    pub has_sheets_access_token: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let backend = env::var("GEOTEC_BACKEND")
            .ok()
            .and_then(|value| match BackendKind::parse(&value) {
                Ok(kind) => Some(kind),
                Err(err) => {
                    debug!(?err, "ignoring GEOTEC_BACKEND");
                    None
                }
            })
            .unwrap_or(BackendKind::Sqlite);

        Self {
            backend,
            data_dir: env::var("GEOTEC_DATA_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
            database_file_name: env::var("DATABASE_FILE_NAME")
                .unwrap_or_else(|_| DEFAULT_DATABASE_FILE.to_string()),
            spreadsheet_id: env::var("SHEETS_SPREADSHEET_ID")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            sheets_api_base: env::var("SHEETS_API_BASE")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_SHEETS_API_BASE.to_string()),
            sheets_access_token: env::var("SHEETS_ACCESS_TOKEN")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            sheets_request_timeout_secs: parse_u64("SHEETS_REQUEST_TIMEOUT_SECS", 30).max(1),
            retry_max_attempts: parse_attempts("RETRY_MAX_ATTEMPTS", 5),
            retry_initial_delay_ms: parse_u64("RETRY_INITIAL_DELAY_MS", 1_000),
            retry_jitter_ms: parse_u64("RETRY_JITTER_MS", 1_000),
            status_journal_enabled: parse_bool("STATUS_JOURNAL_ENABLED", true),
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_file_name)
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            backend: self.backend,
            data_dir: self.data_dir.to_string_lossy().to_string(),
            database_file_name: self.database_file_name.clone(),
            spreadsheet_id: self.spreadsheet_id.clone(),
            sheets_api_base: self.sheets_api_base.clone(),
            sheets_request_timeout_secs: self.sheets_request_timeout_secs,
            retry_max_attempts: self.retry_max_attempts,
            retry_initial_delay_ms: self.retry_initial_delay_ms,
            retry_jitter_ms: self.retry_jitter_ms,
            status_journal_enabled: self.status_journal_enabled,
            has_sheets_access_token: self.sheets_access_token.is_some(),
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

// Negative budgets clamp to zero, which the retry wrapper treats as a single attempt.
fn parse_attempts(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<i64>().ok())
        .map(|v| v.clamp(0, i64::from(u32::MAX)) as u32)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_public_profile_without_secrets() {
        env::set_var("SHEETS_ACCESS_TOKEN", "ya29.secret");
        env::set_var("SHEETS_SPREADSHEET_ID", "sheet-123");
        env::set_var("DATABASE_FILE_NAME", "custom.db");
        env::set_var("GEOTEC_BACKEND", "sheets");
        env::set_var("RETRY_MAX_ATTEMPTS", "-4");

        let config = AppConfig::from_env();
        let public = config.public_profile();

        assert_eq!(public.database_file_name, "custom.db");
        assert_eq!(public.backend, BackendKind::Sheets);
        assert_eq!(public.spreadsheet_id.as_deref(), Some("sheet-123"));
        assert!(public.has_sheets_access_token);
        assert_eq!(public.retry_max_attempts, 0);
        let serialized = serde_json::to_string(&public).unwrap();
        assert!(!serialized.contains("ya29.secret"));
    }

    #[test]
    fn parses_backend_aliases() {
        assert_eq!(BackendKind::parse("Local").unwrap(), BackendKind::Sqlite);
        assert_eq!(BackendKind::parse(" memory ").unwrap(), BackendKind::Memory);
        assert!(BackendKind::parse("firestore").is_err());
    }
}
