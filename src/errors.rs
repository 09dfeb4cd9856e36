use std::io;

use thiserror::Error;

use crate::backend::RemoteError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Keychain(#[from] keyring::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("{0}")]
    Config(String),
    #[error("{table} upload is missing required columns: {}", missing.join(", "))]
    MissingColumns {
        table: &'static str,
        missing: Vec<String>,
    },
    #[error("invalid value {value:?} for column {column}: {reason}")]
    InvalidField {
        column: String,
        value: String,
        reason: String,
    },
    #[error("row {row}: {source}")]
    InvalidRow {
        row: usize,
        #[source]
        source: Box<AppError>,
    },
}

impl AppError {
    pub(crate) fn invalid_field(
        column: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        AppError::InvalidField {
            column: column.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn at_row(self, row: usize) -> Self {
        AppError::InvalidRow {
            row,
            source: Box::new(self),
        }
    }
}
