use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{AppError, AppResult};
use crate::records::TableKind;

/// Natural-key configuration per table, persisted as `settings.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSettings {
    #[serde(default)]
    pub natural_keys: BTreeMap<TableKind, Vec<String>>,
}

impl Default for TableSettings {
    fn default() -> Self {
        let natural_keys = TableKind::ALL
            .into_iter()
            .map(|kind| (kind, owned(kind.default_natural_key())))
            .collect();
        Self { natural_keys }
    }
}

impl TableSettings {
    pub fn load(path: &Path) -> AppResult<Self> {
        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<Self>(&contents) {
                Ok(settings) => Ok(settings.sanitized()),
                Err(err) => {
                    warn!(
                        target: "settings",
                        error = ?err,
                        "failed to parse settings file; regenerating defaults"
                    );
                    let defaults = Self::default();
                    defaults.persist(path)?;
                    Ok(defaults)
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let defaults = Self::default();
                defaults.persist(path)?;
                Ok(defaults)
            }
            Err(err) => Err(AppError::Io(err)),
        }
    }

    pub fn persist(&self, path: &Path) -> AppResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let serialized = serde_json::to_string_pretty(self)?;
        fs::write(path, serialized)?;
        Ok(())
    }

    /// Key fields for `table`; never empty.
    pub fn natural_key(&self, table: TableKind) -> Vec<String> {
        self.natural_keys
            .get(&table)
            .filter(|fields| !fields.is_empty())
            .cloned()
            .unwrap_or_else(|| owned(table.default_natural_key()))
    }

    pub fn set_natural_key<S: AsRef<str>>(&mut self, table: TableKind, fields: &[S]) -> AppResult<()> {
        let fields = validate_key(table, fields)?;
        self.natural_keys.insert(table, fields);
        Ok(())
    }

    /// Drops entries that name unknown columns or no columns at all, so the
    /// table falls back to its default key.
    fn sanitized(mut self) -> Self {
        self.natural_keys.retain(|table, fields| {
            match validate_key(*table, fields.as_slice()) {
                Ok(valid) => {
                    *fields = valid;
                    true
                }
                Err(err) => {
                    warn!(
                        target: "settings",
                        table = %table,
                        error = %err,
                        "ignoring configured natural key; using default"
                    );
                    false
                }
            }
        });
        self
    }
}

fn validate_key<S: AsRef<str>>(table: TableKind, fields: &[S]) -> AppResult<Vec<String>> {
    if fields.is_empty() {
        return Err(AppError::Config(format!(
            "natural key for {table} must name at least one column"
        )));
    }
    let mut valid = Vec::with_capacity(fields.len());
    for field in fields {
        let field = field.as_ref().trim();
        if !table.has_column(field) {
            return Err(AppError::Config(format!(
                "natural key for {table} names unknown column {field:?}"
            )));
        }
        if !valid.iter().any(|existing: &String| existing == field) {
            valid.push(field.to_string());
        }
    }
    Ok(valid)
}

fn owned(fields: &[&str]) -> Vec<String> {
    fields.iter().map(|field| field.to_string()).collect()
}

pub fn settings_path(data_dir: &Path) -> PathBuf {
    data_dir.join("settings.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn loads_defaults_when_file_missing() {
        let dir = tempdir().unwrap();
        let path = settings_path(dir.path());
        let settings = TableSettings::load(&path).unwrap();
        assert!(path.exists());
        assert_eq!(
            settings.natural_key(TableKind::PostApplication),
            vec!["operation", "date", "sector", "plot"]
        );
    }

    #[test]
    fn persists_updates() {
        let dir = tempdir().unwrap();
        let path = settings_path(dir.path());
        let mut settings = TableSettings::load(&path).unwrap();
        settings
            .set_natural_key(TableKind::Audits, &["date", "unit"])
            .unwrap();
        settings.persist(&path).unwrap();
        let roundtrip = TableSettings::load(&path).unwrap();
        assert_eq!(roundtrip.natural_key(TableKind::Audits), vec!["date", "unit"]);
    }

    #[test]
    fn regenerates_unreadable_file() {
        let dir = tempdir().unwrap();
        let path = settings_path(dir.path());
        fs::write(&path, "{ not json").unwrap();
        let settings = TableSettings::load(&path).unwrap();
        assert_eq!(settings, TableSettings::default());
        let rewritten = fs::read_to_string(&path).unwrap();
        assert!(rewritten.contains("natural_keys"));
    }

    #[test]
    fn rejects_empty_or_unknown_keys() {
        let mut settings = TableSettings::default();
        let empty: [&str; 0] = [];
        assert!(settings.set_natural_key(TableKind::Tasks, &empty).is_err());
        assert!(settings
            .set_natural_key(TableKind::Tasks, &["date", "plot"])
            .is_err());
        assert_eq!(
            settings.natural_key(TableKind::Tasks),
            vec!["date", "sector", "collaborator", "kind"]
        );
    }

    #[test]
    fn invalid_entries_on_disk_fall_back_to_defaults() {
        let dir = tempdir().unwrap();
        let path = settings_path(dir.path());
        fs::write(
            &path,
            r#"{"natural_keys":{"tasks":[],"audits":["date","bogus"],"post_application":["plot"," date "]}}"#,
        )
        .unwrap();
        let settings = TableSettings::load(&path).unwrap();
        assert_eq!(
            settings.natural_key(TableKind::Tasks),
            vec!["date", "sector", "collaborator", "kind"]
        );
        assert_eq!(settings.natural_key(TableKind::Audits), vec!["date", "unit", "sector"]);
        assert_eq!(
            settings.natural_key(TableKind::PostApplication),
            vec!["plot", "date"]
        );
    }
}
