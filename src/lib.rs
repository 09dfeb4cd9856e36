pub mod audit;
pub mod backend;
pub mod cli;
pub mod config;
pub mod db;
pub mod errors;
pub mod ingestion;
pub mod merge;
pub mod normalize;
pub mod records;
pub mod retry;
pub mod secrets;
pub mod settings;
pub mod sheets;
pub mod status;
pub mod sync;

use std::path::PathBuf;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::backend::{MemoryBackend, TabularBackend};
use crate::config::{AppConfig, BackendKind, PublicAppConfig};
use crate::db::LocalStore;
use crate::retry::{RemoteCaller, RetryPolicy};
use crate::secrets::{SecretVault, SHEETS_TOKEN_ALIAS, VAULT_SERVICE_NAME};
use crate::settings::{settings_path, TableSettings};
use crate::sheets::SheetsBackend;
use crate::status::{JournalStatus, StatusChannel, TracingStatus};

pub use crate::errors::{AppError, AppResult};
pub use crate::merge::{partition, MergeOutcome, NaturalKey};
pub use crate::records::{RawRow, Record, TableKind};
pub use crate::sync::{SyncOutcome, SyncService, SyncSummary};

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub backend: &'static str,
    pub database_path: Option<String>,
    pub settings_path: String,
    pub status_journal_path: Option<String>,
    pub status_journal_queue_depth: usize,
    pub has_stored_sheets_token: bool,
    pub config: PublicAppConfig,
}

/// Everything one invocation needs, built once and passed down explicitly.
pub struct AppContext {
    config: AppConfig,
    vault: SecretVault,
    journal: Option<JournalStatus>,
    settings_path: PathBuf,
    sync: SyncService,
}

impl AppContext {
    pub fn initialize(config: AppConfig) -> AppResult<Self> {
        Self::with_vault(config, SecretVault::new(VAULT_SERVICE_NAME))
    }

    pub fn with_vault(config: AppConfig, vault: SecretVault) -> AppResult<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let journal = if config.status_journal_enabled {
            Some(JournalStatus::new(&config.data_dir)?)
        } else {
            None
        };
        let status: Arc<dyn StatusChannel> = match &journal {
            Some(journal) => Arc::new(journal.clone()),
            None => Arc::new(TracingStatus),
        };

        let backend: Arc<dyn TabularBackend> = match config.backend {
            BackendKind::Sheets => Arc::new(SheetsBackend::from_config(&config, &vault)?),
            BackendKind::Sqlite => Arc::new(LocalStore::open(
                &config.data_dir,
                &config.database_file_name,
            )?),
            BackendKind::Memory => Arc::new(MemoryBackend::new()),
        };

        let settings_path = settings_path(&config.data_dir);
        let settings = TableSettings::load(&settings_path)?;
        let caller = RemoteCaller::new(RetryPolicy::from_config(&config), status);
        let sync = SyncService::new(backend, caller, settings);

        info!(
            backend = config.backend.as_str(),
            data_dir = %config.data_dir.display(),
            "application context ready"
        );
        Ok(Self {
            config,
            vault,
            journal,
            settings_path,
            sync,
        })
    }

    pub fn sync(&self) -> &SyncService {
        &self.sync
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn vault(&self) -> &SecretVault {
        &self.vault
    }

    pub fn health(&self) -> AppResult<HealthReport> {
        let has_stored_sheets_token = match self.vault.has(SHEETS_TOKEN_ALIAS) {
            Ok(found) => found,
            Err(err) => {
                warn!(?err, "keyring unavailable while checking for a stored token");
                false
            }
        };
        Ok(HealthReport {
            backend: self.sync.backend_name(),
            database_path: (self.config.backend == BackendKind::Sqlite)
                .then(|| self.config.database_path().to_string_lossy().to_string()),
            settings_path: self.settings_path.to_string_lossy().to_string(),
            status_journal_path: self
                .journal
                .as_ref()
                .map(|journal| journal.journal_path().to_string_lossy().to_string()),
            status_journal_queue_depth: self
                .journal
                .as_ref()
                .map(JournalStatus::queue_depth)
                .unwrap_or(0),
            has_stored_sheets_token,
            config: self.config.public_profile(),
        })
    }

    pub fn flush(&self) -> AppResult<()> {
        match &self.journal {
            Some(journal) => journal.flush(),
            None => Ok(()),
        }
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,geotec_ledger=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    });
}
