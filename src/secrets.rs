use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

use crate::errors::{AppError, AppResult};

pub const VAULT_SERVICE_NAME: &str = "GeotecLedger";
pub const SHEETS_TOKEN_ALIAS: &str = "sheets-access-token";

/// Credential storage: the OS keyring, or a process-local map for tests and dry runs.
#[derive(Clone)]
pub struct SecretVault {
    service_name: String,
    backend: SecretBackend,
}

#[derive(Clone)]
enum SecretBackend {
    Keyring,
    Memory(Arc<Mutex<HashMap<String, SecretString>>>),
}

impl SecretVault {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            backend: SecretBackend::Keyring,
        }
    }

    pub fn in_memory() -> Self {
        Self {
            service_name: "in-memory".to_string(),
            backend: SecretBackend::Memory(Arc::new(Mutex::new(HashMap::new()))),
        }
    }

    pub fn read_secret(&self, account: &str) -> AppResult<Option<SecretString>> {
        let secret = match &self.backend {
            SecretBackend::Keyring => {
                let entry = keyring::Entry::new(&self.service_name, account)?;
                match entry.get_password() {
                    Ok(value) => Some(SecretString::from(value)),
                    Err(keyring::Error::NoEntry) => None,
                    Err(err) => return Err(AppError::from(err)),
                }
            }
            SecretBackend::Memory(store) => store.lock().get(account).cloned(),
        };
        debug!(
            target: "secret_vault",
            service = %self.service_name,
            account,
            found = secret.is_some(),
            "looked up secret"
        );
        Ok(secret)
    }

    pub fn write_secret(&self, account: &str, secret: &SecretString) -> AppResult<()> {
        if secret.expose_secret().trim().is_empty() {
            return Err(AppError::Config(format!("refusing to store an empty {account}")));
        }
        match &self.backend {
            SecretBackend::Keyring => {
                let entry = keyring::Entry::new(&self.service_name, account)?;
                entry.set_password(secret.expose_secret())?;
            }
            SecretBackend::Memory(store) => {
                store.lock().insert(account.to_string(), secret.clone());
            }
        }
        info!(
            target: "secret_vault",
            service = %self.service_name,
            account,
            "stored secret"
        );
        Ok(())
    }

    pub fn delete(&self, account: &str) -> AppResult<()> {
        match &self.backend {
            SecretBackend::Keyring => {
                let entry = keyring::Entry::new(&self.service_name, account)?;
                match entry.delete_password() {
                    Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
                    Err(err) => Err(AppError::from(err)),
                }
            }
            SecretBackend::Memory(store) => {
                store.lock().remove(account);
                Ok(())
            }
        }
    }

    pub fn has(&self, account: &str) -> AppResult<bool> {
        self.read_secret(account).map(|secret| secret.is_some())
    }
}
