//! Credential store adapters for the session runtime.

use std::sync::{Arc, RwLock};

use session_core::Credentials;
use thiserror::Error;

mod file;
#[cfg(feature = "os-keyring")]
mod keyring_store;

pub use file::{CREDENTIALS_FILENAME, FileCredentialStore};
#[cfg(feature = "os-keyring")]
pub use keyring_store::KeyringCredentialStore;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialStoreError {
    #[error("credential store unavailable: {0}")]
    Unavailable(String),
    #[error("stored credentials are corrupt: {0}")]
    Corrupt(String),
    #[error("credential store backend failure: {0}")]
    Backend(String),
}

/// Local state report used by operators deciding whether to reset a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreDiagnostics {
    /// Human-readable location of the backing store.
    pub location: String,
    /// Whether the backing location exists at all.
    pub exists: bool,
    /// Number of entries (files or records) found at the location.
    pub entry_count: usize,
    /// Whether a credentials record is present.
    pub has_credentials: bool,
    /// Whether the stored credentials finished pairing.
    pub registered: bool,
    /// Version of the stored credentials when readable.
    pub credentials_version: Option<u64>,
    /// Load failure, when the record exists but cannot be used.
    pub load_error: Option<String>,
}

pub trait CredentialStore: Send + Sync {
    /// Load stored credentials, or fresh ones when nothing is stored yet.
    fn load(&self) -> Result<Credentials, CredentialStoreError>;

    /// Durably replace the stored credentials.
    fn save(&self, credentials: &Credentials) -> Result<(), CredentialStoreError>;

    /// Inspect the backing location without modifying it.
    fn diagnose(&self) -> StoreDiagnostics;

    /// Remove every stored record so the next connect starts unpaired.
    fn reset(&self) -> Result<(), CredentialStoreError>;
}

#[derive(Clone, Default)]
pub struct InMemoryCredentialStore {
    data: Arc<RwLock<Option<Credentials>>>,
}

impl InMemoryCredentialStore {
    pub fn with_credentials(credentials: Credentials) -> Self {
        Self {
            data: Arc::new(RwLock::new(Some(credentials))),
        }
    }
}

impl CredentialStore for InMemoryCredentialStore {
    fn load(&self) -> Result<Credentials, CredentialStoreError> {
        let data = self
            .data
            .read()
            .map_err(|_| CredentialStoreError::Backend("poisoned lock".to_owned()))?;
        Ok(data.clone().unwrap_or_default())
    }

    fn save(&self, credentials: &Credentials) -> Result<(), CredentialStoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| CredentialStoreError::Backend("poisoned lock".to_owned()))?;
        *data = Some(credentials.clone());
        Ok(())
    }

    fn diagnose(&self) -> StoreDiagnostics {
        let stored = self.data.read().ok().and_then(|data| data.clone());
        StoreDiagnostics {
            location: "memory".to_owned(),
            exists: true,
            entry_count: usize::from(stored.is_some()),
            has_credentials: stored.is_some(),
            registered: stored.as_ref().is_some_and(|creds| creds.registered),
            credentials_version: stored.as_ref().map(|creds| creds.version),
            load_error: None,
        }
    }

    fn reset(&self) -> Result<(), CredentialStoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| CredentialStoreError::Backend("poisoned lock".to_owned()))?;
        *data = None;
        Ok(())
    }
}

impl<S: CredentialStore + ?Sized> CredentialStore for Arc<S> {
    fn load(&self) -> Result<Credentials, CredentialStoreError> {
        (**self).load()
    }

    fn save(&self, credentials: &Credentials) -> Result<(), CredentialStoreError> {
        (**self).save(credentials)
    }

    fn diagnose(&self) -> StoreDiagnostics {
        (**self).diagnose()
    }

    fn reset(&self) -> Result<(), CredentialStoreError> {
        (**self).reset()
    }
}
