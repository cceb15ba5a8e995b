use session_core::Credentials;

use crate::{CredentialStore, CredentialStoreError, StoreDiagnostics};

/// Stores serialized credentials in the OS keyring under `service`/`account`.
#[derive(Debug, Clone)]
pub struct KeyringCredentialStore {
    service: String,
    account: String,
}

impl KeyringCredentialStore {
    pub fn new(service: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            account: account.into(),
        }
    }

    fn entry(&self) -> Result<keyring::Entry, CredentialStoreError> {
        keyring::Entry::new(&self.service, &self.account)
            .map_err(|err| CredentialStoreError::Backend(err.to_string()))
    }

    fn read_raw(&self) -> Result<Option<String>, CredentialStoreError> {
        match self.entry()?.get_password() {
            Ok(raw) => Ok(Some(raw)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(CredentialStoreError::Unavailable(err.to_string())),
        }
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn load(&self) -> Result<Credentials, CredentialStoreError> {
        let Some(raw) = self.read_raw()? else {
            return Ok(Credentials::fresh());
        };
        serde_json::from_str::<Credentials>(&raw)
            .map_err(|err| CredentialStoreError::Corrupt(err.to_string()))
    }

    fn save(&self, credentials: &Credentials) -> Result<(), CredentialStoreError> {
        let encoded = serde_json::to_string(credentials)
            .map_err(|err| CredentialStoreError::Backend(err.to_string()))?;
        self.entry()?
            .set_password(&encoded)
            .map_err(|err| CredentialStoreError::Unavailable(err.to_string()))
    }

    fn diagnose(&self) -> StoreDiagnostics {
        let location = format!("keyring:{}/{}", self.service, self.account);
        let raw = self.read_raw();
        let has_credentials = matches!(raw, Ok(Some(_)));
        let (registered, credentials_version, load_error) = match raw {
            Ok(Some(_)) => match self.load() {
                Ok(creds) => (creds.registered, Some(creds.version), None),
                Err(err) => (false, None, Some(err.to_string())),
            },
            Ok(None) => (false, None, None),
            Err(err) => (false, None, Some(err.to_string())),
        };

        StoreDiagnostics {
            location,
            exists: has_credentials,
            entry_count: usize::from(has_credentials),
            has_credentials,
            registered,
            credentials_version,
            load_error,
        }
    }

    fn reset(&self) -> Result<(), CredentialStoreError> {
        match self.entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => Err(CredentialStoreError::Backend(err.to_string())),
        }
    }
}
