//! Directory-backed credential store with atomic replace-on-save.

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use session_core::Credentials;
use tracing::{debug, warn};

use crate::{CredentialStore, CredentialStoreError, StoreDiagnostics};

pub const CREDENTIALS_FILENAME: &str = "creds.json";
const BACKUP_FILENAME: &str = "creds.json.bak";

/// Stores credentials as `<auth_dir>/creds.json`.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    auth_dir: PathBuf,
}

impl FileCredentialStore {
    pub fn new(auth_dir: impl Into<PathBuf>) -> Self {
        Self {
            auth_dir: auth_dir.into(),
        }
    }

    pub fn auth_dir(&self) -> &Path {
        &self.auth_dir
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.auth_dir.join(CREDENTIALS_FILENAME)
    }

    fn backup_path(&self) -> PathBuf {
        self.auth_dir.join(BACKUP_FILENAME)
    }

    /// Previous credentials left behind by an interrupted non-atomic replace.
    fn load_backup(&self) -> Result<Credentials, CredentialStoreError> {
        let backup = self.backup_path();
        let raw = match fs::read(&backup) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.auth_dir.display(), "no stored credentials; starting unpaired");
                return Ok(Credentials::fresh());
            }
            Err(err) => {
                return Err(CredentialStoreError::Unavailable(format!(
                    "failed reading credentials backup {}: {err}",
                    backup.display()
                )));
            }
        };

        warn!(path = %backup.display(), "recovering credentials from backup copy");
        serde_json::from_slice::<Credentials>(&raw).map_err(|err| {
            CredentialStoreError::Corrupt(format!(
                "failed parsing credentials backup {}: {err}",
                backup.display()
            ))
        })
    }

    /// Replace `path` where rename cannot overwrite. The previous file stays
    /// reachable as the backup until the new one is in place.
    fn replace_via_backup(
        &self,
        temp_path: &Path,
        path: &Path,
        rename_err: &io::Error,
    ) -> Result<(), CredentialStoreError> {
        let backup = self.backup_path();
        match fs::rename(path, &backup) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                let _ = fs::remove_file(temp_path);
                return Err(CredentialStoreError::Unavailable(format!(
                    "failed moving credentials {} aside after rename error ({rename_err}): {err}",
                    path.display()
                )));
            }
        }

        if let Err(err) = fs::rename(temp_path, path) {
            let _ = fs::rename(&backup, path);
            let _ = fs::remove_file(temp_path);
            return Err(CredentialStoreError::Unavailable(format!(
                "failed writing credentials {} after temp write: {err}",
                path.display()
            )));
        }

        sync_dir(&self.auth_dir);
        match fs::remove_file(&backup) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                path = %backup.display(),
                error = %err,
                "failed removing credentials backup"
            ),
        }
        Ok(())
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Result<Credentials, CredentialStoreError> {
        let path = self.credentials_path();
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return self.load_backup();
            }
            Err(err) => {
                return Err(CredentialStoreError::Unavailable(format!(
                    "failed reading credentials {}: {err}",
                    path.display()
                )));
            }
        };

        serde_json::from_slice::<Credentials>(&raw).map_err(|err| {
            CredentialStoreError::Corrupt(format!(
                "failed parsing credentials {}: {err}",
                path.display()
            ))
        })
    }

    fn save(&self, credentials: &Credentials) -> Result<(), CredentialStoreError> {
        fs::create_dir_all(&self.auth_dir).map_err(|err| {
            CredentialStoreError::Unavailable(format!(
                "failed creating auth directory {}: {err}",
                self.auth_dir.display()
            ))
        })?;

        let path = self.credentials_path();
        let encoded = serde_json::to_vec(credentials)
            .map_err(|err| CredentialStoreError::Backend(err.to_string()))?;
        let temp_path = temp_path_for(&path);
        if let Err(err) = write_synced(&temp_path, &encoded) {
            let _ = fs::remove_file(&temp_path);
            return Err(CredentialStoreError::Unavailable(format!(
                "failed writing temp credentials {}: {err}",
                temp_path.display()
            )));
        }

        if let Err(rename_err) = fs::rename(&temp_path, &path) {
            warn!(
                path = %path.display(),
                error = %rename_err,
                "atomic credentials rename failed; replacing through backup copy"
            );
            self.replace_via_backup(&temp_path, &path, &rename_err)?;
        }

        sync_dir(&self.auth_dir);
        Ok(())
    }

    fn diagnose(&self) -> StoreDiagnostics {
        let exists = self.auth_dir.is_dir();
        let entry_count = fs::read_dir(&self.auth_dir)
            .map(|entries| entries.filter_map(Result::ok).count())
            .unwrap_or(0);
        let has_credentials = self.credentials_path().is_file() || self.backup_path().is_file();

        let (registered, credentials_version, load_error) = if has_credentials {
            match self.load() {
                Ok(creds) => (creds.registered, Some(creds.version), None),
                Err(err) => (false, None, Some(err.to_string())),
            }
        } else {
            (false, None, None)
        };

        StoreDiagnostics {
            location: self.auth_dir.display().to_string(),
            exists,
            entry_count,
            has_credentials,
            registered,
            credentials_version,
            load_error,
        }
    }

    fn reset(&self) -> Result<(), CredentialStoreError> {
        if is_dangerous_wipe_target(&self.auth_dir) {
            warn!(path = %self.auth_dir.display(), "refusing to wipe dangerous auth directory");
            return Err(CredentialStoreError::Backend(format!(
                "refusing to wipe '{}'",
                self.auth_dir.display()
            )));
        }

        match fs::remove_dir_all(&self.auth_dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(CredentialStoreError::Unavailable(format!(
                "failed wiping auth directory {}: {err}",
                self.auth_dir.display()
            ))),
        }
    }
}

fn is_dangerous_wipe_target(path: &Path) -> bool {
    let value = path.as_os_str().to_string_lossy();
    value.is_empty() || value == "/" || value == "." || value == ".."
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// Persist directory entries (renames) on platforms that allow opening a directory.
fn sync_dir(dir: &Path) {
    if let Ok(handle) = fs::File::open(dir)
        && let Err(err) = handle.sync_all()
    {
        warn!(
            dir = %dir.display(),
            error = %err,
            "directory fsync failed after credentials replace"
        );
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or(CREDENTIALS_FILENAME);
    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos())
        .unwrap_or(0);
    parent.join(format!(".{file_name}.{now_nanos}.tmp"))
}
