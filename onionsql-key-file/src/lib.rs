//! File-based master key provider for `onionsql`.
//!
//! This provider keeps the master key in a single file and is suitable for
//! development and testing environments.

#![warn(clippy::pedantic, clippy::nursery)]

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use onionsql::error::KeyProviderError;
use onionsql::key_provider::KeyProvider;
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::SecretVec;
use zeroize::Zeroize;

/// File name of the master key inside the key directory.
pub const MASTER_KEY_FILE: &str = "master.key";

/// Length of the master key in bytes.
pub const MASTER_KEY_LEN: usize = 32;

/// File-based master key provider.
///
/// The key directory holds one file:
/// ```text
/// keys/
/// └── master.key      (32 bytes, 0600 permissions)
/// ```
pub struct FileKeyProvider {
    key_dir: PathBuf,
}

impl FileKeyProvider {
    /// Creates a provider over an existing key directory.
    ///
    /// # Errors
    ///
    /// Returns `KeyProviderError::KeyNotFound` if the directory does not exist.
    pub fn new(key_dir: impl Into<PathBuf>) -> Result<Self, KeyProviderError> {
        let key_dir = key_dir.into();
        if !key_dir.is_dir() {
            return Err(KeyProviderError::KeyNotFound(format!(
                "key directory does not exist: {}",
                key_dir.display()
            )));
        }
        Ok(Self { key_dir })
    }

    /// Initializes a key directory with a fresh random master key.
    ///
    /// # Errors
    ///
    /// Returns `KeyProviderError::CreationFailed` if a master key already
    /// exists, or `KeyProviderError::Io` if the directory or file cannot be
    /// written.
    pub fn init(key_dir: impl Into<PathBuf>) -> Result<Self, KeyProviderError> {
        let key_dir = key_dir.into();
        fs::create_dir_all(&key_dir)?;
        let path = key_dir.join(MASTER_KEY_FILE);
        if path.exists() {
            return Err(KeyProviderError::CreationFailed(format!(
                "master key already exists: {}",
                path.display()
            )));
        }

        let mut key = [0u8; MASTER_KEY_LEN];
        OsRng.fill_bytes(&mut key);
        let written = write_private(&path, &key);
        key.zeroize();
        written?;
        Ok(Self { key_dir })
    }

    /// Path of the master key file.
    #[must_use]
    pub fn key_path(&self) -> PathBuf {
        self.key_dir.join(MASTER_KEY_FILE)
    }
}

#[cfg(unix)]
fn write_private(path: &Path, key: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = OpenOptions::new().write(true).create_new(true).mode(0o600).open(path)?;
    file.write_all(key)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_private(path: &Path, key: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(key)?;
    file.sync_all()
}

impl KeyProvider for FileKeyProvider {
    fn master_key(&self) -> Result<SecretVec<u8>, KeyProviderError> {
        let path = self.key_path();
        let mut bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(KeyProviderError::KeyNotFound(path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        if bytes.len() != MASTER_KEY_LEN {
            let len = bytes.len();
            bytes.zeroize();
            return Err(KeyProviderError::InvalidKey(format!(
                "{} holds {len} bytes, expected {MASTER_KEY_LEN}",
                path.display()
            )));
        }
        Ok(SecretVec::new(bytes))
    }
}

#[cfg(test)]
mod tests {
    use secrecy::ExposeSecret;

    use super::*;

    #[test]
    fn test_init_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FileKeyProvider::init(dir.path().join("keys")).unwrap();
        let key = provider.master_key().unwrap();
        assert_eq!(key.expose_secret().len(), MASTER_KEY_LEN);

        let reopened = FileKeyProvider::new(dir.path().join("keys")).unwrap();
        assert_eq!(reopened.master_key().unwrap().expose_secret(), key.expose_secret());
    }

    #[test]
    fn test_init_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        FileKeyProvider::init(dir.path()).unwrap();
        assert!(matches!(FileKeyProvider::init(dir.path()), Err(KeyProviderError::CreationFailed(_))));
    }

    #[test]
    fn test_missing_directory_and_key() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            FileKeyProvider::new(dir.path().join("absent")),
            Err(KeyProviderError::KeyNotFound(_))
        ));
        let provider = FileKeyProvider::new(dir.path()).unwrap();
        assert!(matches!(provider.master_key(), Err(KeyProviderError::KeyNotFound(_))));
    }

    #[test]
    fn test_wrong_length_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(MASTER_KEY_FILE), [1u8; 16]).unwrap();
        let provider = FileKeyProvider::new(dir.path()).unwrap();
        assert!(matches!(provider.master_key(), Err(KeyProviderError::InvalidKey(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let provider = FileKeyProvider::init(dir.path()).unwrap();
        let mode = fs::metadata(provider.key_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
