use std::fmt;
use std::io::{ErrorKind, Write};
use std::path::Path;

use base64::engine::general_purpose::STANDARD as B64_ENGINE;
use base64::Engine;
use sha2::{Digest, Sha256};

use crate::errors::{AiError, AiResult};

pub const KEY_LEN: usize = 32;

/// Owner of the symmetric key used to seal stored credentials.
///
/// The key is immutable once constructed, so one provider can back any number
/// of concurrent ciphers. Losing the key file makes every stored credential
/// unrecoverable; callers are expected to surface that rather than regenerate.
#[derive(Clone)]
pub struct KeyProvider {
    key: [u8; KEY_LEN],
}

impl fmt::Debug for KeyProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyProvider")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

impl KeyProvider {
    pub fn from_bytes(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    /// Fresh key from the OS random source, not persisted.
    pub fn generate() -> AiResult<Self> {
        let mut key = [0u8; KEY_LEN];
        getrandom::getrandom(&mut key)
            .map_err(|err| AiError::KeyFile(format!("secure random source failed: {err}")))?;
        Ok(Self { key })
    }

    /// Load the key at `path`, or create it with owner-only permissions when
    /// the file does not exist yet. A file that exists but does not hold a
    /// valid key is an error and is never overwritten.
    pub fn load_or_generate(path: &Path) -> AiResult<Self> {
        if path.exists() {
            return Self::load(path);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| AiError::KeyFile(format!("{}: {err}", parent.display())))?;
        }

        let provider = Self::generate()?;
        match create_owner_only(path) {
            Ok(mut file) => {
                file.write_all(B64_ENGINE.encode(provider.key).as_bytes())
                    .and_then(|_| file.sync_all())
                    .map_err(|err| AiError::KeyFile(format!("{}: {err}", path.display())))?;
                log::info!(
                    target: "ai.secrets",
                    "generated new credential key {} at {}",
                    provider.fingerprint(),
                    path.display()
                );
                Ok(provider)
            }
            // Another process won the race to create it.
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Self::load(path),
            Err(err) => Err(AiError::KeyFile(format!("{}: {err}", path.display()))),
        }
    }

    fn load(path: &Path) -> AiResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| AiError::KeyFile(format!("{}: {err}", path.display())))?;
        let bytes = B64_ENGINE
            .decode(raw.trim().as_bytes())
            .map_err(|_| AiError::KeyFile(format!("{} is not valid base64", path.display())))?;
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            AiError::KeyFile(format!(
                "{} holds {} bytes, expected {KEY_LEN}",
                path.display(),
                bytes.len()
            ))
        })?;
        Ok(Self { key })
    }

    /// Short SHA-256 fingerprint, safe to log and to persist for mismatch
    /// detection.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.key);
        digest[..8].iter().map(|b| format!("{b:02x}")).collect()
    }

    pub(crate) fn key_bytes(&self) -> &[u8; KEY_LEN] {
        &self.key
    }
}

#[cfg(unix)]
fn create_owner_only(path: &Path) -> std::io::Result<std::fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn create_owner_only(path: &Path) -> std::io::Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_then_reloads_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("credentials.key");
        let first = KeyProvider::load_or_generate(&path).unwrap();
        let second = KeyProvider::load_or_generate(&path).unwrap();
        assert_eq!(first.key_bytes(), second.key_bytes());
        assert_eq!(first.fingerprint().len(), 16);
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.key");
        KeyProvider::load_or_generate(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn corrupt_key_file_is_reported_not_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.key");
        std::fs::write(&path, "c2hvcnQ=").unwrap();
        let err = KeyProvider::load_or_generate(&path).unwrap_err();
        assert!(matches!(err, AiError::KeyFile(_)));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "c2hvcnQ=");
    }

    #[test]
    fn debug_output_hides_key_material() {
        let provider = KeyProvider::from_bytes([7u8; KEY_LEN]);
        let printed = format!("{provider:?}");
        assert!(printed.contains("fingerprint"));
        assert!(!printed.contains("[7, 7"));
    }
}
