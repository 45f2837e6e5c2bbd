use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as B64_ENGINE;
use base64::Engine;

use super::key::KeyProvider;
use crate::errors::{AiError, AiResult};

const PREFIX: &str = "v1:";
const NONCE_LEN: usize = 12;

/// AES-256-GCM sealing of credential strings.
///
/// Output is `v1:` followed by base64 of `nonce || ciphertext || tag`. Every
/// way a stored value can be wrong (prefix, encoding, length, tag, UTF-8)
/// collapses into [`AiError::DecryptionFailure`].
#[derive(Clone)]
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl CredentialCipher {
    pub fn new(keys: &KeyProvider) -> Self {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(keys.key_bytes()));
        Self { cipher }
    }

    pub fn encrypt(&self, plaintext: &str) -> AiResult<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        getrandom::getrandom(&mut nonce_bytes)
            .map_err(|err| AiError::Encryption(err.to_string()))?;
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| AiError::Encryption("AES-GCM refused the input".into()))?;

        let mut combined = Vec::with_capacity(NONCE_LEN + sealed.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&sealed);
        Ok(format!("{PREFIX}{}", B64_ENGINE.encode(combined)))
    }

    pub fn decrypt(&self, ciphertext: &str) -> AiResult<String> {
        let encoded = ciphertext
            .strip_prefix(PREFIX)
            .ok_or(AiError::DecryptionFailure)?;
        let combined = B64_ENGINE
            .decode(encoded.as_bytes())
            .map_err(|_| AiError::DecryptionFailure)?;
        if combined.len() < NONCE_LEN {
            return Err(AiError::DecryptionFailure);
        }
        let (nonce, sealed) = combined.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| AiError::DecryptionFailure)?;
        String::from_utf8(plaintext).map_err(|_| AiError::DecryptionFailure)
    }
}
