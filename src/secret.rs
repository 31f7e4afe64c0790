//! Credential container handling.
//!
//! Account secrets are stored as `ENC:v1:<base64>` containers where the
//! payload is a JSON document carrying the AES-256-GCM nonce and ciphertext.
//! Values without the prefix are treated as plaintext and passed through,
//! which keeps local development against test servers friction-free.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    AeadCore, Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const CONTAINER_PREFIX: &str = "ENC:v1:";

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("Invalid encryption key: {0}")]
    InvalidKey(String),

    #[error("Malformed secret container: {0}")]
    Malformed(String),

    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Encryption failed")]
    EncryptionFailed,
}

#[derive(Serialize, Deserialize)]
struct Container {
    nonce: String,
    ciphertext: String,
}

/// Wraps the symmetric key; constructed once from configuration and injected
/// where account credentials are read.
#[derive(Clone)]
pub struct SecretBox {
    key: Key<Aes256Gcm>,
}

impl SecretBox {
    /// Build from a 64-char hex key (32 bytes).
    pub fn from_hex_key(hex_key: &str) -> Result<Self, SecretError> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| SecretError::InvalidKey(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(SecretError::InvalidKey(format!(
                "expected 32 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self {
            key: *Key::<Aes256Gcm>::from_slice(&bytes),
        })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, SecretError> {
        let cipher = Aes256Gcm::new(&self.key);
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| SecretError::EncryptionFailed)?;

        let container = Container {
            nonce: BASE64.encode(nonce),
            ciphertext: BASE64.encode(ciphertext),
        };
        let json =
            serde_json::to_string(&container).map_err(|_| SecretError::EncryptionFailed)?;
        Ok(format!("{}{}", CONTAINER_PREFIX, BASE64.encode(json)))
    }

    /// Resolve a stored secret: decrypt `ENC:v1:` containers, pass anything
    /// else through unchanged.
    pub fn reveal(&self, stored: &str) -> Result<String, SecretError> {
        let Some(payload) = stored.strip_prefix(CONTAINER_PREFIX) else {
            return Ok(stored.to_string());
        };

        let json = BASE64
            .decode(payload)
            .map_err(|e| SecretError::Malformed(e.to_string()))?;
        let container: Container = serde_json::from_slice(&json)
            .map_err(|e| SecretError::Malformed(e.to_string()))?;

        let nonce_bytes = BASE64
            .decode(&container.nonce)
            .map_err(|e| SecretError::Malformed(e.to_string()))?;
        let ciphertext = BASE64
            .decode(&container.ciphertext)
            .map_err(|e| SecretError::Malformed(e.to_string()))?;
        if nonce_bytes.len() != 12 {
            return Err(SecretError::Malformed("bad nonce length".to_string()));
        }

        let cipher = Aes256Gcm::new(&self.key);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| SecretError::DecryptionFailed)?;
        String::from_utf8(plaintext).map_err(|_| SecretError::DecryptionFailed)
    }
}

impl std::fmt::Debug for SecretBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretBox").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: &str = "0101010101010101010101010101010101010101010101010101010101010101";

    #[test]
    fn test_round_trip() {
        let sb = SecretBox::from_hex_key(TEST_KEY).unwrap();
        let stored = sb.encrypt("app-password-123").unwrap();
        assert!(stored.starts_with("ENC:v1:"));
        assert_eq!(sb.reveal(&stored).unwrap(), "app-password-123");
    }

    #[test]
    fn test_plaintext_passthrough() {
        let sb = SecretBox::from_hex_key(TEST_KEY).unwrap();
        assert_eq!(sb.reveal("plain-password").unwrap(), "plain-password");
    }

    #[test]
    fn test_rejects_short_key() {
        assert!(SecretBox::from_hex_key("deadbeef").is_err());
    }

    #[test]
    fn test_rejects_garbage_container() {
        let sb = SecretBox::from_hex_key(TEST_KEY).unwrap();
        assert!(sb.reveal("ENC:v1:!!!not-base64!!!").is_err());
    }

    #[test]
    fn test_wrong_key_fails_closed() {
        let sb = SecretBox::from_hex_key(TEST_KEY).unwrap();
        let stored = sb.encrypt("secret").unwrap();
        let other = SecretBox::from_hex_key(
            "0202020202020202020202020202020202020202020202020202020202020202",
        )
        .unwrap();
        assert!(matches!(
            other.reveal(&stored),
            Err(SecretError::DecryptionFailed)
        ));
    }
}
