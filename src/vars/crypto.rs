//! Secret encryption at rest.
//!
//! AES-256-GCM with a random 96-bit nonce per value; the stored form is
//! base64(nonce || ciphertext). Reading tolerates values that are not in
//! that form: rows written as plaintext (or with a different key) come back
//! unchanged instead of failing the dispatch.

use crate::error::{DispatchError, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use std::path::Path;

/// AES-256-GCM nonce size in bytes.
pub const NONCE_SIZE: usize = 12;

/// AES-256 key size in bytes.
pub const KEY_SIZE: usize = 32;

/// Environment variable consulted when no key file is configured.
pub const KEY_ENV_VAR: &str = "DESPACHO_SECRET_KEY";

/// Symmetric cipher for secret values.
pub struct SecretBox {
    key: [u8; KEY_SIZE],
}

impl std::fmt::Debug for SecretBox {
    // Manual impl so the key material never appears in debug output.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretBox").finish_non_exhaustive()
    }
}

impl SecretBox {
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        SecretBox { key }
    }

    /// Random key, mainly for tests and key generation.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        SecretBox { key }
    }

    /// Load the key from a file holding either raw 32 bytes or their hex
    /// form (trailing newline tolerated).
    pub fn from_key_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read(path).map_err(|e| {
            DispatchError::Crypto(format!("cannot read key file {}: {}", path.display(), e))
        })?;

        if contents.len() == KEY_SIZE {
            let mut key = [0u8; KEY_SIZE];
            key.copy_from_slice(&contents);
            return Ok(SecretBox { key });
        }

        let text = std::str::from_utf8(&contents)
            .map_err(|_| DispatchError::Crypto("key file is not raw bytes or hex".to_string()))?;
        Self::from_hex(text.trim())
    }

    /// Load a hex-encoded key from an environment variable.
    pub fn from_env(var: &str) -> Result<Self> {
        let value = std::env::var(var)
            .map_err(|_| DispatchError::Crypto(format!("{} is not set", var)))?;
        Self::from_hex(value.trim())
    }

    /// Resolve the key: explicit file if configured, otherwise the
    /// `DESPACHO_SECRET_KEY` environment variable.
    pub fn load(key_file: Option<&Path>) -> Result<Self> {
        match key_file {
            Some(path) => Self::from_key_file(path),
            None => Self::from_env(KEY_ENV_VAR),
        }
    }

    fn from_hex(hex_key: &str) -> Result<Self> {
        let decoded = hex::decode(hex_key)
            .map_err(|e| DispatchError::Crypto(format!("invalid hex key: {}", e)))?;
        if decoded.len() != KEY_SIZE {
            return Err(DispatchError::Crypto(format!(
                "key must be {} bytes, got {}",
                KEY_SIZE,
                decoded.len()
            )));
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&decoded);
        Ok(SecretBox { key })
    }

    /// Encrypt a value for storage.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| DispatchError::Crypto(format!("cannot create cipher: {}", e)))?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|e| DispatchError::Crypto(format!("encryption failed: {}", e)))?;

        let mut stored = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        stored.extend_from_slice(&nonce_bytes);
        stored.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(stored))
    }

    /// Decrypt a stored value, or hand it back unchanged when it is not a
    /// ciphertext of ours ("already plaintext" tolerance).
    pub fn reveal(&self, stored: &str) -> String {
        self.try_decrypt(stored)
            .unwrap_or_else(|| stored.to_string())
    }

    /// Whether a stored value decrypts under this key. Used to avoid
    /// re-encrypting an already-encrypted value on update.
    pub fn is_encrypted(&self, stored: &str) -> bool {
        self.try_decrypt(stored).is_some()
    }

    fn try_decrypt(&self, stored: &str) -> Option<String> {
        let raw = BASE64.decode(stored.trim()).ok()?;
        if raw.len() <= NONCE_SIZE {
            return None;
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_SIZE);
        let cipher = Aes256Gcm::new_from_slice(&self.key).ok()?;
        let plaintext = cipher.decrypt(Nonce::from_slice(nonce), ciphertext).ok()?;
        String::from_utf8(plaintext).ok()
    }
}

/// Generate a fresh key in the hex form the key file and env var accept.
pub fn generate_key_hex() -> String {
    let mut key = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    hex::encode(key)
}
