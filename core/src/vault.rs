//! Credential Vault
//!
//! Encrypts session credentials at rest with AES-256-GCM, keyed by an
//! Argon2id-derived key so the passphrase never touches disk. The wire
//! format is `base64(salt):base64(nonce):base64(ciphertext)`. There is no
//! separate tag field: AES-GCM appends the 16-byte authentication tag to
//! the ciphertext it returns, so the third field carries both.

use aes_gcm::aead::{Aead, KeyInit, OsRng as AeadOsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::password_hash::rand_core::RngCore;
use argon2::Argon2;
use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::error::{EngineError, Result};

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// A credential blob encrypted under a passphrase-derived key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialBlob(String);

impl CredentialBlob {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CredentialBlob {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Encrypts and decrypts credential material for a single account.
pub struct CredentialVault {
    passphrase: String,
}

impl CredentialVault {
    pub fn new(passphrase: impl Into<String>) -> Self {
        Self { passphrase: passphrase.into() }
    }

    /// Encrypt `plaintext`, returning a self-contained blob.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<CredentialBlob> {
        let mut salt = [0u8; SALT_LEN];
        AeadOsRng.fill_bytes(&mut salt);

        let key_bytes = self.derive_key(&salt)?;
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        let cipher = Aes256Gcm::new(key);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        AeadOsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| EngineError::Integrity { message: "encryption failed".into() })?;

        let blob = format!(
            "{}:{}:{}",
            STANDARD.encode(salt),
            STANDARD.encode(nonce_bytes),
            STANDARD.encode(ciphertext)
        );
        Ok(CredentialBlob(blob))
    }

    /// Decrypt a blob produced by [`encrypt`](Self::encrypt). Any
    /// tampering with salt, nonce, or ciphertext surfaces as
    /// [`EngineError::Integrity`].
    pub fn decrypt(&self, blob: &CredentialBlob) -> Result<Vec<u8>> {
        let mut parts = blob.0.splitn(3, ':');
        let (salt_b64, nonce_b64, ct_b64) = match (parts.next(), parts.next(), parts.next()) {
            (Some(s), Some(n), Some(c)) => (s, n, c),
            _ => {
                return Err(EngineError::Integrity { message: "malformed credential blob".into() })
            }
        };

        let salt = STANDARD
            .decode(salt_b64)
            .map_err(|_| EngineError::Integrity { message: "invalid salt encoding".into() })?;
        let nonce_bytes = STANDARD
            .decode(nonce_b64)
            .map_err(|_| EngineError::Integrity { message: "invalid nonce encoding".into() })?;
        let ciphertext = STANDARD
            .decode(ct_b64)
            .map_err(|_| EngineError::Integrity { message: "invalid ciphertext encoding".into() })?;

        if salt.len() != SALT_LEN || nonce_bytes.len() != NONCE_LEN {
            return Err(EngineError::Integrity { message: "unexpected salt/nonce length".into() });
        }

        let key_bytes = self.derive_key(&salt)?;
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        let cipher = Aes256Gcm::new(key);
        let nonce = Nonce::from_slice(&nonce_bytes);

        cipher
            .decrypt(nonce, ciphertext.as_ref())
            .map_err(|_| EngineError::Integrity { message: "decryption failed".into() })
    }

    fn derive_key(&self, salt: &[u8]) -> Result<[u8; KEY_LEN]> {
        let mut out = [0u8; KEY_LEN];
        Argon2::default()
            .hash_password_into(self.passphrase.as_bytes(), salt, &mut out)
            .map_err(|e| EngineError::Integrity { message: format!("key derivation failed: {e}") })?;
        Ok(out)
    }
}
