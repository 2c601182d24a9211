//! Credential vault: symmetric encryption of credential blobs at rest.
//!
//! Blobs written before encryption was introduced are plain JSON. They are read
//! back unchanged and are never re-encrypted implicitly; the next write of the
//! record (for example after a token refresh) stores them encrypted.

mod encryption;

use secrecy::{ExposeSecret, SecretString};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use crate::error::{config_error, vault_error, Error, VaultErrorKind};

pub use encryption::{generate_key_hex, IV_SIZE, TAG_SIZE};

/// Encrypts and decrypts credential blobs with the process-wide key.
///
/// The key is validated on every call rather than at construction, so a
/// missing or malformed key surfaces as `ErrorKind::Config` at first use.
#[derive(Clone)]
pub struct Vault {
    key_hex: Option<SecretString>,
}

impl Vault {
    pub fn new(key_hex: Option<SecretString>) -> Self {
        Self { key_hex }
    }

    fn key(&self) -> Result<[u8; 32], Error> {
        let key_hex = self
            .key_hex
            .as_ref()
            .ok_or_else(|| config_error("No credentials encryption key configured"))?;
        encryption::parse_key(key_hex.expose_secret())
    }

    /// Encrypts `plaintext` and returns `base64(IV || tag || ciphertext)`.
    ///
    /// Every call draws a fresh IV, so equal inputs give different blobs.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, Error> {
        let key = self.key()?;
        encryption::seal(plaintext, &key)
    }

    /// Decrypts a blob produced by [`Vault::encrypt`].
    ///
    /// Text starting with `{` or `[` is legacy plaintext and is returned as is.
    /// A blob that fails authentication is given one more chance as raw JSON;
    /// anything else is `VaultErrorKind::Unrecoverable`.
    pub fn decrypt(&self, blob: &str) -> Result<Vec<u8>, Error> {
        let key = self.key()?;

        if is_legacy_plaintext(blob) {
            debug!("Reading legacy plaintext credential blob");
            return Ok(blob.as_bytes().to_vec());
        }

        match encryption::open(blob, &key) {
            Ok(plaintext) => Ok(plaintext),
            Err(failure) => {
                if serde_json::from_str::<serde_json::Value>(blob).is_ok() {
                    debug!("Credential blob is JSON despite failing to decrypt, passing through");
                    return Ok(blob.as_bytes().to_vec());
                }
                warn!(
                    "Credential blob cannot be decrypted ({:?}); connection must be re-established",
                    failure
                );
                Err(vault_error(
                    VaultErrorKind::Unrecoverable,
                    "stored credentials cannot be decrypted with the configured key",
                ))
            }
        }
    }

    /// Serializes `credentials` to JSON and encrypts it.
    pub fn encrypt_credentials<T: Serialize>(&self, credentials: &T) -> Result<String, Error> {
        let json = serde_json::to_vec(credentials).map_err(|e| Error {
            source: Some(Box::new(e)),
            error_kind: crate::error::ErrorKind::Vault(VaultErrorKind::Serialization),
        })?;
        self.encrypt(&json)
    }

    /// Decrypts a blob and parses it as `T`.
    ///
    /// A blob that decrypts but does not have the expected shape is as useless
    /// as one that does not decrypt, so it is reported as unrecoverable too.
    pub fn decrypt_credentials<T: DeserializeOwned>(&self, blob: &str) -> Result<T, Error> {
        let plaintext = self.decrypt(blob)?;
        serde_json::from_slice(&plaintext).map_err(|e| {
            warn!("Decrypted credentials have an unexpected shape: {}", e);
            Error {
                source: Some(Box::new(e)),
                error_kind: crate::error::ErrorKind::Vault(VaultErrorKind::Unrecoverable),
            }
        })
    }
}

/// Returns true for blobs stored before encryption was introduced.
pub fn is_legacy_plaintext(blob: &str) -> bool {
    blob.starts_with('{') || blob.starts_with('[')
}
