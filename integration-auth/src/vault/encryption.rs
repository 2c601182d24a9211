//! AES-256-GCM primitives for credential blobs stored at rest.
//!
//! Blob layout before base64 encoding is `IV (12) || tag (16) || ciphertext`.
//! The key is a 32-byte key provided as a hex-encoded string (64 characters).

use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes256Gcm, Nonce, Tag,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::Rng;

use crate::error::{config_error, vault_error, Error, VaultErrorKind};

/// 12-byte nonce size for AES-GCM
pub const IV_SIZE: usize = 12;

/// 16-byte authentication tag appended by AES-GCM
pub const TAG_SIZE: usize = 16;

const KEY_SIZE: usize = 32;

/// Reasons an encrypted blob could not be opened.
///
/// All of them end in the same place for callers; the distinction only matters
/// for logging.
#[derive(Debug, PartialEq)]
pub(crate) enum OpenFailure {
    NotBase64,
    TooShort,
    Authentication,
}

/// Encrypts `plaintext` with a random IV and returns `base64(IV || tag || ciphertext)`.
pub fn seal(plaintext: &[u8], key: &[u8; KEY_SIZE]) -> Result<String, Error> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| vault_error(VaultErrorKind::EncryptionFailed, "invalid key length"))?;

    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill(&mut iv);

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&iv), b"", &mut buffer)
        .map_err(|_| vault_error(VaultErrorKind::EncryptionFailed, "AES-GCM encryption failed"))?;

    let mut combined = Vec::with_capacity(IV_SIZE + TAG_SIZE + buffer.len());
    combined.extend_from_slice(&iv);
    combined.extend_from_slice(tag.as_slice());
    combined.extend(buffer);

    Ok(BASE64.encode(combined))
}

/// Reverses [`seal`]. Returns why the blob could not be opened instead of an
/// `Error` so the vault can decide on the legacy fallback.
pub(crate) fn open(blob: &str, key: &[u8; KEY_SIZE]) -> Result<Vec<u8>, OpenFailure> {
    let combined = BASE64
        .decode(blob.trim())
        .map_err(|_| OpenFailure::NotBase64)?;

    if combined.len() < IV_SIZE + TAG_SIZE {
        return Err(OpenFailure::TooShort);
    }

    let (iv, rest) = combined.split_at(IV_SIZE);
    let (tag, ciphertext) = rest.split_at(TAG_SIZE);

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| OpenFailure::Authentication)?;
    let mut buffer = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(Nonce::from_slice(iv), b"", &mut buffer, Tag::from_slice(tag))
        .map_err(|_| OpenFailure::Authentication)?;

    Ok(buffer)
}

/// Parses a hex-encoded 32-byte key.
pub fn parse_key(key_hex: &str) -> Result<[u8; KEY_SIZE], Error> {
    let bytes = hex::decode(key_hex.trim()).map_err(|e| Error {
        source: Some(Box::new(e)),
        error_kind: crate::error::ErrorKind::Config,
    })?;
    if bytes.len() != KEY_SIZE {
        return Err(config_error(&format!(
            "encryption key must be {} bytes ({} hex characters), got {} bytes",
            KEY_SIZE,
            KEY_SIZE * 2,
            bytes.len()
        )));
    }
    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Generates a new random key, hex-encoded.
pub fn generate_key_hex() -> String {
    let mut key = [0u8; KEY_SIZE];
    rand::thread_rng().fill(&mut key);
    hex::encode(key)
}
