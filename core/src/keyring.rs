// ABOUTME: At-rest protection for custodied key material
// ABOUTME: PBKDF2-wrapped AES-256-GCM envelopes plus constant-time comparison helpers

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// PBKDF2-HMAC-SHA256 rounds for the wrap key. Matches config files
/// produced by the WebCrypto-based tooling, so do not change without a
/// config migration.
pub const PBKDF2_ROUNDS: u32 = 600_000;

/// Salt length in bytes, stored hex-encoded in the config document.
pub const SALT_LEN: usize = 16;

const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum KeyringError {
    #[error("Invalid passphrase")]
    InvalidPassphrase,

    #[error("Invalid key encoding: {0}")]
    InvalidEncoding(String),

    #[error("Encryption failed: {0}")]
    Crypto(String),
}

/// A 32-byte secret that is zeroized when dropped. The only carrier of
/// raw key material outside `nostr_sdk::Keys`.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretBuf([u8; 32]);

impl std::fmt::Debug for SecretBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SecretBuf").field(&"<redacted>").finish()
    }
}

impl SecretBuf {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, KeyringError> {
        if slice.len() != 32 {
            return Err(KeyringError::InvalidEncoding(format!(
                "expected 32 bytes, got {}",
                slice.len()
            )));
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl AsRef<[u8]> for SecretBuf {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// An encrypted key as it appears in the config document: hex IV plus
/// hex ciphertext with the GCM tag appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptedKey {
    pub iv: String,
    pub data: String,
}

/// Generate a random PBKDF2 salt.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

/// Derive the 32-byte AES wrap key from a passphrase.
pub fn derive_wrap_key(passphrase: &str, salt: &[u8]) -> SecretBuf {
    let mut out = [0u8; 32];
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PBKDF2_ROUNDS, &mut out);
    SecretBuf::new(out)
}

/// Wrap a secret under a passphrase-derived key.
pub fn wrap(passphrase: &str, salt: &[u8], secret: &SecretBuf) -> Result<EncryptedKey, KeyringError> {
    let wrap_key = derive_wrap_key(passphrase, salt);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(wrap_key.as_bytes()));

    let mut iv = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut iv);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), secret.as_ref())
        .map_err(|e| KeyringError::Crypto(e.to_string()))?;

    Ok(EncryptedKey {
        iv: hex::encode(iv),
        data: hex::encode(ciphertext),
    })
}

/// Unwrap a secret. Fails with `InvalidPassphrase` when the GCM tag
/// does not verify, which covers both a wrong passphrase and tampered
/// ciphertext.
pub fn unwrap(passphrase: &str, salt: &[u8], enc: &EncryptedKey) -> Result<SecretBuf, KeyringError> {
    let iv = hex::decode(&enc.iv).map_err(|e| KeyringError::InvalidEncoding(e.to_string()))?;
    if iv.len() != NONCE_LEN {
        return Err(KeyringError::InvalidEncoding(format!(
            "expected {}-byte IV, got {}",
            NONCE_LEN,
            iv.len()
        )));
    }
    let ciphertext =
        hex::decode(&enc.data).map_err(|e| KeyringError::InvalidEncoding(e.to_string()))?;

    let wrap_key = derive_wrap_key(passphrase, salt);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(wrap_key.as_bytes()));

    let plaintext = cipher
        .decrypt(Nonce::from_slice(&iv), ciphertext.as_ref())
        .map_err(|_| KeyringError::InvalidPassphrase)?;

    SecretBuf::from_slice(&plaintext)
}

/// Constant-time byte comparison. Used for admin-secret and CSRF token
/// validation; the length check short-circuits but leaks only length.
pub fn timing_safe_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_unwrap_round_trip() {
        let salt = generate_salt();
        let secret = SecretBuf::new([7u8; 32]);

        let wrapped = wrap("hunter2", &salt, &secret).unwrap();
        let unwrapped = unwrap("hunter2", &salt, &wrapped).unwrap();

        assert_eq!(unwrapped.as_bytes(), secret.as_bytes());
    }

    #[test]
    fn test_wrong_passphrase_is_invalid() {
        let salt = generate_salt();
        let secret = SecretBuf::new([7u8; 32]);

        let wrapped = wrap("hunter2", &salt, &secret).unwrap();
        let err = unwrap("hunter3", &salt, &wrapped).unwrap_err();

        assert!(matches!(err, KeyringError::InvalidPassphrase));
    }

    #[test]
    fn test_tampered_ciphertext_is_invalid() {
        let salt = generate_salt();
        let secret = SecretBuf::new([7u8; 32]);

        let mut wrapped = wrap("hunter2", &salt, &secret).unwrap();
        let mut raw = hex::decode(&wrapped.data).unwrap();
        raw[0] ^= 0xff;
        wrapped.data = hex::encode(raw);

        let err = unwrap("hunter2", &salt, &wrapped).unwrap_err();
        assert!(matches!(err, KeyringError::InvalidPassphrase));
    }

    #[test]
    fn test_timing_safe_eq() {
        assert!(timing_safe_eq(b"secret", b"secret"));
        assert!(!timing_safe_eq(b"secret", b"secreT"));
        assert!(!timing_safe_eq(b"secret", b"secret0"));
        assert!(timing_safe_eq(b"", b""));
    }
}
