// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! ChaCha20-Poly1305 encryption for backup snapshots.
//!
//! Every blob gets a fresh random 96-bit nonce, prepended to the ciphertext.
//! The key is configured as 64 hex characters (256 bits).

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;

/// ChaCha20-Poly1305 key size (256 bits).
pub const KEY_SIZE: usize = 32;
/// Nonce size (96 bits).
pub const NONCE_SIZE: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("ciphertext too short ({0} bytes)")]
    TooShort(usize),
    #[error("encryption failed")]
    EncryptFailed,
    #[error("decryption failed (wrong key or tampered data)")]
    DecryptFailed,
}

/// Symmetric cipher for backup blobs.
#[derive(Clone)]
pub struct BackupCipher {
    cipher: ChaCha20Poly1305,
}

impl BackupCipher {
    pub fn from_key(key: &[u8; KEY_SIZE]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Parse a 64-character hex key.
    pub fn from_hex(hex_key: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(hex_key.trim()).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let key: [u8; KEY_SIZE] = bytes.as_slice().try_into().map_err(|_| {
            CryptoError::InvalidKey(format!("expected {} bytes, got {}", KEY_SIZE, bytes.len()))
        })?;
        Ok(Self::from_key(&key))
    }

    /// Random key, hex encoded, suitable for configuration.
    #[must_use]
    pub fn generate_hex_key() -> String {
        let mut key = [0u8; KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut key);
        hex::encode(key)
    }

    /// Encrypt, returning `nonce || ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::EncryptFailed)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.len() < NONCE_SIZE {
            return Err(CryptoError::TooShort(data.len()));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptFailed)
    }
}

impl std::fmt::Debug for BackupCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupCipher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let cipher = BackupCipher::from_hex(&BackupCipher::generate_hex_key()).unwrap();
        let sealed = cipher.encrypt(b"snapshot").unwrap();

        assert_ne!(&sealed[NONCE_SIZE..], b"snapshot");
        assert_eq!(cipher.decrypt(&sealed).unwrap(), b"snapshot");
    }

    #[test]
    fn test_nonce_differs_per_call() {
        let cipher = BackupCipher::from_key(&[7u8; KEY_SIZE]);
        let a = cipher.encrypt(b"same").unwrap();
        let b = cipher.encrypt(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = BackupCipher::from_key(&[1u8; KEY_SIZE]).encrypt(b"secret").unwrap();
        let other = BackupCipher::from_key(&[2u8; KEY_SIZE]);
        assert!(matches!(other.decrypt(&sealed), Err(CryptoError::DecryptFailed)));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let cipher = BackupCipher::from_key(&[3u8; KEY_SIZE]);
        let mut sealed = cipher.encrypt(b"secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert!(cipher.decrypt(&sealed).is_err());
    }

    #[test]
    fn test_bad_keys_rejected() {
        assert!(BackupCipher::from_hex("not-hex").is_err());
        assert!(BackupCipher::from_hex("abcd").is_err());
        assert!(matches!(
            BackupCipher::from_key(&[0u8; KEY_SIZE]).decrypt(b"short"),
            Err(CryptoError::TooShort(5))
        ));
    }
}
