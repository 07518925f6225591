//! Snapshot blob codec: JSON → zstd (optional) → ChaCha20-Poly1305 (optional).
//!
//! The checksum is taken over the final stored bytes, so a restore can
//! reject a tampered blob before decrypting anything.

use sha2::{Digest, Sha256};
use tracing::warn;

use super::types::{BackupError, BackupPayload};
use crate::compression::{compress_bytes, decompress_bytes, CompressionError};
use crate::crypto::{BackupCipher, CryptoError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBlob {
    pub bytes: Vec<u8>,
    pub compressed: bool,
    pub encrypted: bool,
    /// Serialized size before compression and encryption
    pub raw_size: usize,
}

/// SHA-256 (hex) of stored blob bytes.
#[must_use]
pub fn blob_checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn missing_key() -> BackupError {
    BackupError::Encryption(CryptoError::InvalidKey("encryption requested but no key is configured".into()))
}

pub fn encode(
    payload: &BackupPayload,
    compress: bool,
    encrypt: bool,
    cipher: Option<&BackupCipher>,
) -> Result<EncodedBlob, BackupError> {
    let raw = serde_json::to_vec(payload)?;
    let raw_size = raw.len();

    let (bytes, compressed) = if compress {
        match compress_bytes(&raw) {
            Ok(packed) => (packed, true),
            Err(CompressionError::Unsupported) => {
                warn!("Compression unavailable in this build, storing backup uncompressed");
                (raw, false)
            }
            Err(e) => return Err(e.into()),
        }
    } else {
        (raw, false)
    };

    let (bytes, encrypted) = if encrypt {
        let cipher = cipher.ok_or_else(missing_key)?;
        (cipher.encrypt(&bytes)?, true)
    } else {
        (bytes, false)
    };

    Ok(EncodedBlob { bytes, compressed, encrypted, raw_size })
}

pub fn decode(
    bytes: &[u8],
    compressed: bool,
    encrypted: bool,
    cipher: Option<&BackupCipher>,
) -> Result<BackupPayload, BackupError> {
    let plain = if encrypted {
        cipher.ok_or_else(missing_key)?.decrypt(bytes)?
    } else {
        bytes.to_vec()
    };
    let raw = if compressed { decompress_bytes(&plain)? } else { plain };
    Ok(serde_json::from_slice(&raw)?)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;
    use crate::storage_item::StorageItem;

    fn payload() -> BackupPayload {
        let mut collections = BTreeMap::new();
        collections.insert(
            "orders".to_string(),
            (0..20).map(|i| StorageItem::new("orders", format!("o{}", i), json!({"total": i}))).collect(),
        );
        BackupPayload { created_at: 1, collections }
    }

    #[test]
    fn test_plain_round_trip() {
        let blob = encode(&payload(), false, false, None).unwrap();
        assert!(!blob.compressed && !blob.encrypted);
        assert_eq!(decode(&blob.bytes, false, false, None).unwrap(), payload());
    }

    #[cfg(feature = "compression")]
    #[test]
    fn test_compressed_and_encrypted() {
        let cipher = BackupCipher::from_hex(&BackupCipher::generate_hex_key()).unwrap();
        let blob = encode(&payload(), true, true, Some(&cipher)).unwrap();
        assert!(blob.compressed && blob.encrypted);

        let back = decode(&blob.bytes, blob.compressed, blob.encrypted, Some(&cipher)).unwrap();
        assert_eq!(back, payload());

        let other = BackupCipher::from_hex(&BackupCipher::generate_hex_key()).unwrap();
        assert!(matches!(
            decode(&blob.bytes, true, true, Some(&other)),
            Err(BackupError::Encryption(_))
        ));
    }

    #[test]
    fn test_encrypt_without_key_fails() {
        assert!(matches!(encode(&payload(), false, true, None), Err(BackupError::Encryption(_))));
    }

    #[test]
    fn test_checksum_covers_stored_bytes() {
        let blob = encode(&payload(), false, false, None).unwrap();
        let mut tampered = blob.bytes.clone();
        tampered[0] ^= 0xff;
        assert_ne!(blob_checksum(&blob.bytes), blob_checksum(&tampered));
    }
}
