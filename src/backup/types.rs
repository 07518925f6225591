//! Public types for the backup manager.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::compression::CompressionError;
use crate::crypto::CryptoError;
use crate::storage::traits::StorageError;
use crate::storage_item::StorageItem;

/// Envelope format version written into exported backup files.
pub const BACKUP_FILE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    /// Scheduled; the only kind subject to retention pruning
    Automatic,
    Manual,
    /// Taken at the moment a failure is detected
    Emergency,
}

impl std::fmt::Display for BackupType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Automatic => write!(f, "automatic"),
            Self::Manual => write!(f, "manual"),
            Self::Emergency => write!(f, "emergency"),
        }
    }
}

/// Backup status. Monotonic: `in_progress → completed | failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    InProgress,
    Completed,
    Failed,
}

impl BackupStatus {
    #[must_use]
    pub fn can_transition_to(&self, next: BackupStatus) -> bool {
        matches!(
            (self, next),
            (Self::InProgress, Self::Completed) | (Self::InProgress, Self::Failed)
        )
    }
}

impl std::fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Where snapshot blobs are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackupDestination {
    #[default]
    LocalCache,
    Authoritative,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub backup_type: BackupType,
    pub collections: Vec<String>,
    pub created_at: i64,
    /// Size of the stored blob in bytes
    pub size: u64,
    /// SHA-256 (hex) over the stored blob, after compression and encryption
    pub checksum: String,
    pub compressed: bool,
    pub encrypted: bool,
    pub status: BackupStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Items captured across all collections
    #[serde(default)]
    pub item_count: u64,
    /// Tier holding the blob
    #[serde(default)]
    pub destination: BackupDestination,
}

impl BackupMetadata {
    pub fn in_progress(
        id: String,
        name: String,
        description: Option<String>,
        backup_type: BackupType,
        collections: Vec<String>,
    ) -> Self {
        Self {
            id,
            name,
            description,
            backup_type,
            collections,
            created_at: crate::storage_item::now_millis(),
            size: 0,
            checksum: String::new(),
            compressed: false,
            encrypted: false,
            status: BackupStatus::InProgress,
            error: None,
            item_count: 0,
            destination: BackupDestination::default(),
        }
    }

    pub fn mark_completed(&mut self, size: u64, checksum: String) -> Result<(), BackupError> {
        self.transition(BackupStatus::Completed)?;
        self.size = size;
        self.checksum = checksum;
        Ok(())
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) -> Result<(), BackupError> {
        self.transition(BackupStatus::Failed)?;
        self.error = Some(error.into());
        Ok(())
    }

    fn transition(&mut self, next: BackupStatus) -> Result<(), BackupError> {
        if !self.status.can_transition_to(next) {
            return Err(BackupError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Whether this backup captured every collection in `wanted`.
    #[must_use]
    pub fn covers(&self, wanted: &[String]) -> bool {
        wanted.iter().all(|c| self.collections.contains(c))
    }
}

/// Metadata plus the encoded snapshot bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub metadata: BackupMetadata,
    #[serde(with = "blob_base64")]
    pub blob: Vec<u8>,
}

/// Decoded snapshot content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupPayload {
    pub created_at: i64,
    pub collections: BTreeMap<String, Vec<StorageItem>>,
}

/// Backup file envelope for download/upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupFile {
    pub metadata: BackupMetadata,
    /// The still-encoded blob
    #[serde(with = "blob_base64")]
    pub data: Vec<u8>,
    pub exported_at: i64,
    pub version: u32,
}

#[derive(Debug, Clone)]
pub struct BackupRequest {
    /// Generated when `None`
    pub id: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub backup_type: BackupType,
    pub collections: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Restrict the restore to these collections (all when `None`)
    pub collections: Option<Vec<String>>,
    /// Replace items that already exist locally
    pub overwrite: bool,
    /// Verify checksum and collection shape before writing anything
    pub validate_data: bool,
    /// Stop after validation and report counts
    pub dry_run: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            collections: None,
            overwrite: false,
            validate_data: true,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionRestore {
    pub total: usize,
    pub restored: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub backup_id: String,
    pub dry_run: bool,
    pub collections: BTreeMap<String, CollectionRestore>,
}

impl RestoreReport {
    #[must_use]
    pub fn restored(&self) -> usize {
        self.collections.values().map(|c| c.restored).sum()
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.collections.values().map(|c| c.total).sum()
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.collections.values().map(|c| c.failed).sum()
    }
}

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("backup '{0}' not found")]
    NotFound(String),
    #[error("backup '{id}' is {status}, only completed backups can be restored")]
    NotRestorable { id: String, status: BackupStatus },
    #[error("corrupted backup '{id}': {reason}")]
    Corrupted { id: String, reason: String },
    #[error("invalid backup format: {0}")]
    InvalidFormat(String),
    #[error("backup '{id}' cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: BackupStatus,
        to: BackupStatus,
    },
    #[error("encryption error: {0}")]
    Encryption(#[from] CryptoError),
    #[error("compression error: {0}")]
    Compression(#[from] CompressionError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for BackupError {
    fn from(err: serde_json::Error) -> Self {
        BackupError::InvalidFormat(err.to_string())
    }
}

mod blob_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> BackupMetadata {
        BackupMetadata::in_progress(
            "b1".into(),
            "nightly".into(),
            None,
            BackupType::Automatic,
            vec!["orders".into()],
        )
    }

    #[test]
    fn test_status_is_monotonic() {
        let mut m = meta();
        m.mark_completed(10, "abc".into()).unwrap();
        assert_eq!(m.status, BackupStatus::Completed);

        assert!(m.mark_failed("late failure").is_err());
        assert_eq!(m.status, BackupStatus::Completed);
        assert!(m.error.is_none());
    }

    #[test]
    fn test_failed_records_error() {
        let mut m = meta();
        m.mark_failed("disk full").unwrap();
        assert_eq!(m.status, BackupStatus::Failed);
        assert_eq!(m.error.as_deref(), Some("disk full"));
        assert!(m.mark_completed(1, "x".into()).is_err());
    }

    #[test]
    fn test_metadata_wire_format() {
        let json = serde_json::to_value(meta()).unwrap();
        assert_eq!(json["type"], "automatic");
        assert_eq!(json["status"], "in_progress");
        assert!(json.get("description").is_none());
    }

    #[test]
    fn test_record_blob_is_base64() {
        let record = BackupRecord { metadata: meta(), blob: vec![0, 1, 2, 255] };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["blob"], "AAEC/w==");

        let back: BackupRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back.blob, vec![0, 1, 2, 255]);
    }

    #[test]
    fn test_covers() {
        let m = meta();
        assert!(m.covers(&["orders".to_string()]));
        assert!(!m.covers(&["orders".to_string(), "users".to_string()]));
        assert!(m.covers(&[]));
    }
}
