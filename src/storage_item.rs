// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage item data structure.
//!
//! The [`StorageItem`] is the atomic unit persisted across all three tiers.
//! Each item belongs to a collection, carries an opaque JSON payload and a
//! metadata block tracking its version, origin tier and sync status.
//!
//! # Example
//!
//! ```
//! use storage_resilience::{StorageItem, SyncStatus};
//! use serde_json::json;
//!
//! let item = StorageItem::new("orders", "o1", json!({"total": 100}));
//!
//! assert_eq!(item.metadata.version, 1);
//! assert_eq!(item.metadata.sync_status, SyncStatus::Pending);
//! assert!(item.checksum_matches());
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::storage::traits::StorageError;

/// Collections whose name starts with this prefix hold bookkeeping records
/// (sync queue, conflict log). They never leave the local cache.
pub const INTERNAL_COLLECTION_PREFIX: char = '_';

/// Current time in epoch millis.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Returns true for bookkeeping collections.
#[must_use]
pub fn is_internal_collection(name: &str) -> bool {
    name.starts_with(INTERNAL_COLLECTION_PREFIX)
}

/// Deterministic SHA-256 (hex) of a payload.
///
/// Object keys are hashed in sorted order, so two payloads that compare
/// equal always produce the same checksum regardless of how their maps
/// were built.
#[must_use]
pub fn checksum(data: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(data, &mut canonical);
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        leaf => out.push_str(&leaf.to_string()),
    }
}

/// Tier an item was last written to or read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TierSource {
    Authoritative,
    LocalCache,
    Fallback,
}

impl std::fmt::Display for TierSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Authoritative => write!(f, "authoritative"),
            Self::LocalCache => write!(f, "local-cache"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

/// Sync lifecycle of an item.
///
/// ```text
/// pending ──propagated──▶ synced
///    │                      ▲
///    └──divergent remote──▶ conflict ──resolved──┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Synced,
    Pending,
    Conflict,
    /// Written while no authoritative tier was configured
    Offline,
}

impl SyncStatus {
    /// Whether the reconciliation sweep should pick this item up.
    #[must_use]
    pub fn needs_sync(&self) -> bool {
        matches!(self, Self::Pending | Self::Offline)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::Pending => "pending",
            Self::Conflict => "conflict",
            Self::Offline => "offline",
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SyncStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "synced" => Ok(Self::Synced),
            "pending" => Ok(Self::Pending),
            "conflict" => Ok(Self::Conflict),
            "offline" => Ok(Self::Offline),
            other => Err(StorageError::Invalid(format!("unknown sync status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemMetadata {
    /// Creation timestamp (epoch millis), preserved across revisions
    pub created_at: i64,
    /// Last update timestamp (epoch millis)
    pub updated_at: i64,
    /// Monotonically increasing within this item
    pub version: u64,
    pub source: TierSource,
    pub sync_status: SyncStatus,
    /// [`checksum`] of the payload
    pub checksum: String,
}

/// A wrapper struct that separates metadata from the application payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageItem {
    pub id: String,
    pub collection: String,
    pub data: Value,
    pub metadata: ItemMetadata,
}

impl StorageItem {
    /// Create a first-version item, pending propagation.
    pub fn new(collection: impl Into<String>, id: impl Into<String>, data: Value) -> Self {
        let now = now_millis();
        let checksum = checksum(&data);
        Self {
            id: id.into(),
            collection: collection.into(),
            data,
            metadata: ItemMetadata {
                created_at: now,
                updated_at: now,
                version: 1,
                source: TierSource::LocalCache,
                sync_status: SyncStatus::Pending,
                checksum,
            },
        }
    }

    /// Next revision of this item carrying `data`.
    ///
    /// Keeps `created_at`, bumps the version, stamps `updated_at` and resets
    /// the status to pending. `updated_at` never moves backwards.
    #[must_use]
    pub fn revise(&self, data: Value) -> Self {
        let now = now_millis().max(self.metadata.updated_at + 1);
        let checksum = checksum(&data);
        Self {
            id: self.id.clone(),
            collection: self.collection.clone(),
            data,
            metadata: ItemMetadata {
                created_at: self.metadata.created_at,
                updated_at: now,
                version: self.metadata.version + 1,
                source: TierSource::LocalCache,
                sync_status: SyncStatus::Pending,
                checksum,
            },
        }
    }

    /// Copy of this item with a new status and source.
    #[must_use]
    pub fn with_status(mut self, status: SyncStatus, source: TierSource) -> Self {
        self.metadata.sync_status = status;
        self.metadata.source = source;
        self
    }

    /// Key used by flat key-value tiers.
    #[must_use]
    pub fn key(&self) -> String {
        item_key(&self.collection, &self.id)
    }

    /// Whether the stored checksum still matches the payload.
    #[must_use]
    pub fn checksum_matches(&self) -> bool {
        self.metadata.checksum == checksum(&self.data)
    }

    /// Strictly later `updated_at` than `other`.
    #[must_use]
    pub fn is_newer_than(&self, other: &StorageItem) -> bool {
        self.metadata.updated_at > other.metadata.updated_at
    }

    /// Structural validity check used by integrity scans, restore and import.
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.id.is_empty() {
            return Err(StorageError::Invalid("item id is empty".into()));
        }
        if self.collection.is_empty() {
            return Err(StorageError::Invalid(format!("item '{}' has no collection", self.id)));
        }
        if self.metadata.created_at > self.metadata.updated_at {
            return Err(StorageError::Invalid(format!(
                "item '{}' created_at {} is after updated_at {}",
                self.id, self.metadata.created_at, self.metadata.updated_at
            )));
        }
        let actual = checksum(&self.data);
        if actual != self.metadata.checksum {
            return Err(StorageError::Corruption {
                id: self.key(),
                expected: self.metadata.checksum.clone(),
                actual,
            });
        }
        Ok(())
    }
}

/// Key for an item in flat key-value tiers.
#[must_use]
pub fn item_key(collection: &str, id: &str) -> String {
    format!("{}:{}", collection, id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_item_is_pending_first_version() {
        let item = StorageItem::new("orders", "o1", json!({"total": 100}));

        assert_eq!(item.id, "o1");
        assert_eq!(item.collection, "orders");
        assert_eq!(item.metadata.version, 1);
        assert_eq!(item.metadata.sync_status, SyncStatus::Pending);
        assert_eq!(item.metadata.source, TierSource::LocalCache);
        assert_eq!(item.metadata.created_at, item.metadata.updated_at);
        assert!(item.checksum_matches());
    }

    #[test]
    fn test_checksum_is_stable() {
        let data = json!({"a": 1, "b": [1, 2, {"c": "d"}]});
        assert_eq!(checksum(&data), checksum(&data));
        assert_eq!(checksum(&data).len(), 64);
    }

    #[test]
    fn test_checksum_ignores_key_order() {
        let mut left = serde_json::Map::new();
        left.insert("x".into(), json!(1));
        left.insert("y".into(), json!(2));
        let mut right = serde_json::Map::new();
        right.insert("y".into(), json!(2));
        right.insert("x".into(), json!(1));

        assert_eq!(checksum(&Value::Object(left)), checksum(&Value::Object(right)));
    }

    #[test]
    fn test_checksum_changes_with_data() {
        assert_ne!(checksum(&json!({"counter": 1})), checksum(&json!({"counter": 2})));
        assert_ne!(checksum(&json!("1")), checksum(&json!(1)));
    }

    #[test]
    fn test_revise_bumps_version_and_keeps_created_at() {
        let item = StorageItem::new("orders", "o1", json!({"total": 100}))
            .with_status(SyncStatus::Synced, TierSource::Authoritative);
        let next = item.revise(json!({"total": 150}));

        assert_eq!(next.metadata.version, 2);
        assert_eq!(next.metadata.created_at, item.metadata.created_at);
        assert!(next.metadata.updated_at > item.metadata.updated_at);
        assert_eq!(next.metadata.sync_status, SyncStatus::Pending);
        assert_ne!(next.metadata.checksum, item.metadata.checksum);
    }

    #[test]
    fn test_validate_detects_tampered_payload() {
        let mut item = StorageItem::new("orders", "o1", json!({"total": 100}));
        assert!(item.validate().is_ok());

        item.data = json!({"total": 1});
        let err = item.validate().unwrap_err();
        assert!(matches!(err, StorageError::Corruption { .. }));
    }

    #[test]
    fn test_validate_rejects_empty_id() {
        let item = StorageItem::new("orders", "", json!({}));
        assert!(matches!(item.validate(), Err(StorageError::Invalid(_))));
    }

    #[test]
    fn test_status_wire_names() {
        let item = StorageItem::new("orders", "o1", json!({}));
        let json_str = serde_json::to_string(&item).unwrap();

        assert!(json_str.contains("\"local-cache\""));
        assert!(json_str.contains("\"pending\""));

        let back: StorageItem = serde_json::from_str(&json_str).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn test_sync_status_parse() {
        assert_eq!("conflict".parse::<SyncStatus>().unwrap(), SyncStatus::Conflict);
        assert!("bogus".parse::<SyncStatus>().is_err());
        assert!(SyncStatus::Offline.needs_sync());
        assert!(!SyncStatus::Conflict.needs_sync());
    }

    #[test]
    fn test_internal_collection_prefix() {
        assert!(is_internal_collection("_sync_queue"));
        assert!(!is_internal_collection("orders"));
    }
}
