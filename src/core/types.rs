//! Public types for the storage core.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::storage::traits::{Tier, TierFailure};
use crate::storage_item::StorageItem;

/// Envelope version written by [`super::StorageCore::export_data`].
pub const EXPORT_VERSION: u32 = 1;

/// Kind of change an item write represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteAction {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for WriteAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// Result of the latest tier probe.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TierHealth {
    pub authoritative: bool,
    pub cache: bool,
    pub fallback: bool,
    /// Round trip of the authoritative probe, when it succeeded
    pub authoritative_latency_ms: Option<u64>,
    /// Epoch millis of the probe; `None` before the first one
    pub checked_at: Option<i64>,
}

impl TierHealth {
    #[must_use]
    pub fn is_healthy(&self, tier: Tier) -> bool {
        match tier {
            Tier::Authoritative => self.authoritative,
            Tier::Cache => self.cache,
            Tier::Fallback => self.fallback,
        }
    }

    #[must_use]
    pub fn all_healthy(&self) -> bool {
        self.authoritative && self.cache && self.fallback
    }

    fn flags(&self) -> (bool, bool, bool) {
        (self.authoritative, self.cache, self.fallback)
    }

    /// Whether any tier flipped between two probes.
    #[must_use]
    pub fn differs_from(&self, other: &TierHealth) -> bool {
        self.flags() != other.flags()
    }
}

/// Notifications emitted by the storage core.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageEvent {
    /// A write landed locally but did not reach the authoritative tier
    PropagationFailed {
        collection: String,
        id: String,
        action: WriteAction,
        /// Item as written locally; `None` for deletes
        item: Option<StorageItem>,
        error: String,
    },
    HealthChanged(TierHealth),
}

/// Outcome of a [`super::StorageCore::set`].
#[derive(Debug, Clone, PartialEq)]
pub struct WriteReport {
    /// Item as it now stands in the best tier that accepted it
    pub item: StorageItem,
    /// Tiers that were attempted and failed
    pub failures: Vec<TierFailure>,
}

impl WriteReport {
    /// Reached the authoritative tier.
    #[must_use]
    pub fn propagated(&self) -> bool {
        self.item.metadata.sync_status == crate::SyncStatus::Synced
    }

    #[must_use]
    pub fn failed_tiers(&self) -> Vec<Tier> {
        self.failures.iter().map(|f| f.tier).collect()
    }
}

/// Outcome of a [`super::StorageCore::read`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReadOutcome {
    pub item: Option<StorageItem>,
    pub served_by: Option<Tier>,
    pub failures: Vec<TierFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeleteReport {
    /// Found in at least one local tier
    pub existed: bool,
    pub failures: Vec<TierFailure>,
}

/// Plain export envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportEnvelope {
    pub timestamp: i64,
    pub version: u32,
    pub collections: BTreeMap<String, Vec<StorageItem>>,
}

impl ExportEnvelope {
    #[must_use]
    pub fn item_count(&self) -> usize {
        self.collections.values().map(Vec::len).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ImportReport {
    pub imported: usize,
    /// Already present locally and `overwrite` was off
    pub skipped: usize,
    /// `collection:id` of items that failed validation or could not be written
    pub rejected: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct CollectionStats {
    pub total: usize,
    pub pending: usize,
    pub conflict: usize,
    pub offline: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageStats {
    pub collections: BTreeMap<String, CollectionStats>,
    pub total_items: usize,
    pub fallback_keys: usize,
    pub remote_configured: bool,
    pub circuit_open: bool,
    pub health: TierHealth,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_change_detection_ignores_timestamps() {
        let a = TierHealth { authoritative: true, cache: true, fallback: true, authoritative_latency_ms: Some(3), checked_at: Some(1) };
        let mut b = a.clone();
        b.checked_at = Some(2);
        b.authoritative_latency_ms = Some(9);
        assert!(!a.differs_from(&b));

        b.authoritative = false;
        assert!(a.differs_from(&b));
        assert!(!b.all_healthy());
        assert!(b.is_healthy(Tier::Cache));
    }

    #[test]
    fn test_write_action_wire_format() {
        assert_eq!(serde_json::to_value(WriteAction::Delete).unwrap(), "delete");
    }
}
