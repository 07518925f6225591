//! Conflict detection and resolution rules.

use serde_json::Value;

use super::types::{ConflictStrategy, ResolutionStrategy};
use crate::storage_item::{now_millis, StorageItem};

/// Local and remote differ in content and neither timestamp settles it.
#[must_use]
pub fn is_conflict(local: &StorageItem, remote: &StorageItem) -> bool {
    local.metadata.checksum != remote.metadata.checksum
        && local.metadata.updated_at != remote.metadata.updated_at
}

/// Shallow merge: `remote` is the base, top-level keys of `local` overwrite it.
///
/// Remote-only keys survive. Non-object payloads cannot be merged and the
/// local value is taken whole.
#[must_use]
pub fn merge_values(remote: &Value, local: &Value) -> Value {
    match (remote, local) {
        (Value::Object(base), Value::Object(overlay)) => {
            let mut merged = base.clone();
            for (key, value) in overlay {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        _ => local.clone(),
    }
}

/// New revision carrying `data` that supersedes both sides.
#[must_use]
pub fn supersede(local: &StorageItem, remote: &StorageItem, data: Value) -> StorageItem {
    let mut item = local.revise(data);
    item.metadata.created_at = local.metadata.created_at.min(remote.metadata.created_at);
    item.metadata.version = local.metadata.version.max(remote.metadata.version) + 1;
    item.metadata.updated_at = now_millis()
        .max(local.metadata.updated_at + 1)
        .max(remote.metadata.updated_at + 1);
    item
}

/// Outcome of applying a strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub strategy: ResolutionStrategy,
    /// Item to store on both tiers; `None` leaves the conflict open
    pub winner: Option<StorageItem>,
}

#[must_use]
pub fn decide(strategy: ConflictStrategy, local: &StorageItem, remote: &StorageItem) -> Decision {
    match strategy {
        ConflictStrategy::LastWins => {
            if local.is_newer_than(remote) {
                Decision { strategy: ResolutionStrategy::Local, winner: Some(local.clone()) }
            } else {
                Decision { strategy: ResolutionStrategy::Remote, winner: Some(remote.clone()) }
            }
        }
        ConflictStrategy::Merge => {
            let merged = merge_values(&remote.data, &local.data);
            Decision {
                strategy: ResolutionStrategy::Merge,
                winner: Some(supersede(local, remote, merged)),
            }
        }
        ConflictStrategy::Manual => Decision { strategy: ResolutionStrategy::Manual, winner: None },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pair(local: Value, remote: Value) -> (StorageItem, StorageItem) {
        let local = StorageItem::new("c", "x", local);
        let mut remote = StorageItem::new("c", "x", remote);
        remote.metadata.updated_at = local.metadata.updated_at + 1000;
        (local, remote)
    }

    #[test]
    fn test_conflict_needs_both_differences() {
        let (local, remote) = pair(json!({"counter": 1}), json!({"counter": 2}));
        assert!(is_conflict(&local, &remote));

        let mut same_time = remote.clone();
        same_time.metadata.updated_at = local.metadata.updated_at;
        assert!(!is_conflict(&local, &same_time));

        let (local, remote) = pair(json!({"counter": 1}), json!({"counter": 1}));
        assert!(!is_conflict(&local, &remote));
    }

    #[test]
    fn test_merge_keeps_remote_only_keys() {
        let merged = merge_values(&json!({"a": 1, "b": 2}), &json!({"b": 3, "c": 4}));
        assert_eq!(merged, json!({"a": 1, "b": 3, "c": 4}));
        assert_eq!(merge_values(&json!([1]), &json!("local")), json!("local"));
    }

    #[test]
    fn test_last_wins_picks_later_side() {
        let (local, remote) = pair(json!({"v": "l"}), json!({"v": "r"}));
        let decision = decide(ConflictStrategy::LastWins, &local, &remote);
        assert_eq!(decision.strategy, ResolutionStrategy::Remote);
        assert_eq!(decision.winner.unwrap().data, json!({"v": "r"}));
    }

    #[test]
    fn test_merge_supersedes_both_versions() {
        let (local, remote) = pair(json!({"counter": 1}), json!({"counter": 2, "extra": true}));
        let winner = decide(ConflictStrategy::Merge, &local, &remote).winner.unwrap();

        assert_eq!(winner.data, json!({"counter": 1, "extra": true}));
        assert!(winner.metadata.updated_at > remote.metadata.updated_at);
        assert!(winner.checksum_matches());
        assert_eq!(winner.metadata.version, 2);
    }

    #[test]
    fn test_manual_leaves_open() {
        let (local, remote) = pair(json!(1), json!(2));
        assert!(decide(ConflictStrategy::Manual, &local, &remote).winner.is_none());
    }
}
