//! Failure events, recovery strategies and health summaries.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::TierHealth;
use crate::storage_item::now_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureType {
    /// Authoritative tier unreachable or slow
    StoreUnavailable,
    /// Local cache unavailable or over its size bound
    CacheCorrupt,
    /// Sync backlog or unresolved conflicts over threshold
    SyncFailed,
    /// Sampled items failed structural or checksum validation
    DataCorruption,
}

impl std::fmt::Display for FailureType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StoreUnavailable => write!(f, "store-unavailable"),
            Self::CacheCorrupt => write!(f, "cache-corrupt"),
            Self::SyncFailed => write!(f, "sync-failed"),
            Self::DataCorruption => write!(f, "data-corruption"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Lifecycle: `detected → recovering → resolved | needs-manual-intervention`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureState {
    Detected,
    Recovering,
    Resolved,
    NeedsManualIntervention,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryStrategy {
    /// Reconcile whatever the cache holds with a forced full sync
    CacheFallback,
    /// Restore the newest completed backup covering the affected collections
    BackupRestore,
    /// Retry a full sync
    SyncRetry,
    /// Terminal: flag the event for an operator
    ManualIntervention,
}

impl RecoveryStrategy {
    /// Default order in which strategies are tried.
    #[must_use]
    pub const fn ladder() -> [Self; 4] {
        [Self::CacheFallback, Self::BackupRestore, Self::SyncRetry, Self::ManualIntervention]
    }

    /// Corruption never goes through the cache, which is itself suspect.
    #[must_use]
    pub fn applies_to(&self, failure: FailureType) -> bool {
        match self {
            Self::CacheFallback => matches!(failure, FailureType::StoreUnavailable | FailureType::SyncFailed),
            Self::BackupRestore => matches!(failure, FailureType::DataCorruption | FailureType::CacheCorrupt),
            Self::SyncRetry => matches!(failure, FailureType::StoreUnavailable | FailureType::SyncFailed),
            Self::ManualIntervention => true,
        }
    }
}

impl std::fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CacheFallback => write!(f, "cache-fallback"),
            Self::BackupRestore => write!(f, "backup-restore"),
            Self::SyncRetry => write!(f, "sync-retry"),
            Self::ManualIntervention => write!(f, "manual-intervention"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub failure_type: FailureType,
    pub severity: Severity,
    pub description: String,
    pub detected_at: i64,
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<i64>,
    pub recovery_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub affected_collections: Vec<String>,
    pub state: FailureState,
}

impl FailureEvent {
    pub fn new(
        failure_type: FailureType,
        severity: Severity,
        description: impl Into<String>,
        affected_collections: Vec<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            failure_type,
            severity,
            description: description.into(),
            detected_at: now_millis(),
            resolved: false,
            resolved_at: None,
            recovery_attempts: 0,
            last_error: None,
            affected_collections,
            state: FailureState::Detected,
        }
    }

    pub(crate) fn resolve(&mut self) {
        self.resolved = true;
        self.resolved_at = Some(now_millis());
        self.state = FailureState::Resolved;
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.resolved
    }
}

/// What one failing check reported.
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub failure_type: FailureType,
    pub severity: Severity,
    pub description: String,
    pub affected_collections: Vec<String>,
}

/// Outcome of one health pass: which checks ran clean and what failed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckReport {
    pub passed: Vec<FailureType>,
    pub findings: Vec<Finding>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallHealth {
    Healthy,
    Degraded,
    Critical,
}

impl std::fmt::Display for OverallHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub overall: OverallHealth,
    pub tiers: TierHealth,
    pub active_failures: Vec<FailureEvent>,
    pub queue_len: usize,
    pub unresolved_conflicts: usize,
    pub last_check: Option<i64>,
}

impl HealthStatus {
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.overall == OverallHealth::Healthy
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecoveryError {
    #[error("failure event '{0}' not found")]
    NotFound(String),
    #[error("failure event '{0}' is already resolved")]
    AlreadyResolved(String),
}
