//! Engine configuration.
//!
//! `EngineConfig` is usually loaded from a `config.toml` by the infra layer.
//! Every field has a default, and the camelCase names used by tool-calling
//! clients are accepted as aliases.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::conflict::ResolutionStrategy;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Concurrency ceiling within a dependency level.
    #[serde(default = "default_max_concurrency", alias = "maxConcurrency")]
    pub max_concurrency: usize,

    /// Total attempts per operation, including the first.
    #[serde(default = "default_retry_max_attempts", alias = "retryMaxAttempts")]
    pub retry_max_attempts: u32,

    #[serde(default = "default_retry_base_delay_ms", alias = "retryBaseDelayMs")]
    pub retry_base_delay_ms: u64,

    /// Backoff cap.
    #[serde(default = "default_retry_max_delay_ms", alias = "retryMaxDelayMs")]
    pub retry_max_delay_ms: u64,

    /// Result cache TTL for read-only operations.
    #[serde(default = "default_cache_ttl_ms", alias = "cacheTtlMs")]
    pub cache_ttl_ms: u64,

    #[serde(default = "default_cache_max_entries", alias = "cacheMaxEntries")]
    pub cache_max_entries: usize,

    #[serde(default = "default_version_cache_ttl_ms", alias = "versionCacheTtlMs")]
    pub version_cache_ttl_ms: u64,

    #[serde(
        default = "default_version_cache_max_entries",
        alias = "versionCacheMaxEntries"
    )]
    pub version_cache_max_entries: usize,

    #[serde(default, alias = "autoResolveConflicts")]
    pub auto_resolve_conflicts: bool,

    #[serde(default, alias = "defaultResolutionStrategy")]
    pub default_resolution_strategy: ResolutionStrategy,

    /// At most one active transaction per overlapping scope.
    #[serde(default, alias = "requireExclusiveScope")]
    pub require_exclusive_scope: bool,

    /// How long `begin` waits for a contended scope.
    #[serde(default = "default_scope_wait_ms", alias = "scopeWaitMs")]
    pub scope_wait_ms: u64,

    /// Operations per remote batch call.
    #[serde(default = "default_max_batch_size", alias = "maxBatchSize")]
    pub max_batch_size: usize,

    /// Audit window for snapshots of committed transactions.
    #[serde(default = "default_snapshot_retention_ms", alias = "snapshotRetentionMs")]
    pub snapshot_retention_ms: u64,

    #[serde(default = "default_operation_timeout_ms", alias = "operationTimeoutMs")]
    pub operation_timeout_ms: u64,

    #[serde(default = "default_workflow_timeout_ms", alias = "workflowTimeoutMs")]
    pub workflow_timeout_ms: u64,

    /// Restore committed operations when a workflow fails.
    #[serde(default = "default_true", alias = "rollbackOnFailure")]
    pub rollback_on_failure: bool,

    /// Run the impact analyzer before mutating operations.
    #[serde(default = "default_true", alias = "analyzeImpact")]
    pub analyze_impact: bool,

    #[serde(default, alias = "requireConfirmationForCritical")]
    pub require_confirmation_for_critical: bool,

    #[serde(default = "default_event_bus_capacity", alias = "eventBusCapacity")]
    pub event_bus_capacity: usize,
}

fn default_max_concurrency() -> usize {
    4
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    200
}

fn default_retry_max_delay_ms() -> u64 {
    10_000
}

fn default_cache_ttl_ms() -> u64 {
    30_000
}

fn default_cache_max_entries() -> usize {
    1_024
}

fn default_version_cache_ttl_ms() -> u64 {
    60_000
}

fn default_version_cache_max_entries() -> usize {
    4_096
}

fn default_scope_wait_ms() -> u64 {
    2_000
}

fn default_max_batch_size() -> usize {
    100
}

fn default_snapshot_retention_ms() -> u64 {
    300_000
}

fn default_operation_timeout_ms() -> u64 {
    60_000
}

fn default_workflow_timeout_ms() -> u64 {
    1_800_000
}

fn default_event_bus_capacity() -> usize {
    1_024
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            cache_ttl_ms: default_cache_ttl_ms(),
            cache_max_entries: default_cache_max_entries(),
            version_cache_ttl_ms: default_version_cache_ttl_ms(),
            version_cache_max_entries: default_version_cache_max_entries(),
            auto_resolve_conflicts: false,
            default_resolution_strategy: ResolutionStrategy::Manual,
            require_exclusive_scope: false,
            scope_wait_ms: default_scope_wait_ms(),
            max_batch_size: default_max_batch_size(),
            snapshot_retention_ms: default_snapshot_retention_ms(),
            operation_timeout_ms: default_operation_timeout_ms(),
            workflow_timeout_ms: default_workflow_timeout_ms(),
            rollback_on_failure: true,
            analyze_impact: true,
            require_confirmation_for_critical: false,
            event_bus_capacity: default_event_bus_capacity(),
        }
    }
}

impl EngineConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn version_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.version_cache_ttl_ms)
    }

    pub fn scope_wait(&self) -> Duration {
        Duration::from_millis(self.scope_wait_ms)
    }

    pub fn snapshot_retention(&self) -> Duration {
        Duration::from_millis(self.snapshot_retention_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn workflow_timeout(&self) -> Duration {
        Duration::from_millis(self.workflow_timeout_ms)
    }

    /// Reject values that would stall or disable the engine.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrency == 0 {
            return Err("max_concurrency must be at least 1".to_string());
        }
        if self.retry_max_attempts == 0 {
            return Err("retry_max_attempts must be at least 1".to_string());
        }
        if self.max_batch_size == 0 {
            return Err("max_batch_size must be at least 1".to_string());
        }
        if self.cache_max_entries == 0 || self.version_cache_max_entries == 0 {
            return Err("cache sizes must be at least 1".to_string());
        }
        if self.event_bus_capacity == 0 {
            return Err("event_bus_capacity must be at least 1".to_string());
        }
        Ok(())
    }
}
