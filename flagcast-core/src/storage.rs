//! Contracts the subscription server consumes.
//!
//! Implementations live in `flagcast-storage`; the traits exist so the
//! service layer can be exercised against mocks and so alternative backends
//! (e.g. a shared redis for the key-value side) can be plugged in without
//! touching transport code.

use crate::models::FeatureDelta;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Cache key holding the global version watermark.
pub const FEATURE_VERSION_KEY: &str = "feature_version";
/// Per-service last-observed watermark, keyed by service name.
pub const VERSION_CHECK_PREFIX: &str = "feature_version_check:";
/// Presence sentinel marking a feature as recently evaluated somewhere.
pub const STAT_USED_PREFIX: &str = "stat_used:";
/// Presence sentinel marking a service as recently reporting usage.
pub const STAT_SERVICE_USED_PREFIX: &str = "stat_service_used:";

/// The watermark key is effectively permanent; it is refreshed on every
/// version bump.
pub const FEATURE_VERSION_TTL: Duration = Duration::from_secs(365 * 24 * 3600);
pub const VERSION_CHECK_TTL: Duration = Duration::from_secs(3600);
/// Usage sentinels slide: reads refresh the window.
pub const STAT_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Error, Debug, PartialEq)]
pub enum StorageError {
    #[error("Could not find {0} with id `{1}`!")]
    NotFound(String, String),
    #[error("The {0} entry `{1}` was already present!")]
    DuplicateEntry(String, String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Unexpected storage error: {0} Retry or contact us!")]
    Unexpected(String),
}

/// Errors of the key-value side. Observable, but callers treat the cache as
/// a hint and never fail an operation over it.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Backend(String),
}

/// A key-value store with per-entry expiry. The bundled implementation is
/// in-process; a shared deployment would put redis behind this trait.
#[async_trait]
pub trait KeyValueCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;
    async fn has(&self, key: &str) -> Result<bool, CacheError>;
    /// Resets the entry's remaining lifetime; a no-op for absent keys.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CacheError>;
}

/// Produces per-service deltas from the versioned value table.
#[async_trait]
pub trait DeltaGateway: Send + Sync {
    /// Returns the current watermark together with every feature of the
    /// service's access set that changed after `last_version`, in stable
    /// first-seen order.
    ///
    /// When the cached watermark proves nothing changed the implementation
    /// must answer from the cache alone, without touching the relational
    /// store.
    async fn get_new_by_service(
        &self,
        service_name: &str,
        last_version: i64,
    ) -> Result<(i64, Vec<FeatureDelta>), StorageError>;
}

/// Records which features and services actually evaluate flags. Advisory
/// data only; ingest must never fail because the cache does.
#[async_trait]
pub trait StatsGateway: Send + Sync {
    async fn record_usage(&self, service_name: &str, feature_name: &str);
    async fn is_used(&self, feature_name: &str) -> bool;
    async fn is_service_used(&self, service_name: &str) -> bool;
}
