//! Usage sink: which features and services actually evaluate flags.
//!
//! Purely advisory: the admin surface uses it to dim entities nobody has
//! queried lately. Records are two presence sentinels in the key-value
//! cache with a sliding window: membership reads refresh the TTL. Cache
//! failures are logged and swallowed; ingest never blocks on them.

use async_trait::async_trait;
use flagcast_core::storage::{
    KeyValueCache, StatsGateway, STAT_SERVICE_USED_PREFIX, STAT_TTL, STAT_USED_PREFIX,
};
use std::sync::Arc;
use tracing::warn;

pub struct StatsSink {
    cache: Arc<dyn KeyValueCache>,
}

impl StatsSink {
    pub fn new(cache: Arc<dyn KeyValueCache>) -> Self {
        Self { cache }
    }

    async fn mark(&self, key: String) {
        if let Err(err) = self.cache.set(&key, "1", STAT_TTL).await {
            warn!(%key, %err, "failed to record usage sentinel");
        }
    }

    async fn probe(&self, key: String) -> bool {
        match self.cache.has(&key).await {
            Ok(true) => {
                if let Err(err) = self.cache.expire(&key, STAT_TTL).await {
                    warn!(%key, %err, "failed to refresh usage sentinel");
                }
                true
            }
            Ok(false) => false,
            Err(err) => {
                warn!(%key, %err, "usage sentinel lookup failed");
                false
            }
        }
    }
}

#[async_trait]
impl StatsGateway for StatsSink {
    async fn record_usage(&self, service_name: &str, feature_name: &str) {
        self.mark(format!("{STAT_USED_PREFIX}{feature_name}"))
            .await;
        self.mark(format!("{STAT_SERVICE_USED_PREFIX}{service_name}"))
            .await;
    }

    async fn is_used(&self, feature_name: &str) -> bool {
        self.probe(format!("{STAT_USED_PREFIX}{feature_name}"))
            .await
    }

    async fn is_service_used(&self, service_name: &str) -> bool {
        self.probe(format!("{STAT_SERVICE_USED_PREFIX}{service_name}"))
            .await
    }
}
