//! The client-side feature snapshot.
//!
//! A read-write lock guards the map: flag checks and snapshot exports take
//! the read side, delta application takes the write side. The lock is never
//! held across I/O or a subscriber callback.

use flagcast_core::dto::{DeletedKind, GetFeatureResponse};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;
use tracing::warn;

/// One feature's configuration as evaluated by the SDK. A percent of `-1`
/// on any level means "unset here, fall through".
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FeatureConfig {
    pub name: String,
    pub all_percent: i32,
    pub keys: HashMap<String, KeyConfig>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct KeyConfig {
    pub all_percent: i32,
    pub items: HashMap<String, i32>,
}

/// Emitted to the update callback after a delta was applied.
#[derive(Clone, Debug, PartialEq)]
pub struct UpdateEvent {
    pub version: i64,
    pub features: Vec<FeatureConfig>,
}

pub(crate) struct FeatureCache {
    features: RwLock<HashMap<String, FeatureConfig>>,
    last_version: AtomicI64,
}

impl FeatureCache {
    pub(crate) fn new(initial_version: i64) -> Self {
        Self { features: RwLock::new(HashMap::new()), last_version: AtomicI64::new(initial_version) }
    }

    pub(crate) fn last_version(&self) -> i64 {
        self.last_version.load(Ordering::Acquire)
    }

    pub(crate) fn get(&self, name: &str) -> Option<FeatureConfig> {
        self.features
            .read()
            .expect("feature cache lock poisoned")
            .get(name)
            .cloned()
    }

    /// A fully independent copy of the snapshot: the nested maps own their
    /// data, so callers can mutate the result without touching the cache.
    pub(crate) fn snapshot(&self) -> HashMap<String, FeatureConfig> {
        self.features
            .read()
            .expect("feature cache lock poisoned")
            .clone()
    }

    /// Merges one delta message: changed features overwrite their whole
    /// entry, tombstones remove the entry (or key, or item) at exactly
    /// their level. Returns the event for the update callback.
    pub(crate) fn apply(&self, resp: &GetFeatureResponse) -> UpdateEvent {
        let mut features = self
            .features
            .write()
            .expect("feature cache lock poisoned");

        for item in &resp.features {
            let mut keys = HashMap::with_capacity(item.props.len());
            for prop in &item.props {
                keys.insert(
                    prop.name.clone(),
                    KeyConfig { all_percent: prop.all, items: prop.item.clone() },
                );
            }
            features.insert(
                item.name.clone(),
                FeatureConfig { name: item.name.clone(), all_percent: item.all, keys },
            );
        }

        for deleted in &resp.deleted {
            match deleted.kind {
                DeletedKind::Feature => {
                    features.remove(&deleted.feature_name);
                }
                DeletedKind::Key => {
                    let removed = deleted.key_name.as_ref().and_then(|key_name| {
                        features
                            .get_mut(&deleted.feature_name)
                            .map(|cfg| cfg.keys.remove(key_name))
                    });
                    if removed.is_none() {
                        warn!(feature = %deleted.feature_name, "key tombstone without a key name or cached feature");
                    }
                }
                DeletedKind::Param => {
                    let removed = match (&deleted.key_name, &deleted.param_name) {
                        (Some(key_name), Some(param_name)) => features
                            .get_mut(&deleted.feature_name)
                            .and_then(|cfg| cfg.keys.get_mut(key_name))
                            .map(|key| key.items.remove(param_name)),
                        _ => None,
                    };
                    if removed.is_none() {
                        warn!(feature = %deleted.feature_name, "param tombstone without a resolvable target");
                    }
                }
            }
        }

        // watermark only ever advances
        let version = resp.version.max(self.last_version());
        self.last_version.store(version, Ordering::Release);

        let changed = resp
            .features
            .iter()
            .filter_map(|item| features.get(&item.name).cloned())
            .collect();
        UpdateEvent { version, features: changed }
    }
}
