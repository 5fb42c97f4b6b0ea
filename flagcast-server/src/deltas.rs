//! Delta assembly shared by both transport surfaces.
//!
//! The assembler is a thin facade over the gateway: it owns the
//! degrade-on-read-failure policy (a store hiccup yields an empty delta at
//! the previous version, so the subscriber simply does not advance) and the
//! flattening of the delta tree into the wire message, including tombstone
//! extraction. Keeping this out of the transports guarantees streaming and
//! polling clients observe byte-identical payloads and ordering.

use flagcast_core::dto::{DeletedItem, FeatureItem, GetFeatureResponse, PropsItem};
use flagcast_core::models::{FeatureDelta, KeyDelta, ParamDelta};
use flagcast_core::storage::{DeltaGateway, StorageError};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

pub struct DeltaAssembler {
    gateway: Arc<dyn DeltaGateway>,
}

impl DeltaAssembler {
    pub fn new(gateway: Arc<dyn DeltaGateway>) -> Self {
        Self { gateway }
    }

    /// Materializes the delta message for `(service_name, last_version)`.
    ///
    /// Invalid input surfaces to the caller (it is a client error); any
    /// other gateway failure degrades to an empty delta at the previous
    /// version so the subscriber retries on its next tick.
    pub async fn assemble(
        &self,
        service_name: &str,
        last_version: i64,
    ) -> Result<GetFeatureResponse, StorageError> {
        let (version, deltas) = match self
            .gateway
            .get_new_by_service(service_name, last_version)
            .await
        {
            Ok(res) => res,
            Err(err @ StorageError::InvalidInput(_)) => return Err(err),
            Err(err) => {
                warn!(service_name, last_version, %err, "delta assembly failed, degrading to empty delta");
                (last_version, Vec::new())
            }
        };
        Ok(build_response(version, deltas))
    }
}

/// Flattens a delta tree into the wire message.
///
/// A deleted level becomes exactly one `DeletedItem` and its subtree is not
/// emitted; live levels keep their first-seen order.
pub fn build_response(version: i64, deltas: Vec<FeatureDelta>) -> GetFeatureResponse {
    let mut features = Vec::with_capacity(deltas.len());
    let mut deleted = Vec::new();

    for delta in deltas {
        let FeatureDelta { name, value, is_deleted, keys } = delta;
        if is_deleted {
            deleted.push(DeletedItem::feature(name));
            continue;
        }

        let mut props = Vec::with_capacity(keys.len());
        for key in keys {
            let KeyDelta { name: key_name, value: key_value, is_deleted, params } = key;
            if is_deleted {
                deleted.push(DeletedItem::key(&name, key_name));
                continue;
            }

            let mut item = HashMap::with_capacity(params.len());
            for param in params {
                let ParamDelta { name: param_name, value: param_value, is_deleted } = param;
                if is_deleted {
                    deleted.push(DeletedItem::param(&name, &key_name, param_name));
                    continue;
                }
                item.insert(param_name, param_value);
            }
            props.push(PropsItem { all: key_value, name: key_name, item });
        }
        features.push(FeatureItem { all: value, name, props });
    }

    GetFeatureResponse { version, features, deleted }
}
