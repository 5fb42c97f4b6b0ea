//! Wire messages spoken by both transports.
//!
//! The WebSocket streaming surface and the JSON polling surface exchange the
//! exact same payloads; the only difference is framing. All fields use
//! snake_case names on the wire.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Subscription request: which service asks, and the highest version it has
/// already applied.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetFeatureRequest {
    pub service_name: String,
    pub last_version: i64,
}

/// One delta message. `version` is the server-side watermark at assembly
/// time; a client that stores it and reconnects with it will receive an
/// empty delta until something changes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GetFeatureResponse {
    pub version: i64,
    pub features: Vec<FeatureItem>,
    pub deleted: Vec<DeletedItem>,
}

/// `all == -1` means "unchanged at this level, fall through".
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureItem {
    pub all: i32,
    pub name: String,
    pub props: Vec<PropsItem>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PropsItem {
    pub all: i32,
    pub name: String,
    pub item: HashMap<String, i32>,
}

/// Announces a removal at exactly one level. Removals of a whole subtree are
/// announced only at the highest removed level; descendants are implied.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeletedItem {
    pub kind: DeletedKind,
    pub feature_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param_name: Option<String>,
}

impl DeletedItem {
    pub fn feature(feature_name: impl Into<String>) -> Self {
        Self {
            kind: DeletedKind::Feature,
            feature_name: feature_name.into(),
            key_name: None,
            param_name: None,
        }
    }

    pub fn key(feature_name: impl Into<String>, key_name: impl Into<String>) -> Self {
        Self {
            kind: DeletedKind::Key,
            feature_name: feature_name.into(),
            key_name: Some(key_name.into()),
            param_name: None,
        }
    }

    pub fn param(
        feature_name: impl Into<String>,
        key_name: impl Into<String>,
        param_name: impl Into<String>,
    ) -> Self {
        Self {
            kind: DeletedKind::Param,
            feature_name: feature_name.into(),
            key_name: Some(key_name.into()),
            param_name: Some(param_name.into()),
        }
    }
}

/// Serialized as its integer discriminant for cross-SDK compatibility.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum DeletedKind {
    Feature = 0,
    Key = 1,
    Param = 2,
}

impl From<DeletedKind> for i32 {
    fn from(kind: DeletedKind) -> i32 {
        kind as i32
    }
}

impl TryFrom<i32> for DeletedKind {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(DeletedKind::Feature),
            1 => Ok(DeletedKind::Key),
            2 => Ok(DeletedKind::Param),
            other => Err(format!("unknown deleted item kind: {other}")),
        }
    }
}

/// One usage record, streamed by the SDK over its persistent stats
/// connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SendStatsRequest {
    pub service_name: String,
    pub feature_name: String,
}

/// Batched usage records, the polling-transport form of stats reporting.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatsBatch {
    pub service_name: String,
    pub features: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn deleted_kind_round_trips_as_integer() {
        let item = DeletedItem::key("search", "country");
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["kind"], 1);
        assert_eq!(json.get("param_name"), None);

        let back: DeletedItem = serde_json::from_value(json).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn unknown_deleted_kind_is_rejected() {
        let err = serde_json::from_str::<DeletedItem>(r#"{"kind":7,"feature_name":"x"}"#)
            .unwrap_err()
            .to_string();
        assert!(err.contains("unknown deleted item kind"), "{err}");
    }

    #[test]
    fn response_wire_shape() {
        let resp = GetFeatureResponse {
            version: 2,
            features: vec![FeatureItem {
                all: 30,
                name: "A".into(),
                props: vec![PropsItem {
                    all: 40,
                    name: "country".into(),
                    item: HashMap::from([("US".to_string(), 70)]),
                }],
            }],
            deleted: vec![DeletedItem::feature("X")],
        };
        let json = serde_json::to_string(&resp).unwrap();
        let back: GetFeatureResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back, resp);
    }
}
