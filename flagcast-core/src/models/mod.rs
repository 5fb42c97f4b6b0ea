//! Domain entities of the flag hierarchy.
//!
//! The hierarchy has three levels: a feature, the attribute keys a caller
//! may present for it (e.g. `country`), and the concrete values of a key
//! (e.g. `US`), called params. A percentage can be pinned at any of the
//! three levels through an [`ActivationValue`] row; evaluation falls through
//! from the most specific level that carries one.

mod delta;

pub use delta::{FeatureDelta, KeyDelta, ParamDelta};

use chrono::NaiveDateTime;
use uuid::Uuid;

/// A named flag. `name` is unique among live (non soft-deleted) rows;
/// re-creating a feature under a deleted name resurrects the old row and id.
#[derive(Clone, Debug, PartialEq)]
pub struct Feature {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub deleted_at: Option<NaiveDateTime>,
}

/// An attribute key of a feature, unique by `(feature_id, name)` among live
/// rows.
#[derive(Clone, Debug, PartialEq)]
pub struct ActivationKey {
    pub id: Uuid,
    pub feature_id: Uuid,
    pub name: String,
    pub description: String,
    pub deleted_at: Option<NaiveDateTime>,
}

/// A concrete value of an attribute key, unique by `(key_id, name)` among
/// live rows.
#[derive(Clone, Debug, PartialEq)]
pub struct ActivationParam {
    pub id: Uuid,
    pub feature_id: Uuid,
    pub key_id: Uuid,
    pub name: String,
    pub deleted_at: Option<NaiveDateTime>,
}

/// A subscriber identity. Which features a service may observe is governed
/// by the service access set.
#[derive(Clone, Debug, PartialEq)]
pub struct Service {
    pub id: Uuid,
    pub name: String,
}

/// Identifies the level an activation value is pinned at.
///
/// The SQL schema stores the discriminators as nullable columns; in memory
/// the tagged variant is used instead so that illegal combinations (a param
/// without its key) are unrepresentable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueLevel {
    Feature { feature_id: Uuid },
    Key { feature_id: Uuid, key_id: Uuid },
    Param { feature_id: Uuid, key_id: Uuid, param_id: Uuid },
}

impl ValueLevel {
    pub fn feature_id(&self) -> Uuid {
        match *self {
            ValueLevel::Feature { feature_id } |
            ValueLevel::Key { feature_id, .. } |
            ValueLevel::Param { feature_id, .. } => feature_id,
        }
    }

    pub fn key_id(&self) -> Option<Uuid> {
        match *self {
            ValueLevel::Feature { .. } => None,
            ValueLevel::Key { key_id, .. } | ValueLevel::Param { key_id, .. } => Some(key_id),
        }
    }

    pub fn param_id(&self) -> Option<Uuid> {
        match *self {
            ValueLevel::Param { param_id, .. } => Some(param_id),
            _ => None,
        }
    }
}

/// The authoritative versioned value row. `v` is strictly monotonic across
/// every write to the table, soft deletes included.
#[derive(Clone, Debug, PartialEq)]
pub struct ActivationValue {
    pub id: Uuid,
    pub level: ValueLevel,
    pub value: i32,
    pub v: i64,
    pub deleted_at: Option<NaiveDateTime>,
}

/// Sentinel percent meaning "unset at this level"; evaluation falls through
/// to the next lower-priority rule. Never clamped away before evaluation.
pub const PERCENT_UNSET: i32 = -1;
