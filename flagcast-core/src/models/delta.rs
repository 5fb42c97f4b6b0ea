use crate::models::PERCENT_UNSET;

/// One changed feature as materialized for a subscriber.
///
/// A delta tree mirrors the hierarchy but only carries levels that changed
/// since the subscriber's `last_version`: a feature whose only change was at
/// the param level is reported with `value == PERCENT_UNSET` at the feature
/// and key levels. Order is significant end to end: features, keys within
/// a feature and params within a key all keep the first-seen order of the
/// underlying query, which is what makes replaying chained deltas
/// deterministic.
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureDelta {
    pub name: String,
    pub value: i32,
    pub is_deleted: bool,
    pub keys: Vec<KeyDelta>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct KeyDelta {
    pub name: String,
    pub value: i32,
    pub is_deleted: bool,
    pub params: Vec<ParamDelta>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ParamDelta {
    pub name: String,
    pub value: i32,
    pub is_deleted: bool,
}

impl FeatureDelta {
    /// A feature entry that has not (yet) seen a feature-level change.
    pub fn unchanged(name: impl Into<String>) -> Self {
        Self { name: name.into(), value: PERCENT_UNSET, is_deleted: false, keys: Vec::new() }
    }
}

impl KeyDelta {
    /// A key entry that has not (yet) seen a key-level change.
    pub fn unchanged(name: impl Into<String>) -> Self {
        Self { name: name.into(), value: PERCENT_UNSET, is_deleted: false, params: Vec::new() }
    }
}
