//! The versioned activation value store and per-service delta assembly.
//!
//! Every mutation allocates the next global version inside its transaction,
//! so `v` totally orders all writes. Reads are assembled from one join over
//! the service's access set, filtered to rows above the subscriber's last
//! version, and aggregated into a delta tree in first-seen order.

use super::{orm, PostgresError, PostgresGateway};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel::sql_query;
use diesel::sql_types;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use flagcast_core::models::{FeatureDelta, KeyDelta, ParamDelta, ValueLevel};
use flagcast_core::storage::{DeltaGateway, StorageError};
use super::schema::{
    activation_keys, activation_params, activation_values, features, service_access, services,
};
use std::collections::HashMap;
use tracing::warn;
use uuid::Uuid;

impl PostgresGateway {
    /// Writes (or restores) the value pinned at `level` and returns the
    /// allocated version. The cached watermark is bumped after commit.
    pub async fn insert_value(&self, level: &ValueLevel, value: i32) -> Result<i64, StorageError> {
        let mut conn = self.conn().await?;
        let v = conn
            .transaction(|conn| insert_value_tx(conn, level, value).scope_boxed())
            .await
            .map_err(StorageError::from)?;
        self.bump_global_version(v).await;
        Ok(v)
    }

    /// Tombstones the feature-level value and drops the now unreachable
    /// deeper rows. Returns the tombstone's version.
    pub async fn delete_by_feature_id(&self, feature_id: Uuid) -> Result<i64, StorageError> {
        let mut conn = self.conn().await?;
        let v = conn
            .transaction(|conn| delete_by_feature_tx(conn, feature_id).scope_boxed())
            .await
            .map_err(StorageError::from)?;
        self.bump_global_version(v).await;
        Ok(v)
    }

    /// Tombstones the key-level value and drops its param rows.
    pub async fn delete_by_key_id(&self, key_id: Uuid) -> Result<i64, StorageError> {
        let mut conn = self.conn().await?;
        let v = conn
            .transaction(|conn| delete_by_key_tx(conn, key_id).scope_boxed())
            .await
            .map_err(StorageError::from)?;
        self.bump_global_version(v).await;
        Ok(v)
    }

    /// Tombstones a single param-level value.
    pub async fn delete_by_param_id(&self, param_id: Uuid) -> Result<i64, StorageError> {
        let mut conn = self.conn().await?;
        let v = conn
            .transaction(|conn| delete_by_param_tx(conn, param_id).scope_boxed())
            .await
            .map_err(StorageError::from)?;
        self.bump_global_version(v).await;
        Ok(v)
    }
}

#[async_trait]
impl DeltaGateway for PostgresGateway {
    async fn get_new_by_service(
        &self,
        service_name: &str,
        last_version: i64,
    ) -> Result<(i64, Vec<FeatureDelta>), StorageError> {
        if service_name.is_empty() {
            return Err(StorageError::InvalidInput("service name must not be empty".to_owned()));
        }

        // Hot path: the cached watermark proves the subscriber is current,
        // answer without touching the store.
        let cached = self.cached_global_version().await;
        if let Some(cached_version) = cached {
            if cached_version <= last_version {
                self.touch_version_check(service_name, cached_version)
                    .await;
                return Ok((cached_version, Vec::new()));
            }
        }

        let mut conn = self.conn().await?;
        let rows = delta_rows(&mut conn, service_name, last_version)
            .await
            .map_err(StorageError::from)?;
        // The watermark handed back is the cached one so a caught-up client
        // sees it even when its filtered result is empty; without a cache
        // entry the store's max(v) is authoritative.
        let version = match cached {
            Some(cached_version) => cached_version,
            None => orm::ActivationValue::max_version(&mut conn)
                .await
                .map_err(|err| StorageError::from(PostgresError::from(err)))?,
        };
        let deltas = collect_deltas(rows);
        self.touch_version_check(service_name, version).await;
        Ok((version, deltas))
    }
}

/// Allocates the next global version. Must run inside the mutating
/// transaction so concurrent writers serialize on the value table.
pub(crate) async fn next_version(conn: &mut AsyncPgConnection) -> Result<i64, PostgresError> {
    let max = orm::ActivationValue::max_version(conn)
        .await
        .map_err(PostgresError::from)?;
    Ok(max + 1)
}

/// Insert-or-restore for the value pinned at `level`.
///
/// First tries to take over the existing row for the triple (live or
/// soft-deleted), stamping the fresh version and clearing the tombstone.
/// Only when no row exists a new one is inserted; a concurrent writer
/// racing the insert is absorbed by the partial unique index via
/// `ON CONFLICT DO UPDATE`.
pub(crate) async fn insert_value_tx(
    conn: &mut AsyncPgConnection,
    level: &ValueLevel,
    value: i32,
) -> Result<i64, PostgresError> {
    let v = next_version(conn).await?;

    let updated = restore_update(conn, level, value, v)
        .await
        .map_err(PostgresError::from)?;
    if updated == 0 {
        sql_query(
            r#"
            INSERT INTO activation_values (id, feature_id, activation_key_id, activation_param_id, value, v)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (
                feature_id,
                COALESCE(activation_key_id, '00000000-0000-0000-0000-000000000000'::uuid),
                COALESCE(activation_param_id, '00000000-0000-0000-0000-000000000000'::uuid)
            ) WHERE deleted_at IS NULL
            DO UPDATE SET value = EXCLUDED.value, v = EXCLUDED.v, deleted_at = NULL
            "#,
        )
        .bind::<sql_types::Uuid, _>(Uuid::new_v4())
        .bind::<sql_types::Uuid, _>(level.feature_id())
        .bind::<sql_types::Nullable<sql_types::Uuid>, _>(level.key_id())
        .bind::<sql_types::Nullable<sql_types::Uuid>, _>(level.param_id())
        .bind::<sql_types::Integer, _>(value)
        .bind::<sql_types::BigInt, _>(v)
        .execute(conn)
        .await
        .map_err(PostgresError::from)?;
    }
    Ok(v)
}

async fn restore_update(
    conn: &mut AsyncPgConnection,
    level: &ValueLevel,
    value: i32,
    v: i64,
) -> QueryResult<usize> {
    let assignments = (
        activation_values::value.eq(value),
        activation_values::v.eq(v),
        activation_values::deleted_at.eq(None::<NaiveDateTime>),
    );
    match *level {
        ValueLevel::Feature { feature_id } => {
            diesel::update(
                activation_values::table
                    .filter(activation_values::feature_id.eq(feature_id))
                    .filter(activation_values::activation_key_id.is_null())
                    .filter(activation_values::activation_param_id.is_null()),
            )
            .set(assignments)
            .execute(conn)
            .await
        }
        ValueLevel::Key { feature_id, key_id } => {
            diesel::update(
                activation_values::table
                    .filter(activation_values::feature_id.eq(feature_id))
                    .filter(activation_values::activation_key_id.eq(key_id))
                    .filter(activation_values::activation_param_id.is_null()),
            )
            .set(assignments)
            .execute(conn)
            .await
        }
        ValueLevel::Param { feature_id, key_id, param_id } => {
            diesel::update(
                activation_values::table
                    .filter(activation_values::feature_id.eq(feature_id))
                    .filter(activation_values::activation_key_id.eq(key_id))
                    .filter(activation_values::activation_param_id.eq(param_id)),
            )
            .set(assignments)
            .execute(conn)
            .await
        }
    }
}

pub(crate) async fn delete_by_feature_tx(
    conn: &mut AsyncPgConnection,
    feature_id: Uuid,
) -> Result<i64, PostgresError> {
    let v = next_version(conn).await?;
    diesel::update(
        activation_values::table
            .filter(activation_values::feature_id.eq(feature_id))
            .filter(activation_values::activation_key_id.is_null())
            .filter(activation_values::deleted_at.is_null()),
    )
    .set((
        activation_values::deleted_at.eq(diesel::dsl::now.nullable()),
        activation_values::v.eq(v),
    ))
    .execute(conn)
    .await
    .map_err(PostgresError::from)?;

    // The feature tombstone subsumes everything below it; deeper rows carry
    // no information anymore.
    diesel::delete(
        activation_values::table
            .filter(activation_values::feature_id.eq(feature_id))
            .filter(activation_values::activation_key_id.is_not_null()),
    )
    .execute(conn)
    .await
    .map_err(PostgresError::from)?;
    Ok(v)
}

pub(crate) async fn delete_by_key_tx(
    conn: &mut AsyncPgConnection,
    key_id: Uuid,
) -> Result<i64, PostgresError> {
    let v = next_version(conn).await?;
    diesel::update(
        activation_values::table
            .filter(activation_values::activation_key_id.eq(key_id))
            .filter(activation_values::activation_param_id.is_null())
            .filter(activation_values::deleted_at.is_null()),
    )
    .set((
        activation_values::deleted_at.eq(diesel::dsl::now.nullable()),
        activation_values::v.eq(v),
    ))
    .execute(conn)
    .await
    .map_err(PostgresError::from)?;

    diesel::delete(
        activation_values::table
            .filter(activation_values::activation_key_id.eq(key_id))
            .filter(activation_values::activation_param_id.is_not_null()),
    )
    .execute(conn)
    .await
    .map_err(PostgresError::from)?;
    Ok(v)
}

pub(crate) async fn delete_by_param_tx(
    conn: &mut AsyncPgConnection,
    param_id: Uuid,
) -> Result<i64, PostgresError> {
    let v = next_version(conn).await?;
    diesel::update(
        activation_values::table
            .filter(activation_values::activation_param_id.eq(param_id))
            .filter(activation_values::deleted_at.is_null()),
    )
    .set((
        activation_values::deleted_at.eq(diesel::dsl::now.nullable()),
        activation_values::v.eq(v),
    ))
    .execute(conn)
    .await
    .map_err(PostgresError::from)?;
    Ok(v)
}

/// One row of the delta join: a changed activation value together with the
/// names of the levels it hangs off.
#[derive(Queryable, Debug, PartialEq)]
pub(crate) struct DeltaRow {
    pub feature_name: String,
    pub value: i32,
    pub v: i64,
    pub deleted_at: Option<NaiveDateTime>,
    pub key_id: Option<Uuid>,
    pub param_id: Option<Uuid>,
    pub key_name: Option<String>,
    pub param_name: Option<String>,
}

/// Every activation value of the service's access set above `last_version`,
/// in ascending version order. Ascending `v` is what gives features, keys
/// and params their stable first-seen order.
pub(crate) async fn delta_rows(
    conn: &mut AsyncPgConnection,
    service_name: &str,
    last_version: i64,
) -> Result<Vec<DeltaRow>, PostgresError> {
    services::table
        .inner_join(service_access::table.on(service_access::service_id.eq(services::id)))
        .inner_join(features::table.on(features::id.eq(service_access::feature_id)))
        .inner_join(
            activation_values::table.on(activation_values::feature_id.eq(features::id)),
        )
        .left_join(
            activation_keys::table
                .on(activation_keys::id
                    .nullable()
                    .eq(activation_values::activation_key_id)),
        )
        .left_join(
            activation_params::table
                .on(activation_params::id
                    .nullable()
                    .eq(activation_values::activation_param_id)),
        )
        .filter(services::name.eq(service_name))
        .filter(activation_values::v.gt(last_version))
        .order(activation_values::v.asc())
        .select((
            features::name,
            activation_values::value,
            activation_values::v,
            activation_values::deleted_at,
            activation_values::activation_key_id,
            activation_values::activation_param_id,
            activation_keys::name.nullable(),
            activation_params::name.nullable(),
        ))
        .load::<DeltaRow>(conn)
        .await
        .map_err(PostgresError::from)
}

/// Aggregates join rows into the per-feature delta tree.
///
/// Levels without a changed row report the unset sentinel. A malformed row
/// (missing catalog name for a referenced level) is logged and skipped, it
/// never aborts the batch.
pub(crate) fn collect_deltas(rows: Vec<DeltaRow>) -> Vec<FeatureDelta> {
    let mut deltas: Vec<FeatureDelta> = Vec::new();
    let mut by_name: HashMap<String, usize> = HashMap::new();

    for row in rows {
        let idx = match by_name.get(&row.feature_name) {
            Some(idx) => *idx,
            None => {
                deltas.push(FeatureDelta::unchanged(row.feature_name.clone()));
                by_name.insert(row.feature_name.clone(), deltas.len() - 1);
                deltas.len() - 1
            }
        };
        let feature = &mut deltas[idx];
        let is_deleted = row.deleted_at.is_some();

        match (row.key_id, row.param_id) {
            (None, None) => {
                feature.value = row.value;
                feature.is_deleted = is_deleted;
            }
            (Some(key_id), None) => {
                let Some(key_name) = row.key_name else {
                    warn!(feature = %row.feature_name, %key_id, "value row references a missing key, skipping");
                    continue;
                };
                let key = key_entry(feature, key_name);
                key.value = row.value;
                key.is_deleted = is_deleted;
            }
            (Some(_), Some(param_id)) => {
                let (Some(key_name), Some(param_name)) = (row.key_name, row.param_name) else {
                    warn!(feature = %row.feature_name, %param_id, "value row references a missing key or param, skipping");
                    continue;
                };
                let key = key_entry(feature, key_name);
                key.params
                    .push(ParamDelta { name: param_name, value: row.value, is_deleted });
            }
            (None, Some(param_id)) => {
                warn!(feature = %row.feature_name, %param_id, "value row carries a param without its key, skipping");
            }
        }
    }
    deltas
}

fn key_entry(feature: &mut FeatureDelta, key_name: String) -> &mut KeyDelta {
    let pos = feature
        .keys
        .iter()
        .position(|key| key.name == key_name);
    match pos {
        Some(pos) => &mut feature.keys[pos],
        None => {
            feature.keys.push(KeyDelta::unchanged(key_name));
            feature.keys.last_mut().expect("just pushed")
        }
    }
}
