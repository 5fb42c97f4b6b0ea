//! Catalog management: features, keys, params, services and the service
//! access set.
//!
//! Every mutation that touches a percentage composes the catalog write and
//! the activation value write into one transaction, so a half-applied edit
//! can never become visible to subscribers. Creation under a name whose row
//! was soft-deleted resurrects that row (same id) instead of inserting a
//! fresh one.

use super::activation::{
    delete_by_feature_tx, delete_by_key_tx, delete_by_param_tx, insert_value_tx,
};
use super::schema::{
    activation_keys, activation_params, activation_values, features, service_access, services,
};
use super::{orm, storage_error_from_diesel, PostgresError, PostgresGateway};
use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use flagcast_core::models::{self, ValueLevel, PERCENT_UNSET};
use flagcast_core::storage::StorageError;
use uuid::Uuid;

/// A live feature together with its current feature-level percent, as shown
/// in admin listings. `value` falls back to the unset sentinel for features
/// that never materialized a feature-level row.
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureListing {
    pub feature: models::Feature,
    pub value: i32,
    pub v: i64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct KeyListing {
    pub key: models::ActivationKey,
    pub value: i32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ParamListing {
    pub param: models::ActivationParam,
    pub value: i32,
}

impl PostgresGateway {
    pub async fn create_feature(
        &self,
        name: &str,
        description: &str,
        value: i32,
    ) -> Result<Uuid, StorageError> {
        if name.trim().is_empty() {
            return Err(StorageError::InvalidInput("feature name must not be empty".to_owned()));
        }
        let mut conn = self.conn().await?;
        let (id, v) = conn
            .transaction(|conn| {
                async move {
                    // Resurrect a soft-deleted row under the same name first.
                    let restored: Option<Uuid> = diesel::update(
                        features::table
                            .filter(features::name.eq(name))
                            .filter(features::deleted_at.is_not_null()),
                    )
                    .set((
                        features::description.eq(description),
                        features::deleted_at.eq(None::<NaiveDateTime>),
                        features::updated_at.eq(diesel::dsl::now),
                    ))
                    .returning(features::id)
                    .get_result(conn)
                    .await
                    .optional()
                    .map_err(PostgresError::from)?;

                    let id = match restored {
                        Some(id) => id,
                        None => diesel::insert_into(features::table)
                            .values(&orm::NewFeature { id: Uuid::new_v4(), name, description })
                            .returning(features::id)
                            .get_result(conn)
                            .await
                            .map_err(|err| storage_error_from_diesel(err, "Feature", name))?,
                    };
                    let v =
                        insert_value_tx(conn, &ValueLevel::Feature { feature_id: id }, value)
                            .await?;
                    Ok::<_, PostgresError>((id, v))
                }
                .scope_boxed()
            })
            .await
            .map_err(StorageError::from)?;
        self.bump_global_version(v).await;
        Ok(id)
    }

    pub async fn update_feature(
        &self,
        id: Uuid,
        name: &str,
        description: &str,
        value: i32,
    ) -> Result<(), StorageError> {
        let mut conn = self.conn().await?;
        let v = conn
            .transaction(|conn| {
                async move {
                    let updated = diesel::update(
                        features::table
                            .filter(features::id.eq(id))
                            .filter(features::deleted_at.is_null()),
                    )
                    .set((
                        features::name.eq(name),
                        features::description.eq(description),
                        features::updated_at.eq(diesel::dsl::now),
                    ))
                    .execute(conn)
                    .await
                    .map_err(|err| storage_error_from_diesel(err, "Feature", name))?;
                    if updated == 0 {
                        return Err(StorageError::NotFound(
                            "Feature".to_owned(),
                            id.to_string(),
                        )
                        .into());
                    }
                    insert_value_tx(conn, &ValueLevel::Feature { feature_id: id }, value).await
                }
                .scope_boxed()
            })
            .await
            .map_err(StorageError::from)?;
        self.bump_global_version(v).await;
        Ok(())
    }

    /// Soft-deletes the feature and tombstones its feature-level value; the
    /// whole subtree underneath (catalog keys and params, deeper value
    /// rows) is hard-removed since the feature tombstone subsumes it.
    pub async fn delete_feature(&self, id: Uuid) -> Result<(), StorageError> {
        let mut conn = self.conn().await?;
        let v = conn
            .transaction(|conn| {
                async move {
                    let updated = diesel::update(
                        features::table
                            .filter(features::id.eq(id))
                            .filter(features::deleted_at.is_null()),
                    )
                    .set((
                        features::deleted_at.eq(diesel::dsl::now.nullable()),
                        features::updated_at.eq(diesel::dsl::now),
                    ))
                    .execute(conn)
                    .await
                    .map_err(PostgresError::from)?;
                    if updated == 0 {
                        return Err(StorageError::NotFound(
                            "Feature".to_owned(),
                            id.to_string(),
                        )
                        .into());
                    }
                    let v = delete_by_feature_tx(conn, id).await?;
                    diesel::delete(
                        activation_params::table.filter(activation_params::feature_id.eq(id)),
                    )
                    .execute(conn)
                    .await
                    .map_err(PostgresError::from)?;
                    diesel::delete(
                        activation_keys::table.filter(activation_keys::feature_id.eq(id)),
                    )
                    .execute(conn)
                    .await
                    .map_err(PostgresError::from)?;
                    Ok::<_, PostgresError>(v)
                }
                .scope_boxed()
            })
            .await
            .map_err(StorageError::from)?;
        self.bump_global_version(v).await;
        Ok(())
    }

    pub async fn list_features(&self) -> Result<Vec<FeatureListing>, StorageError> {
        let mut conn = self.conn().await?;
        let rows: Vec<(orm::Feature, Option<i32>, Option<i64>)> = features::table
            .left_join(
                activation_values::table.on(activation_values::feature_id
                    .eq(features::id)
                    .and(activation_values::activation_key_id.is_null())
                    .and(activation_values::deleted_at.is_null())),
            )
            .filter(features::deleted_at.is_null())
            .order(features::name.asc())
            .select((
                orm::Feature::as_select(),
                activation_values::value.nullable(),
                activation_values::v.nullable(),
            ))
            .load(&mut conn)
            .await
            .map_err(|err| StorageError::from(PostgresError::from(err)))?;
        Ok(rows
            .into_iter()
            .map(|(feature, value, v)| FeatureListing {
                feature: feature.into(),
                value: value.unwrap_or(PERCENT_UNSET),
                v: v.unwrap_or(0),
            })
            .collect())
    }

    pub async fn create_key(
        &self,
        feature_id: Uuid,
        name: &str,
        description: &str,
        value: i32,
    ) -> Result<Uuid, StorageError> {
        if name.trim().is_empty() {
            return Err(StorageError::InvalidInput("key name must not be empty".to_owned()));
        }
        let mut conn = self.conn().await?;
        let (id, v) = conn
            .transaction(|conn| {
                async move {
                    orm::Feature::by_id(feature_id, conn)
                        .await
                        .map_err(|err| {
                            storage_error_from_diesel(err, "Feature", &feature_id.to_string())
                        })?;

                    let restored: Option<Uuid> = diesel::update(
                        activation_keys::table
                            .filter(activation_keys::feature_id.eq(feature_id))
                            .filter(activation_keys::name.eq(name))
                            .filter(activation_keys::deleted_at.is_not_null()),
                    )
                    .set((
                        activation_keys::description.eq(description),
                        activation_keys::deleted_at.eq(None::<NaiveDateTime>),
                    ))
                    .returning(activation_keys::id)
                    .get_result(conn)
                    .await
                    .optional()
                    .map_err(PostgresError::from)?;

                    let id = match restored {
                        Some(id) => id,
                        None => diesel::insert_into(activation_keys::table)
                            .values(&orm::NewActivationKey {
                                id: Uuid::new_v4(),
                                feature_id,
                                name,
                                description,
                            })
                            .returning(activation_keys::id)
                            .get_result(conn)
                            .await
                            .map_err(|err| {
                                storage_error_from_diesel(err, "ActivationKey", name)
                            })?,
                    };
                    let v = insert_value_tx(
                        conn,
                        &ValueLevel::Key { feature_id, key_id: id },
                        value,
                    )
                    .await?;
                    Ok::<_, PostgresError>((id, v))
                }
                .scope_boxed()
            })
            .await
            .map_err(StorageError::from)?;
        self.bump_global_version(v).await;
        Ok(id)
    }

    pub async fn update_key(
        &self,
        key_id: Uuid,
        name: &str,
        description: &str,
        value: i32,
    ) -> Result<(), StorageError> {
        let mut conn = self.conn().await?;
        let v = conn
            .transaction(|conn| {
                async move {
                    let feature_id: Option<Uuid> = diesel::update(
                        activation_keys::table
                            .filter(activation_keys::id.eq(key_id))
                            .filter(activation_keys::deleted_at.is_null()),
                    )
                    .set((
                        activation_keys::name.eq(name),
                        activation_keys::description.eq(description),
                    ))
                    .returning(activation_keys::feature_id)
                    .get_result(conn)
                    .await
                    .optional()
                    .map_err(|err| storage_error_from_diesel(err, "ActivationKey", name))?;
                    let Some(feature_id) = feature_id else {
                        return Err(StorageError::NotFound(
                            "ActivationKey".to_owned(),
                            key_id.to_string(),
                        )
                        .into());
                    };
                    insert_value_tx(conn, &ValueLevel::Key { feature_id, key_id }, value).await
                }
                .scope_boxed()
            })
            .await
            .map_err(StorageError::from)?;
        self.bump_global_version(v).await;
        Ok(())
    }

    /// Soft-deletes the key and tombstones its key-level value; params under
    /// it are hard-removed (the key tombstone subsumes them).
    pub async fn delete_key(&self, key_id: Uuid) -> Result<(), StorageError> {
        let mut conn = self.conn().await?;
        let v = conn
            .transaction(|conn| {
                async move {
                    let updated = diesel::update(
                        activation_keys::table
                            .filter(activation_keys::id.eq(key_id))
                            .filter(activation_keys::deleted_at.is_null()),
                    )
                    .set(activation_keys::deleted_at.eq(diesel::dsl::now.nullable()))
                    .execute(conn)
                    .await
                    .map_err(PostgresError::from)?;
                    if updated == 0 {
                        return Err(StorageError::NotFound(
                            "ActivationKey".to_owned(),
                            key_id.to_string(),
                        )
                        .into());
                    }
                    let v = delete_by_key_tx(conn, key_id).await?;
                    diesel::delete(
                        activation_params::table
                            .filter(activation_params::activation_key_id.eq(key_id)),
                    )
                    .execute(conn)
                    .await
                    .map_err(PostgresError::from)?;
                    Ok::<_, PostgresError>(v)
                }
                .scope_boxed()
            })
            .await
            .map_err(StorageError::from)?;
        self.bump_global_version(v).await;
        Ok(())
    }

    pub async fn list_keys(&self, feature_id: Uuid) -> Result<Vec<KeyListing>, StorageError> {
        let mut conn = self.conn().await?;
        let rows: Vec<(orm::ActivationKey, Option<i32>)> = activation_keys::table
            .left_join(
                activation_values::table.on(activation_values::activation_key_id
                    .eq(activation_keys::id.nullable())
                    .and(activation_values::activation_param_id.is_null())
                    .and(activation_values::deleted_at.is_null())),
            )
            .filter(activation_keys::feature_id.eq(feature_id))
            .filter(activation_keys::deleted_at.is_null())
            .order(activation_keys::name.asc())
            .select((orm::ActivationKey::as_select(), activation_values::value.nullable()))
            .load(&mut conn)
            .await
            .map_err(|err| StorageError::from(PostgresError::from(err)))?;
        Ok(rows
            .into_iter()
            .map(|(key, value)| KeyListing { key: key.into(), value: value.unwrap_or(PERCENT_UNSET) })
            .collect())
    }

    pub async fn create_param(
        &self,
        key_id: Uuid,
        name: &str,
        value: i32,
    ) -> Result<Uuid, StorageError> {
        if name.trim().is_empty() {
            return Err(StorageError::InvalidInput("param name must not be empty".to_owned()));
        }
        let mut conn = self.conn().await?;
        let (id, v) = conn
            .transaction(|conn| {
                async move {
                    let key = orm::ActivationKey::by_id(key_id, conn)
                        .await
                        .map_err(|err| {
                            storage_error_from_diesel(err, "ActivationKey", &key_id.to_string())
                        })?;

                    let restored: Option<Uuid> = diesel::update(
                        activation_params::table
                            .filter(activation_params::activation_key_id.eq(key_id))
                            .filter(activation_params::name.eq(name))
                            .filter(activation_params::deleted_at.is_not_null()),
                    )
                    .set(activation_params::deleted_at.eq(None::<NaiveDateTime>))
                    .returning(activation_params::id)
                    .get_result(conn)
                    .await
                    .optional()
                    .map_err(PostgresError::from)?;

                    let id = match restored {
                        Some(id) => id,
                        None => diesel::insert_into(activation_params::table)
                            .values(&orm::NewActivationParam {
                                id: Uuid::new_v4(),
                                feature_id: key.feature_id,
                                activation_key_id: key_id,
                                name,
                            })
                            .returning(activation_params::id)
                            .get_result(conn)
                            .await
                            .map_err(|err| {
                                storage_error_from_diesel(err, "ActivationParam", name)
                            })?,
                    };
                    let v = insert_value_tx(
                        conn,
                        &ValueLevel::Param {
                            feature_id: key.feature_id,
                            key_id,
                            param_id: id,
                        },
                        value,
                    )
                    .await?;
                    Ok::<_, PostgresError>((id, v))
                }
                .scope_boxed()
            })
            .await
            .map_err(StorageError::from)?;
        self.bump_global_version(v).await;
        Ok(id)
    }

    pub async fn update_param(
        &self,
        param_id: Uuid,
        name: &str,
        value: i32,
    ) -> Result<(), StorageError> {
        let mut conn = self.conn().await?;
        let v = conn
            .transaction(|conn| {
                async move {
                    let target: Option<(Uuid, Uuid)> = diesel::update(
                        activation_params::table
                            .filter(activation_params::id.eq(param_id))
                            .filter(activation_params::deleted_at.is_null()),
                    )
                    .set(activation_params::name.eq(name))
                    .returning((
                        activation_params::feature_id,
                        activation_params::activation_key_id,
                    ))
                    .get_result(conn)
                    .await
                    .optional()
                    .map_err(|err| storage_error_from_diesel(err, "ActivationParam", name))?;
                    let Some((feature_id, key_id)) = target else {
                        return Err(StorageError::NotFound(
                            "ActivationParam".to_owned(),
                            param_id.to_string(),
                        )
                        .into());
                    };
                    insert_value_tx(
                        conn,
                        &ValueLevel::Param { feature_id, key_id, param_id },
                        value,
                    )
                    .await
                }
                .scope_boxed()
            })
            .await
            .map_err(StorageError::from)?;
        self.bump_global_version(v).await;
        Ok(())
    }

    pub async fn delete_param(&self, param_id: Uuid) -> Result<(), StorageError> {
        let mut conn = self.conn().await?;
        let v = conn
            .transaction(|conn| {
                async move {
                    let updated = diesel::update(
                        activation_params::table
                            .filter(activation_params::id.eq(param_id))
                            .filter(activation_params::deleted_at.is_null()),
                    )
                    .set(activation_params::deleted_at.eq(diesel::dsl::now.nullable()))
                    .execute(conn)
                    .await
                    .map_err(PostgresError::from)?;
                    if updated == 0 {
                        return Err(StorageError::NotFound(
                            "ActivationParam".to_owned(),
                            param_id.to_string(),
                        )
                        .into());
                    }
                    delete_by_param_tx(conn, param_id).await
                }
                .scope_boxed()
            })
            .await
            .map_err(StorageError::from)?;
        self.bump_global_version(v).await;
        Ok(())
    }

    pub async fn list_params(&self, key_id: Uuid) -> Result<Vec<ParamListing>, StorageError> {
        let mut conn = self.conn().await?;
        let rows: Vec<(orm::ActivationParam, Option<i32>)> = activation_params::table
            .left_join(
                activation_values::table.on(activation_values::activation_param_id
                    .eq(activation_params::id.nullable())
                    .and(activation_values::deleted_at.is_null())),
            )
            .filter(activation_params::activation_key_id.eq(key_id))
            .filter(activation_params::deleted_at.is_null())
            .order(activation_params::name.asc())
            .select((orm::ActivationParam::as_select(), activation_values::value.nullable()))
            .load(&mut conn)
            .await
            .map_err(|err| StorageError::from(PostgresError::from(err)))?;
        Ok(rows
            .into_iter()
            .map(|(param, value)| ParamListing {
                param: param.into(),
                value: value.unwrap_or(PERCENT_UNSET),
            })
            .collect())
    }

    pub async fn create_service(&self, name: &str) -> Result<Uuid, StorageError> {
        if name.trim().is_empty() {
            return Err(StorageError::InvalidInput("service name must not be empty".to_owned()));
        }
        let mut conn = self.conn().await?;
        diesel::insert_into(services::table)
            .values(&orm::NewService { id: Uuid::new_v4(), name })
            .returning(services::id)
            .get_result(&mut conn)
            .await
            .map_err(|err| storage_error_from_diesel(err, "Service", name).into())
    }

    pub async fn delete_service(&self, id: Uuid) -> Result<(), StorageError> {
        let mut conn = self.conn().await?;
        let deleted = diesel::delete(services::table.filter(services::id.eq(id)))
            .execute(&mut conn)
            .await
            .map_err(|err| StorageError::from(PostgresError::from(err)))?;
        if deleted == 0 {
            return Err(StorageError::NotFound("Service".to_owned(), id.to_string()));
        }
        Ok(())
    }

    pub async fn list_services(&self) -> Result<Vec<models::Service>, StorageError> {
        let mut conn = self.conn().await?;
        let rows = services::table
            .order(services::name.asc())
            .select(orm::Service::as_select())
            .load::<orm::Service>(&mut conn)
            .await
            .map_err(|err| StorageError::from(PostgresError::from(err)))?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Idempotent: granting twice is a no-op.
    pub async fn grant_access(
        &self,
        feature_id: Uuid,
        service_id: Uuid,
    ) -> Result<(), StorageError> {
        let mut conn = self.conn().await?;
        diesel::insert_into(service_access::table)
            .values(&orm::NewServiceAccess { id: Uuid::new_v4(), feature_id, service_id })
            .on_conflict((service_access::feature_id, service_access::service_id))
            .do_nothing()
            .execute(&mut conn)
            .await
            .map_err(|err| StorageError::from(PostgresError::from(err)))?;
        Ok(())
    }

    pub async fn revoke_access(
        &self,
        feature_id: Uuid,
        service_id: Uuid,
    ) -> Result<(), StorageError> {
        let mut conn = self.conn().await?;
        diesel::delete(
            service_access::table
                .filter(service_access::feature_id.eq(feature_id))
                .filter(service_access::service_id.eq(service_id)),
        )
        .execute(&mut conn)
        .await
        .map_err(|err| StorageError::from(PostgresError::from(err)))?;
        Ok(())
    }

    pub async fn services_by_feature(
        &self,
        feature_id: Uuid,
    ) -> Result<Vec<models::Service>, StorageError> {
        let mut conn = self.conn().await?;
        let rows = service_access::table
            .inner_join(services::table.on(services::id.eq(service_access::service_id)))
            .filter(service_access::feature_id.eq(feature_id))
            .order(services::name.asc())
            .select(orm::Service::as_select())
            .load::<orm::Service>(&mut conn)
            .await
            .map_err(|err| StorageError::from(PostgresError::from(err)))?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}
