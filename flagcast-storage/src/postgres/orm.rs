use super::schema::{
    activation_keys, activation_params, activation_values, features, service_access, services,
};
use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use flagcast_core::models::{self, ValueLevel};
use flagcast_core::storage::StorageError;
use uuid::Uuid;

#[derive(Identifiable, Queryable, Selectable, Debug, Clone, PartialEq)]
#[diesel(table_name = features)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Feature {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub deleted_at: Option<NaiveDateTime>,
}

impl Feature {
    pub async fn by_id(id: Uuid, conn: &mut AsyncPgConnection) -> QueryResult<Feature> {
        features::table
            .filter(features::id.eq(id))
            .filter(features::deleted_at.is_null())
            .select(Feature::as_select())
            .first::<Feature>(conn)
            .await
    }

    pub async fn by_name(name: &str, conn: &mut AsyncPgConnection) -> QueryResult<Option<Feature>> {
        features::table
            .filter(features::name.eq(name))
            .filter(features::deleted_at.is_null())
            .select(Feature::as_select())
            .first::<Feature>(conn)
            .await
            .optional()
    }
}

impl From<Feature> for models::Feature {
    fn from(value: Feature) -> Self {
        models::Feature {
            id: value.id,
            name: value.name,
            description: value.description,
            created_at: value.created_at,
            updated_at: value.updated_at,
            deleted_at: value.deleted_at,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = features)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct NewFeature<'a> {
    pub id: Uuid,
    pub name: &'a str,
    pub description: &'a str,
}

#[derive(Identifiable, Queryable, Associations, Selectable, Debug, Clone, PartialEq)]
#[diesel(belongs_to(Feature))]
#[diesel(table_name = activation_keys)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ActivationKey {
    pub id: Uuid,
    pub feature_id: Uuid,
    pub name: String,
    pub description: String,
    pub deleted_at: Option<NaiveDateTime>,
}

impl ActivationKey {
    pub async fn by_id(id: Uuid, conn: &mut AsyncPgConnection) -> QueryResult<ActivationKey> {
        activation_keys::table
            .filter(activation_keys::id.eq(id))
            .filter(activation_keys::deleted_at.is_null())
            .select(ActivationKey::as_select())
            .first::<ActivationKey>(conn)
            .await
    }
}

impl From<ActivationKey> for models::ActivationKey {
    fn from(value: ActivationKey) -> Self {
        models::ActivationKey {
            id: value.id,
            feature_id: value.feature_id,
            name: value.name,
            description: value.description,
            deleted_at: value.deleted_at,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = activation_keys)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct NewActivationKey<'a> {
    pub id: Uuid,
    pub feature_id: Uuid,
    pub name: &'a str,
    pub description: &'a str,
}

#[derive(Identifiable, Queryable, Associations, Selectable, Debug, Clone, PartialEq)]
#[diesel(belongs_to(ActivationKey))]
#[diesel(table_name = activation_params)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ActivationParam {
    pub id: Uuid,
    pub feature_id: Uuid,
    pub activation_key_id: Uuid,
    pub name: String,
    pub deleted_at: Option<NaiveDateTime>,
}

impl ActivationParam {
    pub async fn by_id(id: Uuid, conn: &mut AsyncPgConnection) -> QueryResult<ActivationParam> {
        activation_params::table
            .filter(activation_params::id.eq(id))
            .filter(activation_params::deleted_at.is_null())
            .select(ActivationParam::as_select())
            .first::<ActivationParam>(conn)
            .await
    }
}

impl From<ActivationParam> for models::ActivationParam {
    fn from(value: ActivationParam) -> Self {
        models::ActivationParam {
            id: value.id,
            feature_id: value.feature_id,
            key_id: value.activation_key_id,
            name: value.name,
            deleted_at: value.deleted_at,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = activation_params)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct NewActivationParam<'a> {
    pub id: Uuid,
    pub feature_id: Uuid,
    pub activation_key_id: Uuid,
    pub name: &'a str,
}

#[derive(Identifiable, Queryable, Selectable, Debug, Clone, PartialEq)]
#[diesel(table_name = activation_values)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ActivationValue {
    pub id: Uuid,
    pub feature_id: Uuid,
    pub activation_key_id: Option<Uuid>,
    pub activation_param_id: Option<Uuid>,
    pub value: i32,
    pub v: i64,
    pub deleted_at: Option<NaiveDateTime>,
}

impl ActivationValue {
    /// The authoritative watermark: the highest version ever allocated, or 0
    /// on an empty table.
    pub async fn max_version(conn: &mut AsyncPgConnection) -> QueryResult<i64> {
        activation_values::table
            .select(diesel::dsl::max(activation_values::v))
            .get_result::<Option<i64>>(conn)
            .await
            .map(|v| v.unwrap_or(0))
    }
}

impl TryFrom<ActivationValue> for models::ActivationValue {
    type Error = StorageError;

    fn try_from(row: ActivationValue) -> Result<Self, Self::Error> {
        let feature_id = row.feature_id;
        let level = match (row.activation_key_id, row.activation_param_id) {
            (None, None) => ValueLevel::Feature { feature_id },
            (Some(key_id), None) => ValueLevel::Key { feature_id, key_id },
            (Some(key_id), Some(param_id)) => ValueLevel::Param { feature_id, key_id, param_id },
            (None, Some(param_id)) => {
                return Err(StorageError::Unexpected(format!(
                    "activation value {} references param {} without its key",
                    row.id, param_id
                )))
            }
        };
        Ok(models::ActivationValue {
            id: row.id,
            level,
            value: row.value,
            v: row.v,
            deleted_at: row.deleted_at,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = activation_values)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct NewActivationValue {
    pub id: Uuid,
    pub feature_id: Uuid,
    pub activation_key_id: Option<Uuid>,
    pub activation_param_id: Option<Uuid>,
    pub value: i32,
    pub v: i64,
}

#[derive(Identifiable, Queryable, Selectable, Debug, Clone, PartialEq)]
#[diesel(table_name = services)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Service {
    pub id: Uuid,
    pub name: String,
}

impl From<Service> for models::Service {
    fn from(value: Service) -> Self {
        models::Service { id: value.id, name: value.name }
    }
}

#[derive(Insertable)]
#[diesel(table_name = services)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct NewService<'a> {
    pub id: Uuid,
    pub name: &'a str,
}

#[derive(Identifiable, Queryable, Selectable, Debug, Clone, PartialEq)]
#[diesel(table_name = service_access)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ServiceAccess {
    pub id: Uuid,
    pub feature_id: Uuid,
    pub service_id: Uuid,
}

#[derive(Insertable)]
#[diesel(table_name = service_access)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct NewServiceAccess {
    pub id: Uuid,
    pub feature_id: Uuid,
    pub service_id: Uuid,
}
