//! # Postgres based storage backend
//!
//! Catalog rows (features, keys, params, services) and the versioned
//! activation value table live here, together with the per-service delta
//! assembly query.
//!
//! ## Design Decisions
//!
//! ### Soft deletion
//!
//! Catalog rows and activation values are soft-deleted: `deleted_at` is
//! stamped and the row stays. This is what lets a re-created entity
//! resurrect its old row (and id) instead of allocating a new one, and what
//! lets the delta protocol announce removals as versioned tombstones.
//! Hard deletion is only applied to rows made unreachable by an ancestor's
//! removal. Deleting a feature announces one feature-level tombstone, so
//! key- and param-level rows underneath carry no information anymore and
//! are simply dropped.
//!
//! ### Versioning
//!
//! Every write to `activation_values` (inserts, restores and soft deletes
//! alike) allocates `v = max(v) + 1` inside the mutating transaction, so
//! `v` is strictly monotonic across the whole table. Subscribers remember
//! the highest `v` they have applied and ask for everything above it; a
//! soft delete getting a fresh `v` is what makes removals visible as
//! deltas.
//!
//! The global watermark (`max(v)`) is mirrored into the key-value cache
//! under `feature_version` after each commit. The cache value is a hint: a
//! lost or stale write is tolerated because every subsequent commit
//! overwrites it, and readers fall through to the store when it is absent.
//! What the hint buys is the hot path: when the cached watermark shows a
//! subscriber is current, delta assembly answers without issuing a single
//! query.
//!
//! ### Timestamps
//!
//! We use naive timestamps throughout and assume the server's local time is
//! UTC. Tests that build timestamps must create timezone-aware values and
//! convert to UTC before comparing against naive values.
//!
//! ### Atomic Transactions
//!
//! The building blocks in this module receive a connection reference which
//! can be a plain connection or one inside a transactional context. This
//! lets callers chain several operations (catalog write + value write) into
//! a single transaction. The public gateway methods own transaction
//! boundaries and bump the cached watermark only after commit.

use diesel::prelude::*;
use diesel_async::{
    pooled_connection::{
        deadpool::{Object, Pool},
        AsyncDieselConnectionManager,
    },
    AsyncPgConnection,
};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use flagcast_core::storage::{
    KeyValueCache, StorageError, FEATURE_VERSION_KEY, FEATURE_VERSION_TTL, VERSION_CHECK_PREFIX,
    VERSION_CHECK_TTL,
};
use std::sync::Arc;
use tracing::{info, warn};

mod activation;
mod catalog;
mod orm;
mod schema;

pub use catalog::{FeatureListing, KeyListing, ParamListing};

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations/");

#[derive(Debug)]
pub(crate) struct PostgresError(StorageError);

impl From<diesel::result::Error> for PostgresError {
    fn from(value: diesel::result::Error) -> Self {
        PostgresError(StorageError::Unexpected(format!("DieselError: {}", value)))
    }
}

impl From<PostgresError> for StorageError {
    fn from(value: PostgresError) -> Self {
        value.0
    }
}

impl From<StorageError> for PostgresError {
    fn from(value: StorageError) -> Self {
        PostgresError(value)
    }
}

pub(crate) fn storage_error_from_diesel(
    err: diesel::result::Error,
    entity: &str,
    id: &str,
) -> PostgresError {
    let err_string = err.to_string();
    match err {
        diesel::result::Error::DatabaseError(
            diesel::result::DatabaseErrorKind::UniqueViolation,
            _,
        ) => PostgresError(StorageError::DuplicateEntry(entity.to_owned(), id.to_owned())),
        diesel::result::Error::NotFound => {
            PostgresError(StorageError::NotFound(entity.to_owned(), id.to_owned()))
        }
        _ => PostgresError(StorageError::Unexpected(err_string)),
    }
}

/// Establishes a connection pool for the given database URL and brings the
/// schema up to date.
///
/// Migrations run on a separate synchronous connection before the pool is
/// handed out, so a freshly provisioned database is usable immediately.
pub async fn connect(db_url: &str) -> Result<Pool<AsyncPgConnection>, StorageError> {
    let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(db_url);
    let pool = Pool::builder(config)
        .build()
        .map_err(|err| StorageError::Unexpected(format!("{}", err)))?;
    run_migrations(db_url)?;
    Ok(pool)
}

fn run_migrations(db_url: &str) -> Result<(), StorageError> {
    info!("Upgrading database...");
    let mut conn = PgConnection::establish(db_url)
        .map_err(|err| StorageError::Unexpected(format!("{}", err)))?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|err| StorageError::Unexpected(format!("{}", err)))?;
    Ok(())
}

/// Gateway over the relational store plus the key-value hint cache.
///
/// All mutating operations open a transaction on a pooled connection, and
/// mirror the newly allocated version into the cache after commit. Reads of
/// the delta path consult the cache first and skip the store entirely when
/// the subscriber is already current.
#[derive(Clone)]
pub struct PostgresGateway {
    pool: Pool<AsyncPgConnection>,
    cache: Arc<dyn KeyValueCache>,
}

impl PostgresGateway {
    pub fn new(pool: Pool<AsyncPgConnection>, cache: Arc<dyn KeyValueCache>) -> Self {
        Self { pool, cache }
    }

    pub(crate) async fn conn(&self) -> Result<Object<AsyncPgConnection>, StorageError> {
        self.pool
            .get()
            .await
            .map_err(|err| StorageError::Unexpected(format!("{}", err)))
    }

    /// Mirrors a freshly committed version into the cache. Failures are
    /// logged and swallowed; the cache is a hint and the next successful
    /// write converges it.
    pub(crate) async fn bump_global_version(&self, v: i64) {
        if let Err(err) = self
            .cache
            .set(FEATURE_VERSION_KEY, &v.to_string(), FEATURE_VERSION_TTL)
            .await
        {
            warn!(version = v, %err, "failed to bump cached global version");
        }
    }

    pub(crate) async fn cached_global_version(&self) -> Option<i64> {
        match self.cache.get(FEATURE_VERSION_KEY).await {
            Ok(Some(raw)) => match raw.parse::<i64>() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(%raw, "cached global version is not an integer, ignoring");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!(%err, "failed to read cached global version");
                None
            }
        }
    }

    /// Remembers the watermark a service last caught up to. Best effort.
    pub(crate) async fn touch_version_check(&self, service_name: &str, version: i64) {
        let key = format!("{VERSION_CHECK_PREFIX}{service_name}");
        if let Err(err) = self
            .cache
            .set(&key, &version.to_string(), VERSION_CHECK_TTL)
            .await
        {
            warn!(service_name, %err, "failed to record per-service check mark");
        }
    }
}

pub mod db_fixtures {
    //! # General Purpose Fixtures for Database State Modification
    //!
    //! Minimal building blocks for setting up catalog and value rows in
    //! tests without going through application code, so that a bug in an
    //! insertion path cannot silently corrupt the setup of unrelated tests.
    use diesel::prelude::*;
    use diesel_async::{AsyncPgConnection, RunQueryDsl};
    use uuid::Uuid;

    use super::schema;

    pub async fn insert_feature(conn: &mut AsyncPgConnection, name: &str) -> Uuid {
        diesel::insert_into(schema::features::table)
            .values((
                schema::features::name.eq(name),
                schema::features::description.eq(format!("{name} fixture")),
            ))
            .returning(schema::features::id)
            .get_result(conn)
            .await
            .unwrap()
    }

    pub async fn insert_key(conn: &mut AsyncPgConnection, feature_id: Uuid, name: &str) -> Uuid {
        diesel::insert_into(schema::activation_keys::table)
            .values((
                schema::activation_keys::feature_id.eq(feature_id),
                schema::activation_keys::name.eq(name),
                schema::activation_keys::description.eq(""),
            ))
            .returning(schema::activation_keys::id)
            .get_result(conn)
            .await
            .unwrap()
    }

    pub async fn insert_param(
        conn: &mut AsyncPgConnection,
        feature_id: Uuid,
        key_id: Uuid,
        name: &str,
    ) -> Uuid {
        diesel::insert_into(schema::activation_params::table)
            .values((
                schema::activation_params::feature_id.eq(feature_id),
                schema::activation_params::activation_key_id.eq(key_id),
                schema::activation_params::name.eq(name),
            ))
            .returning(schema::activation_params::id)
            .get_result(conn)
            .await
            .unwrap()
    }

    pub async fn insert_service(conn: &mut AsyncPgConnection, name: &str) -> Uuid {
        diesel::insert_into(schema::services::table)
            .values(schema::services::name.eq(name))
            .returning(schema::services::id)
            .get_result(conn)
            .await
            .unwrap()
    }

    pub async fn grant_access(conn: &mut AsyncPgConnection, feature_id: Uuid, service_id: Uuid) {
        diesel::insert_into(schema::service_access::table)
            .values((
                schema::service_access::feature_id.eq(feature_id),
                schema::service_access::service_id.eq(service_id),
            ))
            .execute(conn)
            .await
            .unwrap();
    }
}
