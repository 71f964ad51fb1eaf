//! Postgres-backed auth set store.
//!
//! Each tenant gets its own schema (`"deviceadm"` for the default scope,
//! `"deviceadm-<tenant>"` otherwise) holding a `device_auths` table and a
//! `migration_info` table with the applied schema versions.
//!
//! ## Error Mapping
//!
//! | PostgreSQL Error Code | StoreError | Scenario |
//! |-----------------------|------------|----------|
//! | `23505` | `Conflict` | Second preauthorized auth set for the same identity |
//! | `42P01` / `3F000` | `NotFound` | Tenant schema was never provisioned |
//! | Any other | `Storage` | Connection failures, syntax errors, etc. |

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow, PgSslMode};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{info, instrument};

use deviceadm_core::{
    AuthId, AuthStatus, DeviceAttributes, DeviceAuth, DeviceAuthFilter, DeviceAuthUpdate,
    DeviceId, NewDeviceAuth, TenantScope,
};

use super::r#trait::{DataStore, StoreError};
use super::{MissingDevicePolicy, DB_NAME, database_name, migration_scopes, scope_from_database_name};
use crate::migrate::{
    MigrationError, MigrationStep, MigrationTarget, Migrator, SchemaVersion, device_auth_steps,
};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection settings. Explicit credentials and TLS flags override whatever
/// the URL carries.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: bool,
    pub tls_skip_verify: bool,
    pub connect_timeout: Duration,
    pub max_connections: u32,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost:5432/deviceadm".to_string(),
            username: None,
            password: None,
            tls: false,
            tls_skip_verify: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_connections: 10,
        }
    }
}

impl PostgresConfig {
    fn connect_options(&self) -> Result<PgConnectOptions, StoreError> {
        let mut opts = PgConnectOptions::from_str(&self.url)
            .map_err(|e| StoreError::Storage(format!("invalid database url: {e}")))?;

        if let Some(username) = self.username.as_deref().filter(|u| !u.is_empty()) {
            opts = opts.username(username);
        }
        if let Some(password) = self.password.as_deref().filter(|p| !p.is_empty()) {
            opts = opts.password(password);
        }
        if self.tls {
            opts = opts.ssl_mode(if self.tls_skip_verify {
                PgSslMode::Require
            } else {
                PgSslMode::VerifyFull
            });
        }
        Ok(opts)
    }
}

/// Postgres-backed [`DataStore`].
///
/// Uses the SQLx connection pool, which is `Send + Sync`; clones share it.
#[derive(Debug, Clone)]
pub struct PostgresDataStore {
    pool: Arc<PgPool>,
    automigrate: bool,
    missing_device: MissingDevicePolicy,
}

impl PostgresDataStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            automigrate: false,
            missing_device: MissingDevicePolicy::default(),
        }
    }

    /// Open a pool and make sure the server answers.
    #[instrument(skip(config), fields(max_connections = config.max_connections), err)]
    pub async fn connect(config: &PostgresConfig) -> Result<Self, StoreError> {
        let timeout = if config.connect_timeout.is_zero() {
            DEFAULT_CONNECT_TIMEOUT
        } else {
            config.connect_timeout
        };

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(timeout)
            .connect_with(config.connect_options()?)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| map_sqlx_error("ping", e))?;

        Ok(Self::new(pool))
    }

    pub fn with_missing_device_policy(mut self, policy: MissingDevicePolicy) -> Self {
        self.missing_device = policy;
        self
    }

    fn table(scope: &TenantScope) -> String {
        format!("{}.device_auths", quote_ident(&database_name(scope)))
    }

    /// Schemas that belong to this service.
    async fn existing_scopes(&self) -> Result<Vec<TenantScope>, StoreError> {
        let rows = sqlx::query(
            "SELECT schema_name FROM information_schema.schemata WHERE schema_name LIKE $1",
        )
        .bind(format!("{DB_NAME}%"))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("existing_scopes", e))?;

        let mut scopes = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row
                .try_get("schema_name")
                .map_err(|e| map_sqlx_error("existing_scopes", e))?;
            scopes.extend(scope_from_database_name(&name));
        }
        Ok(scopes)
    }
}

#[async_trait]
impl DataStore for PostgresDataStore {
    #[instrument(skip(self, filter), fields(scope = %scope), err)]
    async fn get_device_auths(
        &self,
        scope: &TenantScope,
        skip: usize,
        limit: usize,
        filter: &DeviceAuthFilter,
    ) -> Result<Vec<DeviceAuth>, StoreError> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {COLUMNS} FROM {} WHERE TRUE",
            Self::table(scope)
        ));
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(device_id) = &filter.device_id {
            qb.push(" AND device_id = ").push_bind(device_id.as_str().to_string());
        }
        qb.push(" ORDER BY id OFFSET ").push_bind(i64::try_from(skip).unwrap_or(i64::MAX));
        if limit > 0 {
            qb.push(" LIMIT ").push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let rows = match qb.build().fetch_all(&*self.pool).await {
            Ok(rows) => rows,
            Err(e) => match map_sqlx_error("get_device_auths", e) {
                StoreError::NotFound => return Ok(vec![]),
                other => return Err(other),
            },
        };
        rows_to_records(&rows)
    }

    #[instrument(skip(self), fields(scope = %scope, auth_id = %id), err)]
    async fn get_device_auth(
        &self,
        scope: &TenantScope,
        id: &AuthId,
    ) -> Result<DeviceAuth, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM {} WHERE id = $1",
            Self::table(scope)
        ))
        .bind(id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_device_auth", e))?
        .ok_or(StoreError::NotFound)?;

        DeviceAuthRow::from_row(&row)?.try_into()
    }

    #[instrument(skip(self, update), fields(scope = %scope, auth_id = %id), err)]
    async fn put_device_auth(
        &self,
        scope: &TenantScope,
        id: &AuthId,
        update: &DeviceAuthUpdate,
    ) -> Result<(), StoreError> {
        let update = UpdateBinds::new(update)?;
        sqlx::query(&format!(
            r#"
            INSERT INTO {table} AS d
                (id, device_id, device_identity, key, attributes, status, request_time)
            VALUES (
                $1,
                COALESCE($2, ''),
                COALESCE($3, ''),
                COALESCE($4, ''),
                COALESCE($5, '{{}}'::jsonb),
                COALESCE($6, 'pending'),
                $7
            )
            ON CONFLICT (id) DO UPDATE SET
                device_id       = COALESCE($2, d.device_id),
                device_identity = COALESCE($3, d.device_identity),
                key             = COALESCE($4, d.key),
                attributes      = COALESCE($5, d.attributes),
                status          = COALESCE($6, d.status),
                request_time    = COALESCE($7, d.request_time)
            "#,
            table = Self::table(scope)
        ))
        .bind(id.as_str())
        .bind(update.device_id)
        .bind(update.device_identity)
        .bind(update.key)
        .bind(update.attributes)
        .bind(update.status)
        .bind(update.request_time)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("put_device_auth", e))?;
        Ok(())
    }

    #[instrument(skip(self, update), fields(scope = %scope, auth_id = %id), err)]
    async fn update_device_auth(
        &self,
        scope: &TenantScope,
        id: &AuthId,
        update: &DeviceAuthUpdate,
    ) -> Result<(), StoreError> {
        let update = UpdateBinds::new(update)?;
        let result = sqlx::query(&format!(
            r#"
            UPDATE {} SET
                device_id       = COALESCE($2, device_id),
                device_identity = COALESCE($3, device_identity),
                key             = COALESCE($4, key),
                attributes      = COALESCE($5, attributes),
                status          = COALESCE($6, status),
                request_time    = COALESCE($7, request_time)
            WHERE id = $1
            "#,
            Self::table(scope)
        ))
        .bind(id.as_str())
        .bind(update.device_id)
        .bind(update.device_identity)
        .bind(update.key)
        .bind(update.attributes)
        .bind(update.status)
        .bind(update.request_time)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_device_auth", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    #[instrument(skip(self, dev), fields(scope = %scope, status = %dev.status), err)]
    async fn insert_device_auth(
        &self,
        scope: &TenantScope,
        dev: NewDeviceAuth,
    ) -> Result<DeviceAuth, StoreError> {
        let dev = DeviceAuth::from_new(AuthId::new(), DeviceId::new(), dev);
        let attributes = serde_json::to_value(&dev.attributes)
            .map_err(|e| StoreError::Storage(format!("failed to encode attributes: {e}")))?;

        sqlx::query(&format!(
            r#"
            INSERT INTO {}
                (id, device_id, device_identity, key, attributes, status, request_time)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
            Self::table(scope)
        ))
        .bind(dev.id.as_str())
        .bind(dev.device_id.as_str())
        .bind(&dev.device_identity)
        .bind(&dev.key)
        .bind(attributes)
        .bind(dev.status.as_str())
        .bind(dev.request_time)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_device_auth", e))?;

        Ok(dev)
    }

    #[instrument(skip(self), fields(scope = %scope, auth_id = %id), err)]
    async fn delete_device_auth(&self, scope: &TenantScope, id: &AuthId) -> Result<(), StoreError> {
        let result = sqlx::query(&format!("DELETE FROM {} WHERE id = $1", Self::table(scope)))
            .bind(id.as_str())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_device_auth", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    #[instrument(skip(self), fields(scope = %scope, device_id = %device_id), err)]
    async fn delete_device_auths_by_device(
        &self,
        scope: &TenantScope,
        device_id: &DeviceId,
    ) -> Result<u64, StoreError> {
        let removed = match sqlx::query(&format!(
            "DELETE FROM {} WHERE device_id = $1",
            Self::table(scope)
        ))
        .bind(device_id.as_str())
        .execute(&*self.pool)
        .await
        {
            Ok(result) => result.rows_affected(),
            Err(e) => match map_sqlx_error("delete_device_auths_by_device", e) {
                StoreError::NotFound => 0,
                other => return Err(other),
            },
        };

        if removed == 0 && self.missing_device == MissingDevicePolicy::NotFound {
            return Err(StoreError::NotFound);
        }
        Ok(removed)
    }

    #[instrument(skip(self, identity), fields(scope = %scope), err)]
    async fn get_device_auths_by_identity_data(
        &self,
        scope: &TenantScope,
        identity: &str,
    ) -> Result<Vec<DeviceAuth>, StoreError> {
        let rows = match sqlx::query(&format!(
            "SELECT {COLUMNS} FROM {} WHERE device_identity = $1 ORDER BY id",
            Self::table(scope)
        ))
        .bind(identity)
        .fetch_all(&*self.pool)
        .await
        {
            Ok(rows) => rows,
            Err(e) => match map_sqlx_error("get_device_auths_by_identity_data", e) {
                StoreError::NotFound => return Ok(vec![]),
                other => return Err(other),
            },
        };
        rows_to_records(&rows)
    }

    #[instrument(skip(self), fields(version = %version, automigrate = self.automigrate), err)]
    async fn migrate(&self, version: &SchemaVersion) -> Result<(), StoreError> {
        let scopes = migration_scopes(self.existing_scopes().await?);
        info!(databases = scopes.len(), "migrating databases");
        for scope in scopes {
            self.migrate_tenant(version, &scope).await?;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(version = %version, scope = %scope), err)]
    async fn migrate_tenant(
        &self,
        version: &SchemaVersion,
        scope: &TenantScope,
    ) -> Result<(), StoreError> {
        let target = PgMigrationTarget {
            pool: &self.pool,
            name: database_name(scope),
        };
        Migrator::new(self.automigrate)
            .apply(&target, version, &device_auth_steps())
            .await?;
        Ok(())
    }

    fn with_automigrate(&self) -> Self {
        Self {
            automigrate: true,
            ..self.clone()
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Migrations
// ─────────────────────────────────────────────────────────────────────────────

struct PgMigrationTarget<'a> {
    pool: &'a PgPool,
    name: String,
}

impl PgMigrationTarget<'_> {
    fn schema(&self) -> String {
        quote_ident(&self.name)
    }

    fn storage_error(&self, operation: &str, err: sqlx::Error) -> MigrationError {
        MigrationError::Storage(format!("{operation} on {}: {err}", self.name))
    }

    /// Run `statements` and record `version` in one transaction.
    async fn run(&self, version: &SchemaVersion, statements: &[&str]) -> Result<(), MigrationError> {
        let schema = self.schema();
        let step_failed = |err: sqlx::Error| MigrationError::StepFailed {
            db: self.name.clone(),
            version: *version,
            reason: err.to_string(),
        };

        let mut tx = self.pool.begin().await.map_err(|e| self.storage_error("begin", e))?;

        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {schema}"))
            .execute(&mut *tx)
            .await
            .map_err(step_failed)?;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {schema}.migration_info (
                version    TEXT PRIMARY KEY,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )"
        ))
        .execute(&mut *tx)
        .await
        .map_err(step_failed)?;

        for statement in statements {
            sqlx::query(&statement.replace("{schema}", &schema))
                .execute(&mut *tx)
                .await
                .map_err(step_failed)?;
        }

        sqlx::query(&format!(
            "INSERT INTO {schema}.migration_info (version) VALUES ($1) ON CONFLICT DO NOTHING"
        ))
        .bind(version.to_string())
        .execute(&mut *tx)
        .await
        .map_err(step_failed)?;

        tx.commit().await.map_err(|e| self.storage_error("commit", e))
    }
}

#[async_trait]
impl MigrationTarget for PgMigrationTarget<'_> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn applied_versions(&self) -> Result<Vec<SchemaVersion>, MigrationError> {
        let rows = match sqlx::query(&format!(
            "SELECT version FROM {}.migration_info",
            self.schema()
        ))
        .fetch_all(self.pool)
        .await
        {
            Ok(rows) => rows,
            Err(e) if is_undefined_object(&e) => return Ok(vec![]),
            Err(e) => return Err(self.storage_error("applied_versions", e)),
        };

        rows.iter()
            .map(|row| {
                let version: String = row
                    .try_get("version")
                    .map_err(|e| self.storage_error("applied_versions", e))?;
                version.parse()
            })
            .collect()
    }

    async fn apply_step(&self, step: &MigrationStep) -> Result<(), MigrationError> {
        self.run(&step.version, step.statements).await
    }

    async fn record_version(&self, version: &SchemaVersion) -> Result<(), MigrationError> {
        self.run(version, &[]).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Rows
// ─────────────────────────────────────────────────────────────────────────────

const COLUMNS: &str = "id, device_id, device_identity, key, attributes, status, request_time";

struct DeviceAuthRow {
    id: String,
    device_id: String,
    device_identity: String,
    key: String,
    attributes: serde_json::Value,
    status: String,
    request_time: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for DeviceAuthRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(DeviceAuthRow {
            id: row.try_get("id")?,
            device_id: row.try_get("device_id")?,
            device_identity: row.try_get("device_identity")?,
            key: row.try_get("key")?,
            attributes: row.try_get("attributes")?,
            status: row.try_get("status")?,
            request_time: row.try_get("request_time")?,
        })
    }
}

impl DeviceAuthRow {
    fn from_row(row: &PgRow) -> Result<Self, StoreError> {
        <Self as sqlx::FromRow<PgRow>>::from_row(row)
            .map_err(|e| StoreError::Storage(format!("failed to decode device_auths row: {e}")))
    }
}

impl TryFrom<DeviceAuthRow> for DeviceAuth {
    type Error = StoreError;

    fn try_from(row: DeviceAuthRow) -> Result<Self, Self::Error> {
        let status = AuthStatus::from_str(&row.status)
            .map_err(|e| StoreError::Storage(format!("auth set {}: {e}", row.id)))?;
        let attributes: DeviceAttributes = serde_json::from_value(row.attributes)
            .map_err(|e| StoreError::Storage(format!("auth set {}: bad attributes: {e}", row.id)))?;

        Ok(DeviceAuth {
            id: AuthId::from(row.id),
            device_id: DeviceId::from(row.device_id),
            device_identity: row.device_identity,
            key: row.key,
            attributes,
            status,
            request_time: row.request_time,
        })
    }
}

fn rows_to_records(rows: &[PgRow]) -> Result<Vec<DeviceAuth>, StoreError> {
    rows.iter()
        .map(|row| DeviceAuth::try_from(DeviceAuthRow::from_row(row)?))
        .collect()
}

/// Bind values of a normalized [`DeviceAuthUpdate`]; `None` keeps the column.
struct UpdateBinds {
    device_id: Option<String>,
    device_identity: Option<String>,
    key: Option<String>,
    attributes: Option<serde_json::Value>,
    status: Option<&'static str>,
    request_time: Option<DateTime<Utc>>,
}

impl UpdateBinds {
    fn new(update: &DeviceAuthUpdate) -> Result<Self, StoreError> {
        let update = update.clone().normalized();
        let attributes = update
            .attributes
            .map(|a| serde_json::to_value(&a))
            .transpose()
            .map_err(|e| StoreError::Storage(format!("failed to encode attributes: {e}")))?;

        Ok(Self {
            device_id: update.device_id.map(String::from),
            device_identity: update.device_identity,
            key: update.key,
            attributes,
            status: update.status.map(|s| s.as_str()),
            request_time: update.request_time,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Double-quote a schema name. Tenant ids are restricted to `[A-Za-z0-9_-]`,
/// the escaping only matters for names that did not come through `TenantId`.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn is_undefined_object(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err)
            if matches!(db_err.code().as_deref(), Some("42P01") | Some("3F000"))
    )
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    if is_undefined_object(&err) {
        return StoreError::NotFound;
    }
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Unique violation
                Some("23505") => StoreError::Conflict(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Storage(format!("timed out waiting for a connection in {}", operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
