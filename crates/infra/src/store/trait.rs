use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use deviceadm_core::{
    AuthId, DeviceAuth, DeviceAuthFilter, DeviceAuthUpdate, DeviceId, NewDeviceAuth, TenantScope,
};

use crate::migrate::{MigrationError, SchemaVersion};

/// Store operation error.
///
/// `NotFound` covers both a missing record and a tenant database that was never
/// provisioned.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,

    /// A uniqueness constraint rejected the write.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Migration(#[from] MigrationError),
}

/// Tenant-scoped auth set storage.
///
/// ## Merge semantics
///
/// `put_device_auth` and `update_device_auth` merge a [`DeviceAuthUpdate`] into
/// the stored record field by field; absent or empty fields never overwrite
/// stored values.
///
/// ## Identifiers
///
/// `insert_device_auth` mints both the auth set id and the device id. Inserting
/// a `preauthorized` record whose identity is already carried by another
/// `preauthorized` record fails with [`StoreError::Conflict`].
///
/// ## Unprovisioned tenants
///
/// A tenant database exists once it has been migrated (see
/// [`DataStore::migrate_tenant`]). Until then reads see it as empty, point
/// operations and writes report [`StoreError::NotFound`], and
/// `delete_device_auths_by_device` follows its [`MissingDevicePolicy`].
///
/// [`MissingDevicePolicy`]: super::MissingDevicePolicy
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Records matching `filter`, sorted by id. `limit == 0` means no limit.
    async fn get_device_auths(
        &self,
        scope: &TenantScope,
        skip: usize,
        limit: usize,
        filter: &DeviceAuthFilter,
    ) -> Result<Vec<DeviceAuth>, StoreError>;

    async fn get_device_auth(
        &self,
        scope: &TenantScope,
        id: &AuthId,
    ) -> Result<DeviceAuth, StoreError>;

    /// Upsert keyed by `id`.
    async fn put_device_auth(
        &self,
        scope: &TenantScope,
        id: &AuthId,
        update: &DeviceAuthUpdate,
    ) -> Result<(), StoreError>;

    /// Merge into an existing record; `NotFound` if there is none.
    async fn update_device_auth(
        &self,
        scope: &TenantScope,
        id: &AuthId,
        update: &DeviceAuthUpdate,
    ) -> Result<(), StoreError>;

    async fn insert_device_auth(
        &self,
        scope: &TenantScope,
        dev: NewDeviceAuth,
    ) -> Result<DeviceAuth, StoreError>;

    async fn delete_device_auth(&self, scope: &TenantScope, id: &AuthId) -> Result<(), StoreError>;

    /// Remove every record of a device, returning how many went away.
    ///
    /// Whether zero is `NotFound` is decided by the backend's
    /// [`MissingDevicePolicy`](super::MissingDevicePolicy).
    async fn delete_device_auths_by_device(
        &self,
        scope: &TenantScope,
        device_id: &DeviceId,
    ) -> Result<u64, StoreError>;

    async fn get_device_auths_by_identity_data(
        &self,
        scope: &TenantScope,
        identity: &str,
    ) -> Result<Vec<DeviceAuth>, StoreError>;

    /// Migrate every tenant database (or the default one) to `version`.
    async fn migrate(&self, version: &SchemaVersion) -> Result<(), StoreError>;

    async fn migrate_tenant(
        &self,
        version: &SchemaVersion,
        scope: &TenantScope,
    ) -> Result<(), StoreError>;

    /// Same backend, with automatic migration enabled.
    fn with_automigrate(&self) -> Self
    where
        Self: Sized;
}

#[async_trait]
impl<S> DataStore for Arc<S>
where
    S: DataStore,
{
    async fn get_device_auths(
        &self,
        scope: &TenantScope,
        skip: usize,
        limit: usize,
        filter: &DeviceAuthFilter,
    ) -> Result<Vec<DeviceAuth>, StoreError> {
        (**self).get_device_auths(scope, skip, limit, filter).await
    }

    async fn get_device_auth(
        &self,
        scope: &TenantScope,
        id: &AuthId,
    ) -> Result<DeviceAuth, StoreError> {
        (**self).get_device_auth(scope, id).await
    }

    async fn put_device_auth(
        &self,
        scope: &TenantScope,
        id: &AuthId,
        update: &DeviceAuthUpdate,
    ) -> Result<(), StoreError> {
        (**self).put_device_auth(scope, id, update).await
    }

    async fn update_device_auth(
        &self,
        scope: &TenantScope,
        id: &AuthId,
        update: &DeviceAuthUpdate,
    ) -> Result<(), StoreError> {
        (**self).update_device_auth(scope, id, update).await
    }

    async fn insert_device_auth(
        &self,
        scope: &TenantScope,
        dev: NewDeviceAuth,
    ) -> Result<DeviceAuth, StoreError> {
        (**self).insert_device_auth(scope, dev).await
    }

    async fn delete_device_auth(&self, scope: &TenantScope, id: &AuthId) -> Result<(), StoreError> {
        (**self).delete_device_auth(scope, id).await
    }

    async fn delete_device_auths_by_device(
        &self,
        scope: &TenantScope,
        device_id: &DeviceId,
    ) -> Result<u64, StoreError> {
        (**self).delete_device_auths_by_device(scope, device_id).await
    }

    async fn get_device_auths_by_identity_data(
        &self,
        scope: &TenantScope,
        identity: &str,
    ) -> Result<Vec<DeviceAuth>, StoreError> {
        (**self).get_device_auths_by_identity_data(scope, identity).await
    }

    async fn migrate(&self, version: &SchemaVersion) -> Result<(), StoreError> {
        (**self).migrate(version).await
    }

    async fn migrate_tenant(
        &self,
        version: &SchemaVersion,
        scope: &TenantScope,
    ) -> Result<(), StoreError> {
        (**self).migrate_tenant(version, scope).await
    }

    fn with_automigrate(&self) -> Self {
        Arc::new((**self).with_automigrate())
    }
}
