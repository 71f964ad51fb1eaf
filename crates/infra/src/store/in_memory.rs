use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use deviceadm_core::{
    AuthId, AuthStatus, DeviceAuth, DeviceAuthFilter, DeviceAuthUpdate, DeviceId, NewDeviceAuth,
    TenantScope,
};

use super::r#trait::{DataStore, StoreError};
use super::{MissingDevicePolicy, database_name, migration_scopes};
use crate::migrate::{
    MigrationError, MigrationStep, MigrationTarget, Migrator, SchemaVersion, device_auth_steps,
};

#[derive(Debug, Default)]
struct Database {
    auths: BTreeMap<AuthId, DeviceAuth>,
    applied: Vec<SchemaVersion>,
}

/// In-memory, tenant-isolated auth set store.
///
/// Intended for tests/dev. Clones (and [`DataStore::with_automigrate`]) share
/// the same underlying data. A database exists once a migration recorded a
/// version in it; writes to any other scope are `NotFound`, like a missing
/// Postgres schema.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataStore {
    databases: Arc<RwLock<HashMap<TenantScope, Database>>>,
    automigrate: bool,
    missing_device: MissingDevicePolicy,
}

impl InMemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_missing_device_policy(mut self, policy: MissingDevicePolicy) -> Self {
        self.missing_device = policy;
        self
    }

    /// Schema versions recorded for `scope`, oldest first.
    pub fn applied_versions(&self, scope: &TenantScope) -> Vec<SchemaVersion> {
        self.read()
            .map(|dbs| dbs.get(scope).map(|db| db.applied.clone()).unwrap_or_default())
            .unwrap_or_default()
    }

    /// Every record of `scope`, sorted by id.
    pub fn snapshot(&self, scope: &TenantScope) -> Vec<DeviceAuth> {
        self.read()
            .map(|dbs| {
                dbs.get(scope)
                    .map(|db| db.auths.values().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<TenantScope, Database>>, StoreError> {
        self.databases
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<TenantScope, Database>>, StoreError> {
        self.databases
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }
}

#[async_trait]
impl DataStore for InMemoryDataStore {
    async fn get_device_auths(
        &self,
        scope: &TenantScope,
        skip: usize,
        limit: usize,
        filter: &DeviceAuthFilter,
    ) -> Result<Vec<DeviceAuth>, StoreError> {
        let dbs = self.read()?;
        let Some(db) = dbs.get(scope) else {
            return Ok(vec![]);
        };

        let take = if limit == 0 { usize::MAX } else { limit };
        Ok(db
            .auths
            .values()
            .filter(|d| filter.matches(d))
            .skip(skip)
            .take(take)
            .cloned()
            .collect())
    }

    async fn get_device_auth(
        &self,
        scope: &TenantScope,
        id: &AuthId,
    ) -> Result<DeviceAuth, StoreError> {
        let dbs = self.read()?;
        dbs.get(scope)
            .and_then(|db| db.auths.get(id))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn put_device_auth(
        &self,
        scope: &TenantScope,
        id: &AuthId,
        update: &DeviceAuthUpdate,
    ) -> Result<(), StoreError> {
        let mut dbs = self.write()?;
        let db = dbs.get_mut(scope).ok_or(StoreError::NotFound)?;
        let dev = db
            .auths
            .entry(id.clone())
            .or_insert_with(|| DeviceAuth::blank(id.clone()));
        update.apply_to(dev);
        Ok(())
    }

    async fn update_device_auth(
        &self,
        scope: &TenantScope,
        id: &AuthId,
        update: &DeviceAuthUpdate,
    ) -> Result<(), StoreError> {
        let mut dbs = self.write()?;
        let dev = dbs
            .get_mut(scope)
            .and_then(|db| db.auths.get_mut(id))
            .ok_or(StoreError::NotFound)?;
        update.apply_to(dev);
        Ok(())
    }

    async fn insert_device_auth(
        &self,
        scope: &TenantScope,
        dev: NewDeviceAuth,
    ) -> Result<DeviceAuth, StoreError> {
        let mut dbs = self.write()?;
        let db = dbs.get_mut(scope).ok_or(StoreError::NotFound)?;

        // Same guarantee as the partial unique index of the Postgres schema.
        if dev.status == AuthStatus::Preauthorized
            && db.auths.values().any(|d| {
                d.status == AuthStatus::Preauthorized && d.device_identity == dev.device_identity
            })
        {
            return Err(StoreError::Conflict(format!(
                "identity {:?} is already preauthorized",
                dev.device_identity
            )));
        }

        let dev = DeviceAuth::from_new(AuthId::new(), DeviceId::new(), dev);
        db.auths.insert(dev.id.clone(), dev.clone());
        Ok(dev)
    }

    async fn delete_device_auth(&self, scope: &TenantScope, id: &AuthId) -> Result<(), StoreError> {
        let mut dbs = self.write()?;
        dbs.get_mut(scope)
            .and_then(|db| db.auths.remove(id))
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }

    async fn delete_device_auths_by_device(
        &self,
        scope: &TenantScope,
        device_id: &DeviceId,
    ) -> Result<u64, StoreError> {
        let mut dbs = self.write()?;
        let removed = match dbs.get_mut(scope) {
            Some(db) => {
                let before = db.auths.len();
                db.auths.retain(|_, d| &d.device_id != device_id);
                (before - db.auths.len()) as u64
            }
            None => 0,
        };

        if removed == 0 && self.missing_device == MissingDevicePolicy::NotFound {
            return Err(StoreError::NotFound);
        }
        Ok(removed)
    }

    async fn get_device_auths_by_identity_data(
        &self,
        scope: &TenantScope,
        identity: &str,
    ) -> Result<Vec<DeviceAuth>, StoreError> {
        let dbs = self.read()?;
        Ok(dbs
            .get(scope)
            .map(|db| {
                db.auths
                    .values()
                    .filter(|d| d.device_identity == identity)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn migrate(&self, version: &SchemaVersion) -> Result<(), StoreError> {
        let existing: Vec<TenantScope> = self.read()?.keys().cloned().collect();
        for scope in migration_scopes(existing) {
            self.migrate_tenant(version, &scope).await?;
        }
        Ok(())
    }

    async fn migrate_tenant(
        &self,
        version: &SchemaVersion,
        scope: &TenantScope,
    ) -> Result<(), StoreError> {
        let target = InMemoryMigrationTarget {
            store: self,
            scope: scope.clone(),
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

/// Version bookkeeping for one in-memory database; steps have nothing to run.
struct InMemoryMigrationTarget<'a> {
    store: &'a InMemoryDataStore,
    scope: TenantScope,
    name: String,
}

impl InMemoryMigrationTarget<'_> {
    fn record(&self, version: SchemaVersion) -> Result<(), MigrationError> {
        let mut dbs = self
            .store
            .write()
            .map_err(|e| MigrationError::Storage(e.to_string()))?;
        let db = dbs.entry(self.scope.clone()).or_default();
        if !db.applied.contains(&version) {
            db.applied.push(version);
        }
        Ok(())
    }
}

#[async_trait]
impl MigrationTarget for InMemoryMigrationTarget<'_> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn applied_versions(&self) -> Result<Vec<SchemaVersion>, MigrationError> {
        Ok(self.store.applied_versions(&self.scope))
    }

    async fn apply_step(&self, step: &MigrationStep) -> Result<(), MigrationError> {
        self.record(step.version)
    }

    async fn record_version(&self, version: &SchemaVersion) -> Result<(), MigrationError> {
        self.record(*version)
    }
}
