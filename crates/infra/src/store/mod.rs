//! Auth set persistence boundary.
//!
//! Records live in one database per tenant (`deviceadm` for the default scope,
//! `deviceadm-<tenant>` otherwise). The [`DataStore`] trait is the only way the
//! admission engine touches them.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

use deviceadm_core::TenantScope;

pub use in_memory::InMemoryDataStore;
pub use postgres::{PostgresConfig, PostgresDataStore};
pub use r#trait::{DataStore, StoreError};

/// Name of the default (non-tenant) database.
pub const DB_NAME: &str = "deviceadm";

/// What `delete_device_auths_by_device` reports when nothing matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingDevicePolicy {
    /// Zero removed records is a `NotFound`.
    #[default]
    NotFound,
    /// Zero removed records is a successful no-op.
    Idempotent,
}

/// Database holding the records of `scope`.
pub fn database_name(scope: &TenantScope) -> String {
    match scope {
        TenantScope::Default => DB_NAME.to_string(),
        TenantScope::Tenant(tenant) => format!("{DB_NAME}-{tenant}"),
    }
}

/// Inverse of [`database_name`]; `None` for databases that are not ours.
pub fn scope_from_database_name(name: &str) -> Option<TenantScope> {
    if name == DB_NAME {
        return Some(TenantScope::Default);
    }
    let tenant = name.strip_prefix(DB_NAME)?.strip_prefix('-')?;
    tenant.parse().ok().map(TenantScope::Tenant)
}

/// Databases to migrate: every tenant database, or the default one when the
/// deployment has no tenants.
pub fn migration_scopes<I>(existing: I) -> Vec<TenantScope>
where
    I: IntoIterator<Item = TenantScope>,
{
    let mut tenants: Vec<TenantScope> = existing
        .into_iter()
        .filter(|s| matches!(s, TenantScope::Tenant(_)))
        .collect();
    tenants.sort();
    tenants.dedup();

    if tenants.is_empty() {
        vec![TenantScope::Default]
    } else {
        tenants
    }
}
