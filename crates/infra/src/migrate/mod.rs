//! Per-tenant schema versioning.
//!
//! Every tenant database records which schema versions have been applied to it.
//! The [`Migrator`] compares that history with the version the service expects
//! and either upgrades the database step by step (automigrate on) or refuses to
//! run against an out-of-date schema (automigrate off).
//!
//! Steps must be idempotent: a step interrupted before its version was recorded
//! is simply applied again on the next run.

pub mod steps;
pub mod version;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, instrument, warn};

pub use steps::{DB_VERSION, device_auth_steps};
pub use version::SchemaVersion;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("invalid schema version: {0:?}")]
    InvalidVersion(String),

    #[error("database {db} needs migration: has version {current}, needs version {target}")]
    NeedsMigration {
        db: String,
        current: SchemaVersion,
        target: SchemaVersion,
    },

    #[error("database {db} has version {current}, newer than the supported version {target}")]
    Incompatible {
        db: String,
        current: SchemaVersion,
        target: SchemaVersion,
    },

    #[error("migration of {db} to {version} failed: {reason}")]
    StepFailed {
        db: String,
        version: SchemaVersion,
        reason: String,
    },

    #[error("migration storage error: {0}")]
    Storage(String),
}

/// One schema upgrade.
///
/// `statements` are backend SQL with a `{schema}` placeholder for the tenant
/// schema; backends without a schema ignore them and only record the version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationStep {
    pub version: SchemaVersion,
    pub description: &'static str,
    pub statements: &'static [&'static str],
}

/// A single tenant database as seen by the migrator.
#[async_trait]
pub trait MigrationTarget: Send + Sync {
    /// Database name, for logs and errors.
    fn name(&self) -> &str;

    /// Versions recorded as applied, in any order.
    async fn applied_versions(&self) -> Result<Vec<SchemaVersion>, MigrationError>;

    /// Run `step` and record its version; both or neither.
    async fn apply_step(&self, step: &MigrationStep) -> Result<(), MigrationError>;

    /// Record a version without running anything.
    async fn record_version(&self, version: &SchemaVersion) -> Result<(), MigrationError>;
}

/// Applies an ordered list of [`MigrationStep`]s to a [`MigrationTarget`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Migrator {
    automigrate: bool,
}

impl Migrator {
    pub fn new(automigrate: bool) -> Self {
        Self { automigrate }
    }

    /// Bring `target` to `version`.
    ///
    /// Returns the versions recorded by this call (empty when the database was
    /// already current, or when only checking compatibility).
    #[instrument(
        skip(self, target, steps),
        fields(db = %target.name(), version = %version, automigrate = self.automigrate),
        err
    )]
    pub async fn apply(
        &self,
        target: &dyn MigrationTarget,
        version: &SchemaVersion,
        steps: &[MigrationStep],
    ) -> Result<Vec<SchemaVersion>, MigrationError> {
        let db = target.name().to_string();

        let current = target
            .applied_versions()
            .await?
            .into_iter()
            .max()
            .unwrap_or(SchemaVersion::ZERO);

        if current > *version {
            return Err(MigrationError::Incompatible {
                db,
                current,
                target: *version,
            });
        }

        if !self.automigrate {
            if current < *version {
                return Err(MigrationError::NeedsMigration {
                    db,
                    current,
                    target: *version,
                });
            }
            return Ok(vec![]);
        }

        let mut ordered: Vec<&MigrationStep> = steps.iter().collect();
        ordered.sort_by_key(|s| s.version);

        let mut last = current;
        let mut recorded = Vec::new();
        for step in ordered {
            if step.version > *version {
                warn!(step = %step.version, "migration beyond target version skipped");
                continue;
            }
            if step.version <= last {
                continue;
            }

            info!(from = %last, to = %step.version, "applying migration: {}", step.description);
            target.apply_step(step).await?;
            last = step.version;
            recorded.push(step.version);
        }

        if last < *version {
            info!(version = %version, "recording schema version without a migration step");
            target.record_version(version).await?;
            recorded.push(*version);
        }

        Ok(recorded)
    }
}
