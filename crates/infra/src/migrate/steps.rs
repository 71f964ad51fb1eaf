//! Schema history of the auth set store.

use super::{MigrationStep, SchemaVersion};

/// Schema version this build of the service expects.
pub const DB_VERSION: SchemaVersion = SchemaVersion::new(1, 1, 0);

const V1_0_0: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS {schema}.device_auths (
        id              TEXT PRIMARY KEY,
        device_id       TEXT NOT NULL DEFAULT '',
        device_identity TEXT NOT NULL DEFAULT '',
        key             TEXT NOT NULL DEFAULT '',
        attributes      JSONB NOT NULL DEFAULT '{}'::jsonb,
        status          TEXT NOT NULL DEFAULT 'pending',
        request_time    TIMESTAMPTZ
    )
    "#,
    "CREATE INDEX IF NOT EXISTS device_auths_device_id_idx ON {schema}.device_auths (device_id)",
    "CREATE INDEX IF NOT EXISTS device_auths_identity_idx ON {schema}.device_auths (device_identity)",
];

// Closes the window between the duplicate-identity lookup and the insert of a
// pre-authorized auth set. Fails if duplicates already exist; those must be
// cleaned up by hand before the upgrade.
const V1_1_0: &[&str] = &[r#"
    CREATE UNIQUE INDEX IF NOT EXISTS device_auths_preauth_identity_uniq
        ON {schema}.device_auths (device_identity)
        WHERE status = 'preauthorized'
    "#];

/// All known steps, oldest first.
pub fn device_auth_steps() -> Vec<MigrationStep> {
    vec![
        MigrationStep {
            version: SchemaVersion::new(1, 0, 0),
            description: "create device_auths table",
            statements: V1_0_0,
        },
        MigrationStep {
            version: SchemaVersion::new(1, 1, 0),
            description: "unique identity among preauthorized auth sets",
            statements: V1_1_0,
        },
    ]
}
