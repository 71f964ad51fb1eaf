//! Command line and environment configuration.
//!
//! Every option can also be set through a `DEVICEADM_*` environment variable.

use std::net::SocketAddr;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use deviceadm_core::{TenantId, TenantScope};
use deviceadm_infra::devauth::DevAuthConfig;
use deviceadm_infra::store::PostgresConfig;

#[derive(Parser, Debug)]
#[command(name = "deviceadm", version, about = "Device admission service")]
pub struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, global = true, env = "DEVICEADM_DEBUG")]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the admission API.
    Server(ServerArgs),
    /// Upgrade database schemas, then exit.
    Migrate(MigrateArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, env = "DEVICEADM_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Upgrade outdated schemas at startup instead of refusing to start.
    #[arg(long, env = "DEVICEADM_AUTOMIGRATE")]
    pub automigrate: bool,

    #[command(flatten)]
    pub db: DbArgs,

    #[command(flatten)]
    pub devauth: DevAuthArgs,
}

#[derive(Args, Debug)]
pub struct MigrateArgs {
    /// Tenant whose database to migrate; the default database when omitted.
    #[arg(long, env = "DEVICEADM_TENANT")]
    pub tenant: Option<TenantId>,

    #[command(flatten)]
    pub db: DbArgs,
}

impl MigrateArgs {
    pub fn scope(&self) -> TenantScope {
        TenantScope::from(self.tenant.clone())
    }
}

#[derive(Args, Debug, Clone)]
pub struct DbArgs {
    #[arg(
        long = "db-url",
        env = "DEVICEADM_DB_URL",
        default_value = "postgres://localhost:5432/deviceadm"
    )]
    pub db_url: String,

    /// Overrides the user name of the URL.
    #[arg(long = "db-username", env = "DEVICEADM_DB_USERNAME")]
    pub username: Option<String>,

    /// Overrides the password of the URL.
    #[arg(long = "db-password", env = "DEVICEADM_DB_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    #[arg(long = "db-ssl", env = "DEVICEADM_DB_SSL")]
    pub tls: bool,

    /// Encrypt without verifying the server certificate.
    #[arg(long = "db-ssl-skip-verify", env = "DEVICEADM_DB_SSL_SKIP_VERIFY")]
    pub tls_skip_verify: bool,

    #[arg(long = "db-max-connections", env = "DEVICEADM_DB_MAX_CONNECTIONS", default_value_t = 10)]
    pub max_connections: u32,
}

impl DbArgs {
    pub fn postgres_config(&self) -> PostgresConfig {
        PostgresConfig {
            url: self.db_url.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            tls: self.tls,
            tls_skip_verify: self.tls_skip_verify,
            max_connections: self.max_connections,
            ..PostgresConfig::default()
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct DevAuthArgs {
    #[arg(
        long = "devauth-url",
        env = "DEVICEADM_DEVAUTH_URL",
        default_value = "http://mender-device-auth:8080"
    )]
    pub devauth_url: String,

    /// Per-request timeout in seconds; 0 selects the default of 10.
    #[arg(long = "devauth-timeout", env = "DEVICEADM_DEVAUTH_TIMEOUT", default_value_t = 10)]
    pub timeout_secs: u64,
}

impl DevAuthArgs {
    pub fn devauth_config(&self) -> DevAuthConfig {
        DevAuthConfig {
            devauth_url: self.devauth_url.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}
