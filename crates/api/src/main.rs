use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;

use deviceadm_admission::DevAdm;
use deviceadm_api::config::{Cli, Command, MigrateArgs, ServerArgs};
use deviceadm_infra::devauth::{DevAuthClient, ReqwestRunner};
use deviceadm_infra::migrate::DB_VERSION;
use deviceadm_infra::store::{DataStore, PostgresDataStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    deviceadm_observability::init(cli.debug);

    match cli.command {
        Command::Server(args) => run_server(args).await,
        Command::Migrate(args) => run_migrate(args).await,
    }
}

async fn run_server(args: ServerArgs) -> anyhow::Result<()> {
    let mut store = PostgresDataStore::connect(&args.db.postgres_config())
        .await
        .context("failed to connect to the database")?;
    if args.automigrate {
        store = store.with_automigrate();
    }
    store
        .migrate(&DB_VERSION)
        .await
        .context("database schema check failed")?;

    let devauth = DevAuthClient::new(
        args.devauth.devauth_config(),
        Arc::new(ReqwestRunner::default()),
    );
    let app = deviceadm_api::app::build_app(Arc::new(DevAdm::new(store, devauth)));

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")
}

async fn run_migrate(args: MigrateArgs) -> anyhow::Result<()> {
    let store = PostgresDataStore::connect(&args.db.postgres_config())
        .await
        .context("failed to connect to the database")?
        .with_automigrate();

    let scope = args.scope();
    store
        .migrate_tenant(&DB_VERSION, &scope)
        .await
        .with_context(|| format!("failed to migrate {scope}"))?;

    tracing::info!(scope = %scope, version = %DB_VERSION, "migration finished");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("shutting down");
}
