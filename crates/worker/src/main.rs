//! Standalone dispatch process: runs `WORKER_CONCURRENCY` loops against
//! Postgres until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use jobforge_infra::config::AppConfig;
use jobforge_infra::db;
use jobforge_infra::jobs::{Dispatcher, PostgresJobStore, handlers};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jobforge_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let database_url = config.store.require_database_url()?;

    let pool = db::create_pool(database_url, config.store.max_connections)
        .await
        .context("failed to connect to Postgres")?;
    db::run_migrations(&pool)
        .await
        .context("failed to run migrations")?;

    let store = Arc::new(PostgresJobStore::new(pool));
    let registry = Arc::new(
        handlers::default_registry(&config.email).context("failed to build job handlers")?,
    );

    let workers: Vec<_> = (0..config.worker.concurrency)
        .map(|i| {
            Dispatcher::new(store.clone(), registry.clone())
                .with_retry_policy(config.worker.retry)
                .with_config(config.worker.dispatcher_config(format!("worker-{i}")))
                .spawn()
        })
        .collect();

    info!(
        concurrency = workers.len(),
        email_api = %config.email.api_url,
        "worker started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested, finishing in-flight jobs");

    for worker in workers {
        let stats = worker.stats();
        let name = worker.name().to_string();
        worker.shutdown().await;
        info!(
            worker = %name,
            completed = stats.jobs_completed,
            rescheduled = stats.jobs_rescheduled,
            failed = stats.jobs_failed,
            consistency_faults = stats.consistency_faults,
            "dispatcher stopped"
        );
    }

    Ok(())
}
