//! Service wiring: job store selection, client-facing services, embedded
//! dispatch loops.

use std::sync::Arc;

use anyhow::Context;

use jobforge_infra::config::AppConfig;
use jobforge_infra::db;
use jobforge_infra::jobs::{
    Dispatcher, DispatcherHandle, EnqueueService, InMemoryJobStore, JobStore, PostgresJobStore,
    StatusReader, handlers,
};

pub type SharedJobStore = Arc<dyn JobStore>;

pub struct AppServices {
    pub store: SharedJobStore,
    pub enqueue: EnqueueService<SharedJobStore>,
    pub status: StatusReader<SharedJobStore>,
    pub external_failure_rate: f64,
}

impl AppServices {
    pub fn new(store: SharedJobStore, config: &AppConfig) -> Self {
        Self {
            enqueue: EnqueueService::new(store.clone())
                .with_default_max_attempts(config.worker.default_max_attempts),
            status: StatusReader::new(store.clone()),
            store,
            external_failure_rate: config.server.external_failure_rate,
        }
    }

    /// Start `EMBEDDED_WORKERS` dispatch loops against this process's store.
    pub fn spawn_workers(&self, config: &AppConfig) -> anyhow::Result<Vec<DispatcherHandle>> {
        let count = config.server.embedded_workers;
        if count == 0 {
            return Ok(Vec::new());
        }

        let registry = Arc::new(
            handlers::default_registry(&config.email).context("failed to build job handlers")?,
        );

        let handles = (0..count)
            .map(|i| {
                Dispatcher::new(self.store.clone(), registry.clone())
                    .with_retry_policy(config.worker.retry)
                    .with_config(config.worker.dispatcher_config(format!("api-worker-{i}")))
                    .spawn()
            })
            .collect();
        tracing::info!(count, "embedded dispatch loops started");
        Ok(handles)
    }
}

pub async fn build_services(config: &AppConfig) -> anyhow::Result<AppServices> {
    let store: SharedJobStore = if config.store.use_persistent {
        build_persistent_store(config).await?
    } else {
        tracing::info!("using in-memory job store");
        Arc::new(InMemoryJobStore::new())
    };

    Ok(AppServices::new(store, config))
}

async fn build_persistent_store(config: &AppConfig) -> anyhow::Result<SharedJobStore> {
    let database_url = config
        .store
        .require_database_url()
        .context("USE_PERSISTENT_STORES=true")?;

    let pool = db::create_pool(database_url, config.store.max_connections)
        .await
        .context("failed to connect to Postgres")?;
    db::run_migrations(&pool)
        .await
        .context("failed to run migrations")?;

    Ok(Arc::new(PostgresJobStore::new(pool)))
}
