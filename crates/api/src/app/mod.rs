//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: job store selection, enqueue/status services, embedded workers
//! - `routes/`: HTTP routes + handlers
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router};
use tower::ServiceBuilder;

use jobforge_infra::config::AppConfig;
use jobforge_infra::jobs::DispatcherHandle;

pub mod errors;
pub mod routes;
pub mod services;

/// A built application: the router plus any dispatch loops running in-process.
pub struct Application {
    pub router: Router,
    pub workers: Vec<DispatcherHandle>,
}

/// Build the full application (public entrypoint used by `main.rs`).
pub async fn build_app(config: &AppConfig) -> anyhow::Result<Application> {
    let services = services::build_services(config).await?;
    let workers = services.spawn_workers(config)?;

    Ok(Application {
        router: router(Arc::new(services)),
        workers,
    })
}

/// Router over already-built services.
pub fn router(services: Arc<services::AppServices>) -> Router {
    routes::router()
        .layer(Extension(services))
        .layer(ServiceBuilder::new())
}

/// Stop in-process dispatch loops, letting in-flight jobs finish.
pub async fn shutdown_workers(workers: Vec<DispatcherHandle>) {
    for worker in workers {
        worker.shutdown().await;
    }
}
