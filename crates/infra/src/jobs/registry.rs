//! Handler registry: maps job types to the code that runs them.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use jobforge_core::JobType;

/// Why a handler did not succeed. Every variant is retried per the retry
/// policy; none of them stops the dispatch loop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("upstream returned status {status}")]
    Upstream { status: u16 },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("handler timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("unknown job type: {0}")]
    UnknownType(String),
    #[error("no handler registered for job type: {0}")]
    Unregistered(JobType),
    #[error("handler panicked: {0}")]
    Panicked(String),
}

/// A unit of work for one job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, payload: &Value) -> Result<(), HandlerError>;
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnHandler<F>(F);

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn execute(&self, payload: &Value) -> Result<(), HandlerError> {
        (self.0)(payload.clone()).await
    }
}

/// Handlers by job type.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `job_type`.
    pub fn register(&mut self, job_type: JobType, handler: impl JobHandler + 'static) {
        self.handlers.insert(job_type, Arc::new(handler));
    }

    pub fn with(mut self, job_type: JobType, handler: impl JobHandler + 'static) -> Self {
        self.register(job_type, handler);
        self
    }

    /// Look up the handler for a stored `type` tag.
    pub fn resolve(&self, tag: &str) -> Result<Arc<dyn JobHandler>, HandlerError> {
        let job_type: JobType = tag
            .parse()
            .map_err(|_| HandlerError::UnknownType(tag.to_string()))?;
        self.handlers
            .get(&job_type)
            .cloned()
            .ok_or(HandlerError::Unregistered(job_type))
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_registered_handler() {
        let registry = HandlerRegistry::new().with(
            JobType::SendEmail,
            FnHandler::new(|_payload| async { Ok(()) }),
        );

        let handler = registry.resolve("send_email").unwrap();
        assert!(handler.execute(&serde_json::json!({})).await.is_ok());
    }

    #[test]
    fn unknown_tag_is_a_handler_error() {
        let registry = HandlerRegistry::new();
        assert!(matches!(
            registry.resolve("resize_image"),
            Err(HandlerError::UnknownType(tag)) if tag == "resize_image"
        ));
    }

    #[test]
    fn known_but_unregistered_type() {
        let registry = HandlerRegistry::new();
        assert!(matches!(
            registry.resolve("send_email"),
            Err(HandlerError::Unregistered(JobType::SendEmail))
        ));
    }
}
