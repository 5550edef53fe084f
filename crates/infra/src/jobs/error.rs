//! Errors surfaced by the enqueue and status services.

use jobforge_core::DomainError;

use super::store::JobStoreError;

/// Either a client fault (never retried) or a store fault.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobServiceError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

impl JobServiceError {
    pub fn is_client_error(&self) -> bool {
        matches!(self, JobServiceError::Domain(_))
    }
}
