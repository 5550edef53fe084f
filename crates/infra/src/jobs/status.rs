//! Tenant-scoped job status reads.

use jobforge_core::{DomainError, JobId, TenantId};

use super::error::JobServiceError;
use super::store::JobStore;
use super::types::Job;

/// Reads a job on behalf of a tenant.
#[derive(Debug, Clone)]
pub struct StatusReader<S> {
    store: S,
}

impl<S: JobStore> StatusReader<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Fetch a job owned by `tenant_id`.
    ///
    /// Tenant and id are validated before the store is touched. Jobs of other
    /// tenants are reported exactly like absent ones.
    pub async fn get_status(
        &self,
        tenant_id: Option<&str>,
        job_id: &str,
    ) -> Result<Job, JobServiceError> {
        let tenant_id = TenantId::from_optional(tenant_id)?;
        let job_id: JobId = job_id.parse()?;

        self.store
            .get_by_id(&tenant_id, job_id)
            .await?
            .ok_or_else(|| DomainError::not_found().into())
    }
}
