//! Job storage abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use jobforge_core::{JobId, TenantId};

use super::types::{InsertOutcome, Job, NewJob, StatusUpdate};

/// Job store abstraction.
///
/// Every operation is atomic. All coordination between competing dispatchers
/// goes through [`JobStore::claim_next`]; there are no in-process locks above
/// this trait.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new `pending` job, unless the tenant already has a job with the
    /// same idempotency key, in which case that job's id and status are
    /// returned and nothing is written.
    async fn insert_if_absent(&self, job: NewJob) -> Result<InsertOutcome, JobStoreError>;

    /// Atomically move the oldest eligible job to `processing` and return it.
    ///
    /// Eligible means `pending` with `run_at <= now`. With a `lease`, jobs stuck
    /// in `processing` longer than the lease are eligible too. Never waits on
    /// rows another claimant holds, never hands the same claim out twice.
    async fn claim_next(&self, lease: Option<Duration>) -> Result<Option<Job>, JobStoreError>;

    /// Conditionally transition a claimed job. Returns the number of rows
    /// changed; `0` means the claim did not match (a consistency fault).
    async fn update_status(&self, update: &StatusUpdate) -> Result<u64, JobStoreError>;

    /// Tenant-scoped point read.
    async fn get_by_id(&self, tenant_id: &TenantId, job_id: JobId)
    -> Result<Option<Job>, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn insert_if_absent(&self, job: NewJob) -> Result<InsertOutcome, JobStoreError> {
        (**self).insert_if_absent(job).await
    }

    async fn claim_next(&self, lease: Option<Duration>) -> Result<Option<Job>, JobStoreError> {
        (**self).claim_next(lease).await
    }

    async fn update_status(&self, update: &StatusUpdate) -> Result<u64, JobStoreError> {
        (**self).update_status(update).await
    }

    async fn get_by_id(
        &self,
        tenant_id: &TenantId,
        job_id: JobId,
    ) -> Result<Option<Job>, JobStoreError> {
        (**self).get_by_id(tenant_id, job_id).await
    }
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    idempotency: HashMap<(TenantId, String), JobId>,
}

/// In-memory job store for tests/dev.
///
/// A single write lock around the table plays the role of the claim
/// transaction.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: RwLock<Inner>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of rows, across all tenants.
    pub fn len(&self) -> usize {
        self.inner.read().map(|i| i.jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> JobStoreError {
    JobStoreError::Unavailable("in-memory job table lock poisoned".to_string())
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert_if_absent(&self, job: NewJob) -> Result<InsertOutcome, JobStoreError> {
        let mut inner = self.inner.write().map_err(poisoned)?;

        if let Some(key) = &job.idempotency_key {
            let slot = (job.tenant_id.clone(), key.clone());
            if let Some(existing) = inner.idempotency.get(&slot).and_then(|id| inner.jobs.get(id)) {
                return Ok(InsertOutcome {
                    job_id: existing.id,
                    status: existing.status,
                    created: false,
                });
            }
            inner.idempotency.insert(slot, job.id);
        }

        let row = job.into_job(Utc::now());
        let outcome = InsertOutcome {
            job_id: row.id,
            status: row.status,
            created: true,
        };
        inner.jobs.insert(row.id, row);
        Ok(outcome)
    }

    async fn claim_next(&self, lease: Option<Duration>) -> Result<Option<Job>, JobStoreError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        let now = Utc::now();

        // Oldest first; ids break created_at ties.
        let next = inner
            .jobs
            .values()
            .filter(|j| j.is_eligible(now) || lease.is_some_and(|l| j.lease_expired(now, l)))
            .min_by_key(|j| (j.created_at, j.id))
            .map(|j| j.id);

        let Some(job_id) = next else {
            return Ok(None);
        };

        let Some(job) = inner.jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        job.status = jobforge_core::JobStatus::Processing;
        job.claimed_at = Some(now);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn update_status(&self, update: &StatusUpdate) -> Result<u64, JobStoreError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        match inner.jobs.get_mut(&update.job_id) {
            Some(job) if job.matches(update) => {
                job.apply(update, Utc::now());
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn get_by_id(
        &self,
        tenant_id: &TenantId,
        job_id: JobId,
    ) -> Result<Option<Job>, JobStoreError> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner
            .jobs
            .get(&job_id)
            .filter(|j| &j.tenant_id == tenant_id)
            .cloned())
    }
}
