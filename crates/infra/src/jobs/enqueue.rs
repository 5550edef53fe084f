//! Idempotent job submission.

use tracing::info;

use jobforge_core::{DomainError, JobId, JobStatus, JobType, TenantId};

use super::error::JobServiceError;
use super::store::JobStore;
use super::types::{DEFAULT_MAX_ATTEMPTS, NewJob};

/// Longest accepted `Idempotency-Key`.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

/// Raw submission, as it arrives from a client.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub tenant_id: Option<String>,
    pub idempotency_key: Option<String>,
    /// Route name of the job type (`send_email`, `email`).
    pub job_type: String,
    pub payload: serde_json::Value,
}

/// What the client is told after a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueReceipt {
    pub job_id: JobId,
    pub status: JobStatus,
    /// The idempotency key matched an existing job; nothing was inserted.
    pub duplicate: bool,
}

impl EnqueueReceipt {
    /// Client-facing status: `queued` for a fresh job, otherwise the existing
    /// job's current status.
    pub fn status_label(&self) -> &'static str {
        if self.duplicate {
            self.status.as_str()
        } else {
            "queued"
        }
    }
}

/// Validates submissions and writes them to the store.
#[derive(Debug, Clone)]
pub struct EnqueueService<S> {
    store: S,
    default_max_attempts: u32,
}

impl<S: JobStore> EnqueueService<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_default_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts.max(1);
        self
    }

    /// Validate and persist a job.
    ///
    /// The tenant is checked before anything else. With an idempotency key,
    /// a second submission for the same tenant returns the first job and
    /// writes nothing, whatever its payload.
    pub async fn enqueue(&self, req: EnqueueRequest) -> Result<EnqueueReceipt, JobServiceError> {
        let tenant_id = TenantId::from_optional(req.tenant_id.as_deref())?;
        let job_type = JobType::from_route(&req.job_type)?;
        let payload = job_type.validate_payload(req.payload)?;
        let idempotency_key = normalize_key(req.idempotency_key)?;

        let mut job = NewJob::new(tenant_id.clone(), job_type, payload)
            .with_max_attempts(self.default_max_attempts);
        if let Some(key) = idempotency_key {
            job = job.with_idempotency_key(key);
        }

        let outcome = self.store.insert_if_absent(job).await?;
        if outcome.created {
            info!(
                job_id = %outcome.job_id,
                tenant_id = %tenant_id,
                job_type = %job_type,
                "job enqueued"
            );
        } else {
            info!(
                job_id = %outcome.job_id,
                tenant_id = %tenant_id,
                status = %outcome.status,
                "duplicate enqueue"
            );
        }

        Ok(EnqueueReceipt {
            job_id: outcome.job_id,
            status: outcome.status,
            duplicate: !outcome.created,
        })
    }
}

/// Empty keys count as absent.
fn normalize_key(key: Option<String>) -> Result<Option<String>, DomainError> {
    match key {
        Some(k) if k.trim().is_empty() => Ok(None),
        Some(k) if k.len() > MAX_IDEMPOTENCY_KEY_LEN => Err(DomainError::validation(format!(
            "idempotency key exceeds {MAX_IDEMPOTENCY_KEY_LEN} bytes"
        ))),
        other => Ok(other),
    }
}
