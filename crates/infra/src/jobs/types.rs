//! Job records and the store-facing commands built from them.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobforge_core::{JobId, JobStatus, JobType, TenantId};

/// `max_attempts` given to jobs when the caller does not pick one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// A job row, as stored and as returned to clients polling for status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub tenant_id: TenantId,
    /// Stored tag. Kept as text so rows with a type this build does not know
    /// still load (they fail at dispatch instead).
    #[serde(rename = "type")]
    pub job_type: String,
    pub payload: serde_json::Value,
    pub idempotency_key: Option<String>,
    pub status: JobStatus,
    /// Failed executions so far.
    pub attempts: u32,
    pub max_attempts: u32,
    /// Earliest time the job may be claimed.
    pub run_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Set when the current `processing` claim was taken; cleared on release.
    pub claimed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Pending and due.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.run_at <= now
    }

    /// Stuck in `processing` for longer than `lease`.
    pub fn lease_expired(&self, now: DateTime<Utc>, lease: Duration) -> bool {
        if self.status != JobStatus::Processing {
            return false;
        }
        match (self.claimed_at, chrono::Duration::from_std(lease)) {
            (Some(claimed_at), Ok(lease)) => claimed_at + lease <= now,
            _ => false,
        }
    }

    /// Whether `update` targets this row as currently claimed.
    pub fn matches(&self, update: &StatusUpdate) -> bool {
        self.id == update.job_id
            && self.tenant_id == update.tenant_id
            && self.status == JobStatus::Processing
            && self.claimed_at == update.claimed_at
    }

    /// Apply a status update to an in-memory copy of the row.
    pub fn apply(&mut self, update: &StatusUpdate, now: DateTime<Utc>) {
        debug_assert!(
            self.status.can_transition_to(update.status),
            "illegal transition {} -> {}",
            self.status,
            update.status
        );
        self.status = update.status;
        if let Some(attempts) = update.attempts {
            self.attempts = attempts;
        }
        if let Some(run_at) = update.run_at {
            self.run_at = run_at;
        }
        if update.last_error.is_some() {
            self.last_error = update.last_error.clone();
        }
        self.claimed_at = None;
        self.updated_at = now;
    }
}

/// A validated job waiting to be inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub id: JobId,
    pub tenant_id: TenantId,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub idempotency_key: Option<String>,
    pub max_attempts: u32,
}

impl NewJob {
    pub fn new(tenant_id: TenantId, job_type: JobType, payload: serde_json::Value) -> Self {
        Self {
            id: JobId::new(),
            tenant_id,
            job_type,
            payload,
            idempotency_key: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Materialize the row a store would create at `now`.
    pub fn into_job(self, now: DateTime<Utc>) -> Job {
        Job {
            id: self.id,
            tenant_id: self.tenant_id,
            job_type: self.job_type.as_str().to_string(),
            payload: self.payload,
            idempotency_key: self.idempotency_key,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: self.max_attempts,
            run_at: now,
            last_error: None,
            created_at: now,
            claimed_at: None,
            updated_at: now,
        }
    }
}

/// Result of [`JobStore::insert_if_absent`](super::JobStore::insert_if_absent).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertOutcome {
    pub job_id: JobId,
    pub status: JobStatus,
    /// `false` when an existing row with the same idempotency key was returned.
    pub created: bool,
}

/// Conditional transition of a claimed job out of `processing`.
///
/// Applies only to the row with this `(job_id, tenant_id)` that is still
/// `processing` under the same claim (`claimed_at`). Anything else is a
/// zero-row no-op.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub job_id: JobId,
    pub tenant_id: TenantId,
    pub claimed_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub attempts: Option<u32>,
    pub run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl StatusUpdate {
    fn for_claim(job: &Job, status: JobStatus) -> Self {
        Self {
            job_id: job.id,
            tenant_id: job.tenant_id.clone(),
            claimed_at: job.claimed_at,
            status,
            attempts: None,
            run_at: None,
            last_error: None,
        }
    }

    pub fn completed(job: &Job) -> Self {
        Self::for_claim(job, JobStatus::Completed)
    }

    pub fn rescheduled(job: &Job, attempts: u32, run_at: DateTime<Utc>, error: String) -> Self {
        Self {
            attempts: Some(attempts),
            run_at: Some(run_at),
            last_error: Some(error),
            ..Self::for_claim(job, JobStatus::Pending)
        }
    }

    pub fn failed(job: &Job, attempts: u32, error: String) -> Self {
        Self {
            attempts: Some(attempts),
            last_error: Some(error),
            ..Self::for_claim(job, JobStatus::Failed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claimed_job() -> Job {
        let now = Utc::now();
        let mut job = NewJob::new(
            "T1".parse().unwrap(),
            JobType::SendEmail,
            serde_json::json!({}),
        )
        .into_job(now);
        job.status = JobStatus::Processing;
        job.claimed_at = Some(now);
        job
    }

    #[test]
    fn new_job_starts_pending_and_due() {
        let now = Utc::now();
        let job = NewJob::new("T1".parse().unwrap(), JobType::SendEmail, serde_json::json!({}))
            .with_idempotency_key("K1")
            .into_job(now);

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(job.job_type, "send_email");
        assert_eq!(job.idempotency_key.as_deref(), Some("K1"));
        assert!(job.last_error.is_none());
        assert!(job.is_eligible(now));
    }

    #[test]
    fn max_attempts_is_at_least_one() {
        let job = NewJob::new("T1".parse().unwrap(), JobType::SendEmail, serde_json::json!({}))
            .with_max_attempts(0);
        assert_eq!(job.max_attempts, 1);
    }

    #[test]
    fn update_must_match_claim() {
        let job = claimed_job();
        assert!(job.matches(&StatusUpdate::completed(&job)));

        let mut other_tenant = StatusUpdate::completed(&job);
        other_tenant.tenant_id = "T2".parse().unwrap();
        assert!(!job.matches(&other_tenant));

        let mut stale_claim = StatusUpdate::completed(&job);
        stale_claim.claimed_at = Some(Utc::now() + chrono::Duration::seconds(1));
        assert!(!job.matches(&stale_claim));
    }

    #[test]
    fn apply_releases_claim() {
        let mut job = claimed_job();
        let run_at = Utc::now() + chrono::Duration::seconds(5);
        let update = StatusUpdate::rescheduled(&job, 1, run_at, "boom".into());

        job.apply(&update, Utc::now());

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.run_at, run_at);
        assert_eq!(job.last_error.as_deref(), Some("boom"));
        assert!(job.claimed_at.is_none());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "illegal transition")]
    fn apply_rejects_update_on_terminal_row() {
        let mut job = claimed_job();
        let update = StatusUpdate::completed(&job);
        job.status = JobStatus::Completed;
        job.apply(&update, Utc::now());
    }

    #[test]
    fn lease_expiry_only_applies_to_processing() {
        let mut job = claimed_job();
        let later = job.claimed_at.unwrap() + chrono::Duration::seconds(10);
        assert!(job.lease_expired(later, Duration::from_secs(5)));
        assert!(!job.lease_expired(later, Duration::from_secs(30)));

        job.status = JobStatus::Pending;
        assert!(!job.lease_expired(later, Duration::from_secs(5)));
    }

    #[test]
    fn serialized_record_uses_type_key() {
        let job = claimed_job();
        let v = serde_json::to_value(&job).unwrap();
        assert_eq!(v["type"], "send_email");
        assert_eq!(v["status"], "processing");
        assert_eq!(v["tenant_id"], "T1");
    }
}
