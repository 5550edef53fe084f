//! Postgres-backed job store.
//!
//! ## Claiming
//!
//! `claim_next` runs one transaction: `SELECT ... FOR UPDATE SKIP LOCKED`
//! picks the oldest eligible row while ignoring rows other claimants hold,
//! the row is flipped to `processing` and the transaction commits before the
//! job is returned. The connection goes back to the pool before any handler
//! runs.
//!
//! ## Error Mapping
//!
//! | SQLx Error | JobStoreError |
//! |------------|---------------|
//! | PoolClosed / PoolTimedOut / Io | `Unavailable` |
//! | ColumnDecode / Decode / row conversion | `Serialization` |
//! | Database and anything else | `Storage` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use tracing::{Span, instrument};

use jobforge_core::{JobId, JobStatus, TenantId};

use super::store::{JobStore, JobStoreError};
use super::types::{InsertOutcome, Job, NewJob, StatusUpdate};

const JOB_COLUMNS: &str = "id, tenant_id, type, payload, idempotency_key, status, attempts, \
     max_attempts, run_at, last_error, created_at, claimed_at, updated_at";

/// Postgres job store.
///
/// Every read and every update carries `tenant_id` in its WHERE clause, except
/// the claim, which is deliberately global.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn find_by_key(
        &self,
        tenant_id: &TenantId,
        key: &str,
    ) -> Result<Option<(JobId, JobStatus)>, JobStoreError> {
        let row = sqlx::query("SELECT id, status FROM jobs WHERE tenant_id = $1 AND idempotency_key = $2")
            .bind(tenant_id.as_str())
            .bind(key)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_by_key", e))?;

        row.map(|r| id_and_status(&r)).transpose()
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(
        skip(self, job),
        fields(tenant_id = %job.tenant_id, job_type = %job.job_type, created = tracing::field::Empty),
        err
    )]
    async fn insert_if_absent(&self, job: NewJob) -> Result<InsertOutcome, JobStoreError> {
        let max_attempts = to_i32(job.max_attempts, "max_attempts")?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO jobs (id, tenant_id, type, payload, idempotency_key, status, attempts, max_attempts)
            VALUES ($1, $2, $3, $4, $5, 'pending', 0, $6)
            ON CONFLICT (tenant_id, idempotency_key) DO NOTHING
            RETURNING id, status
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.tenant_id.as_str())
        .bind(job.job_type.as_str())
        .bind(&job.payload)
        .bind(job.idempotency_key.as_deref())
        .bind(max_attempts)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_if_absent", e))?;

        let (job_id, status, created) = match inserted {
            Some(row) => {
                let (id, status) = id_and_status(&row)?;
                (id, status, true)
            }
            None => {
                // Only reachable with a key: NULL keys never conflict.
                let key = job.idempotency_key.as_deref().unwrap_or_default();
                let (id, status) = self.find_by_key(&job.tenant_id, key).await?.ok_or_else(|| {
                    JobStoreError::Storage(
                        "idempotency conflict reported but no existing row found".to_string(),
                    )
                })?;
                (id, status, false)
            }
        };

        Span::current().record("created", created);
        Ok(InsertOutcome {
            job_id,
            status,
            created,
        })
    }

    #[instrument(skip(self), err)]
    async fn claim_next(&self, lease: Option<Duration>) -> Result<Option<Job>, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("claim_next.begin", e))?;

        let lease_secs = lease.map(|l| l.as_secs_f64());
        let candidate = sqlx::query(
            r#"
            SELECT id, tenant_id
            FROM jobs
            WHERE (status = 'pending' AND run_at <= NOW())
               OR ($1::float8 IS NOT NULL
                   AND status = 'processing'
                   AND claimed_at <= NOW() - make_interval(secs => $1::float8))
            ORDER BY created_at ASC, id ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(lease_secs)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_next.select", e))?;

        let Some(candidate) = candidate else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("claim_next.rollback", e))?;
            return Ok(None);
        };

        let id: uuid::Uuid = candidate
            .try_get("id")
            .map_err(|e| map_sqlx_error("claim_next.decode", e))?;
        let tenant_id: String = candidate
            .try_get("tenant_id")
            .map_err(|e| map_sqlx_error("claim_next.decode", e))?;

        let claimed = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET status = 'processing', claimed_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND tenant_id = $2
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(&tenant_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_next.update", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("claim_next.commit", e))?;

        let row = JobRow::from_row(&claimed).map_err(|e| map_sqlx_error("claim_next.decode", e))?;
        Job::try_from(row).map(Some)
    }

    #[instrument(
        skip(self, update),
        fields(job_id = %update.job_id, tenant_id = %update.tenant_id, status = %update.status),
        err
    )]
    async fn update_status(&self, update: &StatusUpdate) -> Result<u64, JobStoreError> {
        let attempts = update
            .attempts
            .map(|a| to_i32(a, "attempts"))
            .transpose()?;

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = $3,
                attempts = COALESCE($4::int4, attempts),
                run_at = COALESCE($5::timestamptz, run_at),
                last_error = COALESCE($6::text, last_error),
                claimed_at = NULL,
                updated_at = NOW()
            WHERE id = $1
              AND tenant_id = $2
              AND status = 'processing'
              AND claimed_at IS NOT DISTINCT FROM $7::timestamptz
            "#,
        )
        .bind(update.job_id.as_uuid())
        .bind(update.tenant_id.as_str())
        .bind(update.status.as_str())
        .bind(attempts)
        .bind(update.run_at)
        .bind(update.last_error.as_deref())
        .bind(update.claimed_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_status", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, job_id = %job_id), err)]
    async fn get_by_id(
        &self,
        tenant_id: &TenantId,
        job_id: JobId,
    ) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 AND tenant_id = $2"
        ))
        .bind(job_id.as_uuid())
        .bind(tenant_id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_by_id", e))?;

        match row {
            Some(row) => {
                let row = JobRow::from_row(&row).map_err(|e| map_sqlx_error("get_by_id.decode", e))?;
                Job::try_from(row).map(Some)
            }
            None => Ok(None),
        }
    }
}

fn to_i32(value: u32, column: &str) -> Result<i32, JobStoreError> {
    i32::try_from(value)
        .map_err(|_| JobStoreError::Serialization(format!("{column} out of range: {value}")))
}

fn id_and_status(row: &sqlx::postgres::PgRow) -> Result<(JobId, JobStatus), JobStoreError> {
    let id: uuid::Uuid = row.try_get("id").map_err(|e| map_sqlx_error("decode", e))?;
    let status: String = row.try_get("status").map_err(|e| map_sqlx_error("decode", e))?;
    let status = status
        .parse()
        .map_err(|e| JobStoreError::Serialization(format!("{e}")))?;
    Ok((JobId::from_uuid(id), status))
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => JobStoreError::Storage(format!(
            "database error in {}: {} (code {})",
            operation,
            db_err.message(),
            db_err.code().as_deref().unwrap_or("none")
        )),
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => {
            JobStoreError::Unavailable(format!("connection pool unavailable in {operation}"))
        }
        sqlx::Error::Io(e) => JobStoreError::Unavailable(format!("io error in {operation}: {e}")),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            JobStoreError::Serialization(format!("failed to decode row in {operation}: {err}"))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    tenant_id: String,
    job_type: String,
    payload: serde_json::Value,
    idempotency_key: Option<String>,
    status: String,
    attempts: i32,
    max_attempts: i32,
    run_at: DateTime<Utc>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    claimed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            job_type: row.try_get("type")?,
            payload: row.try_get("payload")?,
            idempotency_key: row.try_get("idempotency_key")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            run_at: row.try_get("run_at")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            claimed_at: row.try_get("claimed_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let id = row.id;
        let corrupt = |what: &str| JobStoreError::Serialization(format!("job {id}: invalid {what}"));

        Ok(Job {
            id: JobId::from_uuid(row.id),
            tenant_id: row.tenant_id.parse().map_err(|_| corrupt("tenant_id"))?,
            status: row.status.parse().map_err(|_| corrupt("status"))?,
            attempts: u32::try_from(row.attempts).map_err(|_| corrupt("attempts"))?,
            max_attempts: u32::try_from(row.max_attempts).map_err(|_| corrupt("max_attempts"))?,
            job_type: row.job_type,
            payload: row.payload,
            idempotency_key: row.idempotency_key,
            run_at: row.run_at,
            last_error: row.last_error,
            created_at: row.created_at,
            claimed_at: row.claimed_at,
            updated_at: row.updated_at,
        })
    }
}
