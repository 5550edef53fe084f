//! Job vocabulary: lifecycle status, job types, and their payload shapes.

use core::str::FromStr;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::{DomainError, DomainResult};

/// Lifecycle status of a job.
///
/// Allowed edges: `pending -> processing`, then `processing -> completed`,
/// `processing -> pending` (retry) or `processing -> failed`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether `self -> next` is an edge of the lifecycle.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Pending)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// The finite set of job types the queue knows how to run.
///
/// Adding a job type means adding a variant here, its payload shape below, and
/// a handler registered with the dispatcher.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    SendEmail,
}

impl JobType {
    pub const ALL: [JobType; 1] = [JobType::SendEmail];

    /// Tag stored in the `jobs.type` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::SendEmail => "send_email",
        }
    }

    /// Resolve the `{type}` segment of `POST /jobs/{type}`.
    ///
    /// Accepts the stored tag plus the short route names older clients use.
    pub fn from_route(segment: &str) -> DomainResult<Self> {
        match segment {
            "email" => Ok(JobType::SendEmail),
            other => other.parse(),
        }
    }

    /// Validate a raw request body against this type's payload shape.
    ///
    /// Returns the normalized document that gets stored (unknown fields are
    /// dropped).
    pub fn validate_payload(&self, raw: serde_json::Value) -> DomainResult<serde_json::Value> {
        match self {
            JobType::SendEmail => normalize::<SendEmailPayload>(raw),
        }
    }
}

impl core::fmt::Display for JobType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unsupported job type: {s}")))
    }
}

/// Payload of a `send_email` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct SendEmailPayload {
    #[validate(email)]
    pub to: String,
    #[validate(length(min = 1))]
    pub subject: String,
    #[validate(length(min = 1))]
    pub body: String,
}

fn normalize<P>(raw: serde_json::Value) -> DomainResult<serde_json::Value>
where
    P: Validate + Serialize + for<'de> Deserialize<'de>,
{
    let parsed: P = serde_json::from_value(raw)
        .map_err(|e| DomainError::validation(format!("invalid job payload: {e}")))?;
    parsed
        .validate()
        .map_err(|e| DomainError::validation(format!("invalid job payload: {e}")))?;
    serde_json::to_value(&parsed)
        .map_err(|e| DomainError::validation(format!("invalid job payload: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lifecycle_edges() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Processing));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Pending));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Failed));

        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Pending));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Processing));
    }

    #[test]
    fn terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }

    #[test]
    fn status_parses_its_own_tag() {
        for s in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(s.as_str().parse::<JobStatus>().unwrap(), s);
        }
        assert!("queued".parse::<JobStatus>().is_err());
    }

    #[test]
    fn route_aliases_resolve() {
        assert_eq!(JobType::from_route("send_email").unwrap(), JobType::SendEmail);
        assert_eq!(JobType::from_route("email").unwrap(), JobType::SendEmail);
        assert!(JobType::from_route("sms").is_err());
        // the alias is a route name only, never a stored tag
        assert!("email".parse::<JobType>().is_err());
    }

    #[test]
    fn valid_email_payload_is_normalized() {
        let raw = json!({"to": "a@b.com", "subject": "hi", "body": "x", "extra": true});
        let stored = JobType::SendEmail.validate_payload(raw).unwrap();
        assert_eq!(stored, json!({"to": "a@b.com", "subject": "hi", "body": "x"}));
    }

    #[test]
    fn malformed_email_payloads_are_rejected() {
        let cases = [
            json!({"to": "not-an-email", "subject": "hi", "body": "x"}),
            json!({"to": "a@b.com", "subject": "", "body": "x"}),
            json!({"to": "a@b.com", "subject": "hi", "body": ""}),
            json!({"to": "a@b.com", "subject": "hi"}),
            json!("just a string"),
        ];
        for raw in cases {
            let err = JobType::SendEmail.validate_payload(raw.clone()).unwrap_err();
            assert!(matches!(err, DomainError::Validation(_)), "accepted {raw}");
        }
    }
}
