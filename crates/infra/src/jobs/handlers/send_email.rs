//! `send_email`: hand the message to the email service over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use jobforge_core::SendEmailPayload;

use crate::config::EmailConfig;
use crate::jobs::registry::{HandlerError, JobHandler};

/// Posts the job payload to the configured email endpoint.
///
/// Any non-2xx answer, transport failure or request timeout is a handler
/// failure.
#[derive(Debug, Clone)]
pub struct SendEmailHandler {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl SendEmailHandler {
    pub fn new(config: &EmailConfig) -> Result<Self, HandlerError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| HandlerError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            url: config.api_url.clone(),
            timeout: config.timeout,
        })
    }
}

#[async_trait]
impl JobHandler for SendEmailHandler {
    async fn execute(&self, payload: &Value) -> Result<(), HandlerError> {
        let email: SendEmailPayload = serde_json::from_value(payload.clone())
            .map_err(|e| HandlerError::InvalidPayload(e.to_string()))?;

        let response = self
            .client
            .post(&self.url)
            .json(&email)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    HandlerError::Timeout(self.timeout)
                } else {
                    HandlerError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(HandlerError::Upstream {
                status: status.as_u16(),
            });
        }

        debug!(to = %email.to, "email accepted by upstream");
        Ok(())
    }
}
