//! Built-in job handlers.

mod send_email;

pub use send_email::SendEmailHandler;

use jobforge_core::JobType;

use super::registry::{HandlerError, HandlerRegistry};
use crate::config::EmailConfig;

/// Registry with a handler for every built-in job type.
pub fn default_registry(email: &EmailConfig) -> Result<HandlerRegistry, HandlerError> {
    Ok(HandlerRegistry::new().with(JobType::SendEmail, SendEmailHandler::new(email)?))
}
