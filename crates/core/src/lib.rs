//! `jobforge-core` — queue domain building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod error;
pub mod id;
pub mod job;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, TenantId};
pub use job::{JobStatus, JobType, SendEmailPayload};
