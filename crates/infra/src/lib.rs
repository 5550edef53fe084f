//! Infrastructure layer: job storage, dispatch, config, external services.

pub mod config;
pub mod db;
pub mod jobs;
