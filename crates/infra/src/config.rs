//! Configuration loading and representation.
//!
//! Everything comes from environment variables (a `.env` file is honoured);
//! every variable has a development default except `DATABASE_URL`.
//!
//! | Env Var                     | Default                                     |
//! |-----------------------------|---------------------------------------------|
//! | `HOST`                      | `0.0.0.0`                                   |
//! | `PORT`                      | `3000`                                      |
//! | `USE_PERSISTENT_STORES`     | `false`                                     |
//! | `DATABASE_URL`              | unset                                       |
//! | `DATABASE_MAX_CONNECTIONS`  | `10`                                        |
//! | `DEFAULT_MAX_ATTEMPTS`      | `3`                                         |
//! | `WORKER_CONCURRENCY`        | `1`                                         |
//! | `WORKER_IDLE_INTERVAL_MS`   | `1000`                                      |
//! | `WORKER_IDLE_MAX_MS`        | unset (fixed idle interval)                 |
//! | `WORKER_HANDLER_TIMEOUT_MS` | `10000`                                     |
//! | `WORKER_LEASE_TIMEOUT_MS`   | unset (no reclaim)                          |
//! | `RETRY_BACKOFF`             | `fixed`                                     |
//! | `RETRY_DELAY_MS`            | `5000`                                      |
//! | `RETRY_MAX_DELAY_MS`        | `300000`                                    |
//! | `EMBEDDED_WORKERS`          | `0`                                         |
//! | `EMAIL_API_URL`             | `http://localhost:3000/external/send-email` |
//! | `EMAIL_API_TIMEOUT_MS`      | `3000`                                      |
//! | `EXTERNAL_FAILURE_RATE`     | `0.5`                                       |

use std::str::FromStr;
use std::time::Duration;

use crate::jobs::{BackoffStrategy, DispatcherConfig, IdleBackoff, RetryPolicy, DEFAULT_MAX_ATTEMPTS};

/// Configuration error, reported at startup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} has an invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
    #[error("{0} must be set")]
    Missing(&'static str),
}

/// HTTP server settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Probability that the mock `/external/send-email` endpoint fails.
    pub external_failure_rate: f64,
    /// Dispatch loops run inside the API process.
    pub embedded_workers: usize,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Job store selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub use_persistent: bool,
    pub database_url: Option<String>,
    pub max_connections: u32,
}

impl StoreConfig {
    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::Missing("DATABASE_URL"))
    }
}

/// Dispatch loop settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub idle: IdleBackoff,
    pub handler_timeout: Duration,
    pub lease_timeout: Option<Duration>,
    pub retry: RetryPolicy,
    /// `max_attempts` stamped on new jobs.
    pub default_max_attempts: u32,
}

impl WorkerConfig {
    /// Per-loop config; `name` tags the loop's log lines.
    pub fn dispatcher_config(&self, name: impl Into<String>) -> DispatcherConfig {
        DispatcherConfig::default()
            .with_name(name)
            .with_idle(self.idle)
            .with_handler_timeout(self.handler_timeout)
            .with_lease_timeout(self.lease_timeout)
    }
}

/// Outbound email service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailConfig {
    pub api_url: String,
    pub timeout: Duration,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:3000/external/send-email".to_string(),
            timeout: Duration::from_millis(3000),
        }
    }
}

/// Full process configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub worker: WorkerConfig,
    pub email: EmailConfig,
}

impl AppConfig {
    /// Load from the process environment, after reading `.env` if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env { lookup: &lookup };

        let idle_interval = env.millis("WORKER_IDLE_INTERVAL_MS", 1000)?;
        let idle = match env.optional::<u64>("WORKER_IDLE_MAX_MS")? {
            Some(max) => IdleBackoff::Adaptive {
                min: idle_interval,
                max: Duration::from_millis(max),
            },
            None => IdleBackoff::Fixed(idle_interval),
        };

        let base_delay = env.millis("RETRY_DELAY_MS", 5000)?;
        let max_delay = env.millis("RETRY_MAX_DELAY_MS", 300_000)?;
        let retry = match env.parse("RETRY_BACKOFF", BackoffStrategy::Fixed)? {
            BackoffStrategy::Fixed => RetryPolicy::fixed(base_delay),
            BackoffStrategy::Linear => RetryPolicy::linear(base_delay, max_delay),
            BackoffStrategy::Exponential => RetryPolicy::exponential(base_delay, max_delay),
        };

        let external_failure_rate: f64 = env.parse("EXTERNAL_FAILURE_RATE", 0.5)?;
        if !(0.0..=1.0).contains(&external_failure_rate) {
            return Err(ConfigError::Invalid {
                name: "EXTERNAL_FAILURE_RATE",
                value: external_failure_rate.to_string(),
                reason: "must be between 0 and 1".to_string(),
            });
        }

        let default_max_attempts: u32 = env.parse("DEFAULT_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?;
        if default_max_attempts == 0 {
            return Err(ConfigError::Invalid {
                name: "DEFAULT_MAX_ATTEMPTS",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let email_defaults = EmailConfig::default();

        Ok(Self {
            server: ServerConfig {
                host: env.string("HOST", "0.0.0.0"),
                port: env.parse("PORT", 3000)?,
                external_failure_rate,
                embedded_workers: env.parse("EMBEDDED_WORKERS", 0)?,
            },
            store: StoreConfig {
                use_persistent: env.parse("USE_PERSISTENT_STORES", false)?,
                database_url: env.get("DATABASE_URL"),
                max_connections: env.parse("DATABASE_MAX_CONNECTIONS", 10)?,
            },
            worker: WorkerConfig {
                concurrency: env.parse::<usize>("WORKER_CONCURRENCY", 1)?.max(1),
                idle,
                handler_timeout: env.millis("WORKER_HANDLER_TIMEOUT_MS", 10_000)?,
                lease_timeout: env
                    .optional::<u64>("WORKER_LEASE_TIMEOUT_MS")?
                    .map(Duration::from_millis),
                retry,
                default_max_attempts,
            },
            email: EmailConfig {
                api_url: env.string("EMAIL_API_URL", &email_defaults.api_url),
                timeout: env.millis("EMAIL_API_TIMEOUT_MS", 3000)?,
            },
        })
    }
}

struct Env<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Env<'_> {
    /// Trimmed value; blank counts as unset.
    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, name: &str, default: &str) -> String {
        self.get(name).unwrap_or_else(|| default.to_string())
    }

    fn optional<T>(&self, name: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(name)
            .map(|raw| {
                raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
                    name,
                    value: raw.clone(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    fn parse<T>(&self, name: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        Ok(self.optional(name)?.unwrap_or(default))
    }

    fn millis(&self, name: &'static str, default: u64) -> Result<Duration, ConfigError> {
        self.parse(name, default).map(Duration::from_millis)
    }
}
