//! Dispatch loop: claim, execute under a timeout, record the outcome.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use jobforge_core::JobStatus;

use super::registry::{HandlerError, HandlerRegistry};
use super::retry::RetryPolicy;
use super::store::{JobStore, JobStoreError};
use super::types::{Job, StatusUpdate};

/// How long an idle dispatcher waits before polling again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleBackoff {
    /// Always wait the same interval.
    Fixed(Duration),
    /// Start at `min`, double on every empty poll up to `max`, reset after a
    /// claim.
    Adaptive { min: Duration, max: Duration },
}

impl Default for IdleBackoff {
    fn default() -> Self {
        IdleBackoff::Fixed(Duration::from_millis(1000))
    }
}

impl IdleBackoff {
    pub fn initial(&self) -> Duration {
        match *self {
            IdleBackoff::Fixed(d) => d,
            IdleBackoff::Adaptive { min, .. } => min,
        }
    }

    /// Wait to use after an empty poll that waited `current`.
    pub fn next(&self, current: Duration) -> Duration {
        match *self {
            IdleBackoff::Fixed(d) => d,
            IdleBackoff::Adaptive { min, max } => current.saturating_mul(2).clamp(min, max.max(min)),
        }
    }
}

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Name for logging
    pub name: String,
    pub idle: IdleBackoff,
    /// Upper bound on a single handler execution.
    pub handler_timeout: Duration,
    /// Reclaim `processing` jobs whose claim is older than this.
    pub lease_timeout: Option<Duration>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            name: "dispatcher".to_string(),
            idle: IdleBackoff::default(),
            handler_timeout: Duration::from_secs(10),
            lease_timeout: None,
        }
    }
}

impl DispatcherConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_idle(mut self, idle: IdleBackoff) -> Self {
        self.idle = idle;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn with_lease_timeout(mut self, lease: Option<Duration>) -> Self {
        self.lease_timeout = lease;
        self
    }
}

/// Dispatcher runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct DispatcherStats {
    pub jobs_claimed: u64,
    pub jobs_completed: u64,
    pub jobs_rescheduled: u64,
    pub jobs_failed: u64,
    pub jobs_skipped: u64,
    pub consistency_faults: u64,
    pub store_errors: u64,
    pub uptime_secs: u64,
}

/// What happened to one claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Rescheduled { attempts: u32, run_at: DateTime<Utc> },
    Failed { attempts: u32 },
    /// Already terminal when execution was about to start.
    Skipped,
    /// The conditional update matched no row.
    Inconsistent,
    /// The store rejected the update; the job stays `processing`.
    Unrecorded(String),
}

/// Result of one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    Idle,
    Processed(JobOutcome),
}

/// Claims jobs from a store and runs them with registered handlers.
///
/// Dispatchers share nothing but the store; run as many as needed.
pub struct Dispatcher<S> {
    store: S,
    registry: Arc<HandlerRegistry>,
    retry: RetryPolicy,
    config: DispatcherConfig,
    stats: Arc<Mutex<DispatcherStats>>,
}

impl<S: JobStore + 'static> Dispatcher<S> {
    pub fn new(store: S, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            store,
            registry,
            retry: RetryPolicy::default(),
            config: DispatcherConfig::default(),
            stats: Arc::new(Mutex::new(DispatcherStats::default())),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn stats(&self) -> DispatcherStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn record(&self, f: impl FnOnce(&mut DispatcherStats)) {
        if let Ok(mut s) = self.stats.lock() {
            f(&mut s);
        }
    }

    /// Claim at most one job and process it.
    pub async fn tick(&self) -> Result<Tick, JobStoreError> {
        let Some(job) = self.store.claim_next(self.config.lease_timeout).await? else {
            return Ok(Tick::Idle);
        };

        self.record(|s| s.jobs_claimed += 1);
        debug!(
            worker = %self.config.name,
            job_id = %job.id,
            tenant_id = %job.tenant_id,
            job_type = %job.job_type,
            attempts = job.attempts,
            "job claimed"
        );

        Ok(Tick::Processed(self.process(job).await))
    }

    /// Execute a claimed job and record the outcome.
    ///
    /// Handler errors and timeouts go through the retry policy; nothing here
    /// propagates.
    pub async fn process(&self, job: Job) -> JobOutcome {
        if job.status.is_terminal() {
            self.record(|s| s.jobs_skipped += 1);
            debug!(worker = %self.config.name, job_id = %job.id, status = %job.status, "job already terminal, skipping");
            return JobOutcome::Skipped;
        }

        let update = match self.execute(&job).await {
            Ok(()) => StatusUpdate::completed(&job),
            Err(e) => {
                warn!(
                    worker = %self.config.name,
                    job_id = %job.id,
                    tenant_id = %job.tenant_id,
                    job_type = %job.job_type,
                    error = %e,
                    "job execution failed"
                );
                self.retry.on_failure(&job, e.to_string(), Utc::now()).into_update(&job)
            }
        };

        match self.store.update_status(&update).await {
            Ok(0) => {
                self.record(|s| s.consistency_faults += 1);
                error!(
                    worker = %self.config.name,
                    job_id = %job.id,
                    tenant_id = %job.tenant_id,
                    status = %update.status,
                    "consistency fault: status update matched no row"
                );
                JobOutcome::Inconsistent
            }
            Ok(_) => self.settled(&job, update),
            Err(e) => {
                self.record(|s| s.store_errors += 1);
                error!(
                    worker = %self.config.name,
                    job_id = %job.id,
                    tenant_id = %job.tenant_id,
                    error = %e,
                    "failed to record job outcome"
                );
                JobOutcome::Unrecorded(e.to_string())
            }
        }
    }

    /// A panicking handler fails only its own job.
    async fn execute(&self, job: &Job) -> Result<(), HandlerError> {
        let handler = self.registry.resolve(&job.job_type)?;
        let run = AssertUnwindSafe(handler.execute(&job.payload)).catch_unwind();
        match tokio::time::timeout(self.config.handler_timeout, run).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(HandlerError::Panicked(panic_message(panic.as_ref()))),
            Err(_) => Err(HandlerError::Timeout(self.config.handler_timeout)),
        }
    }

    fn settled(&self, job: &Job, update: StatusUpdate) -> JobOutcome {
        let attempts = update.attempts.unwrap_or(job.attempts);
        match (update.status, update.run_at) {
            (JobStatus::Completed, _) => {
                self.record(|s| s.jobs_completed += 1);
                info!(worker = %self.config.name, job_id = %job.id, tenant_id = %job.tenant_id, "job completed");
                JobOutcome::Completed
            }
            (JobStatus::Pending, Some(run_at)) => {
                self.record(|s| s.jobs_rescheduled += 1);
                info!(
                    worker = %self.config.name,
                    job_id = %job.id,
                    tenant_id = %job.tenant_id,
                    attempts,
                    run_at = %run_at,
                    "job rescheduled"
                );
                JobOutcome::Rescheduled { attempts, run_at }
            }
            _ => {
                self.record(|s| s.jobs_failed += 1);
                error!(
                    worker = %self.config.name,
                    job_id = %job.id,
                    tenant_id = %job.tenant_id,
                    attempts,
                    error = update.last_error.as_deref().unwrap_or_default(),
                    "job failed permanently"
                );
                JobOutcome::Failed { attempts }
            }
        }
    }

    /// Poll until `shutdown` flips to `true` or its sender is dropped.
    ///
    /// An in-flight job always finishes before the loop exits.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.config.name, "dispatcher started");
        let started = Instant::now();
        let mut idle = self.config.idle.initial();

        loop {
            // Err means the sender is gone.
            if *shutdown.borrow() || shutdown.has_changed().is_err() {
                break;
            }

            let wait = match self.tick().await {
                Ok(Tick::Processed(_)) => {
                    idle = self.config.idle.initial();
                    None
                }
                Ok(Tick::Idle) => {
                    let wait = idle;
                    idle = self.config.idle.next(idle);
                    Some(wait)
                }
                Err(e) => {
                    self.record(|s| s.store_errors += 1);
                    error!(worker = %self.config.name, error = %e, "failed to claim job");
                    Some(idle)
                }
            };

            self.record(|s| s.uptime_secs = started.elapsed().as_secs());

            if let Some(wait) = wait {
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        info!(worker = %self.config.name, "dispatcher stopped");
    }

    /// Run the loop on the current tokio runtime.
    pub fn spawn(self) -> DispatcherHandle {
        let (tx, rx) = watch::channel(false);
        let name = self.config.name.clone();
        let stats = self.stats.clone();
        let join = tokio::spawn(self.run(rx));

        DispatcherHandle {
            name,
            shutdown: tx,
            join,
            stats,
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

/// Handle to control a running dispatcher.
#[derive(Debug)]
pub struct DispatcherHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<DispatcherStats>>,
}

impl DispatcherHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get current dispatcher statistics.
    pub fn stats(&self) -> DispatcherStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Request graceful shutdown and wait for the loop to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(worker = %self.name, error = %e, "dispatcher task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::registry::FnHandler;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::{InsertOutcome, NewJob};
    use jobforge_core::{JobId, JobType, TenantId};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// In-memory store that fails claims or updates on demand.
    struct FlakyStore {
        inner: InMemoryJobStore,
        claim_failures: AtomicU32,
        fail_updates: AtomicBool,
    }

    impl FlakyStore {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: InMemoryJobStore::new(),
                claim_failures: AtomicU32::new(0),
                fail_updates: AtomicBool::new(false),
            })
        }
    }

    #[async_trait::async_trait]
    impl JobStore for FlakyStore {
        async fn insert_if_absent(&self, job: NewJob) -> Result<InsertOutcome, JobStoreError> {
            self.inner.insert_if_absent(job).await
        }

        async fn claim_next(&self, lease: Option<Duration>) -> Result<Option<Job>, JobStoreError> {
            let fail = self
                .claim_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                return Err(JobStoreError::Unavailable("connection refused".into()));
            }
            self.inner.claim_next(lease).await
        }

        async fn update_status(&self, update: &StatusUpdate) -> Result<u64, JobStoreError> {
            if self.fail_updates.load(Ordering::SeqCst) {
                return Err(JobStoreError::Storage("disk full".into()));
            }
            self.inner.update_status(update).await
        }

        async fn get_by_id(
            &self,
            tenant_id: &TenantId,
            job_id: JobId,
        ) -> Result<Option<Job>, JobStoreError> {
            self.inner.get_by_id(tenant_id, job_id).await
        }
    }

    fn fast_idle() -> DispatcherConfig {
        DispatcherConfig::default().with_idle(IdleBackoff::Fixed(Duration::from_millis(5)))
    }

    async fn wait_for_completed(handle: &DispatcherHandle, n: u64) {
        for _ in 0..400 {
            if handle.stats().jobs_completed >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn tenant() -> TenantId {
        "T1".parse().unwrap()
    }

    fn registry(result: Result<(), HandlerError>) -> Arc<HandlerRegistry> {
        Arc::new(HandlerRegistry::new().with(
            JobType::SendEmail,
            FnHandler::new(move |_payload| {
                let result = result.clone();
                async move { result }
            }),
        ))
    }

    async fn enqueue(store: &InMemoryJobStore, max_attempts: u32) -> jobforge_core::JobId {
        let job = NewJob::new(tenant(), JobType::SendEmail, json!({"to": "a@b.com"}))
            .with_max_attempts(max_attempts);
        store.insert_if_absent(job).await.unwrap().job_id
    }

    #[tokio::test]
    async fn successful_job_completes() {
        let store = InMemoryJobStore::arc();
        let id = enqueue(&store, 3).await;
        let dispatcher = Dispatcher::new(store.clone(), registry(Ok(())));

        assert_eq!(dispatcher.tick().await.unwrap(), Tick::Processed(JobOutcome::Completed));
        assert_eq!(dispatcher.tick().await.unwrap(), Tick::Idle);

        let row = store.get_by_id(&tenant(), id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Completed);
        assert_eq!(row.attempts, 0);
        assert_eq!(dispatcher.stats().jobs_completed, 1);
    }

    #[tokio::test]
    async fn failing_job_exhausts_its_attempts() {
        let store = InMemoryJobStore::arc();
        let id = enqueue(&store, 3).await;
        let dispatcher = Dispatcher::new(
            store.clone(),
            registry(Err(HandlerError::Upstream { status: 500 })),
        )
        .with_retry_policy(RetryPolicy::immediate());

        let mut last_run_at = None;
        for expected in 1..=2 {
            match dispatcher.tick().await.unwrap() {
                Tick::Processed(JobOutcome::Rescheduled { attempts, run_at }) => {
                    assert_eq!(attempts, expected);
                    assert!(last_run_at.is_none_or(|prev| run_at > prev));
                    last_run_at = Some(run_at);
                }
                other => panic!("unexpected tick: {other:?}"),
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        assert_eq!(
            dispatcher.tick().await.unwrap(),
            Tick::Processed(JobOutcome::Failed { attempts: 3 })
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(dispatcher.tick().await.unwrap(), Tick::Idle);

        let row = store.get_by_id(&tenant(), id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Failed);
        assert_eq!(row.attempts, 3);
        assert_eq!(row.last_error.as_deref(), Some("upstream returned status 500"));
    }

    #[tokio::test]
    async fn slow_handler_times_out_and_is_rescheduled() {
        let store = InMemoryJobStore::arc();
        let id = enqueue(&store, 3).await;
        let registry = Arc::new(HandlerRegistry::new().with(
            JobType::SendEmail,
            FnHandler::new(|_payload| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            }),
        ));
        let dispatcher = Dispatcher::new(store.clone(), registry).with_config(
            DispatcherConfig::default().with_handler_timeout(Duration::from_millis(20)),
        );

        let tick = dispatcher.tick().await.unwrap();
        assert!(matches!(tick, Tick::Processed(JobOutcome::Rescheduled { attempts: 1, .. })));

        let row = store.get_by_id(&tenant(), id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Pending);
        assert!(row.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn missing_handler_is_a_retryable_failure() {
        let store = InMemoryJobStore::arc();
        let id = enqueue(&store, 1).await;
        let dispatcher = Dispatcher::new(store.clone(), Arc::new(HandlerRegistry::new()));

        assert_eq!(
            dispatcher.tick().await.unwrap(),
            Tick::Processed(JobOutcome::Failed { attempts: 1 })
        );
        let row = store.get_by_id(&tenant(), id).await.unwrap().unwrap();
        assert!(row.last_error.unwrap().contains("no handler registered"));
    }

    #[tokio::test]
    async fn lost_claim_is_a_consistency_fault() {
        let store = InMemoryJobStore::arc();
        enqueue(&store, 3).await;
        let job = store.claim_next(None).await.unwrap().unwrap();
        store.update_status(&StatusUpdate::completed(&job)).await.unwrap();

        let dispatcher = Dispatcher::new(store.clone(), registry(Ok(())));
        assert_eq!(dispatcher.process(job).await, JobOutcome::Inconsistent);
        assert_eq!(dispatcher.stats().consistency_faults, 1);
    }

    #[tokio::test]
    async fn terminal_job_is_skipped() {
        let store = InMemoryJobStore::arc();
        enqueue(&store, 3).await;
        let mut job = store.claim_next(None).await.unwrap().unwrap();
        job.status = JobStatus::Completed;

        let dispatcher = Dispatcher::new(store, registry(Ok(())));
        assert_eq!(dispatcher.process(job).await, JobOutcome::Skipped);
    }

    #[tokio::test]
    async fn panicking_handler_fails_only_its_job() {
        let store = InMemoryJobStore::arc();
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(enqueue(&store, 3).await);
        }

        let calls = Arc::new(AtomicU32::new(0));
        let registry = Arc::new(HandlerRegistry::new().with(
            JobType::SendEmail,
            FnHandler::new({
                let calls = calls.clone();
                move |_payload| {
                    let first = calls.fetch_add(1, Ordering::SeqCst) == 0;
                    async move {
                        if first {
                            panic!("template missing");
                        }
                        Ok(())
                    }
                }
            }),
        ));

        let handle = Dispatcher::new(store.clone(), registry)
            .with_retry_policy(RetryPolicy::immediate())
            .with_config(fast_idle())
            .spawn();
        wait_for_completed(&handle, 3).await;

        let stats = handle.stats();
        assert_eq!(stats.jobs_completed, 3);
        assert_eq!(stats.jobs_rescheduled, 1);
        handle.shutdown().await;

        let mut panicked = 0;
        for id in ids {
            let row = store.get_by_id(&tenant(), id).await.unwrap().unwrap();
            assert_eq!(row.status, JobStatus::Completed);
            if let Some(err) = row.last_error {
                assert_eq!(err, "handler panicked: template missing");
                assert_eq!(row.attempts, 1);
                panicked += 1;
            }
        }
        assert_eq!(panicked, 1);
    }

    #[tokio::test]
    async fn claim_errors_do_not_stop_the_loop() {
        let store = FlakyStore::new();
        store.claim_failures.store(3, Ordering::SeqCst);
        let id = enqueue(&store.inner, 3).await;

        let handle = Dispatcher::new(store.clone(), registry(Ok(())))
            .with_config(fast_idle())
            .spawn();
        wait_for_completed(&handle, 1).await;

        let stats = handle.stats();
        assert_eq!(stats.store_errors, 3);
        assert_eq!(stats.jobs_completed, 1);
        handle.shutdown().await;

        let row = store.get_by_id(&tenant(), id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn failed_outcome_write_leaves_job_processing() {
        let store = FlakyStore::new();
        let id = enqueue(&store.inner, 3).await;
        let job = store.claim_next(None).await.unwrap().unwrap();
        store.fail_updates.store(true, Ordering::SeqCst);

        let dispatcher = Dispatcher::new(store.clone(), registry(Ok(())));
        match dispatcher.process(job).await {
            JobOutcome::Unrecorded(msg) => assert!(msg.contains("disk full")),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(dispatcher.stats().store_errors, 1);
        assert_eq!(dispatcher.stats().jobs_completed, 0);

        let row = store.get_by_id(&tenant(), id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Processing);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropped_sender_stops_a_busy_loop() {
        let store = InMemoryJobStore::arc();
        enqueue(&store, 3).await;

        // Every run enqueues another job, so the loop never goes idle.
        let registry = Arc::new(HandlerRegistry::new().with(
            JobType::SendEmail,
            FnHandler::new({
                let store = store.clone();
                move |_payload| {
                    let store = store.clone();
                    async move {
                        enqueue(&store, 3).await;
                        Ok(())
                    }
                }
            }),
        ));

        let (tx, rx) = watch::channel(false);
        let dispatcher = Dispatcher::new(store.clone(), registry);
        let stats = dispatcher.stats.clone();
        let run = tokio::spawn(dispatcher.run(rx));

        for _ in 0..400 {
            if stats.lock().unwrap().jobs_completed >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        drop(tx);

        tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .expect("loop kept running after its sender was dropped")
            .unwrap();
    }

    #[tokio::test]
    async fn spawned_dispatcher_drains_and_shuts_down() {
        let store = InMemoryJobStore::arc();
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(enqueue(&store, 3).await);
        }

        let handle = Dispatcher::new(store.clone(), registry(Ok(())))
            .with_config(
                DispatcherConfig::default()
                    .with_name("test-worker")
                    .with_idle(IdleBackoff::Fixed(Duration::from_millis(5))),
            )
            .spawn();

        for _ in 0..200 {
            if handle.stats().jobs_completed == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(handle.name(), "test-worker");
        assert_eq!(handle.stats().jobs_completed, 3);
        handle.shutdown().await;

        for id in ids {
            let row = store.get_by_id(&tenant(), id).await.unwrap().unwrap();
            assert_eq!(row.status, JobStatus::Completed);
        }
    }

    #[test]
    fn adaptive_idle_doubles_up_to_cap() {
        let idle = IdleBackoff::Adaptive {
            min: Duration::from_millis(100),
            max: Duration::from_millis(350),
        };
        let mut wait = idle.initial();
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(wait.as_millis());
            wait = idle.next(wait);
        }
        assert_eq!(seen, vec![100, 200, 350, 350]);
        assert_eq!(IdleBackoff::default().next(Duration::ZERO), Duration::from_secs(1));
    }
}
