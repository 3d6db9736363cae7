//! Persistent job scheduler: a registry of job factories, a cloneable handle for enqueueing and
//! a single dispatch loop feeding a bounded worker pool.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use fundscope_core::{
    JobCodecError, JobKey, JobOptions, JobSpec, JobStatus, ScheduledJob, Trigger, TriggerError,
};
use fundscope_storage::{JobStore, StoreError};
use thiserror::Error;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// A unit of work the scheduler can persist and later rebuild through [`JobRegistry`].
#[async_trait]
pub trait Job: Send + Sync {
    fn job_type(&self) -> &'static str;

    /// Versioned payload stored with the job; the registry factory decodes it back.
    fn description(&self) -> Result<String, JobCodecError>;

    /// Runs the job. Implementations check `cancel` at their suspension points.
    async fn execute(&self, cancel: CancellationToken) -> anyhow::Result<()>;
}

pub type JobFactory = Box<dyn Fn(&str) -> Result<Box<dyn Job>, RegistryError> + Send + Sync>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("job type `{0}` is not registered")]
    UnknownJobType(String),
    #[error("job type `{0}` is already registered")]
    AlreadyRegistered(String),
    #[error("job payload: {0}")]
    Codec(#[from] JobCodecError),
}

/// Maps job-type names to factories. Built once at startup, then shared read-only.
#[derive(Default)]
pub struct JobRegistry {
    factories: HashMap<String, JobFactory>,
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry")
            .field("job_types", &self.registered_types())
            .finish()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_job<F>(&mut self, type_name: &str, factory: F) -> Result<(), RegistryError>
    where
        F: Fn(&str) -> Result<Box<dyn Job>, RegistryError> + Send + Sync + 'static,
    {
        if self.factories.contains_key(type_name) {
            return Err(RegistryError::AlreadyRegistered(type_name.to_string()));
        }
        self.factories.insert(type_name.to_string(), Box::new(factory));
        Ok(())
    }

    pub fn get_job(
        &self,
        type_name: &str,
        description: &str,
    ) -> Result<Box<dyn Job>, RegistryError> {
        let factory = self
            .factories
            .get(type_name)
            .ok_or_else(|| RegistryError::UnknownJobType(type_name.to_string()))?;
        factory(description)
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }
}

/// What to persist for a job before its trigger is resolved into a next-run time.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDetail {
    pub key: JobKey,
    pub job_type: String,
    pub description: String,
    pub options: JobOptions,
}

impl JobDetail {
    pub fn from_spec(
        name: impl Into<String>,
        group: impl Into<String>,
        spec: &JobSpec,
    ) -> Result<Self, JobCodecError> {
        Ok(Self {
            key: JobKey::new(name, group),
            job_type: spec.kind().to_string(),
            description: spec.encode()?,
            options: JobOptions::default(),
        })
    }

    pub fn from_job(key: JobKey, job: &dyn Job) -> Result<Self, JobCodecError> {
        Ok(Self {
            key,
            job_type: job.job_type().to_string(),
            description: job.description()?,
            options: JobOptions::default(),
        })
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Trigger(#[from] TriggerError),
    #[error(transparent)]
    Codec(#[from] JobCodecError),
}

impl ScheduleError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, ScheduleError::Store(err) if err.is_duplicate())
    }
}

/// Cloneable entry point for enqueueing jobs; wakes the dispatch loop on every push.
#[derive(Clone)]
pub struct SchedulerHandle {
    store: Arc<dyn JobStore>,
    wake: Arc<Notify>,
}

impl fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerHandle").finish_non_exhaustive()
    }
}

impl SchedulerHandle {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub async fn schedule_job(
        &self,
        detail: JobDetail,
        trigger: Trigger,
    ) -> Result<ScheduledJob, ScheduleError> {
        let job = ScheduledJob {
            key: detail.key,
            job_type: detail.job_type,
            description: detail.description,
            next_run_time: trigger.first_fire_time(Utc::now())?,
            status: JobStatus::Scheduled,
            trigger: trigger.description(),
            options: detail.options,
            attempts: 0,
            last_error: None,
        };
        self.store.push(job.clone()).await?;
        debug!(key = %job.key, next_run_time = %job.next_run_time, "job scheduled");
        self.wake.notify_one();
        Ok(job)
    }

    /// Pushes an already-materialized row back onto the queue.
    pub async fn push(&self, job: ScheduledJob) -> Result<(), StoreError> {
        self.store.push(job).await?;
        self.wake.notify_one();
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutdatedPolicy {
    Run,
    Discard,
}

impl FromStr for OutdatedPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "run" => Ok(OutdatedPolicy::Run),
            "discard" => Ok(OutdatedPolicy::Discard),
            other => Err(format!("unknown outdated policy `{other}`")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub worker_limit: usize,
    pub poll_interval: Duration,
    pub outdated_threshold: chrono::Duration,
    pub outdated_policy: OutdatedPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_limit: 10,
            poll_interval: Duration::from_secs(1),
            outdated_threshold: chrono::Duration::days(7),
            outdated_policy: OutdatedPolicy::Run,
        }
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
    handle: SchedulerHandle,
    registry: Arc<JobRegistry>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        handle: SchedulerHandle,
        registry: Arc<JobRegistry>,
    ) -> Self {
        Self {
            config,
            handle,
            registry,
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Dispatches due jobs until `cancel` fires, then waits for every worker to return.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let workers = Arc::new(Semaphore::new(self.config.worker_limit.max(1)));
        let mut tasks = JoinSet::new();
        info!(worker_limit = self.config.worker_limit, "scheduler started");

        while !cancel.is_cancelled() {
            while let Some(joined) = tasks.try_join_next() {
                if let Err(err) = joined {
                    error!(error = %err, "job worker panicked");
                }
            }

            let wait = self.dispatch_due(&workers, &mut tasks, &cancel).await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.handle.wake.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!(in_flight = tasks.len(), "scheduler stopping; waiting for workers");
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "job worker panicked");
            }
        }
        Ok(())
    }

    /// Starts every job that is due now and returns how long to sleep before looking again.
    async fn dispatch_due(
        &self,
        workers: &Arc<Semaphore>,
        tasks: &mut JoinSet<()>,
        cancel: &CancellationToken,
    ) -> Duration {
        let store = self.handle.store();
        loop {
            let head = match store.head().await {
                Ok(job) => job,
                Err(StoreError::QueueEmpty) => return self.config.poll_interval,
                Err(err) => {
                    error!(error = %err, "reading job queue failed");
                    return self.config.poll_interval;
                }
            };
            let now = Utc::now();
            if head.next_run_time > now {
                let until = (head.next_run_time - now).to_std().unwrap_or_default();
                return until.min(self.config.poll_interval);
            }

            let permit = tokio::select! {
                _ = cancel.cancelled() => return Duration::ZERO,
                permit = workers.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return self.config.poll_interval,
                },
            };

            let job = match store.pop().await {
                Ok(job) => job,
                Err(StoreError::QueueEmpty) => return self.config.poll_interval,
                Err(err) => {
                    error!(error = %err, "popping job failed");
                    return self.config.poll_interval;
                }
            };
            if job.next_run_time > Utc::now() {
                // Another process took the due head between peek and pop.
                if let Err(err) = store.push(job).await {
                    warn!(error = %err, "returning early job to the queue failed");
                }
                return Duration::ZERO;
            }

            let worker = Worker {
                config: self.config.clone(),
                store: store.clone(),
                registry: self.registry.clone(),
            };
            let cancel = cancel.clone();
            tasks.spawn(async move {
                worker.process(job, cancel).await;
                drop(permit);
            });
        }
    }
}

struct Worker {
    config: SchedulerConfig,
    store: Arc<dyn JobStore>,
    registry: Arc<JobRegistry>,
}

impl Worker {
    async fn process(self, job: ScheduledJob, cancel: CancellationToken) {
        let span = info_span!(
            "job",
            key = %job.key,
            job_type = %job.job_type,
            attempt = job.attempts
        );
        self.process_inner(job, cancel).instrument(span).await
    }

    async fn process_inner(&self, job: ScheduledJob, cancel: CancellationToken) {
        let lateness = Utc::now() - job.next_run_time;
        if lateness > self.config.outdated_threshold {
            if self.config.outdated_policy == OutdatedPolicy::Discard {
                warn!(late_by_secs = lateness.num_seconds(), "discarding outdated job");
                self.dead_letter(job, "discarded: outdated".to_string()).await;
                return;
            }
            info!(late_by_secs = lateness.num_seconds(), "running outdated job");
        }

        let instance = match self.registry.get_job(&job.job_type, &job.description) {
            Ok(instance) => instance,
            Err(err) => {
                error!(error = %err, "cannot rebuild job");
                self.dead_letter(job, err.to_string()).await;
                return;
            }
        };

        let outcome = tokio::select! {
            result = instance.execute(cancel.clone()) => Some(result),
            _ = cancel.cancelled() => None,
        };
        match outcome {
            None => self.abandon(job).await,
            Some(Ok(())) => self.complete(job).await,
            Some(Err(_)) if cancel.is_cancelled() => self.abandon(job).await,
            Some(Err(err)) => self.fail(job, format!("{err:#}")).await,
        }
    }

    async fn abandon(&self, job: ScheduledJob) {
        info!("job abandoned on shutdown; returning it to the queue");
        match self.store.push(job).await {
            Ok(()) => {}
            Err(err) if err.is_duplicate() => debug!("a newer job already holds the key"),
            Err(err) => error!(error = %err, "requeueing abandoned job failed"),
        }
    }

    async fn complete(&self, mut job: ScheduledJob) {
        info!("job completed");
        job.last_error = None;
        match self.next_occurrence(&job) {
            Some(next) => {
                job.next_run_time = next;
                job.attempts = 0;
                self.reschedule(job).await;
            }
            None => {
                job.status = JobStatus::Completed;
                if let Err(err) = self.store.record_outcome(job).await {
                    error!(error = %err, "recording job completion failed");
                }
            }
        }
    }

    async fn fail(&self, mut job: ScheduledJob, message: String) {
        if job.attempts < job.options.max_retries {
            job.attempts += 1;
            job.next_run_time = Utc::now()
                + chrono::Duration::from_std(job.options.retry_interval)
                    .unwrap_or_else(|_| chrono::Duration::minutes(5));
            warn!(
                error = %message,
                attempt = job.attempts,
                max_retries = job.options.max_retries,
                retry_at = %job.next_run_time,
                "job failed; retrying"
            );
            job.last_error = Some(message);
            job.options.replace = true;
            self.reschedule(job).await;
            return;
        }
        error!(error = %message, attempts = job.attempts, "job exhausted its retries");
        self.dead_letter(job, message).await;
    }

    /// One-shot jobs are kept as `failed` rows; repeating jobs move on to their next occurrence.
    async fn dead_letter(&self, mut job: ScheduledJob, message: String) {
        job.last_error = Some(message);
        if let Some(next) = self.next_occurrence(&job) {
            job.next_run_time = next;
            job.attempts = 0;
            self.reschedule(job).await;
            return;
        }
        job.status = JobStatus::Failed;
        if let Err(err) = self.store.record_outcome(job).await {
            error!(error = %err, "recording dead-lettered job failed");
        }
    }

    fn next_occurrence(&self, job: &ScheduledJob) -> Option<chrono::DateTime<Utc>> {
        let trigger = match job.trigger() {
            Ok(trigger) => trigger,
            Err(err) => {
                warn!(error = %err, "stored trigger is unreadable");
                return None;
            }
        };
        match trigger.next_fire_time(job.next_run_time, Utc::now()) {
            Ok(next) => next,
            Err(err) => {
                warn!(error = %err, "cannot compute next occurrence");
                None
            }
        }
    }

    async fn reschedule(&self, mut job: ScheduledJob) {
        job.status = JobStatus::Scheduled;
        job.options.replace = true;
        if let Err(err) = self.store.push(job).await {
            error!(error = %err, "rescheduling job failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fundscope_storage::{JobMatcher, MemoryJobStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingJob {
        runs: Arc<AtomicUsize>,
        fail: bool,
        block: bool,
    }

    #[async_trait]
    impl Job for CountingJob {
        fn job_type(&self) -> &'static str {
            JobSpec::PMF_INIT
        }

        fn description(&self) -> Result<String, JobCodecError> {
            JobSpec::PmfInit.encode()
        }

        async fn execute(&self, cancel: CancellationToken) -> anyhow::Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.block {
                cancel.cancelled().await;
                anyhow::bail!("cancelled");
            }
            if self.fail {
                anyhow::bail!("upstream returned 503");
            }
            Ok(())
        }
    }

    fn registry(runs: Arc<AtomicUsize>, fail: bool, block: bool) -> Arc<JobRegistry> {
        let mut registry = JobRegistry::new();
        registry
            .register_job(JobSpec::PMF_INIT, move |description| {
                JobSpec::decode_as(JobSpec::PMF_INIT, description)?;
                Ok(Box::new(CountingJob {
                    runs: runs.clone(),
                    fail,
                    block,
                }) as Box<dyn Job>)
            })
            .unwrap();
        Arc::new(registry)
    }

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: Duration::from_millis(10),
            ..SchedulerConfig::default()
        }
    }

    fn init_detail(name: &str) -> JobDetail {
        JobDetail::from_spec(name, "PmfInit", &JobSpec::PmfInit).unwrap()
    }

    async fn wait_for<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn registry_rejects_unknown_and_duplicate_types() {
        let mut registry = JobRegistry::new();
        assert!(matches!(
            registry.get_job("Nope", "{}"),
            Err(RegistryError::UnknownJobType(_))
        ));
        registry
            .register_job("A", |_| Err(RegistryError::UnknownJobType("A".into())))
            .unwrap();
        assert!(matches!(
            registry.register_job("A", |_| Err(RegistryError::UnknownJobType("A".into()))),
            Err(RegistryError::AlreadyRegistered(_))
        ));
    }

    #[tokio::test]
    async fn same_key_twice_yields_one_job_unless_replaced() {
        let handle = SchedulerHandle::new(Arc::new(MemoryJobStore::new()));
        let once = Trigger::run_once(Duration::from_secs(60));
        handle.schedule_job(init_detail("x"), once.clone()).await.unwrap();
        let err = handle
            .schedule_job(init_detail("x"), once.clone())
            .await
            .unwrap_err();
        assert!(err.is_duplicate());

        let replacing = init_detail("x").with_options(JobOptions {
            replace: true,
            ..JobOptions::default()
        });
        handle.schedule_job(replacing, once).await.unwrap();
        assert_eq!(handle.store().size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn due_job_runs_once_and_is_recorded_completed() {
        let runs = Arc::new(AtomicUsize::new(0));
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let handle = SchedulerHandle::new(store.clone());
        let registry = registry(runs.clone(), false, false);
        let scheduler = Scheduler::new(fast_config(), handle.clone(), registry);
        handle
            .schedule_job(init_detail("init"), Trigger::run_once(Duration::ZERO))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let running = tokio::spawn(async move { scheduler.run(loop_cancel).await });
        let counter = runs.clone();
        wait_for(|| counter.load(Ordering::SeqCst) == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        running.await.unwrap().unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        let done = store.get(&JobKey::new("init", "PmfInit")).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(store.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failing_job_retries_then_is_dead_lettered() {
        let runs = Arc::new(AtomicUsize::new(0));
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let handle = SchedulerHandle::new(store.clone());
        let registry = registry(runs.clone(), true, false);
        let scheduler = Scheduler::new(fast_config(), handle.clone(), registry);
        let detail = init_detail("flaky").with_options(JobOptions {
            max_retries: 2,
            retry_interval: Duration::ZERO,
            replace: false,
        });
        handle
            .schedule_job(detail, Trigger::run_once(Duration::ZERO))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let running = tokio::spawn(async move { scheduler.run(loop_cancel).await });
        let counter = runs.clone();
        wait_for(|| counter.load(Ordering::SeqCst) == 3).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        running.await.unwrap().unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 3);
        let failed = store
            .scheduled_jobs(&[JobMatcher::Status(JobStatus::Failed)])
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts, 2);
        assert!(failed[0]
            .last_error
            .as_deref()
            .unwrap_or_default()
            .contains("503"));
    }

    #[tokio::test]
    async fn outdated_job_is_discarded_under_discard_policy() {
        let runs = Arc::new(AtomicUsize::new(0));
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let handle = SchedulerHandle::new(store.clone());
        let config = SchedulerConfig {
            outdated_policy: OutdatedPolicy::Discard,
            outdated_threshold: chrono::Duration::hours(1),
            ..fast_config()
        };
        let registry = registry(runs.clone(), false, false);
        let scheduler = Scheduler::new(config, handle.clone(), registry);
        let detail = init_detail("stale");
        handle
            .push(ScheduledJob {
                key: detail.key.clone(),
                job_type: detail.job_type,
                description: detail.description,
                next_run_time: Utc::now() - chrono::Duration::days(2),
                status: JobStatus::Scheduled,
                trigger: Trigger::run_once(Duration::ZERO).description(),
                options: JobOptions::default(),
                attempts: 0,
                last_error: None,
            })
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let running = tokio::spawn(async move { scheduler.run(loop_cancel).await });
        let probe = store.clone();
        for _ in 0..200 {
            if matches!(probe.get(&detail.key).await, Ok(row) if row.status == JobStatus::Failed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        running.await.unwrap().unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 0);
        let row = store.get(&detail.key).await.unwrap();
        assert_eq!(row.status, JobStatus::Failed);
        assert_eq!(row.last_error.as_deref(), Some("discarded: outdated"));
    }

    #[tokio::test]
    async fn cancellation_returns_in_flight_job_to_the_queue() {
        let runs = Arc::new(AtomicUsize::new(0));
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let handle = SchedulerHandle::new(store.clone());
        let registry = registry(runs.clone(), false, true);
        let scheduler = Scheduler::new(fast_config(), handle.clone(), registry);
        handle
            .schedule_job(init_detail("slow"), Trigger::run_once(Duration::ZERO))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let running = tokio::spawn(async move { scheduler.run(loop_cancel).await });
        let counter = runs.clone();
        wait_for(|| counter.load(Ordering::SeqCst) == 1).await;
        cancel.cancel();
        running.await.unwrap().unwrap();

        let row = store.get(&JobKey::new("slow", "PmfInit")).await.unwrap();
        assert_eq!(row.status, JobStatus::Scheduled);
        assert_eq!(row.attempts, 0);
        assert_eq!(store.size().await.unwrap(), 1);
    }
}
