//! Executes claimed jobs with bounded concurrency.
//!
//! The runner claims records from storage one at a time and spawns each onto
//! the runtime, keeping at most `max_concurrent_jobs` in flight. Claiming
//! stops when the cancellation token fires; jobs already in flight are drained
//! to completion, with the token visible to handlers that want to stop early.
//!
//! A claimed record is always finalized, whatever the handler did, and a
//! recurring record is re-armed for its next occurrence afterwards. A crashed
//! process therefore leaves its claims to orphan recovery rather than losing
//! the cron chain.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SystemClock};
use crate::cron;
use crate::record::JobRecord;
use crate::registry::{JobRegistry, SharedJobError};
use crate::storage::JobStorage;

const CLAIM_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Raised to `on_failed` when a handler panics instead of returning an error.
#[derive(Debug, thiserror::Error)]
#[error("job panicked: {message}")]
pub struct JobPanic {
    message: String,
}

impl JobPanic {
    fn from_payload(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "opaque panic payload".to_string());
        Self { message }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Upper bound on jobs executing at the same time in this process.
    pub max_concurrent_jobs: usize,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
        }
    }
}

/// Claims and executes jobs until cancelled.
pub struct JobRunner<S> {
    storage: S,
    registry: Arc<JobRegistry>,
    clock: Arc<dyn Clock>,
    options: RunnerOptions,
}

impl<S> JobRunner<S>
where
    S: JobStorage + Clone + Send + Sync + 'static,
{
    pub fn new(storage: S, registry: Arc<JobRegistry>) -> Self {
        Self {
            storage,
            registry,
            clock: Arc::new(SystemClock),
            options: RunnerOptions::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn options(mut self, options: RunnerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn max_concurrent_jobs(mut self, max: usize) -> Self {
        self.options.max_concurrent_jobs = max.max(1);
        self
    }

    /// Run until `cancel` fires, then drain in-flight jobs and return.
    pub async fn run(self, cancel: CancellationToken) {
        let mut tasks = FuturesUnordered::new();

        loop {
            // At capacity: wait for a slot before claiming more work.
            while tasks.len() >= self.options.max_concurrent_jobs {
                reap(tasks.next().await);
            }

            if cancel.is_cancelled() {
                break;
            }

            // No select against the token here: racing it with the wait
            // could drop a record the storage already marked in progress.
            // The wait honors the token itself and returns None promptly;
            // a delivered record is always spawned, even mid-shutdown.
            match self.storage.wait_for_next_job(&cancel, None).await {
                Ok(Some(record)) => {
                    let handle = tokio::spawn(run_one_job(
                        self.storage.clone(),
                        Arc::clone(&self.registry),
                        Arc::clone(&self.clock),
                        record,
                        cancel.clone(),
                    ));
                    tasks.push(handle);
                }
                Ok(None) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                }
                Err(error) => {
                    tracing::error!(error = %error, "failed to claim next job");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(CLAIM_RETRY_DELAY) => {}
                    }
                }
            }
        }

        // Drain remaining tasks
        while let Some(result) = tasks.next().await {
            reap(Some(result));
        }
    }
}

fn reap(result: Option<Result<(), tokio::task::JoinError>>) {
    if let Some(Err(error)) = result {
        tracing::error!(error = %error, "job task aborted");
    }
}

async fn run_one_job<S>(
    storage: S,
    registry: Arc<JobRegistry>,
    clock: Arc<dyn Clock>,
    record: JobRecord,
    cancel: CancellationToken,
) where
    S: JobStorage,
{
    tracing::trace!(job_type = %record.job_type, job_id = %record.id, "start job");

    match registry.entry(&record.job_type) {
        None => {
            // A record scheduled by a process with a richer registry. Nothing
            // to run here; drop it rather than wedge its group forever.
            tracing::error!(
                job_type = %record.job_type,
                job_id = %record.id,
                "no handler registered for claimed job"
            );
        }
        Some(entry) => {
            let outcome = AssertUnwindSafe(entry.execute(&record.parameters, &cancel))
                .catch_unwind()
                .await;
            let failure: Option<SharedJobError> = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(error)) => Some(Arc::from(error)),
                Err(payload) => Some(Arc::new(JobPanic::from_payload(payload))),
            };

            match failure {
                None => {
                    if let Err(error) = entry.on_succeeded(&record.parameters, &cancel).await {
                        tracing::error!(
                            error = %error,
                            job_type = %record.job_type,
                            "on_succeeded hook failed"
                        );
                    }
                }
                Some(error) => {
                    tracing::error!(
                        error = %error,
                        job_type = %record.job_type,
                        job_id = %record.id,
                        "job failed"
                    );
                    if let Err(hook_error) = entry
                        .on_failed(&record.parameters, &error, &cancel)
                        .await
                    {
                        tracing::error!(
                            error = %hook_error,
                            job_type = %record.job_type,
                            "on_failed hook failed"
                        );
                    }
                }
            }
        }
    }

    tracing::trace!(job_type = %record.job_type, job_id = %record.id, "finish job");

    if let Err(error) = storage.finalize_job(&record).await {
        tracing::error!(error = %error, job_id = %record.id, "failed to finalize job");
    }

    if let Some(expression) = &record.cron_expression {
        let now = clock.now();
        match cron::next_occurrence(expression, now) {
            Ok(next_at) => {
                let next = record.rearmed(next_at, now);
                if let Err(error) = storage.schedule_one(next).await {
                    tracing::error!(
                        error = %error,
                        job_type = %record.job_type,
                        "failed to re-arm recurring job"
                    );
                }
            }
            Err(error) => {
                tracing::error!(
                    error = %error,
                    job_type = %record.job_type,
                    "recurring job has no next occurrence"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStorage;
    use crate::record::ScheduleOptions;
    use crate::registry::{Job, JobError};
    use crate::scheduler::JobScheduler;
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct WorkParameters {
        tag: String,
    }

    #[derive(Default)]
    struct WorkLog {
        executed: AtomicUsize,
        succeeded: AtomicUsize,
        failures: Mutex<Vec<String>>,
    }

    struct WorkJob {
        log: Arc<WorkLog>,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl Job for WorkJob {
        const JOB_TYPE: &'static str = "work";
        type Parameters = WorkParameters;

        async fn execute(
            &self,
            parameters: &Self::Parameters,
            _cancel: &CancellationToken,
        ) -> Result<(), JobError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.log.executed.fetch_add(1, Ordering::SeqCst);
            match parameters.tag.as_str() {
                "fail" => Err("told to fail".into()),
                "panic" => panic!("told to panic"),
                _ => Ok(()),
            }
        }

        async fn on_succeeded(
            &self,
            _parameters: &Self::Parameters,
            _cancel: &CancellationToken,
        ) -> Result<(), JobError> {
            self.log.succeeded.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_failed(
            &self,
            _parameters: &Self::Parameters,
            error: &(dyn std::error::Error + Send + Sync + 'static),
            _cancel: &CancellationToken,
        ) -> Result<(), JobError> {
            self.log
                .failures
                .lock()
                .unwrap()
                .push(error.to_string());
            Ok(())
        }
    }

    fn setup(
        delay: Duration,
    ) -> (
        JobScheduler<InMemoryStorage>,
        Arc<WorkLog>,
        Arc<JobRegistry>,
        InMemoryStorage,
    ) {
        let log = Arc::new(WorkLog::default());
        let registry = Arc::new(JobRegistry::new().register(WorkJob {
            log: Arc::clone(&log),
            delay,
        }));
        let storage = InMemoryStorage::new();
        let scheduler = JobScheduler::new(storage.clone(), Arc::clone(&registry));
        (scheduler, log, registry, storage)
    }

    fn params(tag: &str) -> WorkParameters {
        WorkParameters { tag: tag.into() }
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached within 5s"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn executes_and_finalizes_scheduled_jobs() {
        let (scheduler, log, registry, storage) = setup(Duration::ZERO);
        let cancel = CancellationToken::new();

        for _ in 0..3 {
            scheduler.perform_asap::<WorkJob>(params("ok")).await.unwrap();
        }

        let runner = JobRunner::new(storage.clone(), registry);
        let handle = tokio::spawn(runner.run(cancel.clone()));

        wait_for(|| log.succeeded.load(Ordering::SeqCst) == 3).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(log.executed.load(Ordering::SeqCst), 3);
        assert!(storage.scheduled_jobs().await.unwrap().is_empty());
        assert!(storage.in_progress_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failures_are_routed_to_on_failed_and_do_not_stop_the_runner() {
        let (scheduler, log, registry, storage) = setup(Duration::ZERO);
        let cancel = CancellationToken::new();

        scheduler.perform_asap::<WorkJob>(params("fail")).await.unwrap();
        scheduler.perform_asap::<WorkJob>(params("ok")).await.unwrap();

        let handle = tokio::spawn(JobRunner::new(storage.clone(), registry).run(cancel.clone()));

        wait_for(|| log.executed.load(Ordering::SeqCst) == 2).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(log.succeeded.load(Ordering::SeqCst), 1);
        let failures = log.failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains("told to fail"));
        assert!(storage.in_progress_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn panics_are_reported_as_failures() {
        let (scheduler, log, registry, storage) = setup(Duration::ZERO);
        let cancel = CancellationToken::new();

        scheduler.perform_asap::<WorkJob>(params("panic")).await.unwrap();

        let handle = tokio::spawn(JobRunner::new(storage.clone(), registry).run(cancel.clone()));

        wait_for(|| !log.failures.lock().unwrap().is_empty()).await;
        cancel.cancel();
        handle.await.unwrap();

        let failures = log.failures.lock().unwrap();
        assert!(failures[0].contains("told to panic"));
        assert!(storage.in_progress_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recurring_jobs_are_rearmed_after_execution() {
        let (scheduler, log, registry, storage) = setup(Duration::ZERO);
        let cancel = CancellationToken::new();

        // Eligible immediately, next occurrence far enough away to not fire
        // again during the test.
        scheduler
            .perform_cron_immediately::<WorkJob>(params("ok"), "0 0 * * *")
            .await
            .unwrap();

        let handle = tokio::spawn(JobRunner::new(storage.clone(), registry).run(cancel.clone()));

        wait_for(|| log.succeeded.load(Ordering::SeqCst) == 1).await;
        // The re-armed record lands after finalization; poll for it.
        wait_for(|| {
            futures::executor::block_on(storage.scheduled_jobs())
                .unwrap()
                .len()
                == 1
        })
        .await;
        cancel.cancel();
        handle.await.unwrap();

        let scheduled = storage.scheduled_jobs().await.unwrap();
        assert_eq!(scheduled.len(), 1);
        let next = &scheduled[0];
        assert_eq!(next.cron_expression.as_deref(), Some("0 0 0 * * *"));
        assert!(next.perform_at > Utc::now());
        assert_eq!(next.options.name, "work@0 0 0 * * *");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrency_stays_within_the_configured_bound() {
        let log = Arc::new(WorkLog::default());
        let in_flight = Arc::new(AtomicIsize::new(0));
        let peak = Arc::new(AtomicIsize::new(0));

        struct GaugeJob {
            log: Arc<WorkLog>,
            in_flight: Arc<AtomicIsize>,
            peak: Arc<AtomicIsize>,
        }

        #[async_trait::async_trait]
        impl Job for GaugeJob {
            const JOB_TYPE: &'static str = "gauge";
            type Parameters = ();

            async fn execute(
                &self,
                _parameters: &Self::Parameters,
                _cancel: &CancellationToken,
            ) -> Result<(), JobError> {
                let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(current, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(25)).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                self.log.executed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let registry = Arc::new(JobRegistry::new().register(GaugeJob {
            log: Arc::clone(&log),
            in_flight: Arc::clone(&in_flight),
            peak: Arc::clone(&peak),
        }));
        let storage = InMemoryStorage::new();
        let scheduler = JobScheduler::new(storage.clone(), Arc::clone(&registry));
        let cancel = CancellationToken::new();

        for _ in 0..8 {
            scheduler.perform_asap::<GaugeJob>(()).await.unwrap();
        }

        let runner = JobRunner::new(storage.clone(), registry).max_concurrent_jobs(2);
        let handle = tokio::spawn(runner.run(cancel.clone()));

        wait_for(|| log.executed.load(Ordering::SeqCst) == 8).await;
        cancel.cancel();
        handle.await.unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn shutdown_drains_in_flight_jobs() {
        let (scheduler, log, registry, storage) = setup(Duration::from_millis(100));
        let cancel = CancellationToken::new();

        scheduler.perform_asap::<WorkJob>(params("ok")).await.unwrap();

        let handle = tokio::spawn(JobRunner::new(storage.clone(), registry).run(cancel.clone()));

        // Wait until the record is claimed, then cancel mid-execution.
        wait_for(|| {
            futures::executor::block_on(storage.in_progress_jobs())
                .unwrap()
                .len()
                == 1
        })
        .await;
        cancel.cancel();
        handle.await.unwrap();

        // run() only returned after the in-flight job finished and finalized.
        assert_eq!(log.succeeded.load(Ordering::SeqCst), 1);
        assert!(storage.in_progress_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn record_claimed_during_shutdown_is_still_executed() {
        // Storage that yields between marking a record in progress and
        // handing it to the runner, leaving room for a cancellation to land
        // in between. The runner must execute the delivered record anyway;
        // dropping it would strand an in-progress claim.
        #[derive(Clone)]
        struct SlowDeliveryStorage {
            inner: InMemoryStorage,
        }

        impl JobStorage for SlowDeliveryStorage {
            type Error = std::convert::Infallible;

            async fn schedule_one(&self, record: JobRecord) -> Result<(), Self::Error> {
                self.inner.schedule_one(record).await
            }

            async fn schedule_many(&self, records: Vec<JobRecord>) -> Result<(), Self::Error> {
                self.inner.schedule_many(records).await
            }

            async fn wait_for_next_job(
                &self,
                cancel: &CancellationToken,
                max_wait: Option<Duration>,
            ) -> Result<Option<JobRecord>, Self::Error> {
                let claimed = self.inner.wait_for_next_job(cancel, max_wait).await?;
                if claimed.is_some() {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Ok(claimed)
            }

            async fn finalize_job(&self, record: &JobRecord) -> Result<(), Self::Error> {
                self.inner.finalize_job(record).await
            }

            async fn scheduled_jobs(&self) -> Result<Vec<JobRecord>, Self::Error> {
                self.inner.scheduled_jobs().await
            }

            async fn in_progress_jobs(&self) -> Result<Vec<JobRecord>, Self::Error> {
                self.inner.in_progress_jobs().await
            }
        }

        let (scheduler, log, registry, inner) = setup(Duration::ZERO);
        let storage = SlowDeliveryStorage { inner };
        let cancel = CancellationToken::new();

        scheduler.perform_asap::<WorkJob>(params("ok")).await.unwrap();

        let handle = tokio::spawn(JobRunner::new(storage.clone(), registry).run(cancel.clone()));

        // Cancel once the claim is durable but the record is still in transit
        // to the runner loop.
        wait_for(|| {
            futures::executor::block_on(storage.in_progress_jobs())
                .unwrap()
                .len()
                == 1
        })
        .await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(log.executed.load(Ordering::SeqCst), 1);
        assert_eq!(log.succeeded.load(Ordering::SeqCst), 1);
        assert!(storage.in_progress_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claimed_record_without_a_handler_is_dropped() {
        let (_, log, registry, storage) = setup(Duration::ZERO);
        let cancel = CancellationToken::new();

        let now = Utc::now();
        let record = JobRecord::new(
            "ghost",
            "GhostParameters",
            serde_json::json!({}),
            ScheduleOptions::default(),
            now,
            now,
        );
        storage.schedule_one(record).await.unwrap();

        let handle = tokio::spawn(JobRunner::new(storage.clone(), registry).run(cancel.clone()));

        wait_for(|| {
            futures::executor::block_on(async {
                let scheduled = storage.scheduled_jobs().await.unwrap();
                let in_progress = storage.in_progress_jobs().await.unwrap();
                scheduled.is_empty() && in_progress.is_empty()
            })
        })
        .await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(log.executed.load(Ordering::SeqCst), 0);
    }
}
