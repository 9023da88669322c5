//! Submission API for jobs.
//!
//! The scheduler turns typed parameters into [`JobRecord`]s and hands them to
//! storage. The `on_scheduled` hook runs here, before persisting, so whatever
//! it does to the parameters is what later executes. `perform_now` bypasses
//! storage entirely and drives the full hook sequence inline.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SystemClock};
use crate::cron::{self, CronError};
use crate::record::{JobRecord, ScheduleOptions};
use crate::registry::{Job, JobEntry, JobError, JobRegistry, SharedJobError};
use crate::storage::JobStorage;

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    #[error("storage error: {0}")]
    Storage(#[source] E),
    #[error("failed to encode job parameters: {0}")]
    Encode(#[source] serde_json::Error),
    #[error(transparent)]
    Cron(#[from] CronError),
    #[error("no handler registered for job type {job_type:?}")]
    UnknownJobType { job_type: String },
    #[error("on_scheduled hook failed: {0}")]
    Hook(JobError),
    #[error("job execution failed: {0}")]
    Execution(SharedJobError),
}

/// Schedules jobs against a storage backend.
///
/// Cheap to clone when `S` is; clones share the registry and clock.
pub struct JobScheduler<S> {
    storage: S,
    registry: Arc<JobRegistry>,
    clock: Arc<dyn Clock>,
}

impl<S: Clone> Clone for JobScheduler<S> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            registry: Arc::clone(&self.registry),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<S> JobScheduler<S>
where
    S: JobStorage,
{
    pub fn new(storage: S, registry: Arc<JobRegistry>) -> Self {
        Self::with_clock(storage, registry, Arc::new(SystemClock))
    }

    pub fn with_clock(storage: S, registry: Arc<JobRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            registry,
            clock,
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    fn entry<J: Job>(&self) -> Result<&JobEntry, ScheduleError<S::Error>> {
        self.registry
            .entry(J::JOB_TYPE)
            .ok_or_else(|| ScheduleError::UnknownJobType {
                job_type: J::JOB_TYPE.to_string(),
            })
    }

    /// Encode parameters, run `on_scheduled` and build the record to persist.
    async fn build_record<J: Job>(
        &self,
        parameters: J::Parameters,
        options: ScheduleOptions,
        perform_at: DateTime<Utc>,
    ) -> Result<JobRecord, ScheduleError<S::Error>> {
        let entry = self.entry::<J>()?;
        let mut value = serde_json::to_value(&parameters).map_err(ScheduleError::Encode)?;
        let cancel = CancellationToken::new();
        entry
            .on_scheduled(&mut value, &cancel)
            .await
            .map_err(ScheduleError::Hook)?;

        Ok(JobRecord::new(
            J::JOB_TYPE,
            entry.parameters_type(),
            value,
            options,
            perform_at,
            self.clock.now(),
        ))
    }

    /// Run the job inline, without touching storage: `on_scheduled`, then
    /// `execute`, then `on_succeeded` or `on_failed`.
    pub async fn perform_now<J: Job>(
        &self,
        parameters: J::Parameters,
    ) -> Result<(), ScheduleError<S::Error>> {
        let entry = self.entry::<J>()?;
        let mut value = serde_json::to_value(&parameters).map_err(ScheduleError::Encode)?;
        let cancel = CancellationToken::new();
        entry
            .on_scheduled(&mut value, &cancel)
            .await
            .map_err(ScheduleError::Hook)?;

        match entry.execute(&value, &cancel).await {
            Ok(()) => {
                entry
                    .on_succeeded(&value, &cancel)
                    .await
                    .map_err(ScheduleError::Hook)?;
                Ok(())
            }
            Err(error) => {
                let error: SharedJobError = Arc::from(error);
                if let Err(hook_error) = entry.on_failed(&value, &error, &cancel).await {
                    tracing::error!(
                        job_type = J::JOB_TYPE,
                        error = %hook_error,
                        "on_failed hook failed"
                    );
                }
                Err(ScheduleError::Execution(error))
            }
        }
    }

    /// Queue the job for the earliest possible execution.
    pub async fn perform_asap<J: Job>(
        &self,
        parameters: J::Parameters,
    ) -> Result<(), ScheduleError<S::Error>> {
        self.perform_asap_with::<J>(parameters, ScheduleOptions::default())
            .await
    }

    pub async fn perform_asap_with<J: Job>(
        &self,
        parameters: J::Parameters,
        options: ScheduleOptions,
    ) -> Result<(), ScheduleError<S::Error>> {
        let now = self.clock.now();
        self.perform_at_with::<J>(parameters, now, options).await
    }

    /// Queue the job to run at or after `perform_at`.
    pub async fn perform_at<J: Job>(
        &self,
        parameters: J::Parameters,
        perform_at: DateTime<Utc>,
    ) -> Result<(), ScheduleError<S::Error>> {
        self.perform_at_with::<J>(parameters, perform_at, ScheduleOptions::default())
            .await
    }

    pub async fn perform_at_with<J: Job>(
        &self,
        parameters: J::Parameters,
        perform_at: DateTime<Utc>,
        options: ScheduleOptions,
    ) -> Result<(), ScheduleError<S::Error>> {
        let record = self.build_record::<J>(parameters, options, perform_at).await?;
        self.storage
            .schedule_one(record)
            .await
            .map_err(ScheduleError::Storage)
    }

    /// Queue a batch of jobs for the earliest possible execution, each under
    /// a fresh name.
    pub async fn perform_asap_many<J: Job>(
        &self,
        parameters: impl IntoIterator<Item = J::Parameters>,
    ) -> Result<(), ScheduleError<S::Error>> {
        let now = self.clock.now();
        self.perform_at_many::<J>(parameters, now).await
    }

    /// Queue a batch of jobs for `perform_at`, each under a fresh name.
    pub async fn perform_at_many<J: Job>(
        &self,
        parameters: impl IntoIterator<Item = J::Parameters>,
        perform_at: DateTime<Utc>,
    ) -> Result<(), ScheduleError<S::Error>> {
        let mut records = Vec::new();
        for item in parameters {
            records.push(
                self.build_record::<J>(item, ScheduleOptions::default(), perform_at)
                    .await?,
            );
        }
        self.storage
            .schedule_many(records)
            .await
            .map_err(ScheduleError::Storage)
    }

    /// Queue a recurring job. The first run lands on the next occurrence of
    /// `expression`; after each run the record is re-armed for the occurrence
    /// after that.
    ///
    /// The deduplication name is derived from the job type and the normalized
    /// expression, so calling this again with the same arguments replaces the
    /// pending record instead of stacking a second schedule.
    pub async fn perform_cron<J: Job>(
        &self,
        parameters: J::Parameters,
        expression: &str,
    ) -> Result<(), ScheduleError<S::Error>> {
        let normalized = cron::normalize(expression)?;
        let options = ScheduleOptions::named(cron_job_name(J::JOB_TYPE, &normalized));
        self.perform_cron_with::<J>(parameters, expression, options)
            .await
    }

    pub async fn perform_cron_with<J: Job>(
        &self,
        parameters: J::Parameters,
        expression: &str,
        options: ScheduleOptions,
    ) -> Result<(), ScheduleError<S::Error>> {
        let normalized = cron::normalize(expression)?;
        let perform_at = cron::next_occurrence(&normalized, self.clock.now())?;
        let record = self
            .build_record::<J>(parameters, options, perform_at)
            .await?
            .with_cron(normalized);
        self.storage
            .schedule_one(record)
            .await
            .map_err(ScheduleError::Storage)
    }

    /// Like [`perform_cron`](JobScheduler::perform_cron), but the first run is
    /// queued immediately instead of waiting for the next occurrence.
    pub async fn perform_cron_immediately<J: Job>(
        &self,
        parameters: J::Parameters,
        expression: &str,
    ) -> Result<(), ScheduleError<S::Error>> {
        let normalized = cron::normalize(expression)?;
        let options = ScheduleOptions::named(cron_job_name(J::JOB_TYPE, &normalized));
        let record = self
            .build_record::<J>(parameters, options, self.clock.now())
            .await?
            .with_cron(normalized);
        self.storage
            .schedule_one(record)
            .await
            .map_err(ScheduleError::Storage)
    }

    /// Poll storage until both queues are empty or `timeout` elapses.
    /// Intended for tests and draining on shutdown.
    pub async fn wait_until_idle(&self, timeout: Duration) -> Result<bool, ScheduleError<S::Error>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let scheduled = self
                .storage
                .scheduled_jobs()
                .await
                .map_err(ScheduleError::Storage)?;
            let in_progress = self
                .storage
                .in_progress_jobs()
                .await
                .map_err(ScheduleError::Storage)?;
            if scheduled.is_empty() && in_progress.is_empty() {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

fn cron_job_name(job_type: &str, normalized_expression: &str) -> String {
    format!("{job_type}@{normalized_expression}")
}
