//! Job handlers and the registry that dispatches to them.
//!
//! Handlers implement [`Job`] with typed parameters; the registry erases the
//! parameter type behind JSON so records loaded from storage can be routed by
//! their `job_type` string alone. Registration is the only place the concrete
//! type is known, so the four hook closures built there carry all the
//! encode/decode work.

use std::collections::HashMap;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

/// Error type surfaced by job hooks.
pub type JobError = Box<dyn std::error::Error + Send + Sync>;

/// Shared failure handed to `on_failed`; also what executions report upward.
pub type SharedJobError = Arc<dyn std::error::Error + Send + Sync>;

/// A background job handler.
///
/// `JOB_TYPE` is the registry key persisted with every record; it must be
/// unique within a registry and stable across deployments, since records
/// scheduled by one process may be executed by another.
#[async_trait::async_trait]
pub trait Job: Send + Sync + 'static {
    const JOB_TYPE: &'static str;
    type Parameters: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Runs on the scheduling side before the record is persisted. May mutate
    /// the parameters; the mutated value is what gets stored.
    async fn on_scheduled(
        &self,
        _parameters: &mut Self::Parameters,
        _cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        Ok(())
    }

    /// The job body. Runs on the executing side after the record is claimed.
    async fn execute(
        &self,
        parameters: &Self::Parameters,
        cancel: &CancellationToken,
    ) -> Result<(), JobError>;

    /// Runs after [`execute`](Job::execute) returns `Ok`.
    async fn on_succeeded(
        &self,
        _parameters: &Self::Parameters,
        _cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        Ok(())
    }

    /// Runs after [`execute`](Job::execute) returns `Err` or panics.
    async fn on_failed(
        &self,
        _parameters: &Self::Parameters,
        _error: &(dyn std::error::Error + Send + Sync + 'static),
        _cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        Ok(())
    }
}

// Hooks own their arguments so their futures stay 'static; JobEntry's methods
// clone at the boundary instead.
type ScheduledHook = Box<
    dyn Fn(
            serde_json::Value,
            CancellationToken,
        ) -> BoxFuture<'static, Result<serde_json::Value, JobError>>
        + Send
        + Sync,
>;
type ExecuteHook = Box<
    dyn Fn(serde_json::Value, CancellationToken) -> BoxFuture<'static, Result<(), JobError>>
        + Send
        + Sync,
>;
type FailedHook = Box<
    dyn Fn(
            serde_json::Value,
            SharedJobError,
            CancellationToken,
        ) -> BoxFuture<'static, Result<(), JobError>>
        + Send
        + Sync,
>;

/// Erased hooks for one registered handler.
pub struct JobEntry {
    parameters_type: &'static str,
    on_scheduled: ScheduledHook,
    execute: ExecuteHook,
    on_succeeded: ExecuteHook,
    on_failed: FailedHook,
}

impl JobEntry {
    fn new<J: Job>(job: J) -> Self {
        let job = Arc::new(job);

        let on_scheduled: ScheduledHook = {
            let job = Arc::clone(&job);
            Box::new(move |value, cancel| {
                let job = Arc::clone(&job);
                async move {
                    let mut parameters: J::Parameters = serde_json::from_value(value)?;
                    job.on_scheduled(&mut parameters, &cancel).await?;
                    Ok(serde_json::to_value(&parameters)?)
                }
                .boxed()
            })
        };

        let execute: ExecuteHook = {
            let job = Arc::clone(&job);
            Box::new(move |value, cancel| {
                let job = Arc::clone(&job);
                async move {
                    let parameters: J::Parameters = serde_json::from_value(value)?;
                    job.execute(&parameters, &cancel).await
                }
                .boxed()
            })
        };

        let on_succeeded: ExecuteHook = {
            let job = Arc::clone(&job);
            Box::new(move |value, cancel| {
                let job = Arc::clone(&job);
                async move {
                    let parameters: J::Parameters = serde_json::from_value(value)?;
                    job.on_succeeded(&parameters, &cancel).await
                }
                .boxed()
            })
        };

        let on_failed: FailedHook = {
            let job = Arc::clone(&job);
            Box::new(move |value, error, cancel| {
                let job = Arc::clone(&job);
                async move {
                    let parameters: J::Parameters = serde_json::from_value(value)?;
                    job.on_failed(&parameters, error.as_ref(), &cancel).await
                }
                .boxed()
            })
        };

        Self {
            parameters_type: std::any::type_name::<J::Parameters>(),
            on_scheduled,
            execute,
            on_succeeded,
            on_failed,
        }
    }

    pub fn parameters_type(&self) -> &'static str {
        self.parameters_type
    }

    pub async fn on_scheduled(
        &self,
        parameters: &mut serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        let updated = (self.on_scheduled)(parameters.clone(), cancel.clone()).await?;
        *parameters = updated;
        Ok(())
    }

    pub async fn execute(
        &self,
        parameters: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        (self.execute)(parameters.clone(), cancel.clone()).await
    }

    pub async fn on_succeeded(
        &self,
        parameters: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        (self.on_succeeded)(parameters.clone(), cancel.clone()).await
    }

    pub async fn on_failed(
        &self,
        parameters: &serde_json::Value,
        error: &SharedJobError,
        cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        (self.on_failed)(parameters.clone(), Arc::clone(error), cancel.clone()).await
    }
}

/// Maps `job_type` strings to erased handlers.
#[derive(Default)]
pub struct JobRegistry {
    entries: HashMap<String, JobEntry>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one with the same
    /// [`Job::JOB_TYPE`].
    pub fn register<J: Job>(mut self, job: J) -> Self {
        let previous = self
            .entries
            .insert(J::JOB_TYPE.to_string(), JobEntry::new(job));
        if previous.is_some() {
            tracing::warn!(job_type = J::JOB_TYPE, "job type registered twice");
        }
        self
    }

    pub fn entry(&self, job_type: &str) -> Option<&JobEntry> {
        self.entries.get(job_type)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
