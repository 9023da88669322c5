//! Core contract between scheduler, runner and storage backend.
//!
//! Why: make background work boring and predictable.
//! - Handlers state intent through typed hooks; no hidden retries or implicit
//!   success.
//! - The runner enforces pacing (concurrency bound, graceful drain); the
//!   scheduler owns submission semantics (dedup names, cron re-arming).
//! - Storage owns claim atomicity and eligibility; storage policy stays
//!   behind the trait boundary. Responsibilities do not bleed across layers.
pub mod clock;
pub mod cron;
pub mod memory;
pub mod record;
pub mod registry;
pub mod runner;
pub mod scheduler;
pub mod storage;

pub use clock::{Clock, ManualClock, SystemClock};
pub use memory::InMemoryStorage;
pub use record::{JobRecord, ScheduleOptions, new_job_name};
pub use registry::{Job, JobError, JobRegistry, SharedJobError};
pub use runner::{JobPanic, JobRunner, RunnerOptions};
pub use scheduler::{JobScheduler, ScheduleError};
pub use storage::JobStorage;
