pub use shigoto_core::{
    Clock, InMemoryStorage, Job, JobError, JobPanic, JobRecord, JobRegistry, JobRunner,
    JobScheduler, JobStorage, ManualClock, RunnerOptions, ScheduleError, ScheduleOptions,
    SharedJobError, SystemClock, new_job_name,
};
pub use shigoto_core::{clock, cron, memory, record, registry, runner, scheduler, storage};

#[cfg(feature = "postgres")]
pub use shigoto_sqlx::{
    MIGRATOR, PgInstanceRegistry, PgJobStorage, PgPool, PgStorageConfig, run_migrations,
};
