//! Storage-facing contract: persist records, claim the next eligible one.
//!
//! Small surface, strong separation: the scheduler and runner drive; the
//! backend stores. Why:
//! - The backend owns claim atomicity; a record is returned to exactly one
//!   caller, however many tasks or processes are waiting.
//! - Eligibility (perform time reached, group free) and ordering (earliest
//!   `perform_at`, ties by creation) are part of the contract, not an
//!   implementation detail: older requests must not starve behind newer ones.
//! - Waiting is cooperative: implementations block on a wake signal plus a
//!   timer for the earliest future record, never busy-spin.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::record::JobRecord;

mod tmp {
    use super::*;

    /// Persistence and claiming engine for job records.
    ///
    /// All operations must be safe under concurrent callers; for distributed
    /// backends that includes callers in other processes.
    #[trait_variant::make(JobStorage: Send)]
    pub trait LocalJobStorage {
        type Error: std::error::Error + Send + Sync + 'static;

        /// Upsert a record by name among unstarted records. If the new record
        /// is immediately eligible, any blocked claimer must be woken.
        async fn schedule_one(&self, record: JobRecord) -> Result<(), Self::Error>;

        /// Batch form of [`schedule_one`](LocalJobStorage::schedule_one) with
        /// a single wake-up at the end.
        async fn schedule_many(&self, records: Vec<JobRecord>) -> Result<(), Self::Error>;

        /// Block until a record becomes eligible, claim it atomically and
        /// return it. Returns `Ok(None)` when `cancel` fires or `max_wait`
        /// elapses first. Among eligible records the one with the smallest
        /// `perform_at` wins, ties broken by creation order.
        async fn wait_for_next_job(
            &self,
            cancel: &CancellationToken,
            max_wait: Option<Duration>,
        ) -> Result<Option<JobRecord>, Self::Error>;

        /// Remove an in-progress record, freeing its group for the next claim.
        async fn finalize_job(&self, record: &JobRecord) -> Result<(), Self::Error>;

        /// Snapshot of unstarted records, ordered by eligibility. No claiming
        /// side effects.
        async fn scheduled_jobs(&self) -> Result<Vec<JobRecord>, Self::Error>;

        /// Snapshot of claimed records. No claiming side effects.
        async fn in_progress_jobs(&self) -> Result<Vec<JobRecord>, Self::Error>;
    }
}

pub use tmp::JobStorage;
