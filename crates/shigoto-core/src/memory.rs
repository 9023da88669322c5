//! In-memory storage backend.
//!
//! Suitable for tests and single-process deployments; records are lost on
//! restart. Two maps behind one mutex: `scheduled`, keyed by deduplication
//! name, and `in_progress`, keyed by record id. The wake signal is a `watch`
//! channel: waiters subscribe while still holding the state lock, so a wake
//! sent after the scan can never be missed, and the channel's version counter
//! gives the renew-on-fire behavior a plain one-shot would need manually.

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::record::JobRecord;
use crate::storage::JobStorage;

#[derive(Default)]
struct State {
    scheduled: HashMap<String, JobRecord>,
    in_progress: HashMap<Uuid, JobRecord>,
}

struct Inner {
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
    wake: watch::Sender<()>,
}

/// Single-process storage backend.
#[derive(Clone)]
pub struct InMemoryStorage {
    inner: Arc<Inner>,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let (wake, _) = watch::channel(());
        Self {
            inner: Arc::new(Inner {
                clock,
                state: Mutex::new(State::default()),
                wake,
            }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().expect("storage mutex poisoned")
    }

    fn upsert(state: &mut State, mut record: JobRecord) {
        // Replacing an unstarted record with the same name keeps the original
        // creation time, mirroring the SQL upsert which only overwrites
        // id/parameters/perform_at.
        if let Some(existing) = state.scheduled.get(&record.options.name) {
            record.created_at = existing.created_at;
        }
        state.scheduled.insert(record.options.name.clone(), record);
    }

    fn claim_next(state: &mut State, now: DateTime<Utc>) -> Option<JobRecord> {
        let busy_groups: HashSet<String> = state
            .in_progress
            .values()
            .filter_map(|record| record.options.group.clone())
            .collect();

        let name = state
            .scheduled
            .values()
            .filter(|record| record.perform_at <= now)
            .filter(|record| {
                record
                    .options
                    .group
                    .as_ref()
                    .is_none_or(|group| !busy_groups.contains(group))
            })
            .min_by_key(|record| (record.perform_at, record.created_at))
            .map(|record| record.options.name.clone())?;

        let mut record = state.scheduled.remove(&name)?;
        record.started_at = Some(now);
        state.in_progress.insert(record.id, record.clone());
        Some(record)
    }

    /// Time until the earliest scheduled-but-not-yet-eligible record, if any.
    fn time_until_next(state: &State, now: DateTime<Utc>) -> Option<Duration> {
        state
            .scheduled
            .values()
            .filter(|record| record.perform_at > now)
            .map(|record| record.perform_at)
            .min()
            .and_then(|earliest| (earliest - now).to_std().ok())
    }
}

impl JobStorage for InMemoryStorage {
    type Error = Infallible;

    async fn schedule_one(&self, record: JobRecord) -> Result<(), Self::Error> {
        let mut state = self.lock_state();
        Self::upsert(&mut state, record);
        let _ = self.inner.wake.send_replace(());
        Ok(())
    }

    async fn schedule_many(&self, records: Vec<JobRecord>) -> Result<(), Self::Error> {
        let mut state = self.lock_state();
        for record in records {
            Self::upsert(&mut state, record);
        }
        let _ = self.inner.wake.send_replace(());
        Ok(())
    }

    async fn wait_for_next_job(
        &self,
        cancel: &CancellationToken,
        max_wait: Option<Duration>,
    ) -> Result<Option<JobRecord>, Self::Error> {
        let deadline = max_wait.map(|wait| tokio::time::Instant::now() + wait);

        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }

            let (claimed, mut wake_rx, until_next) = {
                let mut state = self.lock_state();
                // Subscribe while holding the lock: every wake is sent under
                // the same lock, so nothing can fire between scan and sleep
                // without this receiver observing it.
                let wake_rx = self.inner.wake.subscribe();
                let now = self.inner.clock.now();
                let claimed = Self::claim_next(&mut state, now);
                let until_next = Self::time_until_next(&state, now);
                (claimed, wake_rx, until_next)
            };

            if let Some(record) = claimed {
                return Ok(Some(record));
            }

            let until_deadline = deadline.map(|at| {
                at.saturating_duration_since(tokio::time::Instant::now())
            });
            if until_deadline.is_some_and(|remaining| remaining.is_zero()) {
                return Ok(None);
            }

            let timer = match (until_next, until_deadline) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (Some(a), None) => Some(a),
                (None, Some(b)) => Some(b),
                (None, None) => None,
            };

            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = wake_rx.changed() => {}
                _ = async {
                    match timer {
                        Some(duration) => tokio::time::sleep(duration).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {}
            }

            if deadline.is_some_and(|at| tokio::time::Instant::now() >= at) {
                return Ok(None);
            }
        }
    }

    async fn finalize_job(&self, record: &JobRecord) -> Result<(), Self::Error> {
        let mut state = self.lock_state();
        state.in_progress.remove(&record.id);
        // The record's group (if any) is free again; wake blocked claimers.
        let _ = self.inner.wake.send_replace(());
        Ok(())
    }

    async fn scheduled_jobs(&self) -> Result<Vec<JobRecord>, Self::Error> {
        let state = self.lock_state();
        let mut records: Vec<JobRecord> = state.scheduled.values().cloned().collect();
        records.sort_by_key(|record| (record.perform_at, record.created_at));
        Ok(records)
    }

    async fn in_progress_jobs(&self) -> Result<Vec<JobRecord>, Self::Error> {
        let state = self.lock_state();
        let mut records: Vec<JobRecord> = state.in_progress.values().cloned().collect();
        records.sort_by_key(|record| (record.perform_at, record.created_at));
        Ok(records)
    }
}
