//! PostgreSQL storage backend.
//!
//! Claiming relies on `FOR UPDATE SKIP LOCKED`, so any number of processes can
//! share one table without handing the same record to two of them. Waiting
//! combines `LISTEN`/`NOTIFY` with a timer for the earliest future record:
//! every schedule and finalize sends a notify, so waiters only sleep blind for
//! records that are not yet due.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use shigoto_core::clock::{Clock, SystemClock};
use shigoto_core::record::{JobRecord, ScheduleOptions};
use shigoto_core::storage::JobStorage;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Error;
use crate::{NOTIFY_CHANNEL_NAME, PgStorageConfig};

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    job_name: String,
    job_type: String,
    parameters_type: String,
    parameters: serde_json::Value,
    cron_expression: Option<String>,
    group_name: Option<String>,
    perform_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    started_by: Option<String>,
}

impl From<JobRow> for JobRecord {
    fn from(row: JobRow) -> Self {
        JobRecord {
            id: row.id,
            job_type: row.job_type,
            parameters: row.parameters,
            parameters_type: row.parameters_type,
            cron_expression: row.cron_expression,
            options: ScheduleOptions {
                name: row.job_name,
                group: row.group_name,
            },
            perform_at: row.perform_at,
            created_at: row.created_at,
            started_at: row.started_at,
            started_by: row.started_by,
        }
    }
}

const JOB_COLUMNS: &str = "id, job_name, job_type, parameters_type, parameters, \
     cron_expression, group_name, perform_at, created_at, started_at, started_by";

/// Storage backend for fetching and updating jobs in PostgreSQL.
#[derive(Clone)]
pub struct PgJobStorage {
    pool: PgPool,
    config: Arc<PgStorageConfig>,
    clock: Arc<dyn Clock>,
}

impl PgJobStorage {
    pub fn new(pool: PgPool, config: PgStorageConfig) -> Self {
        Self::with_clock(pool, config, Arc::new(SystemClock))
    }

    pub fn with_clock(pool: PgPool, config: PgStorageConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            config: Arc::new(config),
            clock,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn config(&self) -> &PgStorageConfig {
        &self.config
    }

    async fn insert_one<'c, E>(&self, record: &JobRecord, executor: E) -> Result<(), Error>
    where
        E: sqlx::PgExecutor<'c>,
    {
        // The partial unique index keys on (application_name, job_name) for
        // unstarted rows; the upsert replaces everything but created_at, so a
        // re-submitted name keeps its original queue position on ties.
        sqlx::query(
            "INSERT INTO shigoto.jobs (id, application_name, job_name, job_type, \
                 parameters_type, parameters, cron_expression, group_name, \
                 perform_at, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (application_name, job_name) WHERE started_at IS NULL \
             DO UPDATE SET id = EXCLUDED.id, \
                 job_type = EXCLUDED.job_type, \
                 parameters_type = EXCLUDED.parameters_type, \
                 parameters = EXCLUDED.parameters, \
                 cron_expression = EXCLUDED.cron_expression, \
                 group_name = EXCLUDED.group_name, \
                 perform_at = EXCLUDED.perform_at",
        )
        .bind(record.id)
        .bind(&self.config.application_name)
        .bind(&record.options.name)
        .bind(&record.job_type)
        .bind(&record.parameters_type)
        .bind(&record.parameters)
        .bind(&record.cron_expression)
        .bind(&record.options.group)
        .bind(record.perform_at)
        .bind(record.created_at)
        .execute(executor)
        .await?;
        Ok(())
    }

    async fn claim_one(&self, now: DateTime<Utc>) -> Result<Option<JobRecord>, Error> {
        // Grouped claims cannot rely on the NOT EXISTS filter alone: under
        // READ COMMITTED a concurrent claimer's uncommitted UPDATE is
        // invisible to it, and SKIP LOCKED only skips the locked candidate
        // row, not its group-mates. An advisory transaction lock per group
        // serializes the check-and-claim instead; every grouped claim takes
        // it before writing started_at, so after acquiring the lock a fresh
        // statement snapshot shows any competing claim as committed.
        //
        // A group found busy under the lock is remembered and excluded, and
        // the transaction is restarted so at most one advisory lock is held
        // at a time (two claimers each holding one group lock and waiting on
        // the other's would deadlock otherwise).
        let mut blocked_groups: Vec<String> = Vec::new();

        loop {
            let mut tx = self.pool.begin().await?;

            let candidate: Option<(Uuid, Option<String>)> = sqlx::query_as(
                "SELECT candidate.id, candidate.group_name \
                 FROM shigoto.jobs AS candidate \
                 WHERE candidate.application_name = $1 \
                   AND candidate.started_at IS NULL \
                   AND candidate.perform_at <= $2 \
                   AND (candidate.group_name IS NULL OR ( \
                       candidate.group_name <> ALL($3) \
                       AND NOT EXISTS ( \
                           SELECT 1 FROM shigoto.jobs AS running \
                           WHERE running.application_name = candidate.application_name \
                             AND running.group_name = candidate.group_name \
                             AND running.started_at IS NOT NULL))) \
                 ORDER BY candidate.perform_at, candidate.created_at \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED",
            )
            .bind(&self.config.application_name)
            .bind(now)
            .bind(&blocked_groups)
            .fetch_optional(&mut *tx)
            .await?;

            let Some((id, group)) = candidate else {
                tx.rollback().await?;
                return Ok(None);
            };

            if let Some(group) = group {
                sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                    .bind(format!("{}/{group}", self.config.application_name))
                    .execute(&mut *tx)
                    .await?;

                let busy: bool = sqlx::query_scalar(
                    "SELECT EXISTS ( \
                         SELECT 1 FROM shigoto.jobs \
                         WHERE application_name = $1 AND group_name = $2 \
                           AND started_at IS NOT NULL)",
                )
                .bind(&self.config.application_name)
                .bind(&group)
                .fetch_one(&mut *tx)
                .await?;

                if busy {
                    blocked_groups.push(group);
                    tx.rollback().await?;
                    continue;
                }
            }

            let sql = format!(
                "UPDATE shigoto.jobs SET started_at = $2, started_by = $3 \
                 WHERE id = $1 \
                 RETURNING {JOB_COLUMNS}"
            );
            let row = sqlx::query_as::<_, JobRow>(&sql)
                .bind(id)
                .bind(now)
                .bind(&self.config.instance_id)
                .fetch_optional(&mut *tx)
                .await?;
            tx.commit().await?;
            return Ok(row.map(JobRecord::from));
        }
    }

    /// Earliest perform time among unstarted records that are not yet due.
    /// Past-due records blocked on a group are excluded; finalizing the
    /// blocker sends a notify, so no timer is needed for them.
    async fn next_future_perform_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, Error> {
        let next: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT MIN(perform_at) FROM shigoto.jobs \
             WHERE application_name = $1 AND started_at IS NULL AND perform_at > $2",
        )
        .bind(&self.config.application_name)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(next)
    }

    async fn connect_listener(&self) -> Result<PgListener, Error> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(NOTIFY_CHANNEL_NAME).await?;
        Ok(listener)
    }

    async fn snapshot(&self, started: bool) -> Result<Vec<JobRecord>, Error> {
        let clause = if started { "IS NOT NULL" } else { "IS NULL" };
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM shigoto.jobs \
             WHERE application_name = $1 AND started_at {clause} \
             ORDER BY perform_at, created_at"
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(&self.config.application_name)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(JobRecord::from).collect())
    }
}

pub(crate) async fn notify<'c, E>(executor: E) -> Result<(), sqlx::Error>
where
    E: sqlx::PgExecutor<'c>,
{
    sqlx::query("SELECT pg_notify($1, '')")
        .bind(NOTIFY_CHANNEL_NAME)
        .execute(executor)
        .await?;
    Ok(())
}

impl JobStorage for PgJobStorage {
    type Error = Error;

    async fn schedule_one(&self, record: JobRecord) -> Result<(), Self::Error> {
        let mut tx = self.pool.begin().await?;
        self.insert_one(&record, &mut *tx).await?;
        notify(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn schedule_many(&self, records: Vec<JobRecord>) -> Result<(), Self::Error> {
        let mut tx = self.pool.begin().await?;
        for record in &records {
            self.insert_one(record, &mut *tx).await?;
        }
        notify(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn wait_for_next_job(
        &self,
        cancel: &CancellationToken,
        max_wait: Option<Duration>,
    ) -> Result<Option<JobRecord>, Self::Error> {
        let deadline = max_wait.map(|wait| tokio::time::Instant::now() + wait);

        // Fast path: under load something is usually claimable right away,
        // and the listener connection is never needed.
        if cancel.is_cancelled() {
            return Ok(None);
        }
        if let Some(record) = self.claim_one(self.clock.now()).await? {
            return Ok(Some(record));
        }

        // The loop re-claims right after LISTEN becomes active, so a notify
        // sent between the claim above and the subscription is not missed.
        let mut listener = self.connect_listener().await?;

        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }

            let now = self.clock.now();
            if let Some(record) = self.claim_one(now).await? {
                return Ok(Some(record));
            }

            let until_next = self
                .next_future_perform_at(now)
                .await?
                .and_then(|at| (at - now).to_std().ok());
            let until_deadline =
                deadline.map(|at| at.saturating_duration_since(tokio::time::Instant::now()));
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
                notification = listener.recv() => {
                    if let Err(error) = notification {
                        tracing::warn!(
                            error = %error,
                            "notification stream interrupted, reconnecting"
                        );
                        listener = self.connect_listener().await?;
                    }
                }
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
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM shigoto.jobs WHERE id = $1")
            .bind(record.id)
            .execute(&mut *tx)
            .await?;
        // Group-mates may have been waiting on this record.
        notify(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn scheduled_jobs(&self) -> Result<Vec<JobRecord>, Self::Error> {
        self.snapshot(false).await
    }

    async fn in_progress_jobs(&self) -> Result<Vec<JobRecord>, Self::Error> {
        self.snapshot(true).await
    }
}
