//! Instance registry and orphan recovery.
//!
//! Every process that claims jobs registers a row in `job_instances` and
//! heartbeats it. When an instance stops heartbeating past the stale window,
//! any surviving instance releases its claims back to the queue; a graceful
//! shutdown does the same for its own claims through
//! [`PgInstanceRegistry::unregister`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use shigoto_core::clock::{Clock, SystemClock};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::storage::notify;
use crate::PgStorageConfig;

/// One row of the instance table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InstanceRecord {
    pub id: String,
    pub application_name: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

/// Registers this process, keeps its heartbeat fresh and recovers claims of
/// instances that stopped heartbeating.
#[derive(Clone)]
pub struct PgInstanceRegistry {
    pool: PgPool,
    config: Arc<PgStorageConfig>,
    clock: Arc<dyn Clock>,
}

impl PgInstanceRegistry {
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

    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    /// Insert or refresh this instance's row.
    pub async fn register(&self) -> Result<(), Error> {
        let now = self.clock.now();
        sqlx::query(
            "INSERT INTO shigoto.job_instances (id, application_name, started_at, last_heartbeat_at) \
             VALUES ($1, $2, $3, $3) \
             ON CONFLICT (id) DO UPDATE SET \
                 application_name = EXCLUDED.application_name, \
                 started_at = EXCLUDED.started_at, \
                 last_heartbeat_at = EXCLUDED.last_heartbeat_at",
        )
        .bind(&self.config.instance_id)
        .bind(&self.config.application_name)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn heartbeat(&self) -> Result<(), Error> {
        let result = sqlx::query(
            "UPDATE shigoto.job_instances SET last_heartbeat_at = $2 WHERE id = $1",
        )
        .bind(&self.config.instance_id)
        .bind(self.clock.now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            // Row lost, likely reaped as stale by a peer after a long pause.
            self.register().await?;
        }
        Ok(())
    }

    /// Release this instance's claims and delete its row.
    pub async fn unregister(&self) -> Result<(), Error> {
        self.release_instance(&self.config.instance_id).await
    }

    /// Release claims held by instances whose heartbeat is older than the
    /// stale window, then drop their rows. Returns the released instance ids.
    pub async fn cleanup_stale(&self) -> Result<Vec<String>, Error> {
        let cutoff = self.clock.now()
            - chrono::Duration::from_std(self.config.stale_after)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));

        let stale: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM shigoto.job_instances \
             WHERE application_name = $1 AND last_heartbeat_at < $2 AND id <> $3",
        )
        .bind(&self.config.application_name)
        .bind(cutoff)
        .bind(&self.config.instance_id)
        .fetch_all(&self.pool)
        .await?;

        for id in &stale {
            tracing::warn!(instance_id = %id, "releasing jobs of stale instance");
            self.release_instance(id).await?;
        }
        Ok(stale)
    }

    /// Put claims held by `instance_id` back into the unstarted queue and
    /// drop its row, atomically. A crash between releasing and deleting would
    /// otherwise leave a claim-less instance row to be reaped again.
    async fn release_instance(&self, instance_id: &str) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;

        // A released claim must become unstarted again, but an unstarted row
        // with the same name may have been scheduled in the meantime and would
        // collide with the unique index. The newer submission wins; the
        // orphaned claim is dropped.
        sqlx::query(
            "DELETE FROM shigoto.jobs AS claimed \
             WHERE claimed.started_by = $1 AND claimed.started_at IS NOT NULL \
               AND EXISTS ( \
                   SELECT 1 FROM shigoto.jobs AS pending \
                   WHERE pending.application_name = claimed.application_name \
                     AND pending.job_name = claimed.job_name \
                     AND pending.started_at IS NULL)",
        )
        .bind(instance_id)
        .execute(&mut *tx)
        .await?;

        let released = sqlx::query(
            "UPDATE shigoto.jobs SET started_at = NULL, started_by = NULL \
             WHERE started_by = $1 AND started_at IS NOT NULL",
        )
        .bind(instance_id)
        .execute(&mut *tx)
        .await?;

        if released.rows_affected() > 0 {
            tracing::info!(
                instance_id = %instance_id,
                released = released.rows_affected(),
                "released claimed jobs back to the queue"
            );
        }
        sqlx::query("DELETE FROM shigoto.job_instances WHERE id = $1")
            .bind(instance_id)
            .execute(&mut *tx)
            .await?;

        notify(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    /// All registered instances of this application.
    pub async fn instances(&self) -> Result<Vec<InstanceRecord>, Error> {
        let rows = sqlx::query_as::<_, InstanceRecord>(
            "SELECT id, application_name, started_at, last_heartbeat_at \
             FROM shigoto.job_instances \
             WHERE application_name = $1 \
             ORDER BY started_at",
        )
        .bind(&self.config.application_name)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Register, then heartbeat and reap stale peers until `cancel` fires,
    /// then unregister. Transient errors are logged and retried on the next
    /// beat.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), Error> {
        self.register().await?;
        let mut beat = tokio::time::interval(self.config.heartbeat_interval.max(
            Duration::from_secs(1),
        ));
        beat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick fires immediately; registration just happened.
        beat.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = beat.tick() => {
                    if let Err(error) = self.heartbeat().await {
                        tracing::error!(error = %error, "failed to heartbeat instance");
                        continue;
                    }
                    if let Err(error) = self.cleanup_stale().await {
                        tracing::error!(error = %error, "failed to clean up stale instances");
                    }
                }
            }
        }

        self.unregister().await
    }
}
