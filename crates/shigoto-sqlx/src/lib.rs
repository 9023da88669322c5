//! PostgreSQL backend for shigoto.
//!
//! [`PgJobStorage`] implements the storage contract on a shared `jobs` table;
//! [`PgInstanceRegistry`] keeps per-process liveness rows so crashed
//! instances' claims can be recovered. Several applications can share one
//! database: records are scoped by `application_name`.

pub use shigoto_core;
pub use sqlx::PgPool;

pub mod error;
pub mod instance;
pub mod storage;

pub use error::{Error, ErrorKind};
pub use instance::{InstanceRecord, PgInstanceRegistry};
pub use storage::PgJobStorage;

const NOTIFY_CHANNEL_NAME: &str = "shigoto_jobs_updated";

/// Embedded schema migrations. Apply with [`run_migrations`] or through an
/// external `sqlx migrate` invocation against this crate's `migrations/`.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

pub async fn run_migrations(pool: &PgPool) -> Result<(), Error> {
    MIGRATOR.run(pool).await?;
    Ok(())
}

/// Connection-independent settings shared by storage and registry.
#[derive(Debug, Clone)]
pub struct PgStorageConfig {
    /// Scopes all rows; applications sharing a database do not see each
    /// other's jobs.
    pub application_name: String,
    /// Identifies this process in `job_instances` and in `started_by`.
    pub instance_id: String,
    pub heartbeat_interval: std::time::Duration,
    /// How long without a heartbeat before an instance's claims are released.
    pub stale_after: std::time::Duration,
}

impl Default for PgStorageConfig {
    fn default() -> Self {
        Self {
            application_name: "shigoto".to_string(),
            instance_id: default_instance_id(),
            heartbeat_interval: std::time::Duration::from_secs(60),
            stale_after: std::time::Duration::from_secs(300),
        }
    }
}

impl PgStorageConfig {
    pub fn new(application_name: impl Into<String>) -> Self {
        Self {
            application_name: application_name.into(),
            ..Default::default()
        }
    }

    pub fn instance_id(self, instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            ..self
        }
    }

    pub fn heartbeat_interval(self, heartbeat_interval: std::time::Duration) -> Self {
        Self {
            heartbeat_interval,
            ..self
        }
    }

    pub fn stale_after(self, stale_after: std::time::Duration) -> Self {
        Self { stale_after, ..self }
    }
}

/// Host name plus a unique suffix, so restarts and replicas never collide.
fn default_instance_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string());
    format!("{host}/{}", uuid::Uuid::now_v7().simple())
}
