//! Job records and scheduling options.
//!
//! A [`JobRecord`] is the unit of scheduled work as storage sees it: an opaque
//! handler key, a JSON payload, and the bookkeeping that drives claiming.
//! Caller-facing knobs live in [`ScheduleOptions`]; `started_at`/`started_by`
//! are populated by storage when a record is claimed, never by callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fresh deduplication name: a time-ordered UUID in simple form.
pub fn new_job_name() -> String {
    Uuid::now_v7().simple().to_string()
}

/// Caller-chosen knobs for how a job is queued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleOptions {
    /// Deduplication key. At most one *unstarted* record may exist per name;
    /// scheduling again with the same name replaces the unstarted record.
    /// Defaults to a fresh unique value.
    pub name: String,
    /// Optional sequencing key. At most one record per group may be in
    /// progress at any time.
    pub group: Option<String>,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self {
            name: new_job_name(),
            group: None,
        }
    }
}

impl ScheduleOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: None,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

/// A unit of scheduled work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    /// Registry key of the handler to invoke.
    pub job_type: String,
    /// JSON-encoded handler parameters.
    pub parameters: serde_json::Value,
    /// Informational: the Rust type the parameters decode into.
    pub parameters_type: String,
    /// Normalized CRON expression for recurring jobs.
    pub cron_expression: Option<String>,
    pub options: ScheduleOptions,
    /// UTC instant before which the record is ineligible for claiming.
    pub perform_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// Set by storage when the record is claimed.
    pub started_at: Option<DateTime<Utc>>,
    /// Claiming instance id. Populated by the SQL backend only.
    pub started_by: Option<String>,
}

impl JobRecord {
    pub fn new(
        job_type: impl Into<String>,
        parameters_type: impl Into<String>,
        parameters: serde_json::Value,
        options: ScheduleOptions,
        perform_at: DateTime<Utc>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_type: job_type.into(),
            parameters,
            parameters_type: parameters_type.into(),
            cron_expression: None,
            options,
            perform_at,
            created_at,
            started_at: None,
            started_by: None,
        }
    }

    pub fn with_cron(mut self, expression: impl Into<String>) -> Self {
        self.cron_expression = Some(expression.into());
        self
    }

    /// Fresh record for the next occurrence of a recurring job: same handler,
    /// parameters, name and group, new identity and perform time.
    pub fn rearmed(&self, perform_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_type: self.job_type.clone(),
            parameters: self.parameters.clone(),
            parameters_type: self.parameters_type.clone(),
            cron_expression: self.cron_expression.clone(),
            options: self.options.clone(),
            perform_at,
            created_at: now,
            started_at: None,
            started_by: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_get_unique_names() {
        let a = ScheduleOptions::default();
        let b = ScheduleOptions::default();
        assert_ne!(a.name, b.name);
        assert_eq!(a.group, None);
    }

    #[test]
    fn rearmed_record_keeps_identity_fields_but_not_claim_state() {
        let now = Utc::now();
        let mut record = JobRecord::new(
            "send-report",
            "ReportParameters",
            serde_json::json!({"week": 12}),
            ScheduleOptions::named("weekly-report").with_group("reports"),
            now,
            now,
        )
        .with_cron("0 0 12 * * *");
        record.started_at = Some(now);
        record.started_by = Some("instance-a".into());

        let next_at = now + chrono::Duration::days(1);
        let rearmed = record.rearmed(next_at, now);

        assert_ne!(rearmed.id, record.id);
        assert_eq!(rearmed.job_type, record.job_type);
        assert_eq!(rearmed.parameters, record.parameters);
        assert_eq!(rearmed.options, record.options);
        assert_eq!(rearmed.cron_expression, record.cron_expression);
        assert_eq!(rearmed.perform_at, next_at);
        assert_eq!(rearmed.started_at, None);
        assert_eq!(rearmed.started_by, None);
    }
}
