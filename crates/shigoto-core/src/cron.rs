//! CRON expression helpers.
//!
//! Parsing itself is delegated to the `cron` crate; this module only
//! normalizes expressions and computes occurrences. The `cron` crate expects a
//! seconds field, so standard 5-field expressions are widened by prepending
//! `0` before parsing. The normalized text is also what gets persisted, which
//! keeps derived job names stable across equivalent spellings.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

#[derive(Debug, thiserror::Error)]
pub enum CronError {
    #[error("cron expression {expr:?} must have 5, 6 or 7 fields")]
    FieldCount { expr: String },
    #[error("invalid cron expression {expr:?}: {source}")]
    Parse {
        expr: String,
        #[source]
        source: cron::error::Error,
    },
    #[error("cron expression {expr:?} has no upcoming occurrence")]
    Exhausted { expr: String },
}

/// Normalize `expr` to the seconds-included form understood by [`Schedule`].
///
/// Whitespace is collapsed and a 5-field expression gains a leading `0`
/// seconds field. The result is validated by parsing it.
pub fn normalize(expr: &str) -> Result<String, CronError> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    let normalized = match fields.len() {
        5 => {
            let mut widened = vec!["0"];
            widened.extend(&fields);
            widened.join(" ")
        }
        6 | 7 => fields.join(" "),
        _ => {
            return Err(CronError::FieldCount {
                expr: expr.to_string(),
            });
        }
    };

    Schedule::from_str(&normalized).map_err(|source| CronError::Parse {
        expr: expr.to_string(),
        source,
    })?;

    Ok(normalized)
}

/// First occurrence of `expr` strictly after `after`.
pub fn next_occurrence(expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, CronError> {
    let normalized = normalize(expr)?;
    let schedule = Schedule::from_str(&normalized).map_err(|source| CronError::Parse {
        expr: expr.to_string(),
        source,
    })?;

    schedule
        .after(&after)
        .next()
        .ok_or_else(|| CronError::Exhausted {
            expr: expr.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn widens_five_field_expressions() {
        assert_eq!(normalize("* * * * *").unwrap(), "0 * * * * *");
        assert_eq!(normalize("  */5  *  * * *  ").unwrap(), "0 */5 * * * *");
    }

    #[test]
    fn keeps_six_and_seven_field_expressions() {
        assert_eq!(normalize("30 0 12 * * *").unwrap(), "30 0 12 * * *");
        assert_eq!(normalize("0 0 0 1 1 * 2099").unwrap(), "0 0 0 1 1 * 2099");
    }

    #[test]
    fn rejects_wrong_field_counts() {
        assert!(matches!(
            normalize("* * *"),
            Err(CronError::FieldCount { .. })
        ));
        assert!(matches!(normalize(""), Err(CronError::FieldCount { .. })));
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            normalize("not a cron expr at all"),
            Err(CronError::Parse { .. })
        ));
    }

    #[test]
    fn next_occurrence_is_strictly_after() {
        let from = Utc.with_ymd_and_hms(2025, 6, 1, 11, 59, 59).unwrap();
        let next = next_occurrence("0 12 * * *", from).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap());

        // Exactly on the boundary: the following day wins.
        let at_noon = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let next = next_occurrence("0 12 * * *", at_noon).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap());
    }
}
