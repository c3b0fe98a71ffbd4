//! Next-run computation for the three schedule kinds.

use crate::cron::model::Schedule;
use crate::error::{CoreError, Result};
use chrono::{TimeZone, Utc};
use chrono_tz::Tz;
use std::str::FromStr;

/// Compute the next `nextRunAtMs` for `schedule`.
///
/// `last_ended_at_ms` is used only by the anchor-less `every` case, where
/// the next run is relative to when the previous run finished.
pub fn next_run_ms(
    schedule: &Schedule,
    now_ms: i64,
    last_ended_at_ms: Option<i64>,
) -> Result<i64> {
    match schedule {
        Schedule::At { at_ms } => Ok(*at_ms),

        Schedule::Every { every_ms, anchor_ms } => {
            if *every_ms <= 0 {
                return Err(CoreError::InvalidRequest {
                    message: "every schedule requires everyMs > 0".into(),
                });
            }
            let next = match anchor_ms {
                Some(anchor) => {
                    let elapsed = (now_ms - anchor).max(0);
                    let periods = (elapsed + every_ms - 1) / every_ms;
                    anchor + periods * every_ms
                }
                None => last_ended_at_ms.unwrap_or(now_ms) + every_ms,
            };
            Ok(next)
        }

        Schedule::Cron { expr, tz } => {
            let normalized = normalize_cron_expr(expr);
            let parsed = cron::Schedule::from_str(&normalized).map_err(|e| CoreError::InvalidRequest {
                message: format!("invalid cron expression {expr:?}: {e}"),
            })?;
            let zone: Tz = tz
                .as_deref()
                .unwrap_or("UTC")
                .parse()
                .map_err(|_| CoreError::InvalidRequest {
                    message: format!("unknown timezone {tz:?}"),
                })?;

            let floored_ms = now_ms - now_ms.rem_euclid(1000);
            let floored_utc = Utc
                .timestamp_millis_opt(floored_ms)
                .single()
                .ok_or_else(|| CoreError::Internal {
                    message: "out-of-range timestamp".into(),
                })?;
            let floored_local = floored_utc.with_timezone(&zone);

            let next = parsed
                .after(&floored_local)
                .next()
                .ok_or_else(|| CoreError::Internal {
                    message: "cron expression produced no future occurrence".into(),
                })?;
            Ok(next.with_timezone(&Utc).timestamp_millis())
        }
    }
}

/// `cron`'s parser requires a leading seconds field (6 or 7 fields); the
/// standard unix-cron format this schedule kind documents has 5. Prepend
/// `"0 "` when given exactly 5 fields so both forms are accepted.
fn normalize_cron_expr(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_schedule_returns_fixed_time() {
        let schedule = Schedule::At { at_ms: 12_345 };
        assert_eq!(next_run_ms(&schedule, 0, None).unwrap(), 12_345);
    }

    #[test]
    fn every_without_anchor_is_relative_to_last_ended() {
        let schedule = Schedule::Every {
            every_ms: 5_000,
            anchor_ms: None,
        };
        assert_eq!(next_run_ms(&schedule, 1_000, Some(2_000)).unwrap(), 7_000);
        // No prior run: relative to now.
        assert_eq!(next_run_ms(&schedule, 1_000, None).unwrap(), 6_000);
    }

    #[test]
    fn every_with_anchor_snaps_to_grid() {
        let schedule = Schedule::Every {
            every_ms: 10_000,
            anchor_ms: Some(0),
        };
        // now is mid-period: next grid point strictly covering it.
        assert_eq!(next_run_ms(&schedule, 15_000, None).unwrap(), 20_000);
        // now exactly on a grid point: ceil div still lands on it.
        assert_eq!(next_run_ms(&schedule, 20_000, None).unwrap(), 20_000);
    }

    #[test]
    fn cron_expression_resolves_next_occurrence() {
        // Every minute at second 0.
        let schedule = Schedule::Cron {
            expr: "0 * * * * *".to_string(),
            tz: Some("UTC".to_string()),
        };
        let now_ms = 1_700_000_030_000; // 30s into a minute
        let next = next_run_ms(&schedule, now_ms, None).unwrap();
        assert!(next > now_ms);
        assert_eq!(next % 60_000, 0);
    }

    #[test]
    fn five_field_unix_cron_is_accepted_and_matches_documented_boundary() {
        let schedule = Schedule::Cron {
            expr: "0 9 * * MON-FRI".to_string(),
            tz: Some("America/New_York".to_string()),
        };
        // Friday 2025-01-03, 08:00 America/New_York (13:00 UTC): before that
        // day's 9am run, so the next occurrence is the same day.
        let now = Utc.with_ymd_and_hms(2025, 1, 3, 13, 0, 0).unwrap().timestamp_millis();
        let next = next_run_ms(&schedule, now, None).unwrap();
        let expected = Utc.with_ymd_and_hms(2025, 1, 3, 14, 0, 0).unwrap().timestamp_millis();
        assert_eq!(next, expected);
    }

    #[test]
    fn normalize_cron_expr_prepends_seconds_field_for_five_fields() {
        assert_eq!(normalize_cron_expr("0 9 * * MON-FRI"), "0 0 9 * * MON-FRI");
        assert_eq!(normalize_cron_expr("0 * * * * *"), "0 * * * * *");
    }

    #[test]
    fn invalid_cron_expression_is_rejected() {
        let schedule = Schedule::Cron {
            expr: "not a cron expr".to_string(),
            tz: None,
        };
        assert!(next_run_ms(&schedule, 0, None).is_err());
    }
}
