//! Six-field cron (seconds precision) plus `@hourly`/`@daily`-style
//! descriptors, matching `cron.NewParser(Second|Minute|Hour|Dom|Month|Dow|
//! Descriptor)` in the original implementation. The `cron` crate itself only
//! parses standard field syntax, so descriptors are expanded by hand before
//! reaching it; `@every <duration>` isn't expressible as a field expression
//! at all and is handled as a plain fixed-interval schedule instead.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

/// Standard descriptors supported by `robfix/cron`'s `Descriptor` option,
/// expanded to their six-field (seconds-precision) equivalent.
fn expand_descriptor(expr: &str) -> Option<&'static str> {
    match expr {
        "@yearly" | "@annually" => Some("0 0 0 1 1 *"),
        "@monthly" => Some("0 0 0 1 * *"),
        "@weekly" => Some("0 0 0 * * 0"),
        "@daily" | "@midnight" => Some("0 0 0 * * *"),
        "@hourly" => Some("0 0 * * * *"),
        _ => None,
    }
}

/// Returns the next fire time strictly after `after`, or `Err` for a
/// malformed expression.
pub fn next_fire_time(
    expr: &str,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, String> {
    let expr = expr.trim();

    if let Some(interval) = expr.strip_prefix("@every ") {
        let duration = humantime::parse_duration(interval.trim())
            .map_err(|e| format!("invalid @every interval {interval:?}: {e}"))?;
        let chrono_duration = chrono::Duration::from_std(duration)
            .map_err(|e| format!("@every interval out of range: {e}"))?;
        return Ok(Some(after + chrono_duration));
    }

    let expanded = expand_descriptor(expr).unwrap_or(expr);
    let schedule = Schedule::from_str(expanded).map_err(|e| format!("invalid cron expression: {e}"))?;
    Ok(schedule.after(&after).next())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn every_second_fires_within_a_second() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let next = next_fire_time("* * * * * *", now).unwrap().unwrap();
        assert!(next > now);
        assert!((next - now).num_seconds() <= 1);
    }

    #[test]
    fn invalid_expression_is_rejected() {
        assert!(next_fire_time("not a cron expr", Utc::now()).is_err());
    }

    #[test]
    fn hourly_descriptor_fires_on_the_hour() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 30, 0).unwrap();
        let next = next_fire_time("@hourly", now).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 1, 1, 0, 0).unwrap());
    }

    #[test]
    fn daily_descriptor_fires_at_midnight() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let next = next_fire_time("@daily", now).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap());
    }

    #[test]
    fn every_descriptor_adds_a_fixed_interval() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let next = next_fire_time("@every 90s", now).unwrap().unwrap();
        assert_eq!(next, now + chrono::Duration::seconds(90));
    }

    #[test]
    fn invalid_every_interval_is_rejected() {
        assert!(next_fire_time("@every not-a-duration", Utc::now()).is_err());
    }
}
