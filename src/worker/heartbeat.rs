use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};

/// Decides whether the heartbeat a worker reported to the control plane is
/// too old. A worker with a stale heartbeat is assumed frozen.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatCheck {
    timeout: Duration,
}

impl HeartbeatCheck {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Age of the heartbeat at `now`, if it can be parsed.
    pub fn age(heartbeat_date: &str, now: DateTime<Utc>) -> Option<chrono::Duration> {
        parse_heartbeat(heartbeat_date).map(|at| now - at)
    }

    /// True when the heartbeat is older than the timeout.
    ///
    /// A missing or unparseable heartbeat is not stale: the worker may not
    /// have reported yet.
    pub fn is_stale(&self, heartbeat_date: Option<&str>, now: DateTime<Utc>) -> bool {
        let Some(raw) = heartbeat_date else {
            return false;
        };
        match Self::age(raw, now) {
            Some(age) => age.to_std().map(|age| age > self.timeout).unwrap_or(false),
            None => {
                tracing::warn!(heartbeat_date = raw, "Unparseable heartbeat date");
                false
            }
        }
    }
}

/// Accepts RFC 3339 and naive ISO 8601 timestamps; naive ones are UTC.
pub fn parse_heartbeat(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn parses_rfc3339_and_naive_dates() {
        let expected = Utc.with_ymd_and_hms(2026, 3, 1, 11, 59, 30).unwrap();
        assert_eq!(parse_heartbeat("2026-03-01T11:59:30Z"), Some(expected));
        assert_eq!(parse_heartbeat("2026-03-01T12:59:30+01:00"), Some(expected));
        assert_eq!(parse_heartbeat("2026-03-01T11:59:30"), Some(expected));
        assert_eq!(parse_heartbeat("2026-03-01T11:59:30.250").map(|d| d.timestamp()), Some(expected.timestamp()));
        assert_eq!(parse_heartbeat("2026-03-01 11:59:30"), Some(expected));
        assert!(parse_heartbeat("yesterday").is_none());
    }

    #[test]
    fn heartbeat_older_than_timeout_is_stale() {
        let check = HeartbeatCheck::new(Duration::from_secs(60));
        assert!(!check.is_stale(Some("2026-03-01T11:59:30Z"), now()));
        assert!(!check.is_stale(Some("2026-03-01T11:59:00Z"), now()));
        assert!(check.is_stale(Some("2026-03-01T11:58:59Z"), now()));
    }

    #[test]
    fn missing_or_garbled_heartbeat_is_not_stale() {
        let check = HeartbeatCheck::new(Duration::from_secs(60));
        assert!(!check.is_stale(None, now()));
        assert!(!check.is_stale(Some("not a date"), now()));
    }

    #[test]
    fn heartbeat_from_the_future_is_not_stale() {
        let check = HeartbeatCheck::new(Duration::from_secs(60));
        assert!(!check.is_stale(Some("2026-03-01T12:05:00Z"), now()));
    }
}
