//! Skew-safe timestamp parsing.
//!
//! BMC clocks drift, and a controller fresh out of reset reports times from
//! 1970. A sample timestamp implausibly far from wall clock would wreck
//! downstream retention, so it is replaced by wall clock; the warning for a
//! given source is throttled to once per day because a skewed BMC emits
//! thousands of samples an hour.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::warn;

const SKEW_WARN_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Milliseconds since epoch, now.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Parse an ISO-8601 timestamp to epoch milliseconds. Accepts an explicit
/// offset or a bare timestamp (treated as UTC, which is what BMCs emit).
pub fn parse_iso_millis(raw: &str) -> Option<i64> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.timestamp_millis());
    }
    // Bare form without offset, with or without fractional seconds.
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc().timestamp_millis());
    }
    None
}

/// Per-lane skew guard: parses timestamps and substitutes wall clock for
/// unparseable or implausible values, throttling the skew warning per
/// source.
#[derive(Debug)]
pub struct SkewGuard {
    limit_millis: i64,
    last_warned: HashMap<IpAddr, Instant>,
}

impl SkewGuard {
    pub fn new(limit: Duration) -> Self {
        Self {
            limit_millis: limit.as_millis().min(i64::MAX as u128) as i64,
            last_warned: HashMap::new(),
        }
    }

    /// Parse `raw` from `source`; returns epoch milliseconds, substituting
    /// wall clock on parse failure or skew beyond the limit.
    pub fn parse_or_now(&mut self, raw: Option<&str>, source: IpAddr) -> i64 {
        let now = now_millis();
        let Some(raw) = raw else {
            return now;
        };
        let Some(parsed) = parse_iso_millis(raw) else {
            warn!(%source, raw, "unparseable event timestamp; substituting wall clock");
            return now;
        };

        if (parsed - now).abs() > self.limit_millis {
            if self.should_warn(source) {
                warn!(
                    %source,
                    parsed_ms = parsed,
                    now_ms = now,
                    limit_ms = self.limit_millis,
                    "event timestamp beyond clock-skew limit; substituting wall clock \
                     (warning throttled per source)"
                );
            }
            return now;
        }
        parsed
    }

    fn should_warn(&mut self, source: IpAddr) -> bool {
        let now = Instant::now();
        match self.last_warned.get(&source) {
            Some(last) if now.duration_since(*last) < SKEW_WARN_INTERVAL => false,
            _ => {
                self.last_warned.insert(source, now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> IpAddr {
        "10.1.2.3".parse().unwrap()
    }

    #[test]
    fn test_parse_rfc3339() {
        assert_eq!(
            parse_iso_millis("2024-01-01T00:00:00Z"),
            Some(1704067200000)
        );
        assert_eq!(
            parse_iso_millis("2024-01-01T01:00:00+01:00"),
            Some(1704067200000)
        );
    }

    #[test]
    fn test_parse_bare_timestamp_as_utc() {
        assert_eq!(
            parse_iso_millis("2024-01-01T00:00:00.250"),
            Some(1704067200250)
        );
    }

    #[test]
    fn test_parse_garbage() {
        assert_eq!(parse_iso_millis("not-a-time"), None);
        assert_eq!(parse_iso_millis(""), None);
    }

    #[test]
    fn test_plausible_timestamp_kept() {
        let mut guard = SkewGuard::new(Duration::from_secs(300));
        let recent = Utc::now().timestamp_millis() - 1_000;
        let raw = DateTime::from_timestamp_millis(recent).unwrap().to_rfc3339();
        assert_eq!(guard.parse_or_now(Some(&raw), source()), recent);
    }

    #[test]
    fn test_skewed_timestamp_replaced() {
        let mut guard = SkewGuard::new(Duration::from_secs(300));
        let before = now_millis();
        let got = guard.parse_or_now(Some("1970-01-01T00:00:05Z"), source());
        assert!(got >= before, "epoch timestamp must be replaced by wall clock");
    }

    #[test]
    fn test_missing_and_unparseable_replaced() {
        let mut guard = SkewGuard::new(Duration::from_secs(300));
        let before = now_millis();
        assert!(guard.parse_or_now(None, source()) >= before);
        assert!(guard.parse_or_now(Some("garbage"), source()) >= before);
    }

    #[test]
    fn test_skew_warning_throttled_per_source() {
        let mut guard = SkewGuard::new(Duration::from_secs(300));
        assert!(guard.should_warn(source()));
        assert!(!guard.should_warn(source()));

        let other: IpAddr = "10.9.9.9".parse().unwrap();
        assert!(guard.should_warn(other));
        assert_eq!(guard.last_warned.len(), 2);
    }
}
