//! Time arguments.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

/// Parses a time argument into epoch seconds.
///
/// Accepts `now`, integer epoch seconds, RFC 3339 timestamps, naive local
/// date-times (`YYYY-MM-DDTHH:MM[:SS]`) and dates (local midnight).
pub fn parse_time(s: &str) -> Result<i64> {
    parse_time_at(s, Utc::now())
}

/// Like [`parse_time`], with `now` resolved to the given instant.
pub fn parse_time_at(s: &str, now: DateTime<Utc>) -> Result<i64> {
    let s = s.trim();

    if s.eq_ignore_ascii_case("now") {
        return Ok(now.timestamp());
    }

    if let Ok(epoch) = s.parse::<i64>() {
        return Ok(epoch);
    }

    if let Ok(time) = DateTime::parse_from_rfc3339(s) {
        return Ok(time.timestamp());
    }

    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return local_timestamp(&naive, s);
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return local_timestamp(&date.and_time(NaiveTime::MIN), s);
    }

    bail!(
        "invalid time {:?}: expected ISO-8601, epoch seconds or \"now\"",
        s
    )
}

fn local_timestamp(naive: &NaiveDateTime, input: &str) -> Result<i64> {
    Local
        .from_local_datetime(naive)
        .earliest()
        .map(|t| t.timestamp())
        .with_context(|| format!("time {:?} does not exist in the local time zone", input))
}
