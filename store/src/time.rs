//! Timestamp encoding for TEXT columns.
//!
//! Fixed-width RFC 3339 (UTC, microseconds) so that lexicographic order on
//! the column equals chronological order.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::{StoreError, StoreResult};

#[must_use]
pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(
    table: &'static str,
    column: &'static str,
    value: &str,
) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StoreError::corrupt(table, column, value))
}

pub(crate) fn parse_opt_ts(
    table: &'static str,
    column: &'static str,
    value: Option<String>,
) -> StoreResult<Option<DateTime<Utc>>> {
    value.map(|v| parse_ts(table, column, &v)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let now = Utc::now();
        let parsed = parse_ts("t", "c", &fmt_ts(now)).unwrap();
        assert!((now - parsed).num_microseconds().unwrap().abs() < 1);
    }

    #[test]
    fn test_lexicographic_equals_chronological() {
        let early = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let late = DateTime::parse_from_rfc3339("2026-01-01T00:00:00.000001Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(fmt_ts(early) < fmt_ts(late));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_ts("t", "c", "yesterday").is_err());
    }
}
